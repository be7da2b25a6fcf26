//! Shared building blocks for the edit runner: tensors and the parameter
//! store, dataset records, hyperparameters, and artifact file helpers.

mod error;
mod fs;
pub mod hparams;
pub mod model;
pub mod record;
pub mod tensor;

pub use error::{CoreError, CoreResult};
pub use fs::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir, read_json,
    read_structured, sha256_bytes, write_json_once,
};
pub use hparams::{HyperParams, LayerRef};
pub use model::{Model, ParamStore};
pub use record::{load_dataset, rewrite_subject, rewrite_target, DatasetKind, EditRequest};
pub use tensor::{Device, Tensor};
