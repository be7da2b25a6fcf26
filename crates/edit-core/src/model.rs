use crate::error::{CoreError, CoreResult};
use crate::fs::{atomic_write_json_pretty, read_json};
use crate::tensor::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Named parameter access into a model runtime.
pub trait Model {
    fn name(&self) -> &str;
    fn parameter(&self, name: &str) -> CoreResult<&Tensor>;
    fn parameter_mut(&mut self, name: &str) -> CoreResult<&mut Tensor>;
    fn parameter_names(&self) -> Vec<String>;

    /// Full copy of every parameter placed on `device`.
    fn snapshot(&self, device: Device) -> CoreResult<ParamStore> {
        let mut store = ParamStore::new(self.name());
        for name in self.parameter_names() {
            let tensor = self.parameter(&name)?.to_device(device);
            store.insert(name, tensor);
        }
        Ok(store)
    }
}

/// In-memory parameter store, also the on-disk model format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamStore {
    name: String,
    parameters: BTreeMap<String, Tensor>,
}

impl ParamStore {
    pub fn new(name: &str) -> Self {
        ParamStore {
            name: name.to_string(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: String, tensor: Tensor) -> Option<Tensor> {
        self.parameters.insert(name, tensor)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let store: ParamStore = read_json(path)?;
        for (name, tensor) in store.parameters.iter() {
            let expected: usize = tensor.shape.iter().product();
            if expected != tensor.numel() {
                return Err(CoreError::InvalidRecord {
                    path: path.to_path_buf(),
                    reason: format!(
                        "parameter {} has shape {:?} but {} values",
                        name,
                        tensor.shape,
                        tensor.numel()
                    ),
                });
            }
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> CoreResult<()> {
        atomic_write_json_pretty(path, self)
    }
}

impl Model for ParamStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameter(&self, name: &str) -> CoreResult<&Tensor> {
        self.parameters
            .get(name)
            .ok_or_else(|| CoreError::MissingParameter(name.to_string()))
    }

    fn parameter_mut(&mut self, name: &str) -> CoreResult<&mut Tensor> {
        self.parameters
            .get_mut(name)
            .ok_or_else(|| CoreError::MissingParameter(name.to_string()))
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }
}
