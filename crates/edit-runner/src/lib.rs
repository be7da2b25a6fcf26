//! Orchestrates long sequences of in-place model edits: selection, batching,
//! resumable run state, drift tracking, periodic downstream evaluation and
//! sequential/isolated mode handling.

pub mod analysis;
pub mod chunker;
pub mod config;
pub mod drift;
pub mod editor;
pub mod evaluate;
pub mod ledger;
pub mod mode;
pub mod run_state;
pub mod scheduler;
pub mod selection;
pub mod session;

use anyhow::{Context, Result};
use edit_core::{load_dataset, ParamStore};
use std::path::PathBuf;
use tracing::info;

pub use config::{Globals, RunConfig};
pub use editor::{ApplyOptions, Editor, RankOneEditor, WeightsCopy};
pub use evaluate::{
    CommandEvaluator, DownstreamEvaluator, KeyResponseEvaluator, NullEvaluator, RewriteEvaluator,
};
pub use mode::Mode;
pub use selection::SelectionMask;
pub use session::{Collaborators, EditSession, RunReport};

/// Input files for a run; `None` falls back to the dataset's default under
/// the data directory.
#[derive(Clone, Debug, Default)]
pub struct RunInputs {
    pub model_path: Option<PathBuf>,
    pub dataset_path: Option<PathBuf>,
    pub selection_path: Option<PathBuf>,
}

impl RunInputs {
    pub fn model_path(&self, config: &RunConfig, globals: &Globals) -> PathBuf {
        self.model_path.clone().unwrap_or_else(|| {
            globals
                .data_dir
                .join("models")
                .join(format!("{}.json", config.model_name.replace('/', "_")))
        })
    }

    pub fn dataset_path(&self, config: &RunConfig, globals: &Globals) -> PathBuf {
        self.dataset_path
            .clone()
            .unwrap_or_else(|| globals.data_dir.join(config.ds_name.default_file()))
    }

    pub fn selection_path(&self, config: &RunConfig, globals: &Globals) -> PathBuf {
        self.selection_path
            .clone()
            .unwrap_or_else(|| globals.data_dir.join(config.ds_name.default_selection_file()))
    }
}

/// Runs an edit sequence over a model file with the reference rewrite evaluator.
pub fn run_editing(
    config: &RunConfig,
    globals: &Globals,
    inputs: &RunInputs,
    editor: &dyn Editor,
    downstream: &mut dyn DownstreamEvaluator,
) -> Result<RunReport> {
    config.validate()?;
    let dataset_path = inputs.dataset_path(config, globals);
    let selection_path = inputs.selection_path(config, globals);
    let model_path = inputs.model_path(config, globals);

    let mask = SelectionMask::load(&selection_path)?;
    let dataset = load_dataset(&dataset_path, config.dataset_size_limit)
        .with_context(|| format!("failed to load dataset {}", dataset_path.display()))?;
    // an uncovered index aborts before a run directory is allocated
    mask.select(&dataset)?;
    let model = ParamStore::load(&model_path)
        .with_context(|| format!("failed to load model {}", model_path.display()))?;

    let allocator = run_state::RunAllocator::new(&globals.results_dir, &config.dir_name);
    let state = run_state::open_run(
        &allocator,
        config.continue_from_run.as_deref(),
        &config.hparams_path(globals),
        &config.metadata(),
    )?;
    run_state::write_manifest_once(&state, &mask.digest())?;
    info!(
        alg = editor.name(),
        mode = config.mode().as_str(),
        run_id = %state.run_id,
        "executing edit run"
    );

    let scorer = KeyResponseEvaluator::new(&state.hparams);

    let mut session = EditSession::new(config, state, model, config.cache_template(globals))?;
    session.run(
        &dataset,
        &mask,
        Collaborators {
            editor,
            rewrite: &scorer,
            downstream,
        },
    )
}
