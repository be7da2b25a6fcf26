use crate::editor::WeightsCopy;
use anyhow::{Context, Result};
use edit_core::Model;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Whether a batch's edit outlives its measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Edits accumulate and are never restored.
    Sequential,
    /// Each batch is measured and then reverted.
    Isolated,
}

impl Mode {
    pub fn from_sequential_flag(sequential: bool) -> Self {
        if sequential {
            Mode::Sequential
        } else {
            Mode::Isolated
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Sequential => "sequential",
            Mode::Isolated => "isolated",
        }
    }

    pub fn needs_undo(&self) -> bool {
        matches!(self, Mode::Isolated)
    }
}

/// Applies the run's mode once a batch has been measured.
#[derive(Clone, Copy, Debug)]
pub struct ModeController {
    mode: Mode,
}

impl ModeController {
    pub fn new(mode: Mode) -> Self {
        ModeController { mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Keeps the edit or writes the undo record back. Returns the number of
    /// restored groups.
    pub fn settle(&self, model: &mut dyn Model, weights: WeightsCopy) -> Result<usize> {
        match self.mode {
            Mode::Sequential => Ok(0),
            Mode::Isolated => restore_weights(model, &weights),
        }
    }
}

/// Copies every saved tensor into the live parameter of the same name. The
/// value moves from the record's placement onto the parameter's own device.
pub fn restore_weights(model: &mut dyn Model, weights: &WeightsCopy) -> Result<usize> {
    for (name, saved) in weights.weights.iter() {
        let target = model
            .parameter_mut(name)
            .with_context(|| format!("cannot restore {}", name))?;
        target.copy_from(name, saved)?;
    }
    debug!(
        restored = weights.len(),
        placement = weights.placement.as_str(),
        "restored pre-edit weights"
    );
    Ok(weights.len())
}
