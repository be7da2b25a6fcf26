//! Edit application boundary.
//!
//! The orchestrator never looks at how an editor computes its delta. It only
//! relies on two things: parameters are mutated in place, and when asked for
//! them the editor hands back the pre-edit values of everything it touched.

use anyhow::{anyhow, Context, Result};
use edit_core::tensor::seeded_values;
use edit_core::{
    atomic_write_json_pretty, read_json, rewrite_subject, rewrite_target, Device, EditRequest,
    HyperParams, Model, Tensor,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Clone, Debug, Default)]
pub struct ApplyOptions {
    pub return_orig_weights: bool,
    /// Tier the undo record is placed on.
    pub orig_weights_device: Device,
    /// Path template with `{}` slots for layer, clamp factor and case id.
    /// When set, editors load per-case key/value vectors from it and store
    /// the ones they compute.
    pub cache_template: Option<String>,
}

/// Pre-edit values of every parameter an editor overwrote.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightsCopy {
    pub placement: Device,
    pub weights: BTreeMap<String, Tensor>,
}

impl WeightsCopy {
    pub fn new(placement: Device) -> Self {
        WeightsCopy {
            placement,
            weights: BTreeMap::new(),
        }
    }

    /// Records `current` as the pre-edit value of `name` unless already recorded.
    pub fn record(&mut self, name: &str, current: &Tensor) {
        if !self.weights.contains_key(name) {
            self.weights
                .insert(name.to_string(), current.to_device(self.placement));
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// An edit algorithm.
pub trait Editor {
    fn name(&self) -> &str;

    /// Applies `batch` to `model` in place. The returned copy is empty unless
    /// `options.return_orig_weights` is set.
    fn apply(
        &self,
        model: &mut dyn Model,
        batch: &[EditRequest],
        hparams: &HyperParams,
        options: &ApplyOptions,
    ) -> Result<WeightsCopy>;
}

/// Deterministic key/value pair for a rewrite payload on a `[rows, cols]` group.
///
/// The key stands in for the subject representation and the value for the
/// new target; both are hashed so identical requests map identically.
pub fn rewrite_key_value(payload: &Value, rows: usize, cols: usize) -> (Vec<f32>, Vec<f32>) {
    let subject = rewrite_subject(payload).unwrap_or_default();
    let target = rewrite_target(payload).unwrap_or_default();
    let key = seeded_values(&format!("key:{}", subject), cols);
    let value = seeded_values(&format!("value:{}:{}", subject, target), rows);
    (key, value)
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedKeyValue {
    key: Vec<f32>,
    value: Vec<f32>,
}

/// Fills successive `{}` slots of `template`; extra slots stay as they are.
pub fn fill_template(template: &str, parts: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    for part in parts {
        let Some(at) = rest.find("{}") else {
            break;
        };
        out.push_str(&rest[..at]);
        out.push_str(part);
        rest = &rest[at + 2..];
    }
    out.push_str(rest);
    out
}

/// Key/value pair for one layer and case, taken from the cache when a pair
/// of the right size is there and written to it otherwise.
fn cached_key_value(
    template: &str,
    layer: &str,
    clamp: f64,
    payload: &Value,
    rows: usize,
    cols: usize,
) -> Result<(Vec<f32>, Vec<f32>)> {
    let case_id = payload
        .get("case_id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow!("rewrite payload has no case_id"))?;
    let path = PathBuf::from(fill_template(
        template,
        &[layer.to_string(), clamp.to_string(), case_id.to_string()],
    ));
    if path.exists() {
        let cached: CachedKeyValue = read_json(&path)
            .with_context(|| format!("malformed key/value cache {}", path.display()))?;
        if cached.key.len() == cols && cached.value.len() == rows {
            debug!(path = %path.display(), "loaded cached key/value");
            return Ok((cached.key, cached.value));
        }
        warn!(path = %path.display(), "cached key/value has the wrong size; recomputing");
    }
    let (key, value) = rewrite_key_value(payload, rows, cols);
    atomic_write_json_pretty(
        &path,
        &CachedKeyValue {
            key: key.clone(),
            value: value.clone(),
        },
    )?;
    Ok((key, value))
}

/// Synthetic rank-one editor.
///
/// For each request (its rewrite payload with `case_id`) adds `v_lr * v kᵀ / ||k||²` to every tracked group, so that
/// afterwards `W k` moves towards `v`. The update norm is clamped to
/// `clamp_norm_factor * ||W||`.
#[derive(Clone, Debug, Default)]
pub struct RankOneEditor;

impl Editor for RankOneEditor {
    fn name(&self) -> &str {
        "ROME"
    }

    fn apply(
        &self,
        model: &mut dyn Model,
        batch: &[EditRequest],
        hparams: &HyperParams,
        options: &ApplyOptions,
    ) -> Result<WeightsCopy> {
        let lr = hparams.get_f64("v_lr", 0.5) as f32;
        let clamp = hparams.get_f64("clamp_norm_factor", 4.0);
        let mut weights_copy = WeightsCopy::new(options.orig_weights_device);
        let tracked = hparams.tracked_parameters();
        if tracked.is_empty() {
            return Err(anyhow!("hyperparameters list no layers to edit"));
        }
        for payload in batch.iter().map(EditRequest::rewrite_payload) {
            for (layer, param) in tracked.iter() {
                let weight = model.parameter_mut(param)?;
                if options.return_orig_weights {
                    weights_copy.record(param, weight);
                }
                let (rows, cols) = weight.dims2()?;
                let (key, value) = match options.cache_template.as_deref() {
                    Some(template) => {
                        cached_key_value(template, layer, clamp, &payload, rows, cols)?
                    }
                    None => rewrite_key_value(&payload, rows, cols),
                };
                let key_norm = edit_core::tensor::l2_norm(&key);
                if key_norm == 0.0 {
                    continue;
                }
                let mut scale = lr as f64 / (key_norm * key_norm);
                let update_norm = scale * edit_core::tensor::l2_norm(&value) * key_norm;
                let limit = clamp * weight.l2_norm();
                if limit > 0.0 && update_norm > limit {
                    scale *= limit / update_norm;
                }
                weight.add_outer(&value, &key, scale as f32)?;
            }
        }
        Ok(weights_copy)
    }
}
