use anyhow::{Context, Result};
use edit_core::{HyperParams, Model};
use std::collections::BTreeMap;

/// Tracked-group key to normalized L2 distance from the reference.
pub type DistanceReport = BTreeMap<String, f64>;

/// Measures how far tracked parameter groups have moved from the reference.
#[derive(Clone, Debug)]
pub struct DriftTracker {
    groups: Vec<(String, String)>,
}

impl DriftTracker {
    pub fn new(hparams: &HyperParams) -> Self {
        DriftTracker {
            groups: hparams.tracked_parameters(),
        }
    }

    pub fn groups(&self) -> &[(String, String)] {
        &self.groups
    }

    /// `||reference - live|| / numel` per group, with the live value realized
    /// on the reference's device. Nothing is cached between calls.
    pub fn measure(&self, reference: &dyn Model, live: &dyn Model) -> Result<DistanceReport> {
        let mut report = DistanceReport::new();
        for (key, param) in self.groups.iter() {
            let original = reference
                .parameter(param)
                .with_context(|| format!("reference model lacks tracked group {}", key))?;
            let current = live.parameter(param)?.to_device(original.device());
            let numel = original.numel().max(1) as f64;
            report.insert(key.clone(), original.distance(param, &current)? / numel);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edit_core::{Device, ParamStore, Tensor};
    use serde_json::json;

    fn hparams() -> HyperParams {
        serde_json::from_value(json!({"layers": [0, "lm_head.weight"]})).expect("hparams")
    }

    fn model() -> ParamStore {
        let mut store = ParamStore::new("tiny");
        store.insert(
            "transformer.h.0.mlp.c_proj.weight".to_string(),
            Tensor::zeros(&[2, 2]),
        );
        store.insert("lm_head.weight".to_string(), Tensor::zeros(&[4]));
        store
    }

    #[test]
    fn distance_is_normalized_by_element_count() {
        let reference = model().snapshot(Device::Offload).expect("snapshot");
        let mut live = model();
        live.parameter_mut("transformer.h.0.mlp.c_proj.weight")
            .expect("p")
            .data
            .copy_from_slice(&[3.0, 4.0, 0.0, 0.0]);
        let report = DriftTracker::new(&hparams())
            .measure(&reference, &live)
            .expect("measure");
        assert!((report["0"] - 5.0 / 4.0).abs() < 1e-12);
        assert_eq!(report["lm_head.weight"], 0.0);
    }

    #[test]
    fn missing_group_is_an_error() {
        let reference = model();
        let mut live = ParamStore::new("other");
        live.insert("lm_head.weight".to_string(), Tensor::zeros(&[4]));
        assert!(DriftTracker::new(&hparams()).measure(&reference, &live).is_err());
    }
}
