use crate::error::CoreResult;
use crate::fs::read_structured;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub const DEFAULT_REWRITE_MODULE_TMP: &str = "transformer.h.{}.mlp.c_proj";

/// A tracked parameter group: a layer index or an explicit module name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerRef {
    Index(u64),
    Module(String),
}

impl LayerRef {
    /// Parameter holding this group's weights.
    pub fn parameter_name(&self, rewrite_module_tmp: &str) -> String {
        match self {
            LayerRef::Index(i) => format!("{}.weight", rewrite_module_tmp.replace("{}", &i.to_string())),
            LayerRef::Module(name) => name.clone(),
        }
    }
}

impl fmt::Display for LayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerRef::Index(i) => write!(f, "{}", i),
            LayerRef::Module(name) => f.write_str(name),
        }
    }
}

/// Algorithm tunables. Only the fields the orchestrator reads are typed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    #[serde(default)]
    pub layers: Vec<LayerRef>,
    #[serde(default = "default_rewrite_module_tmp")]
    pub rewrite_module_tmp: String,
    #[serde(flatten)]
    pub tunables: BTreeMap<String, Value>,
}

fn default_rewrite_module_tmp() -> String {
    DEFAULT_REWRITE_MODULE_TMP.to_string()
}

impl HyperParams {
    pub fn from_path(path: &Path) -> CoreResult<Self> {
        read_structured(path)
    }

    /// `(report key, parameter name)` for every tracked layer, in file order.
    pub fn tracked_parameters(&self) -> Vec<(String, String)> {
        self.layers
            .iter()
            .map(|l| (l.to_string(), l.parameter_name(&self.rewrite_module_tmp)))
            .collect()
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.tunables
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }

    pub fn to_value(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn layers_accept_indices_and_module_names() {
        let hp: HyperParams = serde_json::from_value(json!({
            "layers": [17, "transformer.h.3.mlp.c_fc.weight"],
            "v_lr": 0.5,
            "mom2_dataset": "wikipedia"
        }))
        .expect("hparams");
        assert_eq!(
            hp.tracked_parameters(),
            vec![
                ("17".to_string(), "transformer.h.17.mlp.c_proj.weight".to_string()),
                (
                    "transformer.h.3.mlp.c_fc.weight".to_string(),
                    "transformer.h.3.mlp.c_fc.weight".to_string()
                ),
            ]
        );
        assert_eq!(hp.get_f64("v_lr", 0.0), 0.5);
        assert_eq!(hp.get_f64("missing", 4.0), 4.0);
        assert_eq!(hp.tunables["mom2_dataset"], json!("wikipedia"));
    }

    #[test]
    fn serialization_keeps_unknown_tunables() {
        let hp: HyperParams = serde_json::from_value(json!({
            "layers": [1],
            "rewrite_module_tmp": "model.layers.{}.mlp.down_proj",
            "kl_factor": 0.0625
        }))
        .expect("hparams");
        let back = hp.to_value().expect("value");
        assert_eq!(back["kl_factor"], json!(0.0625));
        assert_eq!(back["layers"], json!([1]));
        assert_eq!(hp.tracked_parameters()[0].1, "model.layers.1.mlp.down_proj.weight");
    }
}
