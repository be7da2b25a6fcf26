use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// One dataset record describing a single fact rewrite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditRequest {
    pub case_id: u64,
    pub requested_rewrite: Value,
    /// Prompts and other record fields, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EditRequest {
    pub fn subject(&self) -> Option<&str> {
        rewrite_subject(&self.requested_rewrite)
    }

    pub fn target_new(&self) -> Option<&str> {
        rewrite_target(&self.requested_rewrite)
    }

    /// Rewrite payload handed to an editor: the requested rewrite plus `case_id`.
    pub fn rewrite_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("case_id".to_string(), Value::from(self.case_id));
        if let Some(obj) = self.requested_rewrite.as_object() {
            for (k, v) in obj.iter() {
                payload.insert(k.clone(), v.clone());
            }
        }
        Value::Object(payload)
    }
}

pub fn rewrite_subject(rewrite: &Value) -> Option<&str> {
    rewrite.get("subject").and_then(|v| v.as_str())
}

/// `target_new` as a bare string or as `{"str": ...}`.
pub fn rewrite_target(rewrite: &Value) -> Option<&str> {
    let target = rewrite.get("target_new")?;
    target
        .as_str()
        .or_else(|| target.get("str").and_then(|v| v.as_str()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetKind {
    CounterFact,
    MultiCounterFact,
    Zsre,
}

impl DatasetKind {
    pub fn parse(name: &str) -> CoreResult<Self> {
        match name {
            "cf" => Ok(DatasetKind::CounterFact),
            "mcf" => Ok(DatasetKind::MultiCounterFact),
            "zsre" => Ok(DatasetKind::Zsre),
            other => Err(CoreError::UnknownDataset(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::CounterFact => "cf",
            DatasetKind::MultiCounterFact => "mcf",
            DatasetKind::Zsre => "zsre",
        }
    }

    /// Whether several rewrites may be applied in one editor call.
    pub fn supports_batched_edits(&self) -> bool {
        !matches!(self, DatasetKind::CounterFact)
    }

    pub fn default_file(&self) -> &'static str {
        match self {
            DatasetKind::CounterFact => "counterfact.json",
            DatasetKind::MultiCounterFact => "multi_counterfact.json",
            DatasetKind::Zsre => "zsre_mend_eval.json",
        }
    }

    pub fn default_selection_file(&self) -> &'static str {
        match self {
            DatasetKind::CounterFact => "disabling_edits_counterfact.json",
            DatasetKind::MultiCounterFact => "disabling_edits_multi_counterfact.json",
            DatasetKind::Zsre => "disabling_edits_zsre.json",
        }
    }
}

/// Loads a JSON array or JSONL dataset, truncated to the first `limit` records.
pub fn load_dataset(path: &Path, limit: Option<usize>) -> CoreResult<Vec<EditRequest>> {
    let data = fs::read_to_string(path)?;
    let mut records: Vec<EditRequest> = if data.trim_start().starts_with('[') {
        serde_json::from_str(&data)?
    } else {
        let mut records = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|e| CoreError::InvalidRecord {
                path: path.to_path_buf(),
                reason: format!("line {}: {}", lineno + 1, e),
            })?;
            records.push(record);
        }
        records
    };
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    Ok(records)
}
