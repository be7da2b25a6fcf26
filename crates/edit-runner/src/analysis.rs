//! Series extraction over a finished (or partial) run directory.

use crate::ledger::parse_case_file_name;
use crate::run_state::PARAMS_FILE;
use crate::scheduler::{BASELINE_FILE, GLUE_DIR};
use anyhow::{Context, Result};
use edit_core::{atomic_write_json_pretty, read_json};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// task -> metric -> edit_num -> value
pub type GlueSeries = BTreeMap<String, BTreeMap<String, BTreeMap<u64, f64>>>;
/// tracked group -> case_id -> distance
pub type DistanceSeries = BTreeMap<String, BTreeMap<u64, f64>>;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub schema_version: String,
    pub run_dir: PathBuf,
    pub num_edits: usize,
    pub case_count: usize,
    pub glue: GlueSeries,
    pub distance: DistanceSeries,
}

pub fn summarize_run(run_dir: &Path) -> Result<RunSummary> {
    let params: Value = read_json(&run_dir.join(PARAMS_FILE))
        .with_context(|| format!("{} is not a run directory", run_dir.display()))?;
    let num_edits = params.get("n_edits").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
    let mut summary = RunSummary {
        schema_version: "run_summary_v1".to_string(),
        run_dir: run_dir.to_path_buf(),
        num_edits,
        ..RunSummary::default()
    };

    let glue_dir = run_dir.join(GLUE_DIR);
    if glue_dir.is_dir() {
        for entry in fs::read_dir(&glue_dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
            if !name.ends_with("_glue.json") {
                continue;
            }
            let doc: Value = read_json(&path)?;
            let edit_num = if name == BASELINE_FILE {
                0
            } else {
                doc.get("edit_num").and_then(|v| v.as_u64()).unwrap_or(0)
            };
            collect_task_scores(&doc, edit_num, &mut summary.glue);
        }
    }

    for entry in fs::read_dir(run_dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
        let Some(case_id) = parse_case_file_name(name, num_edits) else {
            continue;
        };
        summary.case_count += 1;
        let doc: Value = read_json(&path)?;
        if let Some(report) = doc.get("distance_from_original").and_then(|v| v.as_object()) {
            for (group, value) in report.iter() {
                if let Some(d) = value.as_f64() {
                    summary
                        .distance
                        .entry(group.clone())
                        .or_default()
                        .insert(case_id, d);
                }
            }
        }
    }
    Ok(summary)
}

/// Top-level objects of numbers are task score tables.
fn collect_task_scores(doc: &Value, edit_num: u64, glue: &mut GlueSeries) {
    let Some(obj) = doc.as_object() else {
        return;
    };
    for (task, metrics) in obj.iter() {
        if task == "distance_from_original" {
            continue;
        }
        let Some(metrics) = metrics.as_object() else {
            continue;
        };
        for (metric, value) in metrics.iter() {
            if let Some(v) = value.as_f64() {
                glue.entry(task.clone())
                    .or_default()
                    .entry(metric.clone())
                    .or_default()
                    .insert(edit_num, v);
            }
        }
    }
}

/// Writes `evals/summary.json` inside the run directory.
pub fn write_summary(run_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let path = run_dir.join("evals").join("summary.json");
    atomic_write_json_pretty(&path, summary)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edit_core::ensure_dir;
    use serde_json::json;

    #[test]
    fn summary_collects_glue_and_distance_series() {
        let root = std::env::temp_dir().join(format!(
            "edit_runner_summary_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root.join(GLUE_DIR)).expect("dirs");
        atomic_write_json_pretty(&root.join(PARAMS_FILE), &json!({"n_edits": 1})).expect("params");
        atomic_write_json_pretty(
            &root.join(GLUE_DIR).join(BASELINE_FILE),
            &json!({"edit_num": 0, "case_id": [], "sst": {"correct": 150.0, "f1": 0.9}}),
        )
        .expect("base");
        atomic_write_json_pretty(
            &root.join(GLUE_DIR).join("case_41_glue.json"),
            &json!({
                "edit_num": 20,
                "case_id": [41],
                "sst": {"correct": 120.0, "f1": 0.7},
                "distance_from_original": {"17": 0.002}
            }),
        )
        .expect("periodic");
        for (case_id, d) in [(3u64, 0.001), (41, 0.002)] {
            atomic_write_json_pretty(
                &root.join(format!("1_edits-case_{}.json", case_id)),
                &json!({"case_id": case_id, "distance_from_original": {"17": d}}),
            )
            .expect("case");
        }

        let summary = summarize_run(&root).expect("summary");
        assert_eq!(summary.case_count, 2);
        assert_eq!(summary.glue["sst"]["correct"][&0], 150.0);
        assert_eq!(summary.glue["sst"]["f1"][&20], 0.7);
        assert!(!summary.glue.contains_key("distance_from_original"));
        assert_eq!(summary.distance["17"][&41], 0.002);
        let path = write_summary(&root, &summary).expect("write");
        assert!(path.ends_with("evals/summary.json"));
        let _ = fs::remove_dir_all(root);
    }
}
