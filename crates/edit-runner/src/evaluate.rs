use crate::editor::rewrite_key_value;
use anyhow::{anyhow, Context, Result};
use edit_core::tensor::l2_norm;
use edit_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, Device, EditRequest, HyperParams, Model};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Task name to metric name to value.
pub type TaskScores = BTreeMap<String, BTreeMap<String, f64>>;

/// Top-level keys of a downstream snapshot that task names must not reuse.
pub const RESERVED_TASK_NAMES: [&str; 3] = ["edit_num", "case_id", "distance_from_original"];

pub fn check_task_names(scores: &TaskScores) -> Result<()> {
    match scores
        .keys()
        .find(|name| RESERVED_TASK_NAMES.contains(&name.as_str()))
    {
        Some(name) => Err(anyhow!(
            "downstream task name {:?} collides with a snapshot field",
            name
        )),
        None => Ok(()),
    }
}

/// Scores the edited model on the case that was just written.
pub trait RewriteEvaluator {
    /// Produces the `post` block of a case result. `generation` asks for the
    /// slower generation-based checks as well.
    fn evaluate(&self, model: &dyn Model, request: &EditRequest, generation: bool) -> Result<Value>;
}

/// Benchmark pass unrelated to the edited facts.
pub trait DownstreamEvaluator {
    fn evaluate(&mut self, model: &dyn Model) -> Result<TaskScores>;
}

/// When generation tests run for a case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationSchedule {
    Skip,
    /// Cases whose id is a multiple of the interval.
    Every(u64),
}

impl GenerationSchedule {
    /// A non-positive interval disables generation tests, as does `skip`.
    pub fn new(skip: bool, interval: i64) -> Self {
        if skip || interval <= 0 {
            GenerationSchedule::Skip
        } else {
            GenerationSchedule::Every(interval as u64)
        }
    }

    pub fn runs_for(&self, case_id: u64) -> bool {
        match self {
            GenerationSchedule::Skip => false,
            GenerationSchedule::Every(n) => case_id % n == 0,
        }
    }
}

/// Checks how strongly each tracked group maps the request's key onto its
/// value vector. The companion of [`crate::editor::RankOneEditor`].
#[derive(Clone, Debug)]
pub struct KeyResponseEvaluator {
    groups: Vec<(String, String)>,
}

impl KeyResponseEvaluator {
    pub fn new(hparams: &HyperParams) -> Self {
        KeyResponseEvaluator {
            groups: hparams.tracked_parameters(),
        }
    }
}

impl RewriteEvaluator for KeyResponseEvaluator {
    fn evaluate(&self, model: &dyn Model, request: &EditRequest, generation: bool) -> Result<Value> {
        let payload = request.rewrite_payload();
        let mut alignment = Map::new();
        let mut response_norm = Map::new();
        for (key, param) in self.groups.iter() {
            let weight = model.parameter(param)?;
            let (rows, cols) = weight.dims2()?;
            let (k, v) = rewrite_key_value(&payload, rows, cols);
            let response = weight.matvec(&k)?;
            let dot: f64 = response
                .iter()
                .zip(v.iter())
                .map(|(a, b)| *a as f64 * *b as f64)
                .sum();
            let denom = l2_norm(&response) * l2_norm(&v);
            let cos = if denom > 0.0 { dot / denom } else { 0.0 };
            alignment.insert(key.clone(), json!(cos));
            if generation {
                response_norm.insert(key.clone(), json!(l2_norm(&response)));
            }
        }
        let mut post = Map::new();
        post.insert("rewrite_alignment".to_string(), Value::Object(alignment));
        if generation {
            post.insert("response_norm".to_string(), Value::Object(response_norm));
        }
        Ok(Value::Object(post))
    }
}

/// Downstream evaluator that scores nothing; snapshots still record
/// `edit_num`, case ids and drift.
#[derive(Clone, Debug, Default)]
pub struct NullEvaluator;

impl DownstreamEvaluator for NullEvaluator {
    fn evaluate(&mut self, _model: &dyn Model) -> Result<TaskScores> {
        Ok(TaskScores::new())
    }
}

/// Runs an external benchmark command against a model snapshot.
///
/// The snapshot and a small input document are written under `work_dir`; the
/// input is also piped on stdin. Scores are read from the output file or,
/// failing that, from the last JSON line on stdout.
#[derive(Clone, Debug)]
pub struct CommandEvaluator {
    command: Vec<String>,
    work_dir: PathBuf,
}

impl CommandEvaluator {
    pub fn new(command: Vec<String>, work_dir: &Path) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("downstream command is empty"));
        }
        Ok(CommandEvaluator {
            command,
            work_dir: work_dir.to_path_buf(),
        })
    }
}

impl DownstreamEvaluator for CommandEvaluator {
    fn evaluate(&mut self, model: &dyn Model) -> Result<TaskScores> {
        ensure_dir(&self.work_dir)?;
        let model_path = self.work_dir.join("downstream_model.json");
        let input_path = self.work_dir.join("downstream_input.json");
        let output_path = self.work_dir.join("downstream_output.json");
        model.snapshot(Device::Offload)?.save(&model_path)?;
        let input = json!({
            "schema_version": "downstream_input_v1",
            "model_name": model.name(),
            "model_path": model_path,
            "output_path": output_path,
        });
        atomic_write_json_pretty(&input_path, &input)?;
        if output_path.exists() {
            fs::remove_file(&output_path)?;
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.env("MEDIT_DOWNSTREAM_INPUT", &input_path);
        cmd.env("MEDIT_DOWNSTREAM_OUTPUT", &output_path);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.command[0]))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&serde_json::to_vec(&input)?);
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(anyhow!(
                "downstream command exited with {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            ));
        }

        if !output_path.exists() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let last = stdout
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|s| s.trim().to_string());
            if let Some(line) = last {
                if serde_json::from_str::<Value>(&line).is_ok() {
                    atomic_write_bytes(&output_path, line.as_bytes())?;
                }
            }
        }
        if !output_path.exists() {
            return Err(anyhow!("downstream command produced no scores"));
        }
        let scores: TaskScores = edit_core::read_json(&output_path)
            .with_context(|| format!("malformed downstream scores in {}", output_path.display()))?;
        check_task_names(&scores)?;
        Ok(scores)
    }
}
