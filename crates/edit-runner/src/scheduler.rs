use crate::chunker::EditBatch;
use crate::drift::DistanceReport;
use crate::evaluate::{check_task_names, DownstreamEvaluator, TaskScores};
use anyhow::{Context, Result};
use edit_core::{ensure_dir, write_json_once, Model};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

pub const GLUE_DIR: &str = "glue_eval";
pub const BASELINE_FILE: &str = "base_glue.json";

/// One downstream evaluation, tagged by how many batches preceded it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlueSnapshot {
    pub edit_num: u64,
    pub case_id: Vec<u64>,
    #[serde(flatten)]
    pub tasks: TaskScores,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_from_original: Option<DistanceReport>,
}

/// Decides when downstream evaluations run and where they land.
///
/// The counter advances once per selected batch, including batches skipped
/// because a previous run finished them, so tags line up across resumes.
#[derive(Debug)]
pub struct EvalScheduler {
    glue_dir: PathBuf,
    interval: u64,
    counter: u64,
}

impl EvalScheduler {
    pub fn new(run_dir: &Path, interval: u64) -> Result<Self> {
        let glue_dir = run_dir.join(GLUE_DIR);
        ensure_dir(&glue_dir)?;
        Ok(EvalScheduler {
            glue_dir,
            interval,
            counter: 0,
        })
    }

    pub fn advance(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn baseline_path(&self) -> PathBuf {
        self.glue_dir.join(BASELINE_FILE)
    }

    pub fn periodic_path(&self, case_id: u64) -> PathBuf {
        self.glue_dir.join(format!("case_{}_glue.json", case_id))
    }

    /// Baseline is owed on the first batch of a run that has none yet.
    pub fn baseline_due(&self) -> bool {
        self.counter == 1 && !self.baseline_path().exists()
    }

    pub fn periodic_due(&self) -> bool {
        self.interval > 0 && self.counter > 0 && self.counter % self.interval == 0
    }

    /// A due snapshot for `batch` that is not on disk yet. A batch in this
    /// state is not finished even when all of its case results exist.
    pub fn periodic_pending(&self, batch: &EditBatch) -> bool {
        self.periodic_due()
            && batch
                .representative_case_id()
                .is_some_and(|case_id| !self.periodic_path(case_id).exists())
    }

    /// Scores the pristine model as `edit_num = 0`.
    pub fn run_baseline(
        &self,
        evaluator: &mut dyn DownstreamEvaluator,
        model: &dyn Model,
    ) -> Result<Option<PathBuf>> {
        let path = self.baseline_path();
        if path.exists() {
            return Ok(None);
        }
        let start = Instant::now();
        let tasks = evaluator.evaluate(model).context("baseline downstream evaluation failed")?;
        check_task_names(&tasks)?;
        let snapshot = GlueSnapshot {
            edit_num: 0,
            case_id: Vec::new(),
            tasks,
            distance_from_original: None,
        };
        write_json_once(&path, &snapshot)?;
        info!(elapsed_s = start.elapsed().as_secs_f64(), "baseline downstream evaluation written");
        Ok(Some(path))
    }

    /// Scores the live model after `batch`, keyed by its representative case id.
    pub fn run_periodic(
        &self,
        evaluator: &mut dyn DownstreamEvaluator,
        model: &dyn Model,
        batch: &EditBatch,
        distance: DistanceReport,
    ) -> Result<Option<PathBuf>> {
        let Some(case_id) = batch.representative_case_id() else {
            return Ok(None);
        };
        let path = self.periodic_path(case_id);
        if path.exists() {
            return Ok(None);
        }
        let start = Instant::now();
        let tasks = evaluator
            .evaluate(model)
            .with_context(|| format!("downstream evaluation at edit {} failed", self.counter))?;
        check_task_names(&tasks)?;
        let snapshot = GlueSnapshot {
            edit_num: self.counter,
            case_id: batch.case_ids(),
            tasks,
            distance_from_original: Some(distance),
        };
        write_json_once(&path, &snapshot)?;
        info!(
            edit_num = self.counter,
            elapsed_s = start.elapsed().as_secs_f64(),
            "downstream evaluation written"
        );
        Ok(Some(path))
    }
}
