use crate::chunker::{chunk_batches, EditBatch};
use crate::config::RunConfig;
use crate::drift::DriftTracker;
use crate::editor::{ApplyOptions, Editor};
use crate::evaluate::{DownstreamEvaluator, GenerationSchedule, RewriteEvaluator};
use crate::ledger::{CaseLedger, CaseResult};
use crate::mode::{Mode, ModeController};
use crate::run_state::RunState;
use crate::scheduler::EvalScheduler;
use crate::selection::SelectionMask;
use anyhow::{Context, Result};
use edit_core::{Device, EditRequest, Model, ParamStore};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

/// The algorithm-specific collaborators a session drives.
pub struct Collaborators<'a> {
    pub editor: &'a dyn Editor,
    pub rewrite: &'a dyn RewriteEvaluator,
    pub downstream: &'a mut dyn DownstreamEvaluator,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub run_dir: PathBuf,
    pub run_id: String,
    pub continued: bool,
    pub batches_total: usize,
    pub batches_processed: usize,
    pub batches_skipped: usize,
    pub cases_written: usize,
    pub evaluations: Vec<PathBuf>,
}

/// One run over a live model, measured against a frozen reference copy.
pub struct EditSession<M: Model> {
    state: RunState,
    ledger: CaseLedger,
    scheduler: EvalScheduler,
    drift: DriftTracker,
    mode: ModeController,
    generation: GenerationSchedule,
    options: ApplyOptions,
    num_edits: usize,
    reference: ParamStore,
    model: M,
}

impl<M: Model> EditSession<M> {
    /// Freezes the reference snapshot and opens the run's ledger. The reference
    /// lives on the offload tier and is never written afterwards.
    pub fn new(
        config: &RunConfig,
        state: RunState,
        model: M,
        cache_template: Option<String>,
    ) -> Result<Self> {
        config.validate()?;
        let reference = model
            .snapshot(Device::Offload)
            .context("failed to snapshot reference model")?;
        let ledger = CaseLedger::open(&state.run_dir, config.num_edits)?;
        let scheduler = EvalScheduler::new(&state.run_dir, config.downstream_eval_interval)?;
        let drift = DriftTracker::new(&state.hparams);
        let mode = config.mode();
        let options = ApplyOptions {
            return_orig_weights: mode.needs_undo(),
            orig_weights_device: config.undo_device(),
            cache_template,
        };
        info!(
            mode = mode.as_str(),
            undo_device = options.orig_weights_device.as_str(),
            completed = ledger.completed(),
            "edit session ready"
        );
        Ok(EditSession {
            state,
            ledger,
            scheduler,
            drift,
            mode: ModeController::new(mode),
            generation: GenerationSchedule::new(
                config.skip_generation_tests,
                config.generation_test_interval,
            ),
            options,
            num_edits: config.num_edits,
            reference,
            model,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode.mode()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn reference(&self) -> &ParamStore {
        &self.reference
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Walks every selected batch in dataset order.
    pub fn run(
        &mut self,
        dataset: &[EditRequest],
        mask: &SelectionMask,
        collab: Collaborators<'_>,
    ) -> Result<RunReport> {
        let selected = mask.select(dataset)?;
        let batches = chunk_batches(&selected, self.num_edits)?;
        info!(
            selected = selected.len(),
            batches = batches.len(),
            num_edits = self.num_edits,
            "starting edit sequence"
        );
        let mut report = RunReport {
            run_dir: self.state.run_dir.clone(),
            run_id: self.state.run_id.clone(),
            continued: self.state.continued,
            batches_total: batches.len(),
            ..RunReport::default()
        };
        let Collaborators {
            editor,
            rewrite,
            downstream,
        } = collab;
        for batch in batches.iter() {
            self.step(batch, &mut report, editor, rewrite, &mut *downstream)?;
        }
        info!(
            processed = report.batches_processed,
            skipped = report.batches_skipped,
            cases_written = report.cases_written,
            "edit sequence finished"
        );
        Ok(report)
    }

    fn step(
        &mut self,
        batch: &EditBatch,
        report: &mut RunReport,
        editor: &dyn Editor,
        rewrite: &dyn RewriteEvaluator,
        downstream: &mut dyn DownstreamEvaluator,
    ) -> Result<()> {
        let count = self.scheduler.advance();
        if self.scheduler.baseline_due() {
            // nothing has been applied in this process yet
            if let Some(path) = self.scheduler.run_baseline(downstream, &self.model)? {
                report.evaluations.push(path);
            }
        }

        let case_ids = batch.case_ids();
        if self.ledger.all_done(&case_ids) && !self.scheduler.periodic_pending(batch) {
            debug!(?case_ids, "batch already complete; skipping");
            report.batches_skipped += 1;
            return Ok(());
        }

        let start = Instant::now();
        let weights_copy = editor
            .apply(&mut self.model, &batch.requests, &self.state.hparams, &self.options)
            .with_context(|| format!("{} failed on cases {:?}", editor.name(), case_ids))?;
        let exec_time = start.elapsed().as_secs_f64();
        info!(batch = count, ?case_ids, exec_time, "edit applied");

        let eval_start = Instant::now();
        let distance = self.drift.measure(&self.reference, &self.model)?;
        // snapshot before case results, so a crash here leaves the batch open
        if self.scheduler.periodic_due() {
            if let Some(path) =
                self.scheduler
                    .run_periodic(downstream, &self.model, batch, distance.clone())?
            {
                report.evaluations.push(path);
            }
        }
        for request in batch.requests.iter() {
            if self.ledger.is_done(request.case_id) {
                debug!(case_id = request.case_id, "case result exists; skipping");
                continue;
            }
            let post = rewrite
                .evaluate(&self.model, request, self.generation.runs_for(request.case_id))
                .with_context(|| format!("rewrite evaluation failed for case {}", request.case_id))?;
            let result = CaseResult {
                case_id: request.case_id,
                grouped_case_ids: case_ids.clone(),
                num_edits: self.num_edits,
                requested_rewrite: request.requested_rewrite.clone(),
                time: exec_time,
                post,
                distance_from_original: distance.clone(),
            };
            if self.ledger.record(&result)? {
                report.cases_written += 1;
            }
        }

        let restored = self.mode.settle(&mut self.model, weights_copy)?;
        if restored > 0 {
            debug!(restored, "batch reverted");
        }
        report.batches_processed += 1;
        info!(
            batch = count,
            elapsed_s = eval_start.elapsed().as_secs_f64(),
            "evaluation finished"
        );
        Ok(())
    }
}
