//! Completed-case bookkeeping for a run directory.
//!
//! A case result file on disk is the proof that a case is done. The
//! append-only `completed_cases.jsonl` indexes those files so that a resumed
//! run answers "is this case done" from memory. The index is reconciled with
//! the directory when opened: entries without a file are dropped, files
//! without an entry are adopted.

use crate::drift::DistanceReport;
use anyhow::{Context, Result};
use chrono::Utc;
use edit_core::write_json_once;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const LEDGER_FILE: &str = "completed_cases.jsonl";

/// Persisted outcome of one case.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: u64,
    pub grouped_case_ids: Vec<u64>,
    pub num_edits: usize,
    pub requested_rewrite: Value,
    /// Seconds spent applying the batch's edit.
    pub time: f64,
    pub post: Value,
    pub distance_from_original: DistanceReport,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerEntry {
    case_id: u64,
    num_edits: usize,
    completed_at: String,
}

#[derive(Debug)]
pub struct CaseLedger {
    run_dir: PathBuf,
    num_edits: usize,
    done: BTreeSet<u64>,
}

impl CaseLedger {
    pub fn open(run_dir: &Path, num_edits: usize) -> Result<Self> {
        let mut ledger = CaseLedger {
            run_dir: run_dir.to_path_buf(),
            num_edits,
            done: BTreeSet::new(),
        };
        let ledger_path = ledger.ledger_path();
        if ledger_path.exists() {
            let data = fs::read_to_string(&ledger_path)
                .with_context(|| format!("failed to read {}", ledger_path.display()))?;
            for line in data.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LedgerEntry>(line) {
                    Ok(entry) if entry.num_edits == num_edits => {
                        if ledger.case_path(entry.case_id).exists() {
                            ledger.done.insert(entry.case_id);
                        } else {
                            debug!(case_id = entry.case_id, "ledger entry without result file");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("skipping malformed ledger line: {}", e),
                }
            }
            if !data.is_empty() && !data.ends_with('\n') {
                // torn final write; start the next entry on its own line
                let mut file = fs::OpenOptions::new().append(true).open(&ledger_path)?;
                file.write_all(b"\n")?;
            }
        }
        let mut adopted = Vec::new();
        for entry in WalkDir::new(run_dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if let Some(case_id) = parse_case_file_name(&name, num_edits) {
                if ledger.done.insert(case_id) {
                    adopted.push(case_id);
                }
            }
        }
        for case_id in adopted {
            ledger.append(case_id)?;
        }
        Ok(ledger)
    }

    pub fn case_path(&self, case_id: u64) -> PathBuf {
        self.run_dir.join(case_file_name(self.num_edits, case_id))
    }

    pub fn is_done(&self, case_id: u64) -> bool {
        self.done.contains(&case_id)
    }

    pub fn all_done(&self, case_ids: &[u64]) -> bool {
        case_ids.iter().all(|id| self.is_done(*id))
    }

    pub fn completed(&self) -> usize {
        self.done.len()
    }

    /// Writes the case file, then indexes it. A done case is left untouched.
    pub fn record(&mut self, result: &CaseResult) -> Result<bool> {
        if self.is_done(result.case_id) {
            return Ok(false);
        }
        let path = self.case_path(result.case_id);
        write_json_once(&path, result)
            .with_context(|| format!("failed to write case result {}", path.display()))?;
        self.done.insert(result.case_id);
        self.append(result.case_id)?;
        Ok(true)
    }

    fn ledger_path(&self) -> PathBuf {
        self.run_dir.join(LEDGER_FILE)
    }

    fn append(&self, case_id: u64) -> Result<()> {
        let entry = LedgerEntry {
            case_id,
            num_edits: self.num_edits,
            completed_at: Utc::now().to_rfc3339(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ledger_path())?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

pub fn case_file_name(num_edits: usize, case_id: u64) -> String {
    format!("{}_edits-case_{}.json", num_edits, case_id)
}

/// Case id from a `<n>_edits-case_<id>.json` name written for `num_edits`.
pub fn parse_case_file_name(name: &str, num_edits: usize) -> Option<u64> {
    name.strip_prefix(&format!("{}_edits-case_", num_edits))?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
