use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use edit_core::{canonical_json_digest, ensure_dir, write_json_once, HyperParams};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PARAMS_FILE: &str = "params.json";
pub const MANIFEST_FILE: &str = "manifest.json";
const ALLOCATION_LOCK: &str = ".allocate.lock";
/// Age past which an allocation lock is treated as abandoned.
const LOCK_TTL_SECONDS: i64 = 300;

/// Run-level settings persisted next to the algorithm tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub model_name: String,
    pub algo_name: String,
    pub dataset: String,
    pub n_edits: usize,
    pub use_cache: bool,
    pub continue_from_run: Option<String>,
    pub skip_generation_tests: bool,
    pub generation_test_interval: i64,
    pub conserve_memory: bool,
    pub sequential: bool,
    pub hparams_fname: String,
    pub dataset_size_limit: Option<usize>,
    pub downstream_eval_interval: u64,
}

#[derive(Clone, Debug)]
pub struct RunState {
    pub run_dir: PathBuf,
    pub run_id: String,
    pub hparams: HyperParams,
    /// True when an existing run directory was reused.
    pub continued: bool,
}

#[derive(Debug)]
struct AllocationLock {
    path: PathBuf,
}

impl Drop for AllocationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Sole authority for run directory numbering under one algorithm directory.
#[derive(Clone, Debug)]
pub struct RunAllocator {
    alg_dir: PathBuf,
}

impl RunAllocator {
    pub fn new(results_dir: &Path, dir_name: &str) -> Self {
        RunAllocator {
            alg_dir: results_dir.join(dir_name),
        }
    }

    pub fn alg_dir(&self) -> &Path {
        &self.alg_dir
    }

    /// Reuses `continue_from` when that directory exists, otherwise allocates a
    /// fresh one. Returns `(run_dir, run_id, continued)`.
    pub fn resolve(&self, continue_from: Option<&str>) -> Result<(PathBuf, String, bool)> {
        if let Some(run_id) = continue_from {
            let run_dir = self.alg_dir.join(run_id);
            if run_dir.is_dir() {
                return Ok((run_dir, run_id.to_string(), true));
            }
            debug!(run_id, "continuation directory absent; allocating a fresh run");
        }
        let (run_dir, run_id) = self.allocate()?;
        Ok((run_dir, run_id, false))
    }

    pub fn allocate(&self) -> Result<(PathBuf, String)> {
        ensure_dir(&self.alg_dir)?;
        let _lock = self.acquire_lock()?;
        let mut next = self.next_run_number()?;
        loop {
            let run_id = format!("run_{:03}", next);
            let run_dir = self.alg_dir.join(&run_id);
            match fs::create_dir(&run_dir) {
                Ok(()) => return Ok((run_dir, run_id)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => next += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One past the largest numeric suffix among existing entries, or 0.
    pub fn next_run_number(&self) -> Result<u32> {
        if !self.alg_dir.exists() {
            return Ok(0);
        }
        let mut max: Option<u32> = None;
        for entry in fs::read_dir(&self.alg_dir)? {
            let name = entry?.file_name();
            if let Some(n) = name.to_str().and_then(parse_run_number) {
                max = Some(max.map_or(n, |m| m.max(n)));
            }
        }
        Ok(max.map_or(0, |m| m + 1))
    }

    fn acquire_lock(&self) -> Result<AllocationLock> {
        let path = self.alg_dir.join(ALLOCATION_LOCK);
        if let Some(lock) = create_lock(&path)? {
            return Ok(lock);
        }
        if lock_is_stale(&path) {
            warn!(path = %path.display(), "reclaiming stale allocation lock");
            let _ = fs::remove_file(&path);
            if let Some(lock) = create_lock(&path)? {
                return Ok(lock);
            }
        }
        Err(anyhow!(
            "allocation_in_progress: {} is locked by another process",
            self.alg_dir.display()
        ))
    }
}

#[derive(Debug, Deserialize)]
struct LockRecord {
    pid: u32,
    #[serde(default)]
    acquired_at: Option<String>,
}

/// `None` when another holder got there first.
fn create_lock(path: &Path) -> Result<Option<AllocationLock>> {
    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(Some(AllocationLock {
                path: path.to_path_buf(),
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// A lock is stale when its holder is gone or it is older than
/// [`LOCK_TTL_SECONDS`]. An unreadable record is aged by its mtime.
fn lock_is_stale(path: &Path) -> bool {
    let record = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<LockRecord>(&raw).ok());
    if let Some(record) = record.as_ref() {
        if !process_alive(record.pid) {
            return true;
        }
    }
    let acquired = record
        .and_then(|r| r.acquired_at)
        .and_then(|at| DateTime::parse_from_rfc3339(&at).ok())
        .map(|at| at.with_timezone(&Utc))
        .or_else(|| {
            fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        });
    match acquired {
        Some(at) => (Utc::now() - at).num_seconds() > LOCK_TTL_SECONDS,
        None => false,
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Numeric suffix after the last `_`, e.g. `run_007` -> 7.
pub fn parse_run_number(name: &str) -> Option<u32> {
    let suffix = name.rsplit('_').next()?;
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Resolves the run directory and pins its hyperparameters.
///
/// A reused directory that already holds `params.json` keeps those tunables;
/// otherwise they come from `hparams_source` and `params.json` is written once.
pub fn open_run(
    allocator: &RunAllocator,
    continue_from: Option<&str>,
    hparams_source: &Path,
    metadata: &RunMetadata,
) -> Result<RunState> {
    let (run_dir, run_id, continued) = allocator.resolve(continue_from)?;
    let params_path = run_dir.join(PARAMS_FILE);
    let hparams = if params_path.exists() {
        HyperParams::from_path(&params_path)
            .with_context(|| format!("failed to read {}", params_path.display()))?
    } else {
        let hparams = HyperParams::from_path(hparams_source)
            .with_context(|| format!("failed to read hyperparameters {}", hparams_source.display()))?;
        let mut metadata = metadata.clone();
        metadata.continue_from_run = if continued { Some(run_id.clone()) } else { None };
        write_json_once(&params_path, &params_document(&hparams, &metadata)?)?;
        hparams
    };
    info!(run_dir = %run_dir.display(), continued, "results will be stored in run directory");
    Ok(RunState {
        run_dir,
        run_id,
        hparams,
        continued,
    })
}

/// Tunables with run metadata merged on top.
pub fn params_document(hparams: &HyperParams, metadata: &RunMetadata) -> Result<Value> {
    let mut doc = hparams.to_value()?;
    let meta = serde_json::to_value(metadata)?;
    match (doc.as_object_mut(), meta.as_object()) {
        (Some(doc_obj), Some(meta_obj)) => {
            for (k, v) in meta_obj.iter() {
                doc_obj.insert(k.clone(), v.clone());
            }
        }
        _ => return Err(anyhow!("hyperparameters must serialize to a JSON object")),
    }
    Ok(doc)
}

/// Writes `manifest.json` the first time a run directory is opened.
pub fn write_manifest_once(state: &RunState, selection_digest: &str) -> Result<()> {
    let path = state.run_dir.join(MANIFEST_FILE);
    if path.exists() {
        return Ok(());
    }
    let params_digest = canonical_json_digest(&state.hparams.to_value()?);
    let manifest = json!({
        "schema_version": "edit_run_manifest_v1",
        "run_id": state.run_id,
        "runner_version": concat!("rust-", env!("CARGO_PKG_VERSION")),
        "created_at": Utc::now().to_rfc3339(),
        "selection_digest": selection_digest,
        "params_digest": params_digest,
    });
    write_json_once(&path, &manifest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use edit_core::read_json;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "edit_runner_state_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    fn metadata() -> RunMetadata {
        RunMetadata {
            model_name: "gpt2-xl".to_string(),
            algo_name: "ROME".to_string(),
            dataset: "cf".to_string(),
            n_edits: 1,
            use_cache: false,
            continue_from_run: None,
            skip_generation_tests: false,
            generation_test_interval: 1,
            conserve_memory: false,
            sequential: true,
            hparams_fname: "gpt2-xl.json".to_string(),
            dataset_size_limit: None,
            downstream_eval_interval: 20,
        }
    }

    fn hparams_file(root: &Path) -> PathBuf {
        let path = root.join("gpt2-xl.json");
        fs::write(&path, r#"{"layers": [17], "v_lr": 0.5}"#).expect("hparams");
        path
    }

    #[test]
    fn run_numbers_parse_from_suffix() {
        assert_eq!(parse_run_number("run_000"), Some(0));
        assert_eq!(parse_run_number("run_042"), Some(42));
        assert_eq!(parse_run_number("run_x"), None);
        assert_eq!(parse_run_number("run_"), None);
        assert_eq!(parse_run_number("notes.txt"), None);
    }

    #[test]
    fn allocation_increments_past_maximum() {
        let root = temp_root("alloc");
        let allocator = RunAllocator::new(&root, "ROME");
        assert_eq!(allocator.next_run_number().expect("empty"), 0);
        let (_, first) = allocator.allocate().expect("first");
        assert_eq!(first, "run_000");
        ensure_dir(&root.join("ROME").join("run_007")).expect("gap");
        let (_, next) = allocator.allocate().expect("next");
        assert_eq!(next, "run_008");
        assert!(!root.join("ROME").join(ALLOCATION_LOCK).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn allocation_lock_is_exclusive() {
        let root = temp_root("lock");
        let allocator = RunAllocator::new(&root, "ROME");
        ensure_dir(allocator.alg_dir()).expect("alg dir");
        let held = allocator.acquire_lock().expect("first lock");
        let err = allocator.allocate().expect_err("must fail while locked");
        assert!(err.to_string().contains("allocation_in_progress"));
        drop(held);
        allocator.allocate().expect("allocates after release");
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lock_of_dead_process_is_reclaimed() {
        let root = temp_root("deadlock");
        let allocator = RunAllocator::new(&root, "ROME");
        ensure_dir(allocator.alg_dir()).expect("alg dir");
        // above the kernel's pid ceiling, so never a live process
        fs::write(allocator.alg_dir().join(ALLOCATION_LOCK), r#"{"pid":4294000000}"#)
            .expect("plant lock");
        let (_, run_id, continued) = allocator.resolve(None).expect("allocates");
        assert_eq!(run_id, "run_000");
        assert!(!continued);
        assert!(!allocator.alg_dir().join(ALLOCATION_LOCK).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn expired_lock_is_reclaimed() {
        let root = temp_root("oldlock");
        let allocator = RunAllocator::new(&root, "ROME");
        ensure_dir(allocator.alg_dir()).expect("alg dir");
        let old = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        fs::write(
            allocator.alg_dir().join(ALLOCATION_LOCK),
            format!("{{\"pid\":{},\"acquired_at\":\"{}\"}}", std::process::id(), old),
        )
        .expect("plant lock");
        let (_, run_id) = allocator.allocate().expect("allocates");
        assert_eq!(run_id, "run_000");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_continuation_falls_back_to_fresh_run() {
        let root = temp_root("fallback");
        let allocator = RunAllocator::new(&root, "ROME");
        let (dir, run_id, continued) = allocator.resolve(Some("run_123")).expect("resolve");
        assert!(!continued);
        assert_eq!(run_id, "run_000");
        assert!(dir.is_dir());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn params_written_once_and_reused_on_continue() {
        let root = temp_root("params");
        let source = hparams_file(&root);
        let allocator = RunAllocator::new(&root, "ROME");
        let state = open_run(&allocator, None, &source, &metadata()).expect("open");
        let params_path = state.run_dir.join(PARAMS_FILE);
        let written: Value = read_json(&params_path).expect("params");
        assert_eq!(written["model_name"], json!("gpt2-xl"));
        assert_eq!(written["n_edits"], json!(1));
        assert_eq!(written["layers"], json!([17]));
        assert_eq!(written["continue_from_run"], Value::Null);

        fs::write(&source, r#"{"layers": [3], "v_lr": 9.0}"#).expect("edit source");
        let mut changed = metadata();
        changed.model_name = "gpt2-medium".to_string();
        let resumed = open_run(&allocator, Some(&state.run_id), &source, &changed).expect("resume");
        assert!(resumed.continued);
        assert_eq!(resumed.run_dir, state.run_dir);
        assert_eq!(resumed.hparams.get_f64("v_lr", 0.0), 0.5);
        let after: Value = read_json(&params_path).expect("params");
        assert_eq!(after, written);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn manifest_records_digests_once() {
        let root = temp_root("manifest");
        let source = hparams_file(&root);
        let allocator = RunAllocator::new(&root, "ROME");
        let state = open_run(&allocator, None, &source, &metadata()).expect("open");
        write_manifest_once(&state, "sha256:abc").expect("manifest");
        write_manifest_once(&state, "sha256:def").expect("second call is a no-op");
        let manifest: Value = read_json(&state.run_dir.join(MANIFEST_FILE)).expect("manifest");
        assert_eq!(manifest["selection_digest"], json!("sha256:abc"));
        assert_eq!(manifest["run_id"], json!(state.run_id));
        let _ = fs::remove_dir_all(root);
    }
}
