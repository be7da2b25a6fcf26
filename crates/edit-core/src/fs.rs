use crate::error::{CoreError, CoreResult};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> CoreResult<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Writes `value` only if nothing exists at `path` yet.
///
/// The file appears atomically, so a reader never observes a half-written
/// artifact. Callers are the single writer of their run directory.
pub fn write_json_once<T: Serialize + ?Sized>(path: &Path, value: &T) -> CoreResult<()> {
    if path.exists() {
        return Err(CoreError::AlreadyExists(path.to_path_buf()));
    }
    atomic_write_json_pretty(path, value)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> CoreResult<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Reads JSON, or YAML when the extension says so.
pub fn read_structured<T: DeserializeOwned>(path: &Path) -> CoreResult<T> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => {
            let raw = fs::read_to_string(path)?;
            Ok(serde_yaml::from_str(&raw)?)
        }
        _ => read_json(path),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of the sorted-key serialization, stable across writers.
pub fn canonical_json_digest(value: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    format!("sha256:{}", sha256_bytes(canonical.as_bytes()))
}
