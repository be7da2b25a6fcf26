use anyhow::{Context, Result};
use edit_core::{atomic_write_json_pretty, canonical_json_digest, sha256_bytes, EditRequest};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("selection mask has no entry for dataset index {0}")]
    MissingIndex(usize),
}

/// Dataset index (stringified) to inclusion flag, fixed for a whole run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectionMask {
    entries: BTreeMap<String, bool>,
}

impl SelectionMask {
    pub fn from_entries(entries: BTreeMap<String, bool>) -> Self {
        SelectionMask { entries }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let entries: BTreeMap<String, bool> = edit_core::read_json(path)
            .with_context(|| format!("failed to read selection mask {}", path.display()))?;
        Ok(SelectionMask { entries })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &self.entries)?;
        Ok(())
    }

    pub fn is_selected(&self, index: usize) -> Result<bool, SelectionError> {
        self.entries
            .get(&index.to_string())
            .copied()
            .ok_or(SelectionError::MissingIndex(index))
    }

    /// Selected records in dataset order. Every index must be covered.
    pub fn select<'a>(
        &self,
        dataset: &'a [EditRequest],
    ) -> Result<Vec<&'a EditRequest>, SelectionError> {
        let mut selected = Vec::new();
        for (index, record) in dataset.iter().enumerate() {
            if self.is_selected(index)? {
                selected.push(record);
            }
        }
        Ok(selected)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn selected_count(&self) -> usize {
        self.entries.values().filter(|v| **v).count()
    }

    pub fn digest(&self) -> String {
        let value = serde_json::to_value(&self.entries).unwrap_or_default();
        canonical_json_digest(&value)
    }
}

/// Picks `n_samples` of `dataset_len` indices reproducibly for a given seed.
///
/// Indices are ranked by `sha256("<seed>:<index>")`, so the same seed always
/// yields the same mask regardless of platform.
pub fn sample_mask(dataset_len: usize, n_samples: usize, seed: u64) -> SelectionMask {
    sample_from(dataset_len, (0..dataset_len).collect(), n_samples, seed)
}

/// Like [`sample_mask`], but only the first record of each distinct
/// (case-insensitive) subject is eligible.
pub fn sample_unique_subjects(
    dataset: &[EditRequest],
    n_samples: usize,
    seed: u64,
) -> SelectionMask {
    let mut seen = BTreeSet::new();
    let mut eligible = Vec::new();
    for (index, record) in dataset.iter().enumerate() {
        let subject = record.subject().unwrap_or_default().to_lowercase();
        if seen.insert(subject) {
            eligible.push(index);
        }
    }
    sample_from(dataset.len(), eligible, n_samples, seed)
}

fn sample_from(dataset_len: usize, eligible: Vec<usize>, n_samples: usize, seed: u64) -> SelectionMask {
    let mut ranked: Vec<(String, usize)> = eligible
        .into_iter()
        .map(|i| (sha256_bytes(format!("{}:{}", seed, i).as_bytes()), i))
        .collect();
    ranked.sort();
    let chosen: BTreeSet<usize> = ranked.into_iter().take(n_samples).map(|(_, i)| i).collect();
    let entries = (0..dataset_len)
        .map(|i| (i.to_string(), chosen.contains(&i)))
        .collect();
    SelectionMask { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(subjects: &[&str]) -> Vec<EditRequest> {
        subjects
            .iter()
            .enumerate()
            .map(|(i, s)| {
                serde_json::from_value(json!({
                    "case_id": i,
                    "requested_rewrite": {"subject": s}
                }))
                .expect("record")
            })
            .collect()
    }

    fn mask(pairs: &[(&str, bool)]) -> SelectionMask {
        SelectionMask::from_entries(pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    #[test]
    fn select_skips_unmarked_indices() {
        let ds = records(&["a", "b", "c"]);
        let m = mask(&[("0", true), ("1", false), ("2", true)]);
        let ids: Vec<u64> = m.select(&ds).expect("select").iter().map(|r| r.case_id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn select_fails_on_uncovered_index() {
        let ds = records(&["a", "b", "c"]);
        let m = mask(&[("0", true), ("2", true)]);
        assert_eq!(m.select(&ds).expect_err("must fail"), SelectionError::MissingIndex(1));
    }

    #[test]
    fn sample_mask_is_reproducible_and_sized() {
        let a = sample_mask(100, 10, 37);
        let b = sample_mask(100, 10, 37);
        assert_eq!(a, b);
        assert_eq!(a.len(), 100);
        assert_eq!(a.selected_count(), 10);
        assert_ne!(a, sample_mask(100, 10, 38));
        assert_eq!(sample_mask(5, 10, 1).selected_count(), 5);
    }

    #[test]
    fn unique_subject_sampling_drops_repeats() {
        let ds = records(&["Paris", "paris", "Rome", "Oslo", "ROME"]);
        let m = sample_unique_subjects(&ds, 10, 37);
        assert_eq!(m.len(), 5);
        assert!(m.is_selected(0).expect("0"));
        assert!(!m.is_selected(1).expect("1"));
        assert!(m.is_selected(2).expect("2"));
        assert!(m.is_selected(3).expect("3"));
        assert!(!m.is_selected(4).expect("4"));
    }
}
