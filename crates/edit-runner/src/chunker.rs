use anyhow::{anyhow, Result};
use edit_core::EditRequest;

/// Requests applied and measured as one unit.
#[derive(Clone, Debug, PartialEq)]
pub struct EditBatch {
    pub requests: Vec<EditRequest>,
}

impl EditBatch {
    pub fn case_ids(&self) -> Vec<u64> {
        self.requests.iter().map(|r| r.case_id).collect()
    }

    /// Case id that names per-batch artifacts: the last one in the batch.
    pub fn representative_case_id(&self) -> Option<u64> {
        self.requests.last().map(|r| r.case_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Splits selected records into order-preserving groups of `size`.
/// The final group may be short.
pub fn chunk_batches(selected: &[&EditRequest], size: usize) -> Result<Vec<EditBatch>> {
    if size == 0 {
        return Err(anyhow!("num_edits must be at least 1"));
    }
    Ok(selected
        .chunks(size)
        .map(|chunk| EditBatch {
            requests: chunk.iter().map(|r| (*r).clone()).collect(),
        })
        .collect())
}

pub fn batch_count(selected: usize, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    selected.div_ceil(size)
}
