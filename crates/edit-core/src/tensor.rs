//! Flat f32 tensors with shape metadata and a placement tier.
//!
//! Row-major layout throughout. Placement is a tag, not an allocator: moving a
//! tensor between tiers copies its values verbatim so a round trip is exact.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Memory tier a tensor lives on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Main compute device.
    #[default]
    Primary,
    /// Secondary tier used to keep undo records off the compute device.
    Offload,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Primary => "primary",
            Device::Offload => "offload",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    #[serde(skip)]
    device: Device,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> CoreResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(CoreError::InvalidTensor {
                shape,
                expected,
                found: data.len(),
            });
        }
        Ok(Tensor {
            shape,
            data,
            device: Device::Primary,
        })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; n],
            shape: shape.to_vec(),
            device: Device::Primary,
        }
    }

    /// Deterministic values in [-1, 1] derived from `seed`.
    pub fn seeded(shape: &[usize], seed: &str) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: seeded_values(seed, n),
            shape: shape.to_vec(),
            device: Device::Primary,
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Copy of this tensor realized on `device`.
    pub fn to_device(&self, device: Device) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.clone(),
            device,
        }
    }

    /// Overwrites values from `src` wherever it lives; keeps this tensor's placement.
    pub fn copy_from(&mut self, name: &str, src: &Tensor) -> CoreResult<()> {
        if self.shape != src.shape {
            return Err(CoreError::ShapeMismatch {
                name: name.to_string(),
                expected: self.shape.clone(),
                found: src.shape.clone(),
            });
        }
        self.data.copy_from_slice(&src.data);
        Ok(())
    }

    pub fn dims2(&self) -> CoreResult<(usize, usize)> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            _ => Err(CoreError::NotAMatrix(self.shape.clone())),
        }
    }

    pub fn l2_norm(&self) -> f64 {
        l2_norm(&self.data)
    }

    /// L2 norm of `self - other`, accumulated in f64.
    pub fn distance(&self, name: &str, other: &Tensor) -> CoreResult<f64> {
        if self.shape != other.shape {
            return Err(CoreError::ShapeMismatch {
                name: name.to_string(),
                expected: self.shape.clone(),
                found: other.shape.clone(),
            });
        }
        let sum: f64 = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| {
                let d = *a as f64 - *b as f64;
                d * d
            })
            .sum();
        Ok(sum.sqrt())
    }

    /// In-place `self += scale * v kᵀ` for a `[v.len(), k.len()]` matrix.
    pub fn add_outer(&mut self, v: &[f32], k: &[f32], scale: f32) -> CoreResult<()> {
        let (rows, cols) = self.dims2()?;
        if rows != v.len() || cols != k.len() {
            return Err(CoreError::ShapeMismatch {
                name: "outer product".to_string(),
                expected: self.shape.clone(),
                found: vec![v.len(), k.len()],
            });
        }
        for (i, vi) in v.iter().enumerate() {
            let row = &mut self.data[i * cols..(i + 1) * cols];
            for (w, kj) in row.iter_mut().zip(k.iter()) {
                *w += scale * vi * kj;
            }
        }
        Ok(())
    }

    /// `W x` for a 2-d tensor.
    pub fn matvec(&self, x: &[f32]) -> CoreResult<Vec<f32>> {
        let (rows, cols) = self.dims2()?;
        if cols != x.len() {
            return Err(CoreError::ShapeMismatch {
                name: "matvec".to_string(),
                expected: self.shape.clone(),
                found: vec![x.len()],
            });
        }
        Ok((0..rows)
            .map(|i| {
                self.data[i * cols..(i + 1) * cols]
                    .iter()
                    .zip(x.iter())
                    .map(|(w, xj)| w * xj)
                    .sum()
            })
            .collect())
    }
}

pub fn l2_norm(values: &[f32]) -> f64 {
    values
        .iter()
        .map(|v| (*v as f64) * (*v as f64))
        .sum::<f64>()
        .sqrt()
}

/// Expands `seed` into `n` values in [-1, 1] by hashing counter blocks.
pub fn seeded_values(seed: &str, n: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(n);
    let mut block: u64 = 0;
    while out.len() < n {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(block.to_le_bytes());
        let digest = hasher.finalize();
        for word in digest.chunks_exact(4) {
            if out.len() == n {
                break;
            }
            let raw = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            out.push((raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
        }
        block += 1;
    }
    out
}
