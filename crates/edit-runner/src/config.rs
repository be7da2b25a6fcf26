use crate::mode::Mode;
use crate::run_state::RunMetadata;
use anyhow::{anyhow, Context, Result};
use edit_core::{DatasetKind, Device};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout shared by every run, read from `globals.yml`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Globals {
    #[serde(rename = "RESULTS_DIR", alias = "results_dir", default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(rename = "HPARAMS_DIR", alias = "hparams_dir", default = "default_hparams_dir")]
    pub hparams_dir: PathBuf,
    #[serde(rename = "DATA_DIR", alias = "data_dir", default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(rename = "KV_DIR", alias = "kv_dir", default = "default_kv_dir")]
    pub kv_dir: PathBuf,
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_hparams_dir() -> PathBuf {
    PathBuf::from("hparams")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_kv_dir() -> PathBuf {
    PathBuf::from("data/kvs")
}

impl Default for Globals {
    fn default() -> Self {
        Globals {
            results_dir: default_results_dir(),
            hparams_dir: default_hparams_dir(),
            data_dir: default_data_dir(),
            kv_dir: default_kv_dir(),
        }
    }
}

impl Globals {
    /// Reads `path`, or `globals.yml` in the working directory when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from("globals.yml");
                if !default.exists() {
                    return Ok(Globals::default());
                }
                default
            }
        };
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read globals {}", path.display()))?;
        let globals: Globals = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid globals {}", path.display()))?;
        Ok(globals)
    }
}

/// Everything a single edit run is parameterized by.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub alg_name: String,
    pub model_name: String,
    pub hparams_fname: String,
    pub ds_name: DatasetKind,
    pub dataset_size_limit: Option<usize>,
    pub continue_from_run: Option<String>,
    pub skip_generation_tests: bool,
    /// Generation tests run on cases whose id is a multiple of this; `-1` disables them.
    pub generation_test_interval: i64,
    /// Downstream evaluation cadence in batches; 0 keeps only the baseline.
    pub downstream_eval_interval: u64,
    pub conserve_memory: bool,
    pub sequential: bool,
    pub num_edits: usize,
    pub use_cache: bool,
    /// Directory under the results root; defaults to the algorithm name.
    pub dir_name: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            alg_name: "ROME".to_string(),
            model_name: "gpt2-xl".to_string(),
            hparams_fname: "gpt2-xl.json".to_string(),
            ds_name: DatasetKind::CounterFact,
            dataset_size_limit: None,
            continue_from_run: None,
            skip_generation_tests: false,
            generation_test_interval: 1,
            downstream_eval_interval: 20,
            conserve_memory: false,
            sequential: false,
            num_edits: 1,
            use_cache: false,
            dir_name: "ROME".to_string(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_edits == 0 {
            return Err(anyhow!("num_edits must be at least 1"));
        }
        if self.num_edits > 1 && !self.ds_name.supports_batched_edits() {
            return Err(anyhow!(
                "{} does not support multiple edits",
                self.ds_name.as_str()
            ));
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        Mode::from_sequential_flag(self.sequential)
    }

    /// Tier undo records are kept on.
    pub fn undo_device(&self) -> Device {
        if self.conserve_memory {
            Device::Offload
        } else {
            Device::Primary
        }
    }

    pub fn hparams_path(&self, globals: &Globals) -> PathBuf {
        globals.hparams_dir.join(&self.alg_name).join(&self.hparams_fname)
    }

    /// Template for cached key/value statistics, filled with layer, clamp and case.
    pub fn cache_template(&self, globals: &Globals) -> Option<String> {
        if !self.use_cache {
            return None;
        }
        let dir = globals
            .kv_dir
            .join(format!("{}_{}", self.model_name.replace('/', "_"), self.alg_name));
        Some(
            dir.join(format!(
                "{}_layer_{{}}_clamp_{{}}_case_{{}}.json",
                self.ds_name.as_str()
            ))
            .to_string_lossy()
            .to_string(),
        )
    }

    pub fn metadata(&self) -> RunMetadata {
        RunMetadata {
            model_name: self.model_name.clone(),
            algo_name: self.alg_name.clone(),
            dataset: self.ds_name.as_str().to_string(),
            n_edits: self.num_edits,
            use_cache: self.use_cache,
            continue_from_run: self.continue_from_run.clone(),
            skip_generation_tests: self.skip_generation_tests,
            generation_test_interval: self.generation_test_interval,
            conserve_memory: self.conserve_memory,
            sequential: self.sequential,
            hparams_fname: self.hparams_fname.clone(),
            dataset_size_limit: self.dataset_size_limit,
            downstream_eval_interval: self.downstream_eval_interval,
        }
    }
}
