use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Run-time settings shared by every estimator invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Parameter-server replicas; bounds the partition hint of variables.
    pub num_ps_replicas: usize,
    pub tf_random_seed: u64,
    /// 0 disables periodic checkpoints (one is still written when `fit` ends).
    pub save_checkpoints_steps: u64,
    pub keep_checkpoint_max: usize,
    pub save_summary_steps: u64,
    pub log_step_count_steps: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_ps_replicas: 0,
            tf_random_seed: 42,
            save_checkpoints_steps: 100,
            keep_checkpoint_max: 5,
            save_summary_steps: 100,
            log_step_count_steps: 100,
        }
    }
}

impl RunConfig {
    /// Defaults overridden by `rdnn.toml` in the working directory (if any)
    /// and `RDNN_*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from("rdnn.toml")
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            // RDNN_TF_RANDOM_SEED, RDNN_SAVE_CHECKPOINTS_STEPS, ...
            .add_source(
                Environment::with_prefix("RDNN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn with_num_ps_replicas(mut self, n: usize) -> Self {
        self.num_ps_replicas = n;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.tf_random_seed = seed;
        self
    }

    pub fn with_save_checkpoints_steps(mut self, steps: u64) -> Self {
        self.save_checkpoints_steps = steps;
        self
    }

    pub fn with_keep_checkpoint_max(mut self, n: usize) -> Self {
        self.keep_checkpoint_max = n;
        self
    }

    pub fn with_save_summary_steps(mut self, steps: u64) -> Self {
        self.save_summary_steps = steps;
        self
    }

    pub fn with_log_step_count_steps(mut self, steps: u64) -> Self {
        self.log_step_count_steps = steps;
        self
    }
}
