//! Pipeline configuration.
//!
//! Resolution order, later wins:
//!
//! 1. built-in defaults ([`PipelineConfig::default`]);
//! 2. an optional JSON file ([`PipelineConfig::from_file`]);
//! 3. `STAGEFLOW_*` environment variables ([`PipelineConfig::apply_env`]).
//!
//! | variable                        | field               |
//! |---------------------------------|---------------------|
//! | `STAGEFLOW_MAX_BATCH_SIZE`      | `max_batch_size`    |
//! | `STAGEFLOW_DEFAULT_WORKERS`     | `default_workers`   |
//! | `STAGEFLOW_WORKERS_<STAGE>`     | `workers["<stage>"]` |
//! | `STAGEFLOW_RESULTS_QUEUE`       | `results_queue`     |
//! | `STAGEFLOW_TOP_CUSTOMERS`       | `top_customers`     |
//! | `STAGEFLOW_TOP_ITEMS`           | `top_items`         |
//!
//! Worker counts are read once at startup; nothing rebalances later.

use crate::error::StageError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

pub const ENV_PREFIX: &str = "STAGEFLOW_";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest number of rows in one emitted message.
    pub max_batch_size: usize,
    /// Instances per stage unless `workers` says otherwise.
    pub default_workers: usize,
    /// Per-stage instance counts, by stage name.
    pub workers: BTreeMap<String, usize>,
    /// Queue the result kinds are delivered to.
    pub results_queue: String,
    /// K of the most-frequent-customers query.
    pub top_customers: usize,
    /// K of the best-selling-items queries.
    pub top_items: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            default_workers: num_cpus::get().clamp(1, 4),
            workers: BTreeMap::new(),
            results_queue: "results".to_string(),
            top_customers: 3,
            top_items: 1,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with a JSON file.
    ///
    /// # Errors
    /// The file cannot be read or is not a valid configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// File (if any), then the process environment, then [`validate`](Self::validate).
    ///
    /// # Errors
    /// Unreadable file, unparsable override, or an invalid result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay `STAGEFLOW_*` variables of the current process.
    ///
    /// # Errors
    /// A recognised variable holds an unparsable value.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Overlay `STAGEFLOW_*` pairs from any source. Unknown keys are ignored.
    ///
    /// # Errors
    /// A recognised key holds an unparsable value.
    pub fn apply_overrides<K, V>(&mut self, vars: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "MAX_BATCH_SIZE" => self.max_batch_size = parse_var(key, value)?,
                "DEFAULT_WORKERS" => self.default_workers = parse_var(key, value)?,
                "RESULTS_QUEUE" => self.results_queue = value.to_string(),
                "TOP_CUSTOMERS" => self.top_customers = parse_var(key, value)?,
                "TOP_ITEMS" => self.top_items = parse_var(key, value)?,
                other => {
                    if let Some(stage) = other.strip_prefix("WORKERS_") {
                        self.workers
                            .insert(stage.to_ascii_lowercase(), parse_var(key, value)?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Instances to run for `stage`.
    #[must_use]
    pub fn workers_for(&self, stage: &str) -> usize {
        self.workers
            .get(stage)
            .copied()
            .unwrap_or(self.default_workers)
    }

    /// # Errors
    /// [`StageError::Config`] for a zero batch size, worker count or K, or an
    /// empty results queue name.
    pub fn validate(&self) -> std::result::Result<(), StageError> {
        if self.max_batch_size == 0 {
            return Err(StageError::config("max_batch_size must be at least 1"));
        }
        if self.default_workers == 0 {
            return Err(StageError::config("default_workers must be at least 1"));
        }
        if let Some((stage, _)) = self.workers.iter().find(|(_, n)| **n == 0) {
            return Err(StageError::config(format!("stage `{stage}` needs at least 1 worker")));
        }
        if self.top_customers == 0 || self.top_items == 0 {
            return Err(StageError::config("top-k sizes must be at least 1"));
        }
        if self.results_queue.is_empty() {
            return Err(StageError::config("results_queue must not be empty"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key}={value:?} is not a valid value"))
}
