//! Per-instance counters for stage execution.
//!
//! Every running stage instance owns one [`StageMetrics`], registered in a
//! shared [`MetricsRegistry`] under its instance name (`reduce_q3-1`). The
//! counters are plain atomics so the hot path never takes a lock; the registry
//! lock is only held to register an instance or to take a snapshot.
//!
//! Dropped rows (unattributable keys, join misses, failed filters' numeric
//! parses) are counted here rather than raised as errors.
//!
//! # Example
//!
//! ```
//! use stageflow::metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new();
//! let m = registry.register("filter_year-0");
//! m.add_rows_in(10);
//! m.add_rows_out(7);
//!
//! let snap = registry.snapshot();
//! assert_eq!(snap["filter_year-0"]["rows_out"], 7);
//! ```

use anyhow::Result;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Counters of one stage instance.
#[derive(Debug, Default)]
pub struct StageMetrics {
    rows_in: AtomicU64,
    rows_out: AtomicU64,
    rows_dropped: AtomicU64,
    batches_rejected: AtomicU64,
    sessions_closed: AtomicU64,
}

impl StageMetrics {
    pub fn add_rows_in(&self, n: usize) {
        self.rows_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_rows_out(&self, n: usize) {
        self.rows_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: usize) {
        self.rows_dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn rows_in(&self) -> u64 {
        self.rows_in.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rows_out(&self) -> u64 {
        self.rows_out.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rows_dropped(&self) -> u64 {
        self.rows_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn batches_rejected(&self) -> u64 {
        self.batches_rejected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "rows_in": self.rows_in(),
            "rows_out": self.rows_out(),
            "rows_dropped": self.rows_dropped(),
            "batches_rejected": self.batches_rejected(),
            "sessions_closed": self.sessions_closed(),
        })
    }
}

/// Thread-safe registry of every instance's counters.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    stages: BTreeMap<String, Arc<StageMetrics>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // counters stay meaningful after a panicking worker
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Counters for `instance`, created on first use.
    pub fn register(&self, instance: impl Into<String>) -> Arc<StageMetrics> {
        Arc::clone(self.lock().stages.entry(instance.into()).or_default())
    }

    #[must_use]
    pub fn get(&self, instance: &str) -> Option<Arc<StageMetrics>> {
        self.lock().stages.get(instance).cloned()
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Sum of `rows_dropped` over every instance whose name starts with `stage`.
    #[must_use]
    pub fn dropped_for(&self, stage: &str) -> u64 {
        self.lock()
            .stages
            .iter()
            .filter(|(name, _)| name.starts_with(stage))
            .map(|(_, m)| m.rows_dropped())
            .sum()
    }

    /// Every instance's counters, keyed by instance name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock()
            .stages
            .iter()
            .map(|(name, m)| (name.clone(), m.to_json()))
            .collect()
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (name, value) in self.snapshot() {
            out.insert(name, value);
        }
        if let Some(elapsed) = self.elapsed() {
            out.insert("execution_time_ms".to_string(), json!(elapsed.as_millis()));
        }
        Value::Object(out)
    }

    /// Print every instance's counters to stdout.
    pub fn print(&self) {
        println!("\n========== Stage Metrics ==========");
        if let Some(elapsed) = self.elapsed() {
            println!(
                "Execution Time: {:.3}s ({} ms)",
                elapsed.as_secs_f64(),
                elapsed.as_millis()
            );
            println!("-----------------------------------");
        }
        for (name, value) in self.snapshot() {
            println!("{name}: {value}");
        }
        println!("===================================\n");
    }

    /// Write [`to_json`](MetricsRegistry::to_json) to `path`, pretty-printed.
    ///
    /// # Errors
    /// If the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path.as_ref())?;
        file.write_all(formatted.as_bytes())?;
        Ok(())
    }
}
