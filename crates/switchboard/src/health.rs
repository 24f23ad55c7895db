//! Per-model health scoring.
//!
//! Each model accumulates a failure score from penalized outcomes; the score
//! decays linearly with wall time and collapses on success (snap-back). The
//! adaptive candidate strategy samples by the derived weight. Scores survive
//! restarts through a versioned JSON snapshot written by a single debounced
//! writer task.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::FailureKind;

/// Multiplicative score drop on a successful call.
const SNAP_BACK_FACTOR: f64 = 0.2;

/// Display/weight steepness constant.
const SCORE_K: f64 = 0.2;

/// Weights below this are treated as zero by the adaptive selector.
pub const WEIGHT_FLOOR: f64 = 1e-6;

const STATS_SCHEMA_VERSION: u32 = 1;

/// Debounce window for snapshot writes.
const PERSIST_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub success: u64,
    pub failures: u64,
    pub failure_score: f64,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<FailureKind>,
}

impl ModelStats {
    fn new() -> Self {
        Self {
            success: 0,
            failures: 0,
            failure_score: 0.0,
            last_update: Utc::now(),
            last_error_kind: None,
        }
    }

    /// Apply linear time decay up to `now`, clamped at zero.
    fn decay(&mut self, now: DateTime<Utc>, decay_rate: f64) {
        let minutes = (now - self.last_update).num_milliseconds().max(0) as f64 / 60_000.0;
        self.failure_score = (self.failure_score - decay_rate * minutes).max(0.0);
        self.last_update = now;
    }

    /// Health for display, in percent.
    pub fn health_percent(&self) -> u32 {
        (100.0 / (1.0 + self.failure_score * SCORE_K)).round() as u32
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StatsFile {
    version: u32,
    models: BTreeMap<String, ModelStats>,
}

/// Shared, concurrency-safe registry of model stats.
///
/// Entries are created lazily on first reference and mutated under the map's
/// per-shard locks, so concurrent `on_success`/`on_failure` calls never lose
/// counts.
pub struct HealthRegistry {
    stats: DashMap<String, ModelStats>,
    decay_rate: f64,
    dirty: Notify,
}

impl HealthRegistry {
    pub fn new(decay_rate: f64) -> Self {
        Self {
            stats: DashMap::new(),
            decay_rate,
            dirty: Notify::new(),
        }
    }

    /// Load a persisted snapshot. Any load failure starts empty.
    pub fn load(path: &Path, decay_rate: f64) -> Self {
        let registry = Self::new(decay_rate);
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<StatsFile>(&raw) {
                Ok(file) if file.version == STATS_SCHEMA_VERSION => {
                    for (key, stats) in file.models {
                        registry.stats.insert(key, stats);
                    }
                }
                Ok(file) => {
                    warn!(
                        "model stats schema v{} != v{STATS_SCHEMA_VERSION}, starting fresh",
                        file.version
                    );
                }
                Err(e) => warn!("failed to parse {}: {e}, starting fresh", path.display()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to read {}: {e}, starting fresh", path.display()),
        }
        registry
    }

    pub fn on_success(&self, model: &str) {
        let mut entry = self
            .stats
            .entry(model.to_string())
            .or_insert_with(ModelStats::new);
        entry.success += 1;
        entry.failure_score = (entry.failure_score * SNAP_BACK_FACTOR).max(0.0);
        entry.last_update = Utc::now();
        drop(entry);
        self.dirty.notify_one();
    }

    pub fn on_failure(&self, model: &str, kind: FailureKind) {
        let now = Utc::now();
        let decay_rate = self.decay_rate;
        let mut entry = self
            .stats
            .entry(model.to_string())
            .or_insert_with(ModelStats::new);
        entry.decay(now, decay_rate);
        entry.failures += 1;
        entry.failure_score += kind.penalty();
        entry.last_error_kind = Some(kind);
        drop(entry);
        self.dirty.notify_one();
    }

    /// Current failure score, decayed to now.
    pub fn score(&self, model: &str) -> f64 {
        let now = Utc::now();
        let decay_rate = self.decay_rate;
        let mut entry = self
            .stats
            .entry(model.to_string())
            .or_insert_with(ModelStats::new);
        entry.decay(now, decay_rate);
        entry.failure_score
    }

    /// Sampling weight in (0, 1] for the adaptive strategy.
    pub fn weight(&self, model: &str) -> f64 {
        1.0 / (1.0 + self.score(model) * SCORE_K)
    }

    /// Snapshot of all tracked models, decayed to now.
    pub fn snapshot(&self) -> BTreeMap<String, ModelStats> {
        let now = Utc::now();
        let decay_rate = self.decay_rate;
        self.stats
            .iter_mut()
            .map(|mut entry| {
                entry.decay(now, decay_rate);
                (entry.key().clone(), entry.value().clone())
            })
            .collect()
    }

    /// Drop stats for models no longer present in any pool.
    pub fn retain_models<F: Fn(&str) -> bool>(&self, keep: F) {
        self.stats.retain(|key, _| keep(key));
    }

    /// Write the snapshot atomically (temp file + rename).
    pub async fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let file = StatsFile {
            version: STATS_SCHEMA_VERSION,
            models: self.snapshot(),
        };
        let raw = serde_json::to_vec_pretty(&file)?;
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("persisted {} model stats to {}", file.models.len(), path.display());
        Ok(())
    }

    /// Single writer task: coalesces bursts of updates into one write per
    /// debounce window.
    pub fn spawn_persister(self: Arc<Self>, path: PathBuf) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            loop {
                registry.dirty.notified().await;
                tokio::time::sleep(PERSIST_DEBOUNCE).await;
                if let Err(e) = registry.persist(&path).await {
                    warn!("failed to persist model stats: {e}");
                }
            }
        })
    }

    #[cfg(test)]
    fn set_last_update(&self, model: &str, when: DateTime<Utc>) {
        if let Some(mut entry) = self.stats.get_mut(model) {
            entry.last_update = when;
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
