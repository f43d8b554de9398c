//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the scheduler, reachability monitor and retention purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Concurrent in-flight uploads during a drain pass.
    pub max_in_flight: usize,
    /// Per-attempt upload timeout in seconds. A timed-out attempt returns
    /// the record to the queue; it is never force-aborted mid-write.
    pub attempt_timeout_secs: u64,
    /// Coarse periodic safety-net tick, in seconds.
    pub tick_interval_secs: u64,
    /// Maximum jitter added to the periodic tick, in seconds.
    pub tick_jitter_secs: u64,
    /// Minimum interval between liveness probes, in seconds.
    pub probe_min_interval_secs: u64,
    /// Days a synced record is kept locally before the retention purge.
    pub retention_days: i64,
    /// Queue records immediately at creation instead of waiting for an
    /// explicit submit.
    pub auto_queue: bool,
    /// Maximum records pulled per drain batch.
    pub drain_batch: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 3,
            attempt_timeout_secs: 15,
            tick_interval_secs: 300,
            tick_jitter_secs: 5,
            probe_min_interval_secs: 10,
            retention_days: 30,
            auto_queue: false,
            drain_batch: 100,
        }
    }
}

impl EngineConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn probe_min_interval(&self) -> Duration {
        Duration::from_secs(self.probe_min_interval_secs)
    }

    pub fn retention_cutoff(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        now - chrono::Duration::days(self.retention_days)
    }
}
