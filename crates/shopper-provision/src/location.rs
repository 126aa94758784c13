//! Per-location dynamic availability scoring (§3 LocationStats, §4.1).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Entry {
    attempts: u64,
    successes: u64,
    last_attempt_at: DateTime<Utc>,
}

pub struct LocationStatsConfig {
    pub min_confidence: f64,
    pub default_confidence: f64,
    pub decay: Duration,
}

impl Default for LocationStatsConfig {
    fn default() -> Self {
        Self { min_confidence: 0.05, default_confidence: 0.5, decay: Duration::from_secs(3600) }
    }
}

/// Rolling per-location `(attempts, successes)` used to score offers'
/// `availability_confidence`. Resets a location's counters after an
/// inactivity window (`decay`).
pub struct LocationStats {
    config: LocationStatsConfig,
    entries: RwLock<HashMap<String, Entry>>,
    now: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl LocationStats {
    pub fn new(config: LocationStatsConfig) -> Self {
        Self::with_clock(config, Utc::now)
    }

    pub fn with_clock(config: LocationStatsConfig, now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self { config, entries: RwLock::new(HashMap::new()), now: Box::new(now) }
    }

    /// Record the outcome of a creation attempt at `location_id`.
    pub fn record(&self, location_id: &str, success: bool) {
        let now = (self.now)();
        let mut entries = self.entries.write();
        self.decay_if_stale(&mut entries, location_id, now);
        let entry = entries.entry(location_id.to_string()).or_insert(Entry { attempts: 0, successes: 0, last_attempt_at: now });
        entry.attempts += 1;
        if success {
            entry.successes += 1;
        }
        entry.last_attempt_at = now;
    }

    /// `successes/attempts` clamped to `[min_confidence, 1.0]`; unknown
    /// locations return the provider's configured default.
    pub fn confidence(&self, location_id: &str) -> f64 {
        let now = (self.now)();
        let mut entries = self.entries.write();
        self.decay_if_stale(&mut entries, location_id, now);
        match entries.get(location_id) {
            Some(entry) if entry.attempts > 0 => {
                let raw = entry.successes as f64 / entry.attempts as f64;
                raw.clamp(self.config.min_confidence, 1.0)
            }
            _ => self.config.default_confidence,
        }
    }

    fn decay_if_stale(&self, entries: &mut HashMap<String, Entry>, location_id: &str, now: DateTime<Utc>) {
        if let Some(entry) = entries.get(location_id) {
            let inactive_for = now - entry.last_attempt_at;
            if inactive_for.to_std().unwrap_or_default() >= self.config.decay {
                entries.remove(location_id);
            }
        }
    }
}
