//! Configuration for the GPU session shopper control plane.
//!
//! Two layers: [`Settings`] is the typed, file-backed record every
//! component loads at startup; [`ConfigStore`] is a runtime key-value
//! override store for operator-facing tuning that shouldn't require a
//! redeploy (e.g. per-provider knobs).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use shopper_kv::JsonStore;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("parse {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
    #[error("write {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ─────────────────────────────────────────────────────────────
// Settings — typed, file-backed, loaded once at startup
// ─────────────────────────────────────────────────────────────

/// The control plane's startup configuration record. One documented
/// default per field; see each field's default_* function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum session lifetime before the Lifecycle Manager force-destroys it.
    #[serde(default = "default_hard_max_hours")]
    pub hard_max_hours: u64,

    /// Grace window past `expires_at` before a running session is flagged orphaned.
    #[serde(default = "default_orphan_grace_period_secs")]
    pub orphan_grace_period_secs: u64,

    /// How long a session may sit in `provisioning`/`stopping` before being failed.
    #[serde(default = "default_stuck_session_timeout_secs")]
    pub stuck_session_timeout_secs: u64,

    /// Lifecycle Manager tick interval.
    #[serde(default = "default_lifecycle_interval_secs")]
    pub lifecycle_interval_secs: u64,

    /// Reconciler sweep interval.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Whether the Reconciler destroys orphans directly, or only alerts.
    #[serde(default)]
    pub auto_destroy_orphans: bool,

    /// Identifies this deployment's instances among others at the same provider account.
    #[serde(default)]
    pub deployment_id: Option<String>,

    /// Minimum interval between requests to a single provider adapter.
    #[serde(default = "default_rate_limit_min_interval_ms")]
    pub rate_limit_min_interval_ms: u64,

    /// Consecutive counted failures before a provider's circuit breaker opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Base cooldown before a tripped circuit breaker half-opens.
    #[serde(default = "default_circuit_reset_timeout_secs")]
    pub circuit_reset_timeout_secs: u64,

    /// Ceiling on the circuit breaker's exponential backoff.
    #[serde(default = "default_circuit_max_backoff_secs")]
    pub circuit_max_backoff_secs: u64,

    /// Inactivity window after which per-location success-rate stats reset.
    #[serde(default = "default_location_stats_decay_secs")]
    pub location_stats_decay_secs: u64,

    /// Floor applied to a location's computed availability confidence.
    #[serde(default = "default_location_min_confidence")]
    pub location_min_confidence: f64,

    /// Prior confidence assigned to a location with no recorded attempts.
    #[serde(default = "default_location_default_confidence")]
    pub location_default_confidence: f64,

    /// How often running sessions are priced into a cost record for the
    /// current hour bucket.
    #[serde(default = "default_cost_accrual_interval_secs")]
    pub cost_accrual_interval_secs: u64,
}

fn default_hard_max_hours() -> u64 {
    12
}
fn default_orphan_grace_period_secs() -> u64 {
    900
}
fn default_stuck_session_timeout_secs() -> u64 {
    600
}
fn default_lifecycle_interval_secs() -> u64 {
    60
}
fn default_reconcile_interval_secs() -> u64 {
    300
}
fn default_rate_limit_min_interval_ms() -> u64 {
    1000
}
fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_reset_timeout_secs() -> u64 {
    30
}
fn default_circuit_max_backoff_secs() -> u64 {
    120
}
fn default_location_stats_decay_secs() -> u64 {
    3600
}
fn default_location_min_confidence() -> f64 {
    0.05
}
fn default_location_default_confidence() -> f64 {
    0.5
}
fn default_cost_accrual_interval_secs() -> u64 {
    3600
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hard_max_hours: default_hard_max_hours(),
            orphan_grace_period_secs: default_orphan_grace_period_secs(),
            stuck_session_timeout_secs: default_stuck_session_timeout_secs(),
            lifecycle_interval_secs: default_lifecycle_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            auto_destroy_orphans: false,
            deployment_id: None,
            rate_limit_min_interval_ms: default_rate_limit_min_interval_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout_secs: default_circuit_reset_timeout_secs(),
            circuit_max_backoff_secs: default_circuit_max_backoff_secs(),
            location_stats_decay_secs: default_location_stats_decay_secs(),
            location_min_confidence: default_location_min_confidence(),
            location_default_confidence: default_location_default_confidence(),
            cost_accrual_interval_secs: default_cost_accrual_interval_secs(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read { path: path.display().to_string(), source: e })?;
        serde_json::from_str(&data).map_err(|e| ConfigError::Parse { path: path.display().to_string(), source: e })
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write { path: path.display().to_string(), source: e })?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).map_err(|e| ConfigError::Write { path: path.display().to_string(), source: e })?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
// ConfigStore — runtime KV overrides
// ─────────────────────────────────────────────────────────────

/// A configuration override entry (plain key-value data, no encryption).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub data: HashMap<String, String>,
    pub immutable: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// In-memory named-override store backed by JSON snapshots, for operator
/// tuning that should be mutable without a redeploy (e.g. per-provider
/// knobs). [`Settings`] remains the source of truth for everything else.
pub struct ConfigStore {
    configs: HashMap<String, ConfigEntry>,
    store: JsonStore,
}

impl ConfigStore {
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "configs");
        let configs = store.load();
        debug!(count = configs.len(), "loaded configs from disk");
        Self { configs, store }
    }

    pub fn create(&mut self, name: String, data: HashMap<String, String>, immutable: bool) -> Result<(), String> {
        if self.configs.contains_key(&name) {
            return Err(format!("config '{name}' already exists"));
        }
        let now = chrono::Utc::now();
        self.configs.insert(name, ConfigEntry { data, immutable, created_at: now, updated_at: now });
        self.snapshot();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ConfigEntry> {
        self.configs.get(name)
    }

    pub fn update(&mut self, name: &str, data: HashMap<String, String>) -> Result<(), String> {
        let entry = self.configs.get_mut(name).ok_or_else(|| format!("config '{name}' not found"))?;
        if entry.immutable {
            return Err(format!("config '{name}' is immutable"));
        }
        entry.data = data;
        entry.updated_at = chrono::Utc::now();
        self.snapshot();
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<(), String> {
        if self.configs.remove(name).is_none() {
            return Err(format!("config '{name}' not found"));
        }
        self.snapshot();
        Ok(())
    }

    pub fn list(&self, prefix: Option<&str>) -> Vec<(&str, &ConfigEntry)> {
        self.configs.iter().filter(|(k, _)| prefix.is_none() || k.starts_with(prefix.unwrap_or(""))).map(|(k, v)| (k.as_str(), v)).collect()
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.configs) {
            warn!(error = %e, "failed to snapshot config store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.hard_max_hours, 12);
        assert_eq!(s.orphan_grace_period_secs, 900);
        assert_eq!(s.stuck_session_timeout_secs, 600);
        assert_eq!(s.lifecycle_interval_secs, 60);
        assert_eq!(s.reconcile_interval_secs, 300);
        assert!(!s.auto_destroy_orphans);
        assert_eq!(s.deployment_id, None);
        assert_eq!(s.rate_limit_min_interval_ms, 1000);
        assert_eq!(s.circuit_failure_threshold, 5);
        assert_eq!(s.circuit_reset_timeout_secs, 30);
        assert_eq!(s.circuit_max_backoff_secs, 120);
        assert_eq!(s.location_stats_decay_secs, 3600);
        assert!((s.location_min_confidence - 0.05).abs() < 1e-9);
        assert!((s.location_default_confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.auto_destroy_orphans = true;
        settings.deployment_id = Some("prod-us-east".to_string());
        settings.save(&path).expect("save");

        let loaded = Settings::load(&path).expect("load");
        assert!(loaded.auto_destroy_orphans);
        assert_eq!(loaded.deployment_id.as_deref(), Some("prod-us-east"));
        assert_eq!(loaded.hard_max_hours, 12);
    }

    #[test]
    fn test_settings_load_missing_field_falls_back_to_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"hard_max_hours": 24}"#).expect("write");

        let loaded = Settings::load(&path).expect("load");
        assert_eq!(loaded.hard_max_hours, 24);
        assert_eq!(loaded.lifecycle_interval_secs, 60);
    }

    #[test]
    fn test_settings_load_missing_file_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("does-not-exist.json");
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn test_config_store_crud() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = ConfigStore::new(dir.path());

        let mut data = HashMap::new();
        data.insert("key1".to_string(), "value1".to_string());
        store.create("test-config".to_string(), data, false).expect("create");

        let entry = store.get("test-config").expect("get");
        assert_eq!(entry.data.get("key1").unwrap(), "value1");

        let mut new_data = HashMap::new();
        new_data.insert("key1".to_string(), "updated".to_string());
        store.update("test-config", new_data).expect("update");

        store.delete("test-config").expect("delete");
        assert!(store.get("test-config").is_none());
    }

    #[test]
    fn test_config_store_immutable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = ConfigStore::new(dir.path());

        let mut data = HashMap::new();
        data.insert("key".to_string(), "val".to_string());
        store.create("immutable-cfg".to_string(), data, true).expect("create");

        let result = store.update("immutable-cfg", HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_config_store_persistence() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut store = ConfigStore::new(dir.path());
            let mut data = HashMap::new();
            data.insert("db_host".to_string(), "localhost".to_string());
            store.create("db-config".to_string(), data, false).expect("create");
        }
        {
            let store = ConfigStore::new(dir.path());
            let entry = store.get("db-config").expect("get after reload");
            assert_eq!(entry.data.get("db_host").unwrap(), "localhost");
        }
    }

    #[test]
    fn test_config_store_prefix_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = ConfigStore::new(dir.path());

        store.create("app.db".to_string(), HashMap::new(), false).expect("create");
        store.create("app.cache".to_string(), HashMap::new(), false).expect("create");
        store.create("sys.network".to_string(), HashMap::new(), false).expect("create");

        assert_eq!(store.list(Some("app.")).len(), 2);
        assert_eq!(store.list(Some("sys.")).len(), 1);
        assert_eq!(store.list(None).len(), 3);
    }
}
