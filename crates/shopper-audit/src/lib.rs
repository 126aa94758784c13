//! Immutable append-only audit trail with SHA-256 chain hashing (§6.3).
//!
//! Every destructive control-plane action (destroying a session, fixing a
//! ghost instance) must be logged here before executing. Records are
//! cryptographically chained — tampering with any record breaks the chain.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shopper_kv::JsonStore;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    LifecycleManager,
    Reconciler,
    Destroyer,
    ProviderAdapter,
    System,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LifecycleManager => "lifecycle_manager",
            Self::Reconciler => "reconciler",
            Self::Destroyer => "destroyer",
            Self::ProviderAdapter => "provider_adapter",
            Self::System => "system",
        };
        write!(f, "{s}")
    }
}

/// The eight operations §6.3 requires audited (one-to-one with the audit
/// events also emitted as structured `tracing` events at the call site).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ProvisionStarted,
    HardMaxEnforced,
    SessionExpired,
    OrphanDetected,
    OrphanDestroyed,
    GhostDetected,
    GhostFixed,
    StuckSessionFailed,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", serde_json::to_value(self).unwrap_or_default().as_str().unwrap_or("unknown"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Session,
    Provider,
    Consumer,
    Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub component: Component,
    pub action: AuditAction,
    pub target_type: TargetType,
    pub target_id: String,
    pub parameters: serde_json::Value,
    pub result: AuditResult,
    /// SHA-256 hex of previous record (empty string for first record).
    pub previous_hash: String,
    /// SHA-256 hex of this record's canonical JSON.
    pub record_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub success: bool,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

// ─── AuditLogger ─────────────────────────────────────────────────────────────

pub struct AuditLogger {
    records: HashMap<String, AuditRecord>,
    store: JsonStore,
    last_hash: String,
}

impl AuditLogger {
    /// Create or load the audit logger from disk.
    ///
    /// All destructive provider-adapter calls MUST be logged before execution.
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "audit_chain");
        let records: HashMap<String, AuditRecord> = store.load();

        let last_hash = records.values().max_by_key(|r| r.timestamp).map(|r| r.record_hash.clone()).unwrap_or_default();

        info!(record_count = records.len(), last_hash = %last_hash, "audit logger initialized");
        Self { records, store, last_hash }
    }

    /// Append a new audit record. Returns the record hash.
    ///
    /// This is the primary API — call this BEFORE executing any destructive action.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        component: Component,
        action: AuditAction,
        target_type: TargetType,
        target_id: &str,
        parameters: serde_json::Value,
        result: AuditResult,
        correlation_id: Option<Uuid>,
    ) -> String {
        let record_id = Uuid::new_v4();
        let timestamp = Utc::now();

        let canonical = serde_json::json!({
            "record_id": record_id,
            "timestamp": timestamp,
            "component": component,
            "action": action,
            "target_type": target_type,
            "target_id": target_id,
            "parameters": parameters,
            "result": result,
            "previous_hash": self.last_hash,
        });

        let record_hash = sha256_hex(&canonical.to_string());

        let record = AuditRecord {
            record_id,
            correlation_id,
            timestamp,
            component,
            action,
            target_type,
            target_id: target_id.to_string(),
            parameters,
            result,
            previous_hash: self.last_hash.clone(),
            record_hash: record_hash.clone(),
        };

        info!(record_id = %record_id, component = %component, action = %action, target = %target_id, "audit record appended");

        self.last_hash = record_hash.clone();
        self.records.insert(record_id.to_string(), record);
        self.snapshot();

        record_hash
    }

    /// Query audit records with filters.
    pub fn query(&self, target_id: Option<&str>, component: Option<Component>, action: Option<AuditAction>, limit: usize) -> Vec<&AuditRecord> {
        let mut results: Vec<&AuditRecord> = self
            .records
            .values()
            .filter(|r| {
                if target_id.is_some_and(|tid| !r.target_id.contains(tid) && !r.parameters.to_string().contains(tid)) {
                    return false;
                }
                if component.is_some_and(|c| r.component != c) {
                    return false;
                }
                if action.is_some_and(|act| r.action != act) {
                    return false;
                }
                true
            })
            .collect();

        results.sort_by_key(|r| std::cmp::Reverse(r.timestamp));
        results.truncate(limit);
        results
    }

    /// Verify the integrity of the audit chain.
    /// Returns `true` if chain is intact, `false` if tampered.
    pub fn verify_chain(&self) -> bool {
        let mut sorted: Vec<&AuditRecord> = self.records.values().collect();
        sorted.sort_by_key(|r| r.timestamp);

        let mut prev_hash = String::new();
        for record in sorted {
            if record.previous_hash != prev_hash {
                warn!(record_id = %record.record_id, expected = %prev_hash, got = %record.previous_hash, "chain integrity violation");
                return false;
            }
            prev_hash = record.record_hash.clone();
        }
        true
    }

    fn snapshot(&self) {
        if let Err(e) = self.store.save(&self.records) {
            warn!(error = %e, "failed to snapshot audit chain");
        }
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
