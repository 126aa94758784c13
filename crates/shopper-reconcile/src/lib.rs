//! Provider/local session reconciliation (C5, §4.5): a periodic two-way
//! diff between what each provider adapter reports and what the session
//! stores believe is true, plus recovery for sessions stuck mid-transition.
//!
//! Orphans (instance on the provider, no local session) and ghosts (local
//! session claims a provider instance that no longer exists) are the two
//! directions of drift this control plane can develop; the Lifecycle
//! Manager only ever detects orphans (§4.4 step 3), never destroys them —
//! that authority lives here.

#![forbid(unsafe_code)]

use chrono::Utc;
use shopper_audit::{AuditAction, AuditLogger, AuditResult, Component, TargetType};
use shopper_lifecycle::Destroyer;
use shopper_observe::Metrics;
use shopper_persist::SessionStore;
use shopper_proto::{sanitize_error, SessionStatus};
use shopper_provision::ProviderRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphans_detected: u32,
    pub orphans_destroyed: u32,
    pub ghosts_detected: u32,
    pub ghosts_fixed: u32,
    pub stuck_recovered: u32,
}

pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    registry: Arc<ProviderRegistry>,
    destroyer: Arc<Destroyer>,
    audit: Arc<parking_lot::Mutex<AuditLogger>>,
    metrics: Arc<Metrics>,
    auto_destroy_orphans: bool,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<ProviderRegistry>,
        destroyer: Arc<Destroyer>,
        audit: Arc<parking_lot::Mutex<AuditLogger>>,
        metrics: Arc<Metrics>,
        auto_destroy_orphans: bool,
    ) -> Self {
        Self { store, registry, destroyer, audit, metrics, auto_destroy_orphans }
    }

    /// Run one full reconciliation pass across every registered provider.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for provider in self.registry.names() {
            self.reconcile_provider(provider, &mut report).await;
        }
        report
    }

    async fn reconcile_provider(&self, provider: &str, report: &mut ReconcileReport) {
        let Some(adapter) = self.registry.get(provider) else { return };

        let provider_instances = match adapter.list_all_instances(None).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(provider, error = %e, "reconcile: failed to list provider instances");
                return;
            }
        };
        let provider_map: HashMap<&str, _> = provider_instances.iter().map(|i| (i.id.as_str(), i)).collect();

        let local_sessions = match self.store.get_active_sessions_by_provider(provider).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(provider, error = %e, "reconcile: failed to load local sessions");
                return;
            }
        };
        let local_by_provider_id: HashMap<&str, _> = local_sessions.iter().filter(|s| !s.provider_id.is_empty()).map(|s| (s.provider_id.as_str(), s)).collect();

        // Orphans: on the provider, unknown to this control plane.
        for instance in &provider_instances {
            if local_by_provider_id.contains_key(instance.id.as_str()) {
                continue;
            }
            report.orphans_detected += 1;
            self.metrics.orphans_detected_total.inc();
            self.audit.lock().append(
                Component::Reconciler,
                AuditAction::OrphanDetected,
                TargetType::Provider,
                &instance.id,
                serde_json::json!({"provider": provider, "label": instance.label}),
                AuditResult { success: true, message: "instance on provider has no local session".to_string(), details: None },
                None,
            );
            warn!(provider, instance = %instance.id, "orphan detected");

            if self.auto_destroy_orphans {
                // No local row exists, so there is nothing for the shared
                // Destroyer to transition — go straight to the adapter.
                match adapter.destroy_instance(&instance.id, None).await {
                    Ok(()) => {
                        report.orphans_destroyed += 1;
                        self.metrics.orphans_destroyed_total.inc();
                        self.audit.lock().append(
                            Component::Reconciler,
                            AuditAction::OrphanDestroyed,
                            TargetType::Provider,
                            &instance.id,
                            serde_json::json!({"provider": provider}),
                            AuditResult { success: true, message: "orphan destroyed".to_string(), details: None },
                            None,
                        );
                    }
                    Err(e) => warn!(provider, instance = %instance.id, error = %e, "failed to destroy orphan"),
                }
            }
        }

        // Ghosts: a running/provisioning local session whose provider
        // instance no longer exists.
        for session in &local_sessions {
            if !matches!(session.status, SessionStatus::Running | SessionStatus::Provisioning) {
                continue;
            }
            if provider_map.contains_key(session.provider_id.as_str()) {
                continue;
            }
            report.ghosts_detected += 1;
            self.metrics.ghosts_detected_total.inc();
            self.audit.lock().append(
                Component::Reconciler,
                AuditAction::GhostDetected,
                TargetType::Session,
                &session.id,
                serde_json::json!({"provider_id": session.provider_id}),
                AuditResult { success: true, message: "local session's provider instance not found".to_string(), details: None },
                None,
            );
            warn!(session = %session.id, provider, "ghost detected");

            let mut session = (*session).clone();
            session.status = SessionStatus::Stopped;
            session.error = sanitize_error("Instance not found on provider during reconciliation");
            session.stopped_at = Some(Utc::now());
            match self.store.update(&session).await {
                Ok(()) => {
                    report.ghosts_fixed += 1;
                    self.metrics.ghosts_fixed_total.inc();
                    self.metrics.adjust_sessions_active(provider, -1);
                    self.audit.lock().append(
                        Component::Reconciler,
                        AuditAction::GhostFixed,
                        TargetType::Session,
                        &session.id,
                        serde_json::json!({}),
                        AuditResult { success: true, message: "session marked stopped".to_string(), details: None },
                        None,
                    );
                }
                Err(e) => warn!(session = %session.id, error = %e, "failed to persist ghost fix"),
            }
        }
    }

    /// Recover sessions stuck mid-transition by checking ground truth on
    /// the provider rather than assuming (§4.5). A `Provisioning` session
    /// whose instance is actually running is promoted; one whose instance
    /// is gone is failed. A `Stopping` session is simply handed back to
    /// the shared [`Destroyer`] to retry.
    pub async fn recover_stuck_sessions(&self) -> u32 {
        let mut recovered = 0;
        let sessions = match self.store.get_sessions_by_status(&[SessionStatus::Provisioning, SessionStatus::Stopping]).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "recover_stuck_sessions: failed to load transitional sessions");
                return 0;
            }
        };

        for mut session in sessions {
            if session.provider_id.is_empty() {
                continue;
            }
            let Some(adapter) = self.registry.get(&session.provider) else { continue };

            match session.status {
                SessionStatus::Stopping => {
                    if self.destroyer.destroy_session(&session.id).await.is_ok() {
                        recovered += 1;
                    }
                }
                SessionStatus::Provisioning => match adapter.get_instance_status(&session.provider_id, None).await {
                    Ok(status) if status.running => {
                        session.status = SessionStatus::Running;
                        session.ssh_host = status.ssh_host;
                        session.ssh_port = status.ssh_external_port();
                        session.ssh_user = status.ssh_user;
                        if self.store.update(&session).await.is_ok() {
                            info!(session = %session.id, "recovered stuck provisioning session to running");
                            recovered += 1;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        session.status = SessionStatus::Failed;
                        session.error = sanitize_error(&format!("instance not found on provider during recovery: {e}"));
                        session.stopped_at = Some(Utc::now());
                        if self.store.update(&session).await.is_ok() {
                            self.metrics.adjust_sessions_active(&session.provider, -1);
                            recovered += 1;
                        }
                    }
                },
                _ => {}
            }
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopper_persist::SqliteSessionStore;
    use shopper_proto::Session;
    use shopper_provision::mock::MockAdapter;
    use shopper_provision::{CreateInstanceRequest, InstanceStatus};
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::tempdir;

    async fn memory_store() -> Arc<dyn SessionStore> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("../shopper-persist/migrations").run(&pool).await.unwrap();
        Arc::new(SqliteSessionStore::from_pool(pool))
    }

    fn audit_logger() -> Arc<parking_lot::Mutex<AuditLogger>> {
        let dir = tempdir().unwrap();
        Arc::new(parking_lot::Mutex::new(AuditLogger::new(dir.path())))
    }

    fn sample_session(id: &str, status: SessionStatus, provider_id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            consumer_id: "c1".to_string(),
            provider: "tensordock".to_string(),
            provider_id: provider_id.to_string(),
            offer_id: "tensordock-loc-RTX4090".to_string(),
            gpu_type: "RTX4090".to_string(),
            gpu_count: 1,
            price_per_hour: 0.4,
            workload_type: "training".to_string(),
            storage_policy: "ephemeral".to_string(),
            status,
            reservation_hours: 4,
            created_at: now,
            expires_at: now + chrono::Duration::hours(4),
            stopped_at: None,
            hard_max_override: false,
            ssh_host: String::new(),
            ssh_port: 0,
            ssh_user: String::new(),
            error: String::new(),
        }
    }

    fn reconciler(store: Arc<dyn SessionStore>, registry: Arc<ProviderRegistry>, auto_destroy: bool) -> Reconciler {
        let destroyer = Arc::new(Destroyer::new(store.clone(), registry.clone(), Arc::new(Metrics::new())));
        Reconciler::new(store, registry, destroyer, audit_logger(), Arc::new(Metrics::new()), auto_destroy)
    }

    #[tokio::test]
    async fn test_reconcile_detects_orphan_without_destroying() {
        let store = memory_store().await;
        let adapter = MockAdapter::new("tensordock");
        adapter.inject_instance("mock-orphan", "shopper-unknown", InstanceStatus { status: "running".to_string(), running: true, ..Default::default() });
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(adapter));
        let registry = Arc::new(registry);

        let r = reconciler(store, registry.clone(), false);
        let report = r.reconcile().await;
        assert_eq!(report.orphans_detected, 1);
        assert_eq!(report.orphans_destroyed, 0);
        assert!(registry.get("tensordock").unwrap().list_all_instances(None).await.unwrap().iter().any(|i| i.id == "mock-orphan"));
    }

    #[tokio::test]
    async fn test_reconcile_auto_destroys_orphan_when_enabled() {
        let store = memory_store().await;
        let adapter = MockAdapter::new("tensordock");
        adapter.inject_instance("mock-orphan", "shopper-unknown", InstanceStatus { status: "running".to_string(), running: true, ..Default::default() });
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(adapter));
        let registry = Arc::new(registry);

        let r = reconciler(store, registry.clone(), true);
        let report = r.reconcile().await;
        assert_eq!(report.orphans_destroyed, 1);
        assert!(registry.get("tensordock").unwrap().list_all_instances(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_detects_and_fixes_ghost() {
        let store = memory_store().await;
        let session = sample_session("sess-ghost", SessionStatus::Running, "mock-gone");
        store.create(&session).await.unwrap();

        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(MockAdapter::new("tensordock")));
        let registry = Arc::new(registry);

        let r = reconciler(store.clone(), registry, false);
        let report = r.reconcile().await;
        assert_eq!(report.ghosts_detected, 1);
        assert_eq!(report.ghosts_fixed, 1);

        let reloaded = store.get("sess-ghost").await.unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Stopped);
        assert!(!reloaded.error.is_empty());
    }

    #[tokio::test]
    async fn test_recover_stuck_provisioning_promotes_to_running() {
        let store = memory_store().await;
        let adapter = MockAdapter::new("tensordock");
        let info = adapter.create_instance(&CreateInstanceRequest { offer_id: "tensordock-loc-RTX4090".to_string(), ssh_public_key: None, tags: Default::default() }, None).await.unwrap();

        let session = sample_session("sess-stuck", SessionStatus::Provisioning, &info.provider_id);
        store.create(&session).await.unwrap();

        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(adapter));
        let registry = Arc::new(registry);

        let r = reconciler(store.clone(), registry, false);
        let recovered = r.recover_stuck_sessions().await;
        assert_eq!(recovered, 1);
        let reloaded = store.get("sess-stuck").await.unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_recover_stuck_provisioning_fails_when_instance_gone() {
        let store = memory_store().await;
        let session = sample_session("sess-stuck", SessionStatus::Provisioning, "mock-never-existed");
        store.create(&session).await.unwrap();

        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(MockAdapter::new("tensordock")));
        let registry = Arc::new(registry);

        let r = reconciler(store.clone(), registry, false);
        let recovered = r.recover_stuck_sessions().await;
        assert_eq!(recovered, 1);
        let reloaded = store.get("sess-stuck").await.unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Failed);
    }
}
