//! The narrow destroy-session interface shared by the Lifecycle Manager and
//! the Reconciler (§4.6). Neither component deletes a session's provider
//! instance directly — both route through here so the stopping/stopped
//! transition and the active-session gauge move exactly once per session.
//!
//! Audit entries are the caller's responsibility: `destroy_session` is
//! reused for several distinct audited operations (hard-max enforcement,
//! reservation expiry, orphan destruction), each with its own action name.

use chrono::Utc;
use shopper_observe::Metrics;
use shopper_persist::{SessionStore, StoreError};
use shopper_proto::{sanitize_error, ErrorKind, SessionStatus};
use shopper_provision::ProviderRegistry;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DestroyError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("provider {provider} refused to destroy instance {provider_id}: {message}")]
    ProviderRefused { provider: String, provider_id: String, message: String },
}

pub struct Destroyer {
    store: Arc<dyn SessionStore>,
    registry: Arc<ProviderRegistry>,
    metrics: Arc<Metrics>,
}

impl Destroyer {
    pub fn new(store: Arc<dyn SessionStore>, registry: Arc<ProviderRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { store, registry, metrics }
    }

    /// Idempotent: a session already in a terminal state returns `Ok(())`
    /// without touching the provider.
    pub async fn destroy_session(&self, session_id: &str) -> Result<(), DestroyError> {
        let mut session = self.store.get(session_id).await?.ok_or_else(|| DestroyError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Ok(());
        }

        session.status = SessionStatus::Stopping;
        self.store.update(&session).await?;

        if !session.provider_id.is_empty() {
            if let Some(adapter) = self.registry.get(&session.provider) {
                if let Err(e) = adapter.destroy_instance(&session.provider_id, None).await {
                    if e.kind == ErrorKind::NotFound {
                        // The provider already has no record of this instance — the
                        // destroy already happened, so this recovers locally as success.
                        self.metrics.record_provider_api_call(&session.provider, "destroy_instance", "success");
                    } else {
                        self.metrics.record_provider_api_call(&session.provider, "destroy_instance", "error");
                        self.metrics.record_provider_api_error(&session.provider, "destroy_instance");
                        self.metrics.destroy_failures_total.inc();
                        session.error = sanitize_error(&e.message);
                        self.store.update(&session).await?;
                        return Err(DestroyError::ProviderRefused { provider: session.provider.clone(), provider_id: session.provider_id.clone(), message: e.message });
                    }
                } else {
                    self.metrics.record_provider_api_call(&session.provider, "destroy_instance", "success");
                }
            }
        }

        session.status = SessionStatus::Stopped;
        session.stopped_at = Some(Utc::now());
        self.store.update(&session).await?;
        self.metrics.record_session_destroyed(&session.provider);
        self.metrics.adjust_sessions_active(&session.provider, -1);
        Ok(())
    }
}
