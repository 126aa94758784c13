//! Lifecycle Manager (C4, §4.4): the periodic tick that drives time-based
//! session policy, plus the interactive operations consumers invoke
//! directly (`signal_done`, `extend_session`, `set_hard_max_override`).

use crate::destroyer::Destroyer;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shopper_audit::{AuditAction, AuditLogger, AuditResult, Component, TargetType};
use shopper_observe::Metrics;
use shopper_persist::{SessionStore, StoreError};
use shopper_proto::{sanitize_error, SessionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("session {0} is in a terminal state")]
    TerminalState(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("extending by {requested_hours}h would exceed the {current_hours}h already reserved plus the hard max")]
    HardMaxExceeded { current_hours: u32, requested_hours: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Destroy(#[from] crate::destroyer::DestroyError),
}

/// Injectable wall clock so every time-based policy is deterministically
/// testable (§4.4 "Time injection").
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub hard_max: ChronoDuration,
    pub orphan_grace_period: ChronoDuration,
    pub stuck_session_timeout: ChronoDuration,
    pub tick_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            hard_max: ChronoDuration::hours(12),
            orphan_grace_period: ChronoDuration::minutes(15),
            stuck_session_timeout: ChronoDuration::minutes(10),
            tick_interval: Duration::from_secs(60),
        }
    }
}

/// One pass's outcome, returned by [`LifecycleManager::tick`] for tests and
/// for the loop's own logging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub hard_max_enforced: u32,
    pub expired: u32,
    pub orphans_detected: u32,
    pub stuck_failed: u32,
}

struct RunState {
    running: bool,
    stop: Option<Arc<Notify>>,
    handle: Option<JoinHandle<()>>,
}

pub struct LifecycleManager {
    store: Arc<dyn SessionStore>,
    destroyer: Arc<Destroyer>,
    audit: Arc<parking_lot::Mutex<AuditLogger>>,
    metrics: Arc<Metrics>,
    config: LifecycleConfig,
    now: NowFn,
    run_state: parking_lot::Mutex<RunState>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn SessionStore>, destroyer: Arc<Destroyer>, audit: Arc<parking_lot::Mutex<AuditLogger>>, metrics: Arc<Metrics>, config: LifecycleConfig) -> Arc<Self> {
        Self::with_clock(store, destroyer, audit, metrics, config, Arc::new(Utc::now))
    }

    pub fn with_clock(
        store: Arc<dyn SessionStore>,
        destroyer: Arc<Destroyer>,
        audit: Arc<parking_lot::Mutex<AuditLogger>>,
        metrics: Arc<Metrics>,
        config: LifecycleConfig,
        now: NowFn,
    ) -> Arc<Self> {
        Arc::new(Self { store, destroyer, audit, metrics, config, now, run_state: parking_lot::Mutex::new(RunState { running: false, stop: None, handle: None }) })
    }

    /// Idempotent: a second `start()` while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut run_state = self.run_state.lock();
        if run_state.running {
            return;
        }
        let stop = Arc::new(Notify::new());
        run_state.stop = Some(stop.clone());
        run_state.running = true;

        let this = Arc::clone(self);
        let interval = self.config.tick_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = this.tick().await;
                        info!(?report, "lifecycle tick complete");
                    }
                    _ = stop.notified() => break,
                }
            }
            this.run_state.lock().running = false;
        });
        run_state.handle = Some(handle);
    }

    /// Idempotent: stopping an already-stopped manager is a no-op. Waits
    /// for any in-progress tick to finish before returning.
    pub async fn stop(&self) {
        let (stop, handle) = {
            let mut run_state = self.run_state.lock();
            (run_state.stop.take(), run_state.handle.take())
        };
        if let Some(stop) = stop {
            stop.notify_one();
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run the four sub-checks once, in the documented order. Exposed
    /// directly so tests and `reconcile-once`-style callers can drive a
    /// single pass without starting the background loop.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let now = (self.now)();

        report.hard_max_enforced = self.hard_max_check(now).await;
        report.expired = self.expiry_check(now).await;
        report.orphans_detected = self.orphan_grace_check(now).await;
        report.stuck_failed = self.stuck_session_check(now).await;

        report
    }

    async fn hard_max_check(&self, now: DateTime<Utc>) -> u32 {
        let mut count = 0;
        let sessions = match self.store.get_active_sessions().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "hard_max_check: failed to load active sessions");
                return 0;
            }
        };
        for session in sessions {
            if session.hard_max_override {
                continue;
            }
            if now - session.created_at <= self.config.hard_max {
                continue;
            }
            self.audit.lock().append(
                Component::LifecycleManager,
                AuditAction::HardMaxEnforced,
                TargetType::Session,
                &session.id,
                serde_json::json!({"created_at": session.created_at, "hard_max_hours": self.config.hard_max.num_hours()}),
                AuditResult { success: true, message: "hard max duration exceeded".to_string(), details: None },
                None,
            );
            if let Err(e) = self.destroyer.destroy_session(&session.id).await {
                warn!(session = %session.id, error = %e, "hard_max_check: destroy failed");
                continue;
            }
            self.metrics.hard_max_enforced_total.inc();
            count += 1;
        }
        count
    }

    async fn expiry_check(&self, now: DateTime<Utc>) -> u32 {
        let mut count = 0;
        let sessions = match self.store.get_expired_sessions(now).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "expiry_check: failed to load expired sessions");
                return 0;
            }
        };
        for session in sessions {
            self.audit.lock().append(
                Component::LifecycleManager,
                AuditAction::SessionExpired,
                TargetType::Session,
                &session.id,
                serde_json::json!({"expires_at": session.expires_at}),
                AuditResult { success: true, message: "reservation expired".to_string(), details: None },
                None,
            );
            if let Err(e) = self.destroyer.destroy_session(&session.id).await {
                warn!(session = %session.id, error = %e, "expiry_check: destroy failed");
                continue;
            }
            self.metrics.session_expired_total.inc();
            count += 1;
        }
        count
    }

    /// Alerting only — never destroys. The Reconciler is the sole authority
    /// for orphan destruction (§4.4 step 3).
    async fn orphan_grace_check(&self, now: DateTime<Utc>) -> u32 {
        let mut count = 0;
        let sessions = match self.store.get_sessions_by_status(&[SessionStatus::Running]).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "orphan_grace_check: failed to load running sessions");
                return 0;
            }
        };
        for session in sessions {
            if now <= session.expires_at + self.config.orphan_grace_period {
                continue;
            }
            warn!(session = %session.id, "orphan grace period exceeded");
            self.audit.lock().append(
                Component::LifecycleManager,
                AuditAction::OrphanDetected,
                TargetType::Session,
                &session.id,
                serde_json::json!({"expires_at": session.expires_at}),
                AuditResult { success: true, message: "running past expiry plus grace period".to_string(), details: None },
                None,
            );
            self.metrics.orphans_detected_total.inc();
            count += 1;
        }
        count
    }

    async fn stuck_session_check(&self, now: DateTime<Utc>) -> u32 {
        let mut count = 0;
        let sessions = match self.store.get_sessions_by_status(&[SessionStatus::Provisioning, SessionStatus::Stopping]).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "stuck_session_check: failed to load transitional sessions");
                return 0;
            }
        };
        for mut session in sessions {
            if now - session.created_at <= self.config.stuck_session_timeout {
                continue;
            }
            let stuck_in = session.status;
            session.status = SessionStatus::Failed;
            session.error = sanitize_error(&format!("stuck in {stuck_in} for longer than {}s", self.config.stuck_session_timeout.num_seconds()));
            session.stopped_at = Some(now);
            if let Err(e) = self.store.update(&session).await {
                warn!(session = %session.id, error = %e, "stuck_session_check: failed to persist");
                continue;
            }
            self.audit.lock().append(
                Component::LifecycleManager,
                AuditAction::StuckSessionFailed,
                TargetType::Session,
                &session.id,
                serde_json::json!({"stuck_in": stuck_in.to_string()}),
                AuditResult { success: true, message: session.error.clone(), details: None },
                None,
            );
            self.metrics.stuck_sessions_failed_total.inc();
            count += 1;
        }
        count
    }

    /// Errors with [`LifecycleError::TerminalState`] on an already-terminal
    /// session — never a silent success (§9 Open Question resolution).
    pub async fn signal_done(&self, session_id: &str) -> Result<(), LifecycleError> {
        let session = self.store.get(session_id).await?.ok_or_else(|| LifecycleError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Err(LifecycleError::TerminalState(session_id.to_string()));
        }
        self.destroyer.destroy_session(session_id).await?;
        Ok(())
    }

    pub async fn extend_session(&self, session_id: &str, additional_hours: u32) -> Result<(), LifecycleError> {
        let mut session = self.store.get(session_id).await?.ok_or_else(|| LifecycleError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() || session.status == SessionStatus::Stopping {
            return Err(LifecycleError::TerminalState(session_id.to_string()));
        }

        if !session.hard_max_override {
            let current_hours = session.reservation_hours;
            if ChronoDuration::hours((current_hours + additional_hours) as i64) > self.config.hard_max {
                return Err(LifecycleError::HardMaxExceeded { current_hours, requested_hours: additional_hours });
            }
        }

        session.expires_at += ChronoDuration::hours(additional_hours as i64);
        session.reservation_hours += additional_hours;
        self.store.update(&session).await?;
        Ok(())
    }

    pub async fn set_hard_max_override(&self, session_id: &str, enabled: bool) -> Result<(), LifecycleError> {
        let mut session = self.store.get(session_id).await?.ok_or_else(|| LifecycleError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Err(LifecycleError::TerminalState(session_id.to_string()));
        }
        session.hard_max_override = enabled;
        self.store.update(&session).await?;
        Ok(())
    }
}
