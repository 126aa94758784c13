//! shopper-cli — GPU Session Shopper control plane entry point.
//!
//! Wires up persistence, provider adapters, and the Lifecycle
//! Manager/Reconciler background loops. Does not implement consumer-facing
//! session creation, auth, or the SSH executor — those are external
//! collaborators this binary does not simulate.

use clap::{Parser, Subcommand};
use shopper_audit::AuditLogger;
use shopper_config::Settings;
use shopper_lifecycle::{Destroyer, LifecycleConfig, LifecycleManager};
use shopper_observe::Metrics;
use shopper_persist::{CostStore, SqliteCostStore, SqliteSessionStore};
use shopper_provision::ProviderRegistry;
use shopper_provision::tensordock::TensorDockAdapter;
use shopper_provision::vastai::VastAiAdapter;
use shopper_reconcile::Reconciler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "shopper-cli")]
#[command(about = "GPU session shopper control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane: open the store, start the Lifecycle Manager
    /// and Reconciler loops, block until interrupted.
    Serve {
        #[arg(short, long, default_value = "/etc/shopper/config.json")]
        config: PathBuf,

        #[arg(long, default_value = "sqlite:///var/lib/shopper/sessions.db?mode=rwc")]
        database_url: String,

        #[arg(long, default_value = "/var/lib/shopper")]
        state_dir: PathBuf,
    },

    /// Write a default config file and exit.
    InitConfig {
        #[arg(short, long, default_value = "/etc/shopper/config.json")]
        output: PathBuf,
    },

    /// Run a single reconciliation pass and exit (manual-intervention tool).
    ReconcileOnce {
        #[arg(short, long, default_value = "/etc/shopper/config.json")]
        config: PathBuf,

        #[arg(long, default_value = "sqlite:///var/lib/shopper/sessions.db?mode=rwc")]
        database_url: String,

        #[arg(long, default_value = "/var/lib/shopper")]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("shopper=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, database_url, state_dir } => serve(config, database_url, state_dir).await?,
        Commands::InitConfig { output } => init_config(output)?,
        Commands::ReconcileOnce { config, database_url, state_dir } => reconcile_once(config, database_url, state_dir).await?,
    }

    Ok(())
}

fn runtime_config(settings: &Settings, metrics: Arc<Metrics>) -> shopper_provision::AdapterRuntimeConfig {
    shopper_provision::AdapterRuntimeConfig {
        min_interval: Duration::from_millis(settings.rate_limit_min_interval_ms),
        circuit: shopper_provision::circuit::CircuitBreakerConfig {
            failure_threshold: settings.circuit_failure_threshold,
            reset_timeout: Duration::from_secs(settings.circuit_reset_timeout_secs),
            max_backoff: Duration::from_secs(settings.circuit_max_backoff_secs),
        },
        location: shopper_provision::location::LocationStatsConfig {
            min_confidence: settings.location_min_confidence,
            default_confidence: settings.location_default_confidence,
            decay: Duration::from_secs(settings.location_stats_decay_secs),
        },
        metrics,
    }
}

fn build_registry(settings: &Settings, metrics: Arc<Metrics>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    let config = runtime_config(settings, metrics);
    let tensordock_token = std::env::var("TENSORDOCK_API_TOKEN").unwrap_or_default();
    let vastai_token = std::env::var("VASTAI_API_TOKEN").unwrap_or_default();
    registry.register(Box::new(TensorDockAdapter::with_config(tensordock_token, config.clone())));
    registry.register(Box::new(VastAiAdapter::with_config(vastai_token, config)));
    registry
}

/// Seed `sessions_active` from the store's own counts so the gauge starts
/// accurate instead of climbing from zero as the first transitions happen.
async fn seed_sessions_active(store: &Arc<SqliteSessionStore>, metrics: &Metrics) -> anyhow::Result<()> {
    use shopper_persist::SessionStore;
    let mut active_by_provider: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for (provider, status, count) in store.count_sessions_by_provider_and_status().await? {
        if !status.is_terminal() {
            *active_by_provider.entry(provider).or_insert(0) += count;
        }
    }
    for (provider, count) in active_by_provider {
        metrics.set_sessions_active(&provider, count);
    }
    Ok(())
}

/// Price every `Running` session into a `CostRecord` for the current hour
/// bucket (C3, I6). Upsert semantics mean a missed tick just means the
/// next one overwrites the same bucket with an up-to-date amount.
async fn accrue_costs(store: &Arc<SqliteSessionStore>, cost_store: &Arc<SqliteCostStore>) {
    use chrono::Timelike;
    use shopper_persist::SessionStore;

    let now = chrono::Utc::now();
    let hour_bucket = match now.date_naive().and_hms_opt(now.hour(), 0, 0) {
        Some(naive) => naive.and_utc(),
        None => return,
    };

    let sessions = match store.get_sessions_by_status(&[shopper_proto::SessionStatus::Running]).await {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::warn!(error = %e, "cost accrual: failed to load running sessions");
            return;
        }
    };

    for session in sessions {
        let record = shopper_proto::CostRecord {
            id: String::new(),
            session_id: session.id.clone(),
            consumer_id: session.consumer_id.clone(),
            provider: session.provider.clone(),
            gpu_type: session.gpu_type.clone(),
            hour_bucket,
            amount: session.price_per_hour * session.gpu_count as f64,
            currency: "USD".to_string(),
        };
        if let Err(e) = cost_store.record(&record).await {
            tracing::warn!(session = %session.id, error = %e, "cost accrual: failed to record cost");
        }
    }
}

async fn serve(config_path: PathBuf, database_url: String, state_dir: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting shopper-cli");
    let settings = Settings::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        Settings::default()
    });

    std::fs::create_dir_all(&state_dir)?;

    let store = Arc::new(SqliteSessionStore::connect(&database_url).await?);
    let cost_pool = sqlx::sqlite::SqlitePoolOptions::new().max_connections(5).connect(&database_url).await?;
    let cost_store = Arc::new(SqliteCostStore::from_pool(cost_pool));

    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(build_registry(&settings, metrics.clone()));
    let audit = Arc::new(parking_lot::Mutex::new(AuditLogger::new(&state_dir)));
    let destroyer = Arc::new(Destroyer::new(store.clone(), registry.clone(), metrics.clone()));
    seed_sessions_active(&store, &metrics).await?;

    let lifecycle_config = LifecycleConfig {
        hard_max: chrono::Duration::hours(settings.hard_max_hours as i64),
        orphan_grace_period: chrono::Duration::seconds(settings.orphan_grace_period_secs as i64),
        stuck_session_timeout: chrono::Duration::seconds(settings.stuck_session_timeout_secs as i64),
        tick_interval: Duration::from_secs(settings.lifecycle_interval_secs),
    };
    let lifecycle = LifecycleManager::new(store.clone(), destroyer.clone(), audit.clone(), metrics.clone(), lifecycle_config);
    lifecycle.start();

    let reconciler = Arc::new(Reconciler::new(store.clone(), registry.clone(), destroyer.clone(), audit.clone(), metrics.clone(), settings.auto_destroy_orphans));
    let reconcile_interval = Duration::from_secs(settings.reconcile_interval_secs);
    let reconcile_task = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconcile_interval);
            loop {
                ticker.tick().await;
                let report = reconciler.reconcile().await;
                let recovered = reconciler.recover_stuck_sessions().await;
                info!(?report, recovered, "reconciliation pass complete");
            }
        })
    };

    let cost_accrual_interval = Duration::from_secs(settings.cost_accrual_interval_secs);
    let cost_task = {
        let store = store.clone();
        let cost_store = cost_store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cost_accrual_interval);
            loop {
                ticker.tick().await;
                accrue_costs(&store, &cost_store).await;
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    lifecycle.stop().await;
    reconcile_task.abort();
    cost_task.abort();

    Ok(())
}

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let settings = Settings::default();
    settings.save(&output)?;
    println!("Config written to {}", output.display());
    Ok(())
}

async fn reconcile_once(config_path: PathBuf, database_url: String, state_dir: PathBuf) -> anyhow::Result<()> {
    let settings = Settings::load(&config_path).unwrap_or_default();
    std::fs::create_dir_all(&state_dir)?;

    let store = Arc::new(SqliteSessionStore::connect(&database_url).await?);
    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(build_registry(&settings, metrics.clone()));
    let audit = Arc::new(parking_lot::Mutex::new(AuditLogger::new(&state_dir)));
    let destroyer = Arc::new(Destroyer::new(store.clone(), registry.clone(), metrics.clone()));
    let reconciler = Reconciler::new(store, registry, destroyer, audit, metrics, settings.auto_destroy_orphans);

    let report = reconciler.reconcile().await;
    let recovered = reconciler.recover_stuck_sessions().await;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "orphans_detected": report.orphans_detected,
        "orphans_destroyed": report.orphans_destroyed,
        "ghosts_detected": report.ghosts_detected,
        "ghosts_fixed": report.ghosts_fixed,
        "stuck_recovered": recovered,
    }))?);

    if report.orphans_destroyed == 0 && report.orphans_detected > 0 {
        error!("orphans detected but auto_destroy_orphans is disabled; review and destroy manually");
    }

    Ok(())
}
