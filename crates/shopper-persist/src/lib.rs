//! Relational storage for [`Session`]s and [`CostRecord`]s (§4.3).
//!
//! Mirrors the pool-and-migrate idiom of
//! `OpenAgentsInc-openagents/backend/src/database.rs`, substituting SQLite
//! for Postgres: `SqlitePoolOptions` in place of `PgPoolOptions`,
//! `sqlx::migrate!("./migrations")` run at connect time. `SessionStore` and
//! `CostStore` are traits so callers depend on an interface rather than a
//! concrete backend, the same role `ProviderAdapter` plays for provisioning.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shopper_proto::{CostRecord, CostSummary, Session, SessionStatus};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("session with consumer_id={consumer_id} offer_id={offer_id} already has a non-terminal session")]
    AlreadyExists { consumer_id: String, offer_id: String },
    #[error("session {id} not found")]
    NotFound { id: String },
}

fn status_to_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Pending => "pending",
        SessionStatus::Provisioning => "provisioning",
        SessionStatus::Running => "running",
        SessionStatus::Stopping => "stopping",
        SessionStatus::Stopped => "stopped",
        SessionStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> SessionStatus {
    match s {
        "pending" => SessionStatus::Pending,
        "provisioning" => SessionStatus::Provisioning,
        "running" => SessionStatus::Running,
        "stopping" => SessionStatus::Stopping,
        "stopped" => SessionStatus::Stopped,
        _ => SessionStatus::Failed,
    }
}

const NON_TERMINAL: [&str; 3] = ["pending", "provisioning", "running"];

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session, StoreError> {
    Ok(Session {
        id: row.try_get("id")?,
        consumer_id: row.try_get("consumer_id")?,
        provider: row.try_get("provider")?,
        provider_id: row.try_get("provider_id")?,
        offer_id: row.try_get("offer_id")?,
        gpu_type: row.try_get("gpu_type")?,
        gpu_count: row.try_get::<i64, _>("gpu_count")? as u32,
        price_per_hour: row.try_get("price_per_hour")?,
        workload_type: row.try_get("workload_type")?,
        storage_policy: row.try_get("storage_policy")?,
        status: status_from_str(row.try_get::<String, _>("status")?.as_str()),
        reservation_hours: row.try_get::<i64, _>("reservation_hours")? as u32,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        stopped_at: row.try_get("stopped_at")?,
        hard_max_override: row.try_get::<i64, _>("hard_max_override")? != 0,
        ssh_host: row.try_get("ssh_host")?,
        ssh_port: row.try_get::<i64, _>("ssh_port")? as u16,
        ssh_user: row.try_get("ssh_user")?,
        error: row.try_get("error")?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub consumer_id: Option<String>,
    pub provider: Option<String>,
    pub status: Option<SessionStatus>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;
    async fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError>;
    async fn update(&self, session: &Session) -> Result<(), StoreError>;
    async fn get_active_sessions(&self) -> Result<Vec<Session>, StoreError>;
    async fn get_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>, StoreError>;
    async fn get_sessions_by_status(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>, StoreError>;
    async fn get_active_sessions_by_provider(&self, provider: &str) -> Result<Vec<Session>, StoreError>;
    async fn get_active_session_by_consumer_and_offer(&self, consumer_id: &str, offer_id: &str) -> Result<Option<Session>, StoreError>;
    async fn count_sessions_by_provider_and_status(&self) -> Result<Vec<(String, SessionStatus, i64)>, StoreError>;
}

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Connect (creating the file if needed via `?mode=rwc`) and apply
    /// pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        tracing::info!(database_url, "connecting to session store");
        let pool = SqlitePoolOptions::new().max_connections(5).connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| StoreError::Sqlite(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        // `pool.begin()` already issues its own `BEGIN` before any query of
        // ours can run, so a literal `BEGIN IMMEDIATE` can't be layered on
        // top of it — SQLite refuses a transaction inside a transaction.
        // Acquire a raw connection instead and drive `BEGIN IMMEDIATE` /
        // `COMMIT` / `ROLLBACK` ourselves so the I1 check-then-insert below
        // genuinely runs under an immediate write lock.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let existing: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(
            "SELECT 1 FROM sessions WHERE consumer_id = ? AND offer_id = ? AND status IN ('pending','provisioning','running') LIMIT 1",
        )
        .bind(&session.consumer_id)
        .bind(&session.offer_id)
        .fetch_optional(&mut *conn)
        .await;

        let existing = match existing {
            Ok(existing) => existing,
            Err(e) => {
                sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
                return Err(e.into());
            }
        };

        if existing.is_some() {
            sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
            return Err(StoreError::AlreadyExists { consumer_id: session.consumer_id.clone(), offer_id: session.offer_id.clone() });
        }

        let inserted = sqlx::query(
            "INSERT INTO sessions (id, consumer_id, provider, provider_id, offer_id, gpu_type, gpu_count, price_per_hour, \
             workload_type, storage_policy, status, reservation_hours, created_at, expires_at, stopped_at, hard_max_override, \
             ssh_host, ssh_port, ssh_user, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.consumer_id)
        .bind(&session.provider)
        .bind(&session.provider_id)
        .bind(&session.offer_id)
        .bind(&session.gpu_type)
        .bind(session.gpu_count as i64)
        .bind(session.price_per_hour)
        .bind(&session.workload_type)
        .bind(&session.storage_policy)
        .bind(status_to_str(session.status))
        .bind(session.reservation_hours as i64)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.stopped_at)
        .bind(session.hard_max_override as i64)
        .bind(&session.ssh_host)
        .bind(session.ssh_port as i64)
        .bind(&session.ssh_user)
        .bind(&session.error)
        .execute(&mut *conn)
        .await;

        match inserted {
            Ok(_) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
                Err(e.into())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError> {
        let mut sql = "SELECT * FROM sessions WHERE 1=1".to_string();
        if filter.consumer_id.is_some() {
            sql.push_str(" AND consumer_id = ?");
        }
        if filter.provider.is_some() {
            sql.push_str(" AND provider = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        let mut query = sqlx::query(&sql);
        if let Some(ref consumer_id) = filter.consumer_id {
            query = query.bind(consumer_id);
        }
        if let Some(ref provider) = filter.provider {
            query = query.bind(provider);
        }
        if let Some(status) = filter.status {
            query = query.bind(status_to_str(status));
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn update(&self, session: &Session) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET consumer_id = ?, provider = ?, provider_id = ?, offer_id = ?, gpu_type = ?, gpu_count = ?, \
             price_per_hour = ?, workload_type = ?, storage_policy = ?, status = ?, reservation_hours = ?, created_at = ?, \
             expires_at = ?, stopped_at = ?, hard_max_override = ?, ssh_host = ?, ssh_port = ?, ssh_user = ?, error = ? \
             WHERE id = ?",
        )
        .bind(&session.consumer_id)
        .bind(&session.provider)
        .bind(&session.provider_id)
        .bind(&session.offer_id)
        .bind(&session.gpu_type)
        .bind(session.gpu_count as i64)
        .bind(session.price_per_hour)
        .bind(&session.workload_type)
        .bind(&session.storage_policy)
        .bind(status_to_str(session.status))
        .bind(session.reservation_hours as i64)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.stopped_at)
        .bind(session.hard_max_override as i64)
        .bind(&session.ssh_host)
        .bind(session.ssh_port as i64)
        .bind(&session.ssh_user)
        .bind(&session.error)
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id: session.id.clone() });
        }
        Ok(())
    }

    async fn get_active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status IN ('pending','provisioning','running')").fetch_all(&self.pool).await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn get_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status = 'running' AND expires_at < ?").bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn get_sessions_by_status(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(",");
        let sql = format!("SELECT * FROM sessions WHERE status IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status_to_str(*status));
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn get_active_sessions_by_provider(&self, provider: &str) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE provider = ? AND status IN ('pending','provisioning','running')")
            .bind(provider)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn get_active_session_by_consumer_and_offer(&self, consumer_id: &str, offer_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE consumer_id = ? AND offer_id = ? AND status IN ('pending','provisioning','running') LIMIT 1")
            .bind(consumer_id)
            .bind(offer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn count_sessions_by_provider_and_status(&self) -> Result<Vec<(String, SessionStatus, i64)>, StoreError> {
        let rows = sqlx::query("SELECT provider, status, COUNT(*) as n FROM sessions GROUP BY provider, status").fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok((row.try_get::<String, _>("provider")?, status_from_str(row.try_get::<String, _>("status")?.as_str()), row.try_get("n")?))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CostQuery {
    pub consumer_id: Option<String>,
    pub provider: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CostStore: Send + Sync {
    async fn record(&self, record: &CostRecord) -> Result<(), StoreError>;
    async fn get_session_cost(&self, session_id: &str) -> Result<f64, StoreError>;
    async fn get_consumer_cost(&self, consumer_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64, StoreError>;
    async fn get_summary(&self, query: &CostQuery) -> Result<CostSummary, StoreError>;
}

pub struct SqliteCostStore {
    pool: SqlitePool,
}

impl SqliteCostStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CostStore for SqliteCostStore {
    async fn record(&self, record: &CostRecord) -> Result<(), StoreError> {
        let id = if record.id.is_empty() { uuid_like_id(&record.session_id, &record.hour_bucket) } else { record.id.clone() };
        sqlx::query(
            "INSERT INTO cost_records (id, session_id, consumer_id, provider, gpu_type, hour_bucket, amount, currency) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(session_id, hour_bucket) DO UPDATE SET amount = excluded.amount, currency = excluded.currency",
        )
        .bind(&id)
        .bind(&record.session_id)
        .bind(&record.consumer_id)
        .bind(&record.provider)
        .bind(&record.gpu_type)
        .bind(record.hour_bucket)
        .bind(record.amount)
        .bind(&record.currency)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session_cost(&self, session_id: &str) -> Result<f64, StoreError> {
        let total: Option<f64> = sqlx::query_scalar("SELECT SUM(amount) FROM cost_records WHERE session_id = ?").bind(session_id).fetch_one(&self.pool).await?;
        Ok(total.unwrap_or(0.0))
    }

    async fn get_consumer_cost(&self, consumer_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64, StoreError> {
        let total: Option<f64> =
            sqlx::query_scalar("SELECT SUM(amount) FROM cost_records WHERE consumer_id = ? AND hour_bucket >= ? AND hour_bucket < ?")
                .bind(consumer_id)
                .bind(start)
                .bind(end)
                .fetch_one(&self.pool)
                .await?;
        Ok(total.unwrap_or(0.0))
    }

    async fn get_summary(&self, query: &CostQuery) -> Result<CostSummary, StoreError> {
        let mut sql = "SELECT COALESCE(SUM(amount),0) as total, COUNT(DISTINCT session_id) as session_count, COUNT(*) as row_count \
                        FROM cost_records WHERE 1=1"
            .to_string();
        if query.consumer_id.is_some() {
            sql.push_str(" AND consumer_id = ?");
        }
        if query.provider.is_some() {
            sql.push_str(" AND provider = ?");
        }
        if query.start.is_some() {
            sql.push_str(" AND hour_bucket >= ?");
        }
        if query.end.is_some() {
            sql.push_str(" AND hour_bucket < ?");
        }

        let bind_common = |mut q: sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>>| {
            if let Some(ref consumer_id) = query.consumer_id {
                q = q.bind(consumer_id);
            }
            if let Some(ref provider) = query.provider {
                q = q.bind(provider);
            }
            if let Some(start) = query.start {
                q = q.bind(start);
            }
            if let Some(end) = query.end {
                q = q.bind(end);
            }
            q
        };

        let row = bind_common(sqlx::query(&sql)).fetch_one(&self.pool).await?;
        let total: f64 = row.try_get("total")?;
        let session_count: i64 = row.try_get("session_count")?;
        let row_count: i64 = row.try_get("row_count")?;

        let by_provider_sql = sql.replace(
            "SELECT COALESCE(SUM(amount),0) as total, COUNT(DISTINCT session_id) as session_count, COUNT(*) as row_count",
            "SELECT provider, COALESCE(SUM(amount),0) as total",
        ) + " GROUP BY provider";
        let provider_rows = bind_common(sqlx::query(&by_provider_sql)).fetch_all(&self.pool).await?;
        let by_provider = provider_rows.iter().map(|r| Ok::<_, StoreError>((r.try_get("provider")?, r.try_get("total")?))).collect::<Result<Vec<_>, _>>()?;

        let by_gpu_sql = sql.replace(
            "SELECT COALESCE(SUM(amount),0) as total, COUNT(DISTINCT session_id) as session_count, COUNT(*) as row_count",
            "SELECT gpu_type, COALESCE(SUM(amount),0) as total",
        ) + " GROUP BY gpu_type";
        let gpu_rows = bind_common(sqlx::query(&by_gpu_sql)).fetch_all(&self.pool).await?;
        let by_gpu_type = gpu_rows.iter().map(|r| Ok::<_, StoreError>((r.try_get("gpu_type")?, r.try_get("total")?))).collect::<Result<Vec<_>, _>>()?;

        Ok(CostSummary { total, session_count: session_count as u64, row_count: row_count as u64, by_provider, by_gpu_type })
    }
}

fn uuid_like_id(session_id: &str, hour_bucket: &DateTime<Utc>) -> String {
    format!("cost-{session_id}-{}", hour_bucket.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_session(consumer_id: &str, offer_id: &str, status: SessionStatus) -> Session {
        let now = Utc::now();
        Session {
            id: format!("sess-{consumer_id}-{offer_id}"),
            consumer_id: consumer_id.to_string(),
            provider: "tensordock".to_string(),
            provider_id: "mock-1".to_string(),
            offer_id: offer_id.to_string(),
            gpu_type: "RTX4090".to_string(),
            gpu_count: 1,
            price_per_hour: 0.4,
            workload_type: "training".to_string(),
            storage_policy: "ephemeral".to_string(),
            status,
            reservation_hours: 4,
            created_at: now,
            expires_at: now + Duration::hours(4),
            stopped_at: None,
            hard_max_override: false,
            ssh_host: String::new(),
            ssh_port: 0,
            ssh_user: String::new(),
            error: String::new(),
        }
    }

    #[tokio::test]
    async fn test_create_then_get_roundtrips() {
        let store = SqliteSessionStore::from_pool(memory_pool().await);
        let session = sample_session("c1", "o1", SessionStatus::Pending);
        store.create(&session).await.unwrap();
        let fetched = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.consumer_id, "c1");
        assert_eq!(fetched.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_non_terminal_offer() {
        let store = SqliteSessionStore::from_pool(memory_pool().await);
        let first = sample_session("c1", "o1", SessionStatus::Running);
        store.create(&first).await.unwrap();

        let mut second = sample_session("c1", "o1", SessionStatus::Pending);
        second.id = "sess-other".to_string();
        let result = store.create(&second).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_create_allows_new_session_after_prior_terminal() {
        let store = SqliteSessionStore::from_pool(memory_pool().await);
        let mut first = sample_session("c1", "o1", SessionStatus::Stopped);
        store.create(&first).await.unwrap();

        let mut second = sample_session("c1", "o1", SessionStatus::Pending);
        second.id = "sess-other".to_string();
        store.create(&second).await.unwrap();
        first.status = SessionStatus::Stopped;
    }

    #[tokio::test]
    async fn test_update_missing_session_returns_not_found() {
        let store = SqliteSessionStore::from_pool(memory_pool().await);
        let session = sample_session("c1", "o1", SessionStatus::Pending);
        let result = store.update(&session).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_get_expired_sessions_filters_by_time_and_status() {
        let store = SqliteSessionStore::from_pool(memory_pool().await);
        let mut expired = sample_session("c1", "o1", SessionStatus::Running);
        expired.expires_at = Utc::now() - Duration::minutes(5);
        store.create(&expired).await.unwrap();

        let mut active = sample_session("c2", "o2", SessionStatus::Running);
        active.expires_at = Utc::now() + Duration::hours(1);
        store.create(&active).await.unwrap();

        let results = store.get_expired_sessions(Utc::now()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, expired.id);
    }

    #[tokio::test]
    async fn test_cost_record_upserts_on_session_and_hour_bucket() {
        let pool = memory_pool().await;
        let session_store = SqliteSessionStore::from_pool(pool.clone());
        let cost_store = SqliteCostStore::from_pool(pool);
        let session = sample_session("c1", "o1", SessionStatus::Running);
        session_store.create(&session).await.unwrap();

        let hour_bucket = Utc::now();
        let mut record = CostRecord {
            id: String::new(),
            session_id: session.id.clone(),
            consumer_id: "c1".to_string(),
            provider: "tensordock".to_string(),
            gpu_type: "RTX4090".to_string(),
            hour_bucket,
            amount: 0.4,
            currency: "USD".to_string(),
        };
        cost_store.record(&record).await.unwrap();
        record.amount = 0.45;
        cost_store.record(&record).await.unwrap();

        let total = cost_store.get_session_cost(&session.id).await.unwrap();
        assert!((total - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_get_summary_breaks_down_by_provider_and_gpu_type() {
        let pool = memory_pool().await;
        let session_store = SqliteSessionStore::from_pool(pool.clone());
        let cost_store = SqliteCostStore::from_pool(pool);

        let session_a = sample_session("c1", "o1", SessionStatus::Running);
        session_store.create(&session_a).await.unwrap();
        cost_store
            .record(&CostRecord {
                id: String::new(),
                session_id: session_a.id.clone(),
                consumer_id: "c1".to_string(),
                provider: "tensordock".to_string(),
                gpu_type: "RTX4090".to_string(),
                hour_bucket: Utc::now(),
                amount: 0.4,
                currency: "USD".to_string(),
            })
            .await
            .unwrap();

        let summary = cost_store.get_summary(&CostQuery::default()).await.unwrap();
        assert!((summary.total - 0.4).abs() < 1e-9);
        assert_eq!(summary.session_count, 1);
        assert_eq!(summary.row_count, 1);
        assert_eq!(summary.by_provider, vec![("tensordock".to_string(), 0.4)]);
    }
}
