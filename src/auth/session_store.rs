//! Session bridge into the shared relational store.
//!
//! The legacy backend reads `authentication_sessions` by `subject_id`. The
//! gateway writes it with one upsert per login:
//! - a fresh connection per operation, closed unconditionally afterwards
//! - no pooling and no automatic retry
//! - the whole connect/statement/close cycle bounded by
//!   `database.statement_timeout_secs`

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(any(feature = "database-sqlite", feature = "database-postgres"))]
use sqlx::{ConnectOptions, Connection};

use super::AuthenticationRecord;
#[cfg(feature = "database-postgres")]
use crate::config::PostgresConfig;
#[cfg(feature = "database-sqlite")]
use crate::config::SqliteConfig;
use crate::{config::DatabaseConfig, error::GatewayError, observability::metrics};

/// A row of `authentication_sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub subject_id: String,
    pub session_index: String,
    pub authenticated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or update the row for `record.subject_id`.
    async fn store(&self, record: &AuthenticationRecord) -> Result<(), GatewayError>;

    /// Read back the row a legacy reader would see.
    async fn fetch(&self, subject_id: &str) -> Result<Option<StoredSession>, GatewayError>;
}

pub type SharedSessionStore = Arc<dyn SessionStore>;

#[cfg(feature = "database-sqlite")]
const SQLITE_UPSERT: &str = r#"
    INSERT INTO authentication_sessions (subject_id, session_index, authenticated_at)
    VALUES (?1, ?2, ?3)
    ON CONFLICT (subject_id) DO UPDATE SET
        session_index = excluded.session_index,
        authenticated_at = excluded.authenticated_at
"#;

#[cfg(feature = "database-sqlite")]
const SQLITE_FETCH: &str = r#"
    SELECT subject_id, session_index, authenticated_at
    FROM authentication_sessions
    WHERE subject_id = ?1
"#;

#[cfg(feature = "database-postgres")]
const POSTGRES_UPSERT: &str = r#"
    INSERT INTO authentication_sessions (subject_id, session_index, authenticated_at)
    VALUES ($1, $2, $3)
    ON CONFLICT (subject_id) DO UPDATE SET
        session_index = EXCLUDED.session_index,
        authenticated_at = EXCLUDED.authenticated_at
"#;

#[cfg(feature = "database-postgres")]
const POSTGRES_FETCH: &str = r#"
    SELECT subject_id, session_index, authenticated_at
    FROM authentication_sessions
    WHERE subject_id = $1
"#;

/// [`SessionStore`] over SQLite or PostgreSQL.
#[derive(Debug, Clone)]
pub struct SqlSessionStore {
    database: DatabaseConfig,
    timeout: Duration,
}

impl SqlSessionStore {
    pub fn new(database: &DatabaseConfig) -> Result<Self, GatewayError> {
        if database.is_none() {
            return Err(GatewayError::ProtocolConfig(
                "session storage requires a database configuration".into(),
            ));
        }
        Ok(Self {
            database: database.clone(),
            timeout: database.statement_timeout(),
        })
    }

    async fn bounded<T, F>(&self, operation: &str, work: F) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = Result<T, GatewayError>>,
    {
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout.as_millis(), format!("session store {operation}")))?
    }
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    #[tracing::instrument(skip_all, fields(subject_id = %record.subject_id))]
    async fn store(&self, record: &AuthenticationRecord) -> Result<(), GatewayError> {
        let start = std::time::Instant::now();
        let result = self
            .bounded("write", async {
                match &self.database {
                    #[cfg(feature = "database-sqlite")]
                    DatabaseConfig::Sqlite(config) => sqlite_store(config, record).await,
                    #[cfg(feature = "database-postgres")]
                    DatabaseConfig::Postgres(config) => postgres_store(config, record).await,
                    DatabaseConfig::None => Err(GatewayError::StoreUnavailable(
                        "no database configured".into(),
                    )),
                }
            })
            .await;

        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.code(),
        };
        metrics::record_session_store(outcome, start.elapsed().as_secs_f64());

        match &result {
            Ok(()) => tracing::info!("Authentication session stored"),
            Err(e) => tracing::warn!(error = %e, "Failed to store authentication session"),
        }
        result
    }

    async fn fetch(&self, subject_id: &str) -> Result<Option<StoredSession>, GatewayError> {
        self.bounded("read", async {
            match &self.database {
                #[cfg(feature = "database-sqlite")]
                DatabaseConfig::Sqlite(config) => sqlite_fetch(config, subject_id).await,
                #[cfg(feature = "database-postgres")]
                DatabaseConfig::Postgres(config) => postgres_fetch(config, subject_id).await,
                DatabaseConfig::None => {
                    let _ = subject_id;
                    Err(GatewayError::StoreUnavailable(
                        "no database configured".into(),
                    ))
                }
            }
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "database-sqlite")]
async fn sqlite_connect(
    config: &SqliteConfig,
    create_if_missing: bool,
) -> Result<sqlx::SqliteConnection, GatewayError> {
    sqlx::sqlite::SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(create_if_missing)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .connect()
        .await
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))
}

#[cfg(feature = "database-sqlite")]
async fn sqlite_store(
    config: &SqliteConfig,
    record: &AuthenticationRecord,
) -> Result<(), GatewayError> {
    let mut conn = sqlite_connect(config, config.create_if_missing).await?;
    let result = sqlx::query(SQLITE_UPSERT)
        .bind(&record.subject_id)
        .bind(&record.session_index)
        .bind(record.authenticated_at)
        .execute(&mut conn)
        .await
        .map(drop)
        .map_err(|e| GatewayError::StoreWriteFailed(e.to_string()));
    close(conn).await;
    result
}

#[cfg(feature = "database-sqlite")]
async fn sqlite_fetch(
    config: &SqliteConfig,
    subject_id: &str,
) -> Result<Option<StoredSession>, GatewayError> {
    let mut conn = sqlite_connect(config, false).await?;
    let result = sqlx::query_as::<_, (String, String, DateTime<Utc>)>(SQLITE_FETCH)
        .bind(subject_id)
        .fetch_optional(&mut conn)
        .await
        .map_err(|e| GatewayError::StoreReadFailed(e.to_string()));
    close(conn).await;
    Ok(result?.map(into_stored))
}

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "database-postgres")]
async fn postgres_connect(config: &PostgresConfig) -> Result<sqlx::PgConnection, GatewayError> {
    use std::str::FromStr;

    sqlx::postgres::PgConnectOptions::from_str(&config.url)
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?
        .connect()
        .await
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))
}

#[cfg(feature = "database-postgres")]
async fn postgres_store(
    config: &PostgresConfig,
    record: &AuthenticationRecord,
) -> Result<(), GatewayError> {
    let mut conn = postgres_connect(config).await?;
    let result = sqlx::query(POSTGRES_UPSERT)
        .bind(&record.subject_id)
        .bind(&record.session_index)
        .bind(record.authenticated_at)
        .execute(&mut conn)
        .await
        .map(drop)
        .map_err(|e| GatewayError::StoreWriteFailed(e.to_string()));
    close(conn).await;
    result
}

#[cfg(feature = "database-postgres")]
async fn postgres_fetch(
    config: &PostgresConfig,
    subject_id: &str,
) -> Result<Option<StoredSession>, GatewayError> {
    let mut conn = postgres_connect(config).await?;
    let result = sqlx::query_as::<_, (String, String, DateTime<Utc>)>(POSTGRES_FETCH)
        .bind(subject_id)
        .fetch_optional(&mut conn)
        .await
        .map_err(|e| GatewayError::StoreReadFailed(e.to_string()));
    close(conn).await;
    Ok(result?.map(into_stored))
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(any(feature = "database-sqlite", feature = "database-postgres"))]
async fn close<C: Connection>(conn: C) {
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Error closing session store connection");
    }
}

#[cfg(any(feature = "database-sqlite", feature = "database-postgres"))]
fn into_stored(
    (subject_id, session_index, authenticated_at): (String, String, DateTime<Utc>),
) -> StoredSession {
    StoredSession {
        subject_id,
        session_index,
        authenticated_at,
    }
}

/// Apply the bundled schema to the configured database.
pub async fn run_migrations(database: &DatabaseConfig) -> Result<(), GatewayError> {
    match database {
        #[cfg(feature = "database-sqlite")]
        DatabaseConfig::Sqlite(config) => {
            tracing::info!(path = %config.path, "Running SQLite migrations");
            let mut conn = sqlite_connect(config, true).await?;
            let result = sqlx::migrate!("./migrations_sqlx/sqlite")
                .run(&mut conn)
                .await
                .map_err(|e| GatewayError::StoreWriteFailed(e.to_string()));
            close(conn).await;
            result?;
            tracing::info!("SQLite migrations completed successfully");
            Ok(())
        }
        #[cfg(feature = "database-postgres")]
        DatabaseConfig::Postgres(config) => {
            tracing::info!("Running PostgreSQL migrations");
            let mut conn = postgres_connect(config).await?;
            let result = sqlx::migrate!("./migrations_sqlx/postgres")
                .run(&mut conn)
                .await
                .map_err(|e| GatewayError::StoreWriteFailed(e.to_string()));
            close(conn).await;
            result?;
            tracing::info!("PostgreSQL migrations completed successfully");
            Ok(())
        }
        DatabaseConfig::None => Err(GatewayError::ProtocolConfig(
            "no database configured".into(),
        )),
    }
}
