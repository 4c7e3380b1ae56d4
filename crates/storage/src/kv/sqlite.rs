use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::{BoxFuture, StateStore, validate_key};
use crate::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteQuerySnafu,
    StorageResult,
};

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS kv_state (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at_unix_seconds INTEGER NOT NULL
)";

/// SQLite-backed state store; one row per key.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStateStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps `:memory:` databases alive for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query(CREATE_TABLE_SQL)
            .execute(&pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-open-create-table",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite state store");
        Ok(Self { pool, database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn select(&self, key: &str) -> StorageResult<Option<String>> {
        validate_key(key, "sqlite-load")?;
        sqlx::query_scalar::<_, String>("SELECT value FROM kv_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-load-select",
            })
    }

    async fn upsert(&self, key: &str, value: String) -> StorageResult<()> {
        validate_key(key, "sqlite-save")?;
        sqlx::query(
            "INSERT INTO kv_state (key, value, updated_at_unix_seconds) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at_unix_seconds = excluded.updated_at_unix_seconds",
        )
        .bind(key)
        .bind(value)
        .bind(unix_timestamp_seconds())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-save-upsert",
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key, "sqlite-remove")?;
        sqlx::query("DELETE FROM kv_state WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-remove-delete",
            })?;
        Ok(())
    }
}

impl StateStore for SqliteStateStore {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(self.select(key))
    }

    fn save<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.upsert(key, value))
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.delete(key))
    }
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}
