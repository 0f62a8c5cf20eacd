//! PostgreSQL storage backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

use super::backend::{BackendConnector, StorageBackend};
use super::models::{KindStatistics, StorageStatistics};
use crate::config::DatabaseConfig;
use crate::domain::{PersistedRecord, RecordKey};
use crate::error::InfraError;

const RECORD_COLUMNS: &str =
    "kind, key, data, compressed, created_at, updated_at, accessed_at, access_count";

type RecordRow = (
    String,
    String,
    Vec<u8>,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
    DateTime<Utc>,
    i64,
);

fn into_record(row: RecordRow) -> PersistedRecord {
    let (kind, key, data, compressed, created_at, updated_at, accessed_at, access_count) = row;
    PersistedRecord {
        id: RecordKey { kind, key },
        data,
        compressed,
        created_at,
        updated_at,
        accessed_at,
        access_count: u64::try_from(access_count).unwrap_or(0),
    }
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// PostgreSQL-backed record store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool sized from `config` and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::InitializationFailure`] if the database is
    /// unreachable or a migration fails.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, InfraError> {
        let ssl_mode = if config.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(ssl_mode);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_pool_size.max(1))
            .min_connections(config.min_pool_size.min(config.max_pool_size))
            .idle_timeout(Some(config.idle_timeout))
            .acquire_timeout(config.connection_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                InfraError::InitializationFailure(format!(
                    "cannot connect to {}:{}/{}: {e}",
                    config.host, config.port, config.database
                ))
            })?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(
            host = %config.host,
            database = %config.database,
            max_connections = config.max_pool_size,
            "postgres backend connected"
        );
        Ok(Self { pool })
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), InfraError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    async fn upsert(&self, record: &PersistedRecord) -> Result<(), InfraError> {
        upsert_query(record).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_batch(&self, records: &[PersistedRecord]) -> Result<(), InfraError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            upsert_query(record).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_and_touch(
        &self,
        id: &RecordKey,
        at: DateTime<Utc>,
    ) -> Result<Option<PersistedRecord>, InfraError> {
        let sql = format!(
            "UPDATE records SET accessed_at = $3, access_count = access_count + 1 \
             WHERE kind = $1 AND key = $2 RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(&id.kind)
            .bind(&id.key)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(into_record))
    }

    async fn touch(&self, id: &RecordKey, at: DateTime<Utc>) -> Result<bool, InfraError> {
        let result = sqlx::query(
            "UPDATE records SET accessed_at = $3, access_count = access_count + 1 \
             WHERE kind = $1 AND key = $2",
        )
        .bind(&id.kind)
        .bind(&id.key)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &RecordKey) -> Result<bool, InfraError> {
        let result = sqlx::query("DELETE FROM records WHERE kind = $1 AND key = $2")
            .bind(&id.kind)
            .bind(&id.key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan(
        &self,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<PersistedRecord>, InfraError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = if let Some(after) = after {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM records \
                 WHERE (kind, key) > ($1, $2) ORDER BY kind, key LIMIT $3"
            );
            sqlx::query_as::<_, RecordRow>(&sql)
                .bind(&after.kind)
                .bind(&after.key)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        } else {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY kind, key LIMIT $1");
            sqlx::query_as::<_, RecordRow>(&sql)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        }?;
        Ok(rows.into_iter().map(into_record).collect())
    }

    async fn replace_payload(
        &self,
        id: &RecordKey,
        expected_updated_at: DateTime<Utc>,
        data: &[u8],
        compressed: bool,
    ) -> Result<bool, InfraError> {
        let result = sqlx::query(
            "UPDATE records SET data = $3, compressed = $4 \
             WHERE kind = $1 AND key = $2 AND updated_at = $5",
        )
        .bind(&id.kind)
        .bind(&id.key)
        .bind(data)
        .bind(compressed)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn statistics(&self) -> Result<StorageStatistics, InfraError> {
        let rows = sqlx::query_as::<_, (String, i64, i64, i64)>(
            "SELECT kind, COUNT(*), COUNT(*) FILTER (WHERE compressed), \
             COALESCE(SUM(access_count), 0)::BIGINT \
             FROM records GROUP BY kind ORDER BY kind",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = StorageStatistics::default();
        for (kind, records, compressed, accesses) in rows {
            stats.add_kind(
                &kind,
                KindStatistics {
                    records: count(records),
                    compressed: count(compressed),
                    accesses: count(accesses),
                },
            );
        }
        Ok(stats)
    }
}

fn upsert_query(
    record: &PersistedRecord,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        "INSERT INTO records \
         (kind, key, data, compressed, created_at, updated_at, accessed_at, access_count) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (kind, key) DO UPDATE SET \
         data = EXCLUDED.data, compressed = EXCLUDED.compressed, updated_at = EXCLUDED.updated_at",
    )
    .bind(&record.id.kind)
    .bind(&record.id.key)
    .bind(&record.data)
    .bind(record.compressed)
    .bind(record.created_at)
    .bind(record.updated_at)
    .bind(record.accessed_at)
    .bind(i64::try_from(record.access_count).unwrap_or(i64::MAX))
}

/// Connector for [`PostgresBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

#[async_trait]
impl BackendConnector for PostgresConnector {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn StorageBackend>, InfraError> {
        let backend = PostgresBackend::connect(config).await?;
        Ok(Arc::new(backend))
    }
}
