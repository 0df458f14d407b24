// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PostgreSQL reading store
//!
//! Writes readings through a `sqlx` connection pool. Every write borrows a
//! connection for exactly one transaction; the pool gets it back whether
//! the transaction commits or rolls back.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE lake_raw_data_int (
//!     id BIGSERIAL PRIMARY KEY,
//!     topic TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     value BIGINT NOT NULL,
//!     received_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE TABLE lake_raw_data_float (
//!     id BIGSERIAL PRIMARY KEY,
//!     topic TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     value DOUBLE PRECISION NOT NULL,
//!     received_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! The tables are expected to exist (see `sql/schema.sql`); `verify_schema`
//! checks for them at startup. Table names are always quoted in statements.

use crate::classifier::{TableKind, TypedValue};
use crate::config::StoreConfig;
use crate::store::{ReadingStore, RecordId, StorageError, StoredRecord};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;

/// PostgreSQL reading store
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    int_table: String,
    float_table: String,
}

impl PgStore {
    /// Open a connection pool and check the store answers.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(connect_options(config)?)
            .await
            .map_err(StorageError::connection)?;

        let store = Self::from_pool(pool, config);
        store.ping().await?;
        Ok(store)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, config: &StoreConfig) -> Self {
        Self {
            pool,
            int_table: config.int_table.clone(),
            float_table: config.float_table.clone(),
        }
    }

    /// Get the database pool reference
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Table name for a table family.
    pub fn table_name(&self, table: TableKind) -> &str {
        match table {
            TableKind::Integer => &self.int_table,
            TableKind::Real => &self.float_table,
        }
    }

    fn quoted_table(&self, table: TableKind) -> String {
        quote_ident(self.table_name(table))
    }

    fn insert_sql(&self, table: TableKind) -> String {
        format!(
            "INSERT INTO {} (topic, payload, value) VALUES ($1, $2, $3) RETURNING id",
            self.quoted_table(table)
        )
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StorageError::connection)?;
        Ok(())
    }

    /// Check that both destination tables exist.
    pub async fn verify_schema(&self) -> Result<(), StorageError> {
        for table in [TableKind::Integer, TableKind::Real] {
            let name = self.table_name(table);
            let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
                .bind(quote_ident(name))
                .fetch_one(&self.pool)
                .await
                .map_err(StorageError::query)?;

            if found.is_none() {
                return Err(StorageError::MissingTable(name.to_string()));
            }
            tracing::debug!("Table {} present", name);
        }
        Ok(())
    }

    /// Close the pool, waiting for borrowed connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn row_to_record(table: TableKind, row: &PgRow) -> Result<StoredRecord, sqlx::Error> {
        let value = match table {
            TableKind::Integer => TypedValue::Integer(row.try_get::<i64, _>("value")?),
            TableKind::Real => TypedValue::Real(row.try_get::<f64, _>("value")?),
        };

        Ok(StoredRecord {
            id: row.try_get("id")?,
            table,
            topic: row.try_get("topic")?,
            payload: row.try_get::<serde_json::Value, _>("payload")?,
            value,
            received_at: row.try_get::<DateTime<Utc>, _>("received_at")?,
        })
    }
}

impl ReadingStore for PgStore {
    async fn write(
        &self,
        topic: &str,
        document: &serde_json::Value,
        value: TypedValue,
    ) -> Result<RecordId, StorageError> {
        let table = self.table_name(value.table());
        let sql = self.insert_sql(value.table());

        let mut tx = self.pool.begin().await.map_err(StorageError::connection)?;

        let query = sqlx::query_scalar::<_, i64>(&sql).bind(topic).bind(document);
        let query = match value {
            TypedValue::Integer(v) => query.bind(v),
            TypedValue::Real(v) => query.bind(v),
        };

        match query.fetch_one(&mut *tx).await {
            Ok(id) => {
                tx.commit()
                    .await
                    .map_err(|e| StorageError::insert(table, e))?;
                Ok(id)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("Rollback on {} failed: {}", table, rollback_err);
                }
                Err(StorageError::insert(table, e))
            }
        }
    }

    async fn count(&self, table: TableKind) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.quoted_table(table));
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::query)?;
        Ok(count.max(0) as u64)
    }

    async fn latest(
        &self,
        table: TableKind,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let sql = format!(
            "SELECT id, topic, payload, value, received_at FROM {} ORDER BY id DESC LIMIT $1",
            self.quoted_table(table)
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::query)?;

        rows.iter()
            .map(|row| Self::row_to_record(table, row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::query)
    }
}

/// Connection options: `url` first, then the individual overrides.
pub fn connect_options(config: &StoreConfig) -> Result<PgConnectOptions, StorageError> {
    let mut options = PgConnectOptions::from_str(&config.url).map_err(StorageError::connection)?;

    if let Some(host) = &config.host {
        options = options.host(host);
    }
    if let Some(port) = config.port {
        options = options.port(port);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    if let Some(user) = &config.user {
        options = options.username(user);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }

    Ok(options)
}

/// Double-quote an identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
