// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reading store abstraction
//!
//! Defines the trait for storage backends (PostgreSQL, in-memory).

use crate::classifier::{TableKind, TypedValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Identifier assigned by the store to a persisted reading.
pub type RecordId = i64;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store unreachable: {0}")]
    Connection(#[source] BoxError),

    #[error("insert into {table} failed: {source}")]
    Insert {
        table: String,
        #[source]
        source: BoxError,
    },

    #[error("query failed: {0}")]
    Query(#[source] BoxError),

    #[error("missing table: {0}")]
    MissingTable(String),
}

impl StorageError {
    pub fn connection(err: impl Into<BoxError>) -> Self {
        Self::Connection(err.into())
    }

    pub fn insert(table: impl Into<String>, err: impl Into<BoxError>) -> Self {
        Self::Insert {
            table: table.into(),
            source: err.into(),
        }
    }

    pub fn query(err: impl Into<BoxError>) -> Self {
        Self::Query(err.into())
    }
}

/// A persisted reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    /// Store-generated identifier
    pub id: RecordId,

    /// Table family the row lives in
    pub table: TableKind,

    /// Topic the message arrived on
    pub topic: String,

    /// Full payload document
    pub payload: serde_json::Value,

    /// Typed value (matches `table`)
    pub value: TypedValue,

    /// Receipt time, assigned by the store
    pub received_at: DateTime<Utc>,
}

/// Reading store trait
///
/// Backend-agnostic interface for persisting classified readings.
///
/// # Implementations
///
/// - `PgStore` -- PostgreSQL through a connection pool
/// - `MemoryStore` -- In-process, for tests and dry runs
pub trait ReadingStore: Send + Sync {
    /// Persist one reading into the table its value routes to.
    ///
    /// Either the whole row is committed and its id returned, or nothing
    /// is written.
    fn write(
        &self,
        topic: &str,
        document: &serde_json::Value,
        value: TypedValue,
    ) -> impl Future<Output = Result<RecordId, StorageError>> + Send;

    /// Number of rows in a table
    fn count(&self, table: TableKind) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Most recent rows of a table, newest first
    fn latest(
        &self,
        table: TableKind,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredRecord>, StorageError>> + Send;
}

/// In-memory reading store
///
/// Keeps rows in insertion order. `set_unreachable(true)` makes every
/// call fail with a connection error, which stands in for a store outage.
#[derive(Debug)]
pub struct MemoryStore {
    rows: Mutex<Vec<StoredRecord>>,
    next_id: AtomicI64,
    unreachable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Simulate the store going down (or coming back)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Rows of one table, oldest first
    pub fn records(&self, table: TableKind) -> Vec<StoredRecord> {
        self.lock_rows()
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    fn lock_rows(&self) -> std::sync::MutexGuard<'_, Vec<StoredRecord>> {
        match self.rows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_reachable(&self) -> Result<(), StorageError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StorageError::connection("memory store marked unreachable"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingStore for MemoryStore {
    async fn write(
        &self,
        topic: &str,
        document: &serde_json::Value,
        value: TypedValue,
    ) -> Result<RecordId, StorageError> {
        self.check_reachable()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock_rows().push(StoredRecord {
            id,
            table: value.table(),
            topic: topic.to_string(),
            payload: document.clone(),
            value,
            received_at: Utc::now(),
        });

        Ok(id)
    }

    async fn count(&self, table: TableKind) -> Result<u64, StorageError> {
        self.check_reachable()?;
        Ok(self.lock_rows().iter().filter(|r| r.table == table).count() as u64)
    }

    async fn latest(
        &self,
        table: TableKind,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        self.check_reachable()?;
        Ok(self
            .lock_rows()
            .iter()
            .rev()
            .filter(|r| r.table == table)
            .take(limit)
            .cloned()
            .collect())
    }
}
