// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message dispatcher
//!
//! Consumes bus messages from the pipeline queue and stores them.
//!
//! # Operation
//!
//! 1. Decode the payload (UTF-8, JSON object, `value` field)
//! 2. Classify the value (integer or real)
//! 3. Write the reading into the matching table
//! 4. Log the outcome
//!
//! Messages are handled one at a time, in queue order. A failed message is
//! logged and dropped; the loop only ends when the queue closes.

use crate::bus::BusMessage;
use crate::classifier::{classify, TableKind};
use crate::codec::{decode, DecodeErrorKind};
use crate::store::{ReadingStore, RecordId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

/// Dispatcher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Not yet attached to the queue
    Idle,
    /// Waiting for the next message
    Subscribed,
    /// Handling a message
    Processing,
    /// Queue closed and drained
    Terminated,
}

/// Result of handling one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Reading persisted
    Stored { table: TableKind, id: RecordId },
    /// Payload could not be decoded
    DecodeFailed(DecodeErrorKind),
    /// Value has a type no table accepts
    Unsupported(&'static str),
    /// Store rejected or could not take the write
    StorageFailed,
}

/// Dispatcher statistics
#[derive(Debug)]
pub struct DispatcherStats {
    /// Messages taken off the queue
    pub received: AtomicU64,
    /// Rows written to the integer table
    pub stored_int: AtomicU64,
    /// Rows written to the real table
    pub stored_float: AtomicU64,
    /// Payloads that failed to decode
    pub decode_errors: AtomicU64,
    /// Values of an unsupported type
    pub unsupported: AtomicU64,
    /// Failed writes
    pub storage_errors: AtomicU64,
    /// Messages dropped because the queue was full
    pub dropped_overflow: AtomicU64,
    /// Creation time
    pub created: Instant,
}

impl Default for DispatcherStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            stored_int: AtomicU64::new(0),
            stored_float: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            unsupported: AtomicU64::new(0),
            storage_errors: AtomicU64::new(0),
            dropped_overflow: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Record a message dropped on queue overflow.
    pub fn record_dropped(&self) {
        self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Stored {
                table: TableKind::Integer,
                ..
            } => &self.stored_int,
            Outcome::Stored {
                table: TableKind::Real,
                ..
            } => &self.stored_float,
            Outcome::DecodeFailed(_) => &self.decode_errors,
            Outcome::Unsupported(_) => &self.unsupported,
            Outcome::StorageFailed => &self.storage_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            stored_int: self.stored_int.load(Ordering::Relaxed),
            stored_float: self.stored_float.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStatsSnapshot {
    pub received: u64,
    pub stored_int: u64,
    pub stored_float: u64,
    pub decode_errors: u64,
    pub unsupported: u64,
    pub storage_errors: u64,
    pub dropped_overflow: u64,
    pub uptime_secs: u64,
}

impl DispatcherStatsSnapshot {
    /// Rows written, both tables.
    pub fn stored(&self) -> u64 {
        self.stored_int + self.stored_float
    }

    /// Messages that did not produce a row.
    pub fn rejected(&self) -> u64 {
        self.decode_errors + self.unsupported + self.storage_errors
    }

    /// Calculate messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.received as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for DispatcherStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received={} stored_int={} stored_float={} decode_errors={} unsupported={} storage_errors={} dropped={}",
            self.received,
            self.stored_int,
            self.stored_float,
            self.decode_errors,
            self.unsupported,
            self.storage_errors,
            self.dropped_overflow
        )
    }
}

/// Message dispatcher
///
/// Drives codec, classifier and store for every message it receives.
pub struct Dispatcher<S: ReadingStore> {
    store: Arc<S>,
    stats: Arc<DispatcherStats>,
    state: Arc<Mutex<DispatcherState>>,
}

impl<S: ReadingStore> Dispatcher<S> {
    /// Create a new dispatcher
    pub fn new(store: Arc<S>, stats: Arc<DispatcherStats>) -> Self {
        Self {
            store,
            stats,
            state: Arc::new(Mutex::new(DispatcherState::Idle)),
        }
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> &Arc<DispatcherStats> {
        &self.stats
    }

    /// Current lifecycle state
    pub fn state(&self) -> DispatcherState {
        *self.lock_state()
    }

    /// Shared handle on the lifecycle state, readable after `run` took `self`.
    pub fn state_handle(&self) -> Arc<Mutex<DispatcherState>> {
        Arc::clone(&self.state)
    }

    fn set_state(&self, state: DispatcherState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DispatcherState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Handle one message: decode, classify, write.
    pub async fn handle(&self, msg: &BusMessage) -> Outcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Received message on {} ({} bytes)",
            msg.topic,
            msg.payload.len()
        );

        let outcome = self.process(msg).await;
        self.stats.record(&outcome);
        outcome
    }

    async fn process(&self, msg: &BusMessage) -> Outcome {
        let decoded = match decode(&msg.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    "Decode failed on {}: {} (payload: \"{}\")",
                    msg.topic,
                    e,
                    msg.payload.escape_ascii()
                );
                return Outcome::DecodeFailed(e.kind());
            }
        };

        let value = match classify(&decoded.value) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    "Skipping message on {}: {} (payload: \"{}\")",
                    msg.topic,
                    e,
                    msg.payload.escape_ascii()
                );
                return Outcome::Unsupported(e.type_name);
            }
        };

        let table = value.table();
        match self.store.write(&msg.topic, &decoded.document, value).await {
            Ok(id) => {
                tracing::info!(
                    "Stored {} reading {} from {} (id={})",
                    table.label(),
                    value,
                    msg.topic,
                    id
                );
                Outcome::Stored { table, id }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to store {} reading from {}: {} (payload: \"{}\")",
                    table.label(),
                    msg.topic,
                    e,
                    msg.payload.escape_ascii()
                );
                Outcome::StorageFailed
            }
        }
    }

    /// Run the dispatcher until the queue closes.
    ///
    /// Messages still queued when the sender goes away are handled before
    /// returning.
    pub async fn run(self, mut rx: mpsc::Receiver<BusMessage>) -> DispatcherStatsSnapshot {
        self.set_state(DispatcherState::Subscribed);
        tracing::info!("Dispatcher started");

        while let Some(msg) = rx.recv().await {
            self.set_state(DispatcherState::Processing);
            self.handle(&msg).await;
            self.set_state(DispatcherState::Subscribed);
        }

        self.set_state(DispatcherState::Terminated);
        let snapshot = self.stats.snapshot();
        tracing::info!("Dispatcher terminated: {}", snapshot);
        snapshot
    }
}
