// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lake Ingest Service
//!
//! Relays sensor readings from an MQTT broker into PostgreSQL.
//!
//! # Features
//!
//! - **Typed routing** -- Integer readings and real readings land in separate tables
//! - **Verified TLS** -- Broker certificates checked against the webpki roots by default
//! - **Reconnection** -- Bounded exponential backoff, same subscription resumed
//! - **Backpressure** -- Bounded queue between bus and store, block or drop-newest
//!
//! # Architecture
//!
//! ```text
//! IngestService
//! +-- ConnectionSupervisor  (bus session, reconnects, feeds the queue)
//! +-- Dispatcher            (decode -> classify -> write, one message at a time)
//! +-- ReadingStore          (PostgreSQL or in-memory backend)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use lake_ingest::{IngestConfig, IngestService, MqttConnector, PgStore};
//! use std::sync::Arc;
//!
//! let config = IngestConfig::from_file("lake-ingest.toml")?;
//! let store = Arc::new(PgStore::connect(&config.store).await?);
//! let connector = MqttConnector::new(config.broker.clone());
//!
//! let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! let stats = IngestService::new(config, store, connector).run(stop_rx).await?;
//! ```

pub mod bus;
pub mod classifier;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod mqtt;
pub mod postgres;
pub mod store;
pub mod supervisor;

pub use bus::{BusConnector, BusError, BusMessage, BusSession, MockConnector, MockStep};
pub use classifier::{classify, ClassificationMismatch, TableKind, TypedValue};
pub use codec::{decode, DecodeError, DecodeErrorKind, DecodedPayload, ReadingValue};
pub use config::{
    BrokerConfig, ConfigError, IngestConfig, OverflowPolicy, PipelineConfig, ReconnectPolicy,
    StoreConfig, TlsMode,
};
pub use dispatcher::{
    Dispatcher, DispatcherState, DispatcherStats, DispatcherStatsSnapshot, Outcome,
};
pub use mqtt::MqttConnector;
pub use postgres::PgStore;
pub use store::{MemoryStore, ReadingStore, RecordId, StorageError, StoredRecord};
pub use supervisor::ConnectionSupervisor;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Errors that end an ingestion run
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("dispatcher task failed: {0}")]
    Dispatcher(#[from] tokio::task::JoinError),
}

/// Ingestion Service
///
/// Wires the supervisor and the dispatcher together through a bounded queue.
///
/// # Type Parameters
///
/// - `S` -- Storage backend (e.g., `PgStore`)
/// - `C` -- Bus connector (e.g., `MqttConnector`)
pub struct IngestService<S: ReadingStore, C: BusConnector> {
    config: IngestConfig,
    store: Arc<S>,
    connector: C,
    stats: Arc<DispatcherStats>,
}

impl<S: ReadingStore + 'static, C: BusConnector> IngestService<S, C> {
    /// Create a new ingestion service
    pub fn new(config: IngestConfig, store: Arc<S>, connector: C) -> Self {
        Self {
            config,
            store,
            connector,
            stats: Arc::new(DispatcherStats::new()),
        }
    }

    /// Live statistics, shared with the running pipeline.
    pub fn stats(&self) -> Arc<DispatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Run the ingestion service until `shutdown` turns true.
    ///
    /// Messages already queued when shutdown arrives are still written.
    /// Returns the final statistics, or the error that ended the run.
    pub async fn run(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<DispatcherStatsSnapshot, IngestError> {
        self.config.validate()?;

        let broker = &self.config.broker;
        let pipeline = &self.config.pipeline;
        tracing::info!("Starting Lake Ingest Service");
        tracing::info!("  Broker: {} (tls: {:?})", self.connector.endpoint(), broker.tls);
        tracing::info!("  Topics: {}", broker.topic_filter);
        tracing::info!(
            "  Tables: {} / {}",
            self.config.store.int_table,
            self.config.store.float_table
        );
        tracing::info!(
            "  Queue: {} messages ({:?} when full)",
            pipeline.queue_capacity,
            pipeline.overflow
        );

        let (tx, rx) = mpsc::channel(pipeline.queue_capacity);

        let dispatcher = Dispatcher::new(Arc::clone(&self.store), Arc::clone(&self.stats));
        let dispatcher_task = tokio::spawn(dispatcher.run(rx));

        let reporter = (pipeline.stats_interval_secs > 0).then(|| {
            tokio::spawn(report_stats(
                Arc::clone(&self.stats),
                Duration::from_secs(pipeline.stats_interval_secs),
            ))
        });

        let supervisor = ConnectionSupervisor::new(
            self.connector,
            broker,
            pipeline,
            Arc::clone(&self.stats),
        );
        let bus_result = supervisor.run(tx, shutdown).await;

        // The queue is closed now; wait for the dispatcher to drain it.
        let snapshot = dispatcher_task.await?;

        if let Some(reporter) = reporter {
            reporter.abort();
        }

        bus_result?;
        tracing::info!("Lake Ingest Service stopped: {}", snapshot);
        Ok(snapshot)
    }
}

async fn report_stats(stats: Arc<DispatcherStats>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let snapshot = stats.snapshot();
        tracing::info!(
            "Stats: {} ({:.2} msg/s)",
            snapshot,
            snapshot.messages_per_second()
        );
    }
}
