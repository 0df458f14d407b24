// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection supervisor
//!
//! Owns the bus session and feeds the pipeline queue.
//!
//! # Operation
//!
//! 1. Connect and subscribe, retrying with bounded exponential backoff
//! 2. Forward every message to the dispatcher queue (block or drop when full)
//! 3. On connection loss, reconnect and resume the same subscription
//! 4. On shutdown, disconnect and close the queue so the dispatcher drains it

use crate::bus::{BusConnector, BusError, BusMessage, BusSession};
use crate::config::{BrokerConfig, OverflowPolicy, PipelineConfig, ReconnectPolicy};
use crate::dispatcher::DispatcherStats;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

/// Connection supervisor
///
/// The session never leaves this type; the dispatcher only sees the queue.
pub struct ConnectionSupervisor<C: BusConnector> {
    connector: C,
    topic_filter: String,
    reconnect: ReconnectPolicy,
    overflow: OverflowPolicy,
    stats: Arc<DispatcherStats>,
}

impl<C: BusConnector> ConnectionSupervisor<C> {
    /// Create a new supervisor
    pub fn new(
        connector: C,
        broker: &BrokerConfig,
        pipeline: &PipelineConfig,
        stats: Arc<DispatcherStats>,
    ) -> Self {
        Self {
            connector,
            topic_filter: broker.topic_filter.clone(),
            reconnect: broker.reconnect.clone(),
            overflow: pipeline.overflow,
            stats,
        }
    }

    /// Connect and subscribe, retrying per the reconnect policy.
    ///
    /// Returns `Ok(None)` if shutdown was requested before a session came up.
    pub async fn establish(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<C::Session>, BusError> {
        let endpoint = self.connector.endpoint();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let attempt = tokio::select! {
                result = self.open_session() => result,
                _ = wait_for_shutdown(shutdown) => return Ok(None),
            };

            let err = match attempt {
                Ok(session) => {
                    tracing::info!(
                        "Session established on {} (filter: {}, attempt {})",
                        endpoint,
                        self.topic_filter,
                        attempts
                    );
                    return Ok(Some(session));
                }
                Err(e) => e,
            };

            if self.reconnect.exhausted(attempts) {
                tracing::error!(
                    "Giving up on {} after {} attempt(s): {}",
                    endpoint,
                    attempts,
                    err
                );
                return Err(err);
            }

            let delay = self.reconnect.backoff(attempts - 1);
            tracing::warn!(
                "Connection to {} failed (attempt {}): {}; retrying in {:?}",
                endpoint,
                attempts,
                err,
                delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(shutdown) => return Ok(None),
            }
        }
    }

    async fn open_session(&self) -> Result<C::Session, BusError> {
        let mut session = self.connector.connect().await?;
        if let Err(e) = session.subscribe(&self.topic_filter).await {
            session.disconnect().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Run until shutdown, the queue closing, or reconnection giving up.
    ///
    /// Dropping `tx` on return closes the queue; the dispatcher then drains
    /// whatever is still buffered.
    pub async fn run(
        &self,
        tx: mpsc::Sender<BusMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BusError> {
        let Some(mut session) = self.establish(&mut shutdown).await? else {
            tracing::info!("Shutdown requested before the bus session came up");
            return Ok(());
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => None,
                result = session.next_message() => Some(result),
            };

            match next {
                None => {
                    tracing::info!(
                        "Shutdown requested, disconnecting from {}",
                        self.connector.endpoint()
                    );
                    session.disconnect().await;
                    return Ok(());
                }
                Some(Ok(msg)) => {
                    if !self.forward(&tx, msg, &mut shutdown).await {
                        session.disconnect().await;
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    if !self.reconnect.enabled {
                        tracing::error!("Connection lost and reconnection is disabled: {}", e);
                        return Err(e);
                    }
                    tracing::warn!("{}; reconnecting", e);
                    session = match self.establish(&mut shutdown).await? {
                        Some(session) => session,
                        None => return Ok(()),
                    };
                }
            }
        }
    }

    /// Hand a message to the queue. Returns false when the supervisor
    /// should stop (queue closed or shutdown during a blocking send).
    async fn forward(
        &self,
        tx: &mpsc::Sender<BusMessage>,
        msg: BusMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        match self.overflow {
            OverflowPolicy::Block => tokio::select! {
                result = tx.send(msg) => {
                    if result.is_err() {
                        tracing::warn!("Dispatcher queue closed");
                    }
                    result.is_ok()
                }
                _ = wait_for_shutdown(shutdown) => false,
            },
            OverflowPolicy::DropNewest => match tx.try_send(msg) {
                Ok(()) => true,
                Err(TrySendError::Full(msg)) => {
                    self.stats.record_dropped();
                    tracing::warn!(
                        "Queue full, dropping message on {} (payload: \"{}\")",
                        msg.topic,
                        msg.payload.escape_ascii()
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!("Dispatcher queue closed");
                    false
                }
            },
        }
    }
}

/// Resolves once shutdown is signalled or the signal sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockConnector, MockStep};
    use std::time::Duration;

    fn broker(max_attempts: u32) -> BrokerConfig {
        BrokerConfig {
            topic_filter: "sensor/#".to_string(),
            reconnect: ReconnectPolicy {
                enabled: true,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                max_attempts,
            },
            ..BrokerConfig::default()
        }
    }

    fn supervisor(
        bus: &MockConnector,
        broker: &BrokerConfig,
        overflow: OverflowPolicy,
    ) -> ConnectionSupervisor<MockConnector> {
        let pipeline = PipelineConfig {
            overflow,
            ..PipelineConfig::default()
        };
        ConnectionSupervisor::new(
            bus.clone(),
            broker,
            &pipeline,
            Arc::new(DispatcherStats::new()),
        )
    }

    fn deliver(topic: &str, payload: &str) -> MockStep {
        MockStep::Deliver(BusMessage::new(topic, payload))
    }

    #[tokio::test]
    async fn test_forwards_messages_until_shutdown() {
        let bus = MockConnector::new();
        bus.add_session(vec![
            deliver("sensor/data/int", r#"{"value": 1}"#),
            deliver("sensor/data/float", r#"{"value": 1.5}"#),
        ]);

        let sup = supervisor(&bus, &broker(3), OverflowPolicy::Block);
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { sup.run(tx, stop_rx).await });

        assert_eq!(rx.recv().await.unwrap().topic, "sensor/data/int");
        assert_eq!(rx.recv().await.unwrap().topic, "sensor/data/float");

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // Sender dropped with the supervisor
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriptions(), vec!["sensor/#".to_string()]);
        assert_eq!(bus.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_and_resubscribes() {
        let bus = MockConnector::new();
        bus.add_session(vec![
            deliver("a", r#"{"value": 1}"#),
            MockStep::Drop("network unreachable".to_string()),
        ]);
        bus.add_session(vec![deliver("b", r#"{"value": 2}"#)]);

        let sup = supervisor(&bus, &broker(5), OverflowPolicy::Block);
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { sup.run(tx, stop_rx).await });

        assert_eq!(rx.recv().await.unwrap().topic, "a");
        assert_eq!(rx.recv().await.unwrap().topic, "b");

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(bus.connect_attempts(), 2);
        assert_eq!(
            bus.subscriptions(),
            vec!["sensor/#".to_string(), "sensor/#".to_string()]
        );
    }

    #[tokio::test]
    async fn test_establish_retries_with_backoff() {
        let bus = MockConnector::new();
        bus.refuse_next(2);
        bus.add_session(Vec::new());

        let sup = supervisor(&bus, &broker(5), OverflowPolicy::Block);
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let session = sup.establish(&mut stop_rx).await.unwrap();
        assert!(session.is_some());
        assert_eq!(bus.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let bus = MockConnector::new();
        bus.refuse_next(10);

        let sup = supervisor(&bus, &broker(3), OverflowPolicy::Block);
        let (tx, _rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = sup.run(tx, stop_rx).await.unwrap_err();
        assert!(matches!(err, BusError::Connect { .. }));
        assert_eq!(bus.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_fail_fast_on_connection_loss() {
        let bus = MockConnector::new();
        bus.add_session(vec![MockStep::Drop("broker restarted".to_string())]);
        bus.add_session(Vec::new());

        let broker = BrokerConfig {
            reconnect: ReconnectPolicy::fail_fast(),
            ..broker(3)
        };
        let sup = supervisor(&bus, &broker, OverflowPolicy::Block);
        let (tx, _rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = sup.run(tx, stop_rx).await.unwrap_err();
        assert!(matches!(err, BusError::ConnectionLost(_)));
        assert_eq!(bus.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_drop_newest_counts_overflow() {
        let bus = MockConnector::new();
        bus.add_session(vec![
            deliver("t", r#"{"value": 1}"#),
            deliver("t", r#"{"value": 2}"#),
            deliver("t", r#"{"value": 3}"#),
        ]);

        let pipeline = PipelineConfig {
            overflow: OverflowPolicy::DropNewest,
            ..PipelineConfig::default()
        };
        let stats = Arc::new(DispatcherStats::new());
        let sup =
            ConnectionSupervisor::new(bus.clone(), &broker(3), &pipeline, Arc::clone(&stats));

        let (tx, mut rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sup.run(tx, stop_rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.snapshot().dropped_overflow < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(rx.recv().await.unwrap().payload, br#"{"value": 1}"#.to_vec());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let bus = MockConnector::new();
        bus.refuse_next(100);

        let broker = BrokerConfig {
            reconnect: ReconnectPolicy {
                enabled: true,
                initial_backoff_ms: 60_000,
                max_backoff_ms: 60_000,
                max_attempts: 0,
            },
            ..BrokerConfig::default()
        };
        let sup = supervisor(&bus, &broker, OverflowPolicy::Block);
        let (tx, _rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { sup.run(tx, stop_rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(bus.connect_attempts(), 1);
    }
}
