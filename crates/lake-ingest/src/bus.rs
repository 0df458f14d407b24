// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message bus abstraction
//!
//! Provides an abstract interface for the bus operations the supervisor
//! needs. This keeps the pipeline independent of the concrete MQTT client.
//!
//! # Integration
//!
//! A bus implementation provides a connector (credentials and endpoint are
//! fixed at construction) and the session it hands out:
//!
//! ```ignore
//! impl BusConnector for MyConnector {
//!     type Session = MySession;
//!     async fn connect(&self) -> Result<MySession, BusError> {
//!         // Open the transport, wait for the broker to accept...
//!     }
//! }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// A message as delivered by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Bus connection errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("cannot reach broker {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("subscription to '{pattern}' failed: {reason}")]
    Subscribe { pattern: String, reason: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("no answer from broker within {0:?}")]
    Timeout(Duration),
}

/// Opens bus sessions
pub trait BusConnector: Send + Sync {
    /// Live session type
    type Session: BusSession;

    /// Open an authenticated session to the broker.
    fn connect(&self) -> impl Future<Output = Result<Self::Session, BusError>> + Send;

    /// Endpoint description for log lines
    fn endpoint(&self) -> String;
}

/// A live bus session
pub trait BusSession: Send {
    /// Subscribe to a topic pattern and wait for the broker to accept it.
    fn subscribe(&mut self, pattern: &str) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Wait for the next message.
    ///
    /// An error means the session is gone; it must not be used again.
    fn next_message(&mut self) -> impl Future<Output = Result<BusMessage, BusError>> + Send;

    /// Close the session.
    fn disconnect(self) -> impl Future<Output = ()> + Send;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// One step of a scripted mock session
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Deliver a message
    Deliver(BusMessage),
    /// Drop the connection
    Drop(String),
}

#[derive(Debug, Default)]
struct MockState {
    /// Connection attempts that fail before any session is opened
    refuse_next: u32,
    /// One script per session, in connect order
    scripts: VecDeque<Vec<MockStep>>,
    /// Patterns subscribed, across all sessions
    subscriptions: Vec<String>,
}

/// Mock bus for testing without a broker
///
/// Each successful `connect` consumes one script. When a session runs out
/// of steps it stays open and idle until disconnected.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    connects: Arc<AtomicU32>,
    disconnects: Arc<AtomicU32>,
}

impl MockConnector {
    /// Create a new mock bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next session
    pub fn add_session(&self, steps: Vec<MockStep>) {
        self.lock().scripts.push_back(steps);
    }

    /// Make the next `count` connection attempts fail
    pub fn refuse_next(&self, count: u32) {
        self.lock().refuse_next = count;
    }

    /// Connection attempts so far (successful or not)
    pub fn connect_attempts(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sessions closed through `disconnect`
    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Patterns subscribed so far
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Mock session
#[derive(Debug)]
pub struct MockSession {
    steps: VecDeque<MockStep>,
    state: Arc<Mutex<MockState>>,
    disconnects: Arc<AtomicU32>,
}

impl BusConnector for MockConnector {
    type Session = MockSession;

    async fn connect(&self) -> Result<MockSession, BusError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(BusError::Connect {
                endpoint: self.endpoint(),
                reason: "connection refused".to_string(),
            });
        }

        let steps = state.scripts.pop_front().ok_or_else(|| BusError::Connect {
            endpoint: self.endpoint(),
            reason: "no scripted session left".to_string(),
        })?;

        Ok(MockSession {
            steps: steps.into(),
            state: Arc::clone(&self.state),
            disconnects: Arc::clone(&self.disconnects),
        })
    }

    fn endpoint(&self) -> String {
        "mock:0".to_string()
    }
}

impl BusSession for MockSession {
    async fn subscribe(&mut self, pattern: &str) -> Result<(), BusError> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.subscriptions.push(pattern.to_string());
        Ok(())
    }

    async fn next_message(&mut self) -> Result<BusMessage, BusError> {
        match self.steps.pop_front() {
            Some(MockStep::Deliver(msg)) => Ok(msg),
            Some(MockStep::Drop(reason)) => Err(BusError::ConnectionLost(reason)),
            None => std::future::pending().await,
        }
    }

    async fn disconnect(self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
