//! In-process broker simulation for tests and offline runs.
//!
//! [`SimTransport`] implements [`Transport`] without any network.  It records
//! subscriptions and published payloads, lets the caller script the
//! handshake outcome, and can inject inbound messages or drop the session
//! as if the broker had gone away.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use skylink_middleware::{Bridge, BridgeConfig, SimTransport};
//! use skylink_types::{Action, Priority};
//!
//! # tokio_test_block_on(async {
//! let sim = SimTransport::new();
//! let bridge = Bridge::new(BridgeConfig::default(), Arc::new(sim.clone()));
//! bridge.connect().await.unwrap();
//! bridge.send_command(bridge.command(Action::Land, Priority::High)).await.unwrap();
//! assert_eq!(sim.published().len(), 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use skylink_types::BridgeError;
use tokio::sync::mpsc;

use crate::transport::{BrokerTarget, Inbound, Transport, receiver_stream};

/// How the simulated broker answers the next `open`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Handshake {
    #[default]
    Accept,
    /// CONNACK with a non-zero return code.
    Refuse(u8),
    /// The host cannot be reached at all.
    Unreachable,
}

/// A payload handed to the simulated broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct SimBroker {
    handshake: Handshake,
    session: Option<mpsc::UnboundedSender<Inbound>>,
    last_target: Option<BrokerTarget>,
    subscriptions: Vec<String>,
    published: Vec<Published>,
    open_attempts: usize,
}

/// Cloneable handle to one simulated broker; clones share state.
#[derive(Clone, Default)]
pub struct SimTransport {
    inner: Arc<Mutex<SimBroker>>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome of subsequent `open` calls.
    pub fn set_handshake(&self, handshake: Handshake) {
        self.inner.lock().handshake = handshake;
    }

    /// Deliver a message on `topic` to the open session.
    ///
    /// Returns `false` when no session is open.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let inner = self.inner.lock();
        match &inner.session {
            Some(tx) => tx
                .send(Inbound::Publish {
                    topic: topic.to_string(),
                    payload: payload.into(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// End the open session as a network failure would.
    ///
    /// Returns `false` when no session is open.
    pub fn drop_connection(&self, reason: impl Into<String>) -> bool {
        match self.inner.lock().session.take() {
            Some(tx) => {
                let _ = tx.send(Inbound::ConnectionLost {
                    reason: Some(reason.into()),
                });
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner.lock().published.clone()
    }

    /// Topics subscribed during the current (or last) session.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().subscriptions.clone()
    }

    pub fn open_attempts(&self) -> usize {
        self.inner.lock().open_attempts
    }

    pub fn last_target(&self) -> Option<BrokerTarget> {
        self.inner.lock().last_target.clone()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn open(&self, target: &BrokerTarget) -> Result<BoxStream<'static, Inbound>, BridgeError> {
        let mut inner = self.inner.lock();
        inner.open_attempts += 1;
        inner.last_target = Some(target.clone());
        match inner.handshake {
            Handshake::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                inner.session = Some(tx);
                inner.subscriptions.clear();
                Ok(receiver_stream(rx))
            }
            Handshake::Refuse(code) => Err(BridgeError::ConnectFailed(format!("rc={code}"))),
            Handshake::Unreachable => Err(BridgeError::Transport(format!(
                "{} is unreachable",
                target.addr()
            ))),
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            return Err(BridgeError::Transport("no open session".to_string()));
        }
        inner.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            return Err(BridgeError::Transport("no open session".to_string()));
        }
        inner.published.push(Published {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BridgeError> {
        // Dropping the sender ends the inbound stream.
        self.inner.lock().session = None;
        Ok(())
    }
}
