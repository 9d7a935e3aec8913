//! The transport seam.
//!
//! SkyLink never speaks to a bus library directly.  The
//! [`ConnectionManager`][crate::connection::ConnectionManager] drives a
//! [`Transport`], which owns the library-specific session and reports
//! everything that arrives asynchronously as a stream of [`Inbound`] values.
//!
//! # Implementations
//!
//! - [`MqttTransport`] – MQTT 3.1.1 session via `rumqttc`.
//! - [`SimTransport`][crate::sim::SimTransport] – in-memory broker for tests
//!   and offline runs.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use skylink_types::BridgeError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the client's outbound request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `close` waits for the network loop to flush the DISCONNECT.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Where and how to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    /// Transport-level liveness interval in seconds.
    pub keepalive_secs: u16,
    /// Upper bound on the TCP + handshake phase.
    pub connect_timeout: Duration,
}

impl BrokerTarget {
    pub fn new(host: impl Into<String>, port: u16, keepalive_secs: u16) -> Self {
        Self {
            host: host.into(),
            port,
            keepalive_secs,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `host:port`, for logs.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Something the transport observed after the session was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A message arrived on a subscribed topic.
    Publish { topic: String, payload: Vec<u8> },
    /// The session ended without being asked to.
    ConnectionLost { reason: Option<String> },
}

/// Every bus transport must implement this trait.
///
/// # Contract
///
/// * `open` – performs the handshake and resolves only once the broker has
///   accepted (or refused) the session.  The returned stream yields inbound
///   traffic until the session ends; it may end with
///   [`Inbound::ConnectionLost`] or simply terminate.
/// * `subscribe` / `publish` – only valid while a session is open.
///   `publish` must not wait on the network: a saturated or dead session is a
///   [`BridgeError::Transport`].
/// * `close` – ends the session. Closing an already closed transport is `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, target: &BrokerTarget) -> Result<BoxStream<'static, Inbound>, BridgeError>;

    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError>;

    async fn close(&self) -> Result<(), BridgeError>;
}

/// Wrap an unbounded receiver as a boxed stream.
pub(crate) fn receiver_stream(rx: mpsc::UnboundedReceiver<Inbound>) -> BoxStream<'static, Inbound> {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

struct MqttSession {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

/// [`Transport`] backed by a `rumqttc` MQTT client.
///
/// `open` drives the event loop until CONNACK, then moves it into a pump task
/// that forwards PUBLISH packets and the end of the session as [`Inbound`]
/// values.
pub struct MqttTransport {
    client_id: String,
    session: Mutex<Option<MqttSession>>,
}

impl MqttTransport {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<AsyncClient, BridgeError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or_else(|| BridgeError::Transport("no open MQTT session".to_string()))
    }

    fn options(&self, target: &BrokerTarget) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.client_id, &target.host, target.port);
        // Zero disables keepalive.
        opts.set_keep_alive(Duration::from_secs(target.keepalive_secs.into()));
        opts.set_clean_session(true);
        opts
    }
}

/// Poll `eventloop` until the broker answers the CONNECT.
async fn handshake(eventloop: &mut EventLoop) -> Result<(), BridgeError> {
    loop {
        match eventloop.poll().await {
            Ok(rumqttc::Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(refused(ack.code))
                };
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(refused(code));
            }
            Err(e) => return Err(BridgeError::Transport(e.to_string())),
        }
    }
}

/// Refusals carry the numeric CONNACK return code, e.g. `rc=5`.
fn refused(code: ConnectReturnCode) -> BridgeError {
    BridgeError::ConnectFailed(format!("rc={}", code as u8))
}

/// Forward inbound traffic until the session ends.
async fn pump(mut eventloop: EventLoop, tx: mpsc::UnboundedSender<Inbound>) {
    loop {
        match eventloop.poll().await {
            Ok(rumqttc::Event::Incoming(Packet::Publish(publish))) => {
                let msg = Inbound::Publish {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if tx.send(msg).is_err() {
                    break;
                }
            }
            // Requested by `close`; the stream just ends.
            Ok(rumqttc::Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Inbound::ConnectionLost {
                    reason: Some(e.to_string()),
                });
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn open(&self, target: &BrokerTarget) -> Result<BoxStream<'static, Inbound>, BridgeError> {
        if let Some(stale) = self.session.lock().take() {
            stale.pump.abort();
        }

        let (client, mut eventloop) = AsyncClient::new(self.options(target), REQUEST_CHANNEL_CAPACITY);
        debug!(broker = %target.addr(), client_id = %self.client_id, "opening MQTT session");

        match tokio::time::timeout(target.connect_timeout, handshake(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(BridgeError::Transport(format!(
                    "timed out after {:?} connecting to {}",
                    target.connect_timeout,
                    target.addr()
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(eventloop, tx));
        *self.session.lock() = Some(MqttSession { client, pump });
        info!(broker = %target.addr(), "MQTT session established");
        Ok(receiver_stream(rx))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BridgeError::Transport(format!("subscribe to {topic}: {e}")))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| BridgeError::Transport(format!("publish to {topic}: {e}")))
    }

    async fn close(&self) -> Result<(), BridgeError> {
        let Some(MqttSession { client, mut pump }) = self.session.lock().take() else {
            return Ok(());
        };
        if let Err(e) = client.disconnect().await {
            // The event loop is already gone; nothing left to close.
            debug!(error = %e, "MQTT disconnect request not delivered");
            pump.abort();
            return Ok(());
        }
        if tokio::time::timeout(CLOSE_GRACE, &mut pump).await.is_err() {
            warn!("MQTT network loop did not stop in time; aborting it");
            pump.abort();
        }
        Ok(())
    }
}
