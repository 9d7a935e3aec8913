//! [`ConnectionManager`] – owns the bus session and its state machine.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │
//!      │                      error           lost / disconnect
//!      │                        ▼                  │
//!      │                  Failed(reason)           │
//!      │                        │                  │
//!      │                  connect/reconnect        │
//!      │                        ▼                  │
//!      │                   Connecting              │
//!      └───────────────────────────────────────────┘
//! ```
//!
//! Retries are always operator-driven: nothing here reconnects in the
//! background.
//!
//! # Delivery context
//!
//! Once connected, a single Tokio task consumes the transport's [`Inbound`]
//! stream.  It decodes messages into the [`EventQueue`] and, when the session
//! is lost, performs the `Connected → Disconnected` transition and queues a
//! `SYSTEM` "Disconnected" event.  That is the only logic that runs there.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use skylink_types::{BridgeError, ConnectionState, Event};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec;
use crate::queue::EventQueue;
use crate::transport::{BrokerTarget, Inbound, Transport};

/// Payload of the `SYSTEM` event queued whenever the session ends.
pub const DISCONNECTED_NOTICE: &str = "Disconnected";

const TAG_DISCONNECTED: u8 = 0;
const TAG_CONNECTING: u8 = 1;
const TAG_CONNECTED: u8 = 2;
const TAG_FAILED: u8 = 3;

fn tag_of(state: &ConnectionState) -> u8 {
    match state {
        ConnectionState::Disconnected => TAG_DISCONNECTED,
        ConnectionState::Connecting => TAG_CONNECTING,
        ConnectionState::Connected => TAG_CONNECTED,
        ConnectionState::Failed(_) => TAG_FAILED,
    }
}

// ---------------------------------------------------------------------------
// State cell
// ---------------------------------------------------------------------------

/// The authoritative [`ConnectionState`]: an atomic tag plus the failure
/// reason.  Reads of the tag are lock-free.
#[derive(Debug)]
pub(crate) struct StateCell {
    tag: AtomicU8,
    reason: Mutex<String>,
}

impl StateCell {
    fn new() -> Self {
        Self {
            tag: AtomicU8::new(TAG_DISCONNECTED),
            reason: Mutex::new(String::new()),
        }
    }

    fn is_connected(&self) -> bool {
        self.tag.load(Ordering::Acquire) == TAG_CONNECTED
    }

    fn load(&self) -> ConnectionState {
        match self.tag.load(Ordering::Acquire) {
            TAG_CONNECTING => ConnectionState::Connecting,
            TAG_CONNECTED => ConnectionState::Connected,
            TAG_FAILED => ConnectionState::Failed(self.reason.lock().clone()),
            _ => ConnectionState::Disconnected,
        }
    }

    /// Move to `next` if the state machine allows it from the current state.
    ///
    /// Returns `false` (and changes nothing) for an illegal transition or if
    /// another context changed the state first.
    fn transition(&self, next: ConnectionState) -> bool {
        let current = self.load();
        if !current.can_transition_to(&next) {
            return false;
        }
        let next_tag = tag_of(&next);
        if let ConnectionState::Failed(reason) = next {
            *self.reason.lock() = reason;
        }
        self.tag
            .compare_exchange(tag_of(&current), next_tag, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Owns the transport session, the connection state, and the delivery task.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    queue: Arc<EventQueue>,
    state: Arc<StateCell>,
    subscriptions: Vec<String>,
    reconnect_delay: Duration,
    target: Mutex<Option<BrokerTarget>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    /// Serialises connect / disconnect / reconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager that will subscribe to `subscriptions` on every
    /// successful connect and deliver into `queue`.
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<EventQueue>,
        subscriptions: Vec<String>,
    ) -> Self {
        Self {
            transport,
            queue,
            state: Arc::new(StateCell::new()),
            subscriptions,
            reconnect_delay: Duration::from_secs(1),
            target: Mutex::new(None),
            delivery: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Pause between the disconnect and connect halves of
    /// [`reconnect`][Self::reconnect] (builder-style).
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Lock-free check for `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// The target of the most recent [`connect`][Self::connect].
    pub fn target(&self) -> Option<BrokerTarget> {
        self.target.lock().clone()
    }

    /// Establish the session and subscribe to the fixed topic set.
    ///
    /// A no-op while already connected.  On failure the state becomes
    /// [`ConnectionState::Failed`] and one `SYSTEM` event carrying the reason
    /// is queued.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ConnectFailed`] when the broker refuses the handshake,
    /// [`BridgeError::Transport`] for network or subscription failures.
    pub async fn connect(&self, target: BrokerTarget) -> Result<(), BridgeError> {
        let _guard = self.lifecycle.lock().await;
        self.connect_locked(target).await
    }

    /// Close the session and queue a `SYSTEM` "Disconnected" event, even if
    /// there was no session.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        let _guard = self.lifecycle.lock().await;
        self.disconnect_locked().await
    }

    /// Disconnect, wait for the reconnect delay, then connect again to the
    /// stored target.  At most one reconnect runs at a time.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NoTarget`] if [`connect`][Self::connect] was never
    /// called, otherwise whatever the new connect attempt reports.
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        let _guard = self.lifecycle.lock().await;
        let target = self.target().ok_or(BridgeError::NoTarget)?;
        info!(broker = %target.addr(), "reconnecting");

        if let Err(e) = self.disconnect_locked().await {
            warn!(error = %e, "disconnect before reconnect failed; connecting anyway");
        }
        if !self.reconnect_delay.is_zero() {
            tokio::time::sleep(self.reconnect_delay).await;
        }
        self.connect_locked(target).await
    }

    /// Hand an encoded payload to the transport.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.transport.publish(topic, payload).await
    }

    // -----------------------------------------------------------------------
    // Internal helpers (caller holds `lifecycle`)
    // -----------------------------------------------------------------------

    async fn connect_locked(&self, target: BrokerTarget) -> Result<(), BridgeError> {
        if self.state.is_connected() {
            debug!(broker = %target.addr(), "connect ignored; already connected");
            return Ok(());
        }
        *self.target.lock() = Some(target.clone());

        // A session that was lost remotely leaves a finished task behind.
        if let Some(stale) = self.delivery.lock().take() {
            stale.abort();
        }

        if !self.state.transition(ConnectionState::Connecting) {
            warn!(state = %self.state.load(), "unexpected state at connect");
        }
        info!(broker = %target.addr(), keepalive_secs = target.keepalive_secs, "connecting");

        match self.open_and_subscribe(&target).await {
            Ok(inbound) => {
                // Connected before the task starts, so a session that dies
                // immediately still takes the lost-session path.
                self.state.transition(ConnectionState::Connected);
                let handle = spawn_delivery(inbound, Arc::clone(&self.state), Arc::clone(&self.queue));
                *self.delivery.lock() = Some(handle);
                info!(broker = %target.addr(), topics = ?self.subscriptions, "connected");
                Ok(())
            }
            Err(e) => {
                let reason = match &e {
                    BridgeError::ConnectFailed(r) | BridgeError::Transport(r) => r.clone(),
                    other => other.to_string(),
                };
                warn!(broker = %target.addr(), reason = %reason, "connection failed");
                self.state.transition(ConnectionState::Failed(reason.clone()));
                self.queue.push(Event::system(format!("Connection failed ({reason})")));
                Err(e)
            }
        }
    }

    async fn open_and_subscribe(
        &self,
        target: &BrokerTarget,
    ) -> Result<BoxStream<'static, Inbound>, BridgeError> {
        let inbound = self.transport.open(target).await?;
        for topic in &self.subscriptions {
            if let Err(e) = self.transport.subscribe(topic).await {
                let _ = self.transport.close().await;
                return Err(e);
            }
        }
        Ok(inbound)
    }

    async fn disconnect_locked(&self) -> Result<(), BridgeError> {
        // Stop delivery first so the lost-session path cannot also report
        // this disconnect.
        let delivery = self.delivery.lock().take();
        if let Some(handle) = delivery {
            handle.abort();
            let _ = handle.await;
        }

        let closed = self.transport.close().await;
        if self.state.transition(ConnectionState::Disconnected) {
            info!("disconnected");
        }
        self.queue.push(Event::system(DISCONNECTED_NOTICE));
        if let Err(e) = &closed {
            warn!(error = %e, "transport close failed");
        }
        closed
    }
}

/// Start the delivery task for one session.
fn spawn_delivery(
    mut inbound: BoxStream<'static, Inbound>,
    state: Arc<StateCell>,
    queue: Arc<EventQueue>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reason = None;
        while let Some(item) = inbound.next().await {
            match item {
                Inbound::Publish { topic, payload } => {
                    debug!(topic = %topic, bytes = payload.len(), "message received");
                    queue.push(codec::decode(&topic, &payload));
                }
                Inbound::ConnectionLost { reason: r } => {
                    reason = r;
                    break;
                }
            }
        }
        if state.transition(ConnectionState::Disconnected) {
            warn!(reason = reason.as_deref().unwrap_or("stream ended"), "connection lost");
            queue.push(Event::system(DISCONNECTED_NOTICE));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Handshake, SimTransport};
    use skylink_types::SYSTEM_TOPIC;

    fn target() -> BrokerTarget {
        BrokerTarget::new("broker.example", 1883, 60)
    }

    fn manager(sim: &SimTransport) -> (Arc<EventQueue>, ConnectionManager) {
        let queue = Arc::new(EventQueue::new());
        let mgr = ConnectionManager::new(
            Arc::new(sim.clone()),
            Arc::clone(&queue),
            vec!["mavsdk/status".to_string(), "mavsdk/telemetry".to_string()],
        )
        .with_reconnect_delay(Duration::ZERO);
        (queue, mgr)
    }

    /// Poll `cond` until it holds, yielding to the delivery task in between.
    async fn settle(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn system_events(events: &[Event]) -> Vec<&Event> {
        events.iter().filter(|e| e.topic == SYSTEM_TOPIC).collect()
    }

    #[test]
    fn state_cell_rejects_illegal_transitions() {
        let cell = StateCell::new();
        assert!(!cell.transition(ConnectionState::Connected));
        assert_eq!(cell.load(), ConnectionState::Disconnected);

        assert!(cell.transition(ConnectionState::Connecting));
        assert!(cell.transition(ConnectionState::Failed("rc=5".to_string())));
        assert!(!cell.transition(ConnectionState::Disconnected));
        assert_eq!(cell.load(), ConnectionState::Failed("rc=5".to_string()));

        assert!(cell.transition(ConnectionState::Connecting));
        assert!(cell.transition(ConnectionState::Connected));
        assert!(cell.is_connected());
        assert!(cell.transition(ConnectionState::Disconnected));
        assert!(!cell.transition(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let sim = SimTransport::new();
        let (queue, mgr) = manager(&sim);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(!mgr.is_connected());
        assert!(mgr.target().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn connect_subscribes_fixed_topics() {
        let sim = SimTransport::new();
        let (queue, mgr) = manager(&sim);

        mgr.connect(target()).await.unwrap();

        assert!(mgr.is_connected());
        assert_eq!(sim.subscriptions(), vec!["mavsdk/status", "mavsdk/telemetry"]);
        assert_eq!(mgr.target(), Some(target()));
        assert!(queue.is_empty(), "a successful connect queues nothing");
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_connected() {
        let sim = SimTransport::new();
        let (_queue, mgr) = manager(&sim);

        mgr.connect(target()).await.unwrap();
        mgr.connect(target()).await.unwrap();

        assert_eq!(sim.open_attempts(), 1);
        assert!(mgr.is_connected());
    }

    #[tokio::test]
    async fn unreachable_host_fails_with_one_system_event() {
        let sim = SimTransport::new();
        sim.set_handshake(Handshake::Unreachable);
        let (queue, mgr) = manager(&sim);

        let err = mgr.connect(target()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(matches!(mgr.state(), ConnectionState::Failed(r) if r.contains("unreachable")));

        let events = queue.drain_all();
        assert_eq!(events.len(), 1);
        assert_eq!(system_events(&events).len(), 1);
        assert!(events[0].payload.starts_with("Connection failed ("));
    }

    #[tokio::test]
    async fn refused_handshake_carries_return_code() {
        let sim = SimTransport::new();
        sim.set_handshake(Handshake::Refuse(5));
        let (queue, mgr) = manager(&sim);

        let err = mgr.connect(target()).await.unwrap_err();
        assert_eq!(err, BridgeError::ConnectFailed("rc=5".to_string()));
        assert_eq!(mgr.state(), ConnectionState::Failed("rc=5".to_string()));
        assert_eq!(queue.drain_all()[0].payload, "Connection failed (rc=5)");
    }

    #[tokio::test]
    async fn reconnect_from_failed_reattempts_connect() {
        let sim = SimTransport::new();
        sim.set_handshake(Handshake::Unreachable);
        let (queue, mgr) = manager(&sim);
        assert!(mgr.connect(target()).await.is_err());

        sim.set_handshake(Handshake::Accept);
        mgr.reconnect().await.unwrap();

        assert_eq!(sim.open_attempts(), 2);
        assert!(mgr.is_connected());
        let events = queue.drain_all();
        // Failure notice, then the disconnect notice from the reconnect.
        assert_eq!(events.len(), 2);
        assert!(events[0].payload.starts_with("Connection failed"));
        assert_eq!(events[1].payload, DISCONNECTED_NOTICE);
    }

    #[tokio::test]
    async fn failed_reconnect_stays_failed_and_reports_again() {
        let sim = SimTransport::new();
        sim.set_handshake(Handshake::Refuse(3));
        let (queue, mgr) = manager(&sim);
        assert!(mgr.connect(target()).await.is_err());
        assert!(mgr.reconnect().await.is_err());

        assert_eq!(mgr.state(), ConnectionState::Failed("rc=3".to_string()));
        let failures = queue
            .drain_all()
            .into_iter()
            .filter(|e| e.payload.starts_with("Connection failed"))
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn reconnect_without_target_is_error() {
        let sim = SimTransport::new();
        let (_queue, mgr) = manager(&sim);
        assert_eq!(mgr.reconnect().await.unwrap_err(), BridgeError::NoTarget);
        assert_eq!(sim.open_attempts(), 0);
    }

    #[tokio::test]
    async fn reconnect_while_connected_cycles_the_session() {
        let sim = SimTransport::new();
        let (queue, mgr) = manager(&sim);
        mgr.connect(target()).await.unwrap();

        mgr.reconnect().await.unwrap();

        assert!(mgr.is_connected());
        assert_eq!(sim.open_attempts(), 2);
        let events = queue.drain_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, DISCONNECTED_NOTICE);
    }

    #[tokio::test]
    async fn delivery_task_queues_messages_in_order() {
        let sim = SimTransport::new();
        let (queue, mgr) = manager(&sim);
        mgr.connect(target()).await.unwrap();

        for i in 0..50 {
            assert!(sim.inject("mavsdk/telemetry", format!("alt={i}")));
        }
        settle(|| queue.len() == 50).await;

        let payloads: Vec<_> = queue.drain_all().into_iter().map(|e| e.payload).collect();
        let expected: Vec<_> = (0..50).map(|i| format!("alt={i}")).collect();
        assert_eq!(payloads, expected);
    }

    #[tokio::test]
    async fn lost_session_moves_to_disconnected_with_one_notice() {
        let sim = SimTransport::new();
        let (queue, mgr) = manager(&sim);
        mgr.connect(target()).await.unwrap();

        assert!(sim.drop_connection("keepalive timeout"));
        settle(|| !mgr.is_connected()).await;
        settle(|| !queue.is_empty()).await;

        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        let events = queue.drain_all();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_system());
        assert_eq!(events[0].payload, DISCONNECTED_NOTICE);
    }

    #[tokio::test]
    async fn connect_after_lost_session_recovers() {
        let sim = SimTransport::new();
        let (_queue, mgr) = manager(&sim);
        mgr.connect(target()).await.unwrap();
        sim.drop_connection("reset");
        settle(|| !mgr.is_connected()).await;

        mgr.connect(target()).await.unwrap();
        assert!(mgr.is_connected());
        assert!(sim.inject("mavsdk/status", "back"));
    }

    #[tokio::test]
    async fn disconnect_reports_once_even_when_already_disconnected() {
        let sim = SimTransport::new();
        let (queue, mgr) = manager(&sim);

        mgr.disconnect().await.unwrap();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(queue.drain_all().len(), 1);

        mgr.connect(target()).await.unwrap();
        mgr.disconnect().await.unwrap();
        // Give a would-be duplicate from the delivery task a chance to show up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let events = queue.drain_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, DISCONNECTED_NOTICE);
        assert!(!sim.is_open());
    }

    #[tokio::test]
    async fn disconnect_from_failed_keeps_failed() {
        let sim = SimTransport::new();
        sim.set_handshake(Handshake::Refuse(2));
        let (_queue, mgr) = manager(&sim);
        let _ = mgr.connect(target()).await;

        mgr.disconnect().await.unwrap();
        assert!(matches!(mgr.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reconnects_are_serialised() {
        let sim = SimTransport::new();
        let (_queue, mgr) = manager(&sim);
        let mgr = Arc::new(mgr);
        mgr.connect(target()).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.reconnect().await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert!(mgr.is_connected());
        assert_eq!(sim.open_attempts(), 9);
        assert!(sim.is_open());
    }
}
