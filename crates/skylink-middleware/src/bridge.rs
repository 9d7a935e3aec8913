//! [`Bridge`] – the consumer-facing message bridge.
//!
//! Composition root wiring the [`ConnectionManager`], the [`EventQueue`] and
//! the [`codec`].  A consumer (REPL, UI render loop, test) holds one bridge
//! for the life of the process and:
//!
//! 1. calls [`Bridge::send_command`] to publish an operator command;
//! 2. polls [`Bridge::drain_events`] on its own cadence for status,
//!    telemetry and `SYSTEM` notices, in arrival order;
//! 3. reads [`Bridge::is_connected`] / [`Bridge::state`] and triggers
//!    [`Bridge::reconnect`] when the operator asks for it.
//!
//! Commands are fire-and-forget: there is no acknowledgement or retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use skylink_types::{Action, BridgeError, Command, ConnectionState, Event, Priority};
use tracing::{info, warn};

use crate::codec;
use crate::connection::ConnectionManager;
use crate::queue::EventQueue;
use crate::transport::{BrokerTarget, MqttTransport, Transport};

/// Topic names on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    /// Outbound commands.
    pub command: String,
    /// Inbound vehicle status.
    pub status: String,
    /// Inbound telemetry.
    pub telemetry: String,
}

impl TopicSet {
    /// The topics subscribed at connect time.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![self.status.clone(), self.telemetry.clone()]
    }
}

impl Default for TopicSet {
    fn default() -> Self {
        Self {
            command: "mavsdk/command".to_string(),
            status: "mavsdk/status".to_string(),
            telemetry: "mavsdk/telemetry".to_string(),
        }
    }
}

/// Configuration bundle for [`Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub target: BrokerTarget,
    /// MQTT client identifier.
    pub client_id: String,
    /// Stamped into every command built with [`Bridge::command`].
    pub source: String,
    pub topics: TopicSet,
    /// Pause between the disconnect and connect halves of a reconnect.
    pub reconnect_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            target: BrokerTarget::new("broker.emqx.io", 1883, 60),
            client_id: format!("skylink_{}", Utc::now().timestamp()),
            source: "skylink".to_string(),
            topics: TopicSet::default(),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// The message bridge.  Construct once, share by reference.
pub struct Bridge {
    config: BridgeConfig,
    queue: Arc<EventQueue>,
    connection: ConnectionManager,
}

impl Bridge {
    /// Create a bridge over an arbitrary [`Transport`].
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Self {
        let queue = Arc::new(EventQueue::new());
        let connection = ConnectionManager::new(
            transport,
            Arc::clone(&queue),
            config.topics.subscriptions(),
        )
        .with_reconnect_delay(config.reconnect_delay);
        Self {
            config,
            queue,
            connection,
        }
    }

    /// Create a bridge that talks MQTT, using `config.client_id`.
    pub fn mqtt(config: BridgeConfig) -> Self {
        let transport = Arc::new(MqttTransport::new(config.client_id.clone()));
        Self::new(config, transport)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Build a command from this bridge's source id, stamped now.
    pub fn command(&self, action: Action, priority: Priority) -> Command {
        Command::new(action, self.config.source.clone(), priority)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Connect to the configured broker target.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.connection.connect(self.config.target.clone()).await
    }

    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.connection.disconnect().await
    }

    /// Disconnect, pause, connect again.  See
    /// [`ConnectionManager::reconnect`].
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        self.connection.reconnect().await
    }

    /// End-of-life teardown.  Close errors are logged, not returned.
    pub async fn shutdown(&self) {
        if let Err(e) = self.connection.disconnect().await {
            warn!(error = %e, "error while shutting down bridge");
        }
    }

    // -----------------------------------------------------------------------
    // Consumer API
    // -----------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Publish `command` on the command topic.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::NotConnected`] when not connected; nothing is sent.
    ///   Connectivity is checked, not locked: a session lost between the
    ///   check and the publish surfaces as a transport error instead.
    /// * [`BridgeError::Encode`] / [`BridgeError::Transport`] from the codec
    ///   or the transport.
    pub async fn send_command(&self, command: Command) -> Result<(), BridgeError> {
        if !self.connection.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let payload = codec::encode(&command)?;
        self.connection
            .publish(&self.config.topics.command, payload)
            .await?;
        info!(
            action = %command.action(),
            priority = %command.priority(),
            topic = %self.config.topics.command,
            "command sent"
        );
        Ok(())
    }

    /// Everything received since the last call, oldest first.  Never blocks.
    pub fn drain_events(&self) -> Vec<Event> {
        self.queue.drain_all()
    }
}
