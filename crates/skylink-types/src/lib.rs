use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Topic used for synthetic events raised by the bridge itself
/// (connection failures, disconnect notices).
pub const SYSTEM_TOPIC: &str = "SYSTEM";

/// Discrete actions an operator may ask the vehicle to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Land,
    /// Stop and hold position.
    Brake,
    Takeoff,
    ReturnToLaunch,
    Arm,
    Disarm,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Land,
        Action::Brake,
        Action::Takeoff,
        Action::ReturnToLaunch,
        Action::Arm,
        Action::Disarm,
    ];

    /// Wire tag, e.g. `"LAND"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Land => "LAND",
            Action::Brake => "BRAKE",
            Action::Takeoff => "TAKEOFF",
            Action::ReturnToLaunch => "RETURN_TO_LAUNCH",
            Action::Arm => "ARM",
            Action::Disarm => "DISARM",
        }
    }

    /// Name of the MAVSDK call the vehicle-side receiver invokes for this
    /// action.
    pub fn mavsdk_command(self) -> &'static str {
        match self {
            Action::Land => "action.land()",
            Action::Brake => "action.hold()",
            Action::Takeoff => "action.takeoff()",
            Action::ReturnToLaunch => "action.return_to_launch()",
            Action::Arm => "action.arm()",
            Action::Disarm => "action.disarm()",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = BridgeError;

    /// Case-insensitive; accepts `RTL` as a shorthand for `RETURN_TO_LAUNCH`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_uppercase();
        if tag == "RTL" {
            return Ok(Action::ReturnToLaunch);
        }
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == tag)
            .ok_or_else(|| BridgeError::Encode(format!("unrecognized action tag '{s}'")))
    }
}

/// Delivery priority attached to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "high" => Ok(Priority::High),
            _ => Err(BridgeError::Encode(format!("unrecognized priority tag '{s}'"))),
        }
    }
}

/// An operator command addressed to the vehicle.
///
/// Fields are private so a command cannot change once built; the bridge takes
/// it by value and encodes it exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    action: Action,
    issued_at_millis: i64,
    source: String,
    priority: Priority,
}

impl Command {
    /// Build a command stamped with the current wall-clock time.
    pub fn new(action: Action, source: impl Into<String>, priority: Priority) -> Self {
        Self::with_timestamp(action, Utc::now().timestamp_millis(), source, priority)
    }

    /// Build a command with an explicit issue time (milliseconds since epoch).
    pub fn with_timestamp(
        action: Action,
        issued_at_millis: i64,
        source: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            action,
            issued_at_millis,
            source: source.into(),
            priority,
        }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn issued_at_millis(&self) -> i64 {
        self.issued_at_millis
    }

    /// Identifier of the sending instance, e.g. `"skylink-cli"`.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

/// A message observed on the bus (or raised by the bridge on [`SYSTEM_TOPIC`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Local identity; not part of the wire format.
    pub id: Uuid,
    pub topic: String,
    pub payload: String,
    /// Local receipt time.
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// A synthetic event on [`SYSTEM_TOPIC`].
    pub fn system(message: impl Into<String>) -> Self {
        Self::new(SYSTEM_TOPIC, message)
    }

    pub fn is_system(&self) -> bool {
        self.topic == SYSTEM_TOPIC
    }

    /// Render as `[HH:MM:SS] topic: payload` in local time.
    pub fn log_line(&self) -> String {
        let ts = self.received_at.with_timezone(&Local).format("%H:%M:%S");
        format!("[{ts}] {}: {}", self.topic, self.payload)
    }
}

/// Connectivity of the bridge's bus session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// ```text
    /// Disconnected -> Connecting -> Connected -> Disconnected
    ///                 Connecting -> Failed -> Connecting
    /// ```
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed(_))
                | (Connected, Disconnected)
                | (Failed(_), Connecting)
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Errors surfaced by the bridge to its consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Encode Error: {0}")]
    Encode(String),

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("No broker target configured; connect first")]
    NoTarget,
}
