//! `skylink-middleware` – The Message Bridge
//!
//! Moves operator commands onto a publish/subscribe bus and brings vehicle
//! status and telemetry back to a poll-driven consumer.
//!
//! # Modules
//!
//! - [`codec`] – command → JSON payload, bytes → [`Event`][skylink_types::Event].
//! - [`queue`] – unbounded FIFO between the delivery task and the consumer.
//! - [`transport`] – the [`Transport`] seam and its MQTT implementation.
//! - [`sim`] – in-memory broker for tests and offline runs.
//! - [`connection`] – session lifecycle and the connection state machine.
//! - [`bridge`] – the consumer-facing [`Bridge`].

pub mod bridge;
pub mod codec;
pub mod connection;
pub mod queue;
pub mod sim;
pub mod transport;

pub use bridge::{Bridge, BridgeConfig, TopicSet};
pub use connection::{ConnectionManager, DISCONNECTED_NOTICE};
pub use queue::EventQueue;
pub use sim::{Handshake, SimTransport};
pub use transport::{BrokerTarget, Inbound, MqttTransport, Transport};
