//! Wire codec for the command and event paths.
//!
//! Outbound commands are serialised as a compact JSON object whose field
//! order is part of the receiver's compatibility surface:
//!
//! ```json
//! {"action":"LAND","timestamp":1700000000000,"source":"skylink-cli","mavsdk_command":"action.land()","priority":"high"}
//! ```
//!
//! Inbound payloads are never rejected: bytes that are not valid UTF-8 are
//! decoded lossily so hostile or malformed traffic still becomes a
//! well-formed [`Event`].

use serde::Serialize;
use skylink_types::{BridgeError, Command, Event};

#[derive(Serialize)]
struct WireCommand<'a> {
    action: &'static str,
    timestamp: i64,
    source: &'a str,
    mavsdk_command: &'static str,
    priority: &'static str,
}

/// Encode `command` into its wire payload.
///
/// # Errors
///
/// Returns [`BridgeError::Encode`] if serialisation fails. With the typed
/// [`Command`] input this does not happen in practice.
pub fn encode(command: &Command) -> Result<Vec<u8>, BridgeError> {
    let wire = WireCommand {
        action: command.action().as_str(),
        timestamp: command.issued_at_millis(),
        source: command.source(),
        mavsdk_command: command.action().mavsdk_command(),
        priority: command.priority().as_str(),
    };
    serde_json::to_vec(&wire).map_err(|e| BridgeError::Encode(e.to_string()))
}

/// Decode a message received on `topic` into an [`Event`]. Total.
pub fn decode(topic: &str, bytes: &[u8]) -> Event {
    Event::new(topic, String::from_utf8_lossy(bytes).into_owned())
}
