//! Wire protocol for FdxTunnel communication.
//!
//! Every tunnel text frame carries exactly one JSON object: a
//! [`RequestMessage`] travelling server -> agent, or a [`ResponseMessage`]
//! travelling agent -> server. Correlation is by `reqid` only.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result, FAILURE_STATUS};

/// Capacity of every bounded queue on either side of a tunnel
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Upper bound a caller waits for its response
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Path prefix agents dial to establish a channel; the target id follows it
pub const CHANNEL_PATH: &str = "/api/EstablishFullDuplexChannel";

/// Request forwarded through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Assigned by the caller side, never by the agent
    pub reqid: String,
    pub method: String,
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
}

/// Response carried back through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Echo of [`RequestMessage::reqid`]
    pub reqid: String,
    pub status: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
}

impl ResponseMessage {
    /// Response sent when forwarding failed: status 500, no headers, empty body.
    pub fn failure(reqid: impl Into<String>) -> Self {
        Self {
            reqid: reqid.into(),
            status: FAILURE_STATUS,
            headers: HashMap::new(),
            body: String::new(),
        }
    }
}

/// Serialize a message into one text frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<String> {
    serde_json::to_string(msg).map_err(Error::Encode)
}

/// Parse one text frame.
pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T> {
    serde_json::from_str(frame).map_err(Error::Decode)
}

/// Peers that marshal an empty map as `null` are accepted.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
