//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier correlating a call request with its response
pub type CallId = u64;

/// A single frame on a duplex call connection
///
/// Either side of a connection may send requests; responses echo the id the
/// caller allocated so replies can arrive in any order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CallFrame {
    Request {
        id: CallId,
        method: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    Response {
        id: CallId,
        outcome: CallOutcome,
    },
}

impl CallFrame {
    pub fn id(&self) -> CallId {
        match self {
            CallFrame::Request { id, .. } | CallFrame::Response { id, .. } => *id,
        }
    }
}

/// Result of a call as seen on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CallOutcome {
    Ok(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Handler failure, reported verbatim to the caller
    Err(String),
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// Identity reported by an agent in answer to a `Metadata` call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMetadata {
    /// Logical name; the relay routes by this value
    pub name: String,
    pub hostname: String,
    pub platform: String, // e.g., "linux", "macos", "windows"
    pub version: String,  // Agent software version
    /// Free-form labels from the agent configuration
    pub labels: BTreeMap<String, String>,
    /// [`crate::PROTOCOL_VERSION`] the agent speaks
    pub protocol_version: u32,
}

impl AgentMetadata {
    /// Metadata for the local host under the given logical name
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            labels: BTreeMap::new(),
            protocol_version: crate::PROTOCOL_VERSION,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Current wall-clock time as Unix milliseconds, the heartbeat payload
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_serialization() {
        let frame = CallFrame::Request {
            id: 7,
            method: "Handle".to_string(),
            payload: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        };
        let serialized = bincode::serialize(&frame).unwrap();
        let deserialized: CallFrame = bincode::deserialize(&serialized).unwrap();
        assert_eq!(frame, deserialized);
        assert_eq!(deserialized.id(), 7);
    }

    #[test]
    fn test_error_outcome() {
        let frame = CallFrame::Response {
            id: 3,
            outcome: CallOutcome::Err("unknown method: Nope".to_string()),
        };
        let serialized = bincode::serialize(&frame).unwrap();
        let deserialized: CallFrame = bincode::deserialize(&serialized).unwrap();

        if let CallFrame::Response { id, outcome } = deserialized {
            assert_eq!(id, 3);
            assert_eq!(outcome, CallOutcome::Err("unknown method: Nope".to_string()));
        } else {
            panic!("Expected Response frame");
        }
    }

    #[test]
    fn test_agent_metadata() {
        let meta = AgentMetadata::local("node-a").with_label("region", "eu-west");
        assert_eq!(meta.name, "node-a");
        assert_eq!(meta.platform, std::env::consts::OS);
        assert_eq!(meta.labels.get("region").map(String::as_str), Some("eu-west"));

        let serialized = bincode::serialize(&meta).unwrap();
        let deserialized: AgentMetadata = bincode::deserialize(&serialized).unwrap();
        assert_eq!(meta, deserialized);
    }

    #[test]
    fn test_unix_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(unix_millis() > 1_577_836_800_000);
    }
}
