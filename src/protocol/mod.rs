//! Protocol messages exchanged with the service over the realtime transport.
//!
//! All frames are variants of the closed enum [ProtocolMessage]; codecs reject anything they do
//!  not recognize with `Error::Decode` rather than skipping it.
//!
//! Client-originated frames are `Heartbeat`, `Attach`, `Detach`, `Message`, `Presence` and
//!  `Close`. `Message` and `Presence` carry a per-connection `msg_serial` assigned by the
//!  connection manager right before transmission, and are acknowledged by `Ack` / `Nack`
//!  frames covering `count` consecutive serials starting at `msg_serial`.
//!
//! Service-originated frames that belong to the connection's message stream (`Message`,
//!  `Presence`, `Sync`) carry a `connection_serial` which increases by one per frame.

pub mod binary_codec;
pub mod codec;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorInfo;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: Value) -> Message {
        Message {
            name: Some(name.into()),
            data,
            ..Message::default()
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PresenceAction {
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub action: PresenceAction,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction, client_id: impl Into<String>, data: Value) -> PresenceMessage {
        PresenceMessage {
            action,
            client_id: client_id.into(),
            connection_id: None,
            id: None,
            data,
            timestamp: None,
        }
    }

    /// A member is identified by client id *and* connection: the same client id may be present
    ///  through several connections at the same time
    pub fn member_key(&self) -> String {
        format!("{}:{}", self.connection_id.as_deref().unwrap_or(""), self.client_id)
    }

    /// `(msg_serial, index)` parsed from an id of the form `connection_id:msg_serial:index`,
    ///  if the id was assigned by the service for this message's own connection. Messages
    ///  synthesized by the service (e.g. a leave after a connection timed out) do not have such
    ///  an id.
    fn serial_position(&self) -> Option<(u64, u64)> {
        let id = self.id.as_deref()?;
        let connection_id = self.connection_id.as_deref()?;
        let rest = id.strip_prefix(connection_id)?.strip_prefix(':')?;
        let (serial, index) = rest.split_once(':')?;
        Some((serial.parse().ok()?, index.parse().ok()?))
    }

    /// Whether this message supersedes `other` for the same member. Messages from the member's
    ///  own connection are ordered by their serial position, everything else by timestamp (ties
    ///  go to the incoming message).
    pub fn is_newer_than(&self, other: &PresenceMessage) -> bool {
        if let (Some(mine), Some(theirs)) = (self.serial_position(), other.serial_position()) {
            return mine > theirs;
        }
        self.timestamp.unwrap_or(i64::MAX) >= other.timestamp.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub max_idle_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProtocolMessage {
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Ack {
        msg_serial: u64,
        count: u32,
    },
    Nack {
        msg_serial: u64,
        count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    Connected {
        connection_id: String,
        connection_key: String,
        connection_serial: i64,
        #[serde(default)]
        details: ConnectionDetails,
        /// set if a requested resume or recover was not possible
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    Close,
    Closed,
    /// connection-level error if `channel` is `None`, channel-level error otherwise
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        error: ErrorInfo,
    },
    Attach {
        channel: String,
    },
    Attached {
        channel: String,
        /// the channel's continuity was preserved across a resume
        #[serde(default)]
        resumed: bool,
        /// the channel has members, and a SYNC follows
        #[serde(default)]
        has_presence: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    Detach {
        channel: String,
    },
    Detached {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    Message {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_serial: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_serial: Option<i64>,
        #[serde(default)]
        messages: Vec<Message>,
    },
    Presence {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_serial: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_serial: Option<i64>,
        #[serde(default)]
        presence: Vec<PresenceMessage>,
    },
    /// part of a presence member set sync; all frames but the last carry a cursor
    Sync {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_serial: Option<i64>,
        #[serde(default)]
        presence: Vec<PresenceMessage>,
    },
}

impl ProtocolMessage {
    pub fn channel(&self) -> Option<&str> {
        match self {
            ProtocolMessage::Error { channel, .. } => channel.as_deref(),
            ProtocolMessage::Attach { channel }
            | ProtocolMessage::Attached { channel, .. }
            | ProtocolMessage::Detach { channel }
            | ProtocolMessage::Detached { channel, .. }
            | ProtocolMessage::Message { channel, .. }
            | ProtocolMessage::Presence { channel, .. }
            | ProtocolMessage::Sync { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// frames that are acknowledged by the service through ACK / NACK
    pub fn needs_ack(&self) -> bool {
        matches!(self, ProtocolMessage::Message { .. } | ProtocolMessage::Presence { .. })
    }

    pub fn set_msg_serial(&mut self, serial: u64) {
        match self {
            ProtocolMessage::Message { msg_serial, .. } | ProtocolMessage::Presence { msg_serial, .. } => {
                *msg_serial = Some(serial);
            }
            _ => {}
        }
    }

    pub fn connection_serial(&self) -> Option<i64> {
        match self {
            ProtocolMessage::Message { connection_serial, .. }
            | ProtocolMessage::Presence { connection_serial, .. }
            | ProtocolMessage::Sync { connection_serial, .. } => *connection_serial,
            _ => None,
        }
    }

    /// short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Heartbeat { .. } => "HEARTBEAT",
            ProtocolMessage::Ack { .. } => "ACK",
            ProtocolMessage::Nack { .. } => "NACK",
            ProtocolMessage::Connected { .. } => "CONNECTED",
            ProtocolMessage::Disconnected { .. } => "DISCONNECTED",
            ProtocolMessage::Close => "CLOSE",
            ProtocolMessage::Closed => "CLOSED",
            ProtocolMessage::Error { .. } => "ERROR",
            ProtocolMessage::Attach { .. } => "ATTACH",
            ProtocolMessage::Attached { .. } => "ATTACHED",
            ProtocolMessage::Detach { .. } => "DETACH",
            ProtocolMessage::Detached { .. } => "DETACHED",
            ProtocolMessage::Message { .. } => "MESSAGE",
            ProtocolMessage::Presence { .. } => "PRESENCE",
            ProtocolMessage::Sync { .. } => "SYNC",
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn presence(connection_id: &str, id: Option<&str>, timestamp: i64) -> PresenceMessage {
        PresenceMessage {
            action: PresenceAction::Present,
            client_id: "c".to_string(),
            connection_id: Some(connection_id.to_string()),
            id: id.map(|s| s.to_string()),
            data: json!(null),
            timestamp: Some(timestamp),
        }
    }

    #[rstest]
    #[case::serial_wins_over_timestamp(presence("cx", Some("cx:5:0"), 1), presence("cx", Some("cx:4:9"), 100), true)]
    #[case::index_breaks_tie(presence("cx", Some("cx:5:2"), 1), presence("cx", Some("cx:5:1"), 1), true)]
    #[case::older_serial(presence("cx", Some("cx:3:0"), 100), presence("cx", Some("cx:4:0"), 1), false)]
    #[case::same_position(presence("cx", Some("cx:4:0"), 1), presence("cx", Some("cx:4:0"), 1), false)]
    #[case::synthesized_newer_timestamp(presence("cx", Some("synthesized"), 10), presence("cx", Some("cx:4:0"), 5), true)]
    #[case::synthesized_older_timestamp(presence("cx", Some("synthesized"), 4), presence("cx", Some("cx:4:0"), 5), false)]
    #[case::equal_timestamps(presence("cx", None, 5), presence("cx", None, 5), true)]
    fn test_is_newer_than(#[case] incoming: PresenceMessage, #[case] existing: PresenceMessage, #[case] expected: bool) {
        assert_eq!(incoming.is_newer_than(&existing), expected);
    }

    #[test]
    fn test_member_key() {
        let msg = presence("conn-1", None, 0);
        assert_eq!(msg.member_key(), "conn-1:c");
    }

    #[rstest]
    #[case(ProtocolMessage::Message { channel: "a".to_string(), msg_serial: None, connection_serial: None, messages: vec![] }, true)]
    #[case(ProtocolMessage::Presence { channel: "a".to_string(), msg_serial: None, connection_serial: None, presence: vec![] }, true)]
    #[case(ProtocolMessage::Attach { channel: "a".to_string() }, false)]
    #[case(ProtocolMessage::Heartbeat { id: None }, false)]
    fn test_needs_ack(#[case] msg: ProtocolMessage, #[case] expected: bool) {
        assert_eq!(msg.needs_ack(), expected);
    }

    #[test]
    fn test_set_msg_serial() {
        let mut msg = ProtocolMessage::Message { channel: "a".to_string(), msg_serial: None, connection_serial: None, messages: vec![] };
        msg.set_msg_serial(7);
        assert!(matches!(msg, ProtocolMessage::Message { msg_serial: Some(7), .. }));

        let mut attach = ProtocolMessage::Attach { channel: "a".to_string() };
        attach.set_msg_serial(7);
        assert_eq!(attach, ProtocolMessage::Attach { channel: "a".to_string() });
    }
}
