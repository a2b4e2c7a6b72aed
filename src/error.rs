use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelState;
use crate::connection::ConnectionState;

/// Error details as reported by the service, either in a protocol frame or in the body of an
///  HTTP error response. Locally generated errors use the same shape so callers can handle both
///  uniformly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: u32,
    pub status_code: u16,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            code,
            status_code,
            message: message.into(),
        }
    }

    /// Token / credential errors that a credential refresh may fix
    pub fn is_token_error(&self) -> bool {
        (40140..40150).contains(&self.code)
    }

    /// Any authentication or authorization rejection
    pub fn is_auth_error(&self) -> bool {
        self.status_code == 401 || (40100..40200).contains(&self.code)
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.code, self.status_code, self.message)
    }
}

pub mod codes {
    pub const BAD_REQUEST: u32 = 40000;
    pub const INVALID_CHANNEL_NAME: u32 = 40010;
    pub const MISSING_CLIENT_ID: u32 = 40012;
    pub const UNAUTHORIZED: u32 = 40100;
    pub const TOKEN_EXPIRED: u32 = 40142;
    pub const PERMISSION_DENIED: u32 = 40160;
    pub const INTERNAL: u32 = 50000;
    pub const TIMEOUT: u32 = 50003;
    pub const CONNECTION_FAILED: u32 = 80000;
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    pub const CONNECTION_DISCONNECTED: u32 = 80003;
    pub const MESSAGE_CONTINUITY_LOST: u32 = 80008;
    pub const CONNECTION_CLOSED: u32 = 80017;
    pub const QUEUE_OVERFLOW: u32 = 80020;
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;
    pub const CHANNEL_DETACHED: u32 = 90001;
    pub const CHANNEL_ATTACH_TIMEOUT: u32 = 90007;
    pub const PRESENCE_DUPLICATE_ENTER: u32 = 91004;
    pub const PRESENCE_NOT_PRESENT: u32 = 91005;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("client {client_id} is already present on channel {channel}")]
    AlreadyPresent { channel: String, client_id: String },
    #[error("client {client_id} is not present on channel {channel}")]
    NotPresent { channel: String, client_id: String },
    #[error("presence requires an attached channel, {channel} is {state:?}")]
    NotAttached { channel: String, state: ChannelState },
    #[error("presence requires a client id")]
    MissingClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// transport-level failure; retried internally, surfaced only where an operation needs it
    #[error("connection error: {0}")]
    Connection(ErrorInfo),
    #[error("authentication error: {0}")]
    Auth(ErrorInfo),
    #[error("channel {channel}: {info}")]
    Channel { channel: String, info: ErrorInfo },
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    /// HTTP request failure after `attempts` tries; `retryable` tells whether the last failure
    ///  was of a kind that is retried against fallback hosts
    #[error("request failed after {attempts} attempt(s): {info}")]
    Request { info: ErrorInfo, retryable: bool, attempts: u32 },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("operation not possible while connection is {0:?}")]
    InvalidState(ConnectionState),
    #[error("connection is suspended: {0}")]
    Suspended(ErrorInfo),
    #[error("outbound queue is full ({limit} messages)")]
    QueueOverflow { limit: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn channel(channel: impl Into<String>, code: u32, message: impl Into<String>) -> Error {
        Error::Channel {
            channel: channel.into(),
            info: ErrorInfo::new(code, 400, message),
        }
    }

    pub fn detached(channel: impl Into<String>) -> Error {
        let channel = channel.into();
        let message = format!("channel {} was detached", channel);
        Error::Channel {
            channel,
            info: ErrorInfo::new(codes::CHANNEL_DETACHED, 400, message),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Error {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// The error an operation settles with when the connection leaves the usable states
    pub fn for_connection_state(state: ConnectionState, reason: Option<&ErrorInfo>) -> Error {
        match (state, reason) {
            (ConnectionState::Suspended, Some(info)) => Error::Suspended(info.clone()),
            (ConnectionState::Suspended, None) => Error::Suspended(ErrorInfo::new(codes::CONNECTION_SUSPENDED, 503, "connection suspended")),
            (ConnectionState::Failed, Some(info)) if info.is_auth_error() => Error::Auth(info.clone()),
            _ => Error::InvalidState(state),
        }
    }

    /// The `ErrorInfo` describing this error, synthesizing one for local errors
    pub fn info(&self) -> ErrorInfo {
        match self {
            Error::Connection(info) | Error::Auth(info) | Error::Suspended(info) => info.clone(),
            Error::Channel { info, .. } | Error::Request { info, .. } => info.clone(),
            Error::Presence(PresenceError::AlreadyPresent { .. }) => ErrorInfo::new(codes::PRESENCE_DUPLICATE_ENTER, 400, self.to_string()),
            Error::Presence(PresenceError::NotPresent { .. }) => ErrorInfo::new(codes::PRESENCE_NOT_PRESENT, 400, self.to_string()),
            Error::Presence(PresenceError::MissingClientId) => ErrorInfo::new(codes::MISSING_CLIENT_ID, 400, self.to_string()),
            Error::Presence(PresenceError::NotAttached { .. }) => ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 400, self.to_string()),
            Error::Timeout { .. } => ErrorInfo::new(codes::TIMEOUT, 504, self.to_string()),
            Error::Decode(_) => ErrorInfo::new(codes::BAD_REQUEST, 400, self.to_string()),
            Error::InvalidState(ConnectionState::Closed) | Error::InvalidState(ConnectionState::Closing) => ErrorInfo::new(codes::CONNECTION_CLOSED, 400, self.to_string()),
            Error::InvalidState(_) => ErrorInfo::new(codes::CONNECTION_FAILED, 400, self.to_string()),
            Error::QueueOverflow { .. } => ErrorInfo::new(codes::QUEUE_OVERFLOW, 503, self.to_string()),
            Error::Config(_) => ErrorInfo::new(codes::BAD_REQUEST, 400, self.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
