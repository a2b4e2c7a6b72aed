//! The realtime connection: its public handle, states and events. All state lives in the
//!  [manager::ConnectionManager] event loop; the handle talks to it through commands and
//!  observes it through a `watch` snapshot and a `broadcast` of state changes.

pub mod backoff;
pub(crate) mod manager;
pub(crate) mod queue;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{trace, warn};

use crate::connection::manager::Command;
use crate::error::{Error, ErrorInfo, Result};
use crate::protocol::{ConnectionDetails, ProtocolMessage};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// states from which the connection does not reconnect by itself
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// A state transition, or an update (`previous == current`) reporting an error that did not
///  change the state
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorInfo>,
    /// delay until the next automatic reconnect, if one is scheduled
    pub retry_in: Option<Duration>,
}

impl ConnectionStateChange {
    pub fn is_update(&self) -> bool {
        self.previous == self.current
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub id: Option<String>,
    pub key: Option<String>,
    pub serial: Option<i64>,
    pub error_reason: Option<ErrorInfo>,
    pub details: Option<ConnectionDetails>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        ConnectionSnapshot {
            state: ConnectionState::Initialized,
            id: None,
            key: None,
            serial: None,
            error_reason: None,
            details: None,
        }
    }
}

pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionStateChange>,
}
impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(128);
        ConnectionEventNotifier { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionStateChange) {
        trace!("connection event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

/// The state a new client instance needs to continue the connection of a previous instance,
///  see `ClientOptions::recover`
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryKey {
    pub connection_key: String,
    pub connection_serial: i64,
}

impl RecoveryKey {
    pub fn encode(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_default()
    }

    /// NB: a malformed key is logged and ignored, degrading to a fresh connection
    pub fn parse(s: &str) -> Option<RecoveryKey> {
        match serde_json::from_str(s) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("ignoring malformed recovery key: {}", e);
                None
            }
        }
    }
}

fn manager_gone() -> Error {
    Error::InvalidState(ConnectionState::Closed)
}

/// Sends a command carrying a reply channel and waits for the reply
pub(crate) async fn request<T>(commands: &mpsc::UnboundedSender<Command>, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
    let (send, recv) = oneshot::channel();
    commands.send(command(send))
        .map_err(|_| manager_gone())?;
    recv.await
        .map_err(|_| manager_gone())?
}

/// Handle to the realtime connection. Cloning is cheap, all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    events: std::sync::Arc<ConnectionEventNotifier>,
}

impl Connection {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, snapshot: watch::Receiver<ConnectionSnapshot>, events: std::sync::Arc<ConnectionEventNotifier>) -> Connection {
        Connection { commands, snapshot, events }
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn id(&self) -> Option<String> {
        self.snapshot.borrow().id.clone()
    }

    pub fn key(&self) -> Option<String> {
        self.snapshot.borrow().key.clone()
    }

    pub fn serial(&self) -> Option<i64> {
        self.snapshot.borrow().serial
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.snapshot.borrow().error_reason.clone()
    }

    pub fn details(&self) -> Option<ConnectionDetails> {
        self.snapshot.borrow().details.clone()
    }

    /// Serialized [RecoveryKey] for the current connection, `None` while there is no connection
    ///  the service could still recover
    pub fn recovery_key(&self) -> Option<String> {
        let snapshot = self.snapshot.borrow();
        if !matches!(snapshot.state, ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Disconnected) {
            return None;
        }
        let key = RecoveryKey {
            connection_key: snapshot.key.clone()?,
            connection_serial: snapshot.serial.unwrap_or(-1),
        };
        Some(key.encode())
    }

    /// Every state change from now on, including updates. Receivers that fall behind by more
    ///  than the channel capacity lose the oldest events.
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.events.subscribe()
    }

    /// Waits until the connection is in `state`, returning immediately if it already is
    pub async fn when_state(&self, state: ConnectionState) -> Result<()> {
        let mut snapshot = self.snapshot.clone();
        snapshot.wait_for(|s| s.state == state).await
            .map_err(|_| manager_gone())?;
        Ok(())
    }

    /// Connects unless already connecting or connected. The result is observable through state
    ///  changes.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Sends a raw protocol frame. Frames that the service acknowledges are queued while the
    ///  connection is not connected.
    pub fn send(&self, msg: ProtocolMessage) {
        let _ = self.commands.send(Command::Send { msg });
    }

    /// Round trip time of a heartbeat exchanged with the service
    pub async fn ping(&self) -> Result<Duration> {
        request(&self.commands, |reply| Command::Ping { reply }).await
    }
}
