//! Channels: named message streams multiplexed over the connection. The [Channel] handle
//!  forwards every operation to the connection manager, where the channel's
//!  [engine::ChannelEngine] runs.

pub(crate) mod engine;
pub(crate) mod subscribers;

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use crate::connection::manager::Command;
use crate::connection::request;
use crate::error::{ErrorInfo, Result};
use crate::http::paginated::PaginatedResult;
use crate::presence::Presence;
use crate::protocol::Message;
use crate::rest::Rest;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
    /// for a transition to `attached`: the channel's message continuity was preserved
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub state: ChannelState,
    pub error_reason: Option<ErrorInfo>,
    /// connection serial at the time of the last attach
    pub attach_serial: Option<i64>,
}

impl Default for ChannelSnapshot {
    fn default() -> Self {
        ChannelSnapshot {
            state: ChannelState::Initialized,
            error_reason: None,
            attach_serial: None,
        }
    }
}

/// Handle to a channel, obtained from [Channels::get]
#[derive(Clone)]
pub struct Channel {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ChannelSnapshot>,
    events: broadcast::Sender<ChannelStateChange>,
    presence: Presence,
    rest: Rest,
}

impl Channel {
    fn new(name: &str, commands: mpsc::UnboundedSender<Command>, rest: Rest) -> Channel {
        let (snapshot_send, snapshot) = watch::channel(ChannelSnapshot::default());
        let (events, _) = broadcast::channel(128);
        let _ = commands.send(Command::RegisterChannel {
            name: name.to_string(),
            snapshot: snapshot_send,
            events: events.clone(),
        });

        Channel {
            name: name.to_string(),
            presence: Presence::new(name, commands.clone(), rest.clone()),
            commands,
            snapshot,
            events,
            rest,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.snapshot.borrow().error_reason.clone()
    }

    pub fn on_state_change(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.events.subscribe()
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Resolves when the channel is attached. No-op if it already is; fails immediately if the
    ///  connection is failed or closed. While the connection is suspended, the attach waits for
    ///  the connection to come back.
    pub async fn attach(&self) -> Result<()> {
        request(&self.commands, |reply| Command::Attach { channel: self.name.clone(), reply }).await
    }

    /// Resolves when the channel is detached. Messages still queued for the channel fail.
    pub async fn detach(&self) -> Result<()> {
        request(&self.commands, |reply| Command::Detach { channel: self.name.clone(), reply }).await
    }

    pub async fn publish(&self, name: impl Into<String>, data: Value) -> Result<()> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    /// Publishes the messages in a single frame, resolving when the service acknowledges them.
    ///  Publishing on a channel that is not attached attaches it, the messages are sent once
    ///  the channel is attached.
    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<()> {
        request(&self.commands, |reply| Command::Publish { channel: self.name.clone(), messages, reply }).await
    }

    /// All messages on the channel, in the order they are received
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Message> {
        self.subscribe_filtered(None)
    }

    /// Messages with the given name
    pub fn subscribe_name(&self, name: impl Into<String>) -> mpsc::UnboundedReceiver<Message> {
        self.subscribe_filtered(Some(name.into()))
    }

    fn subscribe_filtered(&self, filter: Option<String>) -> mpsc::UnboundedReceiver<Message> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Subscribe { channel: self.name.clone(), filter, sender });
        receiver
    }

    /// Message history through the REST API
    pub async fn history(&self, params: &[(&str, &str)]) -> Result<PaginatedResult<Message>> {
        self.rest.history(&self.name, params).await
    }
}

/// Registry of the client's channels
#[derive(Clone)]
pub struct Channels {
    commands: mpsc::UnboundedSender<Command>,
    rest: Rest,
    channels: Arc<Mutex<FxHashMap<String, Channel>>>,
}

impl Channels {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, rest: Rest) -> Channels {
        Channels {
            commands,
            rest,
            channels: Default::default(),
        }
    }

    /// The channel with the given name, created on first use. Repeated calls return handles to
    ///  the same channel.
    pub fn get(&self, name: &str) -> Channel {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.entry(name.to_string())
            .or_insert_with(|| {
                debug!("creating channel {}", name);
                Channel::new(name, self.commands.clone(), self.rest.clone())
            })
            .clone()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut result = self.channels.lock().unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// Detaches the channel and removes it from the registry. Operations on existing handles
    ///  fail with a channel error, a later `get` creates a new channel.
    pub fn release(&self, name: &str) {
        let removed = self.channels.lock().unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if removed.is_some() {
            let _ = self.commands.send(Command::ReleaseChannel { name: name.to_string() });
        }
    }
}
