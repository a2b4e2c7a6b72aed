//! Presence: the set of clients present on a channel, synchronized from the service, and the
//!  operations for entering this client into it.

pub(crate) mod engine;
pub(crate) mod member_map;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::connection::manager::Command;
use crate::connection::request;
use crate::error::Result;
use crate::http::paginated::PaginatedResult;
use crate::protocol::{PresenceAction, PresenceMessage};
use crate::rest::Rest;

#[derive(Clone)]
pub struct Presence {
    channel: String,
    commands: mpsc::UnboundedSender<Command>,
    rest: Rest,
}

impl Presence {
    pub(crate) fn new(channel: &str, commands: mpsc::UnboundedSender<Command>, rest: Rest) -> Presence {
        Presence {
            channel: channel.to_string(),
            commands,
            rest,
        }
    }

    async fn act(&self, action: PresenceAction, client_id: Option<String>, data: Value) -> Result<()> {
        request(&self.commands, |reply| Command::PresenceAct {
            channel: self.channel.clone(),
            action,
            client_id,
            data,
            reply,
        }).await
    }

    /// Enters this client, using the configured client id. Fails if the channel is not attached
    ///  or the client is already present.
    pub async fn enter(&self, data: Value) -> Result<()> {
        self.act(PresenceAction::Enter, None, data).await
    }

    /// Updates this client's data, entering it if it is not present
    pub async fn update(&self, data: Value) -> Result<()> {
        self.act(PresenceAction::Update, None, data).await
    }

    pub async fn leave(&self, data: Value) -> Result<()> {
        self.act(PresenceAction::Leave, None, data).await
    }

    pub async fn enter_client(&self, client_id: impl Into<String>, data: Value) -> Result<()> {
        self.act(PresenceAction::Enter, Some(client_id.into()), data).await
    }

    pub async fn update_client(&self, client_id: impl Into<String>, data: Value) -> Result<()> {
        self.act(PresenceAction::Update, Some(client_id.into()), data).await
    }

    pub async fn leave_client(&self, client_id: impl Into<String>, data: Value) -> Result<()> {
        self.act(PresenceAction::Leave, Some(client_id.into()), data).await
    }

    /// Snapshot of the current members, waiting for an ongoing sync to complete
    pub async fn get(&self) -> Result<Vec<PresenceMessage>> {
        request(&self.commands, |reply| Command::PresenceGet { channel: self.channel.clone(), reply }).await
    }

    /// Presence events in the order they occur, optionally only those with the given action
    pub fn subscribe(&self, filter: Option<PresenceAction>) -> mpsc::UnboundedReceiver<PresenceMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::PresenceSubscribe { channel: self.channel.clone(), filter, sender });
        receiver
    }

    /// Presence history through the REST API
    pub async fn history(&self, params: &[(&str, &str)]) -> Result<PaginatedResult<PresenceMessage>> {
        self.rest.presence_history(&self.channel, params).await
    }
}
