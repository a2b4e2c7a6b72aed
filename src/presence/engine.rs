use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::channel::subscribers::Subscribers;
use crate::channel::ChannelState;
use crate::connection::queue::{AckWaiter, Outbox, PresenceRollback};
use crate::error::{Error, PresenceError, Result};
use crate::presence::member_map::{is_last_sync_frame, PresenceMap};
use crate::protocol::{PresenceAction, PresenceMessage, ProtocolMessage};

/// Presence state of one channel: the member set as announced by the service, and the members
///  this client entered itself (its "local members").
pub struct PresenceEngine {
    channel: String,
    members: PresenceMap,
    /// client id -> data of the members entered through this client
    local_members: FxHashMap<String, Value>,
    subscribers: Subscribers<PresenceMessage, PresenceAction>,
    /// `false` from attaching until the member set is known, i.e. until the first ATTACHED
    ///  without presence or the end of the first SYNC
    sync_complete: bool,
    get_waiters: Vec<oneshot::Sender<Result<Vec<PresenceMessage>>>>,
}

impl PresenceEngine {
    pub fn new(channel: impl Into<String>) -> PresenceEngine {
        PresenceEngine {
            channel: channel.into(),
            members: Default::default(),
            local_members: Default::default(),
            subscribers: Default::default(),
            sync_complete: false,
            get_waiters: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, filter: Option<PresenceAction>, sender: mpsc::UnboundedSender<PresenceMessage>) {
        self.subscribers.add(filter, sender);
    }

    /// Enter, update or leave on behalf of `client_id`. The local member set is updated
    ///  optimistically, and rolled back if the service rejects the presence frame.
    pub fn act(&mut self, channel_state: ChannelState, action: PresenceAction, client_id: Option<String>, data: Value, reply: oneshot::Sender<Result<()>>, out: &mut Outbox) {
        match self.prepare(channel_state, action, client_id, data) {
            Ok((msg, rollback)) => {
                let waiter = AckWaiter {
                    reply: Some(reply),
                    rollback: Some(rollback),
                };
                out.send(self.frame(vec![msg]), waiter);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn prepare(&mut self, channel_state: ChannelState, action: PresenceAction, client_id: Option<String>, data: Value) -> Result<(PresenceMessage, PresenceRollback)> {
        if channel_state != ChannelState::Attached {
            return Err(PresenceError::NotAttached { channel: self.channel.clone(), state: channel_state }.into());
        }
        let client_id = client_id.ok_or(PresenceError::MissingClientId)?;
        let previous = self.local_members.get(&client_id).cloned();

        let (wire_action, data) = match (action, &previous) {
            (PresenceAction::Enter, Some(_)) => {
                return Err(PresenceError::AlreadyPresent { channel: self.channel.clone(), client_id }.into());
            }
            (PresenceAction::Leave, None) => {
                return Err(PresenceError::NotPresent { channel: self.channel.clone(), client_id }.into());
            }
            (PresenceAction::Leave, Some(prev)) => {
                let data = if data.is_null() { prev.clone() } else { data };
                self.local_members.remove(&client_id);
                (PresenceAction::Leave, data)
            }
            // an update for a client that is not present enters it
            (PresenceAction::Update, None) | (PresenceAction::Enter, None) => {
                self.local_members.insert(client_id.clone(), data.clone());
                (PresenceAction::Enter, data)
            }
            (PresenceAction::Update, Some(_)) => {
                self.local_members.insert(client_id.clone(), data.clone());
                (PresenceAction::Update, data)
            }
            (PresenceAction::Present, _) | (PresenceAction::Absent, _) => {
                return Err(Error::channel(&self.channel, crate::error::codes::BAD_REQUEST, format!("{:?} is not a client presence action", action)));
            }
        };

        debug!("presence {:?} for {} on {}", wire_action, client_id, self.channel);
        let rollback = PresenceRollback {
            channel: self.channel.clone(),
            client_id: client_id.clone(),
            previous,
        };
        Ok((PresenceMessage::new(wire_action, client_id, data), rollback))
    }

    fn frame(&self, presence: Vec<PresenceMessage>) -> ProtocolMessage {
        ProtocolMessage::Presence {
            channel: self.channel.clone(),
            msg_serial: None,
            connection_serial: None,
            presence,
        }
    }

    pub fn rollback(&mut self, rollback: PresenceRollback) {
        debug!("rolling back local presence of {} on {}", rollback.client_id, self.channel);
        match rollback.previous {
            Some(data) => {
                self.local_members.insert(rollback.client_id, data);
            }
            None => {
                self.local_members.remove(&rollback.client_id);
            }
        }
    }

    pub fn is_locally_present(&self, client_id: &str) -> bool {
        self.local_members.contains_key(client_id)
    }

    /// Snapshot of the member set. While the member set is being synchronized, the reply is
    ///  deferred until the sync is complete.
    pub fn get(&mut self, channel_state: ChannelState, reply: oneshot::Sender<Result<Vec<PresenceMessage>>>) {
        let waiting_for_sync = matches!(channel_state, ChannelState::Attaching | ChannelState::Attached)
            && (!self.sync_complete || self.members.is_syncing());
        if waiting_for_sync {
            trace!("deferring presence get on {} until sync completes", self.channel);
            self.get_waiters.push(reply);
        }
        else {
            let _ = reply.send(Ok(self.members.values()));
        }
    }

    pub fn members(&self) -> Vec<PresenceMessage> {
        self.members.values()
    }

    pub fn on_attached(&mut self, has_presence: bool, resumed: bool, out: &mut Outbox) {
        if has_presence {
            self.members.start_sync();
        }
        else {
            for event in self.members.clear() {
                self.emit(&event);
            }
            self.complete_sync();
        }

        if !resumed {
            let mut local_members = self.local_members.iter()
                .map(|(client_id, data)| (client_id.clone(), data.clone()))
                .collect::<Vec<_>>();
            local_members.sort_by(|a, b| a.0.cmp(&b.0));
            for (client_id, data) in local_members {
                debug!("re-entering {} on {}", client_id, self.channel);
                let msg = PresenceMessage::new(PresenceAction::Enter, client_id, data);
                out.send(self.frame(vec![msg]), AckWaiter::default());
            }
        }
    }

    pub fn on_presence(&mut self, presence: Vec<PresenceMessage>) {
        for msg in presence {
            if let Some(event) = self.members.put(msg) {
                self.emit(&event);
            }
        }
    }

    pub fn on_sync(&mut self, cursor: Option<&str>, presence: Vec<PresenceMessage>) {
        self.members.start_sync();
        for msg in presence {
            self.members.put_synced(msg);
        }
        if is_last_sync_frame(cursor) {
            for event in self.members.end_sync() {
                self.emit(&event);
            }
            self.complete_sync();
        }
    }

    fn complete_sync(&mut self) {
        self.sync_complete = true;
        let members = self.members.values();
        for waiter in self.get_waiters.drain(..) {
            let _ = waiter.send(Ok(members.clone()));
        }
    }

    /// The channel is attaching again without continuity, the member set must be rebuilt
    pub fn on_attaching(&mut self) {
        self.sync_complete = false;
    }

    /// The channel was detached or failed: the member set and the local members are forgotten
    pub fn on_detached(&mut self, error: &Error) {
        let _ = self.members.clear();
        self.local_members.clear();
        self.sync_complete = false;
        self.fail_waiters(error);
    }

    /// The channel was suspended: members are kept, local members are re-entered on re-attach
    pub fn on_suspended(&mut self, error: &Error) {
        self.fail_waiters(error);
    }

    fn fail_waiters(&mut self, error: &Error) {
        for waiter in self.get_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn emit(&mut self, event: &PresenceMessage) {
        trace!("presence event on {}: {:?} {}", self.channel, event.action, event.member_key());
        self.subscribers.deliver(event, |filter| *filter == event.action);
    }
}
