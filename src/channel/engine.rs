use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::channel::subscribers::Subscribers;
use crate::channel::{ChannelSnapshot, ChannelState, ChannelStateChange};
use crate::config::ClientOptions;
use crate::connection::queue::{AckWaiter, Outbound, OutboundQueue, Outbox, PresenceRollback, PushOutcome};
use crate::connection::ConnectionState;
use crate::error::{codes, Error, ErrorInfo, Result};
use crate::presence::engine::PresenceEngine;
use crate::protocol::{Message, PresenceAction, PresenceMessage, ProtocolMessage};

/// What a channel needs to know about its connection while handling an event
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub connection_state: ConnectionState,
    pub connection_reason: Option<ErrorInfo>,
    pub connection_serial: Option<i64>,
    pub client_id: Option<String>,
    pub options: Arc<ClientOptions>,
    pub now: Instant,
}

impl ChannelContext {
    fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// the error channel operations fail with in the current connection state, if any
    fn connection_error(&self) -> Option<Error> {
        match self.connection_state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                Some(Error::for_connection_state(self.connection_state, self.connection_reason.as_ref()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ChannelTimer {
    AttachTimeout,
    DetachTimeout,
    Retry,
}

/// Attach / detach state machine of a single channel, together with the messages queued until
///  the channel is attached, its subscribers and its presence state.
pub struct ChannelEngine {
    name: String,
    state: ChannelState,
    reason: Option<ErrorInfo>,
    attach_serial: Option<i64>,

    snapshot: watch::Sender<ChannelSnapshot>,
    events: broadcast::Sender<ChannelStateChange>,

    attach_waiters: Vec<oneshot::Sender<Result<()>>>,
    detach_waiters: Vec<oneshot::Sender<Result<()>>>,
    pending: OutboundQueue,
    timer: Option<(Instant, ChannelTimer)>,

    subscribers: Subscribers<Message, String>,
    presence: PresenceEngine,
}

impl ChannelEngine {
    pub fn new(name: impl Into<String>, options: &ClientOptions, snapshot: watch::Sender<ChannelSnapshot>, events: broadcast::Sender<ChannelStateChange>) -> ChannelEngine {
        let name = name.into();
        ChannelEngine {
            presence: PresenceEngine::new(name.clone()),
            name,
            state: ChannelState::Initialized,
            reason: None,
            attach_serial: None,
            snapshot,
            events,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            pending: OutboundQueue::new(options.max_queued_messages, options.queue_overflow_policy),
            timer: None,
            subscribers: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.map(|(deadline, _)| deadline)
    }

    fn set_state(&mut self, state: ChannelState, reason: Option<ErrorInfo>, resumed: bool) {
        let previous = self.state;
        if previous != state {
            info!("channel {}: {:?} -> {:?}", self.name, previous, state);
        }
        self.state = state;
        self.reason = reason.clone();

        let attach_serial = self.attach_serial;
        self.snapshot.send_modify(|s| {
            s.state = state;
            s.error_reason = reason.clone();
            s.attach_serial = attach_serial;
        });
        let event = ChannelStateChange { previous, current: state, reason, resumed };
        trace!("channel event: {:?}", event);
        let _ = self.events.send(event);
    }

    fn settle_all(waiters: &mut Vec<oneshot::Sender<Result<()>>>, result: Result<()>) {
        for waiter in waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn send_attach(&mut self, ctx: &ChannelContext, out: &mut Outbox) {
        if ctx.is_connected() {
            debug!("sending ATTACH for {}", self.name);
            out.send_unacked(ProtocolMessage::Attach { channel: self.name.clone() });
            self.timer = Some((ctx.now + ctx.options.realtime_request_timeout, ChannelTimer::AttachTimeout));
        }
        else {
            // sent when the connection is connected
            self.timer = None;
        }
    }

    fn start_attach(&mut self, ctx: &ChannelContext, reason: Option<ErrorInfo>, out: &mut Outbox) {
        if self.state == ChannelState::Detaching {
            let error = Error::channel(&self.name, codes::CHANNEL_OPERATION_FAILED, "detach was superseded by attach");
            Self::settle_all(&mut self.detach_waiters, Err(error));
        }
        self.presence.on_attaching();
        self.set_state(ChannelState::Attaching, reason, false);
        self.send_attach(ctx, out);
    }

    pub fn attach(&mut self, ctx: &ChannelContext, reply: Option<oneshot::Sender<Result<()>>>, out: &mut Outbox) {
        if let Some(error) = ctx.connection_error() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(error));
            }
            return;
        }

        match self.state {
            ChannelState::Attached => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            ChannelState::Attaching => {
                self.attach_waiters.extend(reply);
            }
            _ => {
                self.attach_waiters.extend(reply);
                self.start_attach(ctx, None, out);
            }
        }
    }

    pub fn detach(&mut self, ctx: &ChannelContext, reply: Option<oneshot::Sender<Result<()>>>, out: &mut Outbox) {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            ChannelState::Failed => {
                if let Some(reply) = reply {
                    let info = self.reason.clone()
                        .unwrap_or_else(|| ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 400, "channel failed"));
                    let _ = reply.send(Err(Error::Channel { channel: self.name.clone(), info }));
                }
            }
            ChannelState::Detaching => {
                self.detach_waiters.extend(reply);
            }
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended => {
                self.detach_waiters.extend(reply);
                let detached = Error::detached(&self.name);
                Self::settle_all(&mut self.attach_waiters, Err(detached.clone()));
                self.fail_pending(&detached);

                if ctx.is_connected() {
                    debug!("sending DETACH for {}", self.name);
                    out.send_unacked(ProtocolMessage::Detach { channel: self.name.clone() });
                    self.set_state(ChannelState::Detaching, None, false);
                    self.timer = Some((ctx.now + ctx.options.realtime_request_timeout, ChannelTimer::DetachTimeout));
                }
                else {
                    self.to_detached(None, detached);
                }
            }
        }
    }

    /// settles everything outstanding: attach waiters and queued messages fail with `error`,
    ///  detach waiters succeed
    fn to_detached(&mut self, reason: Option<ErrorInfo>, error: Error) {
        self.timer = None;
        Self::settle_all(&mut self.attach_waiters, Err(error.clone()));
        Self::settle_all(&mut self.detach_waiters, Ok(()));
        self.fail_pending(&error);
        self.presence.on_detached(&error);
        self.set_state(ChannelState::Detached, reason, false);
    }

    fn to_failed(&mut self, reason: ErrorInfo, error: Error) {
        self.timer = None;
        Self::settle_all(&mut self.attach_waiters, Err(error.clone()));
        Self::settle_all(&mut self.detach_waiters, Err(error.clone()));
        self.fail_pending(&error);
        self.presence.on_detached(&error);
        self.set_state(ChannelState::Failed, Some(reason), false);
    }

    fn to_suspended(&mut self, ctx: &ChannelContext, reason: ErrorInfo, error: Error, retry: bool) {
        Self::settle_all(&mut self.attach_waiters, Err(error.clone()));
        self.presence.on_suspended(&error);
        self.timer = if retry {
            Some((ctx.now + ctx.options.channel_retry_timeout, ChannelTimer::Retry))
        }
        else {
            None
        };
        self.set_state(ChannelState::Suspended, Some(reason), false);
    }

    pub fn publish(&mut self, ctx: &ChannelContext, messages: Vec<Message>, reply: oneshot::Sender<Result<()>>, out: &mut Outbox) {
        if let Some(error) = ctx.connection_error() {
            let _ = reply.send(Err(error));
            return;
        }
        if !ctx.options.queue_messages && !ctx.is_connected() {
            let error = match ctx.connection_state {
                ConnectionState::Suspended => Error::for_connection_state(ctx.connection_state, ctx.connection_reason.as_ref()),
                _ => Error::Connection(ctx.connection_reason.clone()
                    .unwrap_or_else(|| ErrorInfo::new(codes::CONNECTION_DISCONNECTED, 400, "not connected and queueing is disabled"))),
            };
            let _ = reply.send(Err(error));
            return;
        }

        let frame = ProtocolMessage::Message {
            channel: self.name.clone(),
            msg_serial: None,
            connection_serial: None,
            messages,
        };
        let item = Outbound::new(frame, AckWaiter::new(reply));

        match self.state {
            ChannelState::Failed => {
                let info = self.reason.clone()
                    .unwrap_or_else(|| ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 400, "channel failed"));
                let _ = item.fail(Error::Channel { channel: self.name.clone(), info });
            }
            ChannelState::Attached => {
                out.frames.push(item);
            }
            ChannelState::Attaching | ChannelState::Suspended => {
                self.enqueue(item, out);
            }
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Detaching => {
                debug!("publish on {:?} channel {} triggers attach", self.state, self.name);
                self.start_attach(ctx, None, out);
                self.enqueue(item, out);
            }
        }
    }

    fn enqueue(&mut self, item: Outbound, out: &mut Outbox) {
        let mut rollbacks = Vec::new();
        if self.pending.push(item, &mut rollbacks) == PushOutcome::FailConnection {
            out.fail_connection = Some(Error::QueueOverflow { limit: self.pending.len() }.info());
        }
        for rollback in rollbacks {
            self.presence.rollback(rollback);
        }
    }

    fn fail_pending(&mut self, error: &Error) {
        for rollback in self.pending.fail_all(error) {
            self.presence.rollback(rollback);
        }
    }

    /// Frames sent on a connection the service did not resume go back to the front of the queue,
    ///  to be sent again once the channel is attached
    pub fn requeue(&mut self, items: Vec<Outbound>) {
        if self.state == ChannelState::Attaching {
            self.pending.push_front_all(items);
            return;
        }
        for item in items {
            if let Some(rollback) = item.fail(Error::detached(&self.name)) {
                self.presence.rollback(rollback);
            }
        }
    }

    pub fn subscribe(&mut self, filter: Option<String>, sender: mpsc::UnboundedSender<Message>) {
        self.subscribers.add(filter, sender);
    }

    pub fn presence_subscribe(&mut self, filter: Option<PresenceAction>, sender: mpsc::UnboundedSender<PresenceMessage>) {
        self.presence.subscribe(filter, sender);
    }

    pub fn presence_act(&mut self, ctx: &ChannelContext, action: PresenceAction, client_id: Option<String>, data: Value, reply: oneshot::Sender<Result<()>>, out: &mut Outbox) {
        if let Some(error) = ctx.connection_error() {
            let _ = reply.send(Err(error));
            return;
        }
        let client_id = client_id.or_else(|| ctx.client_id.clone());
        self.presence.act(self.state, action, client_id, data, reply, out);
    }

    pub fn presence_get(&mut self, reply: oneshot::Sender<Result<Vec<PresenceMessage>>>) {
        self.presence.get(self.state, reply);
    }

    pub fn presence_rollback(&mut self, rollback: PresenceRollback) {
        self.presence.rollback(rollback);
    }

    pub fn on_connected(&mut self, ctx: &ChannelContext, resumed: bool, out: &mut Outbox) {
        match self.state {
            ChannelState::Attaching => self.send_attach(ctx, out),
            ChannelState::Suspended => self.start_attach(ctx, None, out),
            ChannelState::Attached if !resumed => {
                debug!("connection was not resumed, re-attaching {}", self.name);
                self.start_attach(ctx, ctx.connection_reason.clone(), out);
            }
            ChannelState::Detaching if resumed => {
                out.send_unacked(ProtocolMessage::Detach { channel: self.name.clone() });
                self.timer = Some((ctx.now + ctx.options.realtime_request_timeout, ChannelTimer::DetachTimeout));
            }
            ChannelState::Detaching => {
                self.to_detached(None, Error::detached(&self.name));
            }
            _ => {}
        }
    }

    /// The transport was lost. Requests in flight are repeated once connected again, so their
    ///  timeouts no longer apply.
    pub fn on_connection_interrupted(&mut self) {
        self.timer = None;
    }

    /// Queued messages and attach requests are kept, the channel re-attaches once the connection
    ///  is connected again. Presence waiters fail since the member set is stale.
    pub fn on_connection_suspended(&mut self, reason: &ErrorInfo) {
        match self.state {
            ChannelState::Attached | ChannelState::Attaching => {
                self.timer = None;
                self.presence.on_suspended(&Error::Suspended(reason.clone()));
                self.set_state(ChannelState::Suspended, Some(reason.clone()), false);
            }
            ChannelState::Detaching => self.to_detached(None, Error::detached(&self.name)),
            _ => {}
        }
    }

    pub fn on_connection_closed(&mut self) {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed => {}
            _ => self.to_detached(None, Error::InvalidState(ConnectionState::Closed)),
        }
    }

    pub fn on_connection_failed(&mut self, reason: &ErrorInfo) {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed => {}
            _ => self.to_failed(reason.clone(), Error::for_connection_state(ConnectionState::Failed, Some(reason))),
        }
    }

    pub fn on_frame(&mut self, ctx: &ChannelContext, msg: ProtocolMessage, out: &mut Outbox) {
        match msg {
            ProtocolMessage::Attached { resumed, has_presence, error, .. } => self.on_attached(ctx, resumed, has_presence, error, out),
            ProtocolMessage::Detached { error, .. } => self.on_detached(ctx, error, out),
            ProtocolMessage::Error { error, .. } => {
                warn!("channel {} failed: {}", self.name, error);
                let channel_error = Error::Channel { channel: self.name.clone(), info: error.clone() };
                self.to_failed(error, channel_error);
            }
            ProtocolMessage::Message { messages, .. } => {
                if self.state != ChannelState::Attached {
                    debug!("dropping message(s) for {:?} channel {}", self.state, self.name);
                    return;
                }
                for msg in messages {
                    self.subscribers.deliver(&msg, |filter| msg.name.as_deref() == Some(filter.as_str()));
                }
            }
            ProtocolMessage::Presence { presence, .. } => {
                if self.state == ChannelState::Attached {
                    self.presence.on_presence(presence);
                }
            }
            ProtocolMessage::Sync { cursor, presence, .. } => {
                if self.state == ChannelState::Attached {
                    self.presence.on_sync(cursor.as_deref(), presence);
                }
            }
            other => debug!("ignoring {} for channel {}", other.kind(), self.name),
        }
    }

    fn on_attached(&mut self, ctx: &ChannelContext, resumed: bool, has_presence: bool, error: Option<ErrorInfo>, out: &mut Outbox) {
        match self.state {
            ChannelState::Attaching => {
                self.timer = None;
                self.attach_serial = ctx.connection_serial;
                self.set_state(ChannelState::Attached, error, resumed);
                Self::settle_all(&mut self.attach_waiters, Ok(()));
                self.presence.on_attached(has_presence, resumed, out);

                let queued = self.pending.drain();
                if !queued.is_empty() {
                    debug!("flushing {} queued message(s) on {}", queued.len(), self.name);
                }
                out.frames.extend(queued);
            }
            ChannelState::Attached => {
                // attached again by the service, e.g. after it lost continuity
                self.set_state(ChannelState::Attached, error, resumed);
                self.presence.on_attached(has_presence, resumed, out);
            }
            _ => debug!("ignoring ATTACHED for {:?} channel {}", self.state, self.name),
        }
    }

    fn on_detached(&mut self, ctx: &ChannelContext, error: Option<ErrorInfo>, out: &mut Outbox) {
        match self.state {
            ChannelState::Detaching => self.to_detached(error, Error::detached(&self.name)),
            ChannelState::Attaching => {
                let reason = error.unwrap_or_else(|| ErrorInfo::new(codes::CHANNEL_DETACHED, 400, "attach was rejected"));
                warn!("attach of {} rejected: {}", self.name, reason);
                let channel_error = Error::Channel { channel: self.name.clone(), info: reason.clone() };
                self.to_suspended(ctx, reason, channel_error, true);
            }
            ChannelState::Attached => {
                info!("channel {} detached by the service, re-attaching", self.name);
                self.start_attach(ctx, error, out);
            }
            _ => debug!("ignoring DETACHED for {:?} channel {}", self.state, self.name),
        }
    }

    /// Handles an expired timer, if any
    pub fn on_timer(&mut self, ctx: &ChannelContext, out: &mut Outbox) {
        let timer = match self.timer {
            Some((deadline, timer)) if deadline <= ctx.now => timer,
            _ => return,
        };
        self.timer = None;

        let timeout = ctx.options.realtime_request_timeout;
        match timer {
            ChannelTimer::AttachTimeout => {
                warn!("attach of {} timed out", self.name);
                let reason = ErrorInfo::new(codes::CHANNEL_ATTACH_TIMEOUT, 408, format!("attach timed out after {:?}", timeout));
                self.to_suspended(ctx, reason, Error::timeout(format!("attach {}", self.name), timeout), true);
            }
            ChannelTimer::DetachTimeout => {
                warn!("detach of {} timed out", self.name);
                let reason = ErrorInfo::new(codes::TIMEOUT, 408, format!("detach timed out after {:?}", timeout));
                Self::settle_all(&mut self.detach_waiters, Err(Error::timeout(format!("detach {}", self.name), timeout)));
                self.set_state(ChannelState::Attached, Some(reason), true);
            }
            ChannelTimer::Retry => {
                if self.state == ChannelState::Suspended && ctx.is_connected() {
                    debug!("retrying attach of {}", self.name);
                    self.start_attach(ctx, None, out);
                }
            }
        }
    }
}
