use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::auth::{Authenticator, Credential, CredentialState};
use crate::channel::engine::{ChannelContext, ChannelEngine};
use crate::channel::{ChannelSnapshot, ChannelStateChange};
use crate::config::ClientOptions;
use crate::connection::backoff::ReconnectBackoff;
use crate::connection::queue::{Outbound, OutboundQueue, Outbox, PendingAcks, PresenceRollback, PushOutcome};
use crate::connection::{Connection, ConnectionEventNotifier, ConnectionSnapshot, ConnectionState, ConnectionStateChange, RecoveryKey};
use crate::error::{codes, Error, ErrorInfo, Result};
use crate::protocol::codec::{codec_for, Codec};
use crate::protocol::{ConnectionDetails, Message, PresenceAction, PresenceMessage, ProtocolMessage};
use crate::transport::{ConnectRequest, Transport, TransportConnection, TransportSink};
use crate::util::random::{shuffle, RngRandom};

/// Requests from the public handles to the connection manager
pub(crate) enum Command {
    Connect,
    Close,
    Send { msg: ProtocolMessage },
    Ping { reply: oneshot::Sender<Result<Duration>> },

    RegisterChannel {
        name: String,
        snapshot: watch::Sender<ChannelSnapshot>,
        events: broadcast::Sender<ChannelStateChange>,
    },
    ReleaseChannel { name: String },
    Attach { channel: String, reply: oneshot::Sender<Result<()>> },
    Detach { channel: String, reply: oneshot::Sender<Result<()>> },
    Publish { channel: String, messages: Vec<Message>, reply: oneshot::Sender<Result<()>> },
    Subscribe { channel: String, filter: Option<String>, sender: mpsc::UnboundedSender<Message> },

    PresenceAct {
        channel: String,
        action: PresenceAction,
        client_id: Option<String>,
        data: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    PresenceGet { channel: String, reply: oneshot::Sender<Result<Vec<PresenceMessage>>> },
    PresenceSubscribe { channel: String, filter: Option<PresenceAction>, sender: mpsc::UnboundedSender<PresenceMessage> },
}

impl Command {
    /// the channel a channel command is addressed to
    fn channel(&self) -> Option<&str> {
        match self {
            Command::Attach { channel, .. }
            | Command::Detach { channel, .. }
            | Command::Publish { channel, .. }
            | Command::Subscribe { channel, .. }
            | Command::PresenceAct { channel, .. }
            | Command::PresenceGet { channel, .. }
            | Command::PresenceSubscribe { channel, .. } => Some(channel.as_str()),
            _ => None,
        }
    }

    /// Settles the command's reply with `error`. Subscriptions are dropped, which ends the
    ///  subscriber's stream.
    fn reject(self, error: Error) {
        match self {
            Command::Attach { reply, .. }
            | Command::Detach { reply, .. }
            | Command::Publish { reply, .. }
            | Command::PresenceAct { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::PresenceGet { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            _ => {}
        }
    }
}

/// Events from transports, tagged with the id of the transport they belong to
pub(crate) enum LoopEvent {
    Opened { transport_id: u64, result: anyhow::Result<Box<dyn TransportConnection>> },
    Inbound { transport_id: u64, buf: Bytes },
    TransportClosed { transport_id: u64, reason: String },
}

impl Debug for LoopEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopEvent::Opened { transport_id, result: Ok(_) } => write!(f, "Opened(#{})", transport_id),
            LoopEvent::Opened { transport_id, result: Err(e) } => write!(f, "Opened(#{}, error: {})", transport_id, e),
            LoopEvent::Inbound { transport_id, buf } => write!(f, "Inbound(#{}, {} bytes)", transport_id, buf.len()),
            LoopEvent::TransportClosed { transport_id, reason } => write!(f, "TransportClosed(#{}, {})", transport_id, reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ConnectionTimer {
    /// opening the transport and receiving CONNECTED
    Handshake,
    Retry,
    CloseAck,
}

struct ActiveTransport {
    id: u64,
    host: String,
    /// `None` while the transport is being opened
    connection: Option<Box<dyn TransportConnection>>,
}

struct PendingPing {
    id: String,
    sent_at: Instant,
    deadline: Instant,
    reply: oneshot::Sender<Result<Duration>>,
}

/// Spawns the connection manager, returning the command sender for channel handles and the
///  connection handle. The manager runs until all command senders are dropped.
pub(crate) fn start(options: Arc<ClientOptions>, transport: Arc<dyn Transport>, authenticator: Arc<dyn Authenticator>) -> (mpsc::UnboundedSender<Command>, Connection) {
    let (commands_send, commands_recv) = mpsc::unbounded_channel();
    let (loop_send, loop_recv) = mpsc::unbounded_channel();
    let (snapshot_send, snapshot_recv) = watch::channel(ConnectionSnapshot::default());
    let events = Arc::new(ConnectionEventNotifier::new());

    let manager = ConnectionManager::new(options, transport, authenticator, snapshot_send, events.clone(), loop_send);
    tokio::spawn(manager.run(commands_recv, loop_recv));

    (commands_send.clone(), Connection::new(commands_send, snapshot_recv, events))
}

/// The connection state machine. It owns the transport, the outbound queue, the frames waiting
///  for acknowledgement and all channel engines, and it is the only place where any of them
///  changes: everything else sends commands.
pub(crate) struct ConnectionManager {
    options: Arc<ClientOptions>,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    codec: Arc<dyn Codec>,

    snapshot: watch::Sender<ConnectionSnapshot>,
    events: Arc<ConnectionEventNotifier>,
    loop_sender: mpsc::UnboundedSender<LoopEvent>,

    state: ConnectionState,
    reason: Option<ErrorInfo>,
    timer: Option<(Instant, ConnectionTimer)>,
    last_activity: Instant,

    next_transport_id: u64,
    active: Option<ActiveTransport>,
    /// hosts for the current connect attempt, in the order they are tried
    hosts: Vec<String>,
    next_host: usize,
    handshake_error: Option<ErrorInfo>,

    id: Option<String>,
    key: Option<String>,
    serial: Option<i64>,
    details: Option<ConnectionDetails>,
    recover: Option<RecoveryKey>,

    backoff: ReconnectBackoff<RngRandom>,
    disconnected_since: Option<Instant>,
    /// the credential was refreshed since the last successful connect
    auth_refreshed: bool,

    msg_serial: u64,
    queue: OutboundQueue,
    pending: PendingAcks,
    pings: Vec<PendingPing>,
    next_ping_id: u64,

    channels: FxHashMap<String, ChannelEngine>,
}

impl ConnectionManager {
    fn new(
        options: Arc<ClientOptions>,
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
        snapshot: watch::Sender<ConnectionSnapshot>,
        events: Arc<ConnectionEventNotifier>,
        loop_sender: mpsc::UnboundedSender<LoopEvent>,
    ) -> ConnectionManager {
        ConnectionManager {
            codec: codec_for(options.codec),
            backoff: ReconnectBackoff::new(&options),
            queue: OutboundQueue::new(options.max_queued_messages, options.queue_overflow_policy),
            recover: options.recover.as_deref().and_then(RecoveryKey::parse),
            options,
            transport,
            authenticator,
            snapshot,
            events,
            loop_sender,
            state: ConnectionState::Initialized,
            reason: None,
            timer: None,
            last_activity: Instant::now(),
            next_transport_id: 0,
            active: None,
            hosts: Vec::new(),
            next_host: 0,
            handshake_error: None,
            id: None,
            key: None,
            serial: None,
            details: None,
            disconnected_since: None,
            auth_refreshed: false,
            msg_serial: 0,
            pending: Default::default(),
            pings: Vec::new(),
            next_ping_id: 0,
            channels: Default::default(),
        }
    }

    #[tracing::instrument(name = "connection_manager", skip_all)]
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut loop_events: mpsc::UnboundedReceiver<LoopEvent>) {
        debug!("starting connection manager");
        loop {
            let deadline = self.next_deadline();
            let sleep_target = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!("all handles were dropped, shutting down connection manager");
                        self.shutdown().await;
                        return;
                    }
                },
                evt = loop_events.recv() => {
                    if let Some(evt) = evt {
                        self.on_loop_event(evt).await;
                    }
                }
                _ = time::sleep_until(sleep_target), if deadline.is_some() => self.on_timer().await,
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.state == ConnectionState::Connected {
            self.write(&ProtocolMessage::Close).await;
        }
        self.abandon_transport().await;
    }

    fn next_deadline(&self) -> Option<Instant> {
        let connection_timer = self.timer.map(|(deadline, _)| deadline);
        let pings = self.pings.iter().map(|p| p.deadline).min();
        let channels = self.channels.values().filter_map(|c| c.next_deadline()).min();

        [connection_timer, self.idle_deadline(), pings, channels].into_iter()
            .flatten()
            .min()
    }

    fn idle_deadline(&self) -> Option<Instant> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        let max_idle = self.details.as_ref()
            .map(|d| d.max_idle_interval_ms)
            .unwrap_or(0);
        if max_idle == 0 {
            return None;
        }
        Some(self.last_activity + Duration::from_millis(max_idle) + self.options.realtime_request_timeout)
    }

    //---------------------------------------------------------- state

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(ConnectionSnapshot {
            state: self.state,
            id: self.id.clone(),
            key: self.key.clone(),
            serial: self.serial,
            error_reason: self.reason.clone(),
            details: self.details.clone(),
        });
    }

    fn set_state(&mut self, state: ConnectionState, reason: Option<ErrorInfo>, retry_in: Option<Duration>) {
        let previous = self.state;
        if previous != state {
            match &reason {
                Some(reason) => info!("connection: {:?} -> {:?} ({})", previous, state, reason),
                None => info!("connection: {:?} -> {:?}", previous, state),
            }
        }
        self.state = state;
        self.reason = reason.clone();
        self.publish_snapshot();
        self.events.send_event(ConnectionStateChange { previous, current: state, reason, retry_in });
    }

    /// reports an error that does not change the state
    fn emit_update(&mut self, reason: ErrorInfo) {
        self.reason = Some(reason.clone());
        self.publish_snapshot();
        self.events.send_event(ConnectionStateChange {
            previous: self.state,
            current: self.state,
            reason: Some(reason),
            retry_in: None,
        });
    }

    fn clear_identity(&mut self) {
        self.id = None;
        self.key = None;
        self.serial = None;
    }

    fn channel_context(&self) -> ChannelContext {
        ChannelContext {
            connection_state: self.state,
            connection_reason: self.reason.clone(),
            connection_serial: self.serial,
            client_id: self.options.client_id.clone()
                .or_else(|| self.details.as_ref().and_then(|d| d.client_id.clone())),
            options: self.options.clone(),
            now: Instant::now(),
        }
    }

    fn apply_rollbacks(&mut self, rollbacks: Vec<PresenceRollback>) {
        for rollback in rollbacks {
            if let Some(channel) = self.channels.get_mut(&rollback.channel) {
                channel.presence_rollback(rollback);
            }
        }
    }

    /// fails all queued and unacknowledged frames as well as outstanding pings
    fn fail_outstanding(&mut self, error: &Error) {
        let mut rollbacks = self.queue.fail_all(error);
        rollbacks.extend(self.pending.fail_all(error));
        self.apply_rollbacks(rollbacks);
        self.fail_pings(error);
    }

    fn fail_pings(&mut self, error: &Error) {
        for ping in self.pings.drain(..) {
            let _ = ping.reply.send(Err(error.clone()));
        }
    }

    async fn start_connecting(&mut self) {
        self.abandon_transport().await;

        let mut fallbacks = self.options.fallback_hosts.clone();
        if self.options.shuffle_fallback_hosts {
            shuffle::<RngRandom, _>(&mut fallbacks);
        }
        self.hosts = vec![self.options.realtime_host.clone()];
        self.hosts.extend(fallbacks);
        self.next_host = 0;
        self.handshake_error = None;

        if self.state != ConnectionState::Connecting {
            self.set_state(ConnectionState::Connecting, None, None);
        }
        self.open_next_host().await;
    }

    async fn credential(&self) -> std::result::Result<Credential, ErrorInfo> {
        match self.authenticator.current_credential() {
            CredentialState::Valid(credential) => Ok(credential),
            CredentialState::NeedsRefresh => {
                debug!("credential needs refresh before connecting");
                self.authenticator.refresh().await
            }
        }
    }

    fn connect_request(&self, host: String, credential: &Credential) -> ConnectRequest {
        let mut params = vec![
            ("v".to_string(), self.options.protocol_version.clone()),
            ("format".to_string(), self.options.codec.format_param().to_string()),
        ];
        let (auth_name, auth_value) = credential.connect_param();
        params.push((auth_name.to_string(), auth_value));

        if let (Some(key), Some(serial)) = (&self.key, self.serial) {
            params.push(("resume".to_string(), key.clone()));
            params.push(("connection_serial".to_string(), serial.to_string()));
        }
        else if let Some(recover) = &self.recover {
            params.push(("recover".to_string(), recover.connection_key.clone()));
            params.push(("connection_serial".to_string(), recover.connection_serial.to_string()));
        }

        if let Some(client_id) = &self.options.client_id {
            params.push(("client_id".to_string(), client_id.clone()));
        }
        params.push(("echo".to_string(), self.options.echo_messages.to_string()));

        ConnectRequest { host, params }
    }

    /// Opens a transport to the next host of the current connect attempt. The transport is opened
    ///  in a separate task so the loop keeps running; the outcome arrives as `LoopEvent::Opened`.
    async fn open_next_host(&mut self) {
        let host = match self.hosts.get(self.next_host) {
            Some(host) => host.clone(),
            None => {
                let reason = self.handshake_error.take()
                    .unwrap_or_else(|| ErrorInfo::new(codes::CONNECTION_FAILED, 503, "no host reachable"));
                self.on_connect_failed(reason).await;
                return;
            }
        };
        self.next_host += 1;

        let credential = match self.credential().await {
            Ok(credential) => credential,
            Err(reason) => {
                error!("cannot obtain a credential: {}", reason);
                self.to_failed(reason).await;
                return;
            }
        };
        let request = self.connect_request(host.clone(), &credential);

        self.next_transport_id += 1;
        let transport_id = self.next_transport_id;
        debug!("opening transport #{} to {}", transport_id, host);
        self.active = Some(ActiveTransport { id: transport_id, host, connection: None });
        self.timer = Some((Instant::now() + self.options.realtime_request_timeout, ConnectionTimer::Handshake));

        let transport = self.transport.clone();
        let sink = TransportSink::new(transport_id, self.loop_sender.clone());
        let loop_sender = self.loop_sender.clone();
        tokio::spawn(async move {
            let result = transport.open(request, sink).await;
            let _ = loop_sender.send(LoopEvent::Opened { transport_id, result });
        });
    }

    /// none of the hosts could be reached in this attempt
    async fn on_connect_failed(&mut self, reason: ErrorInfo) {
        warn!("connect attempt failed: {}", reason);
        self.abandon_transport().await;
        self.timer = None;
        self.to_disconnected_or_suspended(reason);
    }

    async fn abandon_transport(&mut self) {
        if let Some(active) = self.active.take() {
            debug!("closing transport #{} to {}", active.id, active.host);
            if let Some(connection) = active.connection {
                connection.close().await;
            }
        }
    }

    fn is_active(&self, transport_id: u64) -> bool {
        matches!(&self.active, Some(active) if active.id == transport_id)
    }

    /// The transport was lost or the service disconnected us: channels wait for the next
    ///  connection, the connection retries after a backoff delay
    async fn on_transport_lost(&mut self, reason: ErrorInfo) {
        self.abandon_transport().await;
        self.fail_pings(&Error::Connection(reason.clone()));
        for channel in self.channels.values_mut() {
            channel.on_connection_interrupted();
        }
        self.to_disconnected_or_suspended(reason);
    }

    fn to_disconnected_or_suspended(&mut self, reason: ErrorInfo) {
        let now = Instant::now();
        let since = *self.disconnected_since.get_or_insert(now);
        let ttl = self.details.as_ref()
            .and_then(|d| d.connection_state_ttl_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.options.connection_state_ttl);
        let attempts_exhausted = self.options.max_reconnect_attempts
            .is_some_and(|max| self.backoff.attempts() >= max);

        if now.saturating_duration_since(since) >= ttl || attempts_exhausted {
            self.to_suspended(reason);
            return;
        }

        let delay = self.backoff.next_delay();
        debug!("reconnecting in {:?}", delay);
        self.timer = Some((now + delay, ConnectionTimer::Retry));
        self.set_state(ConnectionState::Disconnected, Some(reason), Some(delay));
    }

    /// Queued and unacknowledged frames are kept. They are handed back to their channels when
    ///  the connection is connected again.
    fn to_suspended(&mut self, reason: ErrorInfo) {
        // the service discards the connection's state after the ttl, so there is nothing to resume
        self.clear_identity();
        self.fail_pings(&Error::Suspended(reason.clone()));

        let retry_in = self.options.suspended_retry_timeout;
        self.timer = Some((Instant::now() + retry_in, ConnectionTimer::Retry));
        self.set_state(ConnectionState::Suspended, Some(reason.clone()), Some(retry_in));

        for channel in self.channels.values_mut() {
            channel.on_connection_suspended(&reason);
        }
    }

    async fn to_failed(&mut self, reason: ErrorInfo) {
        error!("connection failed: {}", reason);
        self.abandon_transport().await;
        self.timer = None;
        self.fail_outstanding(&Error::for_connection_state(ConnectionState::Failed, Some(&reason)));
        self.clear_identity();
        self.set_state(ConnectionState::Failed, Some(reason.clone()), None);

        for channel in self.channels.values_mut() {
            channel.on_connection_failed(&reason);
        }
    }

    async fn to_closed(&mut self) {
        self.abandon_transport().await;
        self.timer = None;
        self.fail_outstanding(&Error::InvalidState(ConnectionState::Closed));
        self.clear_identity();
        self.disconnected_since = None;
        self.backoff.reset();
        self.set_state(ConnectionState::Closed, None, None);

        for channel in self.channels.values_mut() {
            channel.on_connection_closed();
        }
    }

    /// Refreshes the credential once and reconnects with it. A second rejection before the next
    ///  successful connect fails the connection.
    async fn reauthorize(&mut self, reason: ErrorInfo) {
        if self.auth_refreshed {
            self.to_failed(reason).await;
            return;
        }
        self.auth_refreshed = true;
        self.abandon_transport().await;
        self.timer = None;

        match self.authenticator.refresh().await {
            Ok(_) => {
                info!("credential refreshed after {}, reconnecting", reason);
                self.timer = Some((Instant::now(), ConnectionTimer::Retry));
                if self.state == ConnectionState::Connected {
                    self.fail_pings(&Error::Connection(reason.clone()));
                    for channel in self.channels.values_mut() {
                        channel.on_connection_interrupted();
                    }
                    self.set_state(ConnectionState::Disconnected, Some(reason), Some(Duration::ZERO));
                }
            }
            Err(refresh_error) => {
                warn!("credential refresh failed: {}", refresh_error);
                self.to_failed(refresh_error).await;
            }
        }
    }

    //---------------------------------------------------------- commands

    async fn on_command(&mut self, cmd: Command) {
        let unknown_channel = cmd.channel()
            .filter(|name| !self.channels.contains_key(*name))
            .map(|name| Error::channel(name, codes::CHANNEL_OPERATION_FAILED, format!("channel {} was released", name)));
        if let Some(error) = unknown_channel {
            warn!("{}", error);
            cmd.reject(error);
            return;
        }

        match cmd {
            Command::Connect => self.connect().await,
            Command::Close => self.close().await,
            Command::Send { msg } => self.send_outbound(Outbound::fire_and_forget(msg)).await,
            Command::Ping { reply } => self.ping(reply).await,
            Command::RegisterChannel { name, snapshot, events } => {
                trace!("registering channel {}", name);
                self.channels.entry(name.clone())
                    .or_insert_with(|| ChannelEngine::new(name, &self.options, snapshot, events));
            }
            Command::ReleaseChannel { name } => {
                if let Some(mut channel) = self.channels.remove(&name) {
                    debug!("releasing channel {}", name);
                    let ctx = self.channel_context();
                    let mut out = Outbox::default();
                    channel.detach(&ctx, None, &mut out);
                    self.flush(out).await;
                }
            }
            Command::Attach { channel, reply } => {
                self.on_channel_command(&channel, |c, ctx, out| c.attach(ctx, Some(reply), out)).await;
            }
            Command::Detach { channel, reply } => {
                self.on_channel_command(&channel, |c, ctx, out| c.detach(ctx, Some(reply), out)).await;
            }
            Command::Publish { channel, messages, reply } => {
                self.on_channel_command(&channel, |c, ctx, out| c.publish(ctx, messages, reply, out)).await;
            }
            Command::Subscribe { channel, filter, sender } => {
                self.on_channel_command(&channel, |c, _, _| c.subscribe(filter, sender)).await;
            }
            Command::PresenceAct { channel, action, client_id, data, reply } => {
                self.on_channel_command(&channel, |c, ctx, out| c.presence_act(ctx, action, client_id, data, reply, out)).await;
            }
            Command::PresenceGet { channel, reply } => {
                self.on_channel_command(&channel, |c, _, _| c.presence_get(reply)).await;
            }
            Command::PresenceSubscribe { channel, filter, sender } => {
                self.on_channel_command(&channel, |c, _, _| c.presence_subscribe(filter, sender)).await;
            }
        }
    }

    /// `on_command` rejects commands for unknown channels before they get here
    async fn on_channel_command(&mut self, name: &str, f: impl FnOnce(&mut ChannelEngine, &ChannelContext, &mut Outbox)) {
        let ctx = self.channel_context();
        let mut out = Outbox::default();
        if let Some(channel) = self.channels.get_mut(name) {
            f(channel, &ctx, &mut out);
        }
        self.flush(out).await;
    }

    async fn connect(&mut self) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Closing => {
                debug!("connect() while {:?} - ignoring", self.state);
            }
            ConnectionState::Initialized | ConnectionState::Closed | ConnectionState::Failed => {
                self.backoff.reset();
                self.disconnected_since = None;
                self.auth_refreshed = false;
                self.start_connecting().await;
            }
            ConnectionState::Disconnected | ConnectionState::Suspended => {
                self.timer = None;
                self.start_connecting().await;
            }
        }
    }

    async fn close(&mut self) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                debug!("close() while {:?} - ignoring", self.state);
            }
            ConnectionState::Connected => {
                self.timer = Some((Instant::now() + self.options.realtime_request_timeout, ConnectionTimer::CloseAck));
                self.set_state(ConnectionState::Closing, None, None);
                self.write(&ProtocolMessage::Close).await;
            }
            _ => self.to_closed().await,
        }
    }

    async fn ping(&mut self, reply: oneshot::Sender<Result<Duration>>) {
        if self.state != ConnectionState::Connected {
            let _ = reply.send(Err(Error::for_connection_state(self.state, self.reason.as_ref())));
            return;
        }
        self.next_ping_id += 1;
        let id = format!("ping-{}", self.next_ping_id);
        self.write(&ProtocolMessage::Heartbeat { id: Some(id.clone()) }).await;

        let now = Instant::now();
        self.pings.push(PendingPing {
            id,
            sent_at: now,
            deadline: now + self.options.realtime_request_timeout,
            reply,
        });
    }

    //---------------------------------------------------------- outbound

    async fn flush(&mut self, out: Outbox) {
        for item in out.frames {
            self.send_outbound(item).await;
        }
        if let Some(reason) = out.fail_connection {
            self.to_failed(reason).await;
        }
    }

    /// Transmits a frame, queues it until the connection is connected, or fails it, depending on
    ///  the connection state. Frames the service acknowledges are numbered with the next
    ///  `msg_serial` when they are transmitted.
    async fn send_outbound(&mut self, mut item: Outbound) {
        if !item.msg.needs_ack() {
            // ATTACH, DETACH and HEARTBEAT only make sense on the current transport
            if self.state == ConnectionState::Connected {
                self.write(&item.msg).await;
            }
            else {
                trace!("dropping {} while {:?}", item.msg.kind(), self.state);
            }
            let _ = item.waiter.settle(Ok(()));
            return;
        }

        match self.state {
            ConnectionState::Connected => {
                let serial = self.msg_serial;
                self.msg_serial += 1;
                item.msg.set_msg_serial(serial);
                self.write(&item.msg).await;
                self.pending.push(serial, item);
            }
            ConnectionState::Initialized | ConnectionState::Connecting | ConnectionState::Disconnected | ConnectionState::Suspended => {
                if !self.options.queue_messages {
                    let error = match self.state {
                        ConnectionState::Suspended => Error::for_connection_state(self.state, self.reason.as_ref()),
                        _ => Error::Connection(self.reason.clone()
                            .unwrap_or_else(|| ErrorInfo::new(codes::CONNECTION_DISCONNECTED, 400, "not connected and queueing is disabled"))),
                    };
                    let rollback = item.fail(error);
                    self.apply_rollbacks(rollback.into_iter().collect());
                    return;
                }

                let mut rollbacks = Vec::new();
                let outcome = self.queue.push(item, &mut rollbacks);
                self.apply_rollbacks(rollbacks);
                if outcome == PushOutcome::FailConnection {
                    let limit = self.options.max_queued_messages.unwrap_or_default();
                    self.to_failed(Error::QueueOverflow { limit }.info()).await;
                }
            }
            _ => {
                let rollback = item.fail(Error::for_connection_state(self.state, self.reason.as_ref()));
                self.apply_rollbacks(rollback.into_iter().collect());
            }
        }
    }

    async fn write(&self, msg: &ProtocolMessage) {
        let connection = match self.active.as_ref().and_then(|a| a.connection.as_ref()) {
            Some(connection) => connection,
            None => {
                debug!("no transport for {}, dropping it", msg.kind());
                return;
            }
        };
        match self.codec.encode(msg) {
            Ok(buf) => {
                trace!("sending {}", msg.kind());
                if let Err(e) = connection.send(buf).await {
                    warn!("sending {} failed: {}", msg.kind(), e);
                }
            }
            Err(e) => error!("cannot encode {}: {}", msg.kind(), e),
        }
    }

    //---------------------------------------------------------- inbound

    async fn on_loop_event(&mut self, evt: LoopEvent) {
        match evt {
            LoopEvent::Opened { transport_id, result } => {
                let is_current = self.is_active(transport_id) && self.state == ConnectionState::Connecting;
                match result {
                    Ok(connection) if is_current => {
                        debug!("transport #{} open, waiting for CONNECTED", transport_id);
                        if let Some(active) = &mut self.active {
                            active.connection = Some(connection);
                        }
                    }
                    Ok(connection) => {
                        debug!("closing stale transport #{}", transport_id);
                        connection.close().await;
                    }
                    Err(e) if is_current => {
                        warn!("opening transport #{} failed: {}", transport_id, e);
                        self.active = None;
                        self.handshake_error = Some(ErrorInfo::new(codes::CONNECTION_FAILED, 503, e.to_string()));
                        self.open_next_host().await;
                    }
                    Err(e) => debug!("stale transport #{} failed to open: {}", transport_id, e),
                }
            }
            LoopEvent::Inbound { transport_id, buf } => {
                if !self.is_active(transport_id) {
                    trace!("dropping frame from stale transport #{}", transport_id);
                    return;
                }
                self.last_activity = Instant::now();
                match self.codec.decode(&buf) {
                    Ok(msg) => self.on_frame(msg).await,
                    Err(e) => {
                        warn!("discarding undecodable frame: {}", e);
                        self.emit_update(e.info());
                    }
                }
            }
            LoopEvent::TransportClosed { transport_id, reason } => {
                if !self.is_active(transport_id) {
                    return;
                }
                let info = ErrorInfo::new(codes::CONNECTION_DISCONNECTED, 503, reason);
                match self.state {
                    ConnectionState::Connecting => {
                        debug!("transport #{} closed during handshake: {}", transport_id, info);
                        self.active = None;
                        self.handshake_error = Some(info);
                        self.open_next_host().await;
                    }
                    ConnectionState::Connected => {
                        warn!("transport #{} lost: {}", transport_id, info);
                        self.on_transport_lost(info).await;
                    }
                    ConnectionState::Closing => self.to_closed().await,
                    _ => self.active = None,
                }
            }
        }
    }

    async fn on_frame(&mut self, msg: ProtocolMessage) {
        trace!("received {}", msg.kind());
        match msg {
            ProtocolMessage::Heartbeat { id: Some(id) } => self.on_heartbeat(&id),
            ProtocolMessage::Heartbeat { id: None } => {}
            ProtocolMessage::Ack { msg_serial, count } => self.pending.on_ack(msg_serial, count),
            ProtocolMessage::Nack { msg_serial, count, error } => {
                let info = error.unwrap_or_else(|| ErrorInfo::new(codes::INTERNAL, 500, "message rejected by the service"));
                warn!("NACK for {} message(s) from #{}: {}", count, msg_serial, info);
                let rollbacks = self.pending.on_nack(msg_serial, count, info);
                self.apply_rollbacks(rollbacks);
            }
            ProtocolMessage::Connected { connection_id, connection_key, connection_serial, details, error } => {
                self.on_connected(connection_id, connection_key, connection_serial, details, error).await;
            }
            ProtocolMessage::Disconnected { error } => {
                let info = error.unwrap_or_else(|| ErrorInfo::new(codes::CONNECTION_DISCONNECTED, 503, "disconnected by the service"));
                if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
                    debug!("ignoring DISCONNECTED while {:?}", self.state);
                    return;
                }
                if info.is_auth_error() {
                    self.reauthorize(info).await;
                }
                else {
                    self.on_transport_lost(info).await;
                }
            }
            ProtocolMessage::Closed => self.to_closed().await,
            ProtocolMessage::Error { channel: None, error } => {
                if error.is_auth_error() && self.state != ConnectionState::Closing {
                    self.reauthorize(error).await;
                }
                else {
                    self.to_failed(error).await;
                }
            }
            ProtocolMessage::Close | ProtocolMessage::Attach { .. } | ProtocolMessage::Detach { .. } => {
                debug!("ignoring client-only frame {}", msg.kind());
            }
            msg => self.route_to_channel(msg).await,
        }
    }

    fn on_heartbeat(&mut self, id: &str) {
        if let Some(idx) = self.pings.iter().position(|p| p.id == id) {
            let ping = self.pings.remove(idx);
            let rtt = Instant::now().saturating_duration_since(ping.sent_at);
            trace!("ping {} answered after {:?}", id, rtt);
            let _ = ping.reply.send(Ok(rtt));
        }
    }

    async fn on_connected(&mut self, connection_id: String, connection_key: String, connection_serial: i64, details: ConnectionDetails, error: Option<ErrorInfo>) {
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                // the service refreshed the connection's details, e.g. after reauthentication
                debug!("connection details updated");
                self.key = Some(connection_key);
                self.details = Some(details);
                self.publish_snapshot();
                if let Some(error) = error {
                    self.emit_update(error);
                }
                return;
            }
            _ => {
                debug!("ignoring CONNECTED while {:?}", self.state);
                return;
            }
        }
        self.timer = None;

        let resumed = match &self.id {
            Some(previous) => *previous == connection_id,
            None => self.recover.is_some() && error.is_none(),
        };
        let attempted = self.id.is_some() || self.recover.is_some();
        match (&error, resumed) {
            (Some(error), false) if attempted => info!("connection state was not resumed: {}", error),
            (_, false) if attempted => info!("connection state was not resumed"),
            _ => {}
        }

        self.serial = match (resumed, self.serial, &self.recover) {
            (true, Some(serial), _) => Some(serial.max(connection_serial)),
            (true, None, Some(recover)) => Some(recover.connection_serial),
            _ => Some(connection_serial),
        };
        self.id = Some(connection_id);
        self.key = Some(connection_key);
        self.details = Some(details);
        self.recover = None;
        self.backoff.reset();
        self.disconnected_since = None;
        self.auth_refreshed = false;
        self.handshake_error = None;
        self.last_activity = Instant::now();

        self.set_state(ConnectionState::Connected, error, None);

        let ctx = self.channel_context();
        let mut out = Outbox::default();
        if resumed {
            // unacknowledged frames are retransmitted with their original serials
            let unacked = self.pending.iter()
                .map(|(_, item)| item.msg.clone())
                .collect::<Vec<_>>();
            if !unacked.is_empty() {
                debug!("retransmitting {} unacknowledged frame(s)", unacked.len());
            }
            for msg in &unacked {
                self.write(msg).await;
            }
            out.frames.extend(self.queue.drain());
            for channel in self.channels.values_mut() {
                channel.on_connected(&ctx, true, &mut out);
            }
        }
        else {
            self.msg_serial = 0;
            for channel in self.channels.values_mut() {
                channel.on_connected(&ctx, false, &mut out);
            }

            let mut unsent = self.pending.drain();
            unsent.extend(self.queue.drain());
            let mut per_channel: FxHashMap<String, Vec<Outbound>> = Default::default();
            for item in unsent {
                match item.msg.channel().map(|c| c.to_string()) {
                    Some(name) if self.channels.contains_key(&name) => per_channel.entry(name).or_default().push(item),
                    _ => out.frames.push(item),
                }
            }
            for (name, items) in per_channel {
                if let Some(channel) = self.channels.get_mut(&name) {
                    channel.requeue(items);
                }
            }
        }
        self.flush(out).await;
    }

    /// Frames of the connection's message stream carry consecutive serials. Duplicates are
    ///  dropped, a gap is reported as an update since messages were lost.
    async fn route_to_channel(&mut self, msg: ProtocolMessage) {
        if let Some(serial) = msg.connection_serial() {
            if let Some(current) = self.serial {
                if serial <= current {
                    debug!("dropping duplicate {} with connection serial {} <= {}", msg.kind(), serial, current);
                    return;
                }
                if serial > current + 1 {
                    warn!("connection serial jumped from {} to {}", current, serial);
                    self.emit_update(ErrorInfo::new(codes::MESSAGE_CONTINUITY_LOST, 500, format!("missed messages between connection serials {} and {}", current, serial)));
                }
            }
            self.serial = Some(serial);
            self.publish_snapshot();
        }

        let name = match msg.channel() {
            Some(name) => name.to_string(),
            None => {
                debug!("ignoring {} without channel", msg.kind());
                return;
            }
        };
        let ctx = self.channel_context();
        let mut out = Outbox::default();
        match self.channels.get_mut(&name) {
            Some(channel) => channel.on_frame(&ctx, msg, &mut out),
            None => {
                debug!("dropping {} for unknown channel {}", msg.kind(), name);
                return;
            }
        }
        self.flush(out).await;
    }

    //---------------------------------------------------------- timers

    async fn on_timer(&mut self) {
        let now = Instant::now();

        if let Some((deadline, timer)) = self.timer {
            if deadline <= now {
                self.timer = None;
                self.on_connection_timer(timer).await;
            }
        }

        if let Some(deadline) = self.idle_deadline() {
            if deadline <= now {
                warn!("no activity from the service within the idle interval");
                let reason = ErrorInfo::new(codes::CONNECTION_DISCONNECTED, 408, "no activity from the service within the idle interval");
                self.on_transport_lost(reason).await;
            }
        }

        let timeout = self.options.realtime_request_timeout;
        let (expired, remaining) = std::mem::take(&mut self.pings).into_iter()
            .partition::<Vec<_>, _>(|p| p.deadline <= now);
        self.pings = remaining;
        for ping in expired {
            debug!("ping {} timed out", ping.id);
            let _ = ping.reply.send(Err(Error::timeout("ping", timeout)));
        }

        let ctx = self.channel_context();
        let mut out = Outbox::default();
        for channel in self.channels.values_mut() {
            channel.on_timer(&ctx, &mut out);
        }
        self.flush(out).await;
    }

    async fn on_connection_timer(&mut self, timer: ConnectionTimer) {
        match timer {
            ConnectionTimer::Handshake => {
                if self.state != ConnectionState::Connecting {
                    return;
                }
                let host = self.active.as_ref().map(|a| a.host.clone()).unwrap_or_default();
                warn!("connecting to {} timed out", host);
                self.abandon_transport().await;
                self.handshake_error = Some(ErrorInfo::new(codes::CONNECTION_FAILED, 408, format!("connecting to {} timed out", host)));
                self.open_next_host().await;
            }
            ConnectionTimer::Retry => {
                if matches!(self.state, ConnectionState::Connecting | ConnectionState::Disconnected | ConnectionState::Suspended) {
                    self.start_connecting().await;
                }
            }
            ConnectionTimer::CloseAck => {
                if self.state == ConnectionState::Closing {
                    debug!("no CLOSED from the service, closing anyway");
                    self.to_closed().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time;

    use super::*;
    use crate::auth::{KeyAuthenticator, MockAuthenticator};
    use crate::channel::ChannelState;
    use crate::config::{CodecKind, QueueOverflowPolicy};
    use crate::test_util::transport::{FakeServerConnection, FakeService, FakeTransport, OpenBehavior};
    use crate::test_util::test_options;

    struct Fixture {
        commands: mpsc::UnboundedSender<Command>,
        connection: Connection,
        transport: Arc<FakeTransport>,
        service: FakeService,
    }

    fn fixture(options: ClientOptions) -> Fixture {
        let (transport, service) = FakeTransport::new(CodecKind::Json);
        let authenticator = Arc::new(KeyAuthenticator::new("app.key:secret"));
        fixture_with(options, transport, service, authenticator)
    }

    fn fixture_with(options: ClientOptions, transport: Arc<FakeTransport>, service: FakeService, authenticator: Arc<dyn Authenticator>) -> Fixture {
        let (commands, connection) = start(Arc::new(options), transport.clone(), authenticator);
        Fixture { commands, connection, transport, service }
    }

    async fn connected(options: ClientOptions) -> (Fixture, FakeServerConnection) {
        let mut f = fixture(options);
        f.connection.connect();
        let server = f.service.accept("conn-1").await;
        f.connection.when_state(ConnectionState::Connected).await.unwrap();
        (f, server)
    }

    fn channel(f: &Fixture, name: &str) -> (watch::Receiver<ChannelSnapshot>, broadcast::Receiver<ChannelStateChange>) {
        let (snapshot, snapshot_recv) = watch::channel(ChannelSnapshot::default());
        let (events, events_recv) = broadcast::channel(64);
        f.commands.send(Command::RegisterChannel { name: name.to_string(), snapshot, events }).unwrap();
        (snapshot_recv, events_recv)
    }

    fn publish(f: &Fixture, channel: &str, name: &str) -> oneshot::Receiver<Result<()>> {
        let (reply, recv) = oneshot::channel();
        f.commands.send(Command::Publish {
            channel: channel.to_string(),
            messages: vec![Message::new(name, json!(null))],
            reply,
        }).unwrap();
        recv
    }

    async fn attach(f: &Fixture, server: &mut FakeServerConnection, channel: &str) {
        let (reply, recv) = oneshot::channel();
        f.commands.send(Command::Attach { channel: channel.to_string(), reply }).unwrap();
        assert_eq!(server.expect_frame().await, ProtocolMessage::Attach { channel: channel.to_string() });
        server.send(ProtocolMessage::Attached { channel: channel.to_string(), resumed: false, has_presence: false, error: None });
        recv.await.unwrap().unwrap();
    }

    /// attaches with a presence sync delivering `members`
    async fn attach_with_members(f: &Fixture, server: &mut FakeServerConnection, channel: &str, members: &[(&str, &str)]) {
        let (reply, recv) = oneshot::channel();
        f.commands.send(Command::Attach { channel: channel.to_string(), reply }).unwrap();
        assert_eq!(server.expect_frame().await, ProtocolMessage::Attach { channel: channel.to_string() });
        server.send(ProtocolMessage::Attached { channel: channel.to_string(), resumed: false, has_presence: true, error: None });
        recv.await.unwrap().unwrap();
        server.send(ProtocolMessage::Sync { channel: channel.to_string(), cursor: None, connection_serial: None, presence: present(members) });
    }

    fn present(members: &[(&str, &str)]) -> Vec<PresenceMessage> {
        members.iter()
            .map(|(client_id, connection_id)| {
                let mut msg = PresenceMessage::new(PresenceAction::Present, *client_id, json!(null));
                msg.connection_id = Some(connection_id.to_string());
                msg
            })
            .collect()
    }

    fn presence_get(f: &Fixture, channel: &str) -> oneshot::Receiver<Result<Vec<PresenceMessage>>> {
        let (reply, recv) = oneshot::channel();
        f.commands.send(Command::PresenceGet { channel: channel.to_string(), reply }).unwrap();
        recv
    }

    fn client_ids(members: Vec<PresenceMessage>) -> Vec<String> {
        let mut result = members.into_iter()
            .map(|m| m.client_id)
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// returns once all commands sent so far are processed
    async fn round_trip(f: &Fixture, channel: &str) {
        let (reply, recv) = oneshot::channel();
        f.commands.send(Command::PresenceGet { channel: channel.to_string(), reply }).unwrap();
        let _ = recv.await;
    }

    fn published_names(msg: &ProtocolMessage) -> (Option<u64>, Vec<String>) {
        match msg {
            ProtocolMessage::Message { msg_serial, messages, .. } => {
                (*msg_serial, messages.iter().map(|m| m.name.clone().unwrap_or_default()).collect())
            }
            other => panic!("expected MESSAGE, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_params() {
        let mut options = test_options();
        options.client_id = Some("client-a".to_string());
        let (f, server) = connected(options).await;

        assert_eq!(server.request.host, "primary.test");
        assert_eq!(server.request.param("key"), Some("app.key:secret"));
        assert_eq!(server.request.param("format"), Some("json"));
        assert_eq!(server.request.param("client_id"), Some("client-a"));
        assert_eq!(server.request.param("echo"), Some("true"));
        assert_eq!(server.request.param("resume"), None);

        let snapshot = f.connection.snapshot();
        assert_eq!(snapshot.id.as_deref(), Some("conn-1"));
        assert_eq!(snapshot.key.as_deref(), Some("conn-1-key"));
        assert_eq!(snapshot.serial, Some(-1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_sequence_on_connect() {
        let mut f = fixture(test_options());
        let mut events = f.connection.on_state_change();
        f.connection.connect();
        let _server = f.service.accept("conn-1").await;

        let first = events.recv().await.unwrap();
        assert_eq!((first.previous, first.current), (ConnectionState::Initialized, ConnectionState::Connecting));
        let second = events.recv().await.unwrap();
        assert_eq!((second.previous, second.current), (ConnectionState::Connecting, ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_hosts_in_order() {
        let (transport, service) = FakeTransport::new(CodecKind::Json);
        transport.script("primary.test", [OpenBehavior::Refuse]);
        transport.script("fallback1.test", [OpenBehavior::Hang]);
        let mut f = fixture_with(test_options(), transport, service, Arc::new(KeyAuthenticator::new("app.key:secret")));

        f.connection.connect();
        let server = f.service.accept("conn-1").await;
        assert_eq!(server.request.host, "fallback2.test");
        assert_eq!(f.transport.requests().iter().map(|r| r.host.as_str()).collect::<Vec<_>>(),
                   vec!["primary.test", "fallback1.test", "fallback2.test"]);
        f.connection.when_state(ConnectionState::Connected).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_hosts_failing_disconnects_with_backoff() {
        let (transport, service) = FakeTransport::new(CodecKind::Json);
        transport.set_default(OpenBehavior::Refuse);
        let f = fixture_with(test_options(), transport, service, Arc::new(KeyAuthenticator::new("app.key:secret")));
        let mut events = f.connection.on_state_change();

        f.connection.connect();
        assert_eq!(events.recv().await.unwrap().current, ConnectionState::Connecting);
        let disconnected = events.recv().await.unwrap();
        assert_eq!(disconnected.current, ConnectionState::Disconnected);
        assert_eq!(disconnected.retry_in, Some(Duration::from_secs(1)));
        assert_eq!(disconnected.reason.map(|r| r.code), Some(codes::CONNECTION_FAILED));

        // the second attempt waits twice as long
        assert_eq!(events.recv().await.unwrap().current, ConnectionState::Connecting);
        let disconnected = events.recv().await.unwrap();
        assert_eq!(disconnected.retry_in, Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_after_ttl() {
        let (transport, service) = FakeTransport::new(CodecKind::Json);
        transport.set_default(OpenBehavior::Refuse);
        let mut options = test_options();
        options.connection_state_ttl = Duration::from_secs(10);
        let mut f = fixture_with(options, transport, service, Arc::new(KeyAuthenticator::new("app.key:secret")));

        let (mut snapshot, _) = channel(&f, "ch");
        let mut before = publish(&f, "ch", "x");
        f.connection.connect();
        f.connection.when_state(ConnectionState::Suspended).await.unwrap();
        snapshot.wait_for(|s| s.state == ChannelState::Suspended).await.unwrap();

        // publishing while suspended is queued as well
        let mut during = publish(&f, "ch", "y");
        round_trip(&f, "ch").await;
        assert!(before.try_recv().is_err());
        assert!(during.try_recv().is_err());

        f.transport.set_default(OpenBehavior::Accept);
        let mut server = f.service.accept("conn-1").await;
        assert_eq!(server.expect_frame().await, ProtocolMessage::Attach { channel: "ch".to_string() });
        server.send(ProtocolMessage::Attached { channel: "ch".to_string(), resumed: false, has_presence: false, error: None });

        assert_eq!(published_names(&server.expect_frame().await), (Some(0), vec!["x".to_string()]));
        assert_eq!(published_names(&server.expect_frame().await), (Some(1), vec!["y".to_string()]));
        server.send(ProtocolMessage::Ack { msg_serial: 0, count: 2 });
        before.await.unwrap().unwrap();
        during.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_suspended_is_queued() {
        let (transport, service) = FakeTransport::new(CodecKind::Json);
        transport.set_default(OpenBehavior::Refuse);
        let mut options = test_options();
        options.connection_state_ttl = Duration::from_secs(10);
        let mut f = fixture_with(options, transport, service, Arc::new(KeyAuthenticator::new("app.key:secret")));

        f.connection.connect();
        f.connection.when_state(ConnectionState::Suspended).await.unwrap();
        f.connection.send(ProtocolMessage::Message { channel: "other".to_string(), msg_serial: None, connection_serial: None, messages: vec![] });

        f.transport.set_default(OpenBehavior::Accept);
        let mut server = f.service.accept("conn-1").await;
        assert_eq!(published_names(&server.expect_frame().await), (Some(0), vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_after_max_attempts() {
        let (transport, service) = FakeTransport::new(CodecKind::Json);
        transport.set_default(OpenBehavior::Refuse);
        let mut options = test_options();
        options.max_reconnect_attempts = Some(2);
        let f = fixture_with(options, transport, service, Arc::new(KeyAuthenticator::new("app.key:secret")));
        let mut events = f.connection.on_state_change();

        f.connection.connect();
        let mut disconnects = 0;
        loop {
            let event = events.recv().await.unwrap();
            match event.current {
                ConnectionState::Disconnected => disconnects += 1,
                ConnectionState::Suspended => {
                    assert_eq!(event.retry_in, Some(Duration::from_secs(30)));
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(disconnects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_publishes_flush_in_order_with_serials() {
        let mut f = fixture(test_options());
        let (mut snapshot, _) = channel(&f, "ch");
        let r1 = publish(&f, "ch", "one");
        let r2 = publish(&f, "ch", "two");

        f.connection.connect();
        let mut server = f.service.accept("conn-1").await;
        assert_eq!(server.expect_frame().await, ProtocolMessage::Attach { channel: "ch".to_string() });
        server.send(ProtocolMessage::Attached { channel: "ch".to_string(), resumed: false, has_presence: false, error: None });
        snapshot.wait_for(|s| s.state == ChannelState::Attached).await.unwrap();

        assert_eq!(published_names(&server.expect_frame().await), (Some(0), vec!["one".to_string()]));
        assert_eq!(published_names(&server.expect_frame().await), (Some(1), vec!["two".to_string()]));

        server.send(ProtocolMessage::Ack { msg_serial: 0, count: 2 });
        r1.await.unwrap().unwrap();
        r2.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_fails_publish() {
        let (f, mut server) = connected(test_options()).await;
        let _ = channel(&f, "ch");
        attach(&f, &mut server, "ch").await;

        let r = publish(&f, "ch", "x");
        let _ = server.expect_frame().await;
        server.send(ProtocolMessage::Nack { msg_serial: 0, count: 1, error: Some(ErrorInfo::new(40160, 401, "denied")) });
        assert_eq!(r.await.unwrap(), Err(Error::Connection(ErrorInfo::new(40160, 401, "denied"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_retransmits_unacked_with_same_serial() {
        let (mut f, mut server) = connected(test_options()).await;
        let (_snapshot, mut channel_events) = channel(&f, "ch");
        attach_with_members(&f, &mut server, "ch", &[("a", "conn-x"), ("b", "conn-y")]).await;
        let _ = channel_events.recv().await;
        let _ = channel_events.recv().await;
        assert_eq!(client_ids(presence_get(&f, "ch").await.unwrap().unwrap()), vec!["a", "b"]);

        let r = publish(&f, "ch", "x");
        let _ = server.expect_frame().await;
        server.send(ProtocolMessage::Message { channel: "ch".to_string(), msg_serial: None, connection_serial: Some(0), messages: vec![] });
        server.drop_connection("network");

        f.connection.when_state(ConnectionState::Disconnected).await.unwrap();
        time::advance(Duration::from_secs(1)).await;

        let mut server = f.service.next_connection().await;
        assert_eq!(server.request.param("resume"), Some("conn-1-key"));
        assert_eq!(server.request.param("connection_serial"), Some("0"));
        server.send_connected("conn-1", 0);

        assert_eq!(published_names(&server.expect_frame().await), (Some(0), vec!["x".to_string()]));
        server.send(ProtocolMessage::Ack { msg_serial: 0, count: 1 });
        r.await.unwrap().unwrap();

        // the channel stays attached without a new ATTACH, and the member set is still valid
        assert!(server.try_recv().is_none());
        assert!(channel_events.try_recv().is_err());
        assert_eq!(client_ids(presence_get(&f, "ch").await.unwrap().unwrap()), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resume_reattaches_and_resends() {
        let (mut f, mut server) = connected(test_options()).await;
        let (mut snapshot, _) = channel(&f, "ch");
        attach_with_members(&f, &mut server, "ch", &[("a", "conn-x"), ("b", "conn-y")]).await;
        assert_eq!(client_ids(presence_get(&f, "ch").await.unwrap().unwrap()), vec!["a", "b"]);

        let r = publish(&f, "ch", "x");
        let _ = server.expect_frame().await;
        server.drop_connection("network");
        f.connection.when_state(ConnectionState::Disconnected).await.unwrap();
        time::advance(Duration::from_secs(1)).await;

        let mut server = f.service.next_connection().await;
        server.send_connected_with("conn-2", -1, ConnectionDetails::default(), Some(ErrorInfo::new(80008, 400, "unable to resume")));
        f.connection.when_state(ConnectionState::Connected).await.unwrap();
        assert_eq!(f.connection.error_reason().map(|e| e.code), Some(80008));

        assert_eq!(server.expect_frame().await, ProtocolMessage::Attach { channel: "ch".to_string() });
        snapshot.wait_for(|s| s.state == ChannelState::Attaching).await.unwrap();
        // the member set is stale until the new sync completes
        let mut members = presence_get(&f, "ch");
        server.send(ProtocolMessage::Attached { channel: "ch".to_string(), resumed: false, has_presence: true, error: None });

        // the serial restarts for the new connection
        assert_eq!(published_names(&server.expect_frame().await), (Some(0), vec!["x".to_string()]));
        server.send(ProtocolMessage::Sync { channel: "ch".to_string(), cursor: Some("sync-1:more".to_string()), connection_serial: None, presence: present(&[("c", "conn-z")]) });
        server.send(ProtocolMessage::Ack { msg_serial: 0, count: 1 });
        r.await.unwrap().unwrap();
        assert!(members.try_recv().is_err());

        server.send(ProtocolMessage::Sync { channel: "ch".to_string(), cursor: Some("sync-1:".to_string()), connection_serial: None, presence: present(&[("a", "conn-x")]) });
        assert_eq!(client_ids(members.await.unwrap().unwrap()), vec!["a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_serials_dropped_and_gaps_reported() {
        let (f, mut server) = connected(test_options()).await;
        let _ = channel(&f, "ch");
        attach(&f, &mut server, "ch").await;
        let mut events = f.connection.on_state_change();

        let (sender, mut received) = mpsc::unbounded_channel();
        f.commands.send(Command::Subscribe { channel: "ch".to_string(), filter: None, sender }).unwrap();
        round_trip(&f, "ch").await;

        for (serial, name) in [(0, "a"), (0, "dup"), (2, "c")] {
            server.send(ProtocolMessage::Message {
                channel: "ch".to_string(),
                msg_serial: None,
                connection_serial: Some(serial),
                messages: vec![Message::new(name, json!(null))],
            });
        }
        assert_eq!(received.recv().await.unwrap().name.as_deref(), Some("a"));
        assert_eq!(received.recv().await.unwrap().name.as_deref(), Some("c"));

        let update = events.recv().await.unwrap();
        assert!(update.is_update());
        assert_eq!(update.reason.map(|r| r.code), Some(codes::MESSAGE_CONTINUITY_LOST));
        assert_eq!(f.connection.serial(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_for_released_channel_fail() {
        let (f, mut server) = connected(test_options()).await;
        let _ = channel(&f, "ch");
        attach(&f, &mut server, "ch").await;
        f.commands.send(Command::ReleaseChannel { name: "ch".to_string() }).unwrap();
        assert_eq!(server.expect_frame().await, ProtocolMessage::Detach { channel: "ch".to_string() });

        let expected = Error::channel("ch", codes::CHANNEL_OPERATION_FAILED, "channel ch was released");
        assert_eq!(publish(&f, "ch", "x").await.unwrap(), Err(expected.clone()));

        let (reply, recv) = oneshot::channel();
        f.commands.send(Command::PresenceGet { channel: "ch".to_string(), reply }).unwrap();
        assert_eq!(recv.await.unwrap(), Err(expected));

        let (sender, mut received) = mpsc::unbounded_channel();
        f.commands.send(Command::Subscribe { channel: "ch".to_string(), filter: None, sender }).unwrap();
        assert!(received.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_connected() {
        let (f, mut server) = connected(test_options()).await;
        f.connection.close();
        assert_eq!(server.expect_frame().await, ProtocolMessage::Close);
        assert_eq!(f.connection.state(), ConnectionState::Closing);

        server.send(ProtocolMessage::Closed);
        f.connection.when_state(ConnectionState::Closed).await.unwrap();
        assert_eq!(f.connection.id(), None);
        assert_eq!(f.connection.recovery_key(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_ack_times_out() {
        let (f, mut server) = connected(test_options()).await;
        f.connection.close();
        assert_eq!(server.expect_frame().await, ProtocolMessage::Close);
        time::advance(Duration::from_secs(5)).await;
        f.connection.when_state(ConnectionState::Closed).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_after_close_fails() {
        let (f, mut server) = connected(test_options()).await;
        let _ = channel(&f, "ch");
        attach(&f, &mut server, "ch").await;
        f.connection.close();
        server.send(ProtocolMessage::Closed);
        f.connection.when_state(ConnectionState::Closed).await.unwrap();

        assert_eq!(publish(&f, "ch", "x").await.unwrap(), Err(Error::InvalidState(ConnectionState::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_fails_everything() {
        let (f, mut server) = connected(test_options()).await;
        let (mut snapshot, _) = channel(&f, "ch");
        attach(&f, &mut server, "ch").await;

        server.send(ProtocolMessage::Error { channel: None, error: ErrorInfo::new(50000, 500, "internal") });
        f.connection.when_state(ConnectionState::Failed).await.unwrap();
        snapshot.wait_for(|s| s.state == ChannelState::Failed).await.unwrap();
        assert_eq!(f.connection.error_reason().map(|e| e.code), Some(50000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_error_refreshes_once() {
        let (transport, service) = FakeTransport::new(CodecKind::Json);
        let mut authenticator = MockAuthenticator::new();
        authenticator.expect_current_credential()
            .returning(|| CredentialState::Valid(Credential::Token("t1".to_string())));
        authenticator.expect_refresh()
            .times(1)
            .returning(|| Ok(Credential::Token("t2".to_string())));
        let mut f = fixture_with(test_options(), transport, service, Arc::new(authenticator));

        f.connection.connect();
        let first = f.service.next_connection().await;
        assert_eq!(first.request.param("access_token"), Some("t1"));
        first.send(ProtocolMessage::Error { channel: None, error: ErrorInfo::new(40142, 401, "token expired") });

        // the refreshed credential is rejected too: no second refresh
        let second = f.service.next_connection().await;
        second.send(ProtocolMessage::Error { channel: None, error: ErrorInfo::new(40142, 401, "token expired") });
        f.connection.when_state(ConnectionState::Failed).await.unwrap();
        assert_eq!(f.connection.error_reason().map(|e| e.code), Some(40142));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_key_fails() {
        let mut f = fixture(test_options());
        f.connection.connect();
        let server = f.service.next_connection().await;
        server.send(ProtocolMessage::Error { channel: None, error: ErrorInfo::new(40101, 401, "invalid key") });
        f.connection.when_state(ConnectionState::Failed).await.unwrap();
        assert!(f.connection.error_reason().unwrap().is_auth_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping() {
        let (f, mut server) = connected(test_options()).await;
        let connection = f.connection.clone();
        let ping = tokio::spawn(async move { connection.ping().await });

        let id = match server.expect_frame().await {
            ProtocolMessage::Heartbeat { id: Some(id) } => id,
            other => panic!("unexpected {:?}", other),
        };
        time::advance(Duration::from_millis(30)).await;
        server.send(ProtocolMessage::Heartbeat { id: Some(id) });
        assert_eq!(ping.await.unwrap().unwrap(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_times_out() {
        let (f, _server) = connected(test_options()).await;
        assert!(matches!(f.connection.ping().await, Err(Error::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_dropped() {
        let mut f = fixture(test_options());
        f.connection.connect();
        let server = f.service.next_connection().await;
        server.send_connected_with("conn-1", -1, ConnectionDetails { max_idle_interval_ms: 1000, ..Default::default() }, None);
        f.connection.when_state(ConnectionState::Connected).await.unwrap();

        // idle interval plus realtime request timeout: 6 seconds
        time::advance(Duration::from_millis(4000)).await;
        server.send(ProtocolMessage::Heartbeat { id: None });
        tokio::task::yield_now().await;
        time::advance(Duration::from_millis(5500)).await;
        assert_eq!(f.connection.state(), ConnectionState::Connected);

        time::advance(Duration::from_millis(600)).await;
        f.connection.when_state(ConnectionState::Disconnected).await.unwrap();
        assert_eq!(f.connection.error_reason().map(|e| e.status_code), Some(408));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_disabled_fails_fast() {
        let mut options = test_options();
        options.queue_messages = false;
        let f = fixture(options);
        let _ = channel(&f, "ch");
        assert!(matches!(publish(&f, "ch", "x").await.unwrap(), Err(Error::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_fails_connection() {
        let mut options = test_options();
        options.max_queued_messages = Some(1);
        options.queue_overflow_policy = QueueOverflowPolicy::FailConnection;
        let f = fixture(options);
        f.connection.send(ProtocolMessage::Message { channel: "x".to_string(), msg_serial: None, connection_serial: None, messages: vec![] });
        f.connection.send(ProtocolMessage::Message { channel: "x".to_string(), msg_serial: None, connection_serial: None, messages: vec![] });
        f.connection.when_state(ConnectionState::Failed).await.unwrap();
        assert_eq!(f.connection.error_reason().map(|e| e.code), Some(codes::QUEUE_OVERFLOW));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_option() {
        let mut options = test_options();
        options.recover = Some(RecoveryKey { connection_key: "old-key".to_string(), connection_serial: 41 }.encode());
        let mut f = fixture(options);
        f.connection.connect();
        let server = f.service.next_connection().await;
        assert_eq!(server.request.param("recover"), Some("old-key"));
        assert_eq!(server.request.param("connection_serial"), Some("41"));

        server.send_connected("conn-old", 12);
        f.connection.when_state(ConnectionState::Connected).await.unwrap();
        assert_eq!(f.connection.serial(), Some(41));
    }
}
