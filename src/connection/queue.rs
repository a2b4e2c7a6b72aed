use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::QueueOverflowPolicy;
use crate::error::{Error, ErrorInfo, Result};
use crate::protocol::ProtocolMessage;

/// Undoes an optimistic change to a channel's local presence members if the service rejects
///  the corresponding presence frame
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRollback {
    pub channel: String,
    pub client_id: String,
    /// `None` if the client was not present before
    pub previous: Option<Value>,
}

/// The caller waiting for a frame's acknowledgement
#[derive(Debug, Default)]
pub struct AckWaiter {
    pub reply: Option<oneshot::Sender<Result<()>>>,
    pub rollback: Option<PresenceRollback>,
}

impl AckWaiter {
    pub fn new(reply: oneshot::Sender<Result<()>>) -> AckWaiter {
        AckWaiter {
            reply: Some(reply),
            rollback: None,
        }
    }

    /// Notifies the caller, returning the rollback to apply if the frame failed
    #[must_use]
    pub fn settle(self, result: Result<()>) -> Option<PresenceRollback> {
        let failed = result.is_err();
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
        if failed {
            self.rollback
        }
        else {
            None
        }
    }
}

#[derive(Debug)]
pub struct Outbound {
    pub msg: ProtocolMessage,
    pub waiter: AckWaiter,
}

impl Outbound {
    pub fn new(msg: ProtocolMessage, waiter: AckWaiter) -> Outbound {
        Outbound { msg, waiter }
    }

    pub fn fire_and_forget(msg: ProtocolMessage) -> Outbound {
        Outbound {
            msg,
            waiter: AckWaiter::default(),
        }
    }

    #[must_use]
    pub fn fail(self, error: Error) -> Option<PresenceRollback> {
        self.waiter.settle(Err(error))
    }
}

/// Frames produced by channel and presence logic while handling one event. The connection
///  manager transmits (or queues) them in order once the event is handled.
#[derive(Debug, Default)]
pub struct Outbox {
    pub frames: Vec<Outbound>,
    /// set when a queue overflowed under [QueueOverflowPolicy::FailConnection]
    pub fail_connection: Option<ErrorInfo>,
}

impl Outbox {
    pub fn send(&mut self, msg: ProtocolMessage, waiter: AckWaiter) {
        self.frames.push(Outbound::new(msg, waiter));
    }

    pub fn send_unacked(&mut self, msg: ProtocolMessage) {
        self.frames.push(Outbound::fire_and_forget(msg));
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// the pushed frame was rejected and its waiter failed
    Rejected,
    /// the oldest frame was dropped and its waiter failed to make room for the pushed one
    DroppedOldest,
    /// the pushed frame was rejected, and the connection must fail
    FailConnection,
}

/// FIFO of frames waiting to be transmitted, bounded by `limit` with an overflow policy
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Outbound>,
    limit: Option<usize>,
    policy: QueueOverflowPolicy,
}

impl OutboundQueue {
    pub fn new(limit: Option<usize>, policy: QueueOverflowPolicy) -> OutboundQueue {
        OutboundQueue {
            items: VecDeque::new(),
            limit,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// NB: rollbacks for rejected or dropped frames are appended to `rollbacks`
    pub fn push(&mut self, item: Outbound, rollbacks: &mut Vec<PresenceRollback>) -> PushOutcome {
        let limit = match self.limit {
            Some(limit) if self.items.len() >= limit => limit,
            _ => {
                self.items.push_back(item);
                return PushOutcome::Queued;
            }
        };

        match self.policy {
            QueueOverflowPolicy::RejectNewest => {
                debug!("outbound queue full, rejecting {}", item.msg.kind());
                rollbacks.extend(item.fail(Error::QueueOverflow { limit }));
                PushOutcome::Rejected
            }
            QueueOverflowPolicy::DropOldest => {
                if let Some(oldest) = self.items.pop_front() {
                    debug!("outbound queue full, dropping oldest {}", oldest.msg.kind());
                    rollbacks.extend(oldest.fail(Error::QueueOverflow { limit }));
                }
                self.items.push_back(item);
                PushOutcome::DroppedOldest
            }
            QueueOverflowPolicy::FailConnection => {
                warn!("outbound queue full, failing the connection");
                rollbacks.extend(item.fail(Error::QueueOverflow { limit }));
                PushOutcome::FailConnection
            }
        }
    }

    /// Puts previously dequeued frames back at the front, keeping their order. This never
    ///  applies the overflow policy: the frames were accepted before.
    pub fn push_front_all(&mut self, items: Vec<Outbound>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn drain(&mut self) -> Vec<Outbound> {
        self.items.drain(..).collect()
    }

    #[must_use]
    pub fn fail_all(&mut self, error: &Error) -> Vec<PresenceRollback> {
        self.items.drain(..)
            .filter_map(|item| item.fail(error.clone()))
            .collect()
    }
}

/// Transmitted frames awaiting ACK / NACK, in `msg_serial` order
#[derive(Debug, Default)]
pub struct PendingAcks {
    entries: VecDeque<(u64, Outbound)>,
}

impl PendingAcks {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, msg_serial: u64, item: Outbound) {
        self.entries.push_back((msg_serial, item));
    }

    pub fn on_ack(&mut self, msg_serial: u64, count: u32) {
        for item in self.take_range(msg_serial, count) {
            let _ = item.waiter.settle(Ok(()));
        }
    }

    #[must_use]
    pub fn on_nack(&mut self, msg_serial: u64, count: u32, error: ErrorInfo) -> Vec<PresenceRollback> {
        self.take_range(msg_serial, count).into_iter()
            .filter_map(|item| item.fail(Error::Connection(error.clone())))
            .collect()
    }

    fn take_range(&mut self, msg_serial: u64, count: u32) -> Vec<Outbound> {
        let end = msg_serial.saturating_add(count as u64);
        let (in_range, rest): (Vec<_>, Vec<_>) = self.entries.drain(..)
            .partition(|(serial, _)| (msg_serial..end).contains(serial));
        if in_range.len() < count as usize {
            debug!("acknowledgement for serials {}..{} covers {} pending frame(s)", msg_serial, end, in_range.len());
        }
        self.entries = rest.into();
        in_range.into_iter()
            .map(|(_, item)| item)
            .collect()
    }

    /// frames with their serials for retransmission after a resumed reconnect
    pub fn iter(&self) -> impl Iterator<Item = &(u64, Outbound)> {
        self.entries.iter()
    }

    /// removes all frames for renumbering after a failed resume
    pub fn drain(&mut self) -> Vec<Outbound> {
        self.entries.drain(..)
            .map(|(_, item)| item)
            .collect()
    }

    #[must_use]
    pub fn fail_all(&mut self, error: &Error) -> Vec<PresenceRollback> {
        self.drain().into_iter()
            .filter_map(|item| item.fail(error.clone()))
            .collect()
    }
}
