use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::protocol::{PresenceAction, PresenceMessage};

struct SyncState {
    /// provisional member set, leaves are kept as `Absent` tombstones until the sync ends
    members: FxHashMap<String, PresenceMessage>,
    /// members for which an event was emitted during the sync
    announced: FxHashSet<String>,
}

/// The member set of one channel, keyed by [PresenceMessage::member_key].
///
/// While a SYNC is in progress, all changes go to a provisional set which replaces the published
///  set when the SYNC ends. The published set is never modified while a SYNC is in progress.
#[derive(Default)]
pub struct PresenceMap {
    members: FxHashMap<String, PresenceMessage>,
    sync: Option<SyncState>,
}

impl PresenceMap {
    pub fn is_syncing(&self) -> bool {
        self.sync.is_some()
    }

    /// the published members, ordered by member key
    pub fn values(&self) -> Vec<PresenceMessage> {
        let mut result = self.members.values()
            .cloned()
            .collect::<Vec<_>>();
        result.sort_by_key(|m| m.member_key());
        result
    }

    pub fn start_sync(&mut self) {
        if self.sync.is_none() {
            trace!("starting presence sync");
            self.sync = Some(SyncState {
                members: Default::default(),
                announced: Default::default(),
            });
        }
    }

    /// Applies a presence action received outside of a SYNC frame. Returns the message to emit
    ///  to subscribers, or `None` if the message is stale.
    pub fn put(&mut self, msg: PresenceMessage) -> Option<PresenceMessage> {
        let key = msg.member_key();
        if !self.apply(key.clone(), msg.clone(), false) {
            return None;
        }
        if let Some(sync) = &mut self.sync {
            sync.announced.insert(key);
        }
        Some(msg)
    }

    /// Adds a member from a SYNC frame to the provisional set. Synced members are announced when
    ///  the sync ends.
    pub fn put_synced(&mut self, msg: PresenceMessage) {
        self.start_sync();
        let key = msg.member_key();
        let _ = self.apply(key, msg, true);
    }

    /// NB: synced members are only compared to the provisional set, the sync rebuilds the set
    ///  from scratch
    fn apply(&mut self, key: String, msg: PresenceMessage, synced: bool) -> bool {
        let existing = match &self.sync {
            Some(sync) if synced => sync.members.get(&key),
            Some(sync) => sync.members.get(&key).or_else(|| self.members.get(&key)),
            None => self.members.get(&key),
        };
        if let Some(existing) = existing {
            if !msg.is_newer_than(existing) {
                trace!("ignoring stale presence message for {}", key);
                return false;
            }
        }

        let mut stored = msg;
        match &mut self.sync {
            Some(sync) => {
                stored.action = match stored.action {
                    PresenceAction::Leave | PresenceAction::Absent => PresenceAction::Absent,
                    _ => PresenceAction::Present,
                };
                sync.members.insert(key, stored);
            }
            None => match stored.action {
                PresenceAction::Leave | PresenceAction::Absent => {
                    self.members.remove(&key);
                }
                _ => {
                    stored.action = PresenceAction::Present;
                    self.members.insert(key, stored);
                }
            }
        }
        true
    }

    /// Replaces the published set by the provisional one. Returns the events reconciling the
    ///  difference for members not announced during the sync: `present` for new members,
    ///  `update` for members with changed data, and `leave` for members that are gone.
    pub fn end_sync(&mut self) -> Vec<PresenceMessage> {
        let sync = match self.sync.take() {
            Some(sync) => sync,
            None => return Vec::new(),
        };

        let mut previous = std::mem::take(&mut self.members);
        let mut joined = Vec::new();
        for (key, member) in sync.members {
            if member.action == PresenceAction::Absent {
                continue;
            }
            let announced = sync.announced.contains(&key);
            match previous.remove(&key) {
                None if !announced => joined.push(member.clone()),
                Some(prev) if !announced && prev.data != member.data => {
                    let mut event = member.clone();
                    event.action = PresenceAction::Update;
                    joined.push(event);
                }
                _ => {}
            }
            self.members.insert(key, member);
        }

        let mut left = previous.into_iter()
            .filter(|(key, _)| !sync.announced.contains(key))
            .map(|(_, mut member)| {
                member.action = PresenceAction::Leave;
                member
            })
            .collect::<Vec<_>>();

        joined.sort_by_key(|m| m.member_key());
        left.sort_by_key(|m| m.member_key());
        trace!("presence sync complete: {} member(s), {} joined, {} left", self.members.len(), joined.len(), left.len());

        joined.append(&mut left);
        joined
    }

    /// Removes all members, returning a `leave` event for each
    pub fn clear(&mut self) -> Vec<PresenceMessage> {
        self.sync = None;
        let mut result = self.members.drain()
            .map(|(_, mut member)| {
                member.action = PresenceAction::Leave;
                member
            })
            .collect::<Vec<_>>();
        result.sort_by_key(|m| m.member_key());
        result
    }
}

/// Whether a SYNC frame with this cursor is the last one of its sequence: the cursor is absent,
///  or its part after the sequence id is empty
pub fn is_last_sync_frame(cursor: Option<&str>) -> bool {
    match cursor {
        None => true,
        Some(cursor) => match cursor.split_once(':') {
            Some((_, rest)) => rest.is_empty(),
            None => cursor.is_empty(),
        },
    }
}
