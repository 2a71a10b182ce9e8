//! Connection registry and broadcaster.
//!
//! The registry maps each active room code to the members connected to it.
//! Every mutation and every fan-out for a room runs while holding that room's
//! map entry, so members observe broadcasts in the order the membership
//! changes that caused them were applied. Delivery never waits: payloads are
//! queued with `try_send`, and a member whose queue refuses one is evicted.

use crate::member::{Member, MemberId, Payload};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_protocol::{codec, Outbound};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// A room identifier. Opaque to the registry.
pub type RoomCode = String;

/// Members of one room, keyed by identity.
#[derive(Debug, Default)]
struct Room {
    members: HashMap<MemberId, Member>,
}

impl Room {
    fn len(&self) -> usize {
        self.members.len()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns `true` if the member was not present yet.
    fn insert(&mut self, member: Member) -> bool {
        self.members.insert(member.id(), member).is_none()
    }

    fn remove(&mut self, id: MemberId) -> Option<Member> {
        self.members.remove(&id)
    }
}

/// A member as listed by [`Registry::members_of`].
///
/// Carries no handle on the member's queue, so holding one never keeps a
/// departed member reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// The member's identity.
    pub id: MemberId,
    /// The member's display name.
    pub name: String,
}

/// The process-wide room registry.
pub struct Registry {
    /// Rooms indexed by code. Present iff non-empty.
    rooms: DashMap<RoomCode, Room>,
    /// Members evicted after a failed delivery.
    evictions: AtomicU64,
    /// Chat messages relayed.
    messages_relayed: AtomicU64,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        info!("Creating room registry");
        Self {
            rooms: DashMap::new(),
            evictions: AtomicU64::new(0),
            messages_relayed: AtomicU64::new(0),
        }
    }

    /// Add a member to a room, creating the room if needed, then announce
    /// the new member count to everyone in it.
    pub fn join(&self, room_code: &str, member: Member) {
        let id = member.id();

        match self.rooms.entry(room_code.to_owned()) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().insert(member) {
                    trace!(room = %room_code, member = %id, "Member already present");
                }
                debug!(
                    room = %room_code,
                    member = %id,
                    members = entry.get().len(),
                    "Member joined"
                );

                self.announce_count(room_code, entry.get_mut());
                if entry.get().is_empty() {
                    entry.remove();
                    debug!(room = %room_code, "Deleted empty room");
                }
            }
            Entry::Vacant(entry) => {
                let mut room = Room::default();
                room.insert(member);
                debug!(room = %room_code, member = %id, "Creating room");

                // The room is not visible until it holds at least one member.
                self.announce_count(room_code, &mut room);
                if !room.is_empty() {
                    entry.insert(room);
                }
            }
        }
    }

    /// Remove a member from a room.
    ///
    /// Deletes the room when it becomes empty, otherwise announces the new
    /// member count. Unknown rooms and members are ignored.
    pub fn leave(&self, room_code: &str, member: MemberId) {
        let Entry::Occupied(mut entry) = self.rooms.entry(room_code.to_owned()) else {
            trace!(room = %room_code, member = %member, "Leave for unknown room");
            return;
        };

        let Some(departed) = entry.get_mut().remove(member) else {
            trace!(room = %room_code, member = %member, "Leave for unknown member");
            return;
        };

        debug!(
            room = %room_code,
            member = %member,
            members = entry.get().len(),
            connected_for = ?departed.joined_at().elapsed(),
            "Member left"
        );

        if !entry.get().is_empty() {
            self.announce_count(room_code, entry.get_mut());
        }
        if entry.get().is_empty() {
            entry.remove();
            debug!(room = %room_code, "Deleted empty room");
        }
    }

    /// Join a room and return a guard that leaves it when dropped.
    #[must_use]
    pub fn join_guarded(self: &Arc<Self>, room_code: &str, member: Member) -> MembershipGuard {
        let id = member.id();
        self.join(room_code, member);
        MembershipGuard {
            registry: Arc::clone(self),
            room_code: room_code.to_owned(),
            member: id,
        }
    }

    /// Relay a chat line from `sender` to every member of a room, sender
    /// included.
    ///
    /// Returns the number of members the line was queued for. A sender that
    /// is not a member of the room relays nothing and gets `0`.
    pub fn broadcast_message(&self, room_code: &str, sender: MemberId, text: &str) -> usize {
        let Entry::Occupied(mut entry) = self.rooms.entry(room_code.to_owned()) else {
            warn!(room = %room_code, "Broadcast to non-existent room");
            return 0;
        };

        let room = entry.get_mut();
        let Some(sender_name) = room.members.get(&sender).map(Member::name) else {
            debug!(room = %room_code, member = %sender, "Dropped message from non-member");
            return 0;
        };
        let payload = match codec::encode(&Outbound::chat(sender_name, text)) {
            Ok(line) => Payload::from(line),
            Err(e) => {
                error!(room = %room_code, error = %e, "Failed to encode chat line");
                return 0;
            }
        };

        let (delivered, evicted) = self.fan_out(room_code, room, &payload);
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
        trace!(room = %room_code, recipients = delivered, "Relayed message");

        if evicted > 0 && !room.is_empty() {
            self.announce_count(room_code, room);
        }
        if entry.get().is_empty() {
            entry.remove();
            debug!(room = %room_code, "Deleted empty room");
        }

        delivered
    }

    /// Send the current member count to every member of a room.
    pub fn broadcast_member_count(&self, room_code: &str) {
        let Entry::Occupied(mut entry) = self.rooms.entry(room_code.to_owned()) else {
            return;
        };

        self.announce_count(room_code, entry.get_mut());
        if entry.get().is_empty() {
            entry.remove();
            debug!(room = %room_code, "Deleted empty room");
        }
    }

    /// Snapshot of a room's members. Empty for unknown rooms.
    #[must_use]
    pub fn members_of(&self, room_code: &str) -> Vec<MemberInfo> {
        self.rooms
            .get(room_code)
            .map(|room| {
                room.members
                    .values()
                    .map(|member| MemberInfo {
                        id: member.id(),
                        name: member.name().to_owned(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check if a room currently has members.
    #[must_use]
    pub fn contains(&self, room_code: &str) -> bool {
        self.rooms.contains_key(room_code)
    }

    /// Get the number of members in a room.
    #[must_use]
    pub fn member_count(&self, room_code: &str) -> usize {
        self.rooms
            .get(room_code)
            .map(|room| room.len())
            .unwrap_or(0)
    }

    /// Get all active room codes.
    #[must_use]
    pub fn room_codes(&self) -> Vec<RoomCode> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            member_count: self.rooms.iter().map(|room| room.len()).sum(),
            evictions: self.evictions.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
        }
    }

    /// Announce the member count until no further member is evicted.
    fn announce_count(&self, room_code: &str, room: &mut Room) {
        loop {
            let count = room.len();
            let payload = match codec::encode(&Outbound::members_update(count)) {
                Ok(text) => Payload::from(text),
                Err(e) => {
                    error!(room = %room_code, error = %e, "Failed to encode member count");
                    return;
                }
            };

            let (_, evicted) = self.fan_out(room_code, room, &payload);
            trace!(room = %room_code, count, "Announced member count");

            if evicted == 0 || room.is_empty() {
                return;
            }
        }
    }

    /// Queue a payload for every member, evicting those that refuse it.
    ///
    /// Returns `(delivered, evicted)`.
    fn fan_out(&self, room_code: &str, room: &mut Room, payload: &Payload) -> (usize, usize) {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for member in room.members.values() {
            match member.deliver(payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        room = %room_code,
                        member = %member.id(),
                        name = %member.name(),
                        error = %e,
                        "Evicting member after failed delivery"
                    );
                    failed.push(member.id());
                }
            }
        }

        for id in &failed {
            room.remove(*id);
        }
        self.evictions.fetch_add(failed.len() as u64, Ordering::Relaxed);

        (delivered, failed.len())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of active rooms.
    pub room_count: usize,
    /// Number of connected members across all rooms.
    pub member_count: usize,
    /// Members evicted after a failed delivery since start.
    pub evictions: u64,
    /// Chat messages relayed since start.
    pub messages_relayed: u64,
}

/// Leaves a room exactly once, when dropped.
#[derive(Debug)]
pub struct MembershipGuard {
    registry: Arc<Registry>,
    room_code: RoomCode,
    member: MemberId,
}

impl MembershipGuard {
    /// Get the guarded member's identity.
    #[must_use]
    pub fn member(&self) -> MemberId {
        self.member
    }

    /// Get the room code.
    #[must_use]
    pub fn room_code(&self) -> &str {
        &self.room_code
    }
}

impl Drop for MembershipGuard {
    fn drop(&mut self) {
        self.registry.leave(&self.room_code, self.member);
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("rooms", &self.rooms.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Outbox;
    use huddle_protocol::{decode, RoomEvent};
    use rand::Rng;

    const COUNT_1: &str = r#"{"type":"members_update","count":1}"#;
    const COUNT_2: &str = r#"{"type":"members_update","count":2}"#;
    const COUNT_3: &str = r#"{"type":"members_update","count":3}"#;

    fn member(name: &str) -> (Member, Outbox) {
        Member::new(name, 64)
    }

    fn assert_present_iff_non_empty(registry: &Registry, room: &str) {
        assert_eq!(registry.contains(room), registry.member_count(room) > 0);
        assert_eq!(
            registry.contains(room),
            !registry.members_of(room).is_empty()
        );
    }

    #[test]
    fn test_join_then_leave_removes_room() {
        let registry = Registry::new();
        let (a, mut oa) = member("alice");
        let a_id = a.id();

        registry.join("12345", a);
        assert!(registry.contains("12345"));
        assert_eq!(registry.member_count("12345"), 1);
        assert_eq!(oa.drain(), vec![COUNT_1]);

        registry.leave("12345", a_id);
        assert!(!registry.contains("12345"));
        assert_present_iff_non_empty(&registry, "12345");
        // Nobody is left to be told.
        assert!(oa.drain().is_empty());
    }

    #[test]
    fn test_presence_tracks_membership_through_sequence() {
        let registry = Registry::new();
        let (a, _oa) = member("a");
        let (b, _ob) = member("b");
        let (a_id, b_id) = (a.id(), b.id());

        registry.join("r", a);
        assert_present_iff_non_empty(&registry, "r");
        registry.join("r", b);
        assert_present_iff_non_empty(&registry, "r");
        registry.leave("r", a_id);
        assert_present_iff_non_empty(&registry, "r");
        registry.leave("r", a_id);
        assert_present_iff_non_empty(&registry, "r");
        registry.leave("r", b_id);
        assert_present_iff_non_empty(&registry, "r");
        assert!(!registry.contains("r"));
    }

    #[test]
    fn test_join_announces_count_to_everyone() {
        let registry = Registry::new();
        let (a, mut oa) = member("a");
        let (b, mut ob) = member("b");
        let (x, mut ox) = member("x");

        registry.join("r", a);
        registry.join("r", b);
        oa.drain();
        ob.drain();

        registry.join("r", x);
        assert_eq!(oa.drain(), vec![COUNT_3]);
        assert_eq!(ob.drain(), vec![COUNT_3]);
        assert_eq!(ox.drain(), vec![COUNT_3]);
    }

    #[test]
    fn test_leave_announces_count_to_remaining() {
        let registry = Registry::new();
        let (a, mut oa) = member("a");
        let (b, mut ob) = member("b");
        let (x, mut ox) = member("x");
        let x_id = x.id();

        registry.join("r", a);
        registry.join("r", b);
        registry.join("r", x);
        oa.drain();
        ob.drain();
        ox.drain();

        registry.leave("r", x_id);
        assert_eq!(oa.drain(), vec![COUNT_2]);
        assert_eq!(ob.drain(), vec![COUNT_2]);
        assert!(ox.drain().is_empty());
    }

    #[test]
    fn test_broadcast_includes_sender() {
        let registry = Registry::new();
        let (a, mut oa) = member("alice");
        let (b, mut ob) = member("bob");
        let (c, mut oc) = member("carol");
        let a_id = a.id();

        registry.join("r", a);
        registry.join("r", b);
        registry.join("r", c);
        oa.drain();
        ob.drain();
        oc.drain();

        assert_eq!(registry.broadcast_message("r", a_id, "hi"), 3);
        assert_eq!(oa.drain(), vec!["alice: hi"]);
        assert_eq!(ob.drain(), vec!["alice: hi"]);
        assert_eq!(oc.drain(), vec!["alice: hi"]);
        assert_eq!(registry.stats().messages_relayed, 1);
    }

    #[test]
    fn test_leave_unknown_is_noop() {
        let registry = Registry::new();
        let (a, mut oa) = member("a");
        let (stranger, _os) = member("stranger");

        registry.leave("nowhere", stranger.id());
        assert!(!registry.contains("nowhere"));

        registry.join("r", a);
        oa.drain();
        registry.leave("r", stranger.id());
        assert_eq!(registry.member_count("r"), 1);
        // No count update for a no-op.
        assert!(oa.drain().is_empty());
    }

    #[test]
    fn test_unknown_room_operations_have_no_effect() {
        let registry = Registry::new();
        let (stranger, _os) = member("stranger");

        assert_eq!(registry.broadcast_message("ghost", stranger.id(), "b"), 0);
        registry.broadcast_member_count("ghost");
        assert!(registry.members_of("ghost").is_empty());
        assert!(!registry.contains("ghost"));
        assert_eq!(registry.stats().room_count, 0);
    }

    #[test]
    fn test_join_is_idempotent_by_identity() {
        let registry = Registry::new();
        let (a, mut oa) = member("a");

        registry.join("r", a.clone());
        registry.join("r", a);
        assert_eq!(registry.member_count("r"), 1);
        assert_eq!(oa.drain(), vec![COUNT_1, COUNT_1]);
    }

    #[test]
    fn test_same_name_different_members() {
        let registry = Registry::new();
        let (a1, _o1) = member("sam");
        let (a2, _o2) = member("sam");

        registry.join("r", a1);
        registry.join("r", a2);
        assert_eq!(registry.member_count("r"), 2);
    }

    #[test]
    fn test_failed_recipient_is_evicted() {
        let registry = Registry::new();
        let (a, mut oa) = member("a");
        let (b, mut ob) = member("b");
        let (dead, odead) = member("dead");
        let (a_id, b_id, dead_id) = (a.id(), b.id(), dead.id());

        registry.join("r", a);
        registry.join("r", b);
        registry.join("r", dead);
        oa.drain();
        ob.drain();
        drop(odead);

        assert_eq!(registry.broadcast_message("r", a_id, "hello"), 2);
        assert_eq!(oa.drain(), vec!["a: hello", COUNT_2]);
        assert_eq!(ob.drain(), vec!["a: hello", COUNT_2]);
        assert_eq!(registry.member_count("r"), 2);
        assert!(registry.members_of("r").iter().all(|m| m.id != dead_id));
        assert_eq!(registry.stats().evictions, 1);

        // Later broadcasts skip the evicted member.
        assert_eq!(registry.broadcast_message("r", b_id, "again"), 2);
        assert_eq!(registry.stats().evictions, 1);
    }

    #[test]
    fn test_departed_member_cannot_relay() {
        let registry = Registry::new();
        let (a, _oa) = member("alice");
        let (b, mut ob) = member("bob");
        let a_id = a.id();
        // A second handle keeps alice's queue open after she leaves.
        let _kept = a.clone();

        registry.join("r", a);
        registry.join("r", b);
        let snapshot = registry.members_of("r");
        registry.leave("r", a_id);
        assert_eq!(ob.drain(), vec![COUNT_2, COUNT_1]);

        assert_eq!(registry.broadcast_message("r", a_id, "ghost"), 0);
        assert!(ob.drain().is_empty());
        assert_eq!(registry.stats().messages_relayed, 0);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|info| info.id == a_id && info.name == "alice"));
    }

    #[test]
    fn test_full_queue_is_evicted() {
        let registry = Registry::new();
        let (a, mut oa) = member("a");
        let (slow, _oslow) = Member::new("slow", 1);
        let a_id = a.id();

        registry.join("r", a);
        // First count update fills the slow member's queue.
        registry.join("r", slow);
        oa.drain();

        registry.broadcast_message("r", a_id, "ping");
        assert_eq!(registry.member_count("r"), 1);
        assert_eq!(oa.drain(), vec!["a: ping", COUNT_1]);
    }

    #[test]
    fn test_room_removed_when_every_recipient_fails() {
        let registry = Registry::new();
        let (a, oa) = member("a");
        let (b, ob) = member("b");
        let a_id = a.id();

        registry.join("r", a);
        registry.join("r", b);
        drop(oa);
        drop(ob);

        assert_eq!(registry.broadcast_message("r", a_id, "anyone?"), 0);
        assert!(!registry.contains("r"));
    }

    #[test]
    fn test_join_with_closed_outbox_creates_nothing() {
        let registry = Registry::new();
        let (a, oa) = member("a");
        drop(oa);

        registry.join("r", a);
        assert!(!registry.contains("r"));
    }

    #[test]
    fn test_rooms_are_independent() {
        let registry = Registry::new();
        let (a, mut oa) = member("a");
        let (b, mut ob) = member("b");
        let a_id = a.id();

        registry.join("one", a);
        registry.join("two", b);
        oa.drain();
        ob.drain();

        registry.broadcast_message("one", a_id, "only here");
        assert_eq!(oa.drain(), vec!["a: only here"]);
        assert!(ob.drain().is_empty());
        assert_eq!(registry.room_codes().len(), 2);
    }

    #[test]
    fn test_broadcast_member_count() {
        let registry = Registry::new();
        let (a, mut oa) = member("a");

        registry.join("r", a);
        oa.drain();
        registry.broadcast_member_count("r");
        assert_eq!(oa.drain(), vec![COUNT_1]);
    }

    #[test]
    fn test_guard_leaves_on_drop() {
        let registry = Arc::new(Registry::new());
        let (a, _oa) = member("a");
        let (b, mut ob) = member("b");

        registry.join("r", b);
        let guard = registry.join_guarded("r", a);
        assert_eq!(guard.room_code(), "r");
        assert_eq!(registry.member_count("r"), 2);
        ob.drain();

        drop(guard);
        assert_eq!(registry.member_count("r"), 1);
        assert_eq!(ob.drain(), vec![COUNT_1]);
    }

    #[test]
    fn test_stats() {
        let registry = Registry::new();
        let (a, _oa) = member("a");
        let (b, _ob) = member("b");
        let (c, _oc) = member("c");

        registry.join("one", a);
        registry.join("one", b);
        registry.join("two", c);

        let stats = registry.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.member_count, 3);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_joins() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for i in 0..50 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (m, outbox) = Member::new(format!("user-{i}"), 128);
                let id = m.id();
                registry.join("race", m);
                (id, outbox)
            }));
        }

        let mut outboxes = Vec::new();
        for handle in handles {
            outboxes.push(handle.await.unwrap());
        }

        assert_eq!(registry.member_count("race"), 50);
        let mut ids: Vec<_> = registry
            .members_of("race")
            .iter()
            .map(|info| info.id)
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 50);

        // The last update every member saw reports the full room.
        for (_, outbox) in &mut outboxes {
            let seen = outbox.drain();
            assert_eq!(
                seen.last().map(String::as_str),
                Some(r#"{"type":"members_update","count":50}"#)
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_join_broadcast_leave() {
        const TASKS: usize = 24;
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for i in 0..TASKS {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let name = format!("user-{i}");
                let (m, mut outbox) = Member::new(name.clone(), 1024);
                let id = m.id();
                let messages = rand::thread_rng().gen_range(1..=8);

                registry.join("churn", m);
                for k in 0..messages {
                    tokio::task::yield_now().await;
                    registry.broadcast_message("churn", id, &format!("msg-{k}"));
                }
                tokio::task::yield_now().await;
                registry.leave("churn", id);

                (name, messages, outbox.drain())
            }));
        }

        for handle in handles {
            let (name, messages, seen) = handle.await.unwrap();
            let mut counts = Vec::new();
            let mut last_from: HashMap<String, usize> = HashMap::new();
            let mut own = 0;

            for text in &seen {
                match decode(text).unwrap() {
                    Outbound::Event(RoomEvent::MembersUpdate { count }) => counts.push(count),
                    Outbound::Chat { sender, text } => {
                        let k: usize = text.trim_start_matches("msg-").parse().unwrap();
                        // Each sender's lines arrive in the order they were sent.
                        if let Some(prev) = last_from.insert(sender.clone(), k) {
                            assert!(k > prev, "{name} saw {sender} out of order");
                        }
                        if sender == name {
                            assert_eq!(k, own);
                            own += 1;
                        }
                    }
                    Outbound::RoomNotFound => panic!("unexpected notice"),
                }
            }

            // The member's own join is the first thing it hears about.
            assert!(decode(&seen[0]).is_ok_and(|m| matches!(m, Outbound::Event(_))));
            assert!(counts[0] >= 1);
            // Every join and leave while present is announced, one at a time.
            for pair in counts.windows(2) {
                assert_eq!(pair[0].abs_diff(pair[1]), 1, "{name} counts {counts:?}");
            }
            assert_eq!(own, messages);
        }

        assert!(!registry.contains("churn"));
        assert_eq!(registry.member_count("churn"), 0);
        assert_eq!(registry.stats().evictions, 0);
    }
}
