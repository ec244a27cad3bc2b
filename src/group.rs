//! # Sender group (§4.C)
//!
//! Owns every known sender's [`PeerReceiver`], keyed by sender-id, plus the
//! re-entrancy-safe "pop loop" that drains whichever receivers currently
//! have a releasable packet. Modeled on the teacher's `Session::links:
//! HashMap<u8, LinkInfo>` membership map, generalized from link-ids to
//! 32-bit sender-ids and from a flat map to one that also tracks causal
//! release ordering across senders.

use crate::receiver::{PeerReceiver, ReceiverEvent, ReceiverState};
use crate::wire::{Dependency, Packet, PacketId, SenderId};
use std::collections::{HashMap, VecDeque};

/// A packet released upward by the group, with enough context for the
/// causal transport to decide what to do with it (deliver, or consume as
/// protocol plumbing).
#[derive(Debug, Clone)]
pub struct Released {
    pub sender_id: SenderId,
    pub packet: Packet,
}

/// Keyed collection of every sender's receiver, plus pop-loop arbitration.
///
/// The "pop loop" (§4.C): releasing one packet from one receiver can
/// satisfy another receiver's pending dependency, which can release
/// another packet, and so on. A naive recursive implementation risks
/// reentering `release_next` while already inside it; instead callers
/// call [`SenderGroup::pop_all`], and the `popping` flag makes repeat
/// calls while a pop is already in flight a no-op queue push rather than
/// a reentrant drain — matching `GibberRMulticastSenderGroup`'s
/// `popping`/`pop_queue` fields.
pub struct SenderGroup {
    receivers: HashMap<SenderId, PeerReceiver>,
    /// True while `pop_all` is already draining; guards against
    /// reentrant drains triggered by events raised during release.
    popping: bool,
    /// Senders that requested a pop attempt while one was already in
    /// flight; retried once the in-flight drain finishes.
    pop_queue: VecDeque<SenderId>,
}

impl SenderGroup {
    pub fn new() -> Self {
        SenderGroup {
            receivers: HashMap::new(),
            popping: false,
            pop_queue: VecDeque::new(),
        }
    }

    pub fn get(&self, id: SenderId) -> Option<&PeerReceiver> {
        self.receivers.get(&id)
    }

    pub fn get_mut(&mut self, id: SenderId) -> Option<&mut PeerReceiver> {
        self.receivers.get_mut(&id)
    }

    pub fn contains(&self, id: SenderId) -> bool {
        self.receivers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SenderId, &PeerReceiver)> {
        self.receivers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SenderId, &mut PeerReceiver)> {
        self.receivers.iter_mut()
    }

    pub fn by_name(&self, name: &str) -> Option<&PeerReceiver> {
        self.receivers.values().find(|r| r.name.as_deref() == Some(name))
    }

    /// Insert a brand-new receiver for `id` if one doesn't already exist.
    /// Returns `true` if a new receiver was created.
    pub fn ensure(&mut self, id: SenderId, is_self: bool, config: crate::config::ReceiverConfig) -> bool {
        if self.receivers.contains_key(&id) {
            return false;
        }
        self.receivers.insert(id, PeerReceiver::new(id, is_self, config));
        true
    }

    pub fn remove(&mut self, id: SenderId) -> Option<PeerReceiver> {
        self.receivers.remove(&id)
    }

    /// Mark every live receiver `FAILED`/`UNKNOWN_FAILED` and collect
    /// whatever events that raises — used when the local node itself
    /// disconnects (§4.D graceful shutdown affects how peers are torn
    /// down locally, not just our own outbound state).
    pub fn stop_all(&mut self) -> Vec<(SenderId, Vec<ReceiverEvent>)> {
        let mut out = Vec::new();
        for (id, recv) in self.receivers.iter_mut() {
            recv.stop();
            let events = recv.drain_events();
            if !events.is_empty() {
                out.push((*id, events));
            }
        }
        out
    }

    /// Names every sender currently in a live, non-terminal state —
    /// used to build ATTEMPT_JOIN/JOIN sender lists (§4.D).
    pub fn live_sender_ids(&self) -> Vec<SenderId> {
        self.receivers
            .iter()
            .filter(|(_, r)| {
                !matches!(
                    r.state,
                    ReceiverState::Failed
                        | ReceiverState::UnknownFailed
                        | ReceiverState::Stopped
                        | ReceiverState::PendingRemoval
                )
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Dependency-vector snapshot of our causal knowledge of every sender
    /// (§3, §4.D): "the next packet we expect from each sender".
    pub fn dependency_snapshot(&self) -> Vec<Dependency> {
        self.receivers
            .iter()
            .map(|(id, r)| Dependency {
                sender_id: *id,
                packet_id: r.next_output_packet(),
            })
            .collect()
    }

    /// Check whether `deps` are all satisfied by the current pop
    /// pointers; if a dependency names a sender already `FAILED`, extend
    /// that sender's endpoint to at least the named packet-id so it can
    /// complete (§4.B causal release rule).
    pub fn deps_satisfied(&mut self, deps: &[Dependency]) -> bool {
        let mut ok = true;
        for dep in deps {
            if let Some(recv) = self.receivers.get_mut(&dep.sender_id) {
                recv.extend_failed_endpoint(dep.packet_id);
                if crate::wire::diff(recv.next_output_packet(), dep.packet_id) > 0 {
                    ok = false;
                }
            }
            // An unknown sender-id in a dependency vector is ignored
            // entirely (§9 Open Question resolution): we have no
            // receiver to satisfy it against, and none is created.
        }
        ok
    }

    /// Request a pop attempt on `id`'s receiver. If a drain is already in
    /// flight, `id` is queued and retried once the current drain
    /// finishes, instead of recursing.
    pub fn request_pop(&mut self, id: SenderId) {
        if self.popping {
            self.pop_queue.push_back(id);
        } else {
            self.pop_all_from(id);
        }
    }

    /// Drain every receiver with a releasable, dependency-satisfied
    /// packet, starting from `seed` and following whatever further pops
    /// its release unblocks. Returns every packet released, in release
    /// order, for the caller to act on (deliver DATA, consume control
    /// packets).
    fn pop_all_from(&mut self, seed: SenderId) -> Vec<Released> {
        self.popping = true;
        self.pop_queue.push_back(seed);
        let mut released = Vec::new();

        while let Some(id) = self.pop_queue.pop_front() {
            loop {
                let Some(packet) = self
                    .receivers
                    .get(&id)
                    .and_then(|r| r.peek_pending())
                    .cloned()
                else {
                    break;
                };
                if !self.deps_satisfied(&packet.deps) {
                    break;
                }
                let recv = self.receivers.get_mut(&id).expect("checked above");
                recv.release_next();
                released.push(Released {
                    sender_id: id,
                    packet,
                });
                // Releasing from `id` may have unblocked any other
                // sender waiting on a dependency on `id` — re-check the
                // whole group rather than just `id` again.
                for other in self.live_sender_ids() {
                    if other != id {
                        self.pop_queue.push_back(other);
                    }
                }
            }
        }

        self.popping = false;
        released
    }

    /// Drain everything currently poppable, without a particular seed —
    /// used after a batch of inbound pushes.
    pub fn pop_all(&mut self) -> Vec<Released> {
        let ids: Vec<SenderId> = self.receivers.keys().copied().collect();
        let mut released = Vec::new();
        for id in ids {
            if self.popping {
                self.pop_queue.push_back(id);
                continue;
            }
            released.extend(self.pop_all_from(id));
        }
        released
    }
}

impl Default for SenderGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReceiverConfig;
    use crate::wire::{Body, DepVec};

    fn no_data(sender: SenderId, id: PacketId) -> Packet {
        Packet {
            sender_id: sender,
            packet_id: Some(id),
            deps: DepVec::new(),
            body: Body::NoData,
        }
    }

    #[test]
    fn ensure_inserts_once() {
        let mut group = SenderGroup::new();
        assert!(group.ensure(1, false, ReceiverConfig::default()));
        assert!(!group.ensure(1, false, ReceiverConfig::default()));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn pop_all_releases_independent_senders() {
        let mut group = SenderGroup::new();
        group.ensure(1, false, ReceiverConfig::default());
        group.ensure(2, false, ReceiverConfig::default());
        group.get_mut(1).unwrap().update_start(0);
        group.get_mut(2).unwrap().update_start(0);
        group.get_mut(1).unwrap().push(no_data(1, 0));
        group.get_mut(2).unwrap().push(no_data(2, 0));

        let released = group.pop_all();
        assert_eq!(released.len(), 2);
    }

    #[test]
    fn pop_blocks_on_unsatisfied_dependency() {
        let mut group = SenderGroup::new();
        group.ensure(1, false, ReceiverConfig::default());
        group.ensure(2, false, ReceiverConfig::default());
        group.get_mut(1).unwrap().update_start(0);
        group.get_mut(2).unwrap().update_start(0);

        let blocked = Packet {
            sender_id: 2,
            packet_id: Some(0),
            deps: DepVec::from_iter([Dependency {
                sender_id: 1,
                packet_id: 5,
            }]),
            body: Body::NoData,
        };
        group.get_mut(2).unwrap().push(blocked);
        group.get_mut(1).unwrap().push(no_data(1, 0));

        let released = group.pop_all();
        // Sender 1's packet releases; sender 2 stays blocked on dep (1, 5).
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].sender_id, 1);
    }

    #[test]
    fn live_sender_ids_excludes_failed() {
        let mut group = SenderGroup::new();
        group.ensure(1, false, ReceiverConfig::default());
        group.ensure(2, false, ReceiverConfig::default());
        group.get_mut(2).unwrap().set_failed();
        let live = group.live_sender_ids();
        assert_eq!(live, vec![1]);
    }
}
