//! Fetch negotiation: choosing which commits to advertise as "have".
//!
//! The negotiator walks local history newest-first, yielding candidate
//! haves one at a time while the caller interleaves ACK feedback from
//! the remote. Commits the remote confirms as common are skipped along
//! with their ancestors, but stay in the queue so the date-ordered
//! traversal remains correct.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use git_hash::ObjectId;

use crate::store::ObjectStore;

/// First flush after this many haves.
pub const INITIAL_FLUSH: usize = 16;
/// Stateful round increment once the window is wide.
pub const PIPESAFE_FLUSH: usize = 32;
/// Stateless rounds stop doubling here.
pub const LARGE_FLUSH: usize = 16384;
/// Give up after this many consecutive unacknowledged haves.
pub const MAX_IN_VAIN: usize = 256;

const SEEN: u8 = 1 << 0;
const COMMON: u8 = 1 << 1;
const POPPED: u8 = 1 << 2;
const ADVERTISED: u8 = 1 << 3;

/// How many haves to send before the next flush.
pub fn next_flush(stateless: bool, count: usize) -> usize {
    if stateless {
        if count < LARGE_FLUSH {
            count * 2
        } else {
            count * 11 / 10
        }
    } else if count < PIPESAFE_FLUSH {
        count * 2
    } else {
        count + PIPESAFE_FLUSH
    }
}

/// A stateful generator of `have` candidates.
pub trait Negotiator {
    /// Seed the walk with a local tip.
    fn add_tip(&mut self, store: &dyn ObjectStore, id: ObjectId);

    /// The next commit to advertise, newest first; `None` when local
    /// history is exhausted.
    fn next(&mut self, store: &dyn ObjectStore) -> Option<ObjectId>;

    /// Ingest an ACK: the remote has `id`. Returns whether the commit
    /// was already known to be common.
    fn ack(&mut self, store: &dyn ObjectStore, id: ObjectId) -> bool;

    /// Whether anything non-common remains to advertise.
    fn exhausted(&self) -> bool;
}

struct QueueEntry {
    id: ObjectId,
    timestamp: i64,
    /// Tiebreaker for equal timestamps: later insertion pops later.
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The standard date-ordered negotiator.
#[derive(Default)]
pub struct DefaultNegotiator {
    queue: BinaryHeap<QueueEntry>,
    flags: HashMap<ObjectId, u8>,
    non_common: usize,
    seq: u64,
}

impl DefaultNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    fn flags(&self, id: &ObjectId) -> u8 {
        self.flags.get(id).copied().unwrap_or(0)
    }

    fn set(&mut self, id: ObjectId, mark: u8) {
        *self.flags.entry(id).or_insert(0) |= mark;
    }

    fn enqueue(&mut self, store: &dyn ObjectStore, id: ObjectId, mark: u8) {
        if self.flags(&id) & SEEN != 0 {
            return;
        }
        let info = match store.commit_info(&id) {
            Ok(Some(info)) => info,
            _ => return,
        };
        self.set(id, mark | SEEN);
        if mark & COMMON == 0 {
            self.non_common += 1;
        }
        self.seq += 1;
        self.queue.push(QueueEntry {
            id,
            timestamp: info.timestamp,
            seq: self.seq,
        });
    }

    /// Mark `id` and all its ancestors common.
    fn mark_common_recursive(&mut self, store: &dyn ObjectStore, id: ObjectId) {
        let mut work: VecDeque<ObjectId> = VecDeque::new();
        work.push_back(id);
        while let Some(id) = work.pop_front() {
            let flags = self.flags(&id);
            if flags & COMMON != 0 {
                continue;
            }
            self.set(id, COMMON);
            if flags & SEEN != 0 && flags & POPPED == 0 {
                self.non_common = self.non_common.saturating_sub(1);
            }
            if let Ok(Some(info)) = store.commit_info(&id) {
                for parent in info.parents {
                    work.push_back(parent);
                }
            }
        }
    }
}

impl Negotiator for DefaultNegotiator {
    fn add_tip(&mut self, store: &dyn ObjectStore, id: ObjectId) {
        self.enqueue(store, id, 0);
    }

    fn next(&mut self, store: &dyn ObjectStore) -> Option<ObjectId> {
        loop {
            if self.non_common == 0 {
                return None;
            }
            let entry = self.queue.pop()?;
            let id = entry.id;
            let flags = self.flags(&id);
            self.set(id, POPPED);
            if flags & COMMON == 0 {
                self.non_common = self.non_common.saturating_sub(1);
            }

            // Parents ride along: a common commit's parents are common
            // too and need no separate advertisement.
            let parent_mark = if flags & COMMON != 0 { COMMON } else { 0 };
            if let Ok(Some(info)) = store.commit_info(&id) {
                for parent in info.parents {
                    self.enqueue(store, parent, parent_mark);
                    if parent_mark & COMMON != 0 {
                        self.mark_common_recursive(store, parent);
                    }
                }
            }

            if flags & COMMON != 0 {
                // Already known common: nothing to say about it
                continue;
            }
            self.set(id, ADVERTISED);
            return Some(id);
        }
    }

    fn ack(&mut self, store: &dyn ObjectStore, id: ObjectId) -> bool {
        let was_common = self.flags(&id) & COMMON != 0;
        self.mark_common_recursive(store, id);
        was_common
    }

    fn exhausted(&self) -> bool {
        self.non_common == 0 || self.queue.is_empty()
    }
}

/// The refetch negotiator: advertises nothing, so the remote re-sends
/// every reachable object.
#[derive(Default)]
pub struct NoopNegotiator;

impl NoopNegotiator {
    pub fn new() -> Self {
        Self
    }
}

impl Negotiator for NoopNegotiator {
    fn add_tip(&mut self, _store: &dyn ObjectStore, _id: ObjectId) {}

    fn next(&mut self, _store: &dyn ObjectStore) -> Option<ObjectId> {
        None
    }

    fn ack(&mut self, _store: &dyn ObjectStore, _id: ObjectId) -> bool {
        false
    }

    fn exhausted(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    fn chain(store: &mut MemoryStore, n: usize) -> Vec<ObjectId> {
        let mut ids = Vec::new();
        let mut parents: Vec<ObjectId> = Vec::new();
        for i in 0..n {
            let label = format!("c{}", i);
            let id = store.add_commit(label.as_bytes(), &parents, 100 + i as i64);
            parents = vec![id];
            ids.push(id);
        }
        ids
    }

    #[test]
    fn yields_newest_first() {
        let mut store = MemoryStore::new();
        let ids = chain(&mut store, 4);

        let mut neg = DefaultNegotiator::new();
        neg.add_tip(&store, *ids.last().unwrap());

        let order: Vec<ObjectId> = std::iter::from_fn(|| neg.next(&store)).collect();
        let mut expect = ids.clone();
        expect.reverse();
        assert_eq!(order, expect);
        assert!(neg.exhausted());
    }

    #[test]
    fn yields_at_most_each_commit_once() {
        // Termination: N nodes produce at most N haves, even with
        // overlapping tips.
        let mut store = MemoryStore::new();
        let base = store.add_commit(b"base", &[], 100);
        let left = store.add_commit(b"left", &[base], 200);
        let right = store.add_commit(b"right", &[base], 210);

        let mut neg = DefaultNegotiator::new();
        neg.add_tip(&store, left);
        neg.add_tip(&store, right);

        let yielded: Vec<ObjectId> = std::iter::from_fn(|| neg.next(&store)).collect();
        assert_eq!(yielded.len(), 3);
        let unique: std::collections::HashSet<_> = yielded.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn ack_skips_ancestors() {
        let mut store = MemoryStore::new();
        let ids = chain(&mut store, 5);

        let mut neg = DefaultNegotiator::new();
        neg.add_tip(&store, ids[4]);

        assert_eq!(neg.next(&store), Some(ids[4]));
        // Remote has c3, so c3..c0 are all common
        assert!(!neg.ack(&store, ids[3]));
        assert_eq!(neg.next(&store), None);
        assert!(neg.exhausted());
    }

    #[test]
    fn ack_reports_known_common() {
        let mut store = MemoryStore::new();
        let ids = chain(&mut store, 3);

        let mut neg = DefaultNegotiator::new();
        neg.add_tip(&store, ids[2]);
        assert!(!neg.ack(&store, ids[1]));
        // c0 is an ancestor of c1, so it is already common
        assert!(neg.ack(&store, ids[0]));
    }

    #[test]
    fn diverged_branch_still_advertised_after_ack() {
        let mut store = MemoryStore::new();
        let base = store.add_commit(b"base", &[], 100);
        let main = store.add_commit(b"main", &[base], 300);
        let topic = store.add_commit(b"topic", &[base], 200);

        let mut neg = DefaultNegotiator::new();
        neg.add_tip(&store, main);
        neg.add_tip(&store, topic);

        assert_eq!(neg.next(&store), Some(main));
        neg.ack(&store, main);
        // topic is not an ancestor of main: still needs advertising
        assert_eq!(neg.next(&store), Some(topic));
        assert_eq!(neg.next(&store), None);
    }

    #[test]
    fn missing_tip_objects_are_ignored() {
        let store = MemoryStore::new();
        let mut neg = DefaultNegotiator::new();
        neg.add_tip(&store, crate::testing::oid(b"nonexistent"));
        assert_eq!(neg.next(&store), None);
    }

    #[test]
    fn noop_negotiator_yields_nothing() {
        let mut store = MemoryStore::new();
        let tip = store.add_commit(b"tip", &[], 100);
        let mut neg = NoopNegotiator::new();
        neg.add_tip(&store, tip);
        assert_eq!(neg.next(&store), None);
        assert!(neg.exhausted());
        assert!(!neg.ack(&store, tip));
    }

    #[test]
    fn flush_schedule() {
        // Stateful: double to 32, then linear
        assert_eq!(next_flush(false, 16), 32);
        assert_eq!(next_flush(false, 32), 64);
        assert_eq!(next_flush(false, 64), 96);

        // Stateless: double to 16384, then +10%
        assert_eq!(next_flush(true, 16), 32);
        assert_eq!(next_flush(true, 8192), 16384);
        assert_eq!(next_flush(true, 16384), 18022);
    }

    #[test]
    fn large_history_terminates() {
        let mut store = MemoryStore::new();
        let ids = chain(&mut store, 300);
        let mut neg = DefaultNegotiator::new();
        neg.add_tip(&store, *ids.last().unwrap());

        let mut count = 0;
        while neg.next(&store).is_some() {
            count += 1;
            assert!(count <= 300);
        }
        assert_eq!(count, 300);
    }
}
