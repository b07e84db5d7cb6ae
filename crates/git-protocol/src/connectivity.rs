//! Post-fetch connectivity verification.
//!
//! After a pack lands, every new ref tip must be traversable down to
//! objects the repository already had. The walk descends from the tips
//! and stops at anything reachable from the pre-existing local refs;
//! a missing object on the way is a broken fetch.

use std::collections::{HashSet, VecDeque};

use git_hash::ObjectId;

use crate::store::{ObjectStore, StoreError};
use crate::ProtocolError;

/// Verify that `tips` are fully connected, treating everything
/// reachable from `local_refs` as known-good.
pub fn verify_connected(
    store: &dyn ObjectStore,
    tips: &[ObjectId],
    local_refs: &[ObjectId],
) -> Result<(), ProtocolError> {
    let known = commit_closure(store, local_refs)?;

    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut queue: VecDeque<ObjectId> = tips.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        if id.is_null() || known.contains(&id) || !seen.insert(id) {
            continue;
        }
        let links = match store.referenced(&id) {
            Ok(links) => links,
            Err(StoreError::Missing(id)) => {
                return Err(ProtocolError::Pack(format!(
                    "broken fetch: object {} is not connected",
                    id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        for link in links {
            if !seen.contains(&link) && !known.contains(&link) {
                queue.push_back(link);
            }
        }
    }
    Ok(())
}

/// Whether every id in `wants` is already present and connected: the
/// quickfetch test that lets a fetch skip the network round entirely.
pub fn already_connected(
    store: &dyn ObjectStore,
    wants: &[ObjectId],
    local_refs: &[ObjectId],
) -> bool {
    if wants.iter().any(|id| !store.contains(id)) {
        return false;
    }
    verify_connected(store, wants, local_refs).is_ok()
}

/// The commit-graph closure of `tips` (commits only; trees and blobs
/// under a known commit are taken as present).
fn commit_closure(
    store: &dyn ObjectStore,
    tips: &[ObjectId],
) -> Result<HashSet<ObjectId>, ProtocolError> {
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut queue: VecDeque<ObjectId> = tips.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(info) = store.commit_info(&id)? {
            for parent in info.parents {
                if !seen.contains(&parent) {
                    queue.push_back(parent);
                }
            }
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    #[test]
    fn connected_history_passes() {
        let mut store = MemoryStore::new();
        let blob = store.add_blob(b"blob");
        let tree = store.add_tree(b"tree", &[blob]);
        let base = store.add_commit(b"base", &[], 100);
        let tip = store.add_commit(b"tip", &[base], 200);
        let _ = tree;

        assert!(verify_connected(&store, &[tip], &[]).is_ok());
    }

    #[test]
    fn missing_parent_fails() {
        let mut store = MemoryStore::new();
        let phantom = crate::testing::oid(b"phantom");
        let tip = store.add_commit(b"tip", &[phantom], 200);

        assert!(matches!(
            verify_connected(&store, &[tip], &[]),
            Err(ProtocolError::Pack(_))
        ));
    }

    #[test]
    fn walk_stops_at_local_refs() {
        let mut store = MemoryStore::new();
        // `base` has a hole beneath it, but base is reachable from a
        // local ref, so the new tip need not descend past it.
        let hole = crate::testing::oid(b"hole");
        let base = store.add_commit(b"base", &[hole], 100);
        let tip = store.add_commit(b"tip", &[base], 200);

        assert!(verify_connected(&store, &[tip], &[base]).is_ok());
        assert!(verify_connected(&store, &[tip], &[]).is_err());
    }

    #[test]
    fn quickfetch_check() {
        let mut store = MemoryStore::new();
        let base = store.add_commit(b"base", &[], 100);
        let tip = store.add_commit(b"tip", &[base], 200);
        let absent = crate::testing::oid(b"absent");

        assert!(already_connected(&store, &[tip], &[tip]));
        assert!(already_connected(&store, &[tip], &[]));
        assert!(!already_connected(&store, &[absent], &[tip]));
    }

    #[test]
    fn null_tips_are_ignored() {
        let store = MemoryStore::new();
        let null = git_hash::HashAlgorithm::Sha1.null_oid();
        assert!(verify_connected(&store, &[null], &[]).is_ok());
    }
}
