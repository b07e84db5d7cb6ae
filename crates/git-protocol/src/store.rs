//! Interfaces to the external collaborators: the object store, the ref
//! store, and the signing machinery.
//!
//! The transfer core never parses objects or touches ref files itself;
//! everything goes through these traits. Ancestry questions
//! (fast-forward checks, completeness marking) are answered here on top
//! of [`ObjectStore::commit_info`].

use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::path::PathBuf;

use bstr::{BStr, BString};
use git_hash::ObjectId;

/// Errors from the object/ref store collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    Missing(ObjectId),

    #[error("corrupt object {0}: {1}")]
    Corrupt(ObjectId, String),

    #[error("pack ingestion failed: {0}")]
    Pack(String),

    #[error("ref update failed: {0}")]
    Ref(String),

    #[error("signing failed: {0}")]
    Sign(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Commit metadata needed by the negotiator and the drivers.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub parents: Vec<ObjectId>,
    /// Committer timestamp, seconds since epoch.
    pub timestamp: i64,
}

/// How a received pack should be ingested.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Keep the pack on disk and create a `.keep` lockfile.
    pub keep: bool,
    /// Allow thin packs (bases resolved from the local store).
    pub thin: bool,
    /// Run consistency checks on every ingested object.
    pub fsck: bool,
}

/// Result of driving a pack stream into the store.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    /// Path of the `.keep` lockfile, when one was created.
    pub lockfile: Option<PathBuf>,
    /// The receiver proved the pack is self-contained and connected;
    /// the connectivity check may be skipped.
    pub self_contained_and_connected: bool,
    /// Number of objects ingested.
    pub objects: usize,
}

/// The object database, as seen by the transfer machinery.
pub trait ObjectStore {
    /// Whether the object exists locally (loose, packed, or alternate).
    fn contains(&self, id: &ObjectId) -> bool;

    /// Commit metadata, or `None` when the object exists but is not a
    /// commit (tags/trees/blobs), or does not exist.
    fn commit_info(&self, id: &ObjectId) -> Result<Option<CommitInfo>, StoreError>;

    /// Outgoing DAG edges of any object (commit → parents + tree,
    /// tree → entries, tag → target).
    fn referenced(&self, id: &ObjectId) -> Result<Vec<ObjectId>, StoreError>;

    /// Drive a pack stream into the store.
    fn ingest_pack(
        &mut self,
        pack: &mut dyn Read,
        options: &IngestOptions,
    ) -> Result<IngestOutcome, StoreError>;

    /// Store one loose object delivered outside a pack (dumb walker).
    /// Returns the id of the ingested object.
    fn ingest_loose(&mut self, bytes: &[u8]) -> Result<ObjectId, StoreError>;

    /// Build a pack of everything reachable from `include` but not from
    /// `exclude`. With `thin`, deltas may reference `exclude` bases.
    fn build_pack(
        &self,
        include: &[ObjectId],
        exclude: &[ObjectId],
        thin: bool,
    ) -> Result<Vec<u8>, StoreError>;
}

/// The local ref store.
pub trait RefStore {
    /// Snapshot of all refs as (name, id).
    fn iter_refs(&self) -> Vec<(BString, ObjectId)>;

    /// Resolve one ref name.
    fn resolve(&self, name: &BStr) -> Option<ObjectId>;

    /// Create or update a ref.
    fn update(&mut self, name: &BStr, id: ObjectId) -> Result<(), StoreError>;

    /// Delete a ref.
    fn delete(&mut self, name: &BStr) -> Result<(), StoreError>;

    /// Set a symbolic ref (e.g. `HEAD` after a clone).
    fn set_symbolic(&mut self, name: &BStr, target: &BStr) -> Result<(), StoreError>;
}

/// Detached signing interface for signed pushes.
pub trait Signer {
    /// Produce an armored signature block over `payload`.
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// Whether moving `old` → `new` is a fast-forward: `old` must be an
/// ancestor of `new`. A null `old` (creation) always fast-forwards.
pub fn fast_forward(
    store: &dyn ObjectStore,
    old: &ObjectId,
    new: &ObjectId,
) -> Result<bool, StoreError> {
    if old.is_null() || old == new {
        return Ok(true);
    }
    is_ancestor(store, old, new)
}

/// Breadth-first ancestry walk from `tip` looking for `target`.
pub fn is_ancestor(
    store: &dyn ObjectStore,
    target: &ObjectId,
    tip: &ObjectId,
) -> Result<bool, StoreError> {
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut queue: VecDeque<ObjectId> = VecDeque::new();
    queue.push_back(*tip);

    while let Some(id) = queue.pop_front() {
        if id == *target {
            return Ok(true);
        }
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
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    #[test]
    fn fast_forward_linear_history() {
        let mut store = MemoryStore::new();
        let a = store.add_commit(b"a", &[], 100);
        let b = store.add_commit(b"b", &[a], 200);
        let c = store.add_commit(b"c", &[b], 300);

        assert!(fast_forward(&store, &a, &c).unwrap());
        assert!(fast_forward(&store, &c, &c).unwrap());
        assert!(!fast_forward(&store, &c, &a).unwrap());
    }

    #[test]
    fn creation_is_fast_forward() {
        let mut store = MemoryStore::new();
        let a = store.add_commit(b"a", &[], 100);
        let null = a.algorithm().null_oid();
        assert!(fast_forward(&store, &null, &a).unwrap());
    }

    #[test]
    fn diverged_history_is_not_fast_forward() {
        let mut store = MemoryStore::new();
        let base = store.add_commit(b"base", &[], 100);
        let left = store.add_commit(b"left", &[base], 200);
        let right = store.add_commit(b"right", &[base], 200);

        assert!(!fast_forward(&store, &left, &right).unwrap());
        assert!(fast_forward(&store, &base, &left).unwrap());
    }

    #[test]
    fn fast_forward_monotonic_over_descendants() {
        // If old..new fast-forwards and new is an ancestor of newer,
        // then old..newer fast-forwards too.
        let mut store = MemoryStore::new();
        let old = store.add_commit(b"old", &[], 100);
        let new = store.add_commit(b"new", &[old], 200);
        let newer = store.add_commit(b"newer", &[new], 300);

        assert!(fast_forward(&store, &old, &new).unwrap());
        assert!(is_ancestor(&store, &new, &newer).unwrap());
        assert!(fast_forward(&store, &old, &newer).unwrap());
    }

    #[test]
    fn merge_commits_reach_both_parents() {
        let mut store = MemoryStore::new();
        let base = store.add_commit(b"base", &[], 100);
        let left = store.add_commit(b"left", &[base], 200);
        let right = store.add_commit(b"right", &[base], 210);
        let merge = store.add_commit(b"merge", &[left, right], 300);

        assert!(fast_forward(&store, &left, &merge).unwrap());
        assert!(fast_forward(&store, &right, &merge).unwrap());
    }
}
