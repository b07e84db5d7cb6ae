//! Shallow-boundary bookkeeping.
//!
//! A shallow root is a commit whose parents are intentionally absent
//! from the local store. The tracker holds the current boundary set,
//! stages `shallow`/`unshallow` lines received during a fetch, and
//! commits the updated `shallow` file atomically — or not at all, when
//! the fetch fails.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use git_hash::ObjectId;
use git_utils::Lockfile;

use crate::store::ObjectStore;
use crate::ProtocolError;

/// The shallow file name inside a repository's git directory.
pub const SHALLOW_FILE: &str = "shallow";

/// One boundary change received from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShallowUpdate {
    /// The commit becomes a shallow root.
    Shallow(ObjectId),
    /// The commit stops being a shallow root; its history arrived.
    Unshallow(ObjectId),
}

/// The repository's shallow state plus staged changes.
#[derive(Debug, Clone, Default)]
pub struct ShallowTracker {
    path: Option<PathBuf>,
    roots: BTreeSet<ObjectId>,
    changed: bool,
}

impl ShallowTracker {
    /// An empty tracker with no backing file (non-shallow repository
    /// without a git directory at hand — e.g. tests).
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the shallow file from `gitdir`, one hex id per line.
    /// A missing file means the repository is not shallow.
    pub fn load(gitdir: &Path) -> Result<Self, ProtocolError> {
        let path = gitdir.join(SHALLOW_FILE);
        let mut roots = BTreeSet::new();
        match fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    roots.insert(line.parse::<ObjectId>()?);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ProtocolError::Io(e)),
        }
        Ok(Self {
            path: Some(path),
            roots,
            changed: false,
        })
    }

    /// Whether the repository currently has any shallow roots.
    pub fn is_shallow(&self) -> bool {
        !self.roots.is_empty()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.roots.contains(id)
    }

    /// The boundary ids to advertise as `shallow <id>` lines.
    pub fn roots(&self) -> impl Iterator<Item = &ObjectId> {
        self.roots.iter()
    }

    /// Whether staged changes exist since load.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Stage a received `shallow <id>` line.
    pub fn stage_shallow(&mut self, id: ObjectId) {
        if self.roots.insert(id) {
            self.changed = true;
        }
    }

    /// Stage a received `unshallow <id>` line.
    ///
    /// The commit must now be fully present: its ancestors were part of
    /// the pack that came with the unshallow notice.
    pub fn stage_unshallow(
        &mut self,
        id: ObjectId,
        store: &dyn ObjectStore,
    ) -> Result<(), ProtocolError> {
        if store.commit_info(&id)?.is_none() {
            return Err(ProtocolError::Shallow(format!(
                "remote unshallowed {} but the commit cannot be read",
                id
            )));
        }
        if self.roots.remove(&id) {
            self.changed = true;
        }
        Ok(())
    }

    /// Apply a batch of updates in arrival order.
    pub fn stage_all(
        &mut self,
        updates: &[ShallowUpdate],
        store: &dyn ObjectStore,
    ) -> Result<(), ProtocolError> {
        for update in updates {
            match *update {
                ShallowUpdate::Shallow(id) => self.stage_shallow(id),
                ShallowUpdate::Unshallow(id) => self.stage_unshallow(id, store)?,
            }
        }
        Ok(())
    }

    /// Commit staged changes: write the new set under the lock and
    /// atomically rename over the live file. An empty set removes the
    /// file. Without staged changes this is a no-op.
    ///
    /// Dropping the tracker without calling commit leaves the live file
    /// untouched.
    pub fn commit(&mut self) -> Result<(), ProtocolError> {
        if !self.changed {
            return Ok(());
        }
        let path = match self.path {
            Some(ref path) => path.clone(),
            None => {
                self.changed = false;
                return Ok(());
            }
        };

        let mut lock = Lockfile::acquire(&path)?;
        for id in &self.roots {
            writeln!(lock, "{}", id).map_err(ProtocolError::Io)?;
        }
        lock.commit_or_unlink(self.roots.is_empty())?;
        self.changed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    #[test]
    fn load_missing_file_is_not_shallow() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ShallowTracker::load(dir.path()).unwrap();
        assert!(!tracker.is_shallow());
        assert!(!tracker.is_changed());
    }

    #[test]
    fn stage_and_commit_writes_sorted_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::new();
        let a = store.add_commit(b"a", &[], 100);
        let b = store.add_commit(b"b", &[], 200);

        let mut tracker = ShallowTracker::load(dir.path()).unwrap();
        tracker.stage_shallow(b);
        tracker.stage_shallow(a);
        assert!(tracker.is_changed());
        tracker.commit().unwrap();

        let contents = fs::read_to_string(dir.path().join(SHALLOW_FILE)).unwrap();
        let mut expect = vec![a.to_hex(), b.to_hex()];
        expect.sort();
        let lines: Vec<_> = contents.lines().map(str::to_string).collect();
        assert_eq!(lines, expect);

        let reloaded = ShallowTracker::load(dir.path()).unwrap();
        assert!(reloaded.contains(&a));
        assert!(reloaded.contains(&b));
    }

    #[test]
    fn unshallow_requires_parseable_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::new();
        let known = store.add_commit(b"known", &[], 100);
        let phantom = crate::testing::oid(b"phantom");

        let mut tracker = ShallowTracker::load(dir.path()).unwrap();
        tracker.stage_shallow(known);
        tracker.stage_shallow(phantom);
        tracker.commit().unwrap();

        let mut tracker = ShallowTracker::load(dir.path()).unwrap();
        assert!(tracker.stage_unshallow(known, &store).is_ok());
        assert!(!tracker.contains(&known));
        assert!(matches!(
            tracker.stage_unshallow(phantom, &store),
            Err(ProtocolError::Shallow(_))
        ));
    }

    #[test]
    fn uncommitted_changes_leave_live_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::new();
        let a = store.add_commit(b"a", &[], 100);
        let b = store.add_commit(b"b", &[], 200);

        let mut tracker = ShallowTracker::load(dir.path()).unwrap();
        tracker.stage_shallow(a);
        tracker.commit().unwrap();
        let before = fs::read_to_string(dir.path().join(SHALLOW_FILE)).unwrap();

        // A fetch that fails after staging: tracker dropped, no commit
        {
            let mut tracker = ShallowTracker::load(dir.path()).unwrap();
            tracker.stage_shallow(b);
        }
        let after = fs::read_to_string(dir.path().join(SHALLOW_FILE)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn emptied_set_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::new();
        let a = store.add_commit(b"a", &[], 100);

        let mut tracker = ShallowTracker::load(dir.path()).unwrap();
        tracker.stage_shallow(a);
        tracker.commit().unwrap();
        assert!(dir.path().join(SHALLOW_FILE).exists());

        let mut tracker = ShallowTracker::load(dir.path()).unwrap();
        tracker.stage_unshallow(a, &store).unwrap();
        tracker.commit().unwrap();
        assert!(!dir.path().join(SHALLOW_FILE).exists());
    }

    #[test]
    fn stage_all_applies_in_order() {
        let mut store = MemoryStore::new();
        let a = store.add_commit(b"a", &[], 100);
        let b = store.add_commit(b"b", &[], 200);

        let mut tracker = ShallowTracker::in_memory();
        tracker
            .stage_all(
                &[
                    ShallowUpdate::Shallow(a),
                    ShallowUpdate::Shallow(b),
                    ShallowUpdate::Unshallow(a),
                ],
                &store,
            )
            .unwrap();
        assert!(!tracker.contains(&a));
        assert!(tracker.contains(&b));
    }
}
