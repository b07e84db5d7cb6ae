//! Ref records and the advertised-ref list.
//!
//! Refs live in an arena ([`RefList`]); cross-links between a local ref
//! and its counterpart on the other side (`peer`) are arena indices, and
//! a separate order vector preserves advertisement order through
//! filtering and duplicate removal.

use bstr::{BStr, BString, ByteSlice};
use git_hash::ObjectId;

/// Per-ref outcome of a fetch or push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefStatus {
    /// Not yet decided (or skipped by an atomic abort).
    #[default]
    None,
    /// Updated successfully.
    Ok,
    /// Already at the target value.
    UpToDate,
    /// Update is not a fast-forward and no force was given.
    RejectNonFastForward,
    /// Creation refused because the name already exists.
    RejectAlreadyExists,
    /// The remote's current value is unknown locally.
    RejectFetchFirst,
    /// A non-commit update (e.g. tag) that requires force.
    RejectNeedsForce,
    /// A lease (`--force-with-lease`) did not match.
    RejectStale,
    /// The update would require a new shallow root.
    RejectShallow,
    /// The remote does not allow deletions.
    RejectNoDelete,
    /// The remote moved while we were deciding (`force-if-includes`).
    RejectRemoteUpdated,
    /// The remote refused the update (hook/policy).
    RemoteReject,
    /// Command sent; a report-status answer is still owed.
    ExpectingReport,
}

impl RefStatus {
    /// Statuses that make the whole operation fail.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RefStatus::RejectNonFastForward
                | RefStatus::RejectAlreadyExists
                | RefStatus::RejectFetchFirst
                | RefStatus::RejectNeedsForce
                | RefStatus::RejectStale
                | RefStatus::RejectShallow
                | RefStatus::RejectNoDelete
                | RefStatus::RejectRemoteUpdated
                | RefStatus::RemoteReject
        )
    }
}

/// How a fetched ref participates in `FETCH_HEAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchHeadStatus {
    /// Listed for merge.
    Merge,
    /// Listed, marked not-for-merge.
    #[default]
    NotForMerge,
    /// Not listed at all.
    Ignore,
}

/// One ref, on either side of the connection.
#[derive(Debug, Clone)]
pub struct Ref {
    /// Full name (`refs/...`, or `HEAD`).
    pub name: BString,
    /// The value this side currently has (zero = does not exist).
    pub old_id: ObjectId,
    /// The value to move to (push) or the received value (fetch).
    pub new_id: ObjectId,
    /// Peeled target of an annotated tag, folded from `name^{}` entries.
    pub peeled: Option<ObjectId>,
    /// Arena index of the counterpart ref on the other side.
    pub peer: Option<usize>,
    /// Symbolic-ref target, when advertised.
    pub symref_target: Option<BString>,
    /// Force requested for this ref.
    pub force: bool,
    /// Lease value for compare-and-swap pushes.
    pub expect_old_id: Option<ObjectId>,
    pub status: RefStatus,
    /// Free-form message from the remote (`ng <ref> <msg>`).
    pub remote_status: Option<String>,
    pub fetch_head_status: FetchHeadStatus,
    /// Whether the user named this ref explicitly (wins deduplication).
    pub explicit: bool,
}

impl Ref {
    pub fn new(name: impl Into<BString>, old_id: ObjectId) -> Self {
        Self {
            name: name.into(),
            old_id,
            new_id: old_id.algorithm().null_oid(),
            peeled: None,
            peer: None,
            symref_target: None,
            force: false,
            expect_old_id: None,
            status: RefStatus::None,
            remote_status: None,
            fetch_head_status: FetchHeadStatus::default(),
            explicit: false,
        }
    }

    /// A push that removes the remote ref.
    pub fn is_deletion(&self) -> bool {
        self.new_id.is_null()
    }

    /// The id negotiation should use: the peeled target for annotated
    /// tag entries, the plain value otherwise.
    pub fn effective_old_id(&self) -> ObjectId {
        self.peeled.unwrap_or(self.old_id)
    }
}

/// Arena of refs plus an iteration order.
#[derive(Debug, Clone, Default)]
pub struct RefList {
    arena: Vec<Ref>,
    order: Vec<usize>,
}

impl RefList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a ref; returns its arena index.
    pub fn push(&mut self, r: Ref) -> usize {
        let idx = self.arena.len();
        self.arena.push(r);
        self.order.push(idx);
        idx
    }

    pub fn get(&self, idx: usize) -> &Ref {
        &self.arena[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Ref {
        &mut self.arena[idx]
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate refs in order, with their arena indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Ref)> {
        self.order.iter().map(move |&i| (i, &self.arena[i]))
    }

    /// Arena indices in iteration order.
    pub fn indices(&self) -> Vec<usize> {
        self.order.clone()
    }

    /// Find a ref by exact name.
    pub fn find(&self, name: &BStr) -> Option<usize> {
        self.order
            .iter()
            .copied()
            .find(|&i| self.arena[i].name.as_bstr() == name)
    }

    /// Drop refs from the iteration order (arena entries survive so peer
    /// indices stay valid).
    pub fn retain(&mut self, mut keep: impl FnMut(&Ref) -> bool) {
        let arena = &self.arena;
        self.order.retain(|&i| keep(&arena[i]));
    }

    /// Fold a peeled `name^{}` entry into the preceding entry.
    ///
    /// Returns false if there is no matching predecessor (the entry is
    /// then dropped, since peeled lines are never stored on their own).
    pub fn push_peeled(&mut self, name: &BStr, peeled: ObjectId) -> bool {
        let base = match name.strip_suffix(b"^{}") {
            Some(base) => base,
            None => return false,
        };
        if let Some(&last) = self.order.last() {
            if self.arena[last].name.as_bstr() == base.as_bstr() {
                self.arena[last].peeled = Some(peeled);
                return true;
            }
        }
        false
    }

    /// Remove entries whose peer (destination) names collide.
    ///
    /// Merge entries win over not-for-merge ones; explicitly named
    /// entries win over auto-added ones; otherwise the first stays.
    /// `dst_of` maps a ref to its destination name, or `None` to exempt
    /// it from deduplication (fetch-only refs).
    pub fn dedup_by_dst(&mut self, dst_of: impl Fn(&Ref) -> Option<BString>) {
        use std::collections::HashMap;

        let mut chosen: HashMap<BString, usize> = HashMap::new();
        let mut kept: Vec<usize> = Vec::with_capacity(self.order.len());

        for &i in &self.order {
            let dst = match dst_of(&self.arena[i]) {
                Some(dst) => dst,
                None => {
                    kept.push(i);
                    continue;
                }
            };
            match chosen.get(&dst) {
                None => {
                    chosen.insert(dst, i);
                    kept.push(i);
                }
                Some(&winner) => {
                    if ranks_higher(&self.arena[i], &self.arena[winner]) {
                        let pos = kept
                            .iter()
                            .position(|&k| k == winner)
                            .expect("winner is kept");
                        kept[pos] = i;
                        chosen.insert(dst, i);
                    }
                }
            }
        }

        self.order = kept;
    }
}

fn ranks_higher(candidate: &Ref, incumbent: &Ref) -> bool {
    let merge = |r: &Ref| r.fetch_head_status == FetchHeadStatus::Merge;
    if merge(candidate) != merge(incumbent) {
        return merge(candidate);
    }
    if candidate.explicit != incumbent.explicit {
        return candidate.explicit;
    }
    false
}

/// Resolve which branch an advertised `HEAD` points at.
///
/// Prefers an explicit symref target when the server sent one. Otherwise
/// every ref with HEAD's id is a candidate: the configured default
/// branch wins, then `refs/heads/master`, then the lexically first
/// candidate under `refs/heads/`.
pub fn guess_head_branch(list: &RefList, default_branch: Option<&BStr>) -> Option<BString> {
    let (_, head) = list.iter().find(|(_, r)| r.name.as_bstr() == "HEAD")?;

    if let Some(ref target) = head.symref_target {
        return Some(target.clone());
    }

    let mut candidates: Vec<&BStr> = list
        .iter()
        .filter(|(_, r)| r.old_id == head.old_id && r.name.starts_with(b"refs/heads/"))
        .map(|(_, r)| r.name.as_bstr())
        .collect();
    candidates.sort();

    if let Some(default) = default_branch {
        if candidates.iter().any(|&c| c == default) {
            return Some(default.into());
        }
    }
    if let Some(&master) = candidates.iter().find(|&&c| c == "refs/heads/master") {
        return Some(master.into());
    }
    candidates.first().map(|&c| c.into())
}
