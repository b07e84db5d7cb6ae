//! The fetch driver.
//!
//! Orchestrates a complete fetch: select refs against the remote's
//! advertisement, follow tags, plan pruning, skip the network when
//! everything wanted is already here, negotiate and receive the pack,
//! verify connectivity, apply shallow policy, update tracking refs, and
//! write `FETCH_HEAD`.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use bstr::{BStr, BString, ByteSlice};
use git_hash::ObjectId;
use git_utils::Lockfile;

use crate::connectivity;
use crate::refs::{FetchHeadStatus, Ref, RefList, RefStatus};
use crate::refspec::{self, RefSpec};
use crate::shallow::{ShallowTracker, ShallowUpdate};
use crate::store::{fast_forward, ObjectStore, RefStore};
use crate::transport::{FetchParams, Transport};
use crate::v2::LsRefsOptions;
use crate::ProtocolError;

/// Tag-following behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMode {
    /// Follow annotated tags whose target we are fetching anyway.
    #[default]
    Auto,
    /// Fetch every tag (`--tags`).
    All,
    /// Fetch no tags beyond explicit refspecs (`--no-tags`).
    None,
}

/// Options for one fetch operation.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Configured or command-line refspecs. Empty means "fetch HEAD".
    pub refspecs: Vec<RefSpec>,
    pub tags: TagMode,
    /// Delete tracking refs that no longer exist on the remote.
    pub prune: bool,
    /// Force every ref update (`--force`).
    pub force: bool,
    pub depth: Option<u32>,
    pub deepen_since: Option<i64>,
    pub deepen_not: Vec<BString>,
    pub deepen_relative: bool,
    /// Accept new shallow roots the remote imposes on us.
    pub update_shallow: bool,
    /// Partial-clone filter, passed through to the server.
    pub filter: Option<String>,
    /// Ask the remote to re-send everything (negotiate nothing).
    pub refetch: bool,
    pub keep_pack: bool,
    pub fsck: bool,
    pub dry_run: bool,
    /// All-or-nothing ref updates.
    pub atomic: bool,
    pub no_progress: bool,
    /// Tips to negotiate from instead of all local refs.
    pub negotiation_tips: Vec<ObjectId>,
    pub write_fetch_head: bool,
    /// The remote's URL, recorded in FETCH_HEAD lines.
    pub remote_url: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            refspecs: Vec::new(),
            tags: TagMode::Auto,
            prune: false,
            force: false,
            depth: None,
            deepen_since: None,
            deepen_not: Vec::new(),
            deepen_relative: false,
            update_shallow: false,
            filter: None,
            refetch: false,
            keep_pack: false,
            fsck: false,
            dry_run: false,
            atomic: false,
            no_progress: false,
            negotiation_tips: Vec::new(),
            write_fetch_head: true,
            remote_url: String::new(),
        }
    }
}

/// What a fetch did.
#[derive(Debug, Default)]
pub struct FetchSummary {
    /// The selected refs with statuses; each entry's `peer` names the
    /// remote-side ref it came from.
    pub refs: RefList,
    /// Tracking refs deleted by `--prune`.
    pub pruned: Vec<BString>,
    /// The shallow file was rewritten.
    pub shallow_changed: bool,
    /// The network round was skipped entirely.
    pub quickfetch: bool,
    /// Objects received.
    pub objects: usize,
}

impl FetchSummary {
    /// Whether any selected ref carries a hard failure.
    pub fn is_ok(&self) -> bool {
        self.refs.iter().all(|(_, r)| !r.status.is_rejection())
    }
}

/// Run a fetch against an open transport.
pub fn fetch(
    transport: &mut dyn Transport,
    store: &mut dyn ObjectStore,
    refstore: &mut dyn RefStore,
    gitdir: Option<&Path>,
    options: &FetchOptions,
    progress: &mut dyn Write,
) -> Result<FetchSummary, ProtocolError> {
    // 1. Advertisement, with server-side prefix filtering where
    //    supported
    let ls = LsRefsOptions {
        ref_prefixes: ref_prefixes(options),
        symrefs: true,
        peel: true,
    };
    let remote_refs = transport.get_refs(false, &ls)?;

    // 2-5. Ref selection, tag following, dedup, prune plan
    let mut selected = select_refs(&remote_refs, refstore, store, options)?;
    let pruned_plan = plan_prune(&selected, refstore, options);

    let mut shallow = match gitdir {
        Some(gitdir) => ShallowTracker::load(gitdir)?,
        None => ShallowTracker::in_memory(),
    };

    let deepening = options.depth.is_some()
        || options.deepen_since.is_some()
        || !options.deepen_not.is_empty();

    // Wants: advertisement indices of refs whose value is missing.
    // Deepening and refetch ask for everything, present or not.
    let mut want_idx: Vec<usize> = Vec::new();
    let mut all_wants: Vec<ObjectId> = Vec::new();
    for (_, r) in selected.iter() {
        if r.new_id.is_null() {
            continue;
        }
        if !all_wants.contains(&r.new_id) {
            all_wants.push(r.new_id);
        }
        if store.contains(&r.new_id) && !deepening && !options.refetch {
            continue;
        }
        if let Some(adv) = remote_refs
            .iter()
            .find(|(_, a)| a.old_id == r.new_id)
            .map(|(i, _)| i)
        {
            if !want_idx.contains(&adv) {
                want_idx.push(adv);
            }
        }
    }

    let local_tips: Vec<ObjectId> = refstore.iter_refs().iter().map(|(_, id)| *id).collect();

    let mut summary = FetchSummary::default();
    let mut shallow_updates: Vec<ShallowUpdate> = Vec::new();
    let mut pre_verified = false;

    // 5. Quickfetch: everything wanted is already here and connected,
    //    and the shallow boundary is not moving
    let quickfetch = !deepening
        && !options.refetch
        && want_idx.is_empty()
        && connectivity::already_connected(store, &all_wants, &local_tips);

    if quickfetch {
        log::debug!("quickfetch: all wanted objects already present");
        summary.quickfetch = true;
        pre_verified = true;
    } else {
        // 4. Mark complete: advertised tips we already have are common
        //    without a round trip
        let known_common: Vec<ObjectId> = remote_refs
            .iter()
            .map(|(_, r)| r.effective_old_id())
            .filter(|id| !id.is_null() && store.contains(id))
            .collect();

        // 6-7. Negotiate and receive
        let params = FetchParams {
            depth: options.depth,
            deepen_since: options.deepen_since,
            deepen_not: options.deepen_not.clone(),
            deepen_relative: options.deepen_relative,
            filter: options.filter.clone(),
            shallow: shallow.roots().copied().collect(),
            negotiation_tips: if options.negotiation_tips.is_empty() {
                local_tips.clone()
            } else {
                options.negotiation_tips.clone()
            },
            known_common,
            refetch: options.refetch,
            keep_pack: options.keep_pack,
            fsck: options.fsck,
            no_progress: options.no_progress,
        };

        let outcome = transport.fetch(store, &remote_refs, &want_idx, &params, progress)?;
        shallow_updates = outcome.shallow_updates;
        pre_verified = outcome.pre_verified;
        summary.objects = outcome.objects;
    }

    // 10 (policy part). Unsolicited shallow roots reject the refs whose
    // history needs them, unless accepting shallow updates was allowed
    let new_roots: Vec<ObjectId> = shallow_updates
        .iter()
        .filter_map(|u| match u {
            ShallowUpdate::Shallow(id) => Some(*id),
            ShallowUpdate::Unshallow(_) => None,
        })
        .collect();
    let unsolicited = !deepening && !new_roots.is_empty() && !options.update_shallow;
    if unsolicited {
        for idx in selected.indices() {
            let r = selected.get_mut(idx);
            if r.new_id.is_null() {
                continue;
            }
            if reaches_any(store, &r.new_id, &new_roots)? {
                r.status = RefStatus::RejectShallow;
            }
        }
    } else if !shallow_updates.is_empty() {
        shallow.stage_all(&shallow_updates, store)?;
    }

    // 8. Connectivity
    if !pre_verified {
        let tips: Vec<ObjectId> = selected
            .iter()
            .filter(|(_, r)| r.status == RefStatus::None && !r.new_id.is_null())
            .map(|(_, r)| r.new_id)
            .collect();
        connectivity::verify_connected(store, &tips, &local_tips)?;
    }

    // 9. Classify and apply ref updates
    classify_updates(&mut selected, store, options)?;

    let any_rejection = selected.iter().any(|(_, r)| r.status.is_rejection());
    let apply = !options.dry_run && !(options.atomic && any_rejection);
    if apply {
        for idx in selected.indices() {
            let r = selected.get(idx);
            if r.status == RefStatus::Ok && !r.name.is_empty() {
                refstore.update(r.name.as_bstr(), r.new_id)?;
            }
        }
    }

    // 3 (apply part). Prune
    if apply && options.prune {
        for name in &pruned_plan {
            refstore.delete(name.as_bstr())?;
            summary.pruned.push(name.clone());
        }
    }

    // 10. Commit shallow state
    if apply && shallow.is_changed() {
        shallow.commit()?;
        summary.shallow_changed = true;
    }

    // 11. FETCH_HEAD
    if apply && options.write_fetch_head {
        if let Some(gitdir) = gitdir {
            write_fetch_head(gitdir, &selected, &options.remote_url)?;
        }
    }

    summary.refs = selected;
    Ok(summary)
}

/// Server-side prefixes implied by the refspecs.
fn ref_prefixes(options: &FetchOptions) -> Vec<BString> {
    let mut prefixes = vec![BString::from("HEAD")];
    for spec in &options.refspecs {
        let src = spec.src.as_str();
        let prefix = match src.find('*') {
            Some(star) => &src[..star],
            None => src,
        };
        if !prefix.is_empty() {
            prefixes.push(BString::from(prefix));
        }
    }
    if options.tags != TagMode::None {
        prefixes.push(BString::from("refs/tags/"));
    }
    prefixes
}

/// Apply refspecs to the advertisement, follow tags, deduplicate.
///
/// Each selected entry is a local update record: `name` is the tracking
/// destination (empty for fetch-only refs), `old_id` the current local
/// value, `new_id` the advertised value, `peer` the remote-side record.
fn select_refs(
    remote_refs: &RefList,
    refstore: &dyn RefStore,
    store: &dyn ObjectStore,
    options: &FetchOptions,
) -> Result<RefList, ProtocolError> {
    let mut selected = RefList::new();

    let mut add = |selected: &mut RefList,
                   remote: &Ref,
                   dst: Option<BString>,
                   force: bool,
                   merge: FetchHeadStatus,
                   explicit: bool| {
        let peer = selected.push(remote.clone());
        let dst_name = dst.unwrap_or_default();
        let mut update = Ref::new(
            dst_name.clone(),
            refstore
                .resolve(dst_name.as_bstr())
                .unwrap_or_else(|| remote.old_id.algorithm().null_oid()),
        );
        update.new_id = remote.old_id;
        update.peeled = remote.peeled;
        update.peer = Some(peer);
        update.force = force;
        update.fetch_head_status = merge;
        update.explicit = explicit;
        selected.push(update)
    };

    if options.refspecs.is_empty() {
        // Bare `fetch`: HEAD for merge
        if let Some(idx) = remote_refs.find(b"HEAD".as_bstr()) {
            let remote = remote_refs.get(idx).clone();
            add(
                &mut selected,
                &remote,
                None,
                false,
                FetchHeadStatus::Merge,
                true,
            );
        }
    } else {
        for (_, remote) in remote_refs.iter() {
            if remote.name.ends_with(b"^{}") {
                continue;
            }
            if let Some((spec, dst)) = refspec::map_remote_to_local(&options.refspecs, remote.name.as_bstr())
            {
                let merge = if spec.pattern {
                    FetchHeadStatus::NotForMerge
                } else {
                    FetchHeadStatus::Merge
                };
                add(
                    &mut selected,
                    remote,
                    dst,
                    spec.force || options.force,
                    merge,
                    true,
                );
            }
        }
    }

    match options.tags {
        TagMode::All => {
            for (_, remote) in remote_refs.iter() {
                if !remote.name.starts_with(b"refs/tags/") {
                    continue;
                }
                if selected
                    .iter()
                    .any(|(_, s)| s.name.as_bstr() == remote.name.as_bstr())
                {
                    continue;
                }
                add(
                    &mut selected,
                    remote,
                    Some(remote.name.clone()),
                    options.force,
                    FetchHeadStatus::NotForMerge,
                    true,
                );
            }
        }
        TagMode::Auto => {
            find_non_local_tags(remote_refs, &mut selected, store, refstore, &mut add);
        }
        TagMode::None => {}
    }

    selected.dedup_by_dst(|r| {
        if r.name.is_empty() || r.peer.is_none() {
            None
        } else {
            Some(r.name.clone())
        }
    });

    // Keep only the update records in the iteration order
    selected.retain(|r| r.peer.is_some());
    Ok(selected)
}

/// Auto tag following: annotated tags whose target is already here (or
/// arriving with this fetch) ride along.
fn find_non_local_tags(
    remote_refs: &RefList,
    selected: &mut RefList,
    store: &dyn ObjectStore,
    refstore: &dyn RefStore,
    add: &mut impl FnMut(
        &mut RefList,
        &Ref,
        Option<BString>,
        bool,
        FetchHeadStatus,
        bool,
    ) -> usize,
) {
    let incoming: HashSet<ObjectId> = selected
        .iter()
        .filter(|(_, r)| r.peer.is_some())
        .map(|(_, r)| r.new_id)
        .collect();

    for (_, remote) in remote_refs.iter() {
        if !remote.name.starts_with(b"refs/tags/") || remote.name.ends_with(b"^{}") {
            continue;
        }
        if refstore.resolve(remote.name.as_bstr()).is_some() {
            continue;
        }
        if selected
            .iter()
            .any(|(_, s)| s.name.as_bstr() == remote.name.as_bstr())
        {
            continue;
        }
        let target = remote.peeled.unwrap_or(remote.old_id);
        if store.contains(&target) || incoming.contains(&target) || incoming.contains(&remote.old_id)
        {
            add(
                selected,
                remote,
                Some(remote.name.clone()),
                false,
                FetchHeadStatus::NotForMerge,
                false,
            );
        }
    }
}

/// Tracking refs that stopped corresponding to any remote ref.
fn plan_prune(selected: &RefList, refstore: &dyn RefStore, options: &FetchOptions) -> Vec<BString> {
    if !options.prune {
        return Vec::new();
    }

    let kept: HashSet<&BStr> = selected
        .iter()
        .filter(|(_, r)| !r.name.is_empty())
        .map(|(_, r)| r.name.as_bstr())
        .collect();

    let mut stale = Vec::new();
    for (name, _) in refstore.iter_refs() {
        let covered = options
            .refspecs
            .iter()
            .any(|spec| spec.matches_dst(name.as_bstr()));
        if covered && !kept.contains(name.as_bstr()) {
            stale.push(name);
        }
    }
    stale
}

/// Decide each update's status (fast-forward, forced, rejected).
fn classify_updates(
    selected: &mut RefList,
    store: &dyn ObjectStore,
    options: &FetchOptions,
) -> Result<(), ProtocolError> {
    for idx in selected.indices() {
        let r = selected.get(idx);
        if r.status != RefStatus::None || r.name.is_empty() || r.new_id.is_null() {
            continue;
        }

        let status = if r.old_id == r.new_id {
            RefStatus::UpToDate
        } else if r.old_id.is_null() {
            RefStatus::Ok
        } else if r.name.starts_with(b"refs/tags/") {
            // Replacing an existing tag needs force
            if r.force || options.force {
                RefStatus::Ok
            } else {
                RefStatus::RejectAlreadyExists
            }
        } else {
            let old = peel(store, r.old_id)?;
            let new = peel(store, r.peeled.unwrap_or(r.new_id))?;
            if fast_forward(store, &old, &new)? {
                RefStatus::Ok
            } else if r.force || options.force {
                RefStatus::Ok
            } else {
                RefStatus::RejectNonFastForward
            }
        };
        selected.get_mut(idx).status = status;
    }
    Ok(())
}

/// Follow tag objects down to what they point at.
fn peel(store: &dyn ObjectStore, id: ObjectId) -> Result<ObjectId, ProtocolError> {
    let mut id = id;
    for _ in 0..16 {
        if store.commit_info(&id)?.is_some() {
            return Ok(id);
        }
        match store.referenced(&id) {
            Ok(links) if links.len() == 1 => id = links[0],
            _ => return Ok(id),
        }
    }
    Ok(id)
}

/// Whether any of `roots` lies in the ancestry of `tip`.
fn reaches_any(
    store: &dyn ObjectStore,
    tip: &ObjectId,
    roots: &[ObjectId],
) -> Result<bool, ProtocolError> {
    for root in roots {
        if crate::store::is_ancestor(store, root, tip)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Rewrite `FETCH_HEAD`: merge entries first, then not-for-merge, one
/// line per ref:
/// `<id>\t<not-for-merge>\t<kind> '<short>' of <url>`
fn write_fetch_head(
    gitdir: &Path,
    selected: &RefList,
    url: &str,
) -> Result<(), ProtocolError> {
    let mut lock = Lockfile::acquire(gitdir.join("FETCH_HEAD"))?;
    let mut written: HashSet<(ObjectId, BString)> = HashSet::new();

    for pass in [FetchHeadStatus::Merge, FetchHeadStatus::NotForMerge] {
        for (_, r) in selected.iter() {
            if r.fetch_head_status != pass || r.new_id.is_null() {
                continue;
            }
            let remote_name = match r.peer {
                Some(peer) => selected.get(peer).name.clone(),
                None => r.name.clone(),
            };
            if !written.insert((r.new_id, remote_name.clone())) {
                continue;
            }

            let marker = match pass {
                FetchHeadStatus::Merge => "",
                _ => "not-for-merge",
            };
            let description = describe_ref(remote_name.as_bstr());
            writeln!(
                lock,
                "{}\t{}\t{} of {}",
                r.new_id, marker, description, url
            )
            .map_err(ProtocolError::Io)?;
        }
    }

    lock.commit()?;
    Ok(())
}

fn describe_ref(name: &BStr) -> String {
    if let Some(short) = name.strip_prefix(b"refs/heads/") {
        format!("branch '{}'", short.as_bstr())
    } else if let Some(short) = name.strip_prefix(b"refs/tags/") {
        format!("tag '{}'", short.as_bstr())
    } else {
        format!("'{}'", name)
    }
}
