//! The push driver and the send-pack wire protocol.
//!
//! The driver matches local refs against the remote's advertisement,
//! decides per-ref safety (fast-forward, force, lease, delete), and
//! hands the survivors to the transport. The wire side sends the
//! command list (optionally wrapped in a signed certificate), streams
//! the pack, and maps the server's status report back onto the refs.

use std::io::Write;

use bstr::{BStr, BString, ByteSlice};
use git_hash::ObjectId;
use git_transport::Connection;

use crate::capability::{self, Capabilities};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::refs::{Ref, RefList, RefStatus};
use crate::refspec::{self, RefSpec};
use crate::sideband;
use crate::store::{fast_forward, ObjectStore, RefStore, Signer};
use crate::transport::{PushParams, SignPush, Transport};
use crate::v2::LsRefsOptions;
use crate::ProtocolError;

/// A `--force-with-lease` entry: the expected remote value for one ref,
/// or `None` to take the tracking ref's value.
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: BString,
    pub expected: Option<ObjectId>,
}

/// Options for one push operation.
#[derive(Debug, Clone)]
pub struct PushOptions {
    pub refspecs: Vec<RefSpec>,
    /// Push every local branch (`--all`).
    pub all: bool,
    /// Mirror everything, deleting remote refs with no local
    /// counterpart (`--mirror`).
    pub mirror: bool,
    /// Also push all tags (`--tags`).
    pub tags: bool,
    pub force: bool,
    pub atomic: bool,
    pub dry_run: bool,
    pub thin: bool,
    /// `--push-option` strings for the remote's hooks.
    pub push_options: Vec<String>,
    pub force_with_lease: Vec<Lease>,
    /// Require the lease tip to be an ancestor of what we push.
    pub force_if_includes: bool,
    pub sign: SignPush,
    pub no_progress: bool,
    /// Remote name, for tracking-ref maintenance and lease defaults.
    pub remote_name: String,
    /// Remote URL, recorded in the push certificate.
    pub remote_url: String,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            refspecs: Vec::new(),
            all: false,
            mirror: false,
            tags: false,
            force: false,
            atomic: false,
            dry_run: false,
            thin: true,
            push_options: Vec::new(),
            force_with_lease: Vec::new(),
            force_if_includes: false,
            sign: SignPush::Never,
            no_progress: false,
            remote_name: "origin".into(),
            remote_url: String::new(),
        }
    }
}

/// What a push did. Each entry in `updates` is the remote-side ref with
/// its final status; `peer` names the local source ref.
#[derive(Debug, Default)]
pub struct PushSummary {
    pub updates: RefList,
    /// A pack was actually transmitted.
    pub sent: bool,
}

impl PushSummary {
    pub fn is_ok(&self) -> bool {
        self.updates.iter().all(|(_, r)| !r.status.is_rejection())
    }
}

/// Run a push against an open transport.
pub fn push(
    transport: &mut dyn Transport,
    store: &dyn ObjectStore,
    refstore: &mut dyn RefStore,
    options: &PushOptions,
    signer: Option<&dyn Signer>,
    progress: &mut dyn Write,
) -> Result<PushSummary, ProtocolError> {
    // 1. The remote's view
    let remote_refs = transport.get_refs(true, &LsRefsOptions::default())?;

    // 2-3. Match refs and classify
    let mut updates = match_refs(&remote_refs, refstore, options)?;
    apply_leases(&mut updates, refstore, options)?;

    // 4. Safety decisions
    classify_updates(&mut updates, store, refstore, options)?;

    let mut summary = PushSummary::default();

    // 5. Atomic: one local rejection aborts the whole request
    let any_rejection = updates.iter().any(|(_, r)| r.status.is_rejection());
    if options.atomic && any_rejection {
        log::warn!("atomic push aborted by local rejection");
        summary.updates = updates;
        return Ok(summary);
    }

    let sendable = updates
        .iter()
        .filter(|(_, r)| r.status == RefStatus::None)
        .count();

    if sendable > 0 && !options.dry_run {
        // 6-8. Wire
        let params = PushParams {
            thin: options.thin,
            atomic: options.atomic,
            push_options: options.push_options.clone(),
            sign: options.sign,
            no_progress: options.no_progress,
            remote_tips: remote_refs
                .iter()
                .filter(|(_, r)| !r.old_id.is_null())
                .map(|(_, r)| r.old_id)
                .collect(),
            pushee: options.remote_url.clone(),
        };
        transport.push(store, &mut updates, &params, signer, progress)?;
        summary.sent = true;
    } else if options.dry_run {
        for idx in updates.indices() {
            let r = updates.get_mut(idx);
            if r.status == RefStatus::None {
                r.status = RefStatus::Ok;
            }
        }
    }

    // 9. Tracking refs follow successful updates
    if !options.dry_run {
        update_tracking_refs(&updates, refstore, options)?;
    }

    summary.updates = updates;
    Ok(summary)
}

/// Expand refspecs (and `--all`/`--mirror`/`--tags`) into concrete
/// update records against the remote's advertisement.
fn match_refs(
    remote_refs: &RefList,
    refstore: &dyn RefStore,
    options: &PushOptions,
) -> Result<RefList, ProtocolError> {
    let mut specs = options.refspecs.clone();
    if options.all {
        specs.push(refspec::all_branches_refspec());
    }
    if options.mirror {
        specs.push(refspec::mirror_refspec());
    }
    if options.tags {
        specs.push(refspec::tags_refspec());
    }
    if specs.is_empty() {
        return Err(ProtocolError::RefNotMatched(
            "no refspecs configured for push".into(),
        ));
    }

    let local_refs = refstore.iter_refs();
    let mut updates = RefList::new();

    let add_update = |updates: &mut RefList,
                      src: Option<(&BStr, ObjectId)>,
                      dst: BString,
                      force: bool| {
        let remote_value = remote_refs
            .find(dst.as_bstr())
            .map(|i| remote_refs.get(i).old_id);
        let algo = src
            .map(|(_, id)| id.algorithm())
            .unwrap_or(git_hash::HashAlgorithm::Sha1);

        let mut update = Ref::new(dst, remote_value.unwrap_or(algo.null_oid()));
        update.new_id = src.map(|(_, id)| id).unwrap_or(algo.null_oid());
        update.force = force;
        if let Some((src_name, src_id)) = src {
            let mut local = Ref::new(src_name, src_id);
            local.new_id = src_id;
            let peer = updates.push(local);
            update.peer = Some(peer);
        }
        updates.push(update)
    };

    for spec in &specs {
        if spec.is_delete() {
            if remote_refs.find(spec.dst.as_bytes().as_bstr()).is_none() {
                return Err(ProtocolError::RefNotMatched(format!(
                    "remote ref does not exist: {}",
                    spec.dst
                )));
            }
            add_update(
                &mut updates,
                None,
                BString::from(spec.dst.as_str()),
                spec.force || options.force,
            );
            continue;
        }

        let mut matched = false;
        for (name, id) in &local_refs {
            if !spec.matches_src(name.as_bstr()) {
                continue;
            }
            matched = true;
            let dst = spec
                .expand_dst(name.as_bstr())
                .unwrap_or_else(|| name.clone());
            add_update(
                &mut updates,
                Some((name.as_bstr(), *id)),
                dst,
                spec.force || options.force || options.mirror,
            );
        }
        if !matched && !spec.pattern {
            return Err(ProtocolError::RefNotMatched(format!(
                "source ref does not match any local ref: {}",
                spec.src
            )));
        }
    }

    // Mirror deletes whatever the remote has that we do not
    if options.mirror {
        for (_, remote) in remote_refs.iter() {
            if remote.name.ends_with(b"^{}") || remote.name.as_bstr() == "HEAD" {
                continue;
            }
            let have_local = local_refs
                .iter()
                .any(|(name, _)| name.as_bstr() == remote.name.as_bstr());
            let already = updates
                .iter()
                .any(|(_, u)| u.name.as_bstr() == remote.name.as_bstr());
            if !have_local && !already {
                add_update(&mut updates, None, remote.name.clone(), true);
            }
        }
    }

    // Only the remote-side records stay in iteration order; a
    // destination fed by several sources keeps the first
    updates.retain(|r| r.peer.is_some() || r.new_id.is_null());
    updates.dedup_by_dst(|r| Some(r.name.clone()));
    Ok(updates)
}

/// Fill lease expectations from `--force-with-lease`.
fn apply_leases(
    updates: &mut RefList,
    refstore: &dyn RefStore,
    options: &PushOptions,
) -> Result<(), ProtocolError> {
    for lease in &options.force_with_lease {
        let idx = updates.find(lease.name.as_bstr()).ok_or_else(|| {
            ProtocolError::RefNotMatched(format!("lease on unpushed ref: {}", lease.name))
        })?;
        let expected = match lease.expected {
            Some(id) => id,
            None => tracking_ref_name(&options.remote_name, lease.name.as_bstr())
                .and_then(|name| refstore.resolve(name.as_bstr()))
                .ok_or_else(|| {
                    ProtocolError::RefNotMatched(format!(
                        "no tracking information for lease on {}",
                        lease.name
                    ))
                })?,
        };
        let r = updates.get_mut(idx);
        r.expect_old_id = Some(expected);
        r.force = true;
    }
    Ok(())
}

/// The local tracking name for a remote branch.
fn tracking_ref_name(remote_name: &str, dst: &BStr) -> Option<BString> {
    let short = dst.strip_prefix(b"refs/heads/")?;
    let mut name = BString::from(format!("refs/remotes/{}/", remote_name));
    name.extend_from_slice(short);
    Some(name)
}

/// Per-ref safety decisions: up-to-date, lease, fetch-first,
/// fast-forward.
fn classify_updates(
    updates: &mut RefList,
    store: &dyn ObjectStore,
    refstore: &dyn RefStore,
    options: &PushOptions,
) -> Result<(), ProtocolError> {
    for idx in updates.indices() {
        let r = updates.get(idx);

        if r.is_deletion() {
            if r.old_id.is_null() {
                // Deleting something that is not there
                updates.get_mut(idx).status = RefStatus::UpToDate;
            }
            continue;
        }
        if r.old_id == r.new_id {
            updates.get_mut(idx).status = RefStatus::UpToDate;
            continue;
        }

        // Lease check comes first: a stale lease beats everything
        if let Some(expected) = r.expect_old_id {
            if expected != r.old_id {
                updates.get_mut(idx).status = RefStatus::RejectStale;
                continue;
            }
            if options.force_if_includes {
                let tracking = tracking_ref_name(&options.remote_name, r.name.as_bstr())
                    .and_then(|name| refstore.resolve(name.as_bstr()));
                if let Some(tip) = tracking {
                    if !crate::store::is_ancestor(store, &tip, &r.new_id)? {
                        updates.get_mut(idx).status = RefStatus::RejectRemoteUpdated;
                        continue;
                    }
                }
            }
        }

        if r.old_id.is_null() {
            // Creation is always safe
            continue;
        }
        if !store.contains(&r.old_id) {
            updates.get_mut(idx).status = RefStatus::RejectFetchFirst;
            continue;
        }
        if r.name.starts_with(b"refs/tags/") {
            if !r.force {
                updates.get_mut(idx).status = RefStatus::RejectAlreadyExists;
            }
            continue;
        }
        // Fast-forward is only defined between commits; anything else
        // (blobs, trees, unannotated object moves) must be forced
        let commits = store.commit_info(&r.old_id)?.is_some()
            && store.commit_info(&r.new_id)?.is_some();
        if !commits {
            if !r.force {
                updates.get_mut(idx).status = RefStatus::RejectNeedsForce;
            }
            continue;
        }
        if !fast_forward(store, &r.old_id, &r.new_id)? && !r.force {
            updates.get_mut(idx).status = RefStatus::RejectNonFastForward;
        }
    }
    Ok(())
}

/// Move `refs/remotes/<remote>/…` along with accepted updates.
fn update_tracking_refs(
    updates: &RefList,
    refstore: &mut dyn RefStore,
    options: &PushOptions,
) -> Result<(), ProtocolError> {
    for (_, r) in updates.iter() {
        if r.status != RefStatus::Ok {
            continue;
        }
        if let Some(tracking) = tracking_ref_name(&options.remote_name, r.name.as_bstr()) {
            if r.is_deletion() {
                refstore.delete(tracking.as_bstr())?;
            } else {
                refstore.update(tracking.as_bstr(), r.new_id)?;
            }
        }
    }
    Ok(())
}

/// The send-pack wire exchange over an established v0/v1 connection.
pub fn send_pack(
    conn: &mut dyn Connection,
    caps: &Capabilities,
    store: &dyn ObjectStore,
    updates: &mut RefList,
    params: &PushParams,
    signer: Option<&dyn Signer>,
    progress: &mut dyn Write,
) -> Result<(), ProtocolError> {
    // Deletions need server consent
    if !caps.supports("delete-refs") {
        for idx in updates.indices() {
            let r = updates.get_mut(idx);
            if r.status == RefStatus::None && r.is_deletion() {
                r.status = RefStatus::RejectNoDelete;
            }
        }
    }

    let sendable: Vec<usize> = updates
        .indices()
        .into_iter()
        .filter(|&i| updates.get(i).status == RefStatus::None)
        .collect();
    if sendable.is_empty() {
        return Ok(());
    }

    let mut client_caps = capability::negotiate_push(caps);
    if params.atomic {
        if !caps.supports("atomic") {
            return Err(ProtocolError::Unsupported(
                "server does not support atomic push".into(),
            ));
        }
        client_caps.push("atomic".into());
    }
    if !params.push_options.is_empty() {
        if !caps.supports("push-options") {
            return Err(ProtocolError::Unsupported(
                "server does not support push options".into(),
            ));
        }
        client_caps.push("push-options".into());
    }
    if caps.supports("quiet") && params.no_progress {
        client_caps.push("quiet".into());
    }

    let cert_nonce = caps.value("push-cert").map(str::to_string);
    let use_cert = match params.sign {
        SignPush::Never => false,
        SignPush::IfAsked => cert_nonce.is_some() && signer.is_some(),
        SignPush::Always => {
            if cert_nonce.is_none() {
                return Err(ProtocolError::Unsupported(
                    "server does not accept push certificates".into(),
                ));
            }
            if signer.is_none() {
                return Err(ProtocolError::Unsupported(
                    "signed push requested but no signer is available".into(),
                ));
            }
            true
        }
    };

    let has_report = caps.supports("report-status") || caps.supports("report-status-v2");
    let sideband = caps.supports("side-band-64k");

    // Command phase
    {
        let mut writer = PktLineWriter::new(conn.writer());
        let cap_suffix = client_caps.join(" ");

        if use_cert {
            let signer = signer.expect("checked above");
            let nonce = cert_nonce.expect("checked above");
            let cert = build_push_cert(updates, &sendable, &nonce, &params.pushee);
            let signature = signer.sign(cert.as_bytes())?;

            writer.write_text(&format!("push-cert\0{}", cap_suffix))?;
            for line in cert.lines() {
                writer.write_text(line)?;
            }
            for line in String::from_utf8_lossy(&signature).lines() {
                writer.write_text(line)?;
            }
            writer.write_text("push-cert-end")?;
        } else {
            for (i, &idx) in sendable.iter().enumerate() {
                let r = updates.get(idx);
                let line = if i == 0 {
                    format!("{} {} {}\0{}", r.old_id, r.new_id, r.name, cap_suffix)
                } else {
                    format!("{} {} {}", r.old_id, r.new_id, r.name)
                };
                writer.write_text(&line)?;
            }
        }
        writer.write_flush()?;

        if !params.push_options.is_empty() {
            for option in &params.push_options {
                writer.write_text(option)?;
            }
            writer.write_flush()?;
        }

        // Pack phase: objects reachable from the new tips that the
        // remote does not already have. Deletion-only pushes carry none.
        let include: Vec<ObjectId> = sendable
            .iter()
            .map(|&i| updates.get(i).new_id)
            .filter(|id| !id.is_null())
            .collect();
        if !include.is_empty() {
            let pack = store.build_pack(&include, &params.remote_tips, params.thin)?;
            writer.inner_mut().write_all(&pack)?;
        }
        writer.flush()?;
    }

    for &idx in &sendable {
        updates.get_mut(idx).status = RefStatus::ExpectingReport;
    }
    conn.dispatch()?;

    // Status report
    if has_report {
        if sideband {
            let mut reader = PktLineReader::new(conn.reader()).err_packets(false);
            let mut buffer = Vec::new();
            sideband::demux(&mut reader, &mut buffer, progress)?;
            let mut report = PktLineReader::new(&buffer[..]).chomp_newline(true);
            parse_report_from(&mut report, updates)?;
        } else {
            let mut reader = PktLineReader::new(conn.reader()).chomp_newline(true);
            parse_report_from(&mut reader, updates)?;
        }
    }

    // A missing report is a failure for whoever still expects one
    for idx in updates.indices() {
        let r = updates.get_mut(idx);
        if r.status == RefStatus::ExpectingReport {
            if has_report {
                r.status = RefStatus::RemoteReject;
                r.remote_status = Some("remote reported no status".into());
            } else {
                r.status = RefStatus::Ok;
            }
        }
    }
    Ok(())
}

/// The certificate payload for a signed push.
fn build_push_cert(
    updates: &RefList,
    sendable: &[usize],
    nonce: &str,
    pushee: &str,
) -> String {
    let mut cert = String::from("certificate version 0.1\n");
    if !pushee.is_empty() {
        cert.push_str(&format!("pushee {}\n", pushee));
    }
    cert.push_str(&format!("nonce {}\n", nonce));
    cert.push('\n');
    for &idx in sendable {
        let r = updates.get(idx);
        cert.push_str(&format!("{} {} {}\n", r.old_id, r.new_id, r.name));
    }
    cert
}

/// Parse `unpack …` plus `ok`/`ng` lines onto the updates.
fn parse_report_from<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
    updates: &mut RefList,
) -> Result<(), ProtocolError> {
    let mut unpack_error: Option<String> = None;

    loop {
        let line = match reader.read_item()? {
            None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => break,
            Some(PktLine::Delimiter) => continue,
            Some(PktLine::Data(line)) => line,
        };

        if let Some(status) = line.strip_prefix(b"unpack ") {
            if status != b"ok" {
                unpack_error = Some(String::from_utf8_lossy(status).into_owned());
            }
            continue;
        }
        if let Some(name) = line.strip_prefix(b"ok ") {
            if let Some(idx) = updates.find(name.as_bstr()) {
                updates.get_mut(idx).status = RefStatus::Ok;
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix(b"ng ") {
            let (name, reason) = match rest.iter().position(|&b| b == b' ') {
                Some(space) => (
                    &rest[..space],
                    String::from_utf8_lossy(&rest[space + 1..]).into_owned(),
                ),
                None => (rest, String::from("rejected")),
            };
            if let Some(idx) = updates.find(name.as_bstr()) {
                let r = updates.get_mut(idx);
                r.status = RefStatus::RemoteReject;
                r.remote_status = Some(reason);
            }
            continue;
        }
        if line.starts_with(b"option ") {
            // report-status-v2 detail lines; nothing to record yet
            continue;
        }
        return Err(ProtocolError::Protocol(format!(
            "unexpected status report line: {}",
            String::from_utf8_lossy(&line)
        )));
    }

    if let Some(message) = unpack_error {
        for idx in updates.indices() {
            let r = updates.get_mut(idx);
            if r.status == RefStatus::ExpectingReport {
                r.status = RefStatus::RemoteReject;
                r.remote_status = Some(format!("unpack failed: {}", message));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryRefStore, MemoryStore};

    fn update(name: &str, old: ObjectId, new: ObjectId) -> Ref {
        let mut r = Ref::new(name, old);
        r.new_id = new;
        r
    }

    #[test]
    fn report_parsing_assigns_statuses() {
        let a = crate::testing::oid(b"a");
        let mut updates = RefList::new();
        let mut ra = update("refs/heads/a", a, a);
        ra.status = RefStatus::ExpectingReport;
        updates.push(ra);
        let mut rb = update("refs/heads/b", a, a);
        rb.status = RefStatus::ExpectingReport;
        updates.push(rb);

        let mut report = Vec::new();
        {
            let mut w = PktLineWriter::new(&mut report);
            w.write_text("unpack ok").unwrap();
            w.write_text("ok refs/heads/a").unwrap();
            w.write_text("ng refs/heads/b reason text").unwrap();
            w.write_flush().unwrap();
        }

        let mut reader = PktLineReader::new(&report[..]).chomp_newline(true);
        parse_report_from(&mut reader, &mut updates).unwrap();

        let statuses: Vec<_> = updates.iter().map(|(_, r)| r.status).collect();
        assert_eq!(statuses, vec![RefStatus::Ok, RefStatus::RemoteReject]);
        let (_, rb) = updates.iter().nth(1).unwrap();
        assert_eq!(rb.remote_status.as_deref(), Some("reason text"));
    }

    #[test]
    fn unpack_failure_rejects_pending() {
        let a = crate::testing::oid(b"a");
        let mut updates = RefList::new();
        let mut r = update("refs/heads/a", a, a);
        r.status = RefStatus::ExpectingReport;
        updates.push(r);

        let mut report = Vec::new();
        {
            let mut w = PktLineWriter::new(&mut report);
            w.write_text("unpack index-pack abnormal exit").unwrap();
            w.write_flush().unwrap();
        }
        let mut reader = PktLineReader::new(&report[..]).chomp_newline(true);
        parse_report_from(&mut reader, &mut updates).unwrap();

        let (_, r) = updates.iter().next().unwrap();
        assert_eq!(r.status, RefStatus::RemoteReject);
        assert!(r.remote_status.as_deref().unwrap().contains("unpack failed"));
    }

    #[test]
    fn classify_rejects_non_fast_forward() {
        let mut store = MemoryStore::new();
        let base = store.add_commit(b"base", &[], 100);
        let ours = store.add_commit(b"ours", &[base], 200);
        let theirs = store.add_commit(b"theirs", &[base], 210);

        let refstore = MemoryRefStore::new();
        let mut updates = RefList::new();
        updates.push(update("refs/heads/main", theirs, ours));

        classify_updates(&mut updates, &store, &refstore, &PushOptions::default()).unwrap();
        let (_, r) = updates.iter().next().unwrap();
        assert_eq!(r.status, RefStatus::RejectNonFastForward);

        // Force makes it sendable
        let mut updates = RefList::new();
        let mut forced = update("refs/heads/main", theirs, ours);
        forced.force = true;
        updates.push(forced);
        classify_updates(&mut updates, &store, &refstore, &PushOptions::default()).unwrap();
        let (_, r) = updates.iter().next().unwrap();
        assert_eq!(r.status, RefStatus::None);
    }

    #[test]
    fn classify_fetch_first_when_old_unknown() {
        let mut store = MemoryStore::new();
        let ours = store.add_commit(b"ours", &[], 200);
        let unknown = crate::testing::oid(b"remote-moved");

        let refstore = MemoryRefStore::new();
        let mut updates = RefList::new();
        updates.push(update("refs/heads/main", unknown, ours));

        classify_updates(&mut updates, &store, &refstore, &PushOptions::default()).unwrap();
        let (_, r) = updates.iter().next().unwrap();
        assert_eq!(r.status, RefStatus::RejectFetchFirst);
    }

    #[test]
    fn stale_lease_is_rejected() {
        let mut store = MemoryStore::new();
        let base = store.add_commit(b"base", &[], 100);
        let ours = store.add_commit(b"ours", &[base], 200);
        let remote_now = store.add_commit(b"remote-now", &[base], 210);
        let expected = store.add_commit(b"expected", &[base], 220);

        let refstore = MemoryRefStore::new();
        let mut updates = RefList::new();
        let mut r = update("refs/heads/main", remote_now, ours);
        r.expect_old_id = Some(expected);
        r.force = true;
        updates.push(r);

        classify_updates(&mut updates, &store, &refstore, &PushOptions::default()).unwrap();
        let (_, r) = updates.iter().next().unwrap();
        assert_eq!(r.status, RefStatus::RejectStale);
    }

    #[test]
    fn matching_lease_with_force_passes() {
        let mut store = MemoryStore::new();
        let base = store.add_commit(b"base", &[], 100);
        let ours = store.add_commit(b"ours", &[base], 200);
        let remote_now = store.add_commit(b"remote-now", &[base], 210);

        let refstore = MemoryRefStore::new();
        let mut updates = RefList::new();
        let mut r = update("refs/heads/main", remote_now, ours);
        r.expect_old_id = Some(remote_now);
        r.force = true;
        updates.push(r);

        classify_updates(&mut updates, &store, &refstore, &PushOptions::default()).unwrap();
        let (_, r) = updates.iter().next().unwrap();
        assert_eq!(r.status, RefStatus::None);
    }

    #[test]
    fn tracking_ref_names() {
        assert_eq!(
            tracking_ref_name("origin", b"refs/heads/main".as_bstr()),
            Some(BString::from("refs/remotes/origin/main"))
        );
        assert_eq!(
            tracking_ref_name("origin", b"refs/tags/v1".as_bstr()),
            None
        );
    }

    #[test]
    fn push_cert_payload() {
        let a = crate::testing::oid(b"a");
        let b = crate::testing::oid(b"b");
        let mut updates = RefList::new();
        let idx = updates.push(update("refs/heads/main", a, b));

        let cert = build_push_cert(&updates, &[idx], "NONCE123", "https://example.com/repo");
        assert!(cert.starts_with("certificate version 0.1\n"));
        assert!(cert.contains("pushee https://example.com/repo\n"));
        assert!(cert.contains("nonce NONCE123\n"));
        assert!(cert.ends_with(&format!("{} {} refs/heads/main\n", a, b)));
    }
}
