//! Integration tests for the push driver over scripted connections.

use bstr::{BString, ByteSlice};
use git_hash::ObjectId;
use git_protocol::pktline::PktLineWriter;
use git_protocol::push::{push, Lease, PushOptions};
use git_protocol::refs::RefStatus;
use git_protocol::refspec::RefSpec;
use git_protocol::store::RefStore;
use git_protocol::testing::{MemoryRefStore, MemoryStore, ScriptedConnection};
use git_protocol::transport::{SmartTransport, TransportOptions};
use git_transport::GitUrl;

fn advertisement(refs: &[(ObjectId, &str)], caps: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = PktLineWriter::new(&mut buf);
    for (i, (id, name)) in refs.iter().enumerate() {
        if i == 0 {
            writer
                .write_text(&format!("{} {}\0{}", id, name, caps))
                .unwrap();
        } else {
            writer.write_text(&format!("{} {}", id, name)).unwrap();
        }
    }
    writer.write_flush().unwrap();
    buf
}

fn report(lines: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = PktLineWriter::new(&mut buf);
    for line in lines {
        writer.write_text(line).unwrap();
    }
    writer.write_flush().unwrap();
    buf
}

fn smart(server: Vec<u8>) -> SmartTransport {
    let conn = ScriptedConnection::stream(server);
    let url = GitUrl::parse("git://example.com/repo.git").unwrap();
    SmartTransport::with_connection(url, Box::new(conn), TransportOptions::default())
}

fn diverged() -> (MemoryStore, ObjectId, ObjectId, ObjectId) {
    let mut store = MemoryStore::new();
    let base = store.add_commit(b"base", &[], 100);
    let ours = store.add_commit(b"ours", &[base], 200);
    let theirs = store.add_commit(b"theirs", &[base], 210);
    (store, base, ours, theirs)
}

fn main_refspec(force: bool) -> Vec<RefSpec> {
    let spec = if force {
        "+refs/heads/main:refs/heads/main"
    } else {
        "refs/heads/main:refs/heads/main"
    };
    vec![RefSpec::parse(spec).unwrap()]
}

#[test]
fn non_fast_forward_is_rejected_without_sending() {
    let (store, _base, ours, theirs) = diverged();
    let refstore_ro = MemoryRefStore::new().with_ref("refs/heads/main", ours);

    let server = advertisement(&[(theirs, "refs/heads/main")], "report-status");
    let mut transport = smart(server);

    let mut refstore = refstore_ro;
    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: main_refspec(false),
            ..Default::default()
        },
        None,
        &mut Vec::new(),
    )
    .unwrap();

    assert!(!summary.is_ok());
    assert!(!summary.sent);
    let (_, r) = summary.updates.iter().next().unwrap();
    assert_eq!(r.status, RefStatus::RejectNonFastForward);
    // The tracking ref must not move
    assert!(refstore
        .resolve(b"refs/remotes/origin/main".as_bstr())
        .is_none());
}

#[test]
fn forced_push_goes_through() {
    let (store, _base, ours, theirs) = diverged();
    let mut refstore = MemoryRefStore::new().with_ref("refs/heads/main", ours);

    let mut server = advertisement(&[(theirs, "refs/heads/main")], "report-status");
    server.extend_from_slice(&report(&["unpack ok", "ok refs/heads/main"]));
    let mut transport = smart(server);

    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: main_refspec(true),
            ..Default::default()
        },
        None,
        &mut Vec::new(),
    )
    .unwrap();

    assert!(summary.is_ok());
    assert!(summary.sent);
    let (_, r) = summary.updates.iter().next().unwrap();
    assert_eq!(r.status, RefStatus::Ok);
    assert_eq!(
        refstore.resolve(b"refs/remotes/origin/main".as_bstr()),
        Some(ours)
    );
}

#[test]
fn force_with_lease_success() {
    let (store, _base, ours, theirs) = diverged();
    let mut refstore = MemoryRefStore::new()
        .with_ref("refs/heads/main", ours)
        .with_ref("refs/remotes/origin/main", theirs);

    let mut server = advertisement(&[(theirs, "refs/heads/main")], "report-status");
    server.extend_from_slice(&report(&["unpack ok", "ok refs/heads/main"]));
    let mut transport = smart(server);

    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: main_refspec(false),
            // Lease without an explicit value: the tracking ref's
            force_with_lease: vec![Lease {
                name: BString::from("refs/heads/main"),
                expected: None,
            }],
            ..Default::default()
        },
        None,
        &mut Vec::new(),
    )
    .unwrap();

    assert!(summary.is_ok());
    let (_, r) = summary.updates.iter().next().unwrap();
    assert_eq!(r.status, RefStatus::Ok);
    assert_eq!(
        refstore.resolve(b"refs/remotes/origin/main".as_bstr()),
        Some(ours)
    );
}

#[test]
fn stale_lease_rejected_without_sending() {
    let (mut store, base, ours, theirs) = diverged();
    // The remote moved to something we have never seen
    let moved = store.add_commit(b"moved", &[base], 400);
    let mut refstore = MemoryRefStore::new()
        .with_ref("refs/heads/main", ours)
        .with_ref("refs/remotes/origin/main", theirs);

    let server = advertisement(&[(moved, "refs/heads/main")], "report-status");
    let mut transport = smart(server);

    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: main_refspec(false),
            force_with_lease: vec![Lease {
                name: BString::from("refs/heads/main"),
                expected: Some(theirs),
            }],
            ..Default::default()
        },
        None,
        &mut Vec::new(),
    )
    .unwrap();

    assert!(!summary.is_ok());
    assert!(!summary.sent);
    let (_, r) = summary.updates.iter().next().unwrap();
    assert_eq!(r.status, RefStatus::RejectStale);
}

#[test]
fn atomic_push_aborts_all_on_local_rejection() {
    let (mut store, base, ours, theirs) = diverged();
    let dev = store.add_commit(b"dev", &[base], 250);
    let mut refstore = MemoryRefStore::new()
        .with_ref("refs/heads/main", ours)
        .with_ref("refs/heads/dev", dev);

    let server = advertisement(
        &[(theirs, "refs/heads/main"), (base, "refs/heads/dev")],
        "report-status atomic",
    );
    let mut transport = smart(server);

    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: vec![RefSpec::parse("refs/heads/*:refs/heads/*").unwrap()],
            atomic: true,
            ..Default::default()
        },
        None,
        &mut Vec::new(),
    )
    .unwrap();

    assert!(!summary.is_ok());
    assert!(!summary.sent);

    // One specific rejection; everything else untouched
    let statuses: Vec<(BString, RefStatus)> = summary
        .updates
        .iter()
        .map(|(_, r)| (r.name.clone(), r.status))
        .collect();
    assert!(statuses
        .contains(&(BString::from("refs/heads/main"), RefStatus::RejectNonFastForward)));
    assert!(statuses.contains(&(BString::from("refs/heads/dev"), RefStatus::None)));
}

#[test]
fn remote_rejection_is_recorded_per_ref() {
    let (mut store, base, ours, _theirs) = diverged();
    let dev = store.add_commit(b"dev", &[base], 250);
    let mut refstore = MemoryRefStore::new()
        .with_ref("refs/heads/main", ours)
        .with_ref("refs/heads/dev", dev);

    let mut server = advertisement(
        &[(base, "refs/heads/main"), (base, "refs/heads/dev")],
        "report-status",
    );
    server.extend_from_slice(&report(&[
        "unpack ok",
        "ok refs/heads/main",
        "ng refs/heads/dev pre-receive hook declined",
    ]));
    let mut transport = smart(server);

    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: vec![RefSpec::parse("refs/heads/*:refs/heads/*").unwrap()],
            ..Default::default()
        },
        None,
        &mut Vec::new(),
    )
    .unwrap();

    assert!(!summary.is_ok());
    let find = |name: &str| {
        summary
            .updates
            .iter()
            .find(|(_, r)| r.name.as_bstr() == name)
            .map(|(_, r)| r.clone())
            .unwrap()
    };
    assert_eq!(find("refs/heads/main").status, RefStatus::Ok);
    let dev_ref = find("refs/heads/dev");
    assert_eq!(dev_ref.status, RefStatus::RemoteReject);
    assert_eq!(
        dev_ref.remote_status.as_deref(),
        Some("pre-receive hook declined")
    );

    // Only the accepted ref's tracking moved
    assert_eq!(
        refstore.resolve(b"refs/remotes/origin/main".as_bstr()),
        Some(ours)
    );
    assert!(refstore
        .resolve(b"refs/remotes/origin/dev".as_bstr())
        .is_none());
}

#[test]
fn deletion_needs_server_capability() {
    let (store, base, _ours, _theirs) = diverged();
    let mut refstore = MemoryRefStore::new();

    // No delete-refs capability advertised
    let server = advertisement(&[(base, "refs/heads/gone")], "report-status");
    let mut transport = smart(server);

    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: vec![RefSpec::parse(":refs/heads/gone").unwrap()],
            ..Default::default()
        },
        None,
        &mut Vec::new(),
    )
    .unwrap();

    assert!(!summary.is_ok());
    let (_, r) = summary.updates.iter().next().unwrap();
    assert_eq!(r.status, RefStatus::RejectNoDelete);
}

#[test]
fn deletion_with_capability_sends_null_id() {
    let (store, base, _ours, _theirs) = diverged();
    let mut refstore = MemoryRefStore::new();

    let mut server = advertisement(&[(base, "refs/heads/gone")], "report-status delete-refs");
    server.extend_from_slice(&report(&["unpack ok", "ok refs/heads/gone"]));
    let mut transport = smart(server);

    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: vec![RefSpec::parse(":refs/heads/gone").unwrap()],
            ..Default::default()
        },
        None,
        &mut Vec::new(),
    )
    .unwrap();

    assert!(summary.is_ok());
    let (_, r) = summary.updates.iter().next().unwrap();
    assert_eq!(r.status, RefStatus::Ok);
    assert!(r.is_deletion());
}

#[test]
fn up_to_date_push_sends_nothing() {
    let (store, _base, ours, _theirs) = diverged();
    let mut refstore = MemoryRefStore::new().with_ref("refs/heads/main", ours);

    let server = advertisement(&[(ours, "refs/heads/main")], "report-status");
    let mut transport = smart(server);

    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: main_refspec(false),
            ..Default::default()
        },
        None,
        &mut Vec::new(),
    )
    .unwrap();

    assert!(summary.is_ok());
    assert!(!summary.sent);
    let (_, r) = summary.updates.iter().next().unwrap();
    assert_eq!(r.status, RefStatus::UpToDate);
}

#[test]
fn signed_push_wraps_commands_in_certificate() {
    use git_protocol::testing::FakeSigner;
    use git_protocol::transport::SignPush;

    let (store, _base, ours, theirs) = diverged();
    let mut refstore = MemoryRefStore::new().with_ref("refs/heads/main", ours);

    let mut server = advertisement(
        &[(theirs, "refs/heads/main")],
        "report-status push-cert=NONCE-123",
    );
    server.extend_from_slice(&report(&["unpack ok", "ok refs/heads/main"]));
    let mut transport = smart(server);

    let summary = push(
        &mut transport,
        &store,
        &mut refstore,
        &PushOptions {
            refspecs: main_refspec(true),
            sign: SignPush::Always,
            remote_url: "git://example.com/repo.git".into(),
            ..Default::default()
        },
        Some(&FakeSigner),
        &mut Vec::new(),
    )
    .unwrap();

    assert!(summary.is_ok());
    let (_, r) = summary.updates.iter().next().unwrap();
    assert_eq!(r.status, RefStatus::Ok);
}
