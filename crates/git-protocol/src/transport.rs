//! The transport vtable: one polymorphic interface over the smart
//! native protocol, bundles, external helpers, and the dumb-HTTP
//! walker.
//!
//! A transport instance lives for one operation: refs are fetched at
//! most once per direction and cached, `fetch`/`push` drive the object
//! transfer, and `disconnect` releases everything.

use std::io::Write;
use std::path::PathBuf;

use bstr::BString;
use git_hash::{HashAlgorithm, ObjectId};
use git_transport::{
    http::{HttpConnection, ServerKind},
    Connection, ConnectOptions, GitUrl, ProtocolVersion, Scheme, Service,
};

use crate::capability::Capabilities;
use crate::negotiate::{DefaultNegotiator, Negotiator, NoopNegotiator};
use crate::pktline::{PktKind, PktLineReader};
use crate::refs::RefList;
use crate::shallow::ShallowUpdate;
use crate::store::{IngestOptions, ObjectStore, Signer};
use crate::v2::LsRefsOptions;
use crate::walker::DumbWalker;
use crate::{bundle, helper, push, v1, v2, ProtocolError};

/// Result of applying a transport option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionOutcome {
    /// Option applied.
    Applied,
    /// Option unknown or inapplicable here; callers may warn and go on.
    Unknown,
    /// Option known but the value is invalid.
    Invalid,
}

/// Options shared by all transport kinds.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// The local repository's hash algorithm.
    pub algo: HashAlgorithm,
    /// Protocol version to request (smart transports).
    pub protocol: Option<ProtocolVersion>,
    /// The remote's configured name, for helpers and tracking refs.
    pub remote_name: String,
    /// gzip-encode smart-HTTP request bodies.
    pub gzip: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            algo: HashAlgorithm::Sha1,
            protocol: Some(ProtocolVersion::V2),
            remote_name: "origin".into(),
            gzip: false,
        }
    }
}

/// Parameters for a transport-level fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    pub depth: Option<u32>,
    pub deepen_since: Option<i64>,
    pub deepen_not: Vec<BString>,
    pub deepen_relative: bool,
    pub filter: Option<String>,
    /// Our current shallow roots, advertised to the server.
    pub shallow: Vec<ObjectId>,
    /// Tips to seed negotiation from (the driver's choice of local
    /// refs, or explicit negotiation tips).
    pub negotiation_tips: Vec<ObjectId>,
    /// Advertised tips we already have: known common before the first
    /// round, never advertised as haves.
    pub known_common: Vec<ObjectId>,
    /// Ask the remote to re-send everything reachable.
    pub refetch: bool,
    /// Keep the received pack and its `.keep` lockfile.
    pub keep_pack: bool,
    /// Consistency-check ingested objects.
    pub fsck: bool,
    pub no_progress: bool,
}

/// What a transport fetch produced.
#[derive(Debug, Default)]
pub struct TransportFetch {
    pub shallow_updates: Vec<ShallowUpdate>,
    pub pack_lockfiles: Vec<PathBuf>,
    /// The pack receiver proved connectivity already.
    pub pre_verified: bool,
    pub objects: usize,
}

/// Parameters for a transport-level push.
#[derive(Debug, Clone, Default)]
pub struct PushParams {
    pub thin: bool,
    pub atomic: bool,
    pub push_options: Vec<String>,
    /// Sign the push certificate when the server offers `push-cert`.
    pub sign: SignPush,
    pub no_progress: bool,
    /// Everything the remote advertised, excluded from the pack (and
    /// usable as thin-pack bases).
    pub remote_tips: Vec<ObjectId>,
    /// The remote URL named in a push certificate.
    pub pushee: String,
}

/// Signed-push policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignPush {
    #[default]
    Never,
    /// Sign if the server advertises `push-cert`.
    IfAsked,
    /// Fail unless the certificate can be sent.
    Always,
}

/// The polymorphic transport interface.
pub trait Transport {
    /// Apply a named option.
    fn set_option(&mut self, name: &str, value: &str) -> OptionOutcome;

    /// The remote's refs for one direction. Cached: repeated calls for
    /// the same direction return the same list.
    fn get_refs(&mut self, for_push: bool, ls: &LsRefsOptions) -> Result<RefList, ProtocolError>;

    /// Negotiate and transfer the wanted refs' objects into the store.
    /// `wants` indexes into `refs` (the list `get_refs` returned).
    fn fetch(
        &mut self,
        store: &mut dyn ObjectStore,
        refs: &RefList,
        wants: &[usize],
        params: &FetchParams,
        progress: &mut dyn Write,
    ) -> Result<TransportFetch, ProtocolError>;

    /// Send the updates in `updates` (entries with status `None`) and
    /// record per-ref results on them.
    fn push(
        &mut self,
        store: &dyn ObjectStore,
        updates: &mut RefList,
        params: &PushParams,
        signer: Option<&dyn Signer>,
        progress: &mut dyn Write,
    ) -> Result<(), ProtocolError>;

    /// Advertised bundle URIs, when the server offers any.
    fn bundle_uris(&mut self) -> Result<Vec<String>, ProtocolError> {
        Err(ProtocolError::Unsupported(
            "bundle-uri not supported by this transport".into(),
        ))
    }

    /// Open a raw duplex tunnel to a subservice (smart transports).
    fn connect(&mut self, service: Service) -> Result<&mut dyn Connection, ProtocolError> {
        let _ = service;
        Err(ProtocolError::Unsupported(
            "direct connect not supported by this transport".into(),
        ))
    }

    /// Release all resources.
    fn disconnect(self: Box<Self>) -> Result<(), ProtocolError>;
}

/// Open a transport for `url`.
pub fn open(url: &GitUrl, options: &TransportOptions) -> Result<Box<dyn Transport>, ProtocolError> {
    match &url.scheme {
        Scheme::Ext(scheme) => Ok(Box::new(helper::HelperTransport::spawn(
            scheme,
            &options.remote_name,
            url,
        )?)),
        Scheme::File | Scheme::Local => {
            let path = std::path::Path::new(&url.path);
            if path.is_file() {
                // A plain file is a bundle
                return Ok(Box::new(bundle::BundleTransport::open(path)?));
            }
            Ok(Box::new(SmartTransport::new(url.clone(), options.clone())))
        }
        _ => Ok(Box::new(SmartTransport::new(url.clone(), options.clone()))),
    }
}

enum Handshake {
    /// v0/v1: refs arrived with the advertisement.
    V0 { refs: RefList },
    /// v2: refs come from `ls-refs`.
    V2,
}

/// The smart native transport (v0/v1/v2) over any byte-stream
/// connection; falls back to the dumb walker when HTTP discovery finds
/// no smart server.
pub struct SmartTransport {
    url: GitUrl,
    options: TransportOptions,
    conn: Option<Box<dyn Connection>>,
    service: Option<Service>,
    caps: Capabilities,
    version: ProtocolVersion,
    handshake: Option<Handshake>,
    cached_refs: Option<(bool, RefList)>,
    walker: Option<DumbWalker>,
    progress_enabled: bool,
}

impl SmartTransport {
    pub fn new(url: GitUrl, options: TransportOptions) -> Self {
        Self {
            url,
            options,
            conn: None,
            service: None,
            caps: Capabilities::default(),
            version: ProtocolVersion::V0,
            handshake: None,
            cached_refs: None,
            walker: None,
            progress_enabled: true,
        }
    }

    /// Run the smart protocol over an already-established connection
    /// (tunnels from `stateless-connect` helpers, tests).
    pub fn with_connection(
        url: GitUrl,
        conn: Box<dyn Connection>,
        options: TransportOptions,
    ) -> Self {
        let mut this = Self::new(url, options);
        this.conn = Some(conn);
        this
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            protocol: self.options.protocol,
            remote_exec: None,
            gzip: self.options.gzip,
        }
    }

    /// Open the connection for `service` and classify the server.
    fn ensure_handshake(&mut self, service: Service) -> Result<(), ProtocolError> {
        if let Some(current) = self.service {
            if current != service {
                return Err(ProtocolError::Protocol(format!(
                    "transport already connected for {}",
                    current.as_str()
                )));
            }
            return Ok(());
        }

        if self.conn.is_none() {
            let conn: Box<dyn Connection> = match self.url.scheme {
                Scheme::Http | Scheme::Https => {
                    let http = HttpConnection::open(&self.url, service, &self.connect_options())?;
                    if http.kind() == ServerKind::Dumb {
                        log::debug!("{}: dumb server, using the object walker", self.url);
                        self.walker = Some(DumbWalker::new(http));
                        self.service = Some(service);
                        return Ok(());
                    }
                    Box::new(http)
                }
                _ => git_transport::connect(&self.url, service, &self.connect_options())?,
            };
            self.conn = Some(conn);
        }
        self.service = Some(service);

        let conn = self.conn.as_mut().expect("just connected");
        let mut reader = PktLineReader::new(conn.reader());

        // Classify by the first advertisement line
        let mut lines: Vec<Vec<u8>> = Vec::new();
        let mut saw_service_header = false;
        loop {
            match reader.peek()? {
                PktKind::Data => {
                    let data = match reader.read_pkt()? {
                        crate::pktline::PktLine::Data(data) => data,
                        _ => unreachable!("peeked data"),
                    };
                    if data.starts_with(b"#") {
                        saw_service_header = true;
                        continue;
                    }
                    lines.push(data);
                }
                PktKind::Flush => {
                    reader.read_pkt()?;
                    if saw_service_header && lines.is_empty() {
                        // the flush behind "# service=..."
                        saw_service_header = false;
                        continue;
                    }
                    break;
                }
                _ => break,
            }
        }

        let is_v2 = lines
            .first()
            .map(|l| l.as_slice() == b"version 2" || l.as_slice() == b"version 2\n")
            .unwrap_or(false);

        if is_v2 {
            self.caps = Capabilities::parse_v2(&lines);
            self.version = ProtocolVersion::V2;
            self.handshake = Some(Handshake::V2);
        } else {
            let (refs, caps) = v1::parse_advertisement_lines(&lines)?;
            let version = if lines.first().map(|l| l.as_slice() == b"version 1\n"
                || l.as_slice() == b"version 1").unwrap_or(false)
            {
                ProtocolVersion::V1
            } else {
                ProtocolVersion::V0
            };
            self.caps = caps;
            self.version = version;
            self.handshake = Some(Handshake::V0 { refs });
        }

        self.caps.verify_object_format(self.options.algo, self.version)?;
        Ok(())
    }

    fn conn_mut(&mut self) -> Result<&mut (dyn Connection + '_), ProtocolError> {
        match self.conn.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(ProtocolError::Protocol("transport not connected".into())),
        }
    }
}

impl Transport for SmartTransport {
    fn set_option(&mut self, name: &str, value: &str) -> OptionOutcome {
        match name {
            "progress" => match value {
                "true" => {
                    self.progress_enabled = true;
                    OptionOutcome::Applied
                }
                "false" => {
                    self.progress_enabled = false;
                    OptionOutcome::Applied
                }
                _ => OptionOutcome::Invalid,
            },
            "verbosity" => match value.parse::<i32>() {
                Ok(_) => OptionOutcome::Applied,
                Err(_) => OptionOutcome::Invalid,
            },
            _ => OptionOutcome::Unknown,
        }
    }

    fn get_refs(&mut self, for_push: bool, ls: &LsRefsOptions) -> Result<RefList, ProtocolError> {
        if let Some((cached_dir, ref refs)) = self.cached_refs {
            if cached_dir == for_push {
                return Ok(refs.clone());
            }
            return Err(ProtocolError::Protocol(
                "refs already fetched for the other direction".into(),
            ));
        }

        let service = if for_push {
            Service::ReceivePack
        } else {
            Service::UploadPack
        };
        self.ensure_handshake(service)?;

        if let Some(ref mut walker) = self.walker {
            let refs = walker.refs()?;
            self.cached_refs = Some((for_push, refs.clone()));
            return Ok(refs);
        }

        let refs = match self.handshake {
            Some(Handshake::V0 { ref refs }) => refs.clone(),
            Some(Handshake::V2) => {
                let caps = self.caps.clone();
                let conn = self.conn_mut()?;
                v2::ls_refs(conn, &caps, ls)?
            }
            None => unreachable!("handshake established above"),
        };

        self.cached_refs = Some((for_push, refs.clone()));
        Ok(refs)
    }

    fn fetch(
        &mut self,
        store: &mut dyn ObjectStore,
        refs: &RefList,
        wants: &[usize],
        params: &FetchParams,
        progress: &mut dyn Write,
    ) -> Result<TransportFetch, ProtocolError> {
        self.ensure_handshake(Service::UploadPack)?;

        // Distinct ids, advertisement order; the same tip can back
        // several refs
        let mut want_ids: Vec<ObjectId> = Vec::new();
        for &idx in wants {
            let id = refs.get(idx).old_id;
            if !id.is_null() && !want_ids.contains(&id) {
                want_ids.push(id);
            }
        }

        if let Some(ref mut walker) = self.walker {
            return walker.fetch(store, &want_ids, params);
        }

        let mut negotiator: Box<dyn Negotiator> = if params.refetch {
            Box::new(NoopNegotiator::new())
        } else {
            Box::new(DefaultNegotiator::new())
        };
        for id in &params.known_common {
            negotiator.ack(store, *id);
        }
        for tip in &params.negotiation_tips {
            negotiator.add_tip(store, *tip);
        }

        let args = v1::FetchArgs {
            wants: want_ids,
            shallow: params.shallow.clone(),
            depth: params.depth,
            deepen_since: params.deepen_since,
            deepen_not: params.deepen_not.clone(),
            deepen_relative: params.deepen_relative,
            filter: params.filter.clone(),
            no_progress: params.no_progress || !self.progress_enabled,
        };

        let caps = self.caps.clone();
        let version = self.version;
        let conn = self.conn_mut()?;

        let mut pack = Vec::new();
        let outcome = match version {
            ProtocolVersion::V2 => {
                let (outcome, _extras) = v2::fetch_exchange(
                    conn,
                    &caps,
                    &args,
                    negotiator.as_mut(),
                    store,
                    &mut pack,
                    progress,
                )?;
                outcome
            }
            _ => v1::fetch_exchange(
                conn,
                &caps,
                &args,
                negotiator.as_mut(),
                store,
                &mut pack,
                progress,
            )?,
        };

        let mut result = TransportFetch {
            shallow_updates: outcome.shallow_updates,
            ..Default::default()
        };

        if !pack.is_empty() {
            let ingest = store.ingest_pack(
                &mut &pack[..],
                &IngestOptions {
                    keep: params.keep_pack,
                    thin: caps.supports("thin-pack") || version == ProtocolVersion::V2,
                    fsck: params.fsck,
                },
            )?;
            result.pack_lockfiles.extend(ingest.lockfile);
            result.pre_verified = ingest.self_contained_and_connected;
            result.objects = ingest.objects;
        }

        Ok(result)
    }

    fn push(
        &mut self,
        store: &dyn ObjectStore,
        updates: &mut RefList,
        params: &PushParams,
        signer: Option<&dyn Signer>,
        progress: &mut dyn Write,
    ) -> Result<(), ProtocolError> {
        self.ensure_handshake(Service::ReceivePack)?;

        if self.walker.is_some() {
            return Err(ProtocolError::Unsupported(
                "dumb HTTP transport cannot push".into(),
            ));
        }
        if self.version == ProtocolVersion::V2 {
            // Mirrors the original client: v2 is fetch/ls-refs only
            return Err(ProtocolError::Unsupported(
                "protocol v2 does not support push".into(),
            ));
        }

        let caps = self.caps.clone();
        let conn = self.conn_mut()?;
        push::send_pack(conn, &caps, store, updates, params, signer, progress)
    }

    fn bundle_uris(&mut self) -> Result<Vec<String>, ProtocolError> {
        self.ensure_handshake(Service::UploadPack)?;
        if self.version != ProtocolVersion::V2 || !self.caps.supports("bundle-uri") {
            return Err(ProtocolError::Unsupported(
                "server does not advertise bundle-uri".into(),
            ));
        }

        let conn = self.conn_mut()?;
        {
            let mut writer = crate::pktline::PktLineWriter::new(conn.writer());
            writer.write_text("command=bundle-uri")?;
            writer.write_delimiter()?;
            writer.write_flush()?;
            writer.flush()?;
        }
        conn.dispatch()?;

        let mut uris = Vec::new();
        let mut reader = PktLineReader::new(conn.reader()).chomp_newline(true);
        loop {
            match reader.read_item()? {
                None
                | Some(crate::pktline::PktLine::Flush)
                | Some(crate::pktline::PktLine::ResponseEnd) => break,
                Some(crate::pktline::PktLine::Delimiter) => continue,
                Some(crate::pktline::PktLine::Data(line)) => {
                    uris.push(String::from_utf8_lossy(&line).into_owned());
                }
            }
        }
        Ok(uris)
    }

    fn connect(&mut self, service: Service) -> Result<&mut dyn Connection, ProtocolError> {
        if self.conn.is_none() {
            let conn = git_transport::connect(&self.url, service, &self.connect_options())?;
            self.conn = Some(conn);
            self.service = Some(service);
        }
        self.conn_mut()
    }

    fn disconnect(mut self: Box<Self>) -> Result<(), ProtocolError> {
        if let Some(conn) = self.conn.take() {
            conn.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_options_are_reported_not_fatal() {
        let url = GitUrl::parse("git://example.com/repo.git").unwrap();
        let mut transport = SmartTransport::new(url, TransportOptions::default());

        assert_eq!(
            transport.set_option("progress", "false"),
            OptionOutcome::Applied
        );
        assert_eq!(
            transport.set_option("progress", "maybe"),
            OptionOutcome::Invalid
        );
        assert_eq!(
            transport.set_option("no-such-option", "1"),
            OptionOutcome::Unknown
        );
    }

    #[test]
    fn open_selects_bundle_for_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.bundle");
        std::fs::write(
            &path,
            b"# v2 git bundle\n95d09f2b10159347eece71399a7e2e907ea3df4f refs/heads/main\n\nTPCK\n",
        )
        .unwrap();

        let url = GitUrl::parse(path.to_str().unwrap()).unwrap();
        let mut transport = open(&url, &TransportOptions::default()).unwrap();
        let refs = transport.get_refs(false, &LsRefsOptions::default()).unwrap();
        assert_eq!(refs.len(), 1);
    }
}
