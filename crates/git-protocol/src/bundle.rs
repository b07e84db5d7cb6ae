//! Bundle files: offline object transfer.
//!
//! A bundle opens with a signature line, optional v3 capability lines,
//! prerequisite ids (`-<id>`), and a ref list shaped like a v0
//! advertisement; a blank line separates the header from the pack.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use bstr::ByteSlice;
use git_hash::{HashAlgorithm, ObjectId};

use crate::refs::{Ref, RefList};
use crate::store::{IngestOptions, ObjectStore, Signer};
use crate::transport::{
    FetchParams, OptionOutcome, PushParams, Transport, TransportFetch,
};
use crate::v2::LsRefsOptions;
use crate::ProtocolError;

const BUNDLE_V2_SIGNATURE: &str = "# v2 git bundle";
const BUNDLE_V3_SIGNATURE: &str = "# v3 git bundle";

/// Parsed bundle file.
#[derive(Debug)]
pub struct Bundle {
    /// Header version (2 or 3).
    pub version: u32,
    /// The bundle's object format (v3 capability; v2 implies SHA-1).
    pub object_format: HashAlgorithm,
    /// Ids the receiver must already have, with optional comments.
    pub prerequisites: Vec<(ObjectId, Option<String>)>,
    /// Refs carried by the bundle.
    pub refs: Vec<(ObjectId, String)>,
    /// The pack, verbatim.
    pub pack_data: Vec<u8>,
}

/// Read a bundle file from disk.
pub fn read_bundle(path: &Path) -> Result<Bundle, ProtocolError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    parse_bundle(&mut reader)
}

/// Parse a bundle from a buffered reader.
pub fn parse_bundle<R: Read>(reader: &mut BufReader<R>) -> Result<Bundle, ProtocolError> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let signature = line.trim_end();

    let version = if signature == BUNDLE_V2_SIGNATURE {
        2
    } else if signature == BUNDLE_V3_SIGNATURE {
        3
    } else {
        return Err(ProtocolError::Protocol(format!(
            "invalid bundle signature: {}",
            signature
        )));
    };

    let mut object_format = HashAlgorithm::Sha1;
    let mut prerequisites = Vec::new();
    let mut refs = Vec::new();

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }

        if let Some(cap) = line.strip_prefix('@') {
            // v3 capability lines precede everything else
            if version < 3 {
                return Err(ProtocolError::Protocol(
                    "capability line in a v2 bundle".into(),
                ));
            }
            if let Some(name) = cap.strip_prefix("object-format=") {
                object_format = HashAlgorithm::from_name(name).ok_or_else(|| {
                    ProtocolError::Protocol(format!("unknown bundle object format: {}", name))
                })?;
            } else if cap.starts_with("filter=") {
                // recorded but not interpreted here
            } else {
                return Err(ProtocolError::Protocol(format!(
                    "unknown bundle capability: {}",
                    cap
                )));
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix('-') {
            let mut parts = rest.splitn(2, ' ');
            let id = object_format
                .parse_hex(parts.next().unwrap_or_default())
                .map_err(|e| {
                    ProtocolError::Protocol(format!("invalid bundle prerequisite: {}", e))
                })?;
            prerequisites.push((id, parts.next().map(str::to_string)));
        } else {
            let mut parts = line.splitn(2, ' ');
            let id = object_format
                .parse_hex(parts.next().unwrap_or_default())
                .map_err(|e| ProtocolError::Protocol(format!("invalid bundle ref id: {}", e)))?;
            let name = parts.next().ok_or_else(|| {
                ProtocolError::Protocol(format!("bundle ref line without a name: {}", line))
            })?;
            refs.push((id, name.to_string()));
        }
    }

    let mut pack_data = Vec::new();
    reader.read_to_end(&mut pack_data)?;

    Ok(Bundle {
        version,
        object_format,
        prerequisites,
        refs,
        pack_data,
    })
}

/// Write a bundle. A non-SHA-1 object format forces the v3 header.
pub fn write_bundle<W: Write>(
    writer: &mut W,
    object_format: HashAlgorithm,
    refs: &[(ObjectId, &str)],
    prerequisites: &[(ObjectId, Option<&str>)],
    pack_data: &[u8],
) -> Result<(), ProtocolError> {
    if object_format == HashAlgorithm::Sha1 {
        writeln!(writer, "{}", BUNDLE_V2_SIGNATURE)?;
    } else {
        writeln!(writer, "{}", BUNDLE_V3_SIGNATURE)?;
        writeln!(writer, "@object-format={}", object_format.name())?;
    }

    for (id, comment) in prerequisites {
        match comment {
            Some(c) => writeln!(writer, "-{} {}", id, c)?,
            None => writeln!(writer, "-{}", id)?,
        }
    }
    for (id, name) in refs {
        writeln!(writer, "{} {}", id, name)?;
    }
    writeln!(writer)?;
    writer.write_all(pack_data)?;
    Ok(())
}

/// Transport over a local bundle file: `get_refs` serves the header,
/// `fetch` checks prerequisites and feeds the pack to the store. Push
/// is unsupported.
pub struct BundleTransport {
    bundle: Bundle,
}

impl BundleTransport {
    pub fn open(path: &Path) -> Result<Self, ProtocolError> {
        Ok(Self {
            bundle: read_bundle(path)?,
        })
    }

    pub fn from_bundle(bundle: Bundle) -> Self {
        Self { bundle }
    }
}

impl Transport for BundleTransport {
    fn set_option(&mut self, _name: &str, _value: &str) -> OptionOutcome {
        OptionOutcome::Unknown
    }

    fn get_refs(&mut self, for_push: bool, _ls: &LsRefsOptions) -> Result<RefList, ProtocolError> {
        if for_push {
            return Err(ProtocolError::Unsupported(
                "bundles cannot be pushed to".into(),
            ));
        }
        let mut list = RefList::new();
        for (id, name) in &self.bundle.refs {
            list.push(Ref::new(name.as_bytes().as_bstr(), *id));
        }
        Ok(list)
    }

    fn fetch(
        &mut self,
        store: &mut dyn ObjectStore,
        _refs: &RefList,
        _wants: &[usize],
        params: &FetchParams,
        _progress: &mut dyn Write,
    ) -> Result<TransportFetch, ProtocolError> {
        for (id, comment) in &self.bundle.prerequisites {
            if !store.contains(id) {
                return Err(ProtocolError::Protocol(format!(
                    "bundle requires object {}{}",
                    id,
                    comment
                        .as_deref()
                        .map(|c| format!(" ({})", c))
                        .unwrap_or_default()
                )));
            }
        }

        let ingest = store.ingest_pack(
            &mut &self.bundle.pack_data[..],
            &IngestOptions {
                keep: params.keep_pack,
                thin: false,
                fsck: params.fsck,
            },
        )?;

        Ok(TransportFetch {
            shallow_updates: Vec::new(),
            pack_lockfiles: ingest.lockfile.into_iter().collect(),
            pre_verified: ingest.self_contained_and_connected,
            objects: ingest.objects,
        })
    }

    fn push(
        &mut self,
        _store: &dyn ObjectStore,
        _updates: &mut RefList,
        _params: &PushParams,
        _signer: Option<&dyn Signer>,
        _progress: &mut dyn Write,
    ) -> Result<(), ProtocolError> {
        Err(ProtocolError::Unsupported(
            "bundles cannot be pushed to".into(),
        ))
    }

    fn disconnect(self: Box<Self>) -> Result<(), ProtocolError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_oid(byte: u8) -> ObjectId {
        ObjectId::Sha1([byte; 20])
    }

    #[test]
    fn roundtrip_v2_bundle() {
        let tip = sample_oid(0x11);
        let prereq = sample_oid(0x22);

        let mut buf = Vec::new();
        write_bundle(
            &mut buf,
            HashAlgorithm::Sha1,
            &[(tip, "refs/heads/main")],
            &[(prereq, Some("needed commit"))],
            b"TPCK\n",
        )
        .unwrap();

        let bundle = parse_bundle(&mut BufReader::new(Cursor::new(buf))).unwrap();
        assert_eq!(bundle.version, 2);
        assert_eq!(bundle.object_format, HashAlgorithm::Sha1);
        assert_eq!(bundle.refs, vec![(tip, "refs/heads/main".to_string())]);
        assert_eq!(
            bundle.prerequisites,
            vec![(prereq, Some("needed commit".to_string()))]
        );
        assert_eq!(bundle.pack_data, b"TPCK\n");
    }

    #[test]
    fn v3_bundle_carries_object_format() {
        let tip = ObjectId::Sha256([0x33; 32]);

        let mut buf = Vec::new();
        write_bundle(
            &mut buf,
            HashAlgorithm::Sha256,
            &[(tip, "refs/heads/main")],
            &[],
            b"TPCK\n",
        )
        .unwrap();

        let bundle = parse_bundle(&mut BufReader::new(Cursor::new(buf))).unwrap();
        assert_eq!(bundle.version, 3);
        assert_eq!(bundle.object_format, HashAlgorithm::Sha256);
        assert_eq!(bundle.refs[0].0, tip);
    }

    #[test]
    fn rejects_unknown_signature() {
        let data = b"# v9 git bundle\n\n";
        assert!(parse_bundle(&mut BufReader::new(Cursor::new(&data[..]))).is_err());
    }

    #[test]
    fn rejects_capability_in_v2() {
        let data = b"# v2 git bundle\n@object-format=sha256\n\n";
        assert!(parse_bundle(&mut BufReader::new(Cursor::new(&data[..]))).is_err());
    }

    #[test]
    fn transport_fetch_requires_prerequisites() {
        use crate::testing::MemoryStore;

        let mut src = MemoryStore::new();
        let base = src.add_commit(b"base", &[], 100);
        let tip = src.add_commit(b"tip", &[base], 200);
        let pack = src.pack_closure(&[tip], &[base]);

        let bundle = Bundle {
            version: 2,
            object_format: HashAlgorithm::Sha1,
            prerequisites: vec![(base, None)],
            refs: vec![(tip, "refs/heads/main".to_string())],
            pack_data: pack,
        };

        // Receiver without the prerequisite: refused
        let mut transport = BundleTransport::from_bundle(bundle);
        let refs = transport.get_refs(false, &LsRefsOptions::default()).unwrap();
        let wants = refs.indices();
        let mut empty = MemoryStore::new();
        let err = transport
            .fetch(
                &mut empty,
                &refs,
                &wants,
                &FetchParams::default(),
                &mut Vec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Protocol(_)));

        // Receiver with the prerequisite: pack lands
        let mut ready = MemoryStore::new();
        ready.add_commit(b"base", &[], 100);
        let outcome = transport
            .fetch(
                &mut ready,
                &refs,
                &wants,
                &FetchParams::default(),
                &mut Vec::new(),
            )
            .unwrap();
        assert_eq!(outcome.objects, 1);
        assert!(ready.contains(&tip));
    }

    #[test]
    fn transport_serves_header_refs() {
        let tip = sample_oid(0x44);
        let bundle = Bundle {
            version: 2,
            object_format: HashAlgorithm::Sha1,
            prerequisites: Vec::new(),
            refs: vec![(tip, "refs/heads/main".to_string())],
            pack_data: Vec::new(),
        };
        let mut transport = BundleTransport::from_bundle(bundle);
        let refs = transport.get_refs(false, &LsRefsOptions::default()).unwrap();
        assert_eq!(refs.len(), 1);
        assert!(transport.get_refs(true, &LsRefsOptions::default()).is_err());
    }
}
