//! In-memory test doubles for the store traits and the byte-stream
//! connection, used by this crate's test suites and by downstream
//! integration harnesses.
//!
//! Objects are synthetic: ids are derived from labels, and packs travel
//! in a line-oriented stand-in format (`TPCK` header, one object per
//! line) so driver logic can be exercised without a real object codec.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{Cursor, Read, Write};

use bstr::{BStr, BString, ByteSlice};
use git_hash::ObjectId;
use git_transport::{Connection, TransportError};

use crate::store::{
    CommitInfo, IngestOptions, IngestOutcome, ObjectStore, RefStore, Signer, StoreError,
};

/// Derive a stable synthetic id from a label.
pub fn oid(label: &[u8]) -> ObjectId {
    let mut bytes = [0u8; 20];
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in label {
        h ^= b as u64;
        h = h.wrapping_mul(0x1000_0000_01b3);
    }
    for chunk in bytes.chunks_mut(8) {
        h = h.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(31);
        let src = h.to_be_bytes();
        chunk.copy_from_slice(&src[..chunk.len()]);
    }
    ObjectId::Sha1(bytes)
}

#[derive(Debug, Clone)]
enum MemObject {
    Commit { parents: Vec<ObjectId>, timestamp: i64 },
    Tree { children: Vec<ObjectId> },
    Blob,
    Tag { target: ObjectId },
}

/// An in-memory [`ObjectStore`] whose packs use the `TPCK` text format.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: HashMap<ObjectId, MemObject>,
    /// Ingest options observed on the last `ingest_pack` call.
    pub last_ingest: Option<IngestOptions>,
    /// Mark the next ingested pack as self-contained-and-connected.
    pub pre_verified_packs: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_commit(&mut self, label: &[u8], parents: &[ObjectId], timestamp: i64) -> ObjectId {
        let id = oid(label);
        self.objects.insert(
            id,
            MemObject::Commit {
                parents: parents.to_vec(),
                timestamp,
            },
        );
        id
    }

    pub fn add_blob(&mut self, label: &[u8]) -> ObjectId {
        let id = oid(label);
        self.objects.insert(id, MemObject::Blob);
        id
    }

    pub fn add_tree(&mut self, label: &[u8], children: &[ObjectId]) -> ObjectId {
        let id = oid(label);
        self.objects.insert(
            id,
            MemObject::Tree {
                children: children.to_vec(),
            },
        );
        id
    }

    pub fn add_tag(&mut self, label: &[u8], target: ObjectId) -> ObjectId {
        let id = oid(label);
        self.objects.insert(id, MemObject::Tag { target });
        id
    }

    pub fn remove(&mut self, id: &ObjectId) {
        self.objects.remove(id);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Serialize the closure of `include` minus the closure of
    /// `exclude` in the text pack format.
    pub fn pack_closure(&self, include: &[ObjectId], exclude: &[ObjectId]) -> Vec<u8> {
        let excluded = self.closure(exclude);
        let mut out = Vec::from(&b"TPCK\n"[..]);
        let mut seen = HashSet::new();
        let mut stack: Vec<ObjectId> = include.to_vec();
        while let Some(id) = stack.pop() {
            if excluded.contains(&id) || !seen.insert(id) {
                continue;
            }
            if let Some(obj) = self.objects.get(&id) {
                out.extend_from_slice(serialize_object(&id, obj).as_bytes());
                for child in object_links(obj) {
                    stack.push(child);
                }
            }
        }
        out
    }

    fn closure(&self, tips: &[ObjectId]) -> HashSet<ObjectId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<ObjectId> = tips.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(obj) = self.objects.get(&id) {
                stack.extend(object_links(obj));
            }
        }
        seen
    }

    fn ingest_line(&mut self, line: &str) -> Result<ObjectId, StoreError> {
        let mut fields = line.split_whitespace();
        let kind = fields
            .next()
            .ok_or_else(|| StoreError::Pack("empty object line".into()))?;
        let id: ObjectId = fields
            .next()
            .ok_or_else(|| StoreError::Pack(format!("missing id: {}", line)))?
            .parse()
            .map_err(|e| StoreError::Pack(format!("bad id in pack: {}", e)))?;

        let obj = match kind {
            "commit" => {
                let timestamp: i64 = fields
                    .next()
                    .ok_or_else(|| StoreError::Pack(format!("missing timestamp: {}", line)))?
                    .parse()
                    .map_err(|_| StoreError::Pack(format!("bad timestamp: {}", line)))?;
                let parents = fields
                    .map(|f| {
                        f.parse()
                            .map_err(|e| StoreError::Pack(format!("bad parent id: {}", e)))
                    })
                    .collect::<Result<Vec<ObjectId>, _>>()?;
                MemObject::Commit { parents, timestamp }
            }
            "tree" => {
                let children = fields
                    .map(|f| {
                        f.parse()
                            .map_err(|e| StoreError::Pack(format!("bad tree entry: {}", e)))
                    })
                    .collect::<Result<Vec<ObjectId>, _>>()?;
                MemObject::Tree { children }
            }
            "blob" => MemObject::Blob,
            "tag" => {
                let target = fields
                    .next()
                    .ok_or_else(|| StoreError::Pack(format!("missing tag target: {}", line)))?
                    .parse()
                    .map_err(|e| StoreError::Pack(format!("bad tag target: {}", e)))?;
                MemObject::Tag { target }
            }
            other => return Err(StoreError::Pack(format!("unknown object kind: {}", other))),
        };
        self.objects.insert(id, obj);
        Ok(id)
    }
}

fn serialize_object(id: &ObjectId, obj: &MemObject) -> String {
    match obj {
        MemObject::Commit { parents, timestamp } => {
            let mut line = format!("commit {} {}", id, timestamp);
            for p in parents {
                line.push(' ');
                line.push_str(&p.to_hex());
            }
            line.push('\n');
            line
        }
        MemObject::Tree { children } => {
            let mut line = format!("tree {}", id);
            for c in children {
                line.push(' ');
                line.push_str(&c.to_hex());
            }
            line.push('\n');
            line
        }
        MemObject::Blob => format!("blob {}\n", id),
        MemObject::Tag { target } => format!("tag {} {}\n", id, target),
    }
}

fn object_links(obj: &MemObject) -> Vec<ObjectId> {
    match obj {
        MemObject::Commit { parents, .. } => parents.clone(),
        MemObject::Tree { children } => children.clone(),
        MemObject::Blob => Vec::new(),
        MemObject::Tag { target } => vec![*target],
    }
}

impl ObjectStore for MemoryStore {
    fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    fn commit_info(&self, id: &ObjectId) -> Result<Option<CommitInfo>, StoreError> {
        Ok(match self.objects.get(id) {
            Some(MemObject::Commit { parents, timestamp }) => Some(CommitInfo {
                parents: parents.clone(),
                timestamp: *timestamp,
            }),
            _ => None,
        })
    }

    fn referenced(&self, id: &ObjectId) -> Result<Vec<ObjectId>, StoreError> {
        match self.objects.get(id) {
            Some(obj) => Ok(object_links(obj)),
            None => Err(StoreError::Missing(*id)),
        }
    }

    fn ingest_pack(
        &mut self,
        pack: &mut dyn Read,
        options: &IngestOptions,
    ) -> Result<IngestOutcome, StoreError> {
        let mut bytes = Vec::new();
        pack.read_to_end(&mut bytes)?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| StoreError::Pack("binary garbage in test pack".into()))?;

        let mut lines = text.lines();
        match lines.next() {
            Some("TPCK") => {}
            other => return Err(StoreError::Pack(format!("bad pack header: {:?}", other))),
        }

        let mut objects = 0;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            self.ingest_line(line)?;
            objects += 1;
        }

        self.last_ingest = Some(options.clone());
        Ok(IngestOutcome {
            lockfile: None,
            self_contained_and_connected: self.pre_verified_packs,
            objects,
        })
    }

    fn ingest_loose(&mut self, bytes: &[u8]) -> Result<ObjectId, StoreError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| StoreError::Pack("binary garbage in loose object".into()))?;
        self.ingest_line(text.trim_end())
    }

    fn build_pack(
        &self,
        include: &[ObjectId],
        exclude: &[ObjectId],
        _thin: bool,
    ) -> Result<Vec<u8>, StoreError> {
        Ok(self.pack_closure(include, exclude))
    }
}

/// An in-memory [`RefStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRefStore {
    refs: BTreeMap<BString, ObjectId>,
    symbolic: BTreeMap<BString, BString>,
}

impl MemoryRefStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ref(mut self, name: &str, id: ObjectId) -> Self {
        self.refs.insert(name.into(), id);
        self
    }

    pub fn symbolic_target(&self, name: &str) -> Option<&BString> {
        self.symbolic.get(name.as_bytes().as_bstr())
    }
}

impl RefStore for MemoryRefStore {
    fn iter_refs(&self) -> Vec<(BString, ObjectId)> {
        self.refs
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect()
    }

    fn resolve(&self, name: &BStr) -> Option<ObjectId> {
        self.refs.get(name).copied()
    }

    fn update(&mut self, name: &BStr, id: ObjectId) -> Result<(), StoreError> {
        self.refs.insert(name.into(), id);
        Ok(())
    }

    fn delete(&mut self, name: &BStr) -> Result<(), StoreError> {
        self.refs.remove(name);
        Ok(())
    }

    fn set_symbolic(&mut self, name: &BStr, target: &BStr) -> Result<(), StoreError> {
        self.symbolic.insert(name.into(), target.into());
        Ok(())
    }
}

/// A signer producing a recognizable fake signature.
pub struct FakeSigner;

impl Signer for FakeSigner {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::from(&b"-----BEGIN FAKE SIGNATURE-----\n"[..]);
        out.extend_from_slice(format!("{} bytes signed\n", payload.len()).as_bytes());
        out.extend_from_slice(b"-----END FAKE SIGNATURE-----\n");
        Ok(out)
    }
}

/// A scripted [`Connection`].
///
/// `stream` mode serves one pre-recorded server byte stream (stateful
/// transports); `stateless` mode serves one response per
/// [`Connection::dispatch`], recording each request separately.
pub struct ScriptedConnection {
    stateless: bool,
    responses: VecDeque<Vec<u8>>,
    current: Cursor<Vec<u8>>,
    outgoing: Vec<u8>,
    /// One entry per dispatched request.
    pub requests: Vec<Vec<u8>>,
}

impl ScriptedConnection {
    /// A stateful connection serving `server_bytes` as one stream.
    pub fn stream(server_bytes: Vec<u8>) -> Self {
        Self {
            stateless: false,
            responses: VecDeque::new(),
            current: Cursor::new(server_bytes),
            outgoing: Vec::new(),
            requests: Vec::new(),
        }
    }

    /// A stateless connection serving one response per dispatch. The
    /// first entry is the discovery response, pre-staged for reading.
    pub fn stateless(mut responses: Vec<Vec<u8>>) -> Self {
        let first = if responses.is_empty() {
            Vec::new()
        } else {
            responses.remove(0)
        };
        Self {
            stateless: true,
            responses: responses.into(),
            current: Cursor::new(first),
            outgoing: Vec::new(),
            requests: Vec::new(),
        }
    }
}

impl Connection for ScriptedConnection {
    fn reader(&mut self) -> &mut dyn Read {
        &mut self.current
    }

    fn writer(&mut self) -> &mut dyn Write {
        &mut self.outgoing
    }

    fn dispatch(&mut self) -> Result<(), TransportError> {
        self.requests.push(std::mem::take(&mut self.outgoing));
        if self.stateless {
            let next = self.responses.pop_front().unwrap_or_default();
            self.current = Cursor::new(next);
        }
        Ok(())
    }

    fn is_stateless(&self) -> bool {
        self.stateless
    }

    fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}
