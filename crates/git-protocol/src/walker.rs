//! Dumb-HTTP object walker.
//!
//! A dumb server offers no negotiation: `info/refs` is a flat listing,
//! and objects are fetched one by one under `objects/<xx>/<rest>`,
//! chasing references until the closure is complete. When the server
//! publishes `objects/info/packs`, whole packs are preferred over loose
//! objects. No push, no shallow.

use std::collections::{HashSet, VecDeque};

use bstr::ByteSlice;
use git_hash::ObjectId;
use git_transport::http::HttpConnection;
use git_utils::Progress;

use crate::refs::{Ref, RefList};
use crate::store::{IngestOptions, ObjectStore};
use crate::transport::{FetchParams, TransportFetch};
use crate::ProtocolError;

pub struct DumbWalker {
    http: HttpConnection,
    /// Pack names already pulled this session.
    fetched_packs: HashSet<String>,
    /// The server's pack listing, loaded on first need.
    pack_index: Option<Vec<String>>,
}

impl DumbWalker {
    pub fn new(http: HttpConnection) -> Self {
        Self {
            http,
            fetched_packs: HashSet::new(),
            pack_index: None,
        }
    }

    /// Parse the `info/refs` listing: `<hex>\t<name>` per line, with
    /// `^{}` entries folding into the preceding tag.
    pub fn refs(&mut self) -> Result<RefList, ProtocolError> {
        let body = self.http.info_refs().to_vec();
        let mut list = RefList::new();

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (hex, name) = split_info_refs_line(line)?;
            let id: ObjectId = std::str::from_utf8(hex)
                .ok()
                .and_then(|h| h.parse().ok())
                .ok_or_else(|| {
                    ProtocolError::Protocol(format!(
                        "invalid id in info/refs: {}",
                        String::from_utf8_lossy(line)
                    ))
                })?;

            let name = name.as_bstr();
            if name.ends_with(b"^{}") {
                list.push_peeled(name, id);
            } else {
                list.push(Ref::new(name, id));
            }
        }
        Ok(list)
    }

    /// Walk the object graph from `wants`, downloading whatever is
    /// missing.
    pub fn fetch(
        &mut self,
        store: &mut dyn ObjectStore,
        wants: &[ObjectId],
        params: &FetchParams,
    ) -> Result<TransportFetch, ProtocolError> {
        if params.depth.is_some() || params.deepen_since.is_some() || !params.deepen_not.is_empty()
        {
            return Err(ProtocolError::Unsupported(
                "dumb HTTP cannot create shallow clones".into(),
            ));
        }
        if let Some(ref filter) = params.filter {
            log::warn!("dumb HTTP ignores object filters, dropping {}", filter);
        }

        let mut progress = Progress::new("Walking objects", None);
        let mut outcome = TransportFetch::default();
        let mut seen: HashSet<ObjectId> = HashSet::new();
        let mut queue: VecDeque<ObjectId> = wants.iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if id.is_null() || !seen.insert(id) {
                continue;
            }
            if !store.contains(&id) {
                self.fetch_object(store, &id, params)?;
                outcome.objects += 1;
                progress.tick();
            }
            for link in store.referenced(&id)? {
                if !seen.contains(&link) {
                    queue.push_back(link);
                }
            }
        }

        progress.finish();
        // The walk itself proved connectivity
        outcome.pre_verified = true;
        Ok(outcome)
    }

    /// Bring one object into the store: loose first, then any pack that
    /// might contain it.
    fn fetch_object(
        &mut self,
        store: &mut dyn ObjectStore,
        id: &ObjectId,
        params: &FetchParams,
    ) -> Result<(), ProtocolError> {
        let loose_path = format!("objects/{}", id.loose_path());
        match self.http.get_path(&loose_path) {
            Ok(bytes) => {
                let ingested = store.ingest_loose(&bytes)?;
                if ingested != *id {
                    return Err(ProtocolError::Protocol(format!(
                        "object at {} hashed to {}, expected {}",
                        loose_path, ingested, id
                    )));
                }
                return Ok(());
            }
            Err(e) => {
                log::debug!("no loose object for {}: {}", id, e);
            }
        }

        // Fall back to the server's packs
        for pack_name in self.pack_list()? {
            if self.fetched_packs.contains(&pack_name) {
                continue;
            }
            let bytes = self.http.get_path(&format!("objects/pack/{}", pack_name))?;
            store.ingest_pack(
                &mut &bytes[..],
                &IngestOptions {
                    keep: params.keep_pack,
                    thin: false,
                    fsck: params.fsck,
                },
            )?;
            self.fetched_packs.insert(pack_name);
            if store.contains(id) {
                return Ok(());
            }
        }

        Err(ProtocolError::Protocol(format!(
            "dumb server has no source for object {}",
            id
        )))
    }

    /// `objects/info/packs`: `P pack-<hex>.pack` per line.
    fn pack_list(&mut self) -> Result<Vec<String>, ProtocolError> {
        if let Some(ref packs) = self.pack_index {
            return Ok(packs.clone());
        }
        let packs = match self.http.get_path("objects/info/packs") {
            Ok(body) => body
                .lines()
                .filter_map(|line| {
                    let line = line.trim();
                    line.strip_prefix(b"P ")
                        .map(|name| String::from_utf8_lossy(name).into_owned())
                })
                .collect(),
            Err(e) => {
                log::debug!("no pack listing: {}", e);
                Vec::new()
            }
        };
        self.pack_index = Some(packs.clone());
        Ok(packs)
    }
}

fn split_info_refs_line(line: &[u8]) -> Result<(&[u8], &[u8]), ProtocolError> {
    // Tab-separated in info/refs; tolerate a single space
    for sep in [b'\t', b' '] {
        if let Some(pos) = line.iter().position(|&b| b == sep) {
            return Ok((&line[..pos], &line[pos + 1..]));
        }
    }
    Err(ProtocolError::Protocol(format!(
        "malformed info/refs line: {}",
        String::from_utf8_lossy(line)
    )))
}
