//! External remote helpers: `git-remote-<scheme>` subprocesses.
//!
//! The helper speaks a line protocol on its stdio: the caller writes a
//! command, the helper answers with lines terminated by a blank line.
//! Capabilities are declared up front; `list`/`fetch`/`push` are driven
//! from here, and `connect`/`stateless-connect` hand the stdio pair
//! over as a raw bidirectional stream.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use bstr::{BString, ByteSlice};
use git_hash::ObjectId;
use git_transport::{Connection, GitUrl, Service, TransportError};

use crate::refs::{Ref, RefList, RefStatus};
use crate::store::{ObjectStore, Signer};
use crate::transport::{
    FetchParams, OptionOutcome, PushParams, Transport, TransportFetch,
};
use crate::v2::LsRefsOptions;
use crate::ProtocolError;

/// The helper's stdio pair, usable as a raw [`Connection`] once
/// `connect`/`stateless-connect` succeeds.
pub struct HelperIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl HelperIo {
    fn send(&mut self, line: &str) -> Result<(), ProtocolError> {
        log::debug!("helper< {}", line);
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }

    /// Read one line; `None` at EOF. The trailing newline is stripped.
    fn recv(&mut self) -> Result<Option<String>, ProtocolError> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        log::debug!("helper> {}", line);
        Ok(Some(line))
    }

    /// Read lines until a blank line (or EOF).
    fn recv_block(&mut self) -> Result<Vec<String>, ProtocolError> {
        let mut lines = Vec::new();
        while let Some(line) = self.recv()? {
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        Ok(lines)
    }
}

impl Connection for HelperIo {
    fn reader(&mut self) -> &mut dyn Read {
        &mut self.stdout
    }

    fn writer(&mut self) -> &mut dyn Write {
        &mut self.stdin
    }

    fn dispatch(&mut self) -> Result<(), TransportError> {
        self.stdin.flush()?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct HelperTransport {
    child: Child,
    io: HelperIo,
    capabilities: HashSet<String>,
    cached_refs: Option<(bool, RefList)>,
    /// Set once `connect`/`stateless-connect` handed the stream over.
    connected: bool,
}

impl HelperTransport {
    /// Spawn `git-remote-<scheme> <remote-name> <url>` and read its
    /// capability block.
    pub fn spawn(scheme: &str, remote_name: &str, url: &GitUrl) -> Result<Self, ProtocolError> {
        let program = format!("git-remote-{}", scheme);
        let mut child = Command::new(&program)
            .arg(remote_name)
            .arg(url.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                ProtocolError::Transport(TransportError::ConnectionFailed(format!(
                    "cannot run {}: {}",
                    program, e
                )))
            })?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout piped"));
        let mut this = Self {
            child,
            io: HelperIo { stdin, stdout },
            capabilities: HashSet::new(),
            cached_refs: None,
            connected: false,
        };

        this.io.send("capabilities")?;
        for line in this.io.recv_block()? {
            // A leading '*' marks capabilities the caller must know
            let name = line.strip_prefix('*').unwrap_or(&line);
            this.capabilities.insert(name.to_string());
        }
        Ok(this)
    }

    fn supports(&self, cap: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.as_str() == cap || c.starts_with(&format!("{}=", cap)))
    }

    fn require(&self, cap: &str) -> Result<(), ProtocolError> {
        if self.supports(cap) {
            Ok(())
        } else if cap == "fetch" && self.supports("import") {
            Err(ProtocolError::Unsupported(
                "helper only supports import, which is not driven here".into(),
            ))
        } else {
            Err(ProtocolError::Unsupported(format!(
                "helper does not support {}",
                cap
            )))
        }
    }
}

impl Transport for HelperTransport {
    fn set_option(&mut self, name: &str, value: &str) -> OptionOutcome {
        if !self.supports("option") {
            return OptionOutcome::Unknown;
        }
        if self.io.send(&format!("option {} {}", name, value)).is_err() {
            return OptionOutcome::Invalid;
        }
        match self.io.recv() {
            Ok(Some(line)) if line == "ok" => OptionOutcome::Applied,
            Ok(Some(line)) if line == "unsupported" => OptionOutcome::Unknown,
            Ok(Some(line)) if line.starts_with("error") => {
                log::warn!("helper rejected option {}: {}", name, line);
                OptionOutcome::Invalid
            }
            _ => OptionOutcome::Invalid,
        }
    }

    fn get_refs(&mut self, for_push: bool, _ls: &LsRefsOptions) -> Result<RefList, ProtocolError> {
        if let Some((cached_dir, ref refs)) = self.cached_refs {
            if cached_dir == for_push {
                return Ok(refs.clone());
            }
        }

        self.io
            .send(if for_push { "list for-push" } else { "list" })?;

        let mut refs = RefList::new();
        for line in self.io.recv_block()? {
            let mut fields = line.split_whitespace();
            let value = fields.next().ok_or_else(|| {
                ProtocolError::Protocol(format!("empty helper list line: {:?}", line))
            })?;
            let name = fields.next().ok_or_else(|| {
                ProtocolError::Protocol(format!("helper list line without a name: {}", line))
            })?;

            let mut r = if let Some(target) = value.strip_prefix('@') {
                let mut r = Ref::new(name, ObjectId::NULL_SHA1);
                r.symref_target = Some(BString::from(target));
                r
            } else if value == "?" {
                // Value unknown to the helper
                Ref::new(name, ObjectId::NULL_SHA1)
            } else {
                let id: ObjectId = value.parse().map_err(|e| {
                    ProtocolError::Protocol(format!("bad id from helper: {} ({})", value, e))
                })?;
                Ref::new(name, id)
            };

            for attr in fields {
                if attr == "unchanged" {
                    r.status = RefStatus::UpToDate;
                }
            }
            refs.push(r);
        }

        self.cached_refs = Some((for_push, refs.clone()));
        Ok(refs)
    }

    fn fetch(
        &mut self,
        _store: &mut dyn ObjectStore,
        refs: &RefList,
        wants: &[usize],
        _params: &FetchParams,
        _progress: &mut dyn Write,
    ) -> Result<TransportFetch, ProtocolError> {
        self.require("fetch")?;

        let mut any = false;
        for &idx in wants {
            let r = refs.get(idx);
            self.io.send(&format!("fetch {} {}", r.old_id, r.name))?;
            any = true;
        }
        if !any {
            return Ok(TransportFetch::default());
        }
        self.io.send("")?;

        let mut outcome = TransportFetch::default();
        for line in self.io.recv_block()? {
            if let Some(path) = line.strip_prefix("lock ") {
                outcome.pack_lockfiles.push(path.into());
            } else if line == "connectivity-ok" {
                outcome.pre_verified = true;
            } else {
                log::debug!("unrecognized helper fetch response: {}", line);
            }
        }
        Ok(outcome)
    }

    fn push(
        &mut self,
        _store: &dyn ObjectStore,
        updates: &mut RefList,
        _params: &PushParams,
        _signer: Option<&dyn Signer>,
        _progress: &mut dyn Write,
    ) -> Result<(), ProtocolError> {
        self.require("push")?;

        let mut sent = Vec::new();
        for (idx, r) in updates.iter() {
            if r.status != RefStatus::None {
                continue;
            }
            let src = match r.peer {
                Some(peer) => updates.get(peer).name.clone(),
                None => BString::from(""),
            };
            let prefix = if r.force { "+" } else { "" };
            self.io
                .send(&format!("push {}{}:{}", prefix, src, r.name))?;
            sent.push(idx);
        }
        if sent.is_empty() {
            return Ok(());
        }
        for &idx in &sent {
            updates.get_mut(idx).status = RefStatus::ExpectingReport;
        }
        self.io.send("")?;

        for line in self.io.recv_block()? {
            let mut fields = line.splitn(3, ' ');
            match (fields.next(), fields.next()) {
                (Some("ok"), Some(name)) => {
                    if let Some(idx) = find_update(updates, name) {
                        updates.get_mut(idx).status = RefStatus::Ok;
                    }
                }
                (Some("error"), Some(name)) => {
                    if let Some(idx) = find_update(updates, name) {
                        let r = updates.get_mut(idx);
                        r.status = RefStatus::RemoteReject;
                        r.remote_status = fields.next().map(str::to_string);
                    }
                }
                _ => {
                    return Err(ProtocolError::Protocol(format!(
                        "unrecognized helper push response: {}",
                        line
                    )))
                }
            }
        }

        // Anything the helper failed to report is an error
        for idx in updates.indices() {
            if updates.get(idx).status == RefStatus::ExpectingReport {
                let r = updates.get_mut(idx);
                r.status = RefStatus::RemoteReject;
                r.remote_status = Some("helper sent no status".into());
            }
        }
        Ok(())
    }

    fn connect(&mut self, service: Service) -> Result<&mut dyn Connection, ProtocolError> {
        if self.connected {
            return Ok(&mut self.io);
        }

        let command = if self.supports("stateless-connect") {
            "stateless-connect"
        } else if self.supports("connect") {
            "connect"
        } else {
            return Err(ProtocolError::Unsupported(
                "helper supports neither connect nor stateless-connect".into(),
            ));
        };

        self.io.send(&format!("{} {}", command, service.as_str()))?;
        match self.io.recv()? {
            // An empty line means the stream is live
            Some(line) if line.is_empty() => {
                self.connected = true;
                Ok(&mut self.io)
            }
            Some(line) if line == "fallback" => Err(ProtocolError::Unsupported(
                "helper fell back from connect".into(),
            )),
            Some(line) => Err(ProtocolError::Protocol(format!(
                "unexpected connect response: {}",
                line
            ))),
            None => Err(ProtocolError::UnexpectedEof),
        }
    }

    fn disconnect(mut self: Box<Self>) -> Result<(), ProtocolError> {
        drop(self.io);
        let status = self.child.wait()?;
        if !status.success() {
            log::warn!(
                "remote helper exited with {}",
                status.code().unwrap_or(-1)
            );
        }
        Ok(())
    }
}

fn find_update(updates: &RefList, name: &str) -> Option<usize> {
    updates.find(name.as_bytes().as_bstr())
}
