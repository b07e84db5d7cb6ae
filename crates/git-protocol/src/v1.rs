//! Protocol v0/v1: ref advertisement and the want/have/done exchange.
//!
//! The server opens with its advertisement (`<id> <name>`, capabilities
//! after a NUL on the first line, peeled `^{}` entries trailing their
//! tags). The client answers with wants, shallow state, and rounds of
//! haves; the server acknowledges with the ACK/NAK grammar until it can
//! build a minimal pack.

use bstr::{BStr, BString, ByteSlice};
use git_hash::ObjectId;
use git_transport::Connection;

use crate::capability::{self, Capabilities, SidebandMode};
use crate::negotiate::{next_flush, Negotiator, INITIAL_FLUSH, MAX_IN_VAIN};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::refs::{Ref, RefList};
use crate::shallow::ShallowUpdate;
use crate::sideband;
use crate::store::ObjectStore;
use crate::ProtocolError;

/// Parse the v0/v1 ref advertisement.
///
/// Tolerates the smart-HTTP preamble (`# service=...` line plus its
/// flush). The zero-ref form advertises capabilities on a synthetic
/// `capabilities^{}` line, which is consumed without storing a ref.
pub fn parse_advertisement<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
) -> Result<(RefList, Capabilities), ProtocolError> {
    let mut lines: Vec<Vec<u8>> = Vec::new();
    let mut saw_service_header = false;

    loop {
        match reader.read_pkt()? {
            PktLine::Flush => {
                if saw_service_header && lines.is_empty() {
                    // the flush that terminates "# service=..."
                    saw_service_header = false;
                    continue;
                }
                break;
            }
            PktLine::Delimiter | PktLine::ResponseEnd => break,
            PktLine::Data(data) => {
                if data.starts_with(b"#") {
                    saw_service_header = true;
                    continue;
                }
                lines.push(data);
            }
        }
    }

    parse_advertisement_lines(&lines)
}

/// Line-based form of [`parse_advertisement`], for callers that already
/// collected the packet payloads (handshake version sniffing).
pub fn parse_advertisement_lines(
    lines: &[Vec<u8>],
) -> Result<(RefList, Capabilities), ProtocolError> {
    let mut refs = RefList::new();
    let mut capabilities = Capabilities::default();
    let mut saw_ref_line = false;

    for data in lines {
        let line = chomp(data);
        if line.starts_with(b"#") || line == b"version 1" {
            continue;
        }

        let line = if !saw_ref_line {
            // First real line: capabilities after NUL
            match line.iter().position(|&b| b == 0) {
                Some(nul) => {
                    let caps = String::from_utf8_lossy(&line[nul + 1..]);
                    capabilities = Capabilities::parse_v1(&caps);
                    &line[..nul]
                }
                None => line,
            }
        } else {
            line
        };
        saw_ref_line = true;

        parse_ref_line(line, &mut refs)?;
    }

    apply_symrefs(&mut refs, &capabilities);
    Ok((refs, capabilities))
}

/// Parse one advertisement line: `<hex-id> <refname>`.
fn parse_ref_line(line: &[u8], refs: &mut RefList) -> Result<(), ProtocolError> {
    if line.is_empty() {
        return Ok(());
    }

    let space = line.iter().position(|&b| b == b' ').ok_or_else(|| {
        ProtocolError::Protocol(format!(
            "invalid ref line (no space): {}",
            String::from_utf8_lossy(line)
        ))
    })?;

    let id_hex = std::str::from_utf8(&line[..space])
        .map_err(|_| ProtocolError::Protocol("non-UTF-8 object id".into()))?;
    let id: ObjectId = id_hex
        .parse()
        .map_err(|e| ProtocolError::Protocol(format!("invalid id in advertisement: {}", e)))?;
    let name = line[space + 1..].as_bstr();

    // The empty-repository advertisement carries no real refs
    if name == "capabilities^{}" {
        return Ok(());
    }

    if name.ends_with(b"^{}") {
        // Peeled entries augment the preceding tag, never stand alone
        refs.push_peeled(name, id);
        return Ok(());
    }

    refs.push(Ref::new(name, id));
    Ok(())
}

/// Apply `symref=<ref>:<target>` capability values onto the ref list.
fn apply_symrefs(refs: &mut RefList, caps: &Capabilities) {
    for value in caps.values("symref") {
        if let Some((name, target)) = value.split_once(':') {
            if let Some(idx) = refs.find(name.as_bytes().as_bstr()) {
                refs.get_mut(idx).symref_target = Some(BString::from(target));
            }
        }
    }
}

/// One server acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// `NAK`: nothing (new) in common this round.
    Nak,
    /// `ACK <id>`: v0 single-ack; negotiation is over.
    Plain(ObjectId),
    /// `ACK <id> continue`: common, keep going (multi_ack).
    Continue(ObjectId),
    /// `ACK <id> common`: common, keep going (multi_ack_detailed).
    Common(ObjectId),
    /// `ACK <id> ready`: the server can build a minimal pack.
    Ready(ObjectId),
}

/// Parse one ACK/NAK line.
pub fn parse_ack(line: &BStr) -> Result<Ack, ProtocolError> {
    let line = chomp(line);
    if line == b"NAK" {
        return Ok(Ack::Nak);
    }
    let rest = line
        .strip_prefix(b"ACK ")
        .ok_or_else(|| ProtocolError::Protocol(format!(
            "expected ACK or NAK, got: {}",
            String::from_utf8_lossy(line)
        )))?;

    let mut fields = rest.split_str(" ");
    let id: ObjectId = fields
        .next()
        .and_then(|f| std::str::from_utf8(f).ok())
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| ProtocolError::Protocol(format!(
            "malformed ACK line: {}",
            String::from_utf8_lossy(line)
        )))?;

    match fields.next() {
        None => Ok(Ack::Plain(id)),
        Some(detail) if detail == b"continue" => Ok(Ack::Continue(id)),
        Some(detail) if detail == b"common" => Ok(Ack::Common(id)),
        Some(detail) if detail == b"ready" => Ok(Ack::Ready(id)),
        Some(other) => Err(ProtocolError::Protocol(format!(
            "unknown ACK detail: {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Arguments for the v0/v1 fetch exchange.
#[derive(Debug, Clone, Default)]
pub struct FetchArgs {
    pub wants: Vec<ObjectId>,
    /// Our current shallow roots, advertised before deepening.
    pub shallow: Vec<ObjectId>,
    pub depth: Option<u32>,
    pub deepen_since: Option<i64>,
    pub deepen_not: Vec<BString>,
    pub deepen_relative: bool,
    pub filter: Option<String>,
    pub no_progress: bool,
}

impl FetchArgs {
    pub fn wants_deepening(&self) -> bool {
        self.depth.is_some() || self.deepen_since.is_some() || !self.deepen_not.is_empty()
    }
}

/// Outcome of the negotiation phase.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Boundary updates announced by the server, in arrival order.
    pub shallow_updates: Vec<ShallowUpdate>,
    /// Commits the server confirmed common.
    pub common: Vec<ObjectId>,
}

/// Drive the v0/v1 fetch: wants, shallow state, have rounds, `done`,
/// then the pack, demuxed into `pack_out` with progress to
/// `progress_out`.
pub fn fetch_exchange(
    conn: &mut dyn Connection,
    caps: &Capabilities,
    args: &FetchArgs,
    negotiator: &mut dyn Negotiator,
    store: &dyn ObjectStore,
    pack_out: &mut dyn std::io::Write,
    progress_out: &mut dyn std::io::Write,
) -> Result<FetchOutcome, ProtocolError> {
    if args.wants.is_empty() {
        return Ok(FetchOutcome::default());
    }

    let (mut client_caps, _multi_ack) = capability::negotiate_fetch(caps);
    if args.wants_deepening() || !args.shallow.is_empty() {
        require(caps, "shallow")?;
        push_unique(&mut client_caps, "shallow");
    }
    if args.deepen_since.is_some() {
        require(caps, "deepen-since")?;
        push_unique(&mut client_caps, "deepen-since");
    }
    if !args.deepen_not.is_empty() {
        require(caps, "deepen-not")?;
        push_unique(&mut client_caps, "deepen-not");
    }
    if args.deepen_relative {
        require(caps, "deepen-relative")?;
        push_unique(&mut client_caps, "deepen-relative");
    }
    if args.no_progress && caps.supports("no-progress") {
        push_unique(&mut client_caps, "no-progress");
    }
    let filter = match args.filter {
        Some(ref filter) if caps.supports("filter") => {
            push_unique(&mut client_caps, "filter");
            Some(filter.clone())
        }
        Some(ref filter) => {
            log::warn!("server does not support filtering, dropping {}", filter);
            None
        }
        None => None,
    };

    let sideband_mode = capability::select_sideband(caps);
    let stateless = conn.is_stateless();
    let mut outcome = FetchOutcome::default();

    let mut first_round = true;
    let mut count: usize = 0;
    let mut flush_at = INITIAL_FLUSH;
    let mut in_vain: usize = 0;
    let mut got_ready = false;
    let mut got_continue = false;
    let mut exhausted = false;

    loop {
        // Request phase
        {
            let mut writer = PktLineWriter::new(conn.writer());
            if first_round || stateless {
                write_preamble(&mut writer, args, &client_caps, filter.as_deref())?;
            }
            if stateless {
                // Re-establish context the stateless server has forgotten
                for id in &outcome.common {
                    writer.write_text(&format!("have {}", id))?;
                }
            }

            if !got_ready {
                while count < flush_at {
                    match negotiator.next(store) {
                        Some(id) => {
                            writer.write_text(&format!("have {}", id))?;
                            count += 1;
                            in_vain += 1;
                        }
                        None => {
                            exhausted = true;
                            break;
                        }
                    }
                }
            }

            let done = got_ready
                || exhausted
                || (got_continue && in_vain >= MAX_IN_VAIN);
            if done {
                writer.write_text("done")?;
            } else {
                writer.write_flush()?;
            }
            writer.flush()?;
            conn.dispatch()?;

            if done {
                break;
            }
        }
        flush_at = next_flush(stateless, count);

        // Response phase
        let mut reader = PktLineReader::new(conn.reader());
        if args.wants_deepening() && (first_round || stateless) {
            read_shallow_block(&mut reader, &mut outcome)?;
        }
        first_round = false;

        loop {
            let line = match reader.read_pkt()? {
                PktLine::Data(data) => BString::from(data),
                PktLine::Flush => continue,
                _ => {
                    return Err(ProtocolError::Protocol(
                        "unexpected packet in ACK block".into(),
                    ))
                }
            };
            match parse_ack(line.as_bstr())? {
                Ack::Nak => break,
                Ack::Plain(id) => {
                    // v0 single-ack: the server has enough
                    negotiator.ack(store, id);
                    outcome.common.push(id);
                    got_ready = true;
                    break;
                }
                Ack::Continue(id) | Ack::Common(id) => {
                    got_continue = true;
                    if !negotiator.ack(store, id) {
                        in_vain = 0;
                    }
                    outcome.common.push(id);
                }
                Ack::Ready(id) => {
                    negotiator.ack(store, id);
                    outcome.common.push(id);
                    got_ready = true;
                    break;
                }
            }
        }

    }

    // Final ACK block (after done), then the pack. A deepening clone
    // that went straight to done sees its shallow block here, separated
    // from the ACKs by a flush.
    let mut reader = PktLineReader::new(conn.reader());
    loop {
        match reader.peek()? {
            crate::pktline::PktKind::Data => {
                let line = match reader.read_pkt()? {
                    PktLine::Data(data) => BString::from(data),
                    _ => unreachable!("peeked data"),
                };
                let text = chomp(line.as_bstr());
                if text.starts_with(b"shallow ") || text.starts_with(b"unshallow ") {
                    stage_shallow_line(text, &mut outcome)?;
                    continue;
                }
                match parse_ack(line.as_bstr())? {
                    Ack::Nak => break,
                    Ack::Plain(id) | Ack::Ready(id) => {
                        outcome.common.push(id);
                        break;
                    }
                    Ack::Continue(id) | Ack::Common(id) => {
                        outcome.common.push(id);
                    }
                }
            }
            crate::pktline::PktKind::Flush => {
                reader.read_pkt()?;
            }
            _ => break,
        }
    }

    // Pack phase
    match sideband_mode {
        SidebandMode::None => sideband::copy_raw(reader.inner_mut(), pack_out)?,
        SidebandMode::Band | SidebandMode::Band64k => {
            let mut demux_reader = PktLineReader::new(reader.into_inner()).err_packets(false);
            sideband::demux(&mut demux_reader, pack_out, progress_out)?;
        }
    }

    Ok(outcome)
}

/// The wants/shallow/deepen/filter block that opens every request
/// (stateless rounds repeat it verbatim).
fn write_preamble<W: std::io::Write>(
    writer: &mut PktLineWriter<W>,
    args: &FetchArgs,
    client_caps: &[String],
    filter: Option<&str>,
) -> Result<(), ProtocolError> {
    for (i, want) in args.wants.iter().enumerate() {
        if i == 0 {
            writer.write_text(&format!("want {} {}", want, client_caps.join(" ")))?;
        } else {
            writer.write_text(&format!("want {}", want))?;
        }
    }
    for id in &args.shallow {
        writer.write_text(&format!("shallow {}", id))?;
    }
    if let Some(depth) = args.depth {
        writer.write_text(&format!("deepen {}", depth))?;
    }
    if let Some(since) = args.deepen_since {
        writer.write_text(&format!("deepen-since {}", since))?;
    }
    for short in &args.deepen_not {
        writer.write_text(&format!("deepen-not {}", short))?;
    }
    if let Some(filter) = filter {
        writer.write_text(&format!("filter {}", filter))?;
    }
    writer.write_flush()?;
    Ok(())
}

fn read_shallow_block<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
    outcome: &mut FetchOutcome,
) -> Result<(), ProtocolError> {
    loop {
        match reader.peek()? {
            crate::pktline::PktKind::Data => {}
            _ => {
                // Consume the flush ending the shallow block
                reader.read_pkt()?;
                return Ok(());
            }
        }
        let data = match reader.read_pkt()? {
            PktLine::Data(data) => data,
            _ => unreachable!("peeked data"),
        };
        let line = chomp(&data);
        if line.starts_with(b"shallow ") || line.starts_with(b"unshallow ") {
            stage_shallow_line(line, outcome)?;
        } else {
            return Err(ProtocolError::Protocol(format!(
                "expected shallow/unshallow, got: {}",
                String::from_utf8_lossy(line)
            )));
        }
    }
}

fn stage_shallow_line(line: &[u8], outcome: &mut FetchOutcome) -> Result<(), ProtocolError> {
    let parse = |hex: &[u8]| -> Result<ObjectId, ProtocolError> {
        std::str::from_utf8(hex)
            .ok()
            .and_then(|h| h.trim().parse().ok())
            .ok_or_else(|| ProtocolError::Protocol(format!(
                "bad shallow line: {}",
                String::from_utf8_lossy(line)
            )))
    };
    if let Some(hex) = line.strip_prefix(b"shallow ") {
        outcome
            .shallow_updates
            .push(ShallowUpdate::Shallow(parse(hex)?));
    } else if let Some(hex) = line.strip_prefix(b"unshallow ") {
        outcome
            .shallow_updates
            .push(ShallowUpdate::Unshallow(parse(hex)?));
    }
    Ok(())
}

fn require(caps: &Capabilities, cap: &str) -> Result<(), ProtocolError> {
    if caps.supports(cap) {
        Ok(())
    } else {
        Err(ProtocolError::Unsupported(format!(
            "server does not support {}",
            cap
        )))
    }
}

fn push_unique(list: &mut Vec<String>, cap: &str) {
    if !list.iter().any(|c| c == cap) {
        list.push(cap.to_string());
    }
}

fn chomp(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(&b'\n') => &data[..data.len() - 1],
        _ => data,
    }
}
