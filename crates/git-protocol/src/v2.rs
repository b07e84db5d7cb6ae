//! Protocol v2: command-oriented exchanges.
//!
//! The server opens with a capability advertisement (`version 2`,
//! capability and command-descriptor lines, flush). Each client request
//! is `command=<name>`, capability lines, a delim packet, arguments, and
//! a flush. Recognized here: `ls-refs` and `fetch`. The v2 `push`
//! command was never standardized; pushes stay on v0/v1.
//!
//! A `fetch` response carries its sections in fixed order —
//! `acknowledgments`, `shallow-info`, `wanted-refs`, `packfile-uris`,
//! `packfile` — each introduced by a packet holding exactly the section
//! name. Missing sections are skipped, out-of-order ones are an error.

use bstr::{BString, ByteSlice};
use git_hash::ObjectId;
use git_transport::Connection;

use crate::capability::{Capabilities, AGENT};
use crate::negotiate::{next_flush, Negotiator, INITIAL_FLUSH, MAX_IN_VAIN};
use crate::pktline::{PktKind, PktLine, PktLineReader, PktLineWriter};
use crate::refs::{Ref, RefList};
use crate::sideband;
use crate::store::ObjectStore;
use crate::v1::{FetchArgs, FetchOutcome};
use crate::ProtocolError;

/// Parse the v2 capability advertisement.
pub fn parse_capability_advertisement<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
) -> Result<Capabilities, ProtocolError> {
    let mut lines = Vec::new();
    loop {
        match reader.read_pkt()? {
            PktLine::Flush | PktLine::ResponseEnd => break,
            PktLine::Delimiter => continue,
            PktLine::Data(data) => {
                // The smart-HTTP preamble may precede the version line
                if data.starts_with(b"#") {
                    continue;
                }
                lines.push(data);
            }
        }
    }
    Ok(Capabilities::parse_v2(&lines))
}

/// Options for the `ls-refs` command.
#[derive(Debug, Clone, Default)]
pub struct LsRefsOptions {
    /// Server-side prefixes (`ref-prefix` arguments).
    pub ref_prefixes: Vec<BString>,
    /// Ask for symref targets.
    pub symrefs: bool,
    /// Ask for peeled tag targets.
    pub peel: bool,
}

/// Run `ls-refs` and parse the resulting ref list.
pub fn ls_refs(
    conn: &mut dyn Connection,
    caps: &Capabilities,
    options: &LsRefsOptions,
) -> Result<RefList, ProtocolError> {
    if !caps.supports("ls-refs") {
        return Err(ProtocolError::Unsupported(
            "server does not support ls-refs".into(),
        ));
    }

    {
        let mut writer = PktLineWriter::new(conn.writer());
        writer.write_text("command=ls-refs")?;
        writer.write_text(AGENT)?;
        if let Some(format) = caps.value("object-format") {
            writer.write_text(&format!("object-format={}", format))?;
        }
        writer.write_delimiter()?;
        if options.symrefs {
            writer.write_text("symrefs")?;
        }
        if options.peel {
            writer.write_text("peel")?;
        }
        for prefix in &options.ref_prefixes {
            writer.write_text(&format!("ref-prefix {}", prefix))?;
        }
        writer.write_flush()?;
        writer.flush()?;
    }
    conn.dispatch()?;

    let mut refs = RefList::new();
    let mut reader = PktLineReader::new(conn.reader()).chomp_newline(true);
    loop {
        match reader.read_item()? {
            None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => break,
            Some(PktLine::Delimiter) => continue,
            Some(PktLine::Data(data)) => parse_ls_refs_line(&data, &mut refs)?,
        }
    }
    Ok(refs)
}

/// One `ls-refs` line: `<oid> <name> [symref-target:<t>] [peeled:<oid>]`,
/// or `unborn <name> [symref-target:<t>]`.
fn parse_ls_refs_line(line: &[u8], refs: &mut RefList) -> Result<(), ProtocolError> {
    let mut fields = line.split_str(" ");
    let first = fields
        .next()
        .ok_or_else(|| ProtocolError::Protocol("empty ls-refs line".into()))?;

    let (id, name) = if first == b"unborn" {
        let name = fields
            .next()
            .ok_or_else(|| ProtocolError::Protocol("unborn line without a name".into()))?;
        (None, name)
    } else {
        let id: ObjectId = std::str::from_utf8(first)
            .ok()
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| {
                ProtocolError::Protocol(format!(
                    "invalid id in ls-refs: {}",
                    String::from_utf8_lossy(line)
                ))
            })?;
        let name = fields
            .next()
            .ok_or_else(|| ProtocolError::Protocol("ls-refs line without a name".into()))?;
        (Some(id), name)
    };

    let mut r = match id {
        Some(id) => Ref::new(name.as_bstr(), id),
        None => Ref::new(name.as_bstr(), ObjectId::NULL_SHA1),
    };

    for attr in fields {
        if let Some(target) = attr.strip_prefix(b"symref-target:") {
            r.symref_target = Some(BString::from(target));
        } else if let Some(hex) = attr.strip_prefix(b"peeled:") {
            let peeled = std::str::from_utf8(hex)
                .ok()
                .and_then(|h| h.parse().ok())
                .ok_or_else(|| {
                    ProtocolError::Protocol(format!(
                        "invalid peeled id: {}",
                        String::from_utf8_lossy(attr)
                    ))
                })?;
            r.peeled = Some(peeled);
        }
    }

    refs.push(r);
    Ok(())
}

const SECTION_ORDER: &[&str] = &[
    "acknowledgments",
    "shallow-info",
    "wanted-refs",
    "packfile-uris",
    "packfile",
];

/// Extra results a v2 fetch can carry beyond the v1 outcome.
#[derive(Debug, Default)]
pub struct V2Extras {
    /// `wanted-refs` section: resolved values of `want-ref` arguments.
    pub wanted_refs: Vec<(ObjectId, BString)>,
    /// `packfile-uris` section entries.
    pub packfile_uris: Vec<String>,
}

/// Drive the v2 `fetch` command to completion: negotiation rounds, then
/// the pack, demuxed into `pack_out`.
pub fn fetch_exchange(
    conn: &mut dyn Connection,
    caps: &Capabilities,
    args: &FetchArgs,
    negotiator: &mut dyn Negotiator,
    store: &dyn ObjectStore,
    pack_out: &mut dyn std::io::Write,
    progress_out: &mut dyn std::io::Write,
) -> Result<(FetchOutcome, V2Extras), ProtocolError> {
    if !caps.supports("fetch") {
        return Err(ProtocolError::Unsupported(
            "server does not support the v2 fetch command".into(),
        ));
    }
    if args.wants.is_empty() {
        return Ok((FetchOutcome::default(), V2Extras::default()));
    }
    if (args.wants_deepening() || !args.shallow.is_empty())
        && !caps.supports_feature("fetch", "shallow")
    {
        return Err(ProtocolError::Unsupported(
            "server does not support shallow fetches".into(),
        ));
    }
    let filter = match args.filter {
        Some(ref filter) if caps.supports_feature("fetch", "filter") => Some(filter.as_str()),
        Some(ref filter) => {
            log::warn!("server does not support filtering, dropping {}", filter);
            None
        }
        None => None,
    };

    let stateless = conn.is_stateless();
    let mut outcome = FetchOutcome::default();
    let mut extras = V2Extras::default();

    let mut count: usize = 0;
    let mut flush_at = INITIAL_FLUSH;
    let mut in_vain: usize = 0;
    let mut got_continue = false;

    loop {
        let mut sent_done = false;
        {
            let mut writer = PktLineWriter::new(conn.writer());
            writer.write_text("command=fetch")?;
            writer.write_text(AGENT)?;
            if let Some(format) = caps.value("object-format") {
                writer.write_text(&format!("object-format={}", format))?;
            }
            writer.write_delimiter()?;

            writer.write_text("thin-pack")?;
            writer.write_text("ofs-delta")?;
            if args.no_progress {
                writer.write_text("no-progress")?;
            }
            for want in &args.wants {
                writer.write_text(&format!("want {}", want))?;
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
            if args.deepen_relative {
                writer.write_text("deepen-relative")?;
            }
            if let Some(filter) = filter {
                writer.write_text(&format!("filter {}", filter))?;
            }

            if stateless {
                // Stateless rounds rebuild the common context
                for id in &outcome.common {
                    writer.write_text(&format!("have {}", id))?;
                }
            }
            let mut exhausted = false;
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

            if exhausted || (got_continue && in_vain >= MAX_IN_VAIN) {
                writer.write_text("done")?;
                sent_done = true;
            }
            writer.write_flush()?;
            writer.flush()?;
        }
        conn.dispatch()?;
        flush_at = next_flush(stateless, count);

        // Response: ordered sections. A section ending in a delimiter is
        // followed by another section; one ending in a flush closes the
        // response.
        let mut reader = PktLineReader::new(conn.reader()).chomp_newline(true);
        let mut last_section = -1isize;
        let mut saw_pack = false;

        loop {
            let header = match reader.read_item()? {
                None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => break,
                Some(PktLine::Delimiter) => continue,
                Some(PktLine::Data(data)) => data,
            };
            let section = SECTION_ORDER
                .iter()
                .position(|&s| s.as_bytes() == header.as_slice())
                .ok_or_else(|| {
                    ProtocolError::Protocol(format!(
                        "unknown fetch response section: {}",
                        String::from_utf8_lossy(&header)
                    ))
                })? as isize;
            if section <= last_section {
                return Err(ProtocolError::Protocol(format!(
                    "fetch response section out of order: {}",
                    String::from_utf8_lossy(&header)
                )));
            }
            last_section = section;

            let more = match SECTION_ORDER[section as usize] {
                "acknowledgments" => read_acknowledgments(
                    &mut reader,
                    negotiator,
                    store,
                    &mut outcome,
                    &mut in_vain,
                    &mut got_continue,
                )?,
                "shallow-info" => read_shallow_info(&mut reader, &mut outcome)?,
                "wanted-refs" => read_wanted_refs(&mut reader, &mut extras)?,
                "packfile-uris" => read_packfile_uris(&mut reader, &mut extras)?,
                "packfile" => {
                    let mut raw = PktLineReader::new(reader.into_inner()).err_packets(false);
                    sideband::demux(&mut raw, pack_out, progress_out)?;
                    saw_pack = true;
                    // Consume the stateless response terminator
                    if let Ok(PktKind::ResponseEnd) = raw.peek() {
                        let _ = raw.read_item();
                    }
                    break;
                }
                _ => unreachable!("section table is fixed"),
            };

            if !more {
                break;
            }
        }

        if saw_pack {
            return Ok((outcome, extras));
        }
        if sent_done {
            return Err(ProtocolError::Protocol(
                "server sent no packfile section after done".into(),
            ));
        }
    }
}

/// `acknowledgments` section: `NAK` | `ACK <id>` | `ready`.
/// Returns whether another section follows (delimiter-terminated).
fn read_acknowledgments<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
    negotiator: &mut dyn Negotiator,
    store: &dyn ObjectStore,
    outcome: &mut FetchOutcome,
    in_vain: &mut usize,
    got_continue: &mut bool,
) -> Result<bool, ProtocolError> {
    loop {
        match reader.read_item()? {
            Some(PktLine::Delimiter) => return Ok(true),
            None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => return Ok(false),
            Some(PktLine::Data(line)) => {
                if line.as_slice() == b"NAK" {
                    continue;
                }
                if line.as_slice() == b"ready" {
                    continue;
                }
                if let Some(hex) = line.strip_prefix(b"ACK ") {
                    let id: ObjectId = std::str::from_utf8(hex)
                        .ok()
                        .and_then(|h| h.trim().parse().ok())
                        .ok_or_else(|| {
                            ProtocolError::Protocol(format!(
                                "malformed v2 ACK: {}",
                                String::from_utf8_lossy(&line)
                            ))
                        })?;
                    *got_continue = true;
                    if !negotiator.ack(store, id) {
                        *in_vain = 0;
                    }
                    outcome.common.push(id);
                } else {
                    return Err(ProtocolError::Protocol(format!(
                        "unexpected acknowledgment line: {}",
                        String::from_utf8_lossy(&line)
                    )));
                }
            }
        }
    }
}

/// `shallow-info` section: `shallow <id>` / `unshallow <id>`.
/// Returns whether another section follows.
fn read_shallow_info<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
    outcome: &mut FetchOutcome,
) -> Result<bool, ProtocolError> {
    use crate::shallow::ShallowUpdate;

    loop {
        match reader.read_item()? {
            Some(PktLine::Delimiter) => return Ok(true),
            None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => return Ok(false),
            Some(PktLine::Data(line)) => {
                let parse = |hex: &[u8]| -> Result<ObjectId, ProtocolError> {
                    std::str::from_utf8(hex)
                        .ok()
                        .and_then(|h| h.trim().parse().ok())
                        .ok_or_else(|| {
                            ProtocolError::Protocol(format!(
                                "bad shallow-info line: {}",
                                String::from_utf8_lossy(&line)
                            ))
                        })
                };
                if let Some(hex) = line.strip_prefix(b"shallow ") {
                    outcome
                        .shallow_updates
                        .push(ShallowUpdate::Shallow(parse(hex)?));
                } else if let Some(hex) = line.strip_prefix(b"unshallow ") {
                    outcome
                        .shallow_updates
                        .push(ShallowUpdate::Unshallow(parse(hex)?));
                } else {
                    return Err(ProtocolError::Protocol(format!(
                        "unexpected shallow-info line: {}",
                        String::from_utf8_lossy(&line)
                    )));
                }
            }
        }
    }
}

/// `wanted-refs` section: `<oid> <refname>`.
/// Returns whether another section follows.
fn read_wanted_refs<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
    extras: &mut V2Extras,
) -> Result<bool, ProtocolError> {
    loop {
        match reader.read_item()? {
            Some(PktLine::Delimiter) => return Ok(true),
            None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => return Ok(false),
            Some(PktLine::Data(line)) => {
                let mut fields = line.split_str(" ");
                let id: ObjectId = fields
                    .next()
                    .and_then(|f| std::str::from_utf8(f).ok())
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| {
                        ProtocolError::Protocol(format!(
                            "bad wanted-refs line: {}",
                            String::from_utf8_lossy(&line)
                        ))
                    })?;
                let name = fields.next().ok_or_else(|| {
                    ProtocolError::Protocol("wanted-refs line without a name".into())
                })?;
                extras.wanted_refs.push((id, BString::from(name)));
            }
        }
    }
}

/// `packfile-uris` section: `<uri>` per line.
/// Returns whether another section follows.
fn read_packfile_uris<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
    extras: &mut V2Extras,
) -> Result<bool, ProtocolError> {
    loop {
        match reader.read_item()? {
            Some(PktLine::Delimiter) => return Ok(true),
            None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => return Ok(false),
            Some(PktLine::Data(line)) => {
                extras
                    .packfile_uris
                    .push(String::from_utf8_lossy(&line).into_owned());
            }
        }
    }
}
