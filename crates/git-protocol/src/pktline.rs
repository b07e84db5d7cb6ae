//! Pkt-line protocol framing.
//!
//! The pkt-line format is the foundation of the git wire protocol. Each
//! packet is prefixed with a 4-hex-digit length (including the 4 bytes
//! of the length field itself). Distinguished headers:
//! - `0000`: flush packet (end of section)
//! - `0001`: delimiter packet (v2 section separator)
//! - `0002`: response-end packet (v2 stateless response terminator)
//!
//! The distinguished values are never payloads; a header of `0003` or
//! `0004` is malformed. Lowercase hex is emitted, either case accepted.

use std::io::{Read, Write};

use crate::ProtocolError;

/// Maximum packet length including the 4-byte header.
pub const MAX_PKT_LEN: usize = 65524;

/// Maximum data per packet.
pub const MAX_PKT_DATA_LEN: usize = MAX_PKT_LEN - 4;

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Normal data line.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

/// The kind of the next packet, for non-consuming inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktKind {
    Data,
    Flush,
    Delimiter,
    ResponseEnd,
    Eof,
}

impl PktLine {
    fn kind(&self) -> PktKind {
        match self {
            PktLine::Data(_) => PktKind::Data,
            PktLine::Flush => PktKind::Flush,
            PktLine::Delimiter => PktKind::Delimiter,
            PktLine::ResponseEnd => PktKind::ResponseEnd,
        }
    }
}

/// Pkt-line reader.
///
/// Options control how line-oriented protocol phases are decoded:
/// newline chomping on data lines, and recognition of `ERR ` payloads as
/// fatal remote errors (on by default; raw pack phases turn it off).
pub struct PktLineReader<R> {
    reader: R,
    chomp_newline: bool,
    err_packets: bool,
    peeked: Option<Option<PktLine>>,
}

impl<R: Read> PktLineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chomp_newline: false,
            err_packets: true,
            peeked: None,
        }
    }

    /// Strip one trailing newline from data lines.
    pub fn chomp_newline(mut self, on: bool) -> Self {
        self.chomp_newline = on;
        self
    }

    /// Turn `ERR ` packet interpretation on or off.
    pub fn err_packets(mut self, on: bool) -> Self {
        self.err_packets = on;
        self
    }

    /// Get a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consume the reader and return the inner value.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Inspect the kind of the next packet without consuming it.
    pub fn peek(&mut self) -> Result<PktKind, ProtocolError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.read_raw()?);
        }
        Ok(match self.peeked.as_ref().expect("just peeked") {
            Some(pkt) => pkt.kind(),
            None => PktKind::Eof,
        })
    }

    /// Read one packet; `None` means EOF at a packet boundary.
    pub fn read_item(&mut self) -> Result<Option<PktLine>, ProtocolError> {
        if let Some(item) = self.peeked.take() {
            return Ok(item);
        }
        self.read_raw()
    }

    /// Read one packet, treating EOF as a protocol error.
    pub fn read_pkt(&mut self) -> Result<PktLine, ProtocolError> {
        self.read_item()?.ok_or(ProtocolError::UnexpectedEof)
    }

    /// Read one data line. Returns `None` for flush.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.read_pkt()? {
            PktLine::Data(data) => Ok(Some(data)),
            _ => Ok(None),
        }
    }

    /// Read all data lines until a flush packet.
    pub fn read_until_flush(&mut self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut lines = Vec::new();
        while let PktLine::Data(data) = self.read_pkt()? {
            lines.push(data);
        }
        Ok(lines)
    }

    fn read_raw(&mut self) -> Result<Option<PktLine>, ProtocolError> {
        let mut len_buf = [0u8; 4];

        // EOF before any header byte is a packet boundary
        let mut filled = 0;
        while filled < 4 {
            match self.reader.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(ProtocolError::UnexpectedEof),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::Io(e)),
            }
        }

        let len = parse_len(&len_buf)?;

        match len {
            0 => Ok(Some(PktLine::Flush)),
            1 => Ok(Some(PktLine::Delimiter)),
            2 => Ok(Some(PktLine::ResponseEnd)),
            3 | 4 => Err(ProtocolError::InvalidPktLine(format!(
                "invalid pkt-line length {}",
                len
            ))),
            _ => {
                let data_len = (len as usize) - 4;
                if data_len > MAX_PKT_DATA_LEN {
                    return Err(ProtocolError::InvalidPktLine(format!(
                        "pkt-line too long: {} bytes",
                        data_len
                    )));
                }
                let mut data = vec![0u8; data_len];
                self.reader.read_exact(&mut data).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        ProtocolError::UnexpectedEof
                    } else {
                        ProtocolError::Io(e)
                    }
                })?;

                if self.chomp_newline && data.last() == Some(&b'\n') {
                    data.pop();
                }

                if self.err_packets {
                    if let Some(msg) = data.strip_prefix(b"ERR ") {
                        return Err(ProtocolError::Remote(
                            String::from_utf8_lossy(msg).trim_end().to_string(),
                        ));
                    }
                }

                Ok(Some(PktLine::Data(data)))
            }
        }
    }
}

fn parse_len(len_buf: &[u8; 4]) -> Result<u16, ProtocolError> {
    let mut len = 0u16;
    for &b in len_buf {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            // accepted for interoperability; we never emit it
            b'A'..=b'F' => b - b'A' + 10,
            _ => {
                return Err(ProtocolError::InvalidPktLine(format!(
                    "invalid pkt-line length bytes: {:?}",
                    len_buf
                )))
            }
        };
        len = (len << 4) | nibble as u16;
    }
    Ok(len)
}

/// Pkt-line writer.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Get a mutable reference to the inner writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Consume the writer and return the inner value.
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Write a data packet.
    pub fn write_line(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::InvalidPktLine(
                "refusing to write an empty pkt-line".into(),
            ));
        }
        if data.len() > MAX_PKT_DATA_LEN {
            return Err(ProtocolError::InvalidPktLine(format!(
                "data too long for pkt-line: {} bytes (max {})",
                data.len(),
                MAX_PKT_DATA_LEN
            )));
        }

        let len = (data.len() + 4) as u16;
        write!(self.writer, "{:04x}", len)?;
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Write a text line, appending `\n` if not present.
    pub fn write_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        if text.ends_with('\n') {
            self.write_line(text.as_bytes())
        } else {
            let mut data = text.as_bytes().to_vec();
            data.push(b'\n');
            self.write_line(&data)
        }
    }

    /// Write a flush packet (0000).
    pub fn write_flush(&mut self) -> Result<(), ProtocolError> {
        self.writer.write_all(b"0000")?;
        Ok(())
    }

    /// Write a delimiter packet (0001).
    pub fn write_delimiter(&mut self) -> Result<(), ProtocolError> {
        self.writer.write_all(b"0001")?;
        Ok(())
    }

    /// Write a response-end packet (0002).
    pub fn write_response_end(&mut self) -> Result<(), ProtocolError> {
        self.writer.write_all(b"0002")?;
        Ok(())
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// A batch of packets assembled in memory, for request styles that need
/// the whole message before transmission (stateless RPC rounds).
#[derive(Default)]
pub struct PktBuffer {
    buf: Vec<u8>,
}

impl PktBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_line(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut w = PktLineWriter::new(&mut self.buf);
        w.write_line(data)
    }

    pub fn write_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        let mut w = PktLineWriter::new(&mut self.buf);
        w.write_text(text)
    }

    pub fn write_flush(&mut self) {
        self.buf.extend_from_slice(b"0000");
    }

    pub fn write_delimiter(&mut self) {
        self.buf.extend_from_slice(b"0001");
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The assembled bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Send the batch into `w` and clear the buffer.
    pub fn send(&mut self, w: &mut dyn Write) -> Result<(), ProtocolError> {
        w.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }
}
