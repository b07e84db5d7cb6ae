//! Sideband multiplexing.
//!
//! With sideband enabled, every normal packet carries a one-byte channel
//! prefix:
//! - band 1: pack data
//! - band 2: progress text (forwarded to the progress sink)
//! - band 3: fatal error (aborts with the payload as message)
//!
//! The demultiplexer never lets progress output block the pack consumer:
//! both writes happen from the same pull loop, between reads.

use std::io::{Read, Write};

use crate::capability::SidebandMode;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter, MAX_PKT_DATA_LEN};
use crate::ProtocolError;

/// Sideband channel identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Data = 1,
    Progress = 2,
    Error = 3,
}

/// Pull-style sideband demultiplexer over a pkt-line stream.
pub struct SidebandReader<'a, R> {
    reader: PktLineReader<R>,
    progress: Option<&'a mut dyn Write>,
}

impl<'a, R: Read> SidebandReader<'a, R> {
    pub fn new(reader: PktLineReader<R>) -> Self {
        Self {
            reader,
            progress: None,
        }
    }

    /// Forward band-2 payloads to `out` instead of discarding them.
    pub fn with_progress(mut self, out: &'a mut dyn Write) -> Self {
        self.progress = Some(out);
        self
    }

    /// Read the next band-1 chunk.
    ///
    /// Progress frames are forwarded as they pass; a band-3 frame aborts
    /// with [`ProtocolError::Remote`]. `None` means the section ended
    /// (flush, delimiter, or response-end).
    pub fn read_data(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            match self.reader.read_pkt()? {
                PktLine::Flush | PktLine::Delimiter | PktLine::ResponseEnd => return Ok(None),
                PktLine::Data(data) => {
                    let (band, payload) = match data.split_first() {
                        Some(split) => split,
                        None => return Ok(None),
                    };

                    match band {
                        1 => return Ok(Some(payload.to_vec())),
                        2 => {
                            if let Some(ref mut out) = self.progress {
                                out.write_all(payload)?;
                                out.flush()?;
                            }
                        }
                        3 => {
                            return Err(ProtocolError::Remote(
                                String::from_utf8_lossy(payload).trim_end().to_string(),
                            ));
                        }
                        _ => {
                            return Err(ProtocolError::Protocol(format!(
                                "unknown sideband channel: {}",
                                band
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Drain every band-1 chunk into one buffer.
    pub fn read_all_data(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut result = Vec::new();
        while let Some(chunk) = self.read_data()? {
            result.extend_from_slice(&chunk);
        }
        Ok(result)
    }

    pub fn into_inner(self) -> PktLineReader<R> {
        self.reader
    }
}

/// Demultiplex one sideband-framed section: band 1 into `pack_out`,
/// band 2 into `progress_out`, band 3 aborts.
pub fn demux<R: Read>(
    reader: &mut PktLineReader<R>,
    pack_out: &mut dyn Write,
    progress_out: &mut dyn Write,
) -> Result<(), ProtocolError> {
    loop {
        match reader.read_pkt()? {
            PktLine::Flush | PktLine::Delimiter | PktLine::ResponseEnd => return Ok(()),
            PktLine::Data(data) => {
                let (band, payload) = match data.split_first() {
                    Some(split) => split,
                    None => return Ok(()),
                };
                match band {
                    1 => pack_out.write_all(payload)?,
                    2 => {
                        progress_out.write_all(payload)?;
                        progress_out.flush()?;
                    }
                    3 => {
                        return Err(ProtocolError::Remote(
                            String::from_utf8_lossy(payload).trim_end().to_string(),
                        ))
                    }
                    _ => {
                        return Err(ProtocolError::Protocol(format!(
                            "unknown sideband channel: {}",
                            band
                        )))
                    }
                }
            }
        }
    }
}

/// Copy a raw (non-sideband) pack stream until EOF.
pub fn copy_raw<R: Read>(reader: &mut R, pack_out: &mut dyn Write) -> Result<(), ProtocolError> {
    std::io::copy(reader, pack_out)?;
    Ok(())
}

/// Frame `data` onto `band`, splitting into maximal packets.
pub fn write_sideband<W: Write>(
    writer: &mut PktLineWriter<W>,
    mode: SidebandMode,
    band: Band,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let max_chunk = match mode {
        SidebandMode::None => {
            return Err(ProtocolError::Protocol(
                "sideband write without sideband negotiation".into(),
            ))
        }
        SidebandMode::Band => 999,
        SidebandMode::Band64k => MAX_PKT_DATA_LEN - 1,
    };

    for chunk in data.chunks(max_chunk) {
        let mut pkt = Vec::with_capacity(1 + chunk.len());
        pkt.push(band as u8);
        pkt.extend_from_slice(chunk);
        writer.write_line(&pkt)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(band: u8, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = PktLineWriter::new(&mut buf);
        let mut pkt = vec![band];
        pkt.extend_from_slice(data);
        writer.write_line(&pkt).unwrap();
        buf
    }

    #[test]
    fn demux_separates_bands_in_order() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(2, b"remote: counting\n"));
        stream.extend_from_slice(&frame(1, b"PACKdata1"));
        stream.extend_from_slice(&frame(2, b"remote: compressing\n"));
        stream.extend_from_slice(&frame(1, b"data2"));
        stream.extend_from_slice(b"0000");

        let mut reader = PktLineReader::new(Cursor::new(stream));
        let mut pack = Vec::new();
        let mut progress = Vec::new();
        demux(&mut reader, &mut pack, &mut progress).unwrap();

        assert_eq!(pack, b"PACKdata1data2");
        assert_eq!(progress, b"remote: counting\nremote: compressing\n");
    }

    #[test]
    fn band3_aborts_with_message() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, b"partial"));
        stream.extend_from_slice(&frame(3, b"repository vanished\n"));
        stream.extend_from_slice(&frame(1, b"never read"));
        stream.extend_from_slice(b"0000");

        let mut reader = PktLineReader::new(Cursor::new(stream));
        let mut pack = Vec::new();
        let mut progress = Vec::new();
        match demux(&mut reader, &mut pack, &mut progress) {
            Err(ProtocolError::Remote(msg)) => assert_eq!(msg, "repository vanished"),
            other => panic!("expected Remote error, got {:?}", other),
        }
        assert_eq!(pack, b"partial");
    }

    #[test]
    fn unknown_band_is_protocol_error() {
        let mut stream = frame(7, b"???");
        stream.extend_from_slice(b"0000");
        let mut reader = PktLineReader::new(Cursor::new(stream));
        assert!(matches!(
            demux(&mut reader, &mut Vec::new(), &mut Vec::new()),
            Err(ProtocolError::Protocol(_))
        ));
    }

    #[test]
    fn reader_collects_data() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(1, b"chunk1"));
        stream.extend_from_slice(&frame(1, b"chunk2"));
        stream.extend_from_slice(b"0000");

        let reader = PktLineReader::new(Cursor::new(stream));
        let mut sb = SidebandReader::new(reader);
        assert_eq!(sb.read_all_data().unwrap(), b"chunk1chunk2");
    }

    #[test]
    fn reader_forwards_progress() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(2, b"working\n"));
        stream.extend_from_slice(&frame(1, b"payload"));
        stream.extend_from_slice(b"0000");

        let mut progress = Vec::new();
        let reader = PktLineReader::new(Cursor::new(stream));
        let mut sb = SidebandReader::new(reader).with_progress(&mut progress);
        assert_eq!(sb.read_data().unwrap().unwrap(), b"payload");
        assert!(sb.read_data().unwrap().is_none());
        drop(sb);
        assert_eq!(progress, b"working\n");
    }

    #[test]
    fn write_splits_band_frames() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            let data = vec![0xabu8; 1500];
            write_sideband(&mut writer, SidebandMode::Band, Band::Data, &data).unwrap();
            writer.write_flush().unwrap();
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        let mut pack = Vec::new();
        demux(&mut reader, &mut pack, &mut Vec::new()).unwrap();
        assert_eq!(pack.len(), 1500);
    }
}
