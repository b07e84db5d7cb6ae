//! Integration tests for pkt-line framing.

use std::io::Cursor;

use git_protocol::pktline::{PktLine, PktLineReader, PktLineWriter, MAX_PKT_DATA_LEN};
use git_protocol::ProtocolError;
use proptest::prelude::*;

proptest! {
    // Any payload under the frame limit survives encode/decode
    #[test]
    fn framing_roundtrip(data in proptest::collection::vec(any::<u8>(), 1..4096)) {
        // Avoid the ERR prefix, which decodes as a remote error on purpose
        prop_assume!(!data.starts_with(b"ERR "));

        let mut buf = Vec::new();
        PktLineWriter::new(&mut buf).write_line(&data).unwrap();

        let mut reader = PktLineReader::new(Cursor::new(buf));
        match reader.read_pkt().unwrap() {
            PktLine::Data(decoded) => prop_assert_eq!(decoded, data),
            other => prop_assert!(false, "expected data, got {:?}", other),
        }
    }

    #[test]
    fn header_is_lowercase_hex(data in proptest::collection::vec(any::<u8>(), 1..512)) {
        let mut buf = Vec::new();
        PktLineWriter::new(&mut buf).write_line(&data).unwrap();
        let header = std::str::from_utf8(&buf[..4]).unwrap();
        prop_assert!(header.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        prop_assert_eq!(usize::from_str_radix(header, 16).unwrap(), data.len() + 4);
    }

    // Garbage headers never panic, they fail
    #[test]
    fn arbitrary_prefixes_do_not_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mut reader = PktLineReader::new(Cursor::new(bytes));
        let _ = reader.read_pkt();
    }
}

#[test]
fn distinguished_headers() {
    for (bytes, expect) in [
        (&b"0000"[..], PktLine::Flush),
        (&b"0001"[..], PktLine::Delimiter),
        (&b"0002"[..], PktLine::ResponseEnd),
    ] {
        let mut reader = PktLineReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_pkt().unwrap(), expect);
    }
}

#[test]
fn reserved_lengths_fail() {
    for bytes in [&b"0003"[..], &b"0004"[..]] {
        let mut reader = PktLineReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_pkt(),
            Err(ProtocolError::InvalidPktLine(_))
        ));
    }
}

#[test]
fn oversized_length_fails() {
    // fff5 = 65525 > the 65524 cap
    let mut reader = PktLineReader::new(Cursor::new(&b"fff5"[..]));
    assert!(matches!(
        reader.read_pkt(),
        Err(ProtocolError::InvalidPktLine(_))
    ));
}

#[test]
fn upper_and_lowercase_headers_decode_alike() {
    for header in ["000a", "000A"] {
        let mut stream = header.as_bytes().to_vec();
        stream.extend_from_slice(b"hello\n");
        let mut reader = PktLineReader::new(Cursor::new(stream));
        assert_eq!(reader.read_line().unwrap().unwrap(), b"hello\n");
    }
}

#[test]
fn max_payload_roundtrips() {
    let data = vec![0x42u8; MAX_PKT_DATA_LEN];
    let mut buf = Vec::new();
    PktLineWriter::new(&mut buf).write_line(&data).unwrap();

    let mut reader = PktLineReader::new(Cursor::new(buf));
    match reader.read_pkt().unwrap() {
        PktLine::Data(decoded) => assert_eq!(decoded.len(), MAX_PKT_DATA_LEN),
        other => panic!("expected data, got {:?}", other),
    }
}

#[test]
fn err_packet_aborts_with_message() {
    let mut buf = Vec::new();
    PktLineWriter::new(&mut buf)
        .write_text("ERR repository not found")
        .unwrap();
    let mut reader = PktLineReader::new(Cursor::new(buf));
    match reader.read_pkt() {
        Err(ProtocolError::Remote(msg)) => assert_eq!(msg, "repository not found"),
        other => panic!("expected Remote error, got {:?}", other),
    }
}
