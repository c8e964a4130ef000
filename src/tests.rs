//! Integration tests exercising whole sessions through the public facades.

use crate::dnstap::{Dnstap, Message, MessageType, SocketFamily, SocketProtocol};
use crate::reader::{ReadStatus, Reader, ReaderError};
use crate::writer::{WriteStatus, Writer};

fn record(identity: &str) -> Dnstap {
    let mut message = Message::new(MessageType::ClientQuery);
    message.socket_family_raw = Some(SocketFamily::Inet as i32);
    message.socket_protocol_raw = Some(SocketProtocol::Udp as i32);
    message.query_address = Some(vec![127, 0, 0, 1]);
    message.query_port = Some(12345);
    message.query_message = Some(vec![0xDE, 0xAD, 0xBE, 0xEF]);
    Dnstap::from_message(message).with_identity(identity.as_bytes())
}

/// Serialize a whole uni-directional session into one byte vector.
fn encode_session(records: &[Dnstap]) -> Vec<u8> {
    let mut writer = Writer::new().unwrap();
    let mut stream = Vec::new();
    let mut out = [0u8; 512];

    for dnstap in records {
        writer.set_record(dnstap.clone());
        loop {
            let status = writer.pop(&mut out, &[]).unwrap();
            stream.extend_from_slice(&out[..writer.popped()]);
            match status {
                WriteStatus::Record => break,
                WriteStatus::Again => {}
                status => panic!("unexpected status {status:?}"),
            }
        }
    }

    writer.stop().unwrap();
    loop {
        let status = writer.pop(&mut out, &[]).unwrap();
        stream.extend_from_slice(&out[..writer.popped()]);
        match status {
            WriteStatus::EndOfData => break,
            WriteStatus::Again => {}
            status => panic!("unexpected status {status:?}"),
        }
    }

    stream
}

/// Decode a whole stream by pushing `chunk`-sized pieces; returns the
/// records and the total number of bytes the reader consumed.
fn decode_session(stream: &[u8], chunk: usize) -> (Vec<Dnstap>, usize) {
    let mut reader = Reader::new().unwrap();
    let mut records = Vec::new();
    let mut out = [0u8; 64];
    let mut at = 0;
    let mut consumed = 0;

    loop {
        let end = stream.len().min(at + chunk);
        let status = reader.push(&stream[at..end], &mut out).unwrap();
        at += reader.pushed();
        consumed += reader.pushed();
        match status {
            ReadStatus::Record => records.push(reader.dnstap().unwrap().clone()),
            ReadStatus::Again => {}
            ReadStatus::NeedMore => {
                assert!(at < stream.len(), "reader starved with the stream consumed");
            }
            ReadStatus::EndOfData => break,
        }
    }

    (records, consumed)
}

mod sessions {
    use super::*;

    #[test]
    fn roundtrip_preserves_records_in_order() {
        let records = [record("writer_write-1"), record("writer_write-2")];
        let stream = encode_session(&records);

        let (decoded, consumed) = decode_session(&stream, stream.len());
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], records[0]);
        assert_eq!(decoded[1], records[1]);
        assert_eq!(
            decoded[0].identity.as_deref(),
            Some(&b"writer_write-1"[..])
        );
        assert_eq!(
            decoded[1].identity.as_deref(),
            Some(&b"writer_write-2"[..])
        );
        assert_eq!(consumed, stream.len());
    }

    #[test]
    fn any_segmentation_yields_the_same_records() {
        let records = [record("seg-a"), record("seg-b"), record("seg-c")];
        let stream = encode_session(&records);
        let (oneshot, _) = decode_session(&stream, stream.len());

        for chunk in [1usize, 2, 3, 5, 7, 11, 64, 4096] {
            let (decoded, consumed) = decode_session(&stream, chunk);
            assert_eq!(decoded, oneshot, "chunk size {chunk}");
            assert_eq!(consumed, stream.len(), "chunk size {chunk}");
        }
    }

    #[test]
    fn two_hundred_byte_session_one_byte_at_a_time() {
        // A small valid session, delivered byte by byte.
        let records = [record("tiny")];
        let stream = encode_session(&records);
        let (oneshot, _) = decode_session(&stream, stream.len());
        let (bytewise, consumed) = decode_session(&stream, 1);
        assert_eq!(bytewise, oneshot);
        assert_eq!(consumed, stream.len());
    }

    #[test]
    fn file_roundtrip_through_stream_helpers() {
        // Write a session into an in-memory "file" using the syscall-style
        // helpers, then read it back the same way.
        let mut file = std::io::Cursor::new(Vec::new());

        let mut writer = Writer::new().unwrap();
        for identity in ["writer_write-1", "writer_write-2"] {
            writer.set_record(record(identity));
            loop {
                match writer.write(&mut file).unwrap() {
                    WriteStatus::Record => break,
                    WriteStatus::Again => {}
                    status => panic!("unexpected status {status:?}"),
                }
            }
        }
        writer.stop().unwrap();
        loop {
            match writer.write(&mut file).unwrap() {
                WriteStatus::EndOfData => break,
                WriteStatus::Again => {}
                status => panic!("unexpected status {status:?}"),
            }
        }

        let mut file = std::io::Cursor::new(file.into_inner());
        let mut reader = Reader::new().unwrap();
        let mut identities = Vec::new();
        loop {
            match reader.read(&mut file).unwrap() {
                ReadStatus::Record => {
                    let dnstap = reader.dnstap().unwrap();
                    identities.push(dnstap.identity.clone().unwrap());
                }
                ReadStatus::Again | ReadStatus::NeedMore => {}
                ReadStatus::EndOfData => break,
            }
        }

        assert_eq!(identities, [b"writer_write-1".to_vec(), b"writer_write-2".to_vec()]);

        // After ENDOFDATA every further call errors and yields no record.
        assert!(matches!(
            reader.read(&mut file),
            Err(ReaderError::Terminated)
        ));
    }

    #[test]
    fn bidirectional_transcripts_mirror() {
        // Drive a bi-directional writer against a bi-directional reader,
        // shuttling bytes both ways until both report end of data.
        let mut writer = Writer::new().unwrap();
        writer.set_bidirectional(true).unwrap();
        let mut reader = Reader::new().unwrap();
        reader.allow_bidirectional(true).unwrap();

        let to_send = [record("mirror-1"), record("mirror-2")];
        let mut next = 0;
        let mut stopped = false;

        let mut wire: Vec<u8> = Vec::new(); // writer -> reader
        let mut replies: Vec<u8> = Vec::new(); // reader -> writer
        let mut out = [0u8; 256];
        let mut reply_out = [0u8; 256];

        let mut writer_done = false;
        let mut reader_done = false;
        let mut received = Vec::new();

        for _ in 0..10_000 {
            if writer_done && reader_done {
                break;
            }

            if !writer_done {
                let status = writer.pop(&mut out, &replies).unwrap();
                wire.extend_from_slice(&out[..writer.popped()]);
                replies.drain(..writer.received());
                match status {
                    WriteStatus::Record => {
                        next += 1;
                        if next < to_send.len() {
                            writer.set_record(to_send[next].clone());
                        } else if !stopped {
                            writer.stop().unwrap();
                            stopped = true;
                        }
                    }
                    WriteStatus::Again | WriteStatus::NeedMore => {}
                    WriteStatus::EndOfData => writer_done = true,
                }
                if next == 0 {
                    writer.set_record(to_send[0].clone());
                }
            }

            if !reader_done {
                let status = reader.push(&wire, &mut reply_out).unwrap();
                wire.drain(..reader.pushed());
                replies.extend_from_slice(&reply_out[..reader.replied()]);
                match status {
                    ReadStatus::Record => received.push(reader.dnstap().unwrap().clone()),
                    ReadStatus::Again | ReadStatus::NeedMore => {}
                    ReadStatus::EndOfData => reader_done = true,
                }
            }
        }

        assert!(writer_done, "writer never finished");
        assert!(reader_done, "reader never finished");
        assert!(reader.is_bidirectional());
        assert_eq!(received, to_send);
    }
}
