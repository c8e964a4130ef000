//! Buffered, resumable egress facade. Wraps an [`Encoder`] with an owned,
//! growable byte buffer and, on bi-directional sessions, an ingress channel
//! that parses the peer's ACCEPT and FINISH replies.
//!
//! Bytes can be taken out either by copying ([`Writer::pop`]) or by letting
//! the writer issue a single syscall on a stream ([`Writer::write`]).

use crate::buffer::{BufferError, ReadBuffer, WriteBuffer};
use crate::decoder::{DecodeError, DecodeStatus, Decoder};
use crate::dnstap::Dnstap;
use crate::encoder::{EncodeError, EncodeStatus, Encoder};
use crate::{DEFAULT_BUF_SIZE, MAX_BUF_SIZE};
use std::io;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Serializing READY into the buffer.
    EncodingReady,
    /// Draining READY towards the peer.
    WritingReady,
    /// Waiting for the peer's ACCEPT bytes.
    ReadingAccept,
    /// Parsing buffered ACCEPT bytes.
    DecodingAccept,
    /// Serializing START or a record frame.
    Encoding,
    /// Draining encoded frames towards the peer.
    Writing,
    /// `stop()` was requested; draining what is left first.
    Stopping,
    /// Serializing STOP.
    EncodingStop,
    /// Draining STOP towards the peer.
    WritingStop,
    /// Waiting for the peer's FINISH bytes.
    ReadingFinish,
    /// Parsing buffered FINISH bytes.
    DecodingFinish,
    Done,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::EncodingReady => "encoding_ready",
            State::WritingReady => "writing_ready",
            State::ReadingAccept => "reading_accept",
            State::DecodingAccept => "decoding_accept",
            State::Encoding => "encoding",
            State::Writing => "writing",
            State::Stopping => "stopping",
            State::EncodingStop => "encoding_stop",
            State::WritingStop => "writing_stop",
            State::ReadingFinish => "reading_finish",
            State::DecodingFinish => "decoding_finish",
            State::Done => "done",
        }
    }
}

/// Outcome of one [`Writer::pop`] or [`Writer::write`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// The current record's frame was fully serialized; set the next record
    /// (or call [`Writer::stop`]) and keep popping.
    Record,

    /// More work remains (handshake frames, partially drained output);
    /// call again.
    Again,

    /// On a bi-directional session: the peer's reply bytes are needed
    /// before the session can proceed.
    NeedMore,

    /// STOP was drained (uni-directional) or FINISH was parsed
    /// (bi-directional); the session is over.
    EndOfData,
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("peer does not support the dnstap protobuf content type")]
    ContentTypeMismatch,

    #[error("unexpected reply from the peer")]
    UnexpectedReply,

    #[error("reply channel out of sync with the session state")]
    ReplyDesync,

    #[error("transport: {0}")]
    Io(#[from] io::Error),

    #[error("stream ended before the session terminated")]
    UnexpectedEof,

    #[error("writer is done; create a new one for another session")]
    Terminated,
}

struct Reply {
    decoder: Decoder,
    buf: ReadBuffer,
}

/// Buffered session writer.
pub struct Writer {
    state: State,
    encoder: Encoder,
    buf: WriteBuffer,
    reply: Option<Reply>,
    bidirectional: bool,
    popped: usize,
    received: usize,
}

impl Writer {
    pub fn new() -> Result<Self, WriterError> {
        Ok(Writer {
            state: State::Encoding,
            encoder: Encoder::new(),
            buf: WriteBuffer::new(DEFAULT_BUF_SIZE, DEFAULT_BUF_SIZE, MAX_BUF_SIZE)?,
            reply: None,
            bidirectional: false,
            popped: 0,
            received: 0,
        })
    }

    /// Switch between the uni-directional (START first) and bi-directional
    /// (READY first) profiles. Must be called before the first `pop` or
    /// `write`. Allocates the ingress buffer on first use.
    pub fn set_bidirectional(&mut self, bidirectional: bool) -> Result<(), WriterError> {
        if bidirectional {
            if self.reply.is_none() {
                self.reply = Some(Reply {
                    decoder: Decoder::new(),
                    buf: ReadBuffer::new(DEFAULT_BUF_SIZE, DEFAULT_BUF_SIZE, MAX_BUF_SIZE)?,
                });
            }
            self.encoder.restart_ready();
            self.set_state(State::EncodingReady);
        } else {
            self.encoder.restart_start();
            self.set_state(State::Encoding);
        }
        self.bidirectional = bidirectional;
        Ok(())
    }

    pub fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    pub fn set_bufsize(&mut self, size: usize) -> Result<(), WriterError> {
        Ok(self.buf.set_size(size)?)
    }

    pub fn set_bufinc(&mut self, inc: usize) -> Result<(), WriterError> {
        Ok(self.buf.set_inc(inc)?)
    }

    pub fn set_bufmax(&mut self, max: usize) -> Result<(), WriterError> {
        Ok(self.buf.set_max(max)?)
    }

    /// Select the record serialized by the next `pop`/`write`; call between
    /// record completions.
    pub fn set_record(&mut self, dnstap: Dnstap) {
        self.encoder.set_record(dnstap);
    }

    /// Bytes produced by the last call: copied into `out` by `pop`, written
    /// to the stream by `write`.
    pub fn popped(&self) -> usize {
        self.popped
    }

    /// Bytes consumed from the peer's reply slice by the last `pop` call.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Request session termination: the next `pop`/`write` calls drain any
    /// pending frames and then emit STOP. Only legal while record frames
    /// are being encoded.
    pub fn stop(&mut self) -> Result<(), WriterError> {
        self.encoder.stop()?;
        self.set_state(State::Stopping);
        Ok(())
    }

    fn set_state(&mut self, state: State) {
        tracing::trace!(from = self.state.name(), to = state.name(), "writer");
        self.state = state;
    }

    /// Advance the session by one step, placing up to `out.len()` bytes of
    /// wire data into `out` ([`Writer::popped`] bytes of it) and consuming
    /// up to [`Writer::received`] bytes of the peer's reply from `reply_in`.
    pub fn pop(&mut self, out: &mut [u8], reply_in: &[u8]) -> Result<WriteStatus, WriterError> {
        self.popped = 0;
        self.received = 0;
        let mut status = WriteStatus::Again;

        loop {
            match self.state {
                State::EncodingReady => {
                    status = self.run_encoder()?;
                    if self.buf.is_drained() {
                        return Ok(status);
                    }
                    self.set_state(State::WritingReady);
                }

                State::WritingReady => {
                    self.popped = self.buf.drain_into(out);
                    if !self.buf.is_drained() {
                        return Ok(status);
                    }
                    self.set_state(State::ReadingAccept);
                }

                State::ReadingAccept => {
                    let reply = self.reply.as_mut().ok_or(WriterError::ReplyDesync)?;
                    if reply_in.is_empty() && reply.buf.is_empty() {
                        return Ok(WriteStatus::NeedMore);
                    }
                    if !reply_in.is_empty() {
                        self.received = reply.buf.push(reply_in);
                    }
                    self.set_state(State::DecodingAccept);
                }

                State::DecodingAccept => return self.decode_accept(),

                State::Encoding => {
                    status = self.run_encoder()?;
                    if self.buf.is_drained() {
                        return Ok(status);
                    }
                    self.set_state(State::Writing);
                }

                State::Writing => {
                    self.popped = self.buf.drain_into(out);
                    if self.buf.is_drained() {
                        self.set_state(State::Encoding);
                    }
                    return Ok(status);
                }

                State::Stopping => {
                    if !self.buf.is_drained() {
                        self.popped = self.buf.drain_into(out);
                        return Ok(WriteStatus::Again);
                    }
                    self.set_state(State::EncodingStop);
                }

                State::EncodingStop => {
                    status = self.run_encoder()?;
                    if status != WriteStatus::EndOfData {
                        return Ok(status);
                    }
                    self.set_state(State::WritingStop);
                }

                State::WritingStop => {
                    if !self.buf.is_drained() {
                        self.popped = self.buf.drain_into(out);
                        if !self.buf.is_drained() {
                            return Ok(WriteStatus::Again);
                        }
                    }
                    return self.stop_drained();
                }

                State::ReadingFinish => {
                    let reply = self.reply.as_mut().ok_or(WriterError::ReplyDesync)?;
                    if reply_in.is_empty() && reply.buf.is_empty() {
                        return Ok(WriteStatus::NeedMore);
                    }
                    if !reply_in.is_empty() {
                        self.received = reply.buf.push(reply_in);
                    }
                    self.set_state(State::DecodingFinish);
                }

                State::DecodingFinish => return self.decode_finish(),

                State::Done => return Err(WriterError::Terminated),
            }
        }
    }

    /// Advance the session using at most one syscall on `stream`: a write
    /// while output is pending, a read while a reply is expected.
    pub fn write<S: io::Read + io::Write>(
        &mut self,
        stream: &mut S,
    ) -> Result<WriteStatus, WriterError> {
        self.popped = 0;
        self.received = 0;
        let mut status = WriteStatus::Again;

        loop {
            match self.state {
                State::EncodingReady => {
                    status = self.run_encoder()?;
                    if self.buf.is_drained() {
                        return Ok(status);
                    }
                    self.set_state(State::WritingReady);
                }

                State::WritingReady => {
                    let n = self.write_pending(stream)?;
                    self.popped = n;
                    if !self.buf.is_drained() {
                        return Ok(status);
                    }
                    self.set_state(State::ReadingAccept);
                    return Ok(WriteStatus::Again);
                }

                State::ReadingAccept => {
                    self.read_reply(stream)?;
                    self.set_state(State::DecodingAccept);
                }

                State::DecodingAccept => return self.decode_accept(),

                State::Encoding => {
                    status = self.run_encoder()?;
                    if self.buf.is_drained() {
                        return Ok(status);
                    }
                    self.set_state(State::Writing);
                }

                State::Writing => {
                    let n = self.write_pending(stream)?;
                    self.popped = n;
                    if self.buf.is_drained() {
                        self.set_state(State::Encoding);
                    }
                    return Ok(status);
                }

                State::Stopping => {
                    if !self.buf.is_drained() {
                        let n = self.write_pending(stream)?;
                        self.popped = n;
                        return Ok(WriteStatus::Again);
                    }
                    self.set_state(State::EncodingStop);
                }

                State::EncodingStop => {
                    status = self.run_encoder()?;
                    if status != WriteStatus::EndOfData {
                        return Ok(status);
                    }
                    self.set_state(State::WritingStop);
                }

                State::WritingStop => {
                    if !self.buf.is_drained() {
                        let n = self.write_pending(stream)?;
                        self.popped = n;
                        if !self.buf.is_drained() {
                            return Ok(WriteStatus::Again);
                        }
                    }
                    return self.stop_drained();
                }

                State::ReadingFinish => {
                    self.read_reply(stream)?;
                    self.set_state(State::DecodingFinish);
                }

                State::DecodingFinish => return self.decode_finish(),

                State::Done => return Err(WriterError::Terminated),
            }
        }
    }

    fn write_pending<S: io::Write>(&mut self, stream: &mut S) -> Result<usize, WriterError> {
        let n = stream.write(self.buf.pending())?;
        if n == 0 {
            return Err(WriterError::UnexpectedEof);
        }
        self.buf.drained(n);
        Ok(n)
    }

    fn read_reply<S: io::Read>(&mut self, stream: &mut S) -> Result<(), WriterError> {
        let reply = self.reply.as_mut().ok_or(WriterError::ReplyDesync)?;
        if !reply.buf.has_space() {
            reply.buf.make_room()?;
        }
        let n = stream.read(reply.buf.space())?;
        if n == 0 {
            return Err(WriterError::UnexpectedEof);
        }
        reply.buf.filled(n);
        Ok(())
    }

    fn stop_drained(&mut self) -> Result<WriteStatus, WriterError> {
        if self.bidirectional {
            self.set_state(State::ReadingFinish);
            return Ok(WriteStatus::Again);
        }
        self.set_state(State::Done);
        Ok(WriteStatus::EndOfData)
    }

    /// One encoder step into the egress buffer, growing it while the next
    /// frame does not fit.
    fn run_encoder(&mut self) -> Result<WriteStatus, WriterError> {
        loop {
            let status = match self.encoder.encode(self.buf.space()) {
                Ok(EncodeStatus::NeedMore) => {
                    self.buf.grow()?;
                    continue;
                }
                Ok(EncodeStatus::Record) => WriteStatus::Record,
                Ok(EncodeStatus::Again) => WriteStatus::Again,
                Ok(EncodeStatus::EndOfData) => WriteStatus::EndOfData,
                Err(err) => return Err(err.into()),
            };
            self.buf.commit(self.encoder.encoded());
            return Ok(status);
        }
    }

    fn decode_accept(&mut self) -> Result<WriteStatus, WriterError> {
        let reply = self.reply.as_mut().ok_or(WriterError::ReplyDesync)?;
        match reply.decoder.decode(reply.buf.data())? {
            DecodeStatus::Bidirectional => {
                reply.buf.consume(reply.decoder.decoded());
                if !reply.decoder.accept_content_type() {
                    return Err(WriterError::ContentTypeMismatch);
                }
                self.set_state(State::Encoding);
                Ok(WriteStatus::Again)
            }
            DecodeStatus::Again => {
                reply.buf.consume(reply.decoder.decoded());
                if reply.buf.is_empty() {
                    self.set_state(State::ReadingAccept);
                }
                Ok(WriteStatus::Again)
            }
            DecodeStatus::NeedMore => {
                reply.buf.make_room()?;
                self.set_state(State::ReadingAccept);
                Ok(WriteStatus::NeedMore)
            }
            DecodeStatus::Record | DecodeStatus::EndOfData => Err(WriterError::UnexpectedReply),
        }
    }

    fn decode_finish(&mut self) -> Result<WriteStatus, WriterError> {
        let reply = self.reply.as_mut().ok_or(WriterError::ReplyDesync)?;
        match reply.decoder.decode(reply.buf.data())? {
            DecodeStatus::EndOfData => {
                reply.buf.consume(reply.decoder.decoded());
                self.set_state(State::Done);
                Ok(WriteStatus::EndOfData)
            }
            DecodeStatus::NeedMore => {
                reply.buf.make_room()?;
                self.set_state(State::ReadingFinish);
                Ok(WriteStatus::NeedMore)
            }
            _ => Err(WriterError::UnexpectedReply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnstap::PROTOBUF_CONTENT_TYPE;
    use crate::frame::{self, ControlField, ControlType};

    fn record(identity: &str) -> Dnstap {
        Dnstap::default().with_identity(identity.as_bytes())
    }

    fn control_frame(control_type: ControlType, fields: &[ControlField<'_>]) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let n = frame::write_control(&mut buf, control_type, fields).unwrap();
        buf.truncate(n);
        buf
    }

    /// Pop until the expected status shows up, appending wire bytes to
    /// `stream` and feeding `reply` in. Anything other than AGAIN on the
    /// way is a test failure.
    fn pop_until(writer: &mut Writer, stream: &mut Vec<u8>, reply: &mut &[u8], until: WriteStatus) {
        let mut out = [0u8; 256];
        loop {
            let status = writer.pop(&mut out, reply).unwrap();
            stream.extend_from_slice(&out[..writer.popped()]);
            *reply = &reply[writer.received()..];
            if status == until {
                return;
            }
            assert_eq!(status, WriteStatus::Again);
        }
    }

    #[test]
    fn unidirectional_pop_produces_valid_stream() {
        let mut writer = Writer::new().unwrap();
        let mut stream = Vec::new();
        let mut reply: &[u8] = &[];

        writer.set_record(record("writer_write-1"));
        pop_until(&mut writer, &mut stream, &mut reply, WriteStatus::Record);
        writer.set_record(record("writer_write-2"));
        pop_until(&mut writer, &mut stream, &mut reply, WriteStatus::Record);
        writer.stop().unwrap();
        pop_until(&mut writer, &mut stream, &mut reply, WriteStatus::EndOfData);

        // The stream opens with START and ends with the STOP literal.
        let start = control_frame(
            ControlType::Start,
            &[ControlField::content_type(PROTOBUF_CONTENT_TYPE)],
        );
        assert_eq!(&stream[..start.len()], &start[..]);
        assert_eq!(
            &stream[stream.len() - 12..],
            &[
                0x00, 0x00, 0x00, 0x00, // escape
                0x00, 0x00, 0x00, 0x04, // control payload length
                0x00, 0x00, 0x00, 0x02, // STOP
            ][..]
        );

        // Terminal afterwards.
        let mut out = [0u8; 16];
        assert!(matches!(
            writer.pop(&mut out, &[]),
            Err(WriterError::Terminated)
        ));
    }

    #[test]
    fn pop_drains_across_small_buffers() {
        let mut writer = Writer::new().unwrap();
        writer.set_record(record("drip"));

        // A three byte out buffer forces every frame to drain in dribbles.
        let mut stream = Vec::new();
        let mut out = [0u8; 3];
        loop {
            let status = writer.pop(&mut out, &[]).unwrap();
            stream.extend_from_slice(&out[..writer.popped()]);
            match status {
                WriteStatus::Record => break,
                WriteStatus::Again => {}
                status => panic!("unexpected status {status:?}"),
            }
        }

        // Part of the record frame is still pending; stopping drains it
        // before STOP goes out.
        writer.stop().unwrap();
        loop {
            let status = writer.pop(&mut out, &[]).unwrap();
            stream.extend_from_slice(&out[..writer.popped()]);
            if status == WriteStatus::EndOfData {
                break;
            }
        }

        // A reader accepts the dribbled stream.
        let mut reader = crate::reader::Reader::new().unwrap();
        let mut sink = [0u8; 16];
        let mut records = 0;
        let mut at = 0;
        loop {
            match reader.push(&stream[at..], &mut sink).unwrap() {
                crate::reader::ReadStatus::Record => records += 1,
                crate::reader::ReadStatus::EndOfData => break,
                _ => {}
            }
            at += reader.pushed();
        }
        assert_eq!(records, 1);
    }

    #[test]
    fn stop_is_only_legal_while_encoding_records() {
        let mut writer = Writer::new().unwrap();
        writer.set_bidirectional(true).unwrap();

        // Still in the READY handshake: stop() must fail without moving.
        assert!(matches!(
            writer.stop(),
            Err(WriterError::Encode(EncodeError::NotStoppable))
        ));

        // READY still drains and the writer then waits for ACCEPT.
        let mut out = [0u8; 256];
        let status = writer.pop(&mut out, &[]).unwrap();
        assert_eq!(status, WriteStatus::NeedMore);
        assert!(writer.popped() > 0);
    }

    #[test]
    fn bidirectional_pop_handshake() {
        let mut writer = Writer::new().unwrap();
        writer.set_bidirectional(true).unwrap();

        let mut out = [0u8; 256];
        let mut stream = Vec::new();

        // READY drains, then the writer asks for the peer's reply.
        let status = loop {
            let status = writer.pop(&mut out, &[]).unwrap();
            stream.extend_from_slice(&out[..writer.popped()]);
            if status != WriteStatus::Again {
                break status;
            }
        };
        assert_eq!(status, WriteStatus::NeedMore);
        let ready = control_frame(
            ControlType::Ready,
            &[ControlField::content_type(PROTOBUF_CONTENT_TYPE)],
        );
        assert_eq!(stream, ready);

        // Feed ACCEPT; the writer proceeds to START and the record.
        let accept = control_frame(
            ControlType::Accept,
            &[ControlField::content_type(PROTOBUF_CONTENT_TYPE)],
        );
        let mut reply: &[u8] = &accept;
        writer.set_record(record("bidi"));
        stream.clear();
        let mut saw_record = false;
        loop {
            let status = writer.pop(&mut out, reply).unwrap();
            stream.extend_from_slice(&out[..writer.popped()]);
            reply = &reply[writer.received()..];
            match status {
                WriteStatus::Record => {
                    saw_record = true;
                    break;
                }
                WriteStatus::Again => {}
                status => panic!("unexpected status {status:?}"),
            }
        }
        assert!(saw_record);
        assert!(reply.is_empty(), "whole ACCEPT consumed");

        // STOP, then FINISH completes the session.
        writer.stop().unwrap();
        let finish = control_frame(ControlType::Finish, &[]);
        let mut reply: &[u8] = &finish;
        let status = loop {
            let status = writer.pop(&mut out, reply).unwrap();
            stream.extend_from_slice(&out[..writer.popped()]);
            reply = &reply[writer.received()..];
            match status {
                WriteStatus::Again => {}
                WriteStatus::NeedMore if !reply.is_empty() => {}
                status => break status,
            }
        };
        assert_eq!(status, WriteStatus::EndOfData);
    }

    #[test]
    fn accept_with_wrong_content_type_is_fatal() {
        let mut writer = Writer::new().unwrap();
        writer.set_bidirectional(true).unwrap();

        let mut out = [0u8; 256];
        loop {
            if writer.pop(&mut out, &[]).unwrap() == WriteStatus::NeedMore {
                break;
            }
        }

        let accept = control_frame(
            ControlType::Accept,
            &[ControlField::content_type(b"protobuf:other")],
        );
        let mut reply: &[u8] = &accept;
        let err = loop {
            match writer.pop(&mut out, reply) {
                Ok(_) => reply = &reply[writer.received()..],
                Err(err) => break err,
            }
        };
        assert!(matches!(err, WriterError::ContentTypeMismatch));
    }

    #[test]
    fn write_to_stream_roundtrip() {
        let mut io = std::io::Cursor::new(Vec::new());

        let mut writer = Writer::new().unwrap();
        writer.set_record(record("via-fd"));
        loop {
            if writer.write(&mut io).unwrap() == WriteStatus::Record {
                break;
            }
        }
        // Drain whatever is still pending, then terminate.
        writer.stop().unwrap();
        loop {
            if writer.write(&mut io).unwrap() == WriteStatus::EndOfData {
                break;
            }
        }

        let mut io = std::io::Cursor::new(io.into_inner());
        let mut reader = crate::reader::Reader::new().unwrap();
        let mut records = 0;
        loop {
            match reader.read(&mut io).unwrap() {
                crate::reader::ReadStatus::Record => records += 1,
                crate::reader::ReadStatus::EndOfData => break,
                _ => {}
            }
        }
        assert_eq!(records, 1);
    }
}
