//! Buffered, resumable ingress facade. Wraps a [`Decoder`] with an owned,
//! growable byte buffer and, when bi-directional sessions are allowed, a
//! reply channel that answers READY with ACCEPT and STOP with FINISH.
//!
//! Each call makes at most one unit of forward progress and returns, so a
//! host loop can interleave other work. Input can be supplied either by
//! copying ([`Reader::push`]) or by letting the reader issue a single read
//! syscall on a stream ([`Reader::read`]).

use crate::buffer::{BufferError, ReadBuffer, WriteBuffer};
use crate::decoder::{DecodeError, DecodeStatus, Decoder};
use crate::dnstap::Dnstap;
use crate::encoder::{EncodeError, EncodeStatus, Encoder};
use crate::{DEFAULT_BUF_SIZE, MAX_BUF_SIZE};
use std::io;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Waiting for input to arrive in the buffer.
    ReadingControl,
    /// Running the decoder over buffered handshake data.
    DecodingControl,
    /// Serializing ACCEPT into the reply buffer.
    EncodingAccept,
    /// Draining the ACCEPT reply towards the peer.
    WritingAccept,
    /// Waiting for record-frame input.
    Reading,
    /// Running the decoder over buffered record frames.
    Decoding,
    /// Serializing FINISH into the reply buffer.
    EncodingFinish,
    /// Draining the FINISH reply towards the peer.
    WritingFinish,
    Done,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::ReadingControl => "reading_control",
            State::DecodingControl => "decoding_control",
            State::EncodingAccept => "encoding_accept",
            State::WritingAccept => "writing_accept",
            State::Reading => "reading",
            State::Decoding => "decoding",
            State::EncodingFinish => "encoding_finish",
            State::WritingFinish => "writing_finish",
            State::Done => "done",
        }
    }
}

/// Outcome of one [`Reader::push`] or [`Reader::read`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// A record is available from [`Reader::dnstap`]; it stays valid until
    /// the next call.
    Record,

    /// More work remains on already-buffered data (or a partially drained
    /// reply); call again.
    Again,

    /// All buffered data was consumed; feed more input.
    NeedMore,

    /// The session terminated cleanly and, on a bi-directional session, the
    /// FINISH reply was fully drained.
    EndOfData,
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("peer requested a bidirectional session but it is not allowed")]
    BidirectionalNotAllowed,

    #[error("peer does not support the dnstap protobuf content type")]
    ContentTypeMismatch,

    #[error("handshake control frame after the session was established")]
    UnexpectedHandshake,

    #[error("reply channel out of sync with the session state")]
    ReplyDesync,

    #[error("transport: {0}")]
    Io(#[from] io::Error),

    #[error("stream ended before STOP")]
    UnexpectedEof,

    #[error("reader is done; create a new one for another session")]
    Terminated,
}

struct Reply {
    encoder: Encoder,
    buf: WriteBuffer,
}

/// Buffered session reader.
pub struct Reader {
    state: State,
    decoder: Decoder,
    buf: ReadBuffer,
    reply: Option<Reply>,
    allow_bidirectional: bool,
    is_bidirectional: bool,
    pushed: usize,
    replied: usize,
}

impl Reader {
    pub fn new() -> Result<Self, ReaderError> {
        Ok(Reader {
            state: State::ReadingControl,
            decoder: Decoder::new(),
            buf: ReadBuffer::new(DEFAULT_BUF_SIZE, DEFAULT_BUF_SIZE, MAX_BUF_SIZE)?,
            reply: None,
            allow_bidirectional: false,
            is_bidirectional: false,
            pushed: 0,
            replied: 0,
        })
    }

    /// Allow the peer to negotiate a bi-directional session. Allocates the
    /// reply buffer on first use.
    pub fn allow_bidirectional(&mut self, allow: bool) -> Result<(), ReaderError> {
        if allow && self.reply.is_none() {
            self.reply = Some(Reply {
                encoder: Encoder::accepting(),
                buf: WriteBuffer::new(DEFAULT_BUF_SIZE, DEFAULT_BUF_SIZE, MAX_BUF_SIZE)?,
            });
        }
        self.allow_bidirectional = allow;
        Ok(())
    }

    /// Whether the peer actually negotiated a bi-directional session.
    pub fn is_bidirectional(&self) -> bool {
        self.is_bidirectional
    }

    pub fn set_bufsize(&mut self, size: usize) -> Result<(), ReaderError> {
        Ok(self.buf.set_size(size)?)
    }

    pub fn set_bufinc(&mut self, inc: usize) -> Result<(), ReaderError> {
        Ok(self.buf.set_inc(inc)?)
    }

    pub fn set_bufmax(&mut self, max: usize) -> Result<(), ReaderError> {
        Ok(self.buf.set_max(max)?)
    }

    /// Bytes consumed from the input slice by the last `push` call.
    pub fn pushed(&self) -> usize {
        self.pushed
    }

    /// Reply bytes produced by the last call: copied into `reply_out` by
    /// `push`, written to the stream by `read`.
    pub fn replied(&self) -> usize {
        self.replied
    }

    /// The most recently decoded record; replaced by the next one.
    pub fn dnstap(&self) -> Option<&Dnstap> {
        self.decoder.dnstap()
    }

    /// Take ownership of the most recently decoded record.
    pub fn take_dnstap(&mut self) -> Option<Dnstap> {
        self.decoder.take_dnstap()
    }

    fn set_state(&mut self, state: State) {
        tracing::trace!(from = self.state.name(), to = state.name(), "reader");
        self.state = state;
    }

    /// Feed up to `data.len()` bytes into the session ([`Reader::pushed`]
    /// tells how many were actually taken) and advance the state machine by
    /// one step. Reply bytes for a bi-directional session are copied into
    /// `reply_out` ([`Reader::replied`] bytes of it).
    pub fn push(&mut self, data: &[u8], reply_out: &mut [u8]) -> Result<ReadStatus, ReaderError> {
        self.pushed = 0;
        self.replied = 0;

        loop {
            match self.state {
                State::ReadingControl | State::Reading => {
                    if data.is_empty() && self.buf.is_empty() {
                        return Ok(ReadStatus::NeedMore);
                    }
                    if !data.is_empty() {
                        self.pushed = self.buf.push(data);
                    }
                    let next = if self.state == State::ReadingControl {
                        State::DecodingControl
                    } else {
                        State::Decoding
                    };
                    self.set_state(next);
                }

                State::DecodingControl => return self.decode_control(data),
                State::Decoding => return self.decode_frames(data),

                State::EncodingAccept => {
                    self.encode_reply(EncodeStatus::Again)?;
                    self.set_state(State::WritingAccept);
                }

                State::WritingAccept => {
                    let reply = self.reply.as_mut().ok_or(ReaderError::ReplyDesync)?;
                    self.replied = reply.buf.drain_into(reply_out);
                    if reply.buf.is_drained() {
                        self.set_state(State::ReadingControl);
                    }
                    return Ok(ReadStatus::Again);
                }

                State::EncodingFinish => {
                    self.encode_reply(EncodeStatus::EndOfData)?;
                    self.set_state(State::WritingFinish);
                }

                State::WritingFinish => {
                    let reply = self.reply.as_mut().ok_or(ReaderError::ReplyDesync)?;
                    self.replied = reply.buf.drain_into(reply_out);
                    if reply.buf.is_drained() {
                        self.set_state(State::Done);
                        return Ok(ReadStatus::EndOfData);
                    }
                    return Ok(ReadStatus::Again);
                }

                State::Done => return Err(ReaderError::Terminated),
            }
        }
    }

    /// Advance the state machine using at most one syscall on `stream`: a
    /// read while ingress is expected, a write while a reply is draining.
    pub fn read<S: io::Read + io::Write>(
        &mut self,
        stream: &mut S,
    ) -> Result<ReadStatus, ReaderError> {
        self.pushed = 0;
        self.replied = 0;

        loop {
            match self.state {
                State::ReadingControl | State::Reading => {
                    if !self.buf.has_space() {
                        self.buf.make_room()?;
                    }
                    let n = stream.read(self.buf.space())?;
                    if n == 0 {
                        return Err(ReaderError::UnexpectedEof);
                    }
                    self.buf.filled(n);
                    let next = if self.state == State::ReadingControl {
                        State::DecodingControl
                    } else {
                        State::Decoding
                    };
                    self.set_state(next);
                }

                State::DecodingControl => return self.decode_control(&[]),
                State::Decoding => return self.decode_frames(&[]),

                State::EncodingAccept => {
                    self.encode_reply(EncodeStatus::Again)?;
                    self.set_state(State::WritingAccept);
                }

                State::WritingAccept => {
                    let reply = self.reply.as_mut().ok_or(ReaderError::ReplyDesync)?;
                    let n = stream.write(reply.buf.pending())?;
                    if n == 0 {
                        return Err(ReaderError::UnexpectedEof);
                    }
                    self.replied = n;
                    reply.buf.drained(n);
                    if reply.buf.is_drained() {
                        self.set_state(State::ReadingControl);
                    }
                    return Ok(ReadStatus::Again);
                }

                State::EncodingFinish => {
                    self.encode_reply(EncodeStatus::EndOfData)?;
                    self.set_state(State::WritingFinish);
                }

                State::WritingFinish => {
                    let reply = self.reply.as_mut().ok_or(ReaderError::ReplyDesync)?;
                    let n = stream.write(reply.buf.pending())?;
                    if n == 0 {
                        return Err(ReaderError::UnexpectedEof);
                    }
                    self.replied = n;
                    reply.buf.drained(n);
                    if reply.buf.is_drained() {
                        self.set_state(State::Done);
                        return Ok(ReadStatus::EndOfData);
                    }
                    return Ok(ReadStatus::Again);
                }

                State::Done => return Err(ReaderError::Terminated),
            }
        }
    }

    /// Decoder step while still in the handshake. `input` is the caller's
    /// unconsumed push slice, used to decide whether NEED_MORE can be
    /// satisfied by another push of pending input.
    fn decode_control(&mut self, input: &[u8]) -> Result<ReadStatus, ReaderError> {
        match self.decoder.decode(self.buf.data())? {
            DecodeStatus::Bidirectional => {
                self.buf.consume(self.decoder.decoded());
                if self.buf.is_empty() {
                    self.set_state(State::ReadingControl);
                }

                if !self.allow_bidirectional {
                    return Err(ReaderError::BidirectionalNotAllowed);
                }
                self.is_bidirectional = true;

                if !self.decoder.ready_content_type() {
                    return Err(ReaderError::ContentTypeMismatch);
                }

                self.set_state(State::EncodingAccept);
                Ok(ReadStatus::Again)
            }

            DecodeStatus::Again => {
                self.buf.consume(self.decoder.decoded());
                if self.buf.is_empty() {
                    self.set_state(State::ReadingControl);
                }
                Ok(ReadStatus::Again)
            }

            DecodeStatus::NeedMore => {
                self.buf.make_room()?;
                self.set_state(State::ReadingControl);
                if !input.is_empty() && self.pushed < input.len() {
                    // There is unconsumed input; have the caller push again.
                    return Ok(ReadStatus::Again);
                }
                Ok(ReadStatus::NeedMore)
            }

            DecodeStatus::Record => {
                self.buf.consume(self.decoder.decoded());
                let next = if self.buf.is_empty() {
                    State::Reading
                } else {
                    State::Decoding
                };
                self.set_state(next);
                Ok(ReadStatus::Record)
            }

            DecodeStatus::EndOfData => self.end_of_data(),
        }
    }

    /// Decoder step after the handshake completed.
    fn decode_frames(&mut self, input: &[u8]) -> Result<ReadStatus, ReaderError> {
        match self.decoder.decode(self.buf.data())? {
            DecodeStatus::Bidirectional => Err(ReaderError::UnexpectedHandshake),

            DecodeStatus::Again => {
                self.buf.consume(self.decoder.decoded());
                if self.buf.is_empty() {
                    self.set_state(State::Reading);
                }
                Ok(ReadStatus::Again)
            }

            DecodeStatus::NeedMore => {
                self.buf.make_room()?;
                self.set_state(State::Reading);
                if !input.is_empty() && self.pushed < input.len() {
                    return Ok(ReadStatus::Again);
                }
                Ok(ReadStatus::NeedMore)
            }

            DecodeStatus::Record => {
                self.buf.consume(self.decoder.decoded());
                if self.buf.is_empty() {
                    self.set_state(State::Reading);
                }
                Ok(ReadStatus::Record)
            }

            DecodeStatus::EndOfData => self.end_of_data(),
        }
    }

    fn end_of_data(&mut self) -> Result<ReadStatus, ReaderError> {
        if self.is_bidirectional {
            self.set_state(State::EncodingFinish);
            return Ok(ReadStatus::Again);
        }
        self.set_state(State::Done);
        Ok(ReadStatus::EndOfData)
    }

    /// Run the reply encoder until it finishes its current frame, growing
    /// the reply buffer as needed, and check it produced the expected step.
    fn encode_reply(&mut self, expect: EncodeStatus) -> Result<(), ReaderError> {
        let reply = self.reply.as_mut().ok_or(ReaderError::ReplyDesync)?;
        loop {
            match reply.encoder.encode(reply.buf.space()) {
                Ok(EncodeStatus::NeedMore) => reply.buf.grow()?,
                Ok(status) => {
                    reply.buf.commit(reply.encoder.encoded());
                    if status != expect {
                        return Err(ReaderError::ReplyDesync);
                    }
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
