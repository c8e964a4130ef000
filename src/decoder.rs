//! Ingress half of the session protocol: drives the framing layer through
//! the handshake and yields decoded records.
//!
//! The decoder is fed slices of the incoming byte stream and reports how far
//! it got after every call; buffering and transport are the caller's problem
//! (usually the [`crate::reader::Reader`] facade). Every error is terminal
//! for the session.

use crate::dnstap::{Dnstap, PROTOBUF_CONTENT_TYPE};
use crate::frame::{ControlType, FieldType, FrameError, FrameEvent, FrameReader};
use prost::Message as _;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Expecting the opening READY, ACCEPT or START control frame.
    ReadingControl,
    /// Collecting the CONTENT_TYPE fields of a READY frame.
    CheckingReady,
    /// Collecting the CONTENT_TYPE fields of an ACCEPT frame.
    CheckingAccept,
    /// READY handled; expecting the START control frame.
    ReadingStart,
    /// Collecting the CONTENT_TYPE field of a START frame.
    CheckingStart,
    /// Expecting data frames or STOP.
    ReadingFrames,
    /// STOP seen on the writer side; expecting FINISH.
    CheckingFinish,
    Done,
    Failed,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::ReadingControl => "reading_control",
            State::CheckingReady => "checking_ready",
            State::CheckingAccept => "checking_accept",
            State::ReadingStart => "reading_start",
            State::CheckingStart => "checking_start",
            State::ReadingFrames => "reading_frames",
            State::CheckingFinish => "checking_finish",
            State::Done => "done",
            State::Failed => "failed",
        }
    }
}

/// Outcome of one [`Decoder::decode`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Forward progress was made; call again with the remaining input.
    Again,

    /// The input holds no complete parse unit; append more bytes first.
    /// Nothing was consumed.
    NeedMore,

    /// The peer negotiated a bidirectional session: after READY the caller
    /// should reply with ACCEPT, after ACCEPT it may proceed to START.
    Bidirectional,

    /// A record was decoded and is available from [`Decoder::dnstap`].
    Record,

    /// The session terminated cleanly (STOP, or FINISH after ACCEPT).
    EndOfData,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("unexpected {event} in session state {state}")]
    UnexpectedEvent {
        event: &'static str,
        state: &'static str,
    },

    #[error("unexpected control field type {0:#010x}, expected CONTENT_TYPE")]
    UnexpectedField(u32),

    #[error("control frame without a CONTENT_TYPE field")]
    MissingContentType,

    #[error("content type mismatch in START")]
    ContentTypeMismatch,

    #[error("record payload: {0}")]
    Payload(#[from] prost::DecodeError),

    #[error("session failed or finished; no further data will be decoded")]
    Terminated,
}

/// Session protocol decoder.
///
/// Decoded records are copied into an internal slot: the record returned by
/// [`Decoder::dnstap`] stays valid until the next `decode` call that yields
/// [`DecodeStatus::Record`], which releases the previous record's storage.
#[derive(Debug)]
pub struct Decoder {
    state: State,
    reader: FrameReader,
    dnstap: Option<Dnstap>,
    ready_content_type: bool,
    accept_content_type: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            state: State::ReadingControl,
            reader: FrameReader::new(),
            dnstap: None,
            ready_content_type: false,
            accept_content_type: false,
        }
    }

    /// Bytes consumed from the input by the last `decode` call.
    pub fn decoded(&self) -> usize {
        self.reader.bytes_read()
    }

    /// The most recently decoded record.
    pub fn dnstap(&self) -> Option<&Dnstap> {
        self.dnstap.as_ref()
    }

    /// Take ownership of the most recently decoded record.
    pub fn take_dnstap(&mut self) -> Option<Dnstap> {
        self.dnstap.take()
    }

    /// Whether the peer's READY frame listed the dnstap protobuf content
    /// type.
    pub fn ready_content_type(&self) -> bool {
        self.ready_content_type
    }

    /// Whether the peer's ACCEPT frame listed the dnstap protobuf content
    /// type.
    pub fn accept_content_type(&self) -> bool {
        self.accept_content_type
    }

    /// Advance the session by at most one frame event parsed out of `data`.
    pub fn decode(&mut self, data: &[u8]) -> Result<DecodeStatus, DecodeError> {
        match self.step(data) {
            Ok(status) => Ok(status),
            Err(err) => {
                // All errors are terminal for the session.
                self.set_state(State::Failed);
                Err(err)
            }
        }
    }

    fn set_state(&mut self, state: State) {
        tracing::trace!(from = self.state.name(), to = state.name(), "decoder");
        self.state = state;
    }

    fn unexpected(&self, event: &FrameEvent<'_>) -> DecodeError {
        let event = match event {
            FrameEvent::Control(_) => "control frame",
            FrameEvent::ControlField { .. } => "control field",
            FrameEvent::Data(_) => "data frame",
            FrameEvent::NeedMore => "need more",
            FrameEvent::Stopped => "STOP",
            FrameEvent::Finished => "FINISH",
        };
        DecodeError::UnexpectedEvent {
            event,
            state: self.state.name(),
        }
    }

    fn step(&mut self, data: &[u8]) -> Result<DecodeStatus, DecodeError> {
        match self.state {
            State::ReadingControl => match self.reader.read(data)? {
                FrameEvent::Control(control) => {
                    if control.length == 0 {
                        return Err(DecodeError::MissingContentType);
                    }
                    let next = match control.control_type {
                        ControlType::Ready => State::CheckingReady,
                        ControlType::Accept => State::CheckingAccept,
                        ControlType::Start => State::CheckingStart,
                        // STOP and FINISH surface as their own events.
                        _ => return Err(self.unexpected(&FrameEvent::Control(control))),
                    };
                    self.set_state(next);
                    Ok(DecodeStatus::Again)
                }
                FrameEvent::NeedMore => Ok(DecodeStatus::NeedMore),
                event => Err(self.unexpected(&event)),
            },

            State::CheckingReady => match self.reader.read(data)? {
                FrameEvent::ControlField { field_type, data } => {
                    if field_type != u32::from(FieldType::ContentType) {
                        return Err(DecodeError::UnexpectedField(field_type));
                    }
                    // READY may list several content types; remember whether
                    // any of them is ours.
                    if data == PROTOBUF_CONTENT_TYPE {
                        self.ready_content_type = true;
                    }
                    if self.reader.control_length_left() == 0 {
                        self.set_state(State::ReadingStart);
                        return Ok(DecodeStatus::Bidirectional);
                    }
                    Ok(DecodeStatus::Again)
                }
                FrameEvent::NeedMore => Ok(DecodeStatus::NeedMore),
                event => Err(self.unexpected(&event)),
            },

            State::CheckingAccept => match self.reader.read(data)? {
                FrameEvent::ControlField { field_type, data } => {
                    if field_type != u32::from(FieldType::ContentType) {
                        return Err(DecodeError::UnexpectedField(field_type));
                    }
                    if data == PROTOBUF_CONTENT_TYPE {
                        self.accept_content_type = true;
                    }
                    if self.reader.control_length_left() == 0 {
                        self.set_state(State::CheckingFinish);
                        return Ok(DecodeStatus::Bidirectional);
                    }
                    Ok(DecodeStatus::Again)
                }
                FrameEvent::NeedMore => Ok(DecodeStatus::NeedMore),
                event => Err(self.unexpected(&event)),
            },

            State::ReadingStart => match self.reader.read(data)? {
                FrameEvent::Control(control)
                    if control.control_type == ControlType::Start =>
                {
                    if control.length == 0 {
                        return Err(DecodeError::MissingContentType);
                    }
                    self.set_state(State::CheckingStart);
                    Ok(DecodeStatus::Again)
                }
                FrameEvent::NeedMore => Ok(DecodeStatus::NeedMore),
                event => Err(self.unexpected(&event)),
            },

            State::CheckingStart => match self.reader.read(data)? {
                FrameEvent::ControlField { field_type, data } => {
                    if field_type != u32::from(FieldType::ContentType) {
                        return Err(DecodeError::UnexpectedField(field_type));
                    }
                    // Unlike the handshake frames, START pins the session to
                    // exactly one content type.
                    if data != PROTOBUF_CONTENT_TYPE {
                        return Err(DecodeError::ContentTypeMismatch);
                    }
                    self.set_state(State::ReadingFrames);
                    Ok(DecodeStatus::Again)
                }
                FrameEvent::NeedMore => Ok(DecodeStatus::NeedMore),
                event => Err(self.unexpected(&event)),
            },

            State::ReadingFrames => match self.reader.read(data)? {
                FrameEvent::Data(payload) => {
                    // Replacing the slot releases the previous record.
                    self.dnstap = Some(Dnstap::decode(payload)?);
                    Ok(DecodeStatus::Record)
                }
                FrameEvent::Stopped => {
                    self.set_state(State::Done);
                    Ok(DecodeStatus::EndOfData)
                }
                FrameEvent::NeedMore => Ok(DecodeStatus::NeedMore),
                event => Err(self.unexpected(&event)),
            },

            State::CheckingFinish => match self.reader.read(data)? {
                FrameEvent::Finished => {
                    self.set_state(State::Done);
                    Ok(DecodeStatus::EndOfData)
                }
                FrameEvent::NeedMore => Ok(DecodeStatus::NeedMore),
                event => Err(self.unexpected(&event)),
            },

            State::Done | State::Failed => Err(DecodeError::Terminated),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}
