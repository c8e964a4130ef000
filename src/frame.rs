//! Provides the Frame Streams framing layer: length-prefixed frames with
//! distinguished *data* and *control* frames, as well as utilities for
//! reading frames incrementally from a byte stream and writing them into
//! caller-supplied buffers.
//!
//! All multi-byte integers on the wire are big-endian. A frame starts with a
//! 32-bit length followed by that many payload bytes; a length of zero is the
//! escape that introduces a control frame, whose payload carries a control
//! type word and a sequence of typed control fields.

use core::fmt;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Control frame types.
///
/// START, STOP and FINISH drive the uni-directional profile; READY and
/// ACCEPT are only seen during the bi-directional handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ControlType {
    Start = 1,
    Stop = 2,
    Finish = 3,
    Accept = 4,
    Ready = 5,
}

impl fmt::Display for ControlType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ControlType::Start => "START".fmt(fmt),
            ControlType::Stop => "STOP".fmt(fmt),
            ControlType::Finish => "FINISH".fmt(fmt),
            ControlType::Accept => "ACCEPT".fmt(fmt),
            ControlType::Ready => "READY".fmt(fmt),
        }
    }
}

/// Control field types. CONTENT_TYPE is the only field defined by the
/// protocol; unknown field type codes are passed through to the session
/// layer, which decides whether they are acceptable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum FieldType {
    ContentType = 1,
}

/// Upper bound on the declared length of a control frame payload. Control
/// frames only carry negotiation fields; a declared length beyond this is a
/// framing error rather than a request for more bytes.
pub const MAX_CONTROL_FRAME_SIZE: u32 = 512;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown control type {0:#010x}")]
    UnknownControlType(u32),

    #[error("control payload length {length} out of bounds ({min}-{max})")]
    InvalidControlLength { length: u32, min: u32, max: u32 },

    #[error("control field of {field_length} bytes overruns the control payload ({left} bytes left)")]
    FieldOverrun { field_length: u32, left: u32 },

    #[error("output buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    #[error("frame payload of {0} bytes exceeds the 32-bit length prefix")]
    Oversized(usize),
}

/// Metadata of the control frame currently being read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Control {
    pub control_type: ControlType,
    /// Size in bytes of the control fields that follow the type word.
    pub length: u32,
}

/// A single control field, borrowed for writing or as read off the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlField<'a> {
    pub field_type: u32,
    pub data: &'a [u8],
}

impl<'a> ControlField<'a> {
    pub fn content_type(data: &'a [u8]) -> Self {
        ControlField {
            field_type: FieldType::ContentType.into(),
            data,
        }
    }

    fn size(&self) -> usize {
        8 + self.data.len()
    }
}

/// One parse step worth of output from [`FrameReader::read`].
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent<'a> {
    /// A READY, ACCEPT or START control frame header was read; its fields
    /// follow as [`FrameEvent::ControlField`] events.
    Control(Control),

    /// The next control field of the current control frame. `data` borrows
    /// from the caller's input and is only valid for this call.
    ControlField { field_type: u32, data: &'a [u8] },

    /// A complete data frame. The payload borrows from the caller's input.
    Data(&'a [u8]),

    /// The input does not hold a complete length prefix or payload yet.
    /// Nothing was consumed; append more bytes and call again.
    NeedMore,

    /// A complete STOP control frame was read.
    Stopped,

    /// A complete FINISH control frame was read.
    Finished,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ReaderState {
    /// Between frames, expecting a length prefix.
    #[default]
    Frame,
    /// Inside a control payload with `left` bytes of fields remaining.
    ControlFields { left: u32 },
}

/// Incremental frame parser.
///
/// `read` never consumes partial frames: it either produces an event and
/// reports the consumed bytes through [`FrameReader::bytes_read`], or yields
/// [`FrameEvent::NeedMore`] with zero bytes consumed. The caller owns the
/// input buffer and is free to compact or refill it between calls.
#[derive(Debug, Default)]
pub struct FrameReader {
    state: ReaderState,
    control: Option<Control>,
    bytes_read: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader::default()
    }

    /// Bytes consumed from the input by the last `read` call.
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Metadata of the most recent control frame.
    pub fn control(&self) -> Option<&Control> {
        self.control.as_ref()
    }

    /// Bytes of control fields still to be read from the current control
    /// payload. Zero once the payload is exhausted.
    pub fn control_length_left(&self) -> u32 {
        match self.state {
            ReaderState::ControlFields { left } => left,
            ReaderState::Frame => 0,
        }
    }

    /// Parse the next event out of `data`.
    pub fn read<'a>(&mut self, data: &'a [u8]) -> Result<FrameEvent<'a>, FrameError> {
        self.bytes_read = 0;
        match self.state {
            ReaderState::Frame => self.read_frame(data),
            ReaderState::ControlFields { left } => self.read_control_field(data, left),
        }
    }

    fn read_frame<'a>(&mut self, data: &'a [u8]) -> Result<FrameEvent<'a>, FrameError> {
        let Some(outer_length) = read_u32(data, 0) else {
            return Ok(FrameEvent::NeedMore);
        };

        if outer_length != 0 {
            let end = 4 + outer_length as usize;
            if data.len() < end {
                return Ok(FrameEvent::NeedMore);
            }
            self.bytes_read = end;
            return Ok(FrameEvent::Data(&data[4..end]));
        }

        // A zero outer length is the escape that introduces a control frame.
        let Some(control_length) = read_u32(data, 4) else {
            return Ok(FrameEvent::NeedMore);
        };
        if control_length < 4 || control_length > MAX_CONTROL_FRAME_SIZE {
            return Err(FrameError::InvalidControlLength {
                length: control_length,
                min: 4,
                max: MAX_CONTROL_FRAME_SIZE,
            });
        }
        let Some(raw_type) = read_u32(data, 8) else {
            return Ok(FrameEvent::NeedMore);
        };
        let control_type = ControlType::try_from(raw_type)
            .map_err(|_| FrameError::UnknownControlType(raw_type))?;
        let fields_length = control_length - 4;

        match control_type {
            ControlType::Stop | ControlType::Finish => {
                // Terminal signals are only reported once the whole control
                // frame, fields included, is in the buffer.
                let end = 8 + control_length as usize;
                if data.len() < end {
                    return Ok(FrameEvent::NeedMore);
                }
                self.control = Some(Control {
                    control_type,
                    length: fields_length,
                });
                self.bytes_read = end;
                tracing::trace!(%control_type, "terminal control frame");
                if control_type == ControlType::Stop {
                    Ok(FrameEvent::Stopped)
                } else {
                    Ok(FrameEvent::Finished)
                }
            }
            ControlType::Ready | ControlType::Accept | ControlType::Start => {
                let control = Control {
                    control_type,
                    length: fields_length,
                };
                self.control = Some(control);
                self.bytes_read = 12;
                self.state = if fields_length == 0 {
                    ReaderState::Frame
                } else {
                    ReaderState::ControlFields {
                        left: fields_length,
                    }
                };
                tracing::trace!(%control_type, fields_length, "control frame");
                Ok(FrameEvent::Control(control))
            }
        }
    }

    fn read_control_field<'a>(
        &mut self,
        data: &'a [u8],
        left: u32,
    ) -> Result<FrameEvent<'a>, FrameError> {
        let Some(field_type) = read_u32(data, 0) else {
            return Ok(FrameEvent::NeedMore);
        };
        let Some(field_length) = read_u32(data, 4) else {
            return Ok(FrameEvent::NeedMore);
        };

        // Field sizes are summed in u64 so a hostile length cannot wrap.
        if 8 + u64::from(field_length) > u64::from(left) {
            return Err(FrameError::FieldOverrun { field_length, left });
        }

        let end = 8 + field_length as usize;
        if data.len() < end {
            return Ok(FrameEvent::NeedMore);
        }

        self.bytes_read = end;
        let left = left - 8 - field_length;
        self.state = if left == 0 {
            ReaderState::Frame
        } else {
            ReaderState::ControlFields { left }
        };
        Ok(FrameEvent::ControlField {
            field_type,
            data: &data[8..end],
        })
    }
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Size on the wire of a data frame carrying `payload_len` bytes.
pub fn frame_size(payload_len: usize) -> usize {
    4 + payload_len
}

/// Size on the wire of a control frame carrying `fields`.
pub fn control_frame_size(fields: &[ControlField<'_>]) -> usize {
    12 + fields.iter().map(ControlField::size).sum::<usize>()
}

/// Write a complete control frame into `out`. Returns the number of bytes
/// written, or [`FrameError::BufferTooSmall`] if `out` cannot hold it.
pub fn write_control(
    out: &mut [u8],
    control_type: ControlType,
    fields: &[ControlField<'_>],
) -> Result<usize, FrameError> {
    let needed = control_frame_size(fields);
    let control_length = needed - 8;
    if control_length > MAX_CONTROL_FRAME_SIZE as usize {
        return Err(FrameError::InvalidControlLength {
            length: control_length as u32,
            min: 4,
            max: MAX_CONTROL_FRAME_SIZE,
        });
    }
    if out.len() < needed {
        return Err(FrameError::BufferTooSmall {
            needed,
            have: out.len(),
        });
    }

    out[0..4].copy_from_slice(&0u32.to_be_bytes());
    out[4..8].copy_from_slice(&(control_length as u32).to_be_bytes());
    out[8..12].copy_from_slice(&u32::from(control_type).to_be_bytes());
    let mut at = 12;
    for field in fields {
        out[at..at + 4].copy_from_slice(&field.field_type.to_be_bytes());
        out[at + 4..at + 8].copy_from_slice(&(field.data.len() as u32).to_be_bytes());
        at += 8;
        out[at..at + field.data.len()].copy_from_slice(field.data);
        at += field.data.len();
    }
    Ok(at)
}

/// Write a START control frame declaring `content_type`.
pub fn write_control_start(out: &mut [u8], content_type: &[u8]) -> Result<usize, FrameError> {
    write_control(
        out,
        ControlType::Start,
        &[ControlField::content_type(content_type)],
    )
}

/// Write a STOP control frame.
pub fn write_control_stop(out: &mut [u8]) -> Result<usize, FrameError> {
    write_control(out, ControlType::Stop, &[])
}

/// Write a data frame around `payload`. A zero-length payload is accepted.
pub fn write_frame(out: &mut [u8], payload: &[u8]) -> Result<usize, FrameError> {
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::Oversized(payload.len()))?;
    let needed = frame_size(payload.len());
    if out.len() < needed {
        return Err(FrameError::BufferTooSmall {
            needed,
            have: out.len(),
        });
    }
    out[0..4].copy_from_slice(&length.to_be_bytes());
    out[4..needed].copy_from_slice(payload);
    Ok(needed)
}
