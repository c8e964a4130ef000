//! Egress half of the session protocol: serializes the handshake and record
//! frames into caller-supplied buffers, one step per call.

use crate::dnstap::{Dnstap, PROTOBUF_CONTENT_TYPE};
use crate::frame::{self, ControlField, ControlType, FrameError};
use prost::Message as _;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Next frame out is READY (bi-directional sender).
    ControlReady,
    /// Next frame out is START.
    ControlStart,
    /// Next frame out is ACCEPT (receiver's reply channel).
    ControlAccept,
    /// Next frame out is FINISH.
    ControlFinish,
    /// Emitting record frames.
    Frames,
    /// Next frame out is STOP.
    ControlStop,
    Done,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::ControlReady => "control_ready",
            State::ControlStart => "control_start",
            State::ControlAccept => "control_accept",
            State::ControlFinish => "control_finish",
            State::Frames => "frames",
            State::ControlStop => "control_stop",
            State::Done => "done",
        }
    }
}

/// Outcome of one [`Encoder::encode`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeStatus {
    /// The current record was fully serialized as a data frame.
    Record,

    /// A handshake control frame was written; call again for the next step.
    Again,

    /// The output buffer is too small for the next frame. State did not
    /// advance and nothing was written.
    NeedMore,

    /// The closing STOP or FINISH was written; the session is over.
    EndOfData,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("no record to encode; call set_record() first")]
    NoRecord,

    #[error("stop() is only valid while encoding record frames")]
    NotStoppable,

    #[error("session already finished")]
    Terminated,
}

/// Session protocol encoder.
///
/// The opening state decides the session profile: [`Encoder::new`] starts
/// with START (uni-directional), [`Encoder::handshaking`] with READY
/// (bi-directional sender) and [`Encoder::accepting`] with ACCEPT (the
/// receiver's reply channel, which later emits FINISH).
#[derive(Debug)]
pub struct Encoder {
    state: State,
    dnstap: Option<Dnstap>,
    encoded: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            state: State::ControlStart,
            dnstap: None,
            encoded: 0,
        }
    }

    pub fn handshaking() -> Self {
        Encoder {
            state: State::ControlReady,
            ..Encoder::new()
        }
    }

    pub fn accepting() -> Self {
        Encoder {
            state: State::ControlAccept,
            ..Encoder::new()
        }
    }

    /// Restart the handshake at READY. Only meaningful before any frame has
    /// been emitted; used when a writer is reconfigured as bi-directional.
    pub(crate) fn restart_ready(&mut self) {
        self.set_state(State::ControlReady);
    }

    /// Restart at START, the uni-directional opening.
    pub(crate) fn restart_start(&mut self) {
        self.set_state(State::ControlStart);
    }

    /// Select the record serialized by the next `encode` in the frames
    /// state. The record is kept until replaced.
    pub fn set_record(&mut self, dnstap: Dnstap) {
        self.dnstap = Some(dnstap);
    }

    /// Bytes written into the output by the last `encode` call.
    pub fn encoded(&self) -> usize {
        self.encoded
    }

    /// After the record frames, make the next `encode` emit STOP.
    pub fn stop(&mut self) -> Result<(), EncodeError> {
        match self.state {
            State::Frames => {
                self.set_state(State::ControlStop);
                Ok(())
            }
            _ => Err(EncodeError::NotStoppable),
        }
    }

    fn set_state(&mut self, state: State) {
        tracing::trace!(from = self.state.name(), to = state.name(), "encoder");
        self.state = state;
    }

    /// Serialize the next frame of the session into `out`. On
    /// [`EncodeStatus::NeedMore`] nothing was written and the state is
    /// unchanged; retry with a larger buffer.
    pub fn encode(&mut self, out: &mut [u8]) -> Result<EncodeStatus, EncodeError> {
        self.encoded = 0;
        let content_type = [ControlField::content_type(PROTOBUF_CONTENT_TYPE)];

        match self.state {
            State::ControlReady => {
                match frame::write_control(out, ControlType::Ready, &content_type) {
                    Ok(n) => {
                        self.encoded = n;
                        self.set_state(State::ControlStart);
                        Ok(EncodeStatus::Again)
                    }
                    Err(FrameError::BufferTooSmall { .. }) => Ok(EncodeStatus::NeedMore),
                    Err(err) => Err(err.into()),
                }
            }

            State::ControlStart => match frame::write_control_start(out, PROTOBUF_CONTENT_TYPE) {
                Ok(n) => {
                    self.encoded = n;
                    self.set_state(State::Frames);
                    Ok(EncodeStatus::Again)
                }
                Err(FrameError::BufferTooSmall { .. }) => Ok(EncodeStatus::NeedMore),
                Err(err) => Err(err.into()),
            },

            State::ControlAccept => {
                match frame::write_control(out, ControlType::Accept, &content_type) {
                    Ok(n) => {
                        self.encoded = n;
                        self.set_state(State::ControlFinish);
                        Ok(EncodeStatus::Again)
                    }
                    Err(FrameError::BufferTooSmall { .. }) => Ok(EncodeStatus::NeedMore),
                    Err(err) => Err(err.into()),
                }
            }

            State::ControlFinish => match frame::write_control(out, ControlType::Finish, &[]) {
                Ok(n) => {
                    self.encoded = n;
                    self.set_state(State::Done);
                    Ok(EncodeStatus::EndOfData)
                }
                Err(FrameError::BufferTooSmall { .. }) => Ok(EncodeStatus::NeedMore),
                Err(err) => Err(err.into()),
            },

            State::Frames => {
                let dnstap = self.dnstap.as_ref().ok_or(EncodeError::NoRecord)?;
                let payload_len = dnstap.encoded_len();
                if out.len() < frame::frame_size(payload_len) {
                    return Ok(EncodeStatus::NeedMore);
                }
                let mut payload = Vec::with_capacity(payload_len);
                dnstap
                    .encode(&mut payload)
                    .expect("vec encoding cannot run out of space");
                self.encoded = frame::write_frame(out, &payload)?;
                Ok(EncodeStatus::Record)
            }

            State::ControlStop => match frame::write_control_stop(out) {
                Ok(n) => {
                    self.encoded = n;
                    self.set_state(State::Done);
                    Ok(EncodeStatus::EndOfData)
                }
                Err(FrameError::BufferTooSmall { .. }) => Ok(EncodeStatus::NeedMore),
                Err(err) => Err(err.into()),
            },

            State::Done => Err(EncodeError::Terminated),
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Encoder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodeStatus, Decoder};

    fn record(identity: &str) -> Dnstap {
        Dnstap::default().with_identity(identity.as_bytes())
    }

    #[test]
    fn unidirectional_sequence() {
        let mut encoder = Encoder::new();
        let mut out = vec![0u8; 1024];

        // START, record, record, STOP.
        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::Again);
        assert!(encoder.encoded() > 0);

        encoder.set_record(record("a"));
        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::Record);

        encoder.set_record(record("b"));
        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::Record);

        encoder.stop().unwrap();
        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::EndOfData);

        assert!(matches!(
            encoder.encode(&mut out),
            Err(EncodeError::Terminated)
        ));
    }

    #[test]
    fn frames_without_record_is_an_error() {
        let mut encoder = Encoder::new();
        let mut out = vec![0u8; 1024];
        encoder.encode(&mut out).unwrap();
        assert!(matches!(
            encoder.encode(&mut out),
            Err(EncodeError::NoRecord)
        ));
    }

    #[test]
    fn stop_outside_frames_errors_without_state_change() {
        let mut encoder = Encoder::new();
        assert!(matches!(encoder.stop(), Err(EncodeError::NotStoppable)));

        // START still comes out afterwards.
        let mut out = vec![0u8; 1024];
        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::Again);
    }

    #[test]
    fn need_more_does_not_advance() {
        let mut encoder = Encoder::new();
        let mut tiny = [0u8; 8];
        assert_eq!(encoder.encode(&mut tiny).unwrap(), EncodeStatus::NeedMore);
        assert_eq!(encoder.encoded(), 0);

        // Same frame again once there is room.
        let mut out = vec![0u8; 1024];
        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::Again);
    }

    #[test]
    fn stop_encoding_into_exact_buffer() {
        let mut encoder = Encoder::new();
        let mut out = vec![0u8; 1024];
        encoder.encode(&mut out).unwrap();
        encoder.set_record(record("x"));
        encoder.encode(&mut out).unwrap();
        encoder.stop().unwrap();

        let mut exact = [0u8; 12];
        assert_eq!(encoder.encode(&mut exact).unwrap(), EncodeStatus::EndOfData);
        assert_eq!(
            exact,
            [
                0x00, 0x00, 0x00, 0x00, // escape
                0x00, 0x00, 0x00, 0x04, // control payload length
                0x00, 0x00, 0x00, 0x02, // STOP
            ]
        );
    }

    #[test]
    fn accepting_emits_accept_then_finish() {
        let mut encoder = Encoder::accepting();
        let mut out = vec![0u8; 1024];

        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::Again);
        let accept_len = encoder.encoded();

        // The peer's writer-side decoder understands the reply.
        let mut decoder = Decoder::new();
        let mut data = &out[..accept_len];
        assert_eq!(decoder.decode(data).unwrap(), DecodeStatus::Again);
        data = &data[decoder.decoded()..];
        assert_eq!(decoder.decode(data).unwrap(), DecodeStatus::Bidirectional);
        assert!(decoder.accept_content_type());

        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::EndOfData);
        let finish_len = encoder.encoded();
        assert_eq!(decoder.decode(&out[..finish_len]).unwrap(), DecodeStatus::EndOfData);
    }

    #[test]
    fn handshaking_emits_ready_then_start() {
        let mut encoder = Encoder::handshaking();
        let mut out = vec![0u8; 1024];

        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::Again);
        let mut decoder = Decoder::new();
        let mut data = &out[..encoder.encoded()];
        assert_eq!(decoder.decode(data).unwrap(), DecodeStatus::Again);
        data = &data[decoder.decoded()..];
        assert_eq!(decoder.decode(data).unwrap(), DecodeStatus::Bidirectional);
        assert!(decoder.ready_content_type());

        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::Again);
        encoder.set_record(record("bidi"));
        assert_eq!(encoder.encode(&mut out).unwrap(), EncodeStatus::Record);
    }
}
