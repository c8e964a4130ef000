//! A non-blocking, transport-agnostic codec for streams of dnstap DNS
//! telemetry records carried inside the Frame Streams framing protocol.
//!
//! The crate is layered:
//!
//! - [`frame`]: the length-prefixed framing with data and control frames.
//! - [`dnstap`]: the record schema (protobuf, via `prost`).
//! - [`decoder`] / [`encoder`]: the session state machines (uni- and
//!   bi-directional profiles) over plain byte slices.
//! - [`reader`] / [`writer`]: buffered, resumable facades that preserve
//!   incremental progress across short reads and writes, with a push/pop
//!   byte API and single-syscall stream helpers.
//! - [`connection`]: tokio-based convenience wrappers for sockets.
//!
//! # Examples
//!
//! Sending records over TCP:
//!
//! ```rust,no_run
//! use dnswire::connection::DnstapSender;
//! use dnswire::dnstap::{Dnstap, Message, MessageType};
//!
//! #[tokio::main]
//! async fn main() -> dnswire::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("localhost:6000").await?;
//!     let mut sender = DnstapSender::bidirectional(stream)?;
//!
//!     let record = Dnstap::from_message(Message::new(MessageType::ClientQuery))
//!         .with_identity(&b"resolver.example.net"[..]);
//!     sender.send(&record).await?;
//!
//!     sender.finish().await?;
//!     Ok(())
//! }
//! ```
//!
//! Receiving from any stream:
//!
//! ```rust,no_run
//! use dnswire::connection::DnstapReceiver;
//!
//! #[tokio::main]
//! async fn main() -> dnswire::Result<()> {
//!     let listener = tokio::net::TcpListener::bind("localhost:6000").await?;
//!     let (stream, _) = listener.accept().await?;
//!
//!     let mut receiver = DnstapReceiver::bidirectional(stream)?;
//!     while let Some(dnstap) = receiver.recv().await? {
//!         println!("{:?}", dnstap.identity);
//!     }
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod connection;
pub mod decoder;
pub mod dnstap;
pub mod encoder;
pub mod frame;
pub mod reader;
pub mod writer;

#[cfg(test)]
mod tests;

pub use connection::{DnstapReceiver, DnstapSender};
pub use decoder::{DecodeError, DecodeStatus, Decoder};
pub use dnstap::{Dnstap, Message, MessageType, PROTOBUF_CONTENT_TYPE};
pub use encoder::{EncodeError, EncodeStatus, Encoder};
pub use frame::{ControlField, ControlType, FieldType, FrameEvent, FrameReader};
pub use reader::{ReadStatus, Reader, ReaderError};
pub use writer::{WriteStatus, Writer, WriterError};

/// Initial size of the reader and writer buffers.
pub const DEFAULT_BUF_SIZE: usize = 4 * 1024;

/// Default cap on buffer growth. Frames that do not fit a buffer grown to
/// its maximum are a session error.
pub const MAX_BUF_SIZE: usize = 64 * 1024;

/// Error returned by the high-level connection API.
///
/// The core state machines use per-layer error enums (`FrameError`,
/// `DecodeError`, ...) since their callers match on the failure kind; the
/// async convenience layer funnels everything into a boxed error instead,
/// which keeps its signatures simple without losing the source chain.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` for the connection layer.
pub type Result<T> = std::result::Result<T, Error>;
