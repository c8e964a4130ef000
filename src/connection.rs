//! Async transport helpers for exchanging dnstap records over any byte
//! stream (TCP, UNIX domain sockets, pipes).
//!
//! These wrap the sans-io [`Reader`] and [`Writer`] facades with the read
//! and write loops an event-loop application would otherwise write itself.
//! The facades stay in charge of framing, the handshake and buffering; this
//! layer only moves bytes between them and the socket.

use crate::dnstap::Dnstap;
use crate::reader::{ReadStatus, Reader};
use crate::writer::{WriteStatus, Writer};
use crate::DEFAULT_BUF_SIZE;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sends dnstap records over a stream.
///
/// On a bi-directional session the first [`DnstapSender::send`] drives the
/// READY/ACCEPT handshake before the record goes out, and
/// [`DnstapSender::finish`] waits for the peer's FINISH after STOP.
pub struct DnstapSender<S> {
    stream: S,
    writer: Writer,
    out: Vec<u8>,
    reply: BytesMut,
}

impl<S> DnstapSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// A uni-directional sender: START, records, STOP.
    pub fn new(stream: S) -> crate::Result<Self> {
        Ok(DnstapSender {
            stream,
            writer: Writer::new()?,
            out: vec![0; DEFAULT_BUF_SIZE],
            reply: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
        })
    }

    /// A bi-directional sender: READY, ACCEPT, START, records, STOP, FINISH.
    pub fn bidirectional(stream: S) -> crate::Result<Self> {
        let mut sender = Self::new(stream)?;
        sender.writer.set_bidirectional(true)?;
        Ok(sender)
    }

    /// Send one record, driving any outstanding handshake steps first.
    pub async fn send(&mut self, dnstap: &Dnstap) -> crate::Result<()> {
        self.writer.set_record(dnstap.clone());
        loop {
            match self.step().await? {
                WriteStatus::Record => {
                    self.stream.flush().await?;
                    return Ok(());
                }
                WriteStatus::Again | WriteStatus::NeedMore => {}
                WriteStatus::EndOfData => return Err("session already terminated".into()),
            }
        }
    }

    /// Terminate the session: emit STOP and, on a bi-directional session,
    /// wait for the peer's FINISH. Returns the underlying stream.
    pub async fn finish(mut self) -> crate::Result<S> {
        self.writer.stop()?;
        loop {
            match self.step().await? {
                WriteStatus::EndOfData => {
                    self.stream.flush().await?;
                    return Ok(self.stream);
                }
                WriteStatus::Again | WriteStatus::NeedMore => {}
                WriteStatus::Record => return Err("unexpected record during shutdown".into()),
            }
        }
    }

    async fn step(&mut self) -> crate::Result<WriteStatus> {
        let status = self.writer.pop(&mut self.out, &self.reply)?;
        self.reply.advance(self.writer.received());

        let popped = self.writer.popped();
        if popped > 0 {
            self.stream.write_all(&self.out[..popped]).await?;
        }

        if status == WriteStatus::NeedMore {
            // The writer is waiting for the peer's handshake reply.
            self.stream.flush().await?;
            if self.stream.read_buf(&mut self.reply).await? == 0 {
                return Err("connection closed during handshake".into());
            }
        }

        Ok(status)
    }
}

/// Receives dnstap records from a stream.
pub struct DnstapReceiver<S> {
    stream: S,
    reader: Reader,
    input: BytesMut,
    reply: Vec<u8>,
}

impl<S> DnstapReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// A uni-directional receiver.
    pub fn new(stream: S) -> crate::Result<Self> {
        Ok(DnstapReceiver {
            stream,
            reader: Reader::new()?,
            input: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
            reply: vec![0; DEFAULT_BUF_SIZE],
        })
    }

    /// A receiver that also accepts bi-directional peers; handshake replies
    /// are written back transparently during [`DnstapReceiver::recv`].
    pub fn bidirectional(stream: S) -> crate::Result<Self> {
        let mut receiver = Self::new(stream)?;
        receiver.reader.allow_bidirectional(true)?;
        Ok(receiver)
    }

    /// Whether the peer negotiated a bi-directional session.
    pub fn is_bidirectional(&self) -> bool {
        self.reader.is_bidirectional()
    }

    /// Receive the next record. Returns `None` once the peer terminated the
    /// session cleanly (and, on bi-directional sessions, FINISH was sent).
    pub async fn recv(&mut self) -> crate::Result<Option<Dnstap>> {
        loop {
            let status = self.reader.push(&self.input, &mut self.reply)?;
            self.input.advance(self.reader.pushed());

            let replied = self.reader.replied();
            if replied > 0 {
                self.stream.write_all(&self.reply[..replied]).await?;
                self.stream.flush().await?;
            }

            match status {
                ReadStatus::Record => {
                    let dnstap = self.reader.dnstap().cloned().ok_or("record slot empty")?;
                    return Ok(Some(dnstap));
                }
                ReadStatus::Again => {}
                ReadStatus::NeedMore => {
                    if self.stream.read_buf(&mut self.input).await? == 0 {
                        return Err("stream ended before STOP".into());
                    }
                }
                ReadStatus::EndOfData => return Ok(None),
            }
        }
    }

    /// Give the underlying stream back.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnstap::{Message, MessageType, SocketFamily, SocketProtocol};

    fn record(identity: &str) -> Dnstap {
        let mut message = Message::new(MessageType::ClientQuery);
        message.socket_family_raw = Some(SocketFamily::Inet as i32);
        message.socket_protocol_raw = Some(SocketProtocol::Udp as i32);
        message.query_port = Some(53);
        Dnstap::from_message(message).with_identity(identity.as_bytes())
    }

    #[tokio::test]
    async fn unidirectional_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);

        let send = tokio::spawn(async move {
            let mut sender = DnstapSender::new(client).unwrap();
            for i in 0..3 {
                sender.send(&record(&format!("sender-{i}"))).await.unwrap();
            }
            sender.finish().await.unwrap();
        });

        let mut receiver = DnstapReceiver::new(server).unwrap();
        let mut identities = Vec::new();
        while let Some(dnstap) = receiver.recv().await.unwrap() {
            identities.push(String::from_utf8(dnstap.identity.unwrap()).unwrap());
        }
        assert_eq!(identities, ["sender-0", "sender-1", "sender-2"]);
        assert!(!receiver.is_bidirectional());

        send.await.unwrap();
    }

    #[tokio::test]
    async fn bidirectional_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);

        let send = tokio::spawn(async move {
            let mut sender = DnstapSender::bidirectional(client).unwrap();
            sender.send(&record("bidi-0")).await.unwrap();
            sender.send(&record("bidi-1")).await.unwrap();
            sender.finish().await.unwrap();
        });

        let mut receiver = DnstapReceiver::bidirectional(server).unwrap();
        let mut count = 0;
        while let Some(dnstap) = receiver.recv().await.unwrap() {
            assert_eq!(
                dnstap.identity.as_deref(),
                Some(format!("bidi-{count}").as_bytes())
            );
            count += 1;
        }
        assert_eq!(count, 2);
        assert!(receiver.is_bidirectional());

        send.await.unwrap();
    }

    #[tokio::test]
    async fn receiver_reports_truncated_stream() {
        let (client, server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut sender = DnstapSender::new(client).unwrap();
            sender.send(&record("lost")).await.unwrap();
            // Dropped without STOP: the peer sees a truncated stream.
        });

        let mut receiver = DnstapReceiver::new(server).unwrap();
        let first = receiver.recv().await.unwrap();
        assert!(first.is_some());
        assert!(receiver.recv().await.is_err());
    }
}
