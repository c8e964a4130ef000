//! Connects to a receiver over TCP and sends a handful of dnstap records,
//! negotiating a bi-directional session unless told otherwise.

use argh::FromArgs;
use dnswire::connection::DnstapSender;
use dnswire::dnstap::{Dnstap, Message, MessageType, SocketFamily, SocketProtocol};
use tokio::net::TcpStream;

#[derive(FromArgs)]
/// Send dnstap records to a Frame Streams receiver.
struct Args {
    /// address to connect to (default localhost:6000)
    #[argh(option, default = "String::from(\"localhost:6000\")")]
    connect: String,

    /// number of records to send
    #[argh(option, default = "3")]
    count: u32,

    /// use the uni-directional profile (no READY/ACCEPT handshake)
    #[argh(switch)]
    unidirectional: bool,
}

fn sample_record(sequence: u32) -> Dnstap {
    let mut message = Message::new(MessageType::ToolQuery);
    message.socket_family_raw = Some(SocketFamily::Inet as i32);
    message.socket_protocol_raw = Some(SocketProtocol::Udp as i32);
    message.query_address = Some(vec![127, 0, 0, 1]);
    message.query_port = Some(12345 + sequence);
    Dnstap::from_message(message)
        .with_identity(&b"dnswire-sender"[..])
        .with_version(&b"0.1.0"[..])
}

#[tokio::main]
async fn main() -> dnswire::Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let stream = TcpStream::connect(&args.connect).await?;
    tracing::info!(addr = %args.connect, "connected");

    let mut sender = if args.unidirectional {
        DnstapSender::new(stream)?
    } else {
        DnstapSender::bidirectional(stream)?
    };

    for sequence in 0..args.count {
        sender.send(&sample_record(sequence)).await?;
        tracing::info!(sequence, "sent record");
    }

    sender.finish().await?;
    tracing::info!("session finished");
    Ok(())
}
