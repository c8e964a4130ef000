//! Listens for Frame Streams senders over TCP and prints every dnstap
//! record received.

use argh::FromArgs;
use dnswire::connection::DnstapReceiver;
use tokio::net::TcpListener;

#[derive(FromArgs)]
/// Receive dnstap records from Frame Streams senders.
struct Args {
    /// address to listen on (default localhost:6000)
    #[argh(option, default = "String::from(\"localhost:6000\")")]
    listen: String,
}

#[tokio::main]
async fn main() -> dnswire::Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let listener = TcpListener::bind(&args.listen).await?;
    tracing::info!(addr = %args.listen, "listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "accepted");

        tokio::spawn(async move {
            let mut receiver = match DnstapReceiver::bidirectional(stream) {
                Ok(receiver) => receiver,
                Err(err) => {
                    tracing::error!(%peer, %err, "setup failed");
                    return;
                }
            };
            loop {
                match receiver.recv().await {
                    Ok(Some(dnstap)) => {
                        let identity =
                            String::from_utf8_lossy(dnstap.identity.as_deref().unwrap_or_default());
                        let message_type = dnstap.message.as_ref().map(|m| m.r#type());
                        println!("{peer} {identity} {message_type:?}");
                    }
                    Ok(None) => {
                        tracing::info!(%peer, "session finished");
                        return;
                    }
                    Err(err) => {
                        tracing::error!(%peer, %err, "session failed");
                        return;
                    }
                }
            }
        });
    }
}
