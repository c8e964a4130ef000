//! Writes a uni-directional session of dnstap records into a file using the
//! synchronous stream helper.

use argh::FromArgs;
use dnswire::dnstap::{Dnstap, Message, MessageType};
use dnswire::writer::{WriteStatus, Writer};
use std::fs::OpenOptions;

#[derive(FromArgs)]
/// Write dnstap records into a Frame Streams file.
struct Args {
    /// output file
    #[argh(positional)]
    path: String,

    /// number of records to write
    #[argh(option, default = "2")]
    count: u32,
}

fn main() -> dnswire::Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.path)?;

    let mut writer = Writer::new()?;
    for sequence in 1..=args.count {
        let identity = format!("writer_write-{sequence}");
        let record = Dnstap::from_message(Message::new(MessageType::ToolQuery))
            .with_identity(identity.into_bytes());
        writer.set_record(record);
        loop {
            match writer.write(&mut file)? {
                WriteStatus::Record => break,
                WriteStatus::Again => {}
                status => return Err(format!("unexpected status {status:?}").into()),
            }
        }
        tracing::info!(sequence, "wrote record");
    }

    writer.stop()?;
    loop {
        match writer.write(&mut file)? {
            WriteStatus::EndOfData => break,
            WriteStatus::Again => {}
            status => return Err(format!("unexpected status {status:?}").into()),
        }
    }

    tracing::info!(path = %args.path, "done");
    Ok(())
}
