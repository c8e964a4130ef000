//! Reads a Frame Streams file of dnstap records and prints them, using the
//! synchronous stream helper.

use argh::FromArgs;
use dnswire::reader::{ReadStatus, Reader};
use std::fs::File;

#[derive(FromArgs)]
/// Read dnstap records from a Frame Streams file.
struct Args {
    /// input file
    #[argh(positional)]
    path: String,
}

fn main() -> dnswire::Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let mut file = File::open(&args.path)?;
    let mut reader = Reader::new()?;

    loop {
        match reader.read(&mut file)? {
            ReadStatus::Record => {
                let dnstap = reader.dnstap().expect("record after HAVE_DNSTAP");
                let identity =
                    String::from_utf8_lossy(dnstap.identity.as_deref().unwrap_or_default());
                println!("{identity} {:?}", dnstap.r#type());
            }
            ReadStatus::Again | ReadStatus::NeedMore => {}
            ReadStatus::EndOfData => break,
        }
    }

    tracing::info!(path = %args.path, "done");
    Ok(())
}
