mod cli;
mod output;

use std::process;

use anyhow::{Result, bail};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use opus_relay::{Downloader, StreamEvent, YtDlpResolver};

use crate::cli::Args;
use crate::output::{PacketWriter, info_json};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("application error: {:#}", e);
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("opus_relay=info,webm=info"))
            .add_directive(Level::WARN.into())
    };

    // stdout may carry packet data; logs always go to stderr.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose),
        )
        .init();
}

async fn run(args: Args) -> Result<()> {
    let options = args.download_options()?;

    match YtDlpResolver::version(&options.resolve) {
        Some(version) => info!(%version, "using yt-dlp"),
        None => warn!(binary = %options.resolve.binary_path(), "yt-dlp not found or not runnable"),
    }

    let downloader = Downloader::new(options)?;

    if args.info_only {
        let (descriptor, selection) = downloader.plan(&args.url).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&info_json(&descriptor, &selection))?
        );
        return Ok(());
    }

    let mut writer = PacketWriter::open(&args.output, args.writes_to_stdout()).await?;
    let mut stream = downloader.download(&args.url);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let event = tokio::select! {
            _ = &mut ctrl_c => {
                warn!("interrupted, stopping download");
                stream.destroy();
                break;
            }
            event = stream.next_event() => event,
        };

        match event {
            Some(StreamEvent::Info(info)) => {
                info!(
                    title = %info.descriptor.title,
                    format = %info.format,
                    path = %info.path,
                    "download started"
                );
            }
            Some(StreamEvent::Data(packet)) => writer.write_packet(packet).await?,
            Some(StreamEvent::Error(e)) => {
                writer.finish().await?;
                bail!(e);
            }
            Some(StreamEvent::End) | None => break,
        }
    }

    info!(
        packets = writer.packets(),
        bytes = writer.bytes(),
        "download finished"
    );
    writer.finish().await
}
