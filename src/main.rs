use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

mod export;
mod job;

/// Renders a composition of media clips into one MP4 file.
#[derive(Parser, Debug)]
#[command(name = "compose-export", version)]
struct Cli {
    /// Export job file (JSON)
    job: PathBuf,

    /// Debug logging for the engine
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let engine = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("compose_bus", engine)
        .filter_module("compose_export", engine)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    compose_bus::init()?;

    let job = job::ExportJob::load(&cli.job)?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, finishing the output file");
            cancel_clone.cancel();
        }
    });

    let summary = export::run(job, cancel).await?;
    log::info!(
        "video: {} chunks written, {} dropped; audio: {} chunks written, {} dropped",
        summary.video.chunks_written,
        summary.video.chunks_dropped,
        summary.audio.chunks_written,
        summary.audio.chunks_dropped
    );
    Ok(())
}
