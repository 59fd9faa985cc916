mod cli;
mod commands;
mod logging;

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::cli::{parse_batch_size, EventFormat};
use rdl_resume::config::DEFAULT_BATCH_THRESHOLD;
use rdl_resume::progress::EtaBasis;
use rdl_resume::EngineConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL to download; resumes from stored chunks when a previous attempt was interrupted
    #[arg(index = 1)]
    url: Option<String>,

    /// Id to store chunks under (defaults to the file name in the URL)
    #[arg(long = "id")]
    file_id: Option<String>,

    /// Directory to save finished files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    download_dir: PathBuf,

    /// Directory holding partially downloaded chunks
    #[arg(short = 's', long = "store-dir", default_value = ".rdl-store")]
    store_dir: PathBuf,

    /// Received fragments to buffer before writing them to the store
    #[arg(short = 'b', long = "batch-size", default_value_t = DEFAULT_BATCH_THRESHOLD, value_parser = parse_batch_size)]
    batch_size: usize,

    /// Throughput basis for the remaining-time estimate
    #[arg(long = "eta-basis", value_enum, default_value = "cumulative")]
    eta_basis: EtaBasis,

    /// How to show download progress
    #[arg(long = "events", value_enum, default_value = "bar")]
    events: EventFormat,

    /// List partial downloads and their stored size
    #[arg(short = 'l', long)]
    list: bool,

    /// Delete the stored chunks of a partial download
    #[arg(long, value_name = "FILE_ID")]
    discard: Option<String>,

    /// Log engine activity to stderr
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    logging::init(args.verbose);

    // Output dir might not exist yet, so we resolve it relative to current dir
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    let config = EngineConfig {
        batch_threshold: args.batch_size,
        eta_basis: args.eta_basis,
        ..EngineConfig::default()
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        if args.list {
            return crate::commands::list_downloads(args.store_dir).await;
        }

        if let Some(file_id) = &args.discard {
            return crate::commands::discard_download(args.store_dir, file_id).await;
        }

        let Some(url) = args.url else {
            bail!("no URL given (see --help)");
        };
        crate::commands::run_single_download(
            url,
            args.file_id,
            args.download_dir,
            args.store_dir,
            config,
            args.events,
        )
        .await
    })
}
