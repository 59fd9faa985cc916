use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use rdl_resume::{
    ChunkStore, DirectoryDelivery, DownloadEvent, Downloader, EngineConfig, EventSink,
};

use crate::cli::EventFormat;

pub async fn run_single_download(
    url: String,
    file_id: Option<String>,
    output: PathBuf,
    store_dir: PathBuf,
    config: EngineConfig,
    format: EventFormat,
) -> Result<()> {
    if !output.exists() {
        fs::create_dir_all(&output).await.context("Failed to create output directory")?;
    }

    let store = Arc::new(ChunkStore::new(store_dir));
    let (sink, events) = EventSink::channel();
    let downloader = Downloader::new(store, DirectoryDelivery::new(output), sink, &config);

    let done = CancellationToken::new();
    let renderer = tokio::spawn(render_events(events, format, done.clone()));

    // Ctrl+C stops the transfer; flushed chunks stay for the next run.
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = downloader
        .download_file(&url, file_id.as_deref(), &cancel)
        .await;
    done.cancel();
    renderer.await??;

    match result {
        Ok(report) => {
            if matches!(format, EventFormat::Bar) {
                println!(
                    "Saved {} ({}) to {}",
                    report.file_id,
                    HumanBytes(report.bytes),
                    report.location.display()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to download {}: {}", url, e);
            if e.is_resumable() {
                eprintln!("Run the same command again to resume.");
            }
            Err(e.into())
        }
    }
}

/// Renders events until `done` fires, then drains whatever is still queued.
async fn render_events(
    mut events: UnboundedReceiver<DownloadEvent>,
    format: EventFormat,
    done: CancellationToken,
) -> Result<()> {
    let pb = match format {
        EventFormat::Bar => {
            let pb = ProgressBar::new(100);
            pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=>-"),
            );
            Some(pb)
        }
        EventFormat::Json => None,
    };

    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = done.cancelled() => {
                while let Ok(event) = events.try_recv() {
                    render(&event, pb.as_ref())?;
                }
                break;
            }
        };
        render(&event, pb.as_ref())?;
    }

    if let Some(pb) = pb {
        if !pb.is_finished() {
            pb.finish_and_clear();
        }
    }
    Ok(())
}

fn render(event: &DownloadEvent, pb: Option<&ProgressBar>) -> Result<()> {
    let Some(pb) = pb else {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    };

    match event {
        DownloadEvent::Progress {
            file_id,
            percent,
            eta_seconds,
        } => {
            pb.set_position(percent.floor() as u64);
            let eta = eta_seconds
                .map(|s| format!("{:.2}s remaining", s))
                .unwrap_or_default();
            pb.set_message(format!("{} {}", file_id, eta));
        }
        DownloadEvent::Waiting { file_id } => {
            pb.set_position(100);
            pb.set_message(format!("{} Please wait...", file_id));
        }
        DownloadEvent::Completed { file_id } => {
            pb.finish_with_message(format!("{} Download completed!", file_id));
        }
        DownloadEvent::Error { file_id, message } => {
            pb.abandon_with_message(format!("{} {}", file_id, message));
        }
        DownloadEvent::Idle { .. } => {}
    }
    Ok(())
}

pub async fn list_downloads(store_dir: PathBuf) -> Result<()> {
    if !store_dir.exists() {
        println!("No partial downloads in '{:?}'.", store_dir);
        println!("Tip: If you used a custom store directory, please specify it with --store-dir");
        return Ok(());
    }

    let store = ChunkStore::new(&store_dir);
    let handle = store.open().await.context("Failed to open chunk store")?;
    let records = handle.records().await.context("Failed to read chunk store")?;

    let total_bytes: u64 = records.iter().map(|r| r.total_bytes).sum();
    println!(
        "Summary: Partial: {} | Stored: {}",
        records.len(),
        HumanBytes(total_bytes)
    );
    println!();

    println!("{:<50} {:<10} {:<15} {:<17}", "File id", "Chunks", "Stored", "Updated");
    println!("{:-<50} {:-<10} {:-<15} {:-<17}", "", "", "", "");

    for record in &records {
        let updated = Local
            .timestamp_millis_opt(record.updated_at_ms)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:<50} {:<10} {:<15} {:<17}",
            record.file_id,
            record.chunk_count,
            format!("{}", HumanBytes(record.total_bytes)),
            updated
        );
    }

    if records.is_empty() {
        println!("No partial downloads in '{:?}'.", store_dir);
    }

    Ok(())
}

pub async fn discard_download(store_dir: PathBuf, file_id: &str) -> Result<()> {
    let store = ChunkStore::new(store_dir);
    let handle = store.open().await.context("Failed to open chunk store")?;
    let stored = handle.existing_length(file_id).await?;
    handle
        .delete_record(file_id)
        .await
        .with_context(|| format!("Failed to discard {}", file_id))?;
    println!("Discarded {} ({})", file_id, HumanBytes(stored));
    Ok(())
}
