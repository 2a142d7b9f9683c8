// src/main.rs

use anyhow::{bail, Context, Result};
use course_offline::catalog::DownloadableBlock;
use course_offline::prelude::*;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: course-offline [--config FILE] <data-dir> <url>...";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_file = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let file = PathBuf::from(args.remove(i + 1));
            args.remove(i);
            Some(file)
        }
        Some(_) => bail!(USAGE),
        None => None,
    };
    if args.len() < 2 {
        bail!(USAGE);
    }
    let data_dir = PathBuf::from(args.remove(0));
    let urls = args;

    let mut config = match &config_file {
        Some(file) => QueueConfig::from_file(file).with_context(|| format!("reading {}", file.display()))?,
        None => QueueConfig::default(),
    };
    let rooted = QueueConfig::rooted_at(&data_dir);
    config.download_dir = rooted.download_dir;
    config.database_path = rooted.database_path;

    let transfer = Arc::new(HttpTransfer::new(&config)?);
    let policy = AdmissionPolicy::new(
        Arc::new(FixedNetwork(ConnectionKind::Wifi)),
        Arc::new(SharedPreferences::new(false)),
        Arc::new(UnknownStorage),
        &config,
    );
    let download_dir = config.download_dir.clone();
    let controller = QueueController::open(config, transfer, policy).await?;

    let mut events = controller.observe_events();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                DownloadEvent::Progress(p) => match p.percent() {
                    Some(percent) => println!("[PROGRESS] {}: {}%", p.id, percent),
                    None => println!("[PROGRESS] {}: {} bytes", p.id, p.downloaded),
                },
                DownloadEvent::Failed(records) => {
                    for record in records {
                        println!("[FAILED] {} ({})", record.id, record.url);
                    }
                }
            }
        }
    });

    let records: Vec<DownloadRecord> = urls
        .iter()
        .enumerate()
        .filter_map(|(i, url)| {
            let block = DownloadableBlock {
                id: format!("item-{}", i + 1),
                title: url.clone(),
                file_type: FileType::Video,
                url: url.clone(),
                size: 0,
                last_modified: None,
            };
            record_for_block(&download_dir, &block, "cli")
        })
        .collect();

    let queued = controller.enqueue(records).await?;
    info!(queued, "waiting for downloads");
    controller.wait_idle().await;

    println!("\n--- Download queue ---");
    for record in controller.snapshot().await? {
        println!("{:<10} {:<14} {:>12} {}", record.id, record.state, record.size, record.path.display());
    }

    controller.shutdown().await;
    printer.abort();
    Ok(())
}
