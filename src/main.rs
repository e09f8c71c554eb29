use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use url::Url;

use m3u8_downloader_pro::commands::{serve, DownloadRequest, DEFAULT_PORT};
use m3u8_downloader_pro::core::models::JobResult;
use m3u8_downloader_pro::core::{AppConfig, DownloadManager};
use m3u8_downloader_pro::parsers::{parse_playlist, Manifest, Playlist};
use m3u8_downloader_pro::utils::file_utils::format_bytes;
use m3u8_downloader_pro::utils::logging::init_tracing_with_level;
use m3u8_downloader_pro::utils::network::build_client;
use m3u8_downloader_pro::VERSION;

#[derive(Debug, Parser)]
#[command(name = "m3u8-downloader", version = VERSION)]
#[command(about = "Download, decrypt and merge HLS playlists")]
struct Cli {
    /// Log level for this crate (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Engine settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one download described by a form JSON file
    Run {
        /// JSON file with the download form fields
        request: PathBuf,
    },
    /// Accept downloads over HTTP
    Serve {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Parse a playlist and print its contents
    Parse {
        /// Playlist URL or local file
        playlist: String,
        /// Base for relative URIs in a local playlist
        #[arg(long)]
        base_url: Option<Url>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing_with_level(cli.log_level.as_deref());

    let settings = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };

    match cli.command {
        Command::Run { request } => run_download(settings, &request).await,
        Command::Serve { port } => serve(DownloadManager::new(settings), port).await,
        Command::Parse { playlist, base_url } => {
            parse_only(&settings, &playlist, base_url.as_ref()).await
        }
    }
}

async fn run_download(settings: AppConfig, request_path: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(request_path)
        .await
        .with_context(|| format!("failed to read {}", request_path.display()))?;
    let request: DownloadRequest =
        serde_json::from_str(&text).context("request file is not a valid download form")?;

    let config = request.into_config(settings.engine.default_failure_policy)?;
    let manager = DownloadManager::new(settings);
    let handle = manager.start(config)?;
    info!("Started job {}", handle.id());

    let printer = handle.subscribe(|snapshot| {
        println!(
            "[{:>5.1}%] {}/{} segments, {} failed, {} ({}/s)",
            snapshot.fraction() * 100.0,
            snapshot.segments_done,
            snapshot.segments_total,
            snapshot.segments_failed,
            format_bytes(snapshot.bytes_written),
            format_bytes(snapshot.speed as u64),
        );
    });

    let cancel = {
        let manager = manager.clone();
        let id = handle.id();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling job {}", id);
                manager.cancel(id);
            }
        })
    };

    let result = handle.wait().await;
    cancel.abort();
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    match result {
        JobResult::Success { .. } | JobResult::PartialSuccess { .. } => Ok(()),
        JobResult::Failure { reason, .. } => Err(anyhow!(reason)),
        JobResult::Cancelled { .. } => bail!("download cancelled"),
    }
}

async fn parse_only(settings: &AppConfig, playlist: &str, base_url: Option<&Url>) -> Result<()> {
    let (text, source_url) = match Url::parse(playlist) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            let client = build_client(&settings.network, &BTreeMap::new(), None)?;
            let text = client
                .get(url.clone())
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .with_context(|| format!("failed to fetch {url}"))?
                .text()
                .await?;
            (text, Some(url))
        }
        _ => {
            let text = tokio::fs::read_to_string(playlist)
                .await
                .with_context(|| format!("failed to read {playlist}"))?;
            (text, None)
        }
    };

    match parse_playlist(&text, source_url.as_ref(), base_url)? {
        Playlist::Multivariant(variants) => {
            println!("Multivariant playlist with {} variants", variants.len());
            for variant in variants {
                println!(
                    "  {:>10} bps  {:<10} {}",
                    variant.bandwidth,
                    variant.resolution.as_deref().unwrap_or("-"),
                    variant.uri
                );
            }
        }
        Playlist::Media(manifest) => print_manifest(&manifest),
    }
    Ok(())
}

fn print_manifest(manifest: &Manifest) {
    println!(
        "Media playlist: version {}, target duration {}s, media sequence {}",
        manifest.version,
        manifest.target_duration,
        manifest.media_sequence
    );
    println!(
        "{} segments, {:.1}s total, encrypted: {}, live: {}",
        manifest.segments.len(),
        manifest.total_duration(),
        manifest.is_encrypted(),
        manifest.is_live
    );
    for segment in &manifest.segments {
        let key = segment
            .key
            .as_ref()
            .map(|k| format!(" key={:?}", k.method))
            .unwrap_or_default();
        println!(
            "  #{:<5} seq {:<6} {:>7.3}s {}{}",
            segment.index, segment.sequence, segment.duration, segment.uri, key
        );
    }
}
