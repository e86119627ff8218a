//! Framecast: paced frame emission and in-order playback over a lossy channel
//!
//! Runs a producer and a consumer session in one process, connected through
//! the in-memory transport with the configured link conditions.
//!
//! `framecast --test-pattern [frames]` writes a generated YUV4MPEG2 clip to the
//! configured source location before streaming it.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::WrapErr, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use framecast::display::DecodingSink;
use framecast::session::{run_producer, ConsumerSession};
use framecast::source::y4m::test_pattern;
use framecast::source::{FsSourceProvider, SourceLocator};
use framecast::transport::MemoryTransport;
use framecast::{utils, Config, SourceConfig};

const TEST_PATTERN_FRAMES: usize = 90;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    utils::init_tracing();

    info!("Framecast launching...");

    // Load configuration
    let config = Config::load().wrap_err("failed to load configuration")?;
    framecast::CONFIG.store(Arc::new(config.clone()));

    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("--test-pattern") {
        let frames = match args.next() {
            Some(n) => n.parse().wrap_err("frame count must be a number")?,
            None => TEST_PATTERN_FRAMES,
        };
        write_test_pattern(&config.source, frames)?;
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling session");
            ctrl_c.cancel();
        }
    });

    let transport = Arc::new(MemoryTransport::new(config.transport.clone()));
    let consumer = ConsumerSession::start(
        &config.consumer,
        transport.clone(),
        DecodingSink::new(),
        cancel.clone(),
    );

    let provider = FsSourceProvider::new(&config.source.root);
    let locator = SourceLocator::new(&config.source.bucket, &config.source.path);
    let produced = run_producer(&config.emitter, &provider, &locator, transport, cancel.clone()).await;

    match produced {
        Ok(report) => info!(?report, "Producer session complete"),
        Err(e) => {
            error!("Producer session failed: {}", e);
            consumer.cancel();
            consumer.join().await?;
            return Err(e.into());
        }
    }

    let consumed = consumer.join().await?;
    info!(
        rendered = consumed.playback.frames_rendered,
        skipped = consumed.playback.frames_skipped,
        reorder = ?consumed.reorder,
        "Consumer session complete"
    );

    info!("Framecast shutting down");
    Ok(())
}

fn write_test_pattern(source: &SourceConfig, frames: usize) -> Result<()> {
    let mut path = PathBuf::from(&source.root);
    if !source.bucket.is_empty() {
        path.push(&source.bucket);
    }
    path.push(&source.path);

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, test_pattern(320, 180, 30, frames))
        .wrap_err_with(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), frames, "Wrote test pattern");
    Ok(())
}
