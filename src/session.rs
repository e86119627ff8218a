//! Producer and consumer sessions
//!
//! A producer session fetches one video, opens it and emits it; it either
//! completes with a loss count or fails before the first frame goes out. A
//! consumer session runs ingestion and playback side by side over one shared
//! reorder buffer. Both stop when their cancellation token fires.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::display::FrameSink;
use crate::error::{InvalidStream, SessionError};
use crate::pipeline::{
    IngestLoop, IngestReport, PacedEmitter, Playback, PlaybackReport, ReorderStats,
    SessionReport, SharedReorder,
};
use crate::source::{FrameSource, SourceLocator, SourceProvider, Y4mSource};
use crate::transport::Transport;
use crate::{ConsumerConfig, EmitterConfig};

const Y4M_MAGIC: &[u8] = b"YUV4MPEG2";

/// Pick a decoder for `data`: YUV4MPEG2 natively, anything else through
/// GStreamer when that feature is compiled in.
pub fn open_source(data: Bytes) -> Result<Box<dyn FrameSource + Send>, InvalidStream> {
    if data.starts_with(Y4M_MAGIC) {
        return Ok(Box::new(Y4mSource::open(data)?));
    }

    #[cfg(feature = "gstreamer-source")]
    {
        Ok(Box::new(crate::source::GstSource::open(data)?))
    }

    #[cfg(not(feature = "gstreamer-source"))]
    {
        Err(InvalidStream::new(
            "unrecognised container; only YUV4MPEG2 is supported without the `gstreamer-source` feature",
        ))
    }
}

/// Fetch, open and emit one video.
#[instrument(skip_all, fields(locator = %locator))]
pub async fn run_producer<T: Transport + ?Sized>(
    config: &EmitterConfig,
    provider: &dyn SourceProvider,
    locator: &SourceLocator,
    transport: Arc<T>,
    cancel: CancellationToken,
) -> Result<SessionReport, SessionError> {
    let data = provider.fetch(locator).await?;
    let source = open_source(data)?;
    info!(rate = source.rate(), "Source opened");

    PacedEmitter::new(transport, config.clone())
        .run(source, cancel)
        .await
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerReport {
    pub ingest: IngestReport,
    pub playback: PlaybackReport,
    pub reorder: ReorderStats,
}

pub struct ConsumerSession {
    ingest: JoinHandle<Result<IngestReport, SessionError>>,
    playback: JoinHandle<PlaybackReport>,
    reorder: SharedReorder,
    cancel: CancellationToken,
}

impl ConsumerSession {
    /// Spawn the ingestion and playback tasks. Must be called inside a tokio runtime.
    pub fn start<T, K>(
        config: &ConsumerConfig,
        transport: Arc<T>,
        sink: K,
        cancel: CancellationToken,
    ) -> Self
    where
        T: Transport + ?Sized,
        K: FrameSink + 'static,
    {
        let reorder = SharedReorder::new(config.capacity, config.stall_timeout());

        let ingest_loop = IngestLoop::new(
            transport,
            reorder.clone(),
            config.queue_capacity,
            config.stall_timeout(),
        );
        let sealer = reorder.clone();
        let ingest_cancel = cancel.clone();
        let ingest = tokio::spawn(async move {
            let result = ingest_loop.run(ingest_cancel).await;
            // Nothing else will arrive; let playback drain what is buffered
            sealer.seal();
            result
        });

        let playback = tokio::spawn(
            Playback::new(reorder.clone(), config.default_rate).run(sink, cancel.clone()),
        );

        Self {
            ingest,
            playback,
            reorder,
            cancel,
        }
    }

    pub fn reorder(&self) -> &SharedReorder {
        &self.reorder
    }

    /// Stop both tasks; `join` still has to be awaited.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<ConsumerReport, SessionError> {
        let ingest = self.ingest.await;
        let playback = self.playback.await?;
        let ingest = ingest??;
        Ok(ConsumerReport {
            ingest,
            playback,
            reorder: self.reorder.stats(),
        })
    }
}
