//! Paced emitter: source → encoder → transport at the stream's natural cadence

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::codec::JpegEncoder;
use crate::error::{PublishError, SessionError};
use crate::source::frame::Frame;
use crate::source::FrameSource;
use crate::transport::{wire, Transport, WireMessage};
use crate::{EmitterConfig, RetryConfig};

/// Outcome of one emission session
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionReport {
    pub frames_read: u64,
    pub frames_published: u64,
    /// Frames dropped after exhausting publish retries
    pub frames_lost: u64,
    /// Frames that failed to encode
    pub frames_skipped: u64,
    pub publish_retries: u64,
    pub end_marker_sent: bool,
    pub cancelled: bool,
    /// Wall time of the pacing loop
    pub elapsed: Duration,
}

#[derive(Default)]
struct PublishCounters {
    published: CachePadded<AtomicU64>,
    lost: CachePadded<AtomicU64>,
    retries: CachePadded<AtomicU64>,
    consecutive_failures: AtomicU32,
    unreachable: AtomicBool,
}

enum PublishOutcome {
    Published { retries: u32 },
    Exhausted { retries: u32, error: PublishError },
    Cancelled,
}

pub struct PacedEmitter<T: Transport + ?Sized> {
    transport: Arc<T>,
    config: EmitterConfig,
    encoder: JpegEncoder,
}

impl<T: Transport + ?Sized> PacedEmitter<T> {
    pub fn new(transport: Arc<T>, config: EmitterConfig) -> Self {
        Self {
            encoder: JpegEncoder::new(config.quality),
            transport,
            config,
        }
    }

    /// Emit every frame of `source`, then the end-of-stream marker.
    ///
    /// Frame k (counting from 0 in source order) is released no earlier than
    /// `start + (k + 1) / rate`, the deadline always being derived from the
    /// fixed start so timing error does not build up over long streams.
    ///
    /// Ids are assigned in source order, but up to `in_flight_limit`
    /// publishes run concurrently. A frame backing off between retries can
    /// therefore reach the transport after a later id; the consumer's reorder
    /// buffer restores order. The end marker is only published once every
    /// frame publish has settled.
    #[instrument(skip_all, fields(key = %self.config.ordering_key))]
    pub async fn run<S: FrameSource>(
        &self,
        mut source: S,
        cancel: CancellationToken,
    ) -> Result<SessionReport, SessionError> {
        let rate = source.rate();
        let key = self.config.ordering_key.as_str();
        let counters = Arc::new(PublishCounters::default());
        let in_flight = Arc::new(Semaphore::new(self.config.in_flight_limit.max(1)));
        // Cancelled by the caller, or by a publish task once the transport is deemed down
        let abort = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut report = SessionReport::default();
        let mut next_id = 0u64;

        info!(rate, quality = self.encoder.quality(), "Emission started");
        let start = Instant::now();

        loop {
            if abort.is_cancelled() {
                break;
            }
            let Some(raw) = source.next_frame() else {
                break;
            };
            report.frames_read += 1;

            match self.encoder.encode(&raw) {
                Ok(payload) => {
                    let frame = Frame {
                        id: next_id,
                        payload,
                        rate,
                    };
                    next_id += 1;

                    let permit = tokio::select! {
                        biased;
                        _ = abort.cancelled() => break,
                        permit = in_flight.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };

                    let message = wire::encode_frame(key, &frame, self.config.payload_encoding);
                    tasks.spawn(publish_frame(
                        self.transport.clone(),
                        message,
                        frame.id,
                        self.config.retry,
                        self.config.failure_threshold.max(1),
                        counters.clone(),
                        abort.clone(),
                        permit,
                    ));
                }
                Err(e) => {
                    warn!(index = raw.index, error = %e, "Skipping frame that failed to encode");
                    report.frames_skipped += 1;
                    metrics::counter!("framecast_frames_skipped_encode").increment(1);
                }
            }

            // Reap finished publishes so the set stays bounded by the in-flight limit
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Publish task failed");
                }
            }

            let deadline = start + Duration::from_secs_f64(report.frames_read as f64 / rate);
            tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                _ = sleep_until(deadline) => {}
            }
        }
        report.elapsed = start.elapsed();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Publish task failed");
            }
        }
        report.frames_published = counters.published.load(Ordering::Relaxed);
        report.frames_lost = counters.lost.load(Ordering::Relaxed);
        report.publish_retries = counters.retries.load(Ordering::Relaxed);

        if counters.unreachable.load(Ordering::SeqCst) {
            let consecutive_failures = counters.consecutive_failures.load(Ordering::SeqCst);
            error!(consecutive_failures, ?report, "Transport unreachable, session failed");
            return Err(SessionError::TransportUnreachable {
                consecutive_failures,
            });
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            info!(?report, "Emission cancelled");
            return Ok(report);
        }

        let marker = wire::encode_end_of_stream(key, next_id, rate);
        let outcome = publish_with_retry(&*self.transport, marker, self.config.retry, &cancel).await;
        report.end_marker_sent = match outcome {
            PublishOutcome::Published { .. } => true,
            PublishOutcome::Exhausted { error, .. } => {
                warn!(end_id = next_id, %error, "Could not publish end-of-stream marker");
                false
            }
            PublishOutcome::Cancelled => {
                report.cancelled = true;
                false
            }
        };

        info!(?report, "Emission finished");
        Ok(report)
    }
}

#[allow(clippy::too_many_arguments)]
async fn publish_frame<T: Transport + ?Sized>(
    transport: Arc<T>,
    message: WireMessage,
    id: u64,
    retry: RetryConfig,
    failure_threshold: u32,
    counters: Arc<PublishCounters>,
    abort: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    match publish_with_retry(&*transport, message, retry, &abort).await {
        PublishOutcome::Published { retries } => {
            counters.published.fetch_add(1, Ordering::Relaxed);
            counters.retries.fetch_add(retries as u64, Ordering::Relaxed);
            counters.consecutive_failures.store(0, Ordering::SeqCst);
            metrics::counter!("framecast_frames_published").increment(1);
            trace!(id, retries, "Published frame");
        }
        PublishOutcome::Exhausted { retries, error } => {
            counters.lost.fetch_add(1, Ordering::Relaxed);
            counters.retries.fetch_add(retries as u64, Ordering::Relaxed);
            metrics::counter!("framecast_frames_lost").increment(1);
            let streak = counters.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(id, %error, streak, "Dropping frame after exhausting publish retries");

            if streak >= failure_threshold && !counters.unreachable.swap(true, Ordering::SeqCst) {
                abort.cancel();
            }
        }
        PublishOutcome::Cancelled => {
            debug!(id, "Publish abandoned");
        }
    }
}

async fn publish_with_retry<T: Transport + ?Sized>(
    transport: &T,
    message: WireMessage,
    retry: RetryConfig,
    cancel: &CancellationToken,
) -> PublishOutcome {
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PublishOutcome::Cancelled,
            result = transport.publish(message.clone()) => result,
        };

        let error = match result {
            Ok(_) => {
                return PublishOutcome::Published {
                    retries: attempt - 1,
                }
            }
            Err(error) => error,
        };
        if attempt >= attempts {
            return PublishOutcome::Exhausted {
                retries: attempt - 1,
                error,
            };
        }

        let delay = retry.backoff(attempt);
        debug!(attempt, ?delay, %error, "Publish failed, backing off");
        metrics::counter!("framecast_publish_retries").increment(1);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PublishOutcome::Cancelled,
            _ = sleep(delay) => {}
        }
        attempt += 1;
    }
}
