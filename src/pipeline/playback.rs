//! Playback puller: reorder buffer → frame sink at the advertised rate

use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::display::FrameSink;
use crate::pipeline::reorder::{Pull, SharedReorder};
use crate::utils::frame_period;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PlaybackReport {
    pub frames_rendered: u64,
    pub render_errors: u64,
    pub gaps_skipped: u64,
    pub frames_skipped: u64,
    pub cancelled: bool,
}

pub struct Playback {
    reorder: SharedReorder,
    default_rate: f64,
}

impl Playback {
    /// `default_rate` paces polling until the first frame advertises the
    /// stream's real rate.
    pub fn new(reorder: SharedReorder, default_rate: f64) -> Self {
        Self {
            reorder,
            default_rate,
        }
    }

    fn period(&self) -> Duration {
        let rate = self.reorder.lock().rate().unwrap_or(self.default_rate);
        frame_period(rate)
    }

    #[instrument(skip_all)]
    pub async fn run<K: FrameSink>(self, mut sink: K, cancel: CancellationToken) -> PlaybackReport {
        let mut report = PlaybackReport::default();

        loop {
            match self.reorder.pop() {
                Pull::Frame(frame) => {
                    let id = frame.id;
                    match sink.render(&frame) {
                        Ok(()) => report.frames_rendered += 1,
                        Err(e) => {
                            report.render_errors += 1;
                            warn!(id, error = %e, "Failed to render frame");
                        }
                    }
                }
                Pull::Pending => {}
                Pull::Ended => {
                    debug!("Reached end of stream");
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = sleep(self.period()) => {}
            }
        }

        let stats = self.reorder.stats();
        report.gaps_skipped = stats.gaps_skipped;
        report.frames_skipped = stats.frames_skipped;
        info!(?report, "Playback finished");
        report
    }
}
