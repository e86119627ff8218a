//! Ingestion loop: transport subscription → reorder buffer
//!
//! Frames the reorder buffer cannot hold yet are parked here rather than
//! acknowledged. A parked frame keeps its delivery unsettled until the buffer
//! takes it, so cancelling the loop hands it back to the transport. While
//! `queue_capacity` frames are parked the loop stops dequeuing, which pushes
//! back on the transport instead of growing without bound.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::SessionError;
use crate::pipeline::reorder::{Admission, SharedReorder};
use crate::source::frame::Frame;
use crate::transport::wire::{self, WireEvent};
use crate::transport::{Delivery, Transport};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestReport {
    pub messages: u64,
    pub frames_accepted: u64,
    /// Frames held back until playback made room for them
    pub frames_parked: u64,
    pub malformed: u64,
    /// End-of-stream id, if the marker arrived
    pub end_id: Option<u64>,
    pub cancelled: bool,
}

/// A frame waiting for room in the reorder buffer
struct Parked {
    frame: Frame,
    /// `None` once the frame was acknowledged, e.g. after being evicted
    delivery: Option<Delivery>,
}

pub struct IngestLoop<T: Transport + ?Sized> {
    transport: Arc<T>,
    reorder: SharedReorder,
    queue_capacity: usize,
    /// How long to keep listening for stragglers once the end marker is in
    linger: Duration,
}

impl<T: Transport + ?Sized> IngestLoop<T> {
    pub fn new(
        transport: Arc<T>,
        reorder: SharedReorder,
        queue_capacity: usize,
        linger: Duration,
    ) -> Self {
        Self {
            transport,
            reorder,
            queue_capacity: queue_capacity.max(1),
            linger,
        }
    }

    /// Feed deliveries into the reorder buffer until the stream is complete,
    /// the transport closes the subscription, or `cancel` fires.
    ///
    /// Once the end marker has arrived the loop keeps draining until nothing
    /// below the end id is missing, or no message arrived for `linger` with
    /// nothing left parked.
    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<IngestReport, SessionError> {
        let (tx, rx) = flume::bounded::<Delivery>(self.queue_capacity);
        // Dropped on every return path below, which stops delivery
        let _subscription = self.transport.subscribe(tx).map_err(SessionError::Subscribe)?;
        let mut parked = BTreeMap::new();
        let mut closed = false;
        let mut report = IngestReport::default();
        info!(queue = self.queue_capacity, "Ingestion started");

        loop {
            self.admit_parked(&mut parked, &mut report);

            if report.end_id.is_some() && self.reorder.lock().missing_before_end() == Some(0) {
                debug!("Every frame below the end marker is accounted for");
                break;
            }
            if closed && parked.is_empty() {
                break;
            }

            let accepting = !closed && parked.len() < self.queue_capacity;
            let lingering = report.end_id.is_some() && parked.is_empty();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = self.reorder.freed(), if !parked.is_empty() => {}
                next = rx.recv_async(), if accepting => match next {
                    Ok(delivery) => self.handle(delivery, &mut parked, &mut report),
                    Err(_) => {
                        warn!(parked = parked.len(), "Transport closed the subscription");
                        closed = true;
                    }
                },
                _ = sleep(self.linger), if lingering => {
                    debug!(linger = ?self.linger, "No stragglers after end marker");
                    break;
                }
            }
        }

        if !parked.is_empty() {
            // Unsettled deliveries are nacked on drop and stay with the transport
            debug!(parked = parked.len(), "Releasing parked frames");
        }
        info!(?report, "Ingestion finished");
        Ok(report)
    }

    fn handle(
        &self,
        delivery: Delivery,
        parked: &mut BTreeMap<u64, Parked>,
        report: &mut IngestReport,
    ) {
        report.messages += 1;
        match wire::decode(&delivery.message) {
            Ok(WireEvent::Frame(frame)) => {
                let id = frame.id;
                match self.reorder.receive(frame) {
                    Admission::Rejected(frame) => park(parked, frame, Some(delivery), report),
                    Admission::AcceptedWithEviction { evicted } => {
                        report.frames_accepted += 1;
                        trace!(id, evicted = evicted.id, "Ingested frame");
                        park(parked, evicted, None, report);
                        delivery.ack();
                    }
                    admission => {
                        if admission.is_accepted() {
                            report.frames_accepted += 1;
                        }
                        trace!(id, ?admission, "Ingested frame");
                        delivery.ack();
                    }
                }
            }
            Ok(WireEvent::EndOfStream { end_id }) => {
                info!(end_id, "End-of-stream marker received");
                self.reorder.mark_end(end_id);
                report.end_id = Some(end_id);
                delivery.ack();
            }
            Err(e) => {
                report.malformed += 1;
                metrics::counter!("framecast_messages_malformed").increment(1);
                warn!(error = %e, attributes = ?delivery.message.attributes, "Malformed message");
                delivery.nack();
            }
        }
    }

    /// Move parked frames into the buffer, lowest id first, while it has room.
    fn admit_parked(&self, parked: &mut BTreeMap<u64, Parked>, report: &mut IngestReport) {
        if parked.is_empty() {
            return;
        }

        let mut settled = Vec::new();
        {
            let now = Instant::now();
            let mut buffer = self.reorder.lock();
            while let Some(entry) = parked.first_entry() {
                if buffer.rejects(*entry.key()) {
                    break;
                }
                let Parked { frame, delivery } = entry.remove();
                match buffer.receive(frame, now) {
                    Admission::Rejected(frame) => {
                        parked.insert(frame.id, Parked { frame, delivery });
                        break;
                    }
                    Admission::AcceptedWithEviction { evicted } => {
                        report.frames_accepted += 1;
                        park(parked, evicted, None, report);
                    }
                    admission => {
                        if admission.is_accepted() {
                            report.frames_accepted += 1;
                        }
                    }
                }
                settled.extend(delivery);
            }
        }

        for delivery in settled {
            delivery.ack();
        }
    }
}

fn park(
    parked: &mut BTreeMap<u64, Parked>,
    frame: Frame,
    delivery: Option<Delivery>,
    report: &mut IngestReport,
) {
    let id = frame.id;
    if parked.contains_key(&id) {
        // Already waiting; this copy is redundant
        if let Some(delivery) = delivery {
            delivery.ack();
        }
        return;
    }

    report.frames_parked += 1;
    metrics::counter!("framecast_frames_parked").increment(1);
    trace!(id, waiting = parked.len() + 1, "Parked frame until playback frees a slot");
    parked.insert(id, Parked { frame, delivery });
}
