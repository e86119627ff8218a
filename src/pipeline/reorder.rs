//! Consumer-side reorder buffer
//!
//! Turns an out-of-order, duplicate-prone, lossy arrival stream into a strictly
//! ordered, at-most-once pull sequence with bounded memory.
//!
//! Ids below `next_expected` are stale and dropped. When the buffer is full a
//! new frame is only admitted if it is lower than the highest buffered id,
//! which is then evicted; otherwise the new frame is rejected. Buffered frames
//! closest to playback are never destroyed to make room.
//!
//! If `next_expected` does not show up for `stall_timeout` while later frames
//! are waiting, the gap is declared lost and playback jumps to the lowest
//! buffered id.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::source::frame::Frame;

/// Outcome of offering a frame to the buffer
///
/// Frames the buffer cannot hold right now are handed back so the caller
/// can offer them again once playback has made room.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted,
    /// Accepted after pushing the highest buffered frame out to stay within capacity
    AcceptedWithEviction { evicted: Frame },
    /// Already played, skipped, or past the end of the stream
    Stale,
    Duplicate,
    /// Buffer full and the frame is not more urgent than anything in it
    Rejected(Frame),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Admission::Accepted | Admission::AcceptedWithEviction { .. }
        )
    }
}

/// Outcome of a playback pull
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    Frame(Frame),
    /// Nothing playable yet; try again later
    Pending,
    /// The end-of-stream id has been reached
    Ended,
}

/// Observable playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// `next_expected` is missing. `skip_at` is when the gap will be given up
    /// on, if there is anything to skip to.
    Waiting {
        next_expected: u64,
        skip_at: Option<Instant>,
    },
    Ready { next_expected: u64 },
    Ended,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReorderStats {
    pub accepted: u64,
    pub stale: u64,
    pub duplicate: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub popped: u64,
    /// Times playback gave up on a missing id
    pub gaps_skipped: u64,
    /// Ids never played because of those skips
    pub frames_skipped: u64,
}

pub struct ReorderBuffer {
    next_expected: u64,
    buffered: BTreeMap<u64, Frame>,
    capacity: usize,
    stall_timeout: Duration,
    last_progress: Instant,
    end_id: Option<u64>,
    rate: Option<f64>,
    stats: ReorderStats,
}

impl ReorderBuffer {
    pub fn new(capacity: usize, stall_timeout: Duration, now: Instant) -> Self {
        Self {
            next_expected: 0,
            buffered: BTreeMap::new(),
            capacity: capacity.max(1),
            stall_timeout,
            last_progress: now,
            end_id: None,
            rate: None,
            stats: ReorderStats::default(),
        }
    }

    pub fn receive(&mut self, frame: Frame, now: Instant) -> Admission {
        let id = frame.id;
        self.rate = Some(frame.rate);

        let admission = self.admit(frame, now);
        match &admission {
            Admission::Accepted => {
                self.stats.accepted += 1;
                metrics::counter!("framecast_reorder_accepted").increment(1);
            }
            Admission::AcceptedWithEviction { evicted } => {
                self.stats.accepted += 1;
                self.stats.evicted += 1;
                metrics::counter!("framecast_reorder_accepted").increment(1);
                metrics::counter!("framecast_reorder_evicted").increment(1);
                debug!(id, evicted = evicted.id, "Buffer full, evicted highest id");
            }
            Admission::Stale => {
                self.stats.stale += 1;
                metrics::counter!("framecast_reorder_stale").increment(1);
                trace!(id, next_expected = self.next_expected, "Dropped stale frame");
            }
            Admission::Duplicate => {
                self.stats.duplicate += 1;
                metrics::counter!("framecast_reorder_duplicate").increment(1);
                trace!(id, "Dropped duplicate frame");
            }
            Admission::Rejected(_) => {
                self.stats.rejected += 1;
                metrics::counter!("framecast_reorder_rejected").increment(1);
                debug!(id, capacity = self.capacity, "Buffer full, rejected frame");
            }
        }
        metrics::gauge!("framecast_reorder_buffered").set(self.buffered.len() as f64);
        admission
    }

    fn is_stale(&self, id: u64) -> bool {
        // Nothing can follow u64::MAX, so it could never be played in order
        id < self.next_expected || id == u64::MAX || self.end_id.is_some_and(|end| id >= end)
    }

    /// Whether `receive` would hand a frame with this id straight back.
    pub fn rejects(&self, id: u64) -> bool {
        if self.is_stale(id) || self.buffered.contains_key(&id) {
            return false;
        }
        self.buffered.len() >= self.capacity
            && self.buffered.keys().next_back().map_or(true, |&highest| id > highest)
    }

    fn admit(&mut self, frame: Frame, now: Instant) -> Admission {
        if self.is_stale(frame.id) {
            return Admission::Stale;
        }
        if self.buffered.contains_key(&frame.id) {
            return Admission::Duplicate;
        }
        if self.rejects(frame.id) {
            return Admission::Rejected(frame);
        }

        if self.buffered.len() >= self.capacity {
            if let Some((_, evicted)) = self.buffered.pop_last() {
                self.buffered.insert(frame.id, frame);
                return Admission::AcceptedWithEviction { evicted };
            }
        }

        // Waiting only starts to count once there is something to wait past
        if self.buffered.is_empty() {
            self.last_progress = now;
        }
        self.buffered.insert(frame.id, frame);
        Admission::Accepted
    }

    pub fn pop(&mut self, now: Instant) -> Pull {
        if let Some(frame) = self.buffered.remove(&self.next_expected) {
            return self.emit(frame, now);
        }
        if self.is_ended() {
            return Pull::Ended;
        }
        if now.saturating_duration_since(self.last_progress) < self.stall_timeout {
            return Pull::Pending;
        }

        match self.buffered.first_key_value().map(|(id, _)| *id) {
            Some(lowest) => {
                self.skip_to(lowest, now);
                match self.buffered.remove(&lowest) {
                    Some(frame) => self.emit(frame, now),
                    None => Pull::Pending,
                }
            }
            None => match self.end_id {
                Some(end) => {
                    self.skip_to(end, now);
                    Pull::Ended
                }
                None => Pull::Pending,
            },
        }
    }

    fn emit(&mut self, frame: Frame, now: Instant) -> Pull {
        self.next_expected = frame.id.saturating_add(1);
        self.last_progress = now;
        self.stats.popped += 1;
        metrics::gauge!("framecast_reorder_buffered").set(self.buffered.len() as f64);
        Pull::Frame(frame)
    }

    fn skip_to(&mut self, id: u64, now: Instant) {
        let skipped = id - self.next_expected;
        warn!(
            from = self.next_expected,
            to = id,
            skipped,
            "No progress within stall timeout, treating gap as lost"
        );
        self.stats.gaps_skipped += 1;
        self.stats.frames_skipped += skipped;
        metrics::counter!("framecast_reorder_gaps_skipped").increment(1);
        self.next_expected = id;
        self.last_progress = now;
    }

    /// Record that the producer will never send an id at or above `end_id`.
    pub fn mark_end(&mut self, end_id: u64) {
        let end_id = self.end_id.map_or(end_id, |known| known.min(end_id));
        self.end_id = Some(end_id);
        let beyond = self.buffered.split_off(&end_id);
        if !beyond.is_empty() {
            debug!(end_id, dropped = beyond.len(), "Dropped frames past end of stream");
        }
    }

    /// No more frames will arrive: end the stream after the highest buffered id.
    pub fn seal(&mut self) {
        if self.end_id.is_none() {
            let end = self
                .buffered
                .keys()
                .next_back()
                .map_or(self.next_expected, |highest| highest.saturating_add(1));
            debug!(end, "Sealing stream without end marker");
            self.end_id = Some(end);
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_id.is_some_and(|end| self.next_expected >= end)
    }

    /// Ids below the end marker that are neither played nor buffered.
    /// `None` until the end of the stream is known.
    pub fn missing_before_end(&self) -> Option<u64> {
        self.end_id.map(|end| {
            end.saturating_sub(self.next_expected)
                .saturating_sub(self.buffered.len() as u64)
        })
    }

    /// What the next `pop(now)` would do, without doing it.
    pub fn state(&self, now: Instant) -> PlaybackState {
        if self.is_ended() {
            return PlaybackState::Ended;
        }
        if self.buffered.contains_key(&self.next_expected) {
            return PlaybackState::Ready {
                next_expected: self.next_expected,
            };
        }
        let can_skip = !self.buffered.is_empty() || self.end_id.is_some();
        let skip_at = can_skip.then(|| self.last_progress + self.stall_timeout);
        match (skip_at, self.buffered.keys().next()) {
            // the gap is already given up on; playback resumes at the lowest id
            (Some(at), Some(&lowest)) if now >= at => PlaybackState::Ready {
                next_expected: lowest,
            },
            (Some(at), None) if now >= at => PlaybackState::Ended,
            _ => PlaybackState::Waiting {
                next_expected: self.next_expected,
                skip_at,
            },
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn end_id(&self) -> Option<u64> {
        self.end_id
    }

    /// Latest frame rate advertised by an incoming frame.
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    pub fn buffered_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.buffered.keys().copied()
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }
}

/// Reorder buffer shared by the ingestion and playback tasks behind one lock
#[derive(Clone)]
pub struct SharedReorder {
    inner: Arc<Mutex<ReorderBuffer>>,
    /// Signalled whenever a pop frees a slot
    freed: Arc<Notify>,
}

impl SharedReorder {
    pub fn new(capacity: usize, stall_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReorderBuffer::new(
                capacity,
                stall_timeout,
                Instant::now(),
            ))),
            freed: Arc::new(Notify::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ReorderBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn receive(&self, frame: Frame) -> Admission {
        self.lock().receive(frame, Instant::now())
    }

    pub fn pop(&self) -> Pull {
        let pulled = self.lock().pop(Instant::now());
        if matches!(pulled, Pull::Frame(_)) {
            self.freed.notify_one();
        }
        pulled
    }

    /// Resolves after the next pop that took a frame out of the buffer.
    pub async fn freed(&self) {
        self.freed.notified().await
    }

    pub fn mark_end(&self, end_id: u64) {
        self.lock().mark_end(end_id)
    }

    pub fn seal(&self) {
        self.lock().seal()
    }

    pub fn state(&self) -> PlaybackState {
        self.lock().state(Instant::now())
    }

    pub fn stats(&self) -> ReorderStats {
        self.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(id: u64) -> Frame {
        Frame {
            id,
            payload: Bytes::from(id.to_le_bytes().to_vec()),
            rate: 30.0,
        }
    }

    fn drain(buffer: &mut ReorderBuffer, now: Instant) -> Vec<u64> {
        let mut out = Vec::new();
        while let Pull::Frame(f) = buffer.pop(now) {
            out.push(f.id);
        }
        out
    }

    const T: Duration = Duration::from_secs(2);

    #[test]
    fn in_order_arrivals() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(10, T, now);
        for id in 0..3 {
            assert_eq!(buffer.receive(frame(id), now), Admission::Accepted);
        }
        assert_eq!(drain(&mut buffer, now), vec![0, 1, 2]);
    }

    #[test]
    fn out_of_order_arrivals() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(10, T, now);
        for id in [2, 0, 1] {
            buffer.receive(frame(id), now);
        }
        assert_eq!(drain(&mut buffer, now), vec![0, 1, 2]);
    }

    #[test]
    fn waits_for_gap_before_pulling_later_ids() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(10, T, now);
        buffer.receive(frame(1), now);
        assert_eq!(buffer.pop(now), Pull::Pending);
        buffer.receive(frame(0), now);
        assert_eq!(drain(&mut buffer, now), vec![0, 1]);
    }

    #[test]
    fn duplicates_and_stale_frames_are_dropped() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(10, T, now);
        assert_eq!(buffer.receive(frame(0), now), Admission::Accepted);
        assert_eq!(buffer.receive(frame(0), now), Admission::Duplicate);
        assert_eq!(drain(&mut buffer, now), vec![0]);

        assert_eq!(buffer.receive(frame(0), now), Admission::Stale);
        assert_eq!(buffer.pop(now), Pull::Pending);
        assert_eq!(buffer.next_expected(), 1);

        let stats = buffer.stats();
        assert_eq!((stats.accepted, stats.duplicate, stats.stale, stats.popped), (1, 1, 1, 1));
    }

    #[test]
    fn full_buffer_rejects_higher_ids() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(2, T, now);
        assert_eq!(buffer.receive(frame(0), now), Admission::Accepted);
        assert_eq!(buffer.receive(frame(1), now), Admission::Accepted);
        assert_eq!(buffer.receive(frame(2), now), Admission::Rejected(frame(2)));
        assert!(buffer.rejects(3));
        assert!(!buffer.rejects(1));
        assert_eq!(buffer.buffered_ids().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(drain(&mut buffer, now), vec![0, 1]);
    }

    #[test]
    fn full_buffer_evicts_highest_for_a_lower_gap() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(2, T, now);
        buffer.receive(frame(3), now);
        buffer.receive(frame(7), now);
        assert_eq!(
            buffer.receive(frame(0), now),
            Admission::AcceptedWithEviction { evicted: frame(7) }
        );
        assert_eq!(buffer.buffered_ids().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(buffer.len(), buffer.capacity());
    }

    #[test]
    fn stall_skips_to_lowest_buffered() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(10, T, start);
        for id in [0, 2, 3] {
            buffer.receive(frame(id), start);
        }
        assert_eq!(drain(&mut buffer, start), vec![0]);

        let almost = start + T - Duration::from_millis(1);
        assert_eq!(buffer.pop(almost), Pull::Pending);
        assert!(matches!(
            buffer.state(almost),
            PlaybackState::Waiting { next_expected: 1, skip_at: Some(at) } if at == start + T
        ));

        assert_eq!(buffer.state(start + T), PlaybackState::Ready { next_expected: 2 });
        assert_eq!(drain(&mut buffer, start + T), vec![2, 3]);
        assert_eq!(buffer.stats().gaps_skipped, 1);
        assert_eq!(buffer.stats().frames_skipped, 1);

        // late arrival of the skipped frame is stale
        assert_eq!(buffer.receive(frame(1), start + T), Admission::Stale);
    }

    #[test]
    fn empty_buffer_never_skips_without_end() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(10, T, start);
        assert_eq!(buffer.pop(start + T * 10), Pull::Pending);
        assert_eq!(buffer.next_expected(), 0);
    }

    #[test]
    fn stall_clock_starts_when_first_frame_arrives() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(10, T, start);
        let late = start + T * 5;
        buffer.receive(frame(1), late);
        assert_eq!(buffer.pop(late), Pull::Pending);
        buffer.receive(frame(0), late + Duration::from_millis(10));
        assert_eq!(drain(&mut buffer, late + Duration::from_millis(10)), vec![0, 1]);
    }

    #[test]
    fn end_of_stream() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(10, T, now);
        buffer.receive(frame(0), now);
        buffer.receive(frame(5), now);
        buffer.mark_end(3);
        assert_eq!(buffer.buffered_ids().collect::<Vec<_>>(), vec![0]);
        assert_eq!(buffer.receive(frame(4), now), Admission::Stale);
        assert_eq!(buffer.missing_before_end(), Some(2));

        buffer.receive(frame(1), now);
        assert_eq!(drain(&mut buffer, now), vec![0, 1]);
        assert_eq!(buffer.pop(now), Pull::Pending);
        assert_eq!(buffer.missing_before_end(), Some(1));

        // id 2 never arrives: give up on it once the timeout passes
        assert_eq!(buffer.pop(now + T), Pull::Ended);
        assert!(buffer.is_ended());
        assert_eq!(buffer.state(now + T), PlaybackState::Ended);
    }

    #[test]
    fn sealing_plays_out_what_is_buffered() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(10, T, now);
        buffer.receive(frame(0), now);
        buffer.receive(frame(3), now);
        buffer.seal();
        assert_eq!(buffer.end_id(), Some(4));
        assert_eq!(drain(&mut buffer, now), vec![0]);
        assert_eq!(drain(&mut buffer, now + T), vec![3]);
        assert_eq!(buffer.pop(now + T), Pull::Ended);
    }

    #[test]
    fn highest_possible_id_is_never_buffered() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(4, T, now);
        assert_eq!(buffer.receive(frame(u64::MAX), now), Admission::Stale);
        buffer.receive(frame(u64::MAX - 1), now);

        assert_eq!(drain(&mut buffer, now + T), vec![u64::MAX - 1]);
        assert_eq!(buffer.next_expected(), u64::MAX);
        buffer.seal();
        assert_eq!(buffer.end_id(), Some(u64::MAX));
        assert_eq!(buffer.pop(now + T), Pull::Ended);
    }

    #[test]
    fn state_anticipates_the_end_skip() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(4, T, now);
        buffer.mark_end(2);
        assert!(matches!(buffer.state(now), PlaybackState::Waiting { next_expected: 0, .. }));
        assert_eq!(buffer.state(now + T), PlaybackState::Ended);
    }

    #[tokio::test]
    async fn pop_wakes_a_waiting_producer() {
        let shared = SharedReorder::new(1, T);
        shared.receive(frame(0));
        assert!(matches!(shared.receive(frame(1)), Admission::Rejected(_)));

        let waiter = shared.clone();
        let woken = tokio::spawn(async move { waiter.freed().await });
        assert!(matches!(shared.pop(), Pull::Frame(_)));
        woken.await.unwrap();
        assert!(shared.receive(frame(1)).is_accepted());
    }

    #[test]
    fn tracks_advertised_rate() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(4, T, now);
        assert_eq!(buffer.rate(), None);
        buffer.receive(Frame { rate: 24.0, ..frame(0) }, now);
        assert_eq!(buffer.rate(), Some(24.0));
    }
}
