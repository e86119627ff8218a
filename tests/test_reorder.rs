use std::collections::HashSet;

use bytes::Bytes;
use proptest::prelude::*;
use tokio::time::{Duration, Instant};

use framecast::pipeline::{Admission, PlaybackState, Pull, ReorderBuffer};
use framecast::source::Frame;

const STALL: Duration = Duration::from_secs(2);

fn frame(id: u64) -> Frame {
    Frame {
        id,
        payload: Bytes::from_static(b"\xff\xd8"),
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

#[test]
fn scenario_in_order() {
    let now = Instant::now();
    let mut buffer = ReorderBuffer::new(10, STALL, now);
    for id in [0, 1, 2] {
        buffer.receive(frame(id), now);
    }
    assert_eq!(drain(&mut buffer, now), vec![0, 1, 2]);
}

#[test]
fn scenario_shuffled() {
    let now = Instant::now();
    let mut buffer = ReorderBuffer::new(10, STALL, now);
    for id in [2, 0, 1] {
        buffer.receive(frame(id), now);
    }
    assert_eq!(drain(&mut buffer, now), vec![0, 1, 2]);
}

#[test]
fn scenario_lost_frame_is_skipped_after_timeout() {
    let start = Instant::now();
    let mut buffer = ReorderBuffer::new(10, STALL, start);
    for id in [0, 2, 3] {
        buffer.receive(frame(id), start);
    }

    assert_eq!(drain(&mut buffer, start), vec![0]);
    assert_eq!(
        buffer.state(start),
        PlaybackState::Waiting {
            next_expected: 1,
            skip_at: Some(start + STALL)
        }
    );
    assert_eq!(buffer.pop(start + Duration::from_millis(1999)), Pull::Pending);

    let later = start + STALL;
    assert_eq!(buffer.state(later), PlaybackState::Ready { next_expected: 2 });
    assert_eq!(drain(&mut buffer, later), vec![2, 3]);
    assert_eq!(buffer.next_expected(), 4);
    assert_eq!(buffer.stats().gaps_skipped, 1);
    assert_eq!(buffer.stats().frames_skipped, 1);
}

#[test]
fn scenario_full_buffer_keeps_lowest_ids() {
    let now = Instant::now();
    let mut buffer = ReorderBuffer::new(2, STALL, now);
    let admissions: Vec<_> = [0, 1, 2, 3]
        .into_iter()
        .map(|id| buffer.receive(frame(id), now))
        .collect();
    assert_eq!(
        admissions,
        vec![
            Admission::Accepted,
            Admission::Accepted,
            Admission::Rejected(frame(2)),
            Admission::Rejected(frame(3))
        ]
    );
    assert_eq!(buffer.buffered_ids().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(drain(&mut buffer, now), vec![0, 1]);

    // Rejected frames are handed back intact and fit once playback made room
    assert!(!buffer.rejects(2));
    assert_eq!(buffer.receive(frame(2), now), Admission::Accepted);
    assert_eq!(buffer.receive(frame(3), now), Admission::Accepted);
    assert_eq!(drain(&mut buffer, now), vec![2, 3]);
}

#[test]
fn lower_id_pushes_out_the_highest_buffered_frame() {
    let now = Instant::now();
    let mut buffer = ReorderBuffer::new(2, STALL, now);
    buffer.receive(frame(4), now);
    buffer.receive(frame(9), now);

    assert_eq!(
        buffer.receive(frame(1), now),
        Admission::AcceptedWithEviction { evicted: frame(9) }
    );
    assert_eq!(buffer.buffered_ids().collect::<Vec<_>>(), vec![1, 4]);
    assert_eq!(buffer.stats().evicted, 1);
}

#[test]
fn stale_redelivery_is_a_no_op() {
    let now = Instant::now();
    let mut buffer = ReorderBuffer::new(4, STALL, now);
    buffer.receive(frame(0), now);
    buffer.receive(frame(1), now);
    assert_eq!(drain(&mut buffer, now), vec![0, 1]);

    assert_eq!(buffer.receive(frame(1), now), Admission::Stale);
    assert_eq!(buffer.receive(frame(0), now), Admission::Stale);
    assert!(buffer.is_empty());
    assert_eq!(buffer.next_expected(), 2);
}

#[test]
fn end_marker_finishes_playback() {
    let start = Instant::now();
    let mut buffer = ReorderBuffer::new(8, STALL, start);
    buffer.receive(frame(0), start);
    buffer.receive(frame(1), start);
    buffer.mark_end(3);
    assert_eq!(buffer.missing_before_end(), Some(1));
    assert_eq!(buffer.receive(frame(3), start), Admission::Stale);

    assert_eq!(drain(&mut buffer, start), vec![0, 1]);
    assert_eq!(buffer.pop(start), Pull::Pending);
    // Nothing left to skip to but the end itself
    assert_eq!(buffer.pop(start + STALL), Pull::Ended);
    assert!(buffer.is_ended());
    assert_eq!(buffer.state(start + STALL), PlaybackState::Ended);
}

#[derive(Debug, Clone)]
enum Op {
    Receive(u64),
    Pop,
    Wait(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u64..48).prop_map(Op::Receive),
        3 => Just(Op::Pop),
        1 => (0u64..3000).prop_map(Op::Wait),
    ]
}

proptest! {
    #[test]
    fn any_permutation_plays_in_order(
        ids in Just((0u64..64).collect::<Vec<_>>()).prop_shuffle(),
        repeats in prop::collection::vec(0usize..64, 0..16),
    ) {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(64, STALL, now);
        let mut arrivals = ids.clone();
        for i in repeats {
            arrivals.insert(i, ids[i]);
        }
        for id in arrivals {
            buffer.receive(frame(id), now);
        }
        prop_assert_eq!(drain(&mut buffer, now), (0u64..64).collect::<Vec<_>>());
    }

    #[test]
    fn output_is_strictly_increasing_and_at_most_once(
        capacity in 1usize..16,
        ops in prop::collection::vec(op(), 0..200),
    ) {
        let mut now = Instant::now();
        let mut buffer = ReorderBuffer::new(capacity, STALL, now);
        let mut received = HashSet::new();
        let mut played = Vec::new();

        for op in ops {
            match op {
                Op::Receive(id) => {
                    received.insert(id);
                    buffer.receive(frame(id), now);
                }
                Op::Pop => {
                    if let Pull::Frame(f) = buffer.pop(now) {
                        played.push(f.id);
                    }
                }
                Op::Wait(ms) => now += Duration::from_millis(ms),
            }
            prop_assert!(buffer.len() <= capacity);
        }

        prop_assert!(played.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(played.iter().all(|id| received.contains(id)));
    }
}
