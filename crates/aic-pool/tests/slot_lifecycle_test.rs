//! Slot lifecycle scenarios for the statistics pool.
//!
//! Run with: `cargo test --package aic-pool --test slot_lifecycle_test`

use aic_pool::{PoolError, SlotState, StatsBufferPool, StatsPayload, StatsQuery};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

fn fill(pool: &StatsBufferPool, frame_id: u64) -> Result<aic_pool::SlotHandle, PoolError> {
    let handle = pool.acquire_for_fill()?;
    pool.mark_filled(handle, frame_id, StatsPayload::new(frame_id.to_le_bytes().to_vec()))?;
    Ok(handle)
}

#[test]
fn test_fourth_fill_evicts_oldest_frame() {
    let pool = StatsBufferPool::new(3);
    for frame in 1..=3 {
        fill(&pool, frame).unwrap();
    }
    assert_eq!(pool.counts().filled, 3);

    fill(&pool, 4).expect("frame 4 should recycle the oldest slot");

    assert!(pool.find_frame(1).is_none(), "frame 1 must be evicted");
    for frame in 2..=4 {
        assert!(pool.find_frame(frame).is_some(), "frame {frame} must survive");
    }
}

#[test]
fn test_using_slots_are_never_evicted() {
    let pool = StatsBufferPool::new(3);
    let first = fill(&pool, 1).unwrap();
    pool.claim(first).unwrap();
    fill(&pool, 2).unwrap();
    fill(&pool, 3).unwrap();

    // Oldest evictable is frame 2, not the claimed frame 1
    fill(&pool, 4).unwrap();
    assert!(pool.find_frame(1).is_some());
    assert!(pool.find_frame(2).is_none());
    assert_eq!(pool.payload(first).unwrap().data.as_ref(), &1u64.to_le_bytes());
}

#[test]
fn test_exhaustion_when_every_slot_is_using() {
    let pool = StatsBufferPool::new(3);
    for frame in 1..=3 {
        let handle = fill(&pool, frame).unwrap();
        pool.claim(handle).unwrap();
    }

    assert_eq!(
        pool.acquire_for_fill(),
        Err(PoolError::Exhausted { capacity: 3 })
    );
    // Nothing was overwritten
    for frame in 1..=3 {
        let info = pool.find_frame(frame).unwrap();
        assert_eq!(info.state, SlotState::Using);
    }
}

#[test]
fn test_release_frees_slot_for_next_fill() {
    let pool = StatsBufferPool::new(1);
    let handle = fill(&pool, 1).unwrap();
    pool.claim(handle).unwrap();
    assert!(pool.acquire_for_fill().is_err());

    pool.release(handle).unwrap();
    let info = pool.query_by_status(StatsQuery::Empty, None).unwrap();
    assert_eq!(info.state, SlotState::Empty);
    fill(&pool, 2).unwrap();
}

#[test]
fn test_producer_consumer_threads() {
    let pool = Arc::new(StatsBufferPool::new(4));
    let frames = 200u64;

    let producer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let mut exhausted = 0;
            for frame in 0..frames {
                match fill(&pool, frame) {
                    Ok(_) => {}
                    Err(PoolError::Exhausted { .. }) => exhausted += 1,
                    Err(e) => panic!("unexpected pool error: {e}"),
                }
            }
            exhausted
        })
    };

    let consumer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let mut consumed = 0;
            for _ in 0..frames {
                if let Some(info) = pool.query_by_status(StatsQuery::Latest, None) {
                    if pool.claim(info.handle).is_ok() {
                        consumed += 1;
                        pool.release(info.handle).unwrap();
                    }
                }
                thread::yield_now();
            }
            consumed
        })
    };

    let _exhausted = producer.join().expect("producer panicked");
    let _consumed = consumer.join().expect("consumer panicked");

    let counts = pool.counts();
    assert_eq!(counts.filling, 0);
    assert_eq!(counts.using, 0);
    assert_eq!(counts.empty + counts.filled, 4);
}

#[derive(Debug, Clone)]
enum Op {
    Fill(u64),
    ClaimLatest,
    ClaimFrame(u64),
    ReleaseAny,
    AbandonAfterAcquire,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u64..6).prop_map(Op::Fill),
        2 => Just(Op::ClaimLatest),
        2 => (0u64..6).prop_map(Op::ClaimFrame),
        2 => Just(Op::ReleaseAny),
        1 => Just(Op::AbandonAfterAcquire),
    ]
}

proptest! {
    /// For any interleaving, a frame lives in at most one FILLED/USING slot,
    /// and exhaustion only happens when no slot is evictable.
    #[test]
    fn prop_at_most_one_live_slot_per_frame(
        capacity in 1usize..6,
        ops in prop::collection::vec(op_strategy(), 1..80),
    ) {
        let pool = StatsBufferPool::new(capacity);

        for op in ops {
            match op {
                Op::Fill(frame) => {
                    let before = pool.counts();
                    match pool.acquire_for_fill() {
                        Ok(handle) => {
                            let _ = pool.mark_filled(handle, frame, StatsPayload::default());
                        }
                        Err(PoolError::Exhausted { .. }) => {
                            prop_assert_eq!(before.empty, 0);
                            prop_assert_eq!(before.filled, 0);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                }
                Op::ClaimLatest => {
                    if let Some(info) = pool.query_by_status(StatsQuery::Latest, None) {
                        let _ = pool.claim(info.handle);
                    }
                }
                Op::ClaimFrame(frame) => {
                    if let Some(info) = pool.query_by_status(StatsQuery::Filled, Some(frame)) {
                        prop_assert!(pool.claim(info.handle).is_ok());
                    }
                }
                Op::ReleaseAny => {
                    if let Some(info) = pool.query_by_status(StatsQuery::Using, None) {
                        prop_assert!(pool.release(info.handle).is_ok());
                    }
                }
                Op::AbandonAfterAcquire => {
                    if let Ok(handle) = pool.acquire_for_fill() {
                        prop_assert!(pool.abandon(handle).is_ok());
                    }
                }
            }

            let mut live: HashMap<u64, usize> = HashMap::new();
            for slot in pool.snapshot() {
                if matches!(slot.state, SlotState::Filled | SlotState::Using) {
                    *live.entry(slot.frame_id.unwrap()).or_default() += 1;
                }
            }
            prop_assert!(live.values().all(|&n| n == 1), "duplicate live frame: {:?}", live);
            prop_assert_eq!(pool.counts().filling, 0);
        }
    }
}
