//! Errors returned by the statistics pool.

use thiserror::Error;

use crate::SlotState;

/// Convenience alias for pool results.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Failure of a pool operation. Every variant is returned immediately; the
/// pool never waits for a slot to become free.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("statistics pool exhausted: all {capacity} slots are in use")]
    Exhausted { capacity: usize },

    #[error("slot handle {index} is stale (generation {generation})")]
    StaleHandle { index: usize, generation: u64 },

    #[error("slot {index} is {actual:?}, expected {expected:?}")]
    InvalidState {
        index: usize,
        expected: SlotState,
        actual: SlotState,
    },

    #[error("frame {frame_id} is held by a consumer and cannot be refilled")]
    FrameInUse { frame_id: u64 },

    #[error("frame id {0:#x} is reserved")]
    InvalidFrameId(u64),
}
