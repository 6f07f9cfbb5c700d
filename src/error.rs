//! Error types for the AIC core.
//!
//! This module defines `AicError`, the single error type returned by every
//! fallible operation in the crate. Using `thiserror`, it keeps the error
//! taxonomy small and uniform so real-time callers can match on the kind of
//! failure and apply their own retry policy.
//!
//! ## Error Hierarchy
//!
//! - **`NotInitialized`**: an operation ran before `init` or after `deinit`.
//! - **`InvalidArgument`**: unknown group id, terminal or fragment index out of
//!   range, stale statistics handle.
//! - **`ConfigMismatch`**: the kernel list and kernel offset table of a
//!   `configure` call disagree. The call is rejected atomically and the
//!   previous configuration of the group stays active.
//! - **`BufferTooSmall`**: a registered terminal buffer is smaller than the
//!   computed minimum; the buffer is not bound.
//! - **`BufferExhausted`**: no statistics slot can be evicted.
//! - **`NotFound`**: no buffer or statistics bound for the requested key. The
//!   result cache never returns this; a miss falls back to cold start.
//! - **`Ambiguous`**: default-id handle lookup with several contexts alive.
//! - **`CapacityExceeded`**: a bounded table (groups, contexts) is full.
//! - **`Tuning`**: the tuning collaborator rejected a tuning blob.
//! - **`Config` / `Configuration`**: loading or validating `AicConfig`.
//!
//! Pool failures convert through `From<PoolError>` onto the same taxonomy, so
//! `?` works across the crate boundary.

use aic_pool::PoolError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AicResult<T> = std::result::Result<T, AicError>;

#[derive(Error, Debug)]
pub enum AicError {
    #[error("AIC is not initialized")]
    NotInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration mismatch for group {group_id}: {reason}")]
    ConfigMismatch { group_id: i32, reason: String },

    #[error(
        "Buffer too small for group {group_id} terminal {terminal_index} fragment {fragment_index}: \
         {size} < {required} bytes"
    )]
    BufferTooSmall {
        group_id: i32,
        terminal_index: u32,
        fragment_index: u32,
        size: usize,
        required: usize,
    },

    #[error("Statistics buffers exhausted ({capacity} slots in use)")]
    BufferExhausted { capacity: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ambiguous handle lookup: {count} contexts exist, an explicit id is required")]
    Ambiguous { count: usize },

    #[error("Capacity exceeded: at most {capacity} {what}")]
    CapacityExceeded { what: &'static str, capacity: usize },

    #[error("Tuning error: {0}")]
    Tuning(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl AicError {
    /// Shorthand for `InvalidArgument`.
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Shorthand for `ConfigMismatch`.
    pub(crate) fn mismatch(group_id: i32, reason: impl Into<String>) -> Self {
        Self::ConfigMismatch {
            group_id,
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for AicError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<PoolError> for AicError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { capacity } => Self::BufferExhausted { capacity },
            other @ (PoolError::StaleHandle { .. }
            | PoolError::InvalidState { .. }
            | PoolError::FrameInUse { .. }
            | PoolError::InvalidFrameId(_)) => Self::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AicError::mismatch(1, "kernel 42 has no offsets");
        assert_eq!(
            err.to_string(),
            "Configuration mismatch for group 1: kernel 42 has no offsets"
        );
    }

    #[test]
    fn test_buffer_too_small_display() {
        let err = AicError::BufferTooSmall {
            group_id: 1,
            terminal_index: 0,
            fragment_index: 0,
            size: 100,
            required: 128,
        };
        assert!(err.to_string().contains("100 < 128"));
    }

    #[test]
    fn test_pool_exhaustion_maps_to_buffer_exhausted() {
        let err: AicError = PoolError::Exhausted { capacity: 3 }.into();
        assert!(matches!(err, AicError::BufferExhausted { capacity: 3 }));
    }

    #[test]
    fn test_pool_misuse_maps_to_invalid_argument() {
        let err: AicError = PoolError::FrameInUse { frame_id: 9 }.into();
        match err {
            AicError::InvalidArgument(msg) => assert!(msg.contains("frame 9")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
