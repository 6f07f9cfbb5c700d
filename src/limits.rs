//! Shared hard limits to keep every table bounded.
//!
//! All capacities are fixed when a context is created; nothing grows at
//! runtime.

use crate::error::AicError;

pub use aic_pool::INVALID_FRAME_ID;

/// Maximum kernel groups (control blocks) per context.
pub const MAX_GROUPS: usize = 5;
/// Maximum kernels in one group.
pub const MAX_KERNELS_PER_GROUP: usize = 128;
/// Maximum terminals per group; terminal indices are `0..MAX_TERMINALS`.
pub const MAX_TERMINALS: u32 = 38;
/// Most terminals one `run_kernels` call can write.
pub const MAX_TERMINAL_WRITES: usize = MAX_TERMINALS as usize;
/// Maximum sections in one offset record; section indices are 16 bits wide.
pub const MAX_SECTIONS_PER_RECORD: usize = u16::MAX as usize;
/// Maximum fragments (stripes) per group.
pub const MAX_FRAGMENTS: u32 = 8;
/// Maximum statistics slots per context.
pub const MAX_STATS_SLOTS: usize = 16;
/// Maximum result cache entries per context.
pub const MAX_RESULT_CACHE_LEN: usize = 64;
/// Maximum contexts in a directory.
pub const MAX_CONTEXTS: usize = 5;
/// Maximum statistics grid width/height.
pub const MAX_STATS_GRID_DIMENSION: u32 = 512;
/// Maximum statistics blob size in bytes (1MB).
pub const MAX_STATS_BYTES: usize = 1024 * 1024;
/// Luma histogram bins produced by the statistics decoder.
pub const HISTOGRAM_BINS: usize = 256;
/// Maximum motion vectors in one DVS statistics section (100x100 grid).
pub const MAX_DVS_VECTORS: usize = 100 * 100;
/// Maximum camera calibration (NVM) blob size in bytes (64KB).
pub const MAX_CALIBRATION_BYTES: usize = 64 * 1024;

/// Default result cache length.
pub const DEFAULT_RESULT_CACHE_LEN: usize = 5;
/// Default statistics slots.
pub const DEFAULT_STATS_SLOTS: usize = 5;
/// Default statistics grid width/height.
pub const DEFAULT_STATS_GRID_DIMENSION: u32 = 150;

/// Validated statistics grid sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsGridSize {
    pub cells: usize,
    pub bytes: usize,
}

/// Validate statistics grid dimensions and compute cell/byte sizes safely.
pub fn validate_stats_grid(
    width: u32,
    height: u32,
    bytes_per_cell: usize,
) -> Result<StatsGridSize, AicError> {
    if width == 0 || height == 0 {
        return Err(AicError::invalid(format!(
            "statistics grid {width}x{height} has a zero dimension"
        )));
    }

    if width > MAX_STATS_GRID_DIMENSION || height > MAX_STATS_GRID_DIMENSION {
        return Err(AicError::invalid(format!(
            "statistics grid {width}x{height} exceeds {MAX_STATS_GRID_DIMENSION}x{MAX_STATS_GRID_DIMENSION}"
        )));
    }

    let cells = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| AicError::invalid("statistics grid cell count overflows"))?;

    let bytes = cells
        .checked_mul(bytes_per_cell)
        .ok_or_else(|| AicError::invalid("statistics grid byte size overflows"))?;

    if bytes > MAX_STATS_BYTES {
        return Err(AicError::invalid(format!(
            "statistics grid needs {bytes} bytes, limit is {MAX_STATS_BYTES}"
        )));
    }

    Ok(StatsGridSize { cells, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_stats_grid() {
        let size = validate_stats_grid(150, 150, 5).unwrap();
        assert_eq!(size.cells, 22_500);
        assert_eq!(size.bytes, 112_500);
    }

    #[test]
    fn test_validate_stats_grid_rejects_oversize() {
        assert!(validate_stats_grid(MAX_STATS_GRID_DIMENSION + 1, 1, 1).is_err());
        assert!(validate_stats_grid(0, 10, 1).is_err());
        // 512 * 512 * 8 = 2MB > 1MB
        assert!(validate_stats_grid(512, 512, 8).is_err());
    }
}
