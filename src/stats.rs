//! Structured statistics and the statistics section format.
//!
//! Statistics terminals of a kernel group write one section each into the
//! frame's statistics blob:
//!
//! ```text
//! +-------------+------------+----------------+
//! | terminal u8 | len u32 LE | body (len)     |
//! +-------------+------------+----------------+
//! ```
//!
//! The group's [`StatsTerminalMap`] says which kind of statistics each
//! terminal carries. Bodies (all little-endian):
//!
//! - RGBS grid: `width u16, height u16`, then `width * height` blocks of
//!   `r, gr, gb, b, saturation` (one byte each)
//! - Luma histogram: [`HISTOGRAM_BINS`] `u32` counts
//! - AF grid: `width u16, height u16`, then `width * height` pairs of
//!   `u32` filter responses
//! - DVS motion vectors: `count u32`, then `count` vectors of
//!   `x, y, dx, dy` (`i16` each), at most [`MAX_DVS_VECTORS`]
//!
//! [`StatsBlobWriter`] produces such blobs for simulation and tests.

use crate::limits::{HISTOGRAM_BINS, MAX_DVS_VECTORS};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Kind of statistics produced by a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsKind {
    RgbsGrid,
    Histogram,
    AfGrid,
    /// Motion vectors for digital video stabilization.
    Dvs,
}

/// One statistics terminal of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsTerminal {
    pub terminal_index: u32,
    pub kind: StatsKind,
}

/// Statistics terminals of a kernel group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsTerminalMap {
    terminals: Vec<StatsTerminal>,
}

impl StatsTerminalMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a terminal. A later entry for the same index replaces the earlier.
    #[must_use]
    pub fn with(mut self, terminal_index: u32, kind: StatsKind) -> Self {
        self.terminals.retain(|t| t.terminal_index != terminal_index);
        self.terminals.push(StatsTerminal {
            terminal_index,
            kind,
        });
        self
    }

    /// Kind carried by `terminal_index`, if it is a statistics terminal.
    #[must_use]
    pub fn kind_of(&self, terminal_index: u32) -> Option<StatsKind> {
        self.terminals
            .iter()
            .find(|t| t.terminal_index == terminal_index)
            .map(|t| t.kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatsTerminal> {
        self.terminals.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.terminals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terminals.is_empty()
    }
}

/// Largest statistics grid a context accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsLimits {
    pub max_width: u32,
    pub max_height: u32,
}

/// One RGBS grid cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RgbsBlock {
    pub r: u8,
    pub gr: u8,
    pub gb: u8,
    pub b: u8,
    /// Share of saturated pixels in the cell, 0..=255.
    pub saturation: u8,
}

impl RgbsBlock {
    pub(crate) const WIRE_SIZE: usize = 5;
}

/// Average color per grid cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RgbsGrid {
    pub width: u16,
    pub height: u16,
    pub blocks: Vec<RgbsBlock>,
}

impl RgbsGrid {
    /// Mean green level over all cells, 0.0..=255.0.
    #[must_use]
    pub fn mean_green(&self) -> f32 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        let sum: u64 = self
            .blocks
            .iter()
            .map(|b| (u64::from(b.gr) + u64::from(b.gb)) / 2)
            .sum();
        sum as f32 / self.blocks.len() as f32
    }
}

/// Luma histogram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    pub bins: Vec<u32>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            bins: vec![0; HISTOGRAM_BINS],
        }
    }
}

impl Histogram {
    /// Highest bin with a non-zero count.
    #[must_use]
    pub fn brightest_bin(&self) -> Option<usize> {
        self.bins.iter().rposition(|&count| count > 0)
    }

    /// Pixels in bins `low..=high`. Bounds are clamped to the histogram.
    #[must_use]
    pub fn pixel_count(&self, low: usize, high: usize) -> u64 {
        if low > high || low >= self.bins.len() {
            return 0;
        }
        let high = high.min(self.bins.len() - 1);
        self.bins[low..=high].iter().map(|&c| u64::from(c)).sum()
    }

    /// Pixels in the whole histogram.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.bins.iter().map(|&c| u64::from(c)).sum()
    }
}

/// AF filter responses per grid cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AfGrid {
    pub width: u16,
    pub height: u16,
    pub filter_response_1: Vec<u32>,
    pub filter_response_2: Vec<u32>,
}

impl AfGrid {
    pub(crate) const WIRE_SIZE: usize = 8;
}

/// Motion of one block between consecutive frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionVector {
    /// Block position in the statistics grid.
    pub x: i16,
    pub y: i16,
    /// Displacement in pixels.
    pub dx: i16,
    pub dy: i16,
}

impl MotionVector {
    pub(crate) const WIRE_SIZE: usize = 8;
}

/// Motion vectors measured for stabilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DvsStatistics {
    pub vectors: Vec<MotionVector>,
}

impl DvsStatistics {
    /// Average displacement `(dx, dy)`; zero without vectors.
    #[must_use]
    pub fn mean_motion(&self) -> (f32, f32) {
        if self.vectors.is_empty() {
            return (0.0, 0.0);
        }
        let (sx, sy) = self.vectors.iter().fold((0i64, 0i64), |(sx, sy), v| {
            (sx + i64::from(v.dx), sy + i64::from(v.dy))
        });
        let n = self.vectors.len() as f32;
        (sx as f32 / n, sy as f32 / n)
    }
}

/// Statistics of one frame, decoded for the algorithms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedStatistics {
    pub group_id: i32,
    pub frame_id: u64,
    pub rgbs: Option<RgbsGrid>,
    pub histogram: Option<Histogram>,
    pub af: Option<AfGrid>,
    pub dvs: Option<DvsStatistics>,
    pub illuminated: bool,
    pub flash_stage: u32,
    pub analog_gain: Option<f32>,
    pub digital_gain: Option<f32>,
}

impl DecodedStatistics {
    /// Highest non-empty luma bin, if a histogram was decoded.
    #[must_use]
    pub fn brightest_bin(&self) -> Option<usize> {
        self.histogram.as_ref().and_then(Histogram::brightest_bin)
    }

    /// Pixels with luma in `low..=high`; 0 without a histogram.
    #[must_use]
    pub fn pixel_count(&self, low: usize, high: usize) -> u64 {
        self.histogram
            .as_ref()
            .map_or(0, |h| h.pixel_count(low, high))
    }
}

/// Builds statistics blobs in the section format.
#[derive(Debug, Default)]
pub struct StatsBlobWriter {
    buf: BytesMut,
}

impl StatsBlobWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn section(&mut self, terminal_index: u8, len: usize) {
        self.buf.reserve(5 + len);
        self.buf.put_u8(terminal_index);
        self.buf.put_u32_le(len as u32);
    }

    /// Append an RGBS grid section.
    #[must_use]
    pub fn rgbs(mut self, terminal_index: u8, grid: &RgbsGrid) -> Self {
        self.section(terminal_index, 4 + grid.blocks.len() * RgbsBlock::WIRE_SIZE);
        self.buf.put_u16_le(grid.width);
        self.buf.put_u16_le(grid.height);
        for block in &grid.blocks {
            self.buf
                .put_slice(&[block.r, block.gr, block.gb, block.b, block.saturation]);
        }
        self
    }

    /// Append a histogram section.
    #[must_use]
    pub fn histogram(mut self, terminal_index: u8, histogram: &Histogram) -> Self {
        self.section(terminal_index, histogram.bins.len() * 4);
        for &count in &histogram.bins {
            self.buf.put_u32_le(count);
        }
        self
    }

    /// Append an AF grid section.
    #[must_use]
    pub fn af(mut self, terminal_index: u8, grid: &AfGrid) -> Self {
        self.section(
            terminal_index,
            4 + grid.filter_response_1.len() * AfGrid::WIRE_SIZE,
        );
        self.buf.put_u16_le(grid.width);
        self.buf.put_u16_le(grid.height);
        for (f1, f2) in grid.filter_response_1.iter().zip(&grid.filter_response_2) {
            self.buf.put_u32_le(*f1);
            self.buf.put_u32_le(*f2);
        }
        self
    }

    /// Append a DVS motion vector section.
    ///
    /// # Panics
    /// Panics if `stats` holds more than [`MAX_DVS_VECTORS`] vectors.
    #[must_use]
    pub fn dvs(mut self, terminal_index: u8, stats: &DvsStatistics) -> Self {
        assert!(
            stats.vectors.len() <= MAX_DVS_VECTORS,
            "DVS section holds at most {MAX_DVS_VECTORS} vectors"
        );
        self.section(
            terminal_index,
            4 + stats.vectors.len() * MotionVector::WIRE_SIZE,
        );
        self.buf.put_u32_le(stats.vectors.len() as u32);
        for v in &stats.vectors {
            self.buf.put_i16_le(v.x);
            self.buf.put_i16_le(v.y);
            self.buf.put_i16_le(v.dx);
            self.buf.put_i16_le(v.dy);
        }
        self
    }

    /// Append raw bytes as a section (for malformed-input tests).
    #[must_use]
    pub fn raw(mut self, terminal_index: u8, body: &[u8]) -> Self {
        self.section(terminal_index, body.len());
        self.buf.put_slice(body);
        self
    }

    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_helpers() {
        let mut histogram = Histogram::default();
        histogram.bins[10] = 5;
        histogram.bins[200] = 3;

        assert_eq!(histogram.brightest_bin(), Some(200));
        assert_eq!(histogram.pixel_count(0, 100), 5);
        assert_eq!(histogram.pixel_count(0, 10_000), 8);
        assert_eq!(histogram.pixel_count(201, 100), 0);
        assert_eq!(histogram.total(), 8);
        assert_eq!(Histogram::default().brightest_bin(), None);
    }

    #[test]
    fn test_stats_map_lookup() {
        let map = StatsTerminalMap::new()
            .with(4, StatsKind::RgbsGrid)
            .with(5, StatsKind::Histogram)
            .with(4, StatsKind::AfGrid);
        assert_eq!(map.len(), 2);
        assert_eq!(map.kind_of(4), Some(StatsKind::AfGrid));
        assert_eq!(map.kind_of(9), None);
    }

    #[test]
    fn test_writer_section_layout() {
        let grid = RgbsGrid {
            width: 1,
            height: 1,
            blocks: vec![RgbsBlock {
                r: 1,
                gr: 2,
                gb: 3,
                b: 4,
                saturation: 0,
            }],
        };
        let blob = StatsBlobWriter::new().rgbs(7, &grid).finish();
        assert_eq!(blob.as_ref(), &[7, 9, 0, 0, 0, 1, 0, 1, 0, 1, 2, 3, 4, 0]);
    }

    #[test]
    fn test_dvs_section_layout_and_mean() {
        let stats = DvsStatistics {
            vectors: vec![
                MotionVector {
                    x: 1,
                    y: 2,
                    dx: -4,
                    dy: 6,
                },
                MotionVector {
                    x: 2,
                    y: 2,
                    dx: 2,
                    dy: 0,
                },
            ],
        };
        let blob = StatsBlobWriter::new().dvs(3, &stats).finish();
        assert_eq!(&blob[..9], &[3, 20, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&blob[9..17], &[1, 0, 2, 0, 0xFC, 0xFF, 6, 0]);
        assert_eq!(stats.mean_motion(), (-1.0, 3.0));
        assert_eq!(DvsStatistics::default().mean_motion(), (0.0, 0.0));
    }

    #[test]
    fn test_mean_green() {
        let grid = RgbsGrid {
            width: 2,
            height: 1,
            blocks: vec![
                RgbsBlock {
                    gr: 100,
                    gb: 100,
                    ..RgbsBlock::default()
                },
                RgbsBlock {
                    gr: 50,
                    gb: 50,
                    ..RgbsBlock::default()
                },
            ],
        };
        assert!((grid.mean_green() - 75.0).abs() < f32::EPSILON);
    }
}
