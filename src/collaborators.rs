//! Narrow interfaces to the components this crate does not own.
//!
//! The core only needs three things from the outside world:
//!
//! - [`StatisticsDecoder`]: turn a raw statistics blob into
//!   [`DecodedStatistics`]
//! - [`KernelEncoder`]: turn results into one kernel's parameter section
//! - [`TuningSource`]: turn a tuning blob into [`TuningDefaults`]
//!
//! They are injected through [`Collaborators`]. The reference
//! implementations in this module implement documented formats and are
//! what the simulator and the tests run with.

use crate::error::{AicError, AicResult};
use crate::kernel::KernelContext;
use crate::limits::{validate_stats_grid, HISTOGRAM_BINS, MAX_CALIBRATION_BYTES, MAX_DVS_VECTORS};
use crate::results::{ResultBundle, ResultModules};
use crate::stats::{
    AfGrid, DecodedStatistics, DvsStatistics, Histogram, MotionVector, RgbsBlock, RgbsGrid,
    StatsKind, StatsLimits, StatsTerminalMap,
};
use crate::tuning::TuningDefaults;
use aic_pool::StatsPayload;
use bytes::Buf;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;
use xxhash_rust::xxh64::Xxh64;

/// Decodes the statistics blob of one frame.
pub trait StatisticsDecoder: Send + Sync {
    fn decode(
        &self,
        group_id: i32,
        frame_id: u64,
        payload: &StatsPayload,
        terminals: &StatsTerminalMap,
        limits: &StatsLimits,
    ) -> AicResult<DecodedStatistics>;
}

/// Encodes one kernel section from the frame's results.
///
/// `out` is exactly the section's byte range inside the terminal buffer.
pub trait KernelEncoder: Send + Sync {
    fn encode(
        &self,
        ctx: &KernelContext<'_>,
        results: &ResultBundle,
        out: &mut [u8],
    ) -> AicResult<()>;
}

/// Produces tuning defaults from tuning and calibration blobs.
pub trait TuningSource: Send + Sync {
    fn load(&self, tuning: &[u8], calibration: Option<&[u8]>) -> AicResult<TuningDefaults>;
}

/// The three collaborators of a context.
#[derive(Clone)]
pub struct Collaborators {
    pub decoder: Arc<dyn StatisticsDecoder>,
    pub encoder: Arc<dyn KernelEncoder>,
    pub tuning: Arc<dyn TuningSource>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            decoder: Arc::new(SectionDecoder),
            encoder: Arc::new(ReferenceEncoder::default()),
            tuning: Arc::new(TomlTuning),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Decoder for the section format described in [`crate::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionDecoder;

impl SectionDecoder {
    fn grid_header(body: &mut &[u8], kind: &str, limits: &StatsLimits) -> AicResult<(u16, u16)> {
        if body.remaining() < 4 {
            return Err(AicError::invalid(format!("{kind} section has no grid header")));
        }
        let width = body.get_u16_le();
        let height = body.get_u16_le();
        if u32::from(width) > limits.max_width || u32::from(height) > limits.max_height {
            return Err(AicError::invalid(format!(
                "{kind} grid {width}x{height} exceeds {}x{}",
                limits.max_width, limits.max_height
            )));
        }
        Ok((width, height))
    }

    fn rgbs(mut body: &[u8], limits: &StatsLimits) -> AicResult<RgbsGrid> {
        let (width, height) = Self::grid_header(&mut body, "RGBS", limits)?;
        let size = validate_stats_grid(u32::from(width), u32::from(height), RgbsBlock::WIRE_SIZE)?;
        if body.len() != size.bytes {
            return Err(AicError::invalid(format!(
                "RGBS grid {width}x{height} needs {} bytes, section has {}",
                size.bytes,
                body.len()
            )));
        }
        let blocks = body
            .chunks_exact(RgbsBlock::WIRE_SIZE)
            .map(|c| RgbsBlock {
                r: c[0],
                gr: c[1],
                gb: c[2],
                b: c[3],
                saturation: c[4],
            })
            .collect();
        Ok(RgbsGrid {
            width,
            height,
            blocks,
        })
    }

    fn histogram(mut body: &[u8]) -> AicResult<Histogram> {
        if body.len() != HISTOGRAM_BINS * 4 {
            return Err(AicError::invalid(format!(
                "histogram section has {} bytes, expected {}",
                body.len(),
                HISTOGRAM_BINS * 4
            )));
        }
        let mut bins = Vec::with_capacity(HISTOGRAM_BINS);
        while body.has_remaining() {
            bins.push(body.get_u32_le());
        }
        Ok(Histogram { bins })
    }

    fn af(mut body: &[u8], limits: &StatsLimits) -> AicResult<AfGrid> {
        let (width, height) = Self::grid_header(&mut body, "AF", limits)?;
        let size = validate_stats_grid(u32::from(width), u32::from(height), AfGrid::WIRE_SIZE)?;
        if body.len() != size.bytes {
            return Err(AicError::invalid(format!(
                "AF grid {width}x{height} needs {} bytes, section has {}",
                size.bytes,
                body.len()
            )));
        }
        let mut grid = AfGrid {
            width,
            height,
            filter_response_1: Vec::with_capacity(size.cells),
            filter_response_2: Vec::with_capacity(size.cells),
        };
        while body.has_remaining() {
            grid.filter_response_1.push(body.get_u32_le());
            grid.filter_response_2.push(body.get_u32_le());
        }
        Ok(grid)
    }

    fn dvs(mut body: &[u8]) -> AicResult<DvsStatistics> {
        if body.remaining() < 4 {
            return Err(AicError::invalid("DVS section has no vector count"));
        }
        let count = body.get_u32_le() as usize;
        if count > MAX_DVS_VECTORS {
            return Err(AicError::invalid(format!(
                "DVS section carries {count} vectors, limit is {MAX_DVS_VECTORS}"
            )));
        }
        if body.len() != count * MotionVector::WIRE_SIZE {
            return Err(AicError::invalid(format!(
                "{count} DVS vectors need {} bytes, section has {}",
                count * MotionVector::WIRE_SIZE,
                body.len()
            )));
        }
        let mut vectors = Vec::with_capacity(count);
        while body.has_remaining() {
            vectors.push(MotionVector {
                x: body.get_i16_le(),
                y: body.get_i16_le(),
                dx: body.get_i16_le(),
                dy: body.get_i16_le(),
            });
        }
        Ok(DvsStatistics { vectors })
    }
}

impl StatisticsDecoder for SectionDecoder {
    fn decode(
        &self,
        group_id: i32,
        frame_id: u64,
        payload: &StatsPayload,
        terminals: &StatsTerminalMap,
        limits: &StatsLimits,
    ) -> AicResult<DecodedStatistics> {
        let mut stats = DecodedStatistics {
            group_id,
            frame_id,
            illuminated: payload.illuminated,
            flash_stage: payload.flash_stage,
            analog_gain: payload.analog_gain,
            digital_gain: payload.digital_gain,
            ..DecodedStatistics::default()
        };

        let mut buf: &[u8] = &payload.data;
        while buf.has_remaining() {
            if buf.remaining() < 5 {
                return Err(AicError::invalid("truncated statistics section header"));
            }
            let terminal_index = u32::from(buf.get_u8());
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(AicError::invalid(format!(
                    "statistics section of terminal {terminal_index} truncated: {len} bytes declared, {} left",
                    buf.remaining()
                )));
            }
            let (body, rest) = buf.split_at(len);
            buf = rest;

            let Some(kind) = terminals.kind_of(terminal_index) else {
                trace!(group_id, frame_id, terminal_index, "Skipping unmapped statistics section");
                continue;
            };

            let duplicate = match kind {
                StatsKind::RgbsGrid => stats.rgbs.replace(Self::rgbs(body, limits)?).is_some(),
                StatsKind::Histogram => stats.histogram.replace(Self::histogram(body)?).is_some(),
                StatsKind::AfGrid => stats.af.replace(Self::af(body, limits)?).is_some(),
                StatsKind::Dvs => stats.dvs.replace(Self::dvs(body)?).is_some(),
            };
            if duplicate {
                return Err(AicError::invalid(format!(
                    "frame {frame_id} carries {kind:?} statistics twice"
                )));
            }
        }

        Ok(stats)
    }
}

/// Size of the record [`ReferenceEncoder`] writes at the start of a section.
pub const KERNEL_RECORD_SIZE: usize = 24;

/// Deterministic reference encoder.
///
/// Each section starts with a 24-byte little-endian record:
///
/// | bytes  | field                                      |
/// |--------|--------------------------------------------|
/// | 0..4   | kernel uuid                                |
/// | 4      | enable code                                |
/// | 5      | fragment index                             |
/// | 6..8   | section index                              |
/// | 8..16  | frame id                                   |
/// | 16..24 | XXH64 digest of the results it depends on  |
///
/// The rest of the section is zero-filled. Sections shorter than the record
/// receive its prefix. Disabled kernels get a zero digest.
#[derive(Debug, Clone, Default)]
pub struct ReferenceEncoder {
    dependencies: HashMap<u32, ResultModules>,
}

impl ReferenceEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the digest of `uuid` to `modules`. Kernels without an entry
    /// depend on every module.
    #[must_use]
    pub fn with_dependency(mut self, uuid: u32, modules: ResultModules) -> Self {
        self.dependencies.insert(uuid, modules);
        self
    }

    /// Digest of the selected modules of `results`.
    #[must_use]
    pub fn digest(results: &ResultBundle, modules: ResultModules) -> u64 {
        let mut d = Xxh64::new(0);
        d.update(&modules.bits().to_le_bytes());

        if modules.contains(ResultModules::EXPOSURE) {
            if let Some(ae) = &results.exposure {
                d.update(&ae.exposure_time_us.to_le_bytes());
                d.update(&ae.analog_gain.to_le_bytes());
                d.update(&ae.digital_gain.to_le_bytes());
                d.update(&ae.total_target_exposure.to_le_bytes());
            }
        }
        if modules.contains(ResultModules::WHITE_BALANCE) {
            if let Some(awb) = &results.white_balance {
                d.update(&awb.final_r_per_g.to_le_bytes());
                d.update(&awb.final_b_per_g.to_le_bytes());
                d.update(&awb.cct.to_le_bytes());
            }
        }
        if modules.contains(ResultModules::FOCUS) {
            if let Some(af) = &results.focus {
                d.update(&af.next_lens_position.to_le_bytes());
            }
        }
        if modules.contains(ResultModules::COLOR) {
            if let Some(pa) = &results.color {
                pa.color_gains.iter().for_each(|&g| d.update(&g.to_le_bytes()));
                pa.color_conversion_matrix
                    .iter()
                    .flatten()
                    .for_each(|&c| d.update(&c.to_le_bytes()));
                pa.black_level.iter().for_each(|&b| d.update(&b.to_le_bytes()));
            }
        }
        if modules.contains(ResultModules::TONE_MAP) {
            if let Some(gtm) = &results.tone_map {
                gtm.gamma_lut.iter().for_each(|&v| d.update(&u32::from(v).to_le_bytes()));
                gtm.tone_map_lut.iter().for_each(|&v| d.update(&u32::from(v).to_le_bytes()));
            }
        }
        if modules.contains(ResultModules::SHADING) {
            if let Some(lsc) = &results.shading {
                d.update(&u32::from(lsc.grid_width).to_le_bytes());
                d.update(&u32::from(lsc.grid_height).to_le_bytes());
                lsc.gains.iter().for_each(|&g| d.update(&u32::from(g).to_le_bytes()));
            }
        }
        if modules.contains(ResultModules::LOCAL_TONE_MAP) {
            if let Some(ltm) = &results.local_tone_map {
                d.update(&ltm.ltm_gain.to_le_bytes());
                d.update(&ltm.dynamic_range_ratio.to_le_bytes());
            }
        }
        if modules.contains(ResultModules::STABILIZATION) {
            if let Some(dvs) = &results.stabilization {
                d.update(&dvs.zoom_ratio.to_le_bytes());
                d.update(&dvs.offset_x.to_le_bytes());
                d.update(&dvs.offset_y.to_le_bytes());
            }
        }
        if modules.contains(ResultModules::BIT_COMPRESSION) {
            if let Some(bcomp) = &results.bit_compression {
                d.update(&u32::from(bcomp.input_bits).to_le_bytes());
                d.update(&u32::from(bcomp.output_bits).to_le_bytes());
                bcomp.lut.iter().for_each(|&v| d.update(&v.to_le_bytes()));
            }
        }
        d.digest()
    }
}

impl KernelEncoder for ReferenceEncoder {
    fn encode(
        &self,
        ctx: &KernelContext<'_>,
        results: &ResultBundle,
        out: &mut [u8],
    ) -> AicResult<()> {
        let modules = self
            .dependencies
            .get(&ctx.kernel.uuid)
            .copied()
            .unwrap_or(ResultModules::all());
        let digest = match ctx.kernel.enable {
            crate::kernel::KernelEnable::Disable => 0,
            _ => Self::digest(results, modules),
        };

        let mut record = [0u8; KERNEL_RECORD_SIZE];
        record[0..4].copy_from_slice(&ctx.kernel.uuid.to_le_bytes());
        record[4] = ctx.kernel.enable.code();
        record[5] = ctx.fragment_index as u8;
        let section_index = u16::try_from(ctx.section_index).map_err(|_| {
            AicError::invalid(format!(
                "kernel {} section index {} does not fit the record",
                ctx.kernel.uuid, ctx.section_index
            ))
        })?;
        record[6..8].copy_from_slice(&section_index.to_le_bytes());
        record[8..16].copy_from_slice(&ctx.frame_id.to_le_bytes());
        record[16..24].copy_from_slice(&digest.to_le_bytes());

        out.fill(0);
        let n = out.len().min(KERNEL_RECORD_SIZE);
        out[..n].copy_from_slice(&record[..n]);
        Ok(())
    }
}

/// Tuning blobs as UTF-8 TOML of [`TuningDefaults`].
///
/// An empty blob selects the built-in defaults. Calibration data is only
/// size-checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlTuning;

impl TuningSource for TomlTuning {
    fn load(&self, tuning: &[u8], calibration: Option<&[u8]>) -> AicResult<TuningDefaults> {
        if let Some(calibration) = calibration {
            if calibration.len() > MAX_CALIBRATION_BYTES {
                return Err(AicError::Tuning(format!(
                    "calibration blob of {} bytes exceeds {MAX_CALIBRATION_BYTES}",
                    calibration.len()
                )));
            }
        }

        if tuning.is_empty() {
            return Ok(TuningDefaults::default());
        }

        let text = std::str::from_utf8(tuning)
            .map_err(|e| AicError::Tuning(format!("tuning blob is not UTF-8: {e}")))?;
        toml::from_str(text).map_err(|e| AicError::Tuning(e.to_string()))
    }
}
