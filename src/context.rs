//! One parameter-generation pipeline.
//!
//! An [`AicContext`] owns the result cache, the statistics pool and the
//! kernel groups of one stream, plus the collaborators it runs with. All of
//! its bounded structures are sized once from [`ContextSizing`]; only
//! [`AicContext::reinit`] reallocates them.
//!
//! The cache and the pool carry their own locks and are exposed as `Arc`s,
//! so a statistics producer and an algorithm thread can work on them while
//! the owner of the context runs kernels. Kernel runs themselves need
//! `&mut self` and are therefore serialized per context.

use crate::collaborators::Collaborators;
use crate::error::{AicError, AicResult};
use crate::kernel::{
    GroupConfig, KernelGroups, KernelResolution, PalOutput, TerminalBinding, TerminalMemory,
    TerminalSizeTable,
};
use crate::limits::{validate_stats_grid, MAX_GROUPS, MAX_RESULT_CACHE_LEN, MAX_STATS_SLOTS};
use crate::result_cache::ResultCache;
use crate::results::ResultBundle;
use crate::stats::{DecodedStatistics, RgbsBlock, StatsLimits};
use crate::tuning::TuningDefaults;
use aic_pool::{PoolError, SlotHandle, SlotInfo, StatsBufferPool, StatsPayload, StatsQuery};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Capacities of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSizing {
    /// Frames kept in the result cache.
    pub result_cache_len: usize,
    /// Statistics slots.
    pub stats_slots: usize,
    /// Kernel groups.
    pub max_groups: usize,
    pub max_stats_width: u32,
    pub max_stats_height: u32,
}

impl Default for ContextSizing {
    fn default() -> Self {
        crate::config::SizingConfig::default().context_sizing()
    }
}

impl ContextSizing {
    /// Check every capacity against the hard limits.
    pub fn validate(&self) -> AicResult<()> {
        for (name, value, limit) in [
            ("result cache length", self.result_cache_len, MAX_RESULT_CACHE_LEN),
            ("statistics slots", self.stats_slots, MAX_STATS_SLOTS),
            ("kernel groups", self.max_groups, MAX_GROUPS),
        ] {
            if value == 0 || value > limit {
                return Err(AicError::invalid(format!("{name} {value} outside 1..={limit}")));
            }
        }
        validate_stats_grid(
            self.max_stats_width,
            self.max_stats_height,
            RgbsBlock::WIRE_SIZE,
        )?;
        Ok(())
    }

    fn stats_limits(&self) -> StatsLimits {
        StatsLimits {
            max_width: self.max_stats_width,
            max_height: self.max_stats_height,
        }
    }
}

/// Result cache, statistics pool and kernel groups of one stream.
#[derive(Debug)]
pub struct AicContext {
    id: i32,
    sizing: ContextSizing,
    results: Arc<ResultCache>,
    stats: Arc<StatsBufferPool>,
    groups: KernelGroups,
    collaborators: Collaborators,
    maker_note: Option<Bytes>,
}

impl AicContext {
    /// Create a context with empty cache, pool and group table.
    pub fn new(
        id: i32,
        sizing: ContextSizing,
        defaults: &TuningDefaults,
        collaborators: Collaborators,
    ) -> AicResult<Self> {
        sizing.validate()?;
        info!(
            context_id = id,
            result_cache_len = sizing.result_cache_len,
            stats_slots = sizing.stats_slots,
            max_groups = sizing.max_groups,
            "Creating AIC context"
        );

        Ok(Self {
            id,
            sizing,
            results: Arc::new(ResultCache::new(
                sizing.result_cache_len,
                defaults.cold_start_bundle(),
            )),
            stats: Arc::new(StatsBufferPool::new(sizing.stats_slots)),
            groups: KernelGroups::new(sizing.max_groups),
            collaborators,
            maker_note: None,
        })
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[must_use]
    pub fn sizing(&self) -> ContextSizing {
        self.sizing
    }

    /// Reallocate cache, pool and group table.
    ///
    /// Cached results, statistics, groups and buffer bindings are dropped.
    /// Holders of the previous cache or pool `Arc` keep a detached copy.
    pub fn reinit(&mut self, sizing: ContextSizing, defaults: &TuningDefaults) -> AicResult<()> {
        sizing.validate()?;
        self.sizing = sizing;
        self.results = Arc::new(ResultCache::new(
            sizing.result_cache_len,
            defaults.cold_start_bundle(),
        ));
        self.stats = Arc::new(StatsBufferPool::new(sizing.stats_slots));
        self.groups = KernelGroups::new(sizing.max_groups);
        info!(context_id = self.id, "AIC context re-initialized");
        Ok(())
    }

    /// Replace the cold-start results. Everything else is kept.
    pub fn update_tuning(&mut self, defaults: &TuningDefaults) {
        self.results.reset_cold_start(defaults.cold_start_bundle());
        debug!(context_id = self.id, "Tuning updated");
    }

    #[must_use]
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    // ---- kernel groups ----------------------------------------------------

    /// Validate and commit a kernel group; see [`KernelGroups::configure`].
    pub fn configure(&mut self, config: &GroupConfig) -> AicResult<TerminalSizeTable> {
        self.groups.configure(config)
    }

    /// Apply new fragment geometry to a configured group; see
    /// [`KernelGroups::update_resolutions`].
    pub fn update_resolutions(
        &mut self,
        group_id: i32,
        updates: &[KernelResolution],
        key_changed: bool,
    ) -> AicResult<TerminalSizeTable> {
        self.groups.update_resolutions(group_id, updates, key_changed)
    }

    /// Configured group ids, ascending.
    #[must_use]
    pub fn group_ids(&self) -> Vec<i32> {
        self.groups.ids()
    }

    #[must_use]
    pub fn groups(&self) -> &KernelGroups {
        &self.groups
    }

    pub fn terminal_sizes(&self, group_id: i32) -> AicResult<TerminalSizeTable> {
        self.groups.terminal_sizes(group_id)
    }

    pub fn buffer_size(
        &self,
        group_id: i32,
        terminal_index: u32,
        fragment_index: u32,
    ) -> AicResult<usize> {
        self.groups
            .buffer_size(group_id, terminal_index, fragment_index)
    }

    pub fn register_buffer(
        &mut self,
        group_id: i32,
        terminal_index: u32,
        fragment_index: u32,
        memory: TerminalMemory,
        size: usize,
    ) -> AicResult<()> {
        self.groups
            .register_buffer(group_id, terminal_index, fragment_index, memory, size)
    }

    pub fn get_buffer(
        &self,
        group_id: i32,
        terminal_index: u32,
        fragment_index: u32,
    ) -> AicResult<TerminalBinding> {
        self.groups
            .get_buffer(group_id, terminal_index, fragment_index)
    }

    /// Encode kernel parameters of `group_id` for one frame and fragment.
    ///
    /// Uses the cached results of `frame_id`, with missing modules (or the
    /// whole bundle) taken from cold start.
    pub fn run_kernels(
        &mut self,
        group_id: i32,
        frame_id: u64,
        fragment_index: u32,
    ) -> AicResult<PalOutput> {
        let results = self.results.query_complete(frame_id);
        self.groups.run_kernels(
            group_id,
            frame_id,
            fragment_index,
            &results,
            self.collaborators.encoder.as_ref(),
        )
    }

    /// Run every fragment of the groups selected by `mask`.
    ///
    /// Bit `i` selects the `i`-th configured group in ascending id order.
    /// Stops at the first failing group.
    pub fn run_groups(&mut self, frame_id: u64, mask: u32) -> AicResult<Vec<PalOutput>> {
        let results = self.results.query_complete(frame_id);
        let mut outputs = Vec::new();

        for (bit, group_id) in self.groups.ids().into_iter().enumerate() {
            if bit >= 32 || mask & (1 << bit) == 0 {
                continue;
            }
            let fragments = self.groups.group(group_id)?.fragment_count();
            for fragment_index in 0..fragments {
                outputs.push(self.groups.run_kernels(
                    group_id,
                    frame_id,
                    fragment_index,
                    &results,
                    self.collaborators.encoder.as_ref(),
                )?);
            }
        }

        trace!(frame_id, mask, outputs = outputs.len(), "Kernel groups run");
        Ok(outputs)
    }

    // ---- statistics -------------------------------------------------------

    /// Store the statistics of `frame_id` (producer side).
    pub fn fill_statistics(&self, frame_id: u64, payload: StatsPayload) -> AicResult<SlotHandle> {
        let handle = self.stats.acquire_for_fill()?;
        self.stats.mark_filled(handle, frame_id, payload)?;
        Ok(handle)
    }

    /// Decode the statistics of `frame_id` with the statistics terminals of
    /// `group_id`.
    ///
    /// The statistics must be FILLED or USING; decoding does not change
    /// the slot state.
    pub fn decode_statistics(&self, group_id: i32, frame_id: u64) -> AicResult<DecodedStatistics> {
        let terminals = self.groups.group(group_id)?.stats_terminals();
        if terminals.is_empty() {
            return Err(AicError::NotFound(format!(
                "group {group_id} has no statistics terminals"
            )));
        }

        let missing = || AicError::NotFound(format!("no statistics for frame {frame_id}"));
        let slot = self.stats.find_frame(frame_id).ok_or_else(missing)?;
        let payload = self.stats.payload(slot.handle).map_err(|e| match e {
            PoolError::StaleHandle { .. } | PoolError::InvalidState { .. } => missing(),
            other => other.into(),
        })?;

        let decoded = self.collaborators.decoder.decode(
            group_id,
            frame_id,
            &payload,
            terminals,
            &self.sizing.stats_limits(),
        )?;
        trace!(group_id, frame_id, slot = slot.handle.index(), "Statistics decoded");
        Ok(decoded)
    }

    /// Find a statistics slot by status; see [`StatsBufferPool::query_by_status`].
    #[must_use]
    pub fn query_stats_buffer(&self, status: StatsQuery, frame_id: Option<u64>) -> Option<SlotInfo> {
        self.stats.query_by_status(status, frame_id)
    }

    /// FILLED → USING.
    pub fn claim_statistics(&self, handle: SlotHandle) -> AicResult<()> {
        Ok(self.stats.claim(handle)?)
    }

    /// USING → EMPTY.
    pub fn release_statistics(&self, handle: SlotHandle) -> AicResult<()> {
        Ok(self.stats.release(handle)?)
    }

    #[must_use]
    pub fn stats_pool(&self) -> &Arc<StatsBufferPool> {
        &self.stats
    }

    // ---- results ----------------------------------------------------------

    /// Store a copy of `bundle` for `frame_id`.
    pub fn save_results(&self, frame_id: u64, bundle: &ResultBundle) {
        self.results.save(frame_id, bundle);
    }

    /// Store `bundle` for `frame_id` without copying its records.
    pub fn assign_results(&self, frame_id: u64, bundle: ResultBundle) {
        self.results.assign(frame_id, bundle);
    }

    /// Cached results of `frame_id`, or cold start.
    #[must_use]
    pub fn query_results(&self, frame_id: u64) -> ResultBundle {
        self.results.query(frame_id)
    }

    #[must_use]
    pub fn result_cache(&self) -> &Arc<ResultCache> {
        &self.results
    }

    // ---- maker note -------------------------------------------------------

    /// Maker-note data attached at init.
    #[must_use]
    pub fn maker_note(&self) -> Option<&Bytes> {
        self.maker_note.as_ref()
    }

    pub fn set_maker_note(&mut self, maker_note: Option<Bytes>) {
        self.maker_note = maker_note;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelDescriptor, Section, TerminalType};
    use crate::results::ExposureResult;
    use crate::stats::{Histogram, StatsBlobWriter, StatsKind, StatsTerminalMap};

    fn context() -> AicContext {
        AicContext::new(
            0,
            ContextSizing::default(),
            &TuningDefaults::default(),
            Collaborators::default(),
        )
        .unwrap()
    }

    fn stats_group(group_id: i32) -> GroupConfig {
        GroupConfig::new(group_id, 1)
            .kernel(KernelDescriptor::new(10))
            .kernel(KernelDescriptor::new(11))
            .offset(10, TerminalType::ParamIn, 0, 0, vec![Section::new(0, 32)])
            .offset(11, TerminalType::ParamOut, 1, 0, vec![Section::new(0, 1024)])
            .stats_terminals(StatsTerminalMap::new().with(1, StatsKind::Histogram))
    }

    #[test]
    fn test_sizing_validation() {
        let sizing = ContextSizing {
            stats_slots: 0,
            ..ContextSizing::default()
        };
        assert!(AicContext::new(0, sizing, &TuningDefaults::default(), Collaborators::default())
            .is_err());

        let sizing = ContextSizing {
            max_stats_width: 4096,
            ..ContextSizing::default()
        };
        assert!(sizing.validate().is_err());
    }

    #[test]
    fn test_decode_statistics_roundtrip_through_pool() {
        let mut ctx = context();
        ctx.configure(&stats_group(2)).unwrap();

        let mut histogram = Histogram::default();
        histogram.bins[42] = 9;
        let blob = StatsBlobWriter::new().histogram(1, &histogram).finish();
        let handle = ctx.fill_statistics(7, StatsPayload::new(blob)).unwrap();

        let stats = ctx.decode_statistics(2, 7).unwrap();
        assert_eq!(stats.brightest_bin(), Some(42));

        // Still decodable while claimed
        ctx.claim_statistics(handle).unwrap();
        assert!(ctx.decode_statistics(2, 7).is_ok());
        ctx.release_statistics(handle).unwrap();

        assert!(matches!(
            ctx.decode_statistics(2, 7),
            Err(AicError::NotFound(_))
        ));
    }

    #[test]
    fn test_decode_requires_statistics_terminals() {
        let mut ctx = context();
        let config = GroupConfig::new(0, 1)
            .kernel(KernelDescriptor::new(1))
            .offset(1, TerminalType::ParamIn, 0, 0, vec![Section::new(0, 8)]);
        ctx.configure(&config).unwrap();
        ctx.fill_statistics(1, StatsPayload::default()).unwrap();

        assert!(matches!(
            ctx.decode_statistics(0, 1),
            Err(AicError::NotFound(_))
        ));
        assert!(matches!(
            ctx.decode_statistics(3, 1),
            Err(AicError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_run_kernels_uses_cached_results() {
        let mut ctx = context();
        ctx.configure(&stats_group(0)).unwrap();
        let memory = TerminalMemory::zeroed(32);
        ctx.register_buffer(0, 0, 0, memory.clone(), 32).unwrap();

        ctx.run_kernels(0, 1, 0).unwrap();
        let cold = memory.to_vec();

        ctx.save_results(
            1,
            &ResultBundle::new().with_exposure(ExposureResult {
                exposure_time_us: 1234,
                ..ExposureResult::default()
            }),
        );
        let output = ctx.run_kernels(0, 1, 0).unwrap();
        assert_eq!(output.writes[0].generation, 2);
        assert_ne!(memory.to_vec(), cold);
    }

    #[test]
    fn test_run_groups_mask_selects_by_position() {
        let mut ctx = context();
        for group_id in [3, 1] {
            ctx.configure(&stats_group(group_id)).unwrap();
            ctx.register_buffer(group_id, 0, 0, TerminalMemory::zeroed(32), 32)
                .unwrap();
        }

        // Bit 1 is the second group in id order: group 3
        let outputs = ctx.run_groups(0, 0b10).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].group_id, 3);
        assert_eq!(ctx.run_groups(0, u32::MAX).unwrap().len(), 2);
        assert!(ctx.run_groups(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_update_tuning_and_reinit() {
        let mut ctx = context();
        ctx.configure(&stats_group(0)).unwrap();
        ctx.save_results(5, &ResultBundle::defaults());

        let mut tuned = TuningDefaults::default();
        tuned.exposure.exposure_time_us = 999;
        ctx.update_tuning(&tuned);
        assert_eq!(ctx.query_results(6).exposure.unwrap().exposure_time_us, 999);
        assert!(ctx.result_cache().contains(5));
        assert_eq!(ctx.group_ids(), vec![0]);

        let sizing = ContextSizing {
            result_cache_len: 2,
            ..ContextSizing::default()
        };
        ctx.reinit(sizing, &TuningDefaults::default()).unwrap();
        assert!(ctx.group_ids().is_empty());
        assert!(ctx.result_cache().is_empty());
        assert_eq!(ctx.result_cache().capacity(), 2);
    }
}
