//! Kernel groups and their terminal tables.
//!
//! A [`KernelGroup`] is the validated, immutable form of a [`GroupConfig`].
//! [`KernelGroups`] holds up to `G` groups of one context together with the
//! terminal buffers registered against them.
//!
//! Configuration is all-or-nothing: a group is fully validated before it
//! replaces the previous one, so a rejected `configure` leaves the running
//! configuration and its buffers untouched.

use crate::bounded::BoundedMap;
use crate::collaborators::KernelEncoder;
use crate::error::{AicError, AicResult};
use crate::kernel::terminal::{
    PalOutput, TerminalBinding, TerminalMemory, TerminalSize, TerminalSizeTable, TerminalWrite,
    TerminalWrites,
};
use crate::kernel::types::{
    GroupConfig, KernelContext, KernelDescriptor, KernelOffset, KernelResolution, Section,
    TerminalType,
};
use crate::limits::{
    MAX_FRAGMENTS, MAX_KERNELS_PER_GROUP, MAX_SECTIONS_PER_RECORD, MAX_TERMINALS,
    MAX_TERMINAL_WRITES,
};
use crate::results::ResultBundle;
use crate::stats::StatsTerminalMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace, warn};

/// A kernel's section placed in a terminal.
#[derive(Debug, Clone, Copy)]
struct Placement {
    /// Index into `KernelGroup::kernels`.
    kernel: usize,
    terminal_type: TerminalType,
    terminal_index: u32,
    fragment: u32,
    section_index: u32,
    section: Section,
    /// Position of (terminal, fragment) in the size table.
    entry: usize,
}

/// Validated kernel group.
#[derive(Debug, Clone)]
pub struct KernelGroup {
    group_id: i32,
    fragment_count: u32,
    operation_mode: u32,
    stream_id: i32,
    kernels: Vec<KernelDescriptor>,
    offsets: Vec<KernelOffset>,
    /// Sorted by declared kernel order.
    placements: Vec<Placement>,
    sizes: TerminalSizeTable,
    /// Per fragment, size table positions of the parameter sinks.
    fragment_sinks: Vec<Vec<usize>>,
    stats_terminals: StatsTerminalMap,
}

impl KernelGroup {
    /// Validate `config` and compute its terminal sizes.
    pub fn build(config: &GroupConfig) -> AicResult<Self> {
        let group_id = config.group_id;

        if group_id < 0 {
            return Err(AicError::invalid(format!("group id {group_id} is negative")));
        }
        if config.fragment_count == 0 || config.fragment_count > MAX_FRAGMENTS {
            return Err(AicError::invalid(format!(
                "group {group_id}: fragment count {} outside 1..={MAX_FRAGMENTS}",
                config.fragment_count
            )));
        }
        if config.kernels.len() > MAX_KERNELS_PER_GROUP {
            return Err(AicError::CapacityExceeded {
                what: "kernels per group",
                capacity: MAX_KERNELS_PER_GROUP,
            });
        }
        if config.kernels.is_empty() {
            return Err(AicError::mismatch(group_id, "kernel list is empty"));
        }

        let mut kernel_index = HashMap::with_capacity(config.kernels.len());
        for (i, kernel) in config.kernels.iter().enumerate() {
            if kernel_index.insert(kernel.uuid, i).is_some() {
                return Err(AicError::mismatch(
                    group_id,
                    format!("kernel {} is listed twice", kernel.uuid),
                ));
            }
            let described = kernel.fragments.len();
            if described != 0 && described != config.fragment_count as usize {
                return Err(AicError::mismatch(
                    group_id,
                    format!(
                        "kernel {} describes {described} fragments, group has {}",
                        kernel.uuid, config.fragment_count
                    ),
                ));
            }
        }

        let mut covered = vec![false; config.kernels.len()];
        let mut records = HashSet::with_capacity(config.offsets.len());
        let mut terminal_types: HashMap<u32, TerminalType> = HashMap::new();
        // (terminal, fragment) -> [(start, end, uuid)]
        let mut ranges: BTreeMap<(u32, u32), Vec<(u32, u32, u32)>> = BTreeMap::new();
        let mut placements = Vec::new();

        for record in &config.offsets {
            let uuid = record.uuid;
            let Some(&kernel) = kernel_index.get(&uuid) else {
                return Err(AicError::mismatch(
                    group_id,
                    format!("offset references unknown kernel {uuid}"),
                ));
            };
            if !records.insert((uuid, record.terminal_index, record.fragment)) {
                return Err(AicError::mismatch(
                    group_id,
                    format!(
                        "kernel {uuid} has two offset records for terminal {} fragment {}",
                        record.terminal_index, record.fragment
                    ),
                ));
            }
            if record.fragment >= config.fragment_count {
                return Err(AicError::mismatch(
                    group_id,
                    format!(
                        "kernel {uuid} targets fragment {} of {}",
                        record.fragment, config.fragment_count
                    ),
                ));
            }
            if record.terminal_index >= MAX_TERMINALS {
                return Err(AicError::mismatch(
                    group_id,
                    format!(
                        "kernel {uuid} targets terminal {} (limit {MAX_TERMINALS})",
                        record.terminal_index
                    ),
                ));
            }
            if record.sections.is_empty() {
                return Err(AicError::mismatch(
                    group_id,
                    format!("kernel {uuid} has an offset record without sections"),
                ));
            }
            if record.sections.len() > MAX_SECTIONS_PER_RECORD {
                return Err(AicError::mismatch(
                    group_id,
                    format!(
                        "kernel {uuid} has {} sections in terminal {} (limit {MAX_SECTIONS_PER_RECORD})",
                        record.sections.len(),
                        record.terminal_index
                    ),
                ));
            }
            match terminal_types.insert(record.terminal_index, record.terminal_type) {
                Some(previous) if previous != record.terminal_type => {
                    return Err(AicError::mismatch(
                        group_id,
                        format!(
                            "terminal {} declared as both {previous:?} and {:?}",
                            record.terminal_index, record.terminal_type
                        ),
                    ));
                }
                _ => {}
            }

            for (section_index, section) in record.sections.iter().enumerate() {
                let end = match section.end() {
                    Some(end) if section.size > 0 => end,
                    _ => {
                        return Err(AicError::mismatch(
                            group_id,
                            format!(
                                "kernel {uuid} has an invalid section at offset {} size {}",
                                section.offset, section.size
                            ),
                        ));
                    }
                };
                ranges
                    .entry((record.terminal_index, record.fragment))
                    .or_default()
                    .push((section.offset, end, uuid));
                placements.push(Placement {
                    kernel,
                    terminal_type: record.terminal_type,
                    terminal_index: record.terminal_index,
                    fragment: record.fragment,
                    section_index: section_index as u32,
                    section: *section,
                    entry: 0,
                });
            }
            covered[kernel] = true;
        }

        if let Some(missing) = covered.iter().position(|c| !c) {
            return Err(AicError::mismatch(
                group_id,
                format!("kernel {} has no offsets", config.kernels[missing].uuid),
            ));
        }

        let mut entries = Vec::with_capacity(ranges.len());
        for ((terminal_index, fragment_index), mut spans) in ranges {
            spans.sort_unstable();
            for pair in spans.windows(2) {
                let ((_, prev_end, prev_uuid), (start, _, uuid)) = (pair[0], pair[1]);
                if start < prev_end {
                    return Err(AicError::mismatch(
                        group_id,
                        format!(
                            "kernels {prev_uuid} and {uuid} overlap in terminal {terminal_index} fragment {fragment_index}"
                        ),
                    ));
                }
            }
            let size = spans.iter().map(|&(_, end, _)| end).max().unwrap_or(0);
            entries.push(TerminalSize {
                terminal_index,
                fragment_index,
                terminal_type: terminal_types
                    .get(&terminal_index)
                    .copied()
                    .unwrap_or(TerminalType::ParamIn),
                size: size as usize,
            });
        }

        let stats_terminals = config.stats_terminals.clone().unwrap_or_default();
        for terminal in stats_terminals.iter() {
            match terminal_types.get(&terminal.terminal_index) {
                Some(ty) if ty.is_statistics_source() => {}
                _ => {
                    return Err(AicError::mismatch(
                        group_id,
                        format!(
                            "statistics terminal {} is not a statistics output of the group",
                            terminal.terminal_index
                        ),
                    ));
                }
            }
        }

        let sizes = TerminalSizeTable { group_id, entries };
        for placement in &mut placements {
            placement.entry = sizes
                .position(placement.terminal_index, placement.fragment)
                .ok_or_else(|| {
                    AicError::mismatch(group_id, "kernel section outside the terminal table")
                })?;
        }
        placements.sort_by_key(|p| p.kernel);

        let mut fragment_sinks = vec![Vec::new(); config.fragment_count as usize];
        for (pos, entry) in sizes.entries.iter().enumerate() {
            if entry.terminal_type.is_parameter_sink() {
                if let Some(sinks) = fragment_sinks.get_mut(entry.fragment_index as usize) {
                    sinks.push(pos);
                }
            }
        }

        Ok(Self {
            group_id,
            fragment_count: config.fragment_count,
            operation_mode: config.operation_mode,
            stream_id: config.stream_id,
            kernels: config.kernels.clone(),
            offsets: config.offsets.clone(),
            placements,
            sizes,
            fragment_sinks,
            stats_terminals,
        })
    }

    /// Configuration equivalent to this group.
    #[must_use]
    pub fn config(&self) -> GroupConfig {
        GroupConfig {
            group_id: self.group_id,
            fragment_count: self.fragment_count,
            operation_mode: self.operation_mode,
            stream_id: self.stream_id,
            kernels: self.kernels.clone(),
            offsets: self.offsets.clone(),
            stats_terminals: Some(self.stats_terminals.clone()),
        }
    }

    /// Group (control block) id.
    #[must_use]
    pub fn group_id(&self) -> i32 {
        self.group_id
    }

    /// Number of fragments (stripes).
    #[must_use]
    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    /// Operation mode passed through from the configuration.
    #[must_use]
    pub fn operation_mode(&self) -> u32 {
        self.operation_mode
    }

    /// Stream the group belongs to.
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Kernels in declared order.
    #[must_use]
    pub fn kernels(&self) -> &[KernelDescriptor] {
        &self.kernels
    }

    /// Minimum buffer size of every (terminal, fragment) the group uses.
    #[must_use]
    pub fn terminal_sizes(&self) -> &TerminalSizeTable {
        &self.sizes
    }

    /// Statistics terminals and the kind of statistics each carries.
    #[must_use]
    pub fn stats_terminals(&self) -> &StatsTerminalMap {
        &self.stats_terminals
    }

    /// Validate new fragment geometry against this group.
    ///
    /// Returns the kernel list with the geometry applied; `self` is not
    /// changed.
    fn with_resolutions(&self, updates: &[KernelResolution]) -> AicResult<Vec<KernelDescriptor>> {
        let group_id = self.group_id;
        let mut kernels = self.kernels.clone();
        let mut seen = HashSet::with_capacity(updates.len());

        for update in updates {
            if !seen.insert(update.uuid) {
                return Err(AicError::mismatch(
                    group_id,
                    format!("kernel {} has two resolution updates", update.uuid),
                ));
            }
            let Some(kernel) = kernels.iter_mut().find(|k| k.uuid == update.uuid) else {
                return Err(AicError::mismatch(
                    group_id,
                    format!("resolution update for unknown kernel {}", update.uuid),
                ));
            };
            let described = update.fragments.len();
            if described != 0 && described != self.fragment_count as usize {
                return Err(AicError::mismatch(
                    group_id,
                    format!(
                        "kernel {} describes {described} fragments, group has {}",
                        update.uuid, self.fragment_count
                    ),
                ));
            }
            kernel.fragments.clone_from(&update.fragments);
        }
        Ok(kernels)
    }
}

#[derive(Debug)]
struct GroupEntry {
    group: KernelGroup,
    /// Aligned with `group.sizes.entries`.
    bindings: Vec<Option<TerminalBinding>>,
    /// Bytes written per size table entry by the current run.
    written: Vec<usize>,
}

impl GroupEntry {
    /// Entry for `group`, keeping the bindings of `previous` that still fit.
    fn new(group: KernelGroup, previous: Option<&GroupEntry>) -> Self {
        let group_id = group.group_id;
        let mut bindings: Vec<Option<TerminalBinding>> = vec![None; group.sizes.len()];
        if let Some(previous) = previous {
            for (old, binding) in previous.group.sizes.entries.iter().zip(&previous.bindings) {
                let Some(binding) = binding else { continue };
                match group.sizes.position(old.terminal_index, old.fragment_index) {
                    Some(pos) if binding.size >= group.sizes.entries[pos].size => {
                        bindings[pos] = Some(binding.clone());
                    }
                    _ => debug!(
                        group_id,
                        terminal_index = old.terminal_index,
                        fragment_index = old.fragment_index,
                        "Dropping buffer binding after reconfiguration"
                    ),
                }
            }
        }
        let written = vec![0; group.sizes.len()];
        Self {
            group,
            bindings,
            written,
        }
    }
}

/// The kernel groups of one context.
#[derive(Debug)]
pub struct KernelGroups {
    entries: BoundedMap<i32, GroupEntry>,
}

impl KernelGroups {
    /// Empty table for at most `capacity` groups.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BoundedMap::with_capacity(capacity),
        }
    }

    /// Maximum number of groups.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Number of configured groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no group is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured group ids, ascending.
    #[must_use]
    pub fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Validate and commit a group, replacing any previous configuration
    /// with the same id.
    ///
    /// Buffers registered for the previous configuration stay bound when
    /// their (terminal, fragment) still exists and is still large enough.
    pub fn configure(&mut self, config: &GroupConfig) -> AicResult<TerminalSizeTable> {
        let group = KernelGroup::build(config).map_err(|e| {
            warn!(group_id = config.group_id, error = %e, "Rejected kernel group configuration");
            e
        })?;
        let group_id = group.group_id;

        if !self.entries.contains_key(&group_id) && self.entries.is_full() {
            return Err(AicError::CapacityExceeded {
                what: "kernel groups",
                capacity: self.entries.capacity(),
            });
        }

        let table = group.sizes.clone();
        debug!(
            group_id,
            kernels = group.kernels.len(),
            fragments = group.fragment_count,
            terminals = table.len(),
            bytes = table.total_bytes(),
            "Kernel group configured"
        );

        let entry = GroupEntry::new(group, self.entries.get(&group_id));
        self.entries
            .try_insert(group_id, entry)
            .map_err(|_| AicError::CapacityExceeded {
                what: "kernel groups",
                capacity: self.entries.capacity(),
            })?;
        Ok(table)
    }

    /// Replace the fragment geometry of some kernels of a configured group.
    ///
    /// Every update is validated before any is applied. When the key
    /// resolution changed, the whole group is validated again and its
    /// terminal sizes are recomputed; bindings that no longer cover their
    /// terminal are dropped as in [`configure`](Self::configure). Otherwise
    /// only the geometry is swapped and bindings are untouched.
    pub fn update_resolutions(
        &mut self,
        group_id: i32,
        updates: &[KernelResolution],
        key_changed: bool,
    ) -> AicResult<TerminalSizeTable> {
        let entry = self.entry(group_id)?;
        let kernels = entry.group.with_resolutions(updates).map_err(|e| {
            warn!(group_id, error = %e, "Rejected resolution update");
            e
        })?;

        if key_changed {
            let config = GroupConfig {
                kernels,
                ..entry.group.config()
            };
            let group = KernelGroup::build(&config)?;
            let table = group.sizes.clone();
            let rebuilt = GroupEntry::new(group, Some(entry));
            if let Some(slot) = self.entries.get_mut(&group_id) {
                *slot = rebuilt;
            }
            debug!(
                group_id,
                kernels = updates.len(),
                bytes = table.total_bytes(),
                "Key resolution changed"
            );
            return Ok(table);
        }

        let entry = self.entry_mut(group_id)?;
        entry.group.kernels = kernels;
        trace!(group_id, kernels = updates.len(), "Kernel resolutions updated");
        Ok(entry.group.sizes.clone())
    }

    fn entry(&self, group_id: i32) -> AicResult<&GroupEntry> {
        self.entries
            .get(&group_id)
            .ok_or_else(|| AicError::invalid(format!("group {group_id} is not configured")))
    }

    fn entry_mut(&mut self, group_id: i32) -> AicResult<&mut GroupEntry> {
        self.entries
            .get_mut(&group_id)
            .ok_or_else(|| AicError::invalid(format!("group {group_id} is not configured")))
    }

    /// The committed group.
    pub fn group(&self, group_id: i32) -> AicResult<&KernelGroup> {
        self.entry(group_id).map(|e| &e.group)
    }

    /// Terminal size table of a group.
    pub fn terminal_sizes(&self, group_id: i32) -> AicResult<TerminalSizeTable> {
        self.entry(group_id).map(|e| e.group.sizes.clone())
    }

    /// Minimum buffer size of (terminal, fragment).
    pub fn buffer_size(
        &self,
        group_id: i32,
        terminal_index: u32,
        fragment_index: u32,
    ) -> AicResult<usize> {
        let entry = self.entry(group_id)?;
        let pos = Self::position(entry, terminal_index, fragment_index)?;
        Ok(entry.group.sizes.entries[pos].size)
    }

    fn position(entry: &GroupEntry, terminal_index: u32, fragment_index: u32) -> AicResult<usize> {
        let group_id = entry.group.group_id;
        if terminal_index >= MAX_TERMINALS {
            return Err(AicError::invalid(format!(
                "terminal {terminal_index} out of range (limit {MAX_TERMINALS})"
            )));
        }
        if fragment_index >= entry.group.fragment_count {
            return Err(AicError::invalid(format!(
                "fragment {fragment_index} out of range for group {group_id} ({} fragments)",
                entry.group.fragment_count
            )));
        }
        entry
            .group
            .sizes
            .position(terminal_index, fragment_index)
            .ok_or_else(|| {
                AicError::invalid(format!(
                    "group {group_id} does not use terminal {terminal_index} fragment {fragment_index}"
                ))
            })
    }

    /// Bind caller memory to (terminal, fragment).
    ///
    /// `size` is the usable part of `memory`; it must cover the computed
    /// minimum. A rejected buffer leaves the previous binding in place.
    pub fn register_buffer(
        &mut self,
        group_id: i32,
        terminal_index: u32,
        fragment_index: u32,
        memory: TerminalMemory,
        size: usize,
    ) -> AicResult<()> {
        let entry = self.entry_mut(group_id)?;
        let pos = Self::position(entry, terminal_index, fragment_index)?;

        if size > memory.len() {
            return Err(AicError::invalid(format!(
                "declared size {size} exceeds the {} byte allocation",
                memory.len()
            )));
        }

        let required = entry.group.sizes.entries[pos].size;
        if size < required {
            warn!(
                group_id,
                terminal_index, fragment_index, size, required, "Terminal buffer too small"
            );
            return Err(AicError::BufferTooSmall {
                group_id,
                terminal_index,
                fragment_index,
                size,
                required,
            });
        }

        entry.bindings[pos] = Some(TerminalBinding::new(memory, size));
        debug!(group_id, terminal_index, fragment_index, size, "Terminal buffer registered");
        Ok(())
    }

    /// Current binding of (terminal, fragment).
    pub fn get_buffer(
        &self,
        group_id: i32,
        terminal_index: u32,
        fragment_index: u32,
    ) -> AicResult<TerminalBinding> {
        let entry = self.entry(group_id)?;
        let pos = Self::position(entry, terminal_index, fragment_index)?;
        entry.bindings[pos].clone().ok_or_else(|| {
            AicError::NotFound(format!(
                "no buffer registered for group {group_id} terminal {terminal_index} fragment {fragment_index}"
            ))
        })
    }

    /// Encode every kernel's parameters for one fragment into the bound
    /// parameter terminals.
    ///
    /// All parameter terminals of the fragment must be bound; nothing is
    /// written otherwise. Kernels run in declared order.
    pub fn run_kernels(
        &mut self,
        group_id: i32,
        frame_id: u64,
        fragment_index: u32,
        results: &ResultBundle,
        encoder: &dyn KernelEncoder,
    ) -> AicResult<PalOutput> {
        let GroupEntry {
            group,
            bindings,
            written,
        } = self.entry_mut(group_id)?;

        if fragment_index >= group.fragment_count {
            return Err(AicError::invalid(format!(
                "fragment {fragment_index} out of range for group {group_id} ({} fragments)",
                group.fragment_count
            )));
        }

        let sinks = group
            .fragment_sinks
            .get(fragment_index as usize)
            .map_or(&[][..], Vec::as_slice);

        if let Some(&pos) = sinks.iter().find(|&&pos| bindings[pos].is_none()) {
            let missing = group.sizes.entries[pos];
            return Err(AicError::NotFound(format!(
                "no buffer registered for group {group_id} terminal {} fragment {fragment_index}",
                missing.terminal_index
            )));
        }

        let mut kernels_run = 0;
        let mut last_kernel = None;
        for &pos in sinks {
            written[pos] = 0;
        }

        for placement in group
            .placements
            .iter()
            .filter(|p| p.fragment == fragment_index && p.terminal_type.is_parameter_sink())
        {
            let Some(binding) = &bindings[placement.entry] else {
                continue;
            };

            let kernel = &group.kernels[placement.kernel];
            let ctx = KernelContext {
                group_id,
                frame_id,
                fragment_index,
                kernel,
                terminal_type: placement.terminal_type,
                terminal_index: placement.terminal_index,
                section_index: placement.section_index,
            };

            let start = placement.section.offset as usize;
            let end = start + placement.section.size as usize;
            {
                let mut memory = binding.memory.lock();
                let out = memory.get_mut(start..end).ok_or_else(|| {
                    AicError::invalid(format!(
                        "section {start}..{end} of kernel {} outside terminal {}",
                        kernel.uuid, placement.terminal_index
                    ))
                })?;
                encoder.encode(&ctx, results, out)?;
            }

            written[placement.entry] += placement.section.size as usize;
            if last_kernel != Some(placement.kernel) {
                kernels_run += 1;
                last_kernel = Some(placement.kernel);
            }
        }

        let mut writes = TerminalWrites::new();
        for &pos in sinks {
            let entry = group.sizes.entries[pos];
            if let Some(binding) = bindings[pos].as_mut() {
                let generation = binding.mark_written(frame_id);
                writes
                    .push(TerminalWrite {
                        terminal_index: entry.terminal_index,
                        terminal_type: entry.terminal_type,
                        generation,
                        bytes: written[pos],
                        memory: binding.memory.clone(),
                    })
                    .map_err(|_| AicError::CapacityExceeded {
                        what: "terminal writes",
                        capacity: MAX_TERMINAL_WRITES,
                    })?;
            }
        }

        trace!(
            group_id,
            frame_id,
            fragment_index,
            kernels_run,
            terminals = writes.len(),
            "Kernels run"
        );

        Ok(PalOutput {
            group_id,
            frame_id,
            fragment_index,
            kernels_run,
            writes,
        })
    }

    /// Drop every group and binding.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
