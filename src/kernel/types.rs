//! Kernel group descriptions as supplied by the pipeline graph.
//!
//! These records are plain data and deserialize from graph files; all
//! validation happens in [`KernelGroups::configure`](super::KernelGroups::configure).

use crate::stats::StatsTerminalMap;
use serde::{Deserialize, Serialize};

/// How a kernel takes part in the group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelEnable {
    /// Data flows through unmodified.
    Passthrough,
    #[default]
    Enable,
    Disable,
}

impl KernelEnable {
    /// Wire value used in kernel headers.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Passthrough => 0,
            Self::Enable => 1,
            Self::Disable => 2,
        }
    }
}

/// Geometry of one fragment (stripe) as seen by a kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDesc {
    pub input_width: u16,
    pub output_width: u16,
    /// Offset from the left edge of the full image.
    pub start_x: u16,
}

/// One hardware kernel of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub uuid: u32,
    #[serde(default)]
    pub enable: KernelEnable,
    #[serde(default = "default_bpp")]
    pub bpp_in: u8,
    #[serde(default = "default_bpp")]
    pub bpp_out: u8,
    /// Per-fragment geometry; empty, or one entry per fragment.
    #[serde(default)]
    pub fragments: Vec<FragmentDesc>,
}

fn default_bpp() -> u8 {
    12
}

impl KernelDescriptor {
    /// Enabled kernel with default bit depths and no fragment geometry.
    #[must_use]
    pub fn new(uuid: u32) -> Self {
        Self {
            uuid,
            enable: KernelEnable::Enable,
            bpp_in: default_bpp(),
            bpp_out: default_bpp(),
            fragments: Vec::new(),
        }
    }
}

/// Hardware buffer taxonomy of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalType {
    ParamIn,
    ParamOut,
    Program,
    SpatialIn,
    SpatialOut,
    FrameIn,
    FrameOut,
    System,
    SrFrameIn,
    SrFragIn,
}

impl TerminalType {
    /// Terminals filled with kernel parameters by `run_kernels`.
    #[must_use]
    pub const fn is_parameter_sink(self) -> bool {
        matches!(
            self,
            Self::ParamIn | Self::Program | Self::SpatialIn | Self::SrFrameIn | Self::SrFragIn
        )
    }

    /// Terminals written by hardware with statistics.
    #[must_use]
    pub const fn is_statistics_source(self) -> bool {
        matches!(self, Self::ParamOut | Self::SpatialOut)
    }
}

/// A byte range inside a terminal buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub offset: u32,
    pub size: u32,
}

impl Section {
    #[must_use]
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// Exclusive end, `None` on overflow.
    #[must_use]
    pub fn end(&self) -> Option<u32> {
        self.offset.checked_add(self.size)
    }
}

/// Where one kernel's parameters live inside one terminal of one fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelOffset {
    pub uuid: u32,
    pub terminal_type: TerminalType,
    pub terminal_index: u32,
    #[serde(default)]
    pub fragment: u32,
    pub sections: Vec<Section>,
}

/// Full description of one kernel group, the input of `configure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_id: i32,
    #[serde(default = "default_fragment_count")]
    pub fragment_count: u32,
    #[serde(default)]
    pub operation_mode: u32,
    #[serde(default)]
    pub stream_id: i32,
    pub kernels: Vec<KernelDescriptor>,
    pub offsets: Vec<KernelOffset>,
    #[serde(default)]
    pub stats_terminals: Option<StatsTerminalMap>,
}

fn default_fragment_count() -> u32 {
    1
}

impl GroupConfig {
    #[must_use]
    pub fn new(group_id: i32, fragment_count: u32) -> Self {
        Self {
            group_id,
            fragment_count,
            operation_mode: 0,
            stream_id: 0,
            kernels: Vec::new(),
            offsets: Vec::new(),
            stats_terminals: None,
        }
    }

    #[must_use]
    pub fn kernel(mut self, kernel: KernelDescriptor) -> Self {
        self.kernels.push(kernel);
        self
    }

    /// Add an offset record.
    #[must_use]
    pub fn offset(
        mut self,
        uuid: u32,
        terminal_type: TerminalType,
        terminal_index: u32,
        fragment: u32,
        sections: Vec<Section>,
    ) -> Self {
        self.offsets.push(KernelOffset {
            uuid,
            terminal_type,
            terminal_index,
            fragment,
            sections,
        });
        self
    }

    #[must_use]
    pub fn stats_terminals(mut self, map: StatsTerminalMap) -> Self {
        self.stats_terminals = Some(map);
        self
    }
}

/// New fragment geometry for one kernel of a configured group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelResolution {
    pub uuid: u32,
    /// Empty, or one entry per fragment of the group.
    #[serde(default)]
    pub fragments: Vec<FragmentDesc>,
}

impl KernelResolution {
    #[must_use]
    pub fn new(uuid: u32, fragments: Vec<FragmentDesc>) -> Self {
        Self { uuid, fragments }
    }
}

/// What an encoder needs to know about the section it is filling.
#[derive(Debug, Clone, Copy)]
pub struct KernelContext<'a> {
    pub group_id: i32,
    pub frame_id: u64,
    pub fragment_index: u32,
    pub kernel: &'a KernelDescriptor,
    pub terminal_type: TerminalType,
    pub terminal_index: u32,
    /// Position of the section in the kernel's offset record.
    pub section_index: u32,
}

/// A set of kernel groups, as stored in graph files:
///
/// ```toml
/// [[groups]]
/// group_id = 0
/// fragment_count = 1
/// kernels = [{ uuid = 11 }, { uuid = 12 }]
/// offsets = [
///     { uuid = 11, terminal_type = "param_in", terminal_index = 0, sections = [{ offset = 0, size = 64 }] },
///     { uuid = 12, terminal_type = "param_in", terminal_index = 0, sections = [{ offset = 64, size = 64 }] },
/// ]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineGraph {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl PipelineGraph {
    /// Parse a TOML graph.
    pub fn from_toml_str(text: &str) -> crate::error::AicResult<Self> {
        toml::from_str(text)
            .map_err(|e| crate::error::AicError::invalid(format!("invalid pipeline graph: {e}")))
    }
}
