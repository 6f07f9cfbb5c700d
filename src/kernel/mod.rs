//! Kernel groups (control blocks), terminal tables and kernel runs.

pub mod group;
pub mod terminal;
pub mod types;

pub use group::{KernelGroup, KernelGroups};
pub use terminal::{
    PalOutput, TerminalBinding, TerminalMemory, TerminalSize, TerminalSizeTable, TerminalWrite,
    TerminalWrites,
};
pub use types::{
    FragmentDesc, GroupConfig, KernelContext, KernelDescriptor, KernelEnable, KernelOffset,
    KernelResolution, PipelineGraph, Section, TerminalType,
};
