//! Terminal buffers and their bindings.
//!
//! Terminal memory is allocated by the caller and shared with the group
//! table through a [`TerminalMemory`] handle. Registering a buffer clones
//! the handle; the bytes themselves are never copied.

use crate::kernel::types::TerminalType;
use crate::limits::MAX_TERMINAL_WRITES;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Caller-allocated terminal buffer.
#[derive(Clone)]
pub struct TerminalMemory {
    bytes: Arc<Mutex<Box<[u8]>>>,
    len: usize,
}

impl TerminalMemory {
    /// Allocate `len` zeroed bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Take ownership of an existing allocation.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            bytes: Arc::new(Mutex::new(bytes.into_boxed_slice())),
            len,
        }
    }

    /// Allocation size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-byte allocation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lock the bytes for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.bytes.lock()
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().to_vec()
    }

    /// True when both handles refer to the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl fmt::Debug for TerminalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalMemory")
            .field("len", &self.len)
            .field("ptr", &Arc::as_ptr(&self.bytes))
            .finish()
    }
}

/// A buffer bound to one (terminal, fragment) of a group.
#[derive(Debug, Clone)]
pub struct TerminalBinding {
    pub memory: TerminalMemory,
    /// Usable size declared at registration.
    pub size: usize,
    /// 0 after registration, +1 per `run_kernels` that wrote the terminal.
    pub generation: u64,
    /// Frame of the last run that wrote the terminal.
    pub last_frame: Option<u64>,
}

impl TerminalBinding {
    pub(crate) fn new(memory: TerminalMemory, size: usize) -> Self {
        Self {
            memory,
            size,
            generation: 0,
            last_frame: None,
        }
    }

    pub(crate) fn mark_written(&mut self, frame_id: u64) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.last_frame = Some(frame_id);
        self.generation
    }
}

/// Minimum buffer size of one (terminal, fragment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalSize {
    pub terminal_index: u32,
    pub fragment_index: u32,
    pub terminal_type: TerminalType,
    pub size: usize,
}

/// Terminal sizes computed by `configure`, ordered by terminal then fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TerminalSizeTable {
    pub group_id: i32,
    pub entries: Vec<TerminalSize>,
}

impl TerminalSizeTable {
    /// Position of (terminal, fragment) in `entries`.
    pub(crate) fn position(&self, terminal_index: u32, fragment_index: u32) -> Option<usize> {
        self.entries
            .binary_search_by_key(&(terminal_index, fragment_index), |e| {
                (e.terminal_index, e.fragment_index)
            })
            .ok()
    }

    /// Minimum size of (terminal, fragment), if the group uses it.
    #[must_use]
    pub fn size_of(&self, terminal_index: u32, fragment_index: u32) -> Option<usize> {
        self.position(terminal_index, fragment_index)
            .map(|i| self.entries[i].size)
    }

    /// Number of (terminal, fragment) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the group uses no terminal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all minimum sizes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// One terminal written by a `run_kernels` call.
#[derive(Debug, Clone)]
pub struct TerminalWrite {
    pub terminal_index: u32,
    pub terminal_type: TerminalType,
    /// Generation of the binding after the write.
    pub generation: u64,
    /// Bytes covered by kernel sections.
    pub bytes: usize,
    pub memory: TerminalMemory,
}

/// Terminals written by one run, stored inline.
pub type TerminalWrites = heapless::Vec<TerminalWrite, MAX_TERMINAL_WRITES>;

/// Kernel parameter output of one group, frame and fragment.
#[derive(Debug, Clone)]
pub struct PalOutput {
    pub group_id: i32,
    pub frame_id: u64,
    pub fragment_index: u32,
    pub kernels_run: usize,
    pub writes: TerminalWrites,
}

impl PalOutput {
    /// Bytes written over all terminals.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.writes.iter().map(|w| w.bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_is_shared_not_copied() {
        let memory = TerminalMemory::zeroed(4);
        let binding = TerminalBinding::new(memory.clone(), 4);

        binding.memory.lock()[1] = 0xAB;
        assert_eq!(memory.to_vec(), vec![0, 0xAB, 0, 0]);
        assert!(binding.memory.ptr_eq(&memory));
        assert!(!memory.ptr_eq(&TerminalMemory::zeroed(4)));
    }

    #[test]
    fn test_generation_counts_writes() {
        let mut binding = TerminalBinding::new(TerminalMemory::zeroed(1), 1);
        assert_eq!(binding.generation, 0);
        assert_eq!(binding.mark_written(7), 1);
        assert_eq!(binding.mark_written(8), 2);
        assert_eq!(binding.last_frame, Some(8));
    }

    #[test]
    fn test_size_table_lookup() {
        let table = TerminalSizeTable {
            group_id: 0,
            entries: vec![
                TerminalSize {
                    terminal_index: 0,
                    fragment_index: 0,
                    terminal_type: TerminalType::ParamIn,
                    size: 128,
                },
                TerminalSize {
                    terminal_index: 0,
                    fragment_index: 1,
                    terminal_type: TerminalType::ParamIn,
                    size: 64,
                },
                TerminalSize {
                    terminal_index: 3,
                    fragment_index: 0,
                    terminal_type: TerminalType::ParamOut,
                    size: 32,
                },
            ],
        };
        assert_eq!(table.size_of(0, 1), Some(64));
        assert_eq!(table.size_of(3, 0), Some(32));
        assert_eq!(table.size_of(2, 0), None);
        assert_eq!(table.total_bytes(), 224);
    }
}
