//! Core library for ISP parameter generation (AIC).
//!
//! This library sits between the hardware statistics stage, the per-frame
//! image-quality algorithms and the hardware kernels. It keeps the
//! bookkeeping between them bounded and deterministic:
//!
//! - [`ResultCache`]: the last `N` frames of algorithm results, with a
//!   cold-start fallback for any other frame
//! - [`StatsBufferPool`]: `L` reusable statistics slots (see [`aic_pool`])
//! - [`KernelGroups`]: kernel groups with their terminal size tables and
//!   registered terminal buffers
//! - [`AicContext`]: one pipeline, owning the three above
//! - [`AicDirectory`]: contexts addressed by stream id
//!
//! Statistics decoding, kernel encoding and tuning parsing are supplied by
//! the [`collaborators`].

pub mod bounded;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod kernel;
pub mod limits;
pub mod logging;
pub mod result_cache;
pub mod results;
pub mod stats;
pub mod tuning;

pub use aic_pool::{SlotHandle, SlotInfo, SlotState, StatsBufferPool, StatsPayload, StatsQuery};
pub use collaborators::{Collaborators, KernelEncoder, StatisticsDecoder, TuningSource};
pub use config::AicConfig;
pub use context::{AicContext, ContextSizing};
pub use directory::{AicDirectory, ContextHandle, InitParams, DEFAULT_CONTEXT_ID};
pub use error::{AicError, AicResult};
pub use kernel::{GroupConfig, KernelGroups, PalOutput, TerminalMemory, TerminalSizeTable};
pub use result_cache::ResultCache;
pub use results::{ResultBundle, ResultModules};
pub use stats::DecodedStatistics;
pub use tuning::TuningDefaults;
