//! Registry of AIC contexts addressed by small integer ids.
//!
//! An [`AicDirectory`] is an explicit, caller-owned object: it is created
//! empty, populated once by [`AicDirectory::init`] (one context per stream
//! id) and emptied by [`AicDirectory::deinit`]. Contexts are never created
//! anywhere else.
//!
//! Each context sits behind its own mutex, so different ids run
//! concurrently while calls on one id are serialized.
//!
//! # Default id
//!
//! Every lookup accepts [`DEFAULT_CONTEXT_ID`] (`-1`): it resolves to the
//! only context when exactly one exists and is [`AicError::Ambiguous`]
//! otherwise.

use crate::bounded::BoundedMap;
use crate::collaborators::Collaborators;
use crate::config::AicConfig;
use crate::context::{AicContext, ContextSizing};
use crate::error::{AicError, AicResult};
use crate::limits::MAX_CONTEXTS;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Id that selects the single existing context.
pub const DEFAULT_CONTEXT_ID: i32 = -1;

/// Shared handle to one context.
pub type ContextHandle = Arc<Mutex<AicContext>>;

/// Parameters of `init` and `reinit`.
#[derive(Debug, Clone, Default)]
pub struct InitParams {
    /// Opaque tuning blob, interpreted by the tuning collaborator.
    pub tuning: Bytes,
    /// Camera calibration (NVM) blob.
    pub calibration: Option<Bytes>,
    pub sizing: ContextSizing,
    /// Maker-note data attached to every context.
    pub maker_note: Option<Bytes>,
    /// One context per id; empty means a single context with id 0.
    pub stream_ids: Vec<i32>,
}

impl InitParams {
    /// Parameters with the sizing of `config`.
    #[must_use]
    pub fn from_config(config: &AicConfig) -> Self {
        Self {
            sizing: config.sizing.context_sizing(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tuning(mut self, tuning: impl Into<Bytes>) -> Self {
        self.tuning = tuning.into();
        self
    }

    #[must_use]
    pub fn with_calibration(mut self, calibration: impl Into<Bytes>) -> Self {
        self.calibration = Some(calibration.into());
        self
    }

    #[must_use]
    pub fn with_maker_note(mut self, maker_note: impl Into<Bytes>) -> Self {
        self.maker_note = Some(maker_note.into());
        self
    }

    #[must_use]
    pub fn with_stream_ids(mut self, stream_ids: impl Into<Vec<i32>>) -> Self {
        self.stream_ids = stream_ids.into();
        self
    }

    #[must_use]
    pub fn with_sizing(mut self, sizing: ContextSizing) -> Self {
        self.sizing = sizing;
        self
    }
}

#[derive(Debug)]
struct Initialized {
    contexts: BoundedMap<i32, ContextHandle>,
    collaborators: Collaborators,
}

/// Bounded `id -> AicContext` registry.
#[derive(Debug)]
pub struct AicDirectory {
    state: Mutex<Option<Initialized>>,
    capacity: usize,
}

impl Default for AicDirectory {
    fn default() -> Self {
        Self::new(MAX_CONTEXTS)
    }
}

impl AicDirectory {
    /// Uninitialized directory for at most `capacity` contexts.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "directory capacity must be greater than 0");
        Self {
            state: Mutex::new(None),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Create one context per stream id.
    ///
    /// Fails without creating anything when already initialized, on
    /// duplicate ids, when more than `capacity` ids are given, or when the
    /// tuning collaborator rejects the blobs.
    pub fn init(&self, params: &InitParams, collaborators: Collaborators) -> AicResult<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(AicError::invalid("AIC directory is already initialized"));
        }

        let stream_ids = if params.stream_ids.is_empty() {
            vec![0]
        } else {
            params.stream_ids.clone()
        };

        let mut seen = HashSet::with_capacity(stream_ids.len());
        if let Some(dup) = stream_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(AicError::invalid(format!("stream id {dup} given twice")));
        }
        if stream_ids.contains(&DEFAULT_CONTEXT_ID) {
            return Err(AicError::invalid(format!(
                "stream id {DEFAULT_CONTEXT_ID} is reserved"
            )));
        }
        if stream_ids.len() > self.capacity {
            return Err(AicError::CapacityExceeded {
                what: "contexts",
                capacity: self.capacity,
            });
        }

        let defaults = collaborators
            .tuning
            .load(&params.tuning, params.calibration.as_deref())?;

        let mut contexts = BoundedMap::with_capacity(self.capacity);
        for &id in &stream_ids {
            let mut context =
                AicContext::new(id, params.sizing, &defaults, collaborators.clone())?;
            context.set_maker_note(params.maker_note.clone());
            if contexts.try_insert(id, Arc::new(Mutex::new(context))).is_err() {
                return Err(AicError::CapacityExceeded {
                    what: "contexts",
                    capacity: self.capacity,
                });
            }
        }

        info!(contexts = stream_ids.len(), ?stream_ids, "AIC directory initialized");
        *state = Some(Initialized {
            contexts,
            collaborators,
        });
        Ok(())
    }

    /// Resolve `id` to a context handle.
    ///
    /// `-1` selects the single context; any other id must match exactly.
    pub fn get_handle(&self, id: i32) -> AicResult<ContextHandle> {
        let state = self.state.lock();
        let initialized = state.as_ref().ok_or(AicError::NotInitialized)?;
        Self::resolve(initialized, id)
    }

    fn resolve(initialized: &Initialized, id: i32) -> AicResult<ContextHandle> {
        let contexts = &initialized.contexts;
        if id == DEFAULT_CONTEXT_ID {
            return match contexts.len() {
                1 => contexts
                    .iter()
                    .next()
                    .map(|(_, handle)| Arc::clone(handle))
                    .ok_or(AicError::NotInitialized),
                count => Err(AicError::Ambiguous { count }),
            };
        }
        contexts
            .get(&id)
            .cloned()
            .ok_or_else(|| AicError::NotFound(format!("no AIC context with id {id}")))
    }

    /// Run `f` on the context `id` while holding its lock.
    pub fn with_context<R>(
        &self,
        id: i32,
        f: impl FnOnce(&mut AicContext) -> AicResult<R>,
    ) -> AicResult<R> {
        let handle = self.get_handle(id)?;
        let mut context = handle.lock();
        f(&mut context)
    }

    /// Re-create the bounded structures of context `id` from `params`.
    ///
    /// `params.stream_ids` is ignored; the context keeps its id.
    pub fn reinit(&self, params: &InitParams, id: i32) -> AicResult<()> {
        let (handle, collaborators) = self.handle_and_collaborators(id)?;
        let defaults = collaborators
            .tuning
            .load(&params.tuning, params.calibration.as_deref())?;

        let mut context = handle.lock();
        context.reinit(params.sizing, &defaults)?;
        context.set_maker_note(params.maker_note.clone());
        Ok(())
    }

    /// Load new tuning into context `id`; only its cold-start results change.
    pub fn update_tuning(&self, tuning: &[u8], calibration: Option<&[u8]>, id: i32) -> AicResult<()> {
        let (handle, collaborators) = self.handle_and_collaborators(id)?;
        let defaults = collaborators.tuning.load(tuning, calibration)?;
        handle.lock().update_tuning(&defaults);
        Ok(())
    }

    fn handle_and_collaborators(&self, id: i32) -> AicResult<(ContextHandle, Collaborators)> {
        let state = self.state.lock();
        let initialized = state.as_ref().ok_or(AicError::NotInitialized)?;
        let handle = Self::resolve(initialized, id)?;
        Ok((handle, initialized.collaborators.clone()))
    }

    /// Ids of all contexts, ascending.
    pub fn ids(&self) -> AicResult<Vec<i32>> {
        let state = self.state.lock();
        let initialized = state.as_ref().ok_or(AicError::NotInitialized)?;
        let mut ids: Vec<i32> = initialized.contexts.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Number of contexts (0 when not initialized).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map_or(0, |initialized| initialized.contexts.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every context. Outstanding handles stay usable until dropped
    /// but are no longer reachable through the directory.
    pub fn deinit(&self) {
        if let Some(initialized) = self.state.lock().take() {
            info!(contexts = initialized.contexts.len(), "AIC directory deinitialized");
        } else {
            debug!("Deinit of an uninitialized AIC directory");
        }
    }
}
