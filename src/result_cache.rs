//! Frame-indexed result cache with cold-start fallback.
//!
//! Holds the result bundles of the last `N` frames. Saving a new frame into
//! a full cache evicts the frame saved longest ago (FIFO by insertion, not
//! by access). A query for a frame that is not cached returns the cold-start
//! bundle; a miss is never an error.
//!
//! One `parking_lot::Mutex` guards the entries, their order and the
//! cold-start bundle. [`ResultCache::save`] copies into the records of the
//! entry it replaces or evicts, so once the cache is full and the same
//! modules keep arriving, saving a frame does not allocate.

use crate::bounded::BoundedMap;
use crate::results::{ResultBundle, ResultModules};
use parking_lot::Mutex;
use tracing::{debug, trace};

#[derive(Debug)]
struct CacheInner {
    entries: BoundedMap<u64, ResultBundle>,
    cold_start: ResultBundle,
}

/// Bounded `frame id -> ResultBundle` store.
#[derive(Debug)]
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl ResultCache {
    /// Create an empty cache holding at most `capacity` frames.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize, cold_start: ResultBundle) -> Self {
        debug!(capacity, modules = ?cold_start.modules(), "Creating result cache");
        Self {
            inner: Mutex::new(CacheInner {
                entries: BoundedMap::with_capacity(capacity),
                cold_start,
            }),
            capacity,
        }
    }

    /// Maximum number of cached frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when no frame is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Store a copy of `bundle` for `frame_id`, overwriting any previous
    /// results for that frame.
    ///
    /// The cache owns the copy; later changes by the caller are not seen.
    /// The copy reuses the records of the overwritten or evicted entry
    /// unless a query result still holds them.
    pub fn save(&self, frame_id: u64, bundle: &ResultBundle) {
        let modules = bundle.modules();
        let evicted = {
            let mut inner = self.inner.lock();
            let (mut slot, evicted) = match inner.entries.remove(&frame_id) {
                Some(previous) => (previous, None),
                None if inner.entries.is_full() => match inner.entries.pop_oldest() {
                    Some((oldest_id, oldest)) => (oldest, Some(oldest_id)),
                    None => (ResultBundle::default(), None),
                },
                None => (ResultBundle::default(), None),
            };
            slot.copy_from(bundle);
            inner.entries.insert_evicting(frame_id, slot);
            evicted
        };
        self.log_saved(frame_id, modules, evicted);
    }

    /// Store `bundle` for `frame_id` without copying the records.
    ///
    /// The cache shares the caller's `Arc`s, so the caller can hand off
    /// results it just produced at no cost. Same eviction policy as
    /// [`save`](Self::save).
    pub fn assign(&self, frame_id: u64, bundle: ResultBundle) {
        let modules = bundle.modules();
        let evicted = {
            let mut inner = self.inner.lock();
            inner.entries.insert_evicting(frame_id, bundle)
        };
        self.log_saved(frame_id, modules, evicted.map(|(evicted_id, _)| evicted_id));
    }

    fn log_saved(&self, frame_id: u64, modules: ResultModules, evicted: Option<u64>) {
        if let Some(evicted_id) = evicted {
            debug!(
                frame_id,
                evicted_frame_id = evicted_id,
                capacity = self.capacity,
                "Evicting results for oldest frame"
            );
        }
        trace!(frame_id, ?modules, "Results saved");
    }

    /// Results for `frame_id`, or the cold-start bundle when not cached.
    #[must_use]
    pub fn query(&self, frame_id: u64) -> ResultBundle {
        let inner = self.inner.lock();
        match inner.entries.get(&frame_id) {
            Some(bundle) => bundle.clone(),
            None => {
                trace!(frame_id, "Result cache miss, using cold start");
                inner.cold_start.clone()
            }
        }
    }

    /// Results for `frame_id` with every missing module taken from the
    /// cold-start bundle.
    #[must_use]
    pub fn query_complete(&self, frame_id: u64) -> ResultBundle {
        let inner = self.inner.lock();
        match inner.entries.get(&frame_id) {
            Some(bundle) => bundle.filled_from(&inner.cold_start),
            None => inner.cold_start.clone(),
        }
    }

    /// Results for `frame_id` only if cached.
    #[must_use]
    pub fn get(&self, frame_id: u64) -> Option<ResultBundle> {
        self.inner.lock().entries.get(&frame_id).cloned()
    }

    /// True when results for `frame_id` are cached.
    #[must_use]
    pub fn contains(&self, frame_id: u64) -> bool {
        self.inner.lock().entries.contains_key(&frame_id)
    }

    /// Cached frame ids, oldest first.
    #[must_use]
    pub fn frame_ids(&self) -> Vec<u64> {
        self.inner.lock().entries.keys().copied().collect()
    }

    /// Current cold-start bundle.
    #[must_use]
    pub fn cold_start(&self) -> ResultBundle {
        self.inner.lock().cold_start.clone()
    }

    /// Replace the cold-start bundle, e.g. after a tuning update.
    /// Cached frames are kept.
    pub fn reset_cold_start(&self, cold_start: ResultBundle) {
        self.inner.lock().cold_start = cold_start;
        debug!("Cold-start results replaced");
    }

    /// Drop every cached frame. The cold-start bundle is kept.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
        debug!(capacity = self.capacity, "Result cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{ExposureResult, FocusResult};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn bundle(exposure_time_us: u32) -> ResultBundle {
        ResultBundle::new().with_exposure(ExposureResult {
            exposure_time_us,
            ..ExposureResult::default()
        })
    }

    #[test]
    fn test_query_miss_returns_cold_start() {
        let cache = ResultCache::new(2, ResultBundle::defaults());
        assert_eq!(cache.query(42), ResultBundle::defaults());
        assert!(cache.get(42).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fifo_eviction() {
        let cache = ResultCache::new(2, ResultBundle::defaults());
        let (a, b, c) = (bundle(1), bundle(2), bundle(3));
        cache.save(10, &a);
        cache.save(11, &b);
        cache.save(12, &c);

        assert_eq!(cache.query(10), ResultBundle::defaults());
        assert_eq!(cache.query(11), b);
        assert_eq!(cache.query(12), c);
        assert_eq!(cache.frame_ids(), vec![11, 12]);
    }

    #[test]
    fn test_save_overwrites() {
        let cache = ResultCache::new(3, ResultBundle::defaults());
        cache.save(1, &bundle(100));
        cache.save(1, &bundle(200));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.query(1), bundle(200));
    }

    #[test]
    fn test_save_copies_assign_shares() {
        let cache = ResultCache::new(2, ResultBundle::defaults());
        let produced = bundle(5);

        cache.save(1, &produced);
        cache.assign(2, produced.clone());

        let saved = cache.query(1).exposure.unwrap();
        let assigned = cache.query(2).exposure.unwrap();
        let original = produced.exposure.unwrap();
        assert!(!Arc::ptr_eq(&saved, &original));
        assert!(Arc::ptr_eq(&assigned, &original));
    }

    #[test]
    fn test_query_complete_fills_missing_modules() {
        let cache = ResultCache::new(2, ResultBundle::defaults());
        cache.save(3, &ResultBundle::new().with_focus(FocusResult::default()));

        assert!(!cache.query(3).is_complete());
        assert!(cache.query_complete(3).is_complete());
        assert!(cache.query_complete(99).is_complete());
    }

    #[test]
    fn test_reset_cold_start_keeps_entries() {
        let cache = ResultCache::new(2, ResultBundle::defaults());
        cache.save(1, &bundle(1));
        cache.reset_cold_start(bundle(77));

        assert_eq!(cache.query(2), bundle(77));
        assert!(cache.contains(1));

        cache.clear();
        assert!(!cache.contains(1));
        assert_eq!(cache.cold_start(), bundle(77));
    }

    #[test]
    fn test_save_recycles_evicted_records() {
        let cache = ResultCache::new(1, ResultBundle::defaults());
        cache.save(1, &ResultBundle::defaults());
        let first = Arc::as_ptr(cache.get(1).unwrap().shading.as_ref().unwrap());

        cache.save(2, &bundle(9).with_shading(Default::default()));
        let second = cache.get(2).unwrap();
        assert_eq!(Arc::as_ptr(second.shading.as_ref().unwrap()), first);
        assert_eq!(second.exposure.as_ref().unwrap().exposure_time_us, 9);
        assert_eq!(second.modules().bits().count_ones(), 2);
    }

    #[test]
    fn test_save_does_not_touch_results_held_by_caller() {
        let cache = ResultCache::new(1, ResultBundle::defaults());
        cache.save(1, &bundle(1));
        let held = cache.query(1);

        cache.save(2, &bundle(2));
        assert_eq!(held.exposure.unwrap().exposure_time_us, 1);
        assert_eq!(cache.query(2).exposure.unwrap().exposure_time_us, 2);
    }

    #[test]
    #[traced_test]
    fn test_eviction_is_logged() {
        let cache = ResultCache::new(1, ResultBundle::defaults());
        cache.save(1, &bundle(1));
        cache.save(2, &bundle(2));
        assert!(logs_contain("Evicting results for oldest frame"));
    }
}
