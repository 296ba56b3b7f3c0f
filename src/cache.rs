use std::sync::Mutex;

use tracing::debug;

use crate::config::GEOJSON_FILE_NAME;

/// Serialized collection offered for download, tagged with the run that
/// produced it.
#[derive(Debug, Clone)]
pub struct CachedDownload {
    pub generation: u64,
    pub file_name: &'static str,
    pub body: String,
}

/// Single-slot cache holding the most recent run's serialized collection.
///
/// Replace-on-write, guarded by a run-generation counter: a run takes a
/// generation with [`begin_run`](ResultCache::begin_run) before fetching, and
/// a store from any generation but the newest is rejected, so a slow older
/// run can never clobber a newer result.
#[derive(Debug, Default)]
pub struct ResultCache {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    generation: u64,
    entry: Option<CachedDownload>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the next run generation.
    pub fn begin_run(&self) -> u64 {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.generation
    }

    /// Publishes a run's serialized collection. Returns `false` without
    /// writing when `generation` is not the newest claimed one.
    pub fn store(&self, generation: u64, body: String) -> bool {
        let mut inner = self.lock();
        if generation != inner.generation {
            debug!(
                generation,
                current = inner.generation,
                "rejecting stale cache write"
            );
            return false;
        }
        inner.entry = Some(CachedDownload {
            generation,
            file_name: GEOJSON_FILE_NAME,
            body,
        });
        true
    }

    /// The most recent completed run's artifact, if any run has produced one.
    pub fn latest(&self) -> Option<CachedDownload> {
        self.lock().entry.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The slot holds a plain replaceable value; recover from poisoning.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        let cache = ResultCache::new();
        assert!(cache.latest().is_none());
    }

    #[test]
    fn stores_and_returns_latest() {
        let cache = ResultCache::new();
        let generation = cache.begin_run();
        assert!(cache.store(generation, "{}".to_string()));
        let entry = cache.latest().unwrap();
        assert_eq!(entry.generation, generation);
        assert_eq!(entry.file_name, "osm_features.geojson");
    }

    #[test]
    fn stale_writes_are_rejected() {
        let cache = ResultCache::new();
        let old_run = cache.begin_run();
        let new_run = cache.begin_run();
        assert!(!cache.store(old_run, "old".to_string()));
        assert!(cache.latest().is_none());
        assert!(cache.store(new_run, "new".to_string()));
        assert_eq!(cache.latest().unwrap().body, "new");
    }
}
