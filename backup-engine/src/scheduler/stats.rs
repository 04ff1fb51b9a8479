//! Per-description execution counters for deferred jobs.

use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

/// Distinct job descriptions tracked before the least recently used is evicted.
pub const STATS_CACHE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub description: Option<String>,
    pub queued: u64,
    pub finished: u64,
    pub duration: Duration,
    pub errors: u64,
}

/// Bounded, recency-ordered counter map keyed by job description.
///
/// Uses its own mutex so bookkeeping never contends with the job queue.
pub struct StatsTracker {
    entries: Mutex<LruCache<Option<String>, JobStats>>,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new(STATS_CACHE_SIZE)
    }
}

impl StatsTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut LruCache<Option<String>, JobStats>) -> R) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut entries)
    }

    pub fn record_queued(&self, description: Option<&str>) {
        let key = description.map(str::to_string);
        self.with_entries(|entries| {
            let stats = entries.get_or_insert_mut(key.clone(), || JobStats {
                description: key,
                ..JobStats::default()
            });
            stats.queued += 1;
        });
    }

    /// Entries evicted since queueing are not resurrected.
    pub fn record_finished(&self, description: Option<&str>, elapsed: Duration) {
        let key = description.map(str::to_string);
        self.with_entries(|entries| {
            if let Some(stats) = entries.get_mut(&key) {
                stats.finished += 1;
                stats.duration += elapsed;
            }
        });
    }

    pub fn record_error(&self, description: Option<&str>) {
        let key = description.map(str::to_string);
        self.with_entries(|entries| {
            if let Some(stats) = entries.get_mut(&key) {
                stats.errors += 1;
            }
        });
    }

    pub fn get(&self, description: Option<&str>) -> Option<JobStats> {
        let key = description.map(str::to_string);
        self.with_entries(|entries| entries.peek(&key).cloned())
    }

    /// Snapshot, most recently used first.
    pub fn snapshot(&self) -> Vec<JobStats> {
        self.with_entries(|entries| entries.iter().map(|(_, stats)| stats.clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
