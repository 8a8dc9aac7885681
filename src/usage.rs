//! Usage Tracker
//!
//! Sharded read counters per query, used by the scheduler to detect queries
//! nobody reads any more.
//!
//! ## Design
//!
//! Each query owns a fixed array of shards. A read picks one shard at random
//! and bumps it with relaxed atomics, so concurrent readers mostly touch
//! different cache lines and never take a lock. Totals are the sum of shards
//! and the last access is the maximum shard timestamp; both operations are
//! commutative, which is why no coordination between shards is needed.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::SchedulingConfig;
use crate::query::QueryId;

/// Sentinel for "never accessed"
const NEVER: i64 = i64::MIN;

#[derive(Debug)]
struct Shard {
    reads: AtomicU64,
    /// Milliseconds since the Unix epoch
    last_access_ms: AtomicI64,
}

impl Shard {
    fn new() -> Self {
        Shard {
            reads: AtomicU64::new(0),
            last_access_ms: AtomicI64::new(NEVER),
        }
    }
}

/// Read counter for one query
#[derive(Debug)]
pub struct UsageCounter {
    shards: Box<[Shard]>,
}

impl UsageCounter {
    pub fn new(shard_count: usize) -> Self {
        UsageCounter {
            shards: (0..shard_count.max(1)).map(|_| Shard::new()).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Count one read on `shard` (wrapped into range)
    pub fn record(&self, shard: usize, at: DateTime<Utc>) {
        let shard = &self.shards[shard % self.shards.len()];
        shard.reads.fetch_add(1, Ordering::Relaxed);
        shard
            .last_access_ms
            .fetch_max(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Move the last-access time forward without counting a read
    pub fn touch(&self, at: DateTime<Utc>) {
        self.shards[0]
            .last_access_ms
            .fetch_max(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Sum of all shard counts
    pub fn total(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.reads.load(Ordering::Relaxed))
            .sum()
    }

    /// Most recent access across shards
    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        let latest = self
            .shards
            .iter()
            .map(|s| s.last_access_ms.load(Ordering::Relaxed))
            .max()
            .unwrap_or(NEVER);
        if latest == NEVER {
            return None;
        }
        Utc.timestamp_millis_opt(latest).single()
    }
}

/// Per-query usage counters
pub struct UsageTracker {
    counters: DashMap<QueryId, Arc<UsageCounter>>,
    shard_count: usize,
    abandoned_interval_multiple: u64,
}

impl UsageTracker {
    pub fn new(config: &SchedulingConfig) -> Self {
        UsageTracker {
            counters: DashMap::new(),
            shard_count: config.usage_shards.max(1),
            abandoned_interval_multiple: config.abandoned_interval_multiple,
        }
    }

    fn counter(&self, query_id: &QueryId) -> Arc<UsageCounter> {
        if let Some(counter) = self.counters.get(query_id) {
            return Arc::clone(&counter);
        }
        Arc::clone(
            &self
                .counters
                .entry(*query_id)
                .or_insert_with(|| Arc::new(UsageCounter::new(self.shard_count))),
        )
    }

    /// Record a read now. Never fails the caller.
    pub fn record_access(&self, query_id: &QueryId) {
        self.record_access_at(query_id, Utc::now());
    }

    /// Record a read at `at` on a randomly chosen shard.
    ///
    /// Only queries that were registered are counted, so a read racing a
    /// delete cannot bring the deleted query's counters back.
    pub fn record_access_at(&self, query_id: &QueryId, at: DateTime<Utc>) {
        let Some(counter) = self.counters.get(query_id) else {
            tracing::trace!(query_id = %query_id, "usage_untracked");
            return;
        };
        let shard = rand::thread_rng().gen_range(0..self.shard_count);
        counter.record(shard, at);
        tracing::trace!(query_id = %query_id, shard, "usage_recorded");
    }

    /// Start the abandonment window at `at` for a new or reactivated query
    pub fn register(&self, query_id: &QueryId, at: DateTime<Utc>) {
        self.counter(query_id).touch(at);
    }

    /// True when nothing touched the query within
    /// `refresh_interval * abandoned_interval_multiple` seconds before `now`
    pub fn is_abandoned(&self, query_id: &QueryId, refresh_interval: u64, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_access(query_id) else {
            return true;
        };
        let window_secs = refresh_interval.saturating_mul(self.abandoned_interval_multiple);
        let window = ChronoDuration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX));
        match now.checked_sub_signed(window) {
            Some(cutoff) => last < cutoff,
            None => false,
        }
    }

    pub fn total_reads(&self, query_id: &QueryId) -> u64 {
        self.counters.get(query_id).map_or(0, |c| c.total())
    }

    pub fn last_access(&self, query_id: &QueryId) -> Option<DateTime<Utc>> {
        self.counters.get(query_id).and_then(|c| c.last_access())
    }

    /// Drop a query's counters; returns whether any existed
    pub fn remove(&self, query_id: &QueryId) -> bool {
        self.counters.remove(query_id).is_some()
    }

    pub fn tracked_queries(&self) -> usize {
        self.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn tracker() -> UsageTracker {
        UsageTracker::new(&SchedulingConfig::default())
    }

    #[test]
    fn test_counter_sums_shards() {
        let counter = UsageCounter::new(4);
        let now = Utc::now();
        for shard in 0..10 {
            counter.record(shard, now);
        }
        assert_eq!(counter.total(), 10);
        assert_eq!(counter.shard_count(), 4);
    }

    #[test]
    fn test_last_access_is_latest_shard() {
        let counter = UsageCounter::new(3);
        let now = Utc::now();
        counter.record(0, now - ChronoDuration::seconds(30));
        counter.record(1, now);
        counter.record(2, now - ChronoDuration::seconds(10));
        assert_eq!(
            counter.last_access().unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[test]
    fn test_last_access_never_moves_backwards() {
        let counter = UsageCounter::new(1);
        let now = Utc::now();
        counter.record(0, now);
        counter.record(0, now - ChronoDuration::hours(1));
        assert_eq!(
            counter.last_access().unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[test]
    fn test_unknown_query_is_abandoned() {
        assert!(tracker().is_abandoned(&QueryId::new(), 60, Utc::now()));
    }

    #[test]
    fn test_read_within_window_is_not_abandoned() {
        let usage = tracker();
        let id = QueryId::new();
        let now = Utc::now();
        // window = 60 * 2 = 120s
        usage.register(&id, now - ChronoDuration::seconds(119));
        usage.record_access_at(&id, now - ChronoDuration::seconds(119));
        assert!(!usage.is_abandoned(&id, 60, now));
    }

    #[test]
    fn test_read_outside_window_is_abandoned() {
        let usage = tracker();
        let id = QueryId::new();
        let now = Utc::now();
        usage.register(&id, now - ChronoDuration::seconds(121));
        usage.record_access_at(&id, now - ChronoDuration::seconds(121));
        assert!(usage.is_abandoned(&id, 60, now));
    }

    #[test]
    fn test_register_starts_window_without_counting() {
        let usage = tracker();
        let id = QueryId::new();
        let now = Utc::now();
        usage.register(&id, now);
        assert_eq!(usage.total_reads(&id), 0);
        assert!(!usage.is_abandoned(&id, 60, now + ChronoDuration::seconds(100)));
        assert!(usage.is_abandoned(&id, 60, now + ChronoDuration::seconds(121)));
    }

    #[test]
    fn test_remove_clears_counters() {
        let usage = tracker();
        let id = QueryId::new();
        usage.register(&id, Utc::now());
        usage.record_access(&id);
        assert_eq!(usage.total_reads(&id), 1);
        assert!(usage.remove(&id));
        assert_eq!(usage.total_reads(&id), 0);
        assert!(!usage.remove(&id));
    }

    #[test]
    fn test_read_of_unregistered_query_is_not_tracked() {
        let usage = tracker();
        let id = QueryId::new();
        usage.record_access(&id);
        assert_eq!(usage.tracked_queries(), 0);
        assert_eq!(usage.total_reads(&id), 0);
        assert!(usage.last_access(&id).is_none());
    }

    #[test]
    fn test_read_after_remove_does_not_recreate_counter() {
        let usage = tracker();
        let id = QueryId::new();
        usage.register(&id, Utc::now());
        usage.record_access(&id);
        assert!(usage.remove(&id));

        usage.record_access(&id);
        assert_eq!(usage.tracked_queries(), 0);
        assert!(usage.is_abandoned(&id, 60, Utc::now()));
    }

    #[test]
    fn test_concurrent_reads_are_all_counted() {
        let usage = Arc::new(tracker());
        let id = QueryId::new();
        usage.register(&id, Utc::now());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let usage = Arc::clone(&usage);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        usage.record_access(&id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(usage.total_reads(&id), 8000);
        assert_eq!(usage.tracked_queries(), 1);
    }
}
