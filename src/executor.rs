//! Executor
//!
//! Runs one query against the upstream API when its arm fires, records the
//! outcome, and re-arms the scheduler.
//!
//! ## Delivery guarantees
//!
//! Arms may be delivered more than once, late, or after the query changed.
//! Every firing is checked against the stored record first:
//!
//! - missing or not `active`: nothing happens
//! - `run_generation` differs from the arm's: the arm is stale or a duplicate
//!   of a run that already committed, nothing happens
//!
//! The upstream request is made without holding any lock. The outcome is then
//! committed with a compare-and-set on the version read before the request; a
//! conflicting writer causes a reload, and the result is discarded if the
//! query was deleted, changed status, or already has a newer run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::SchedulingConfig;
use crate::query::{ApiQuery, CachedResponse, QueryId, QueryStatus, RunError};
use crate::scheduler::{Arm, Scheduler};
use crate::store::QueryStore;
use crate::upstream::{Upstream, UpstreamError};
use crate::usage::UsageTracker;

/// Why a firing did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    NotActive { status: QueryStatus },
    StaleGeneration { armed: u64, current: u64 },
}

/// Result of one firing or manual run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Skipped(SkipReason),
    /// Paused without contacting the upstream
    Abandoned,
    Refreshed { next: Option<Arm> },
    Failed { consecutive_errors: u32, next: Option<Arm> },
    /// The failure that reached the error limit
    PausedErrors { consecutive_errors: u32 },
    /// Lost the commit to a delete or a concurrent writer
    Discarded,
}

/// Executor counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExecutorStats {
    pub runs: u64,
    pub refreshed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Scheduled,
    Manual,
}

pub struct Executor {
    store: Arc<QueryStore>,
    usage: Arc<UsageTracker>,
    scheduler: Arc<Scheduler>,
    upstream: Arc<dyn Upstream>,
    error_limit: u32,
    log_errors: bool,
    runs: AtomicU64,
    refreshed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    discarded: AtomicU64,
}

impl Executor {
    pub fn new(
        store: Arc<QueryStore>,
        usage: Arc<UsageTracker>,
        scheduler: Arc<Scheduler>,
        upstream: Arc<dyn Upstream>,
        config: &SchedulingConfig,
    ) -> Self {
        Executor {
            store,
            usage,
            scheduler,
            upstream,
            error_limit: config.query_error_limit.max(1),
            log_errors: config.log_errors,
            runs: AtomicU64::new(0),
            refreshed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            runs: self.runs.load(Ordering::Relaxed),
            refreshed: self.refreshed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Handle one scheduled firing
    pub async fn execute(&self, arm: &Arm) -> RunOutcome {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let outcome = self.execute_inner(arm).await;
        self.count(&outcome);
        outcome
    }

    async fn execute_inner(&self, arm: &Arm) -> RunOutcome {
        let Some(query) = self.store.get(&arm.query_id) else {
            return RunOutcome::Skipped(SkipReason::NotFound);
        };
        if !query.is_active() {
            return RunOutcome::Skipped(SkipReason::NotActive {
                status: query.status,
            });
        }
        if query.run_generation != arm.generation {
            tracing::debug!(
                query_id = %query.id,
                armed = arm.generation,
                current = query.run_generation,
                "stale_arm_ignored"
            );
            return RunOutcome::Skipped(SkipReason::StaleGeneration {
                armed: arm.generation,
                current: query.run_generation,
            });
        }

        if self
            .usage
            .is_abandoned(&query.id, query.refresh_interval, Utc::now())
        {
            return self.pause_abandoned(query);
        }

        let _running = self.scheduler.begin_run(&query.id);
        let fetched = self.upstream.fetch(&query.request).await;
        self.commit(query, fetched, RunKind::Scheduled)
    }

    /// Run a query immediately, outside its schedule.
    ///
    /// Skips the abandonment check. An active query is re-armed as after a
    /// scheduled run. A paused query keeps its status: success refreshes its
    /// cache and clears the error count, failure only records the error.
    /// Disabled queries are not run.
    pub async fn run_now(&self, id: &QueryId) -> RunOutcome {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let outcome = match self.store.get(id) {
            None => RunOutcome::Skipped(SkipReason::NotFound),
            Some(query) if query.status == QueryStatus::Disabled => {
                RunOutcome::Skipped(SkipReason::NotActive {
                    status: query.status,
                })
            }
            Some(query) => {
                tracing::info!(query_id = %query.id, status = %query.status, "manual_run");
                let fetched = self.upstream.fetch(&query.request).await;
                self.commit(query, fetched, RunKind::Manual)
            }
        };
        self.count(&outcome);
        outcome
    }

    fn count(&self, outcome: &RunOutcome) {
        let counter = match outcome {
            RunOutcome::Skipped(_) => &self.skipped,
            RunOutcome::Refreshed { .. } => &self.refreshed,
            RunOutcome::Failed { .. } | RunOutcome::PausedErrors { .. } => &self.failed,
            RunOutcome::Discarded => &self.discarded,
            RunOutcome::Abandoned => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn pause_abandoned(&self, mut seen: Arc<ApiQuery>) -> RunOutcome {
        let generation = seen.run_generation;
        loop {
            let result = self.store.update(&seen.id, seen.version, |q| {
                q.status = QueryStatus::PausedAbandoned;
                q.run_generation += 1;
            });
            match result {
                Ok(committed) => {
                    self.scheduler.disarm(&committed.id);
                    tracing::info!(
                        query_id = %committed.id,
                        refresh_interval = committed.refresh_interval,
                        "query_paused_abandoned"
                    );
                    return RunOutcome::Abandoned;
                }
                Err(e) if e.is_conflict() => match self.store.get(&seen.id) {
                    Some(current) if current.is_active() && current.run_generation == generation => {
                        seen = current;
                    }
                    _ => return RunOutcome::Discarded,
                },
                Err(_) => return RunOutcome::Discarded,
            }
        }
    }

    fn commit(
        &self,
        mut seen: Arc<ApiQuery>,
        fetched: Result<serde_json::Value, UpstreamError>,
        kind: RunKind,
    ) -> RunOutcome {
        let finished = Utc::now();
        let generation = seen.run_generation;
        let status = seen.status;
        let fetched = fetched.map(|content| {
            Arc::new(CachedResponse {
                content,
                fetched_at: finished,
            })
        });

        if let Err(e) = &fetched {
            if self.log_errors {
                tracing::warn!(query_id = %seen.id, error = %e, "upstream_request_failed");
            }
        }

        loop {
            let counts_errors = kind == RunKind::Scheduled || seen.is_active();
            let result = self.store.update(&seen.id, seen.version, |q| {
                self.apply(q, &fetched, finished, counts_errors);
            });
            match result {
                Ok(committed) => return self.after_commit(&committed, fetched.is_ok(), finished),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(query_id = %seen.id, "run_discarded_query_deleted");
                    return RunOutcome::Discarded;
                }
                Err(e) if e.is_conflict() => match self.store.get(&seen.id) {
                    Some(current)
                        if current.run_generation == generation && current.status == status =>
                    {
                        seen = current;
                    }
                    _ => {
                        tracing::debug!(query_id = %seen.id, "run_discarded_superseded");
                        return RunOutcome::Discarded;
                    }
                },
                Err(e) => {
                    tracing::error!(query_id = %seen.id, error = %e, "run_commit_failed");
                    return RunOutcome::Discarded;
                }
            }
        }
    }

    fn apply(
        &self,
        query: &mut ApiQuery,
        fetched: &Result<Arc<CachedResponse>, UpstreamError>,
        finished: DateTime<Utc>,
        counts_errors: bool,
    ) {
        query.run_generation += 1;
        match fetched {
            Ok(response) => {
                query.cached_response = Some(Arc::clone(response));
                query.last_run_at = Some(finished);
                query.last_success_at = Some(finished);
                query.consecutive_error_count = 0;
                query.last_error = None;
            }
            Err(e) => {
                query.last_error = Some(RunError {
                    message: e.to_string(),
                    at: finished,
                });
                if counts_errors {
                    query.last_run_at = Some(finished);
                    query.consecutive_error_count =
                        (query.consecutive_error_count + 1).min(self.error_limit);
                    if query.consecutive_error_count >= self.error_limit {
                        query.status = QueryStatus::PausedErrors;
                    }
                }
            }
        }
    }

    fn after_commit(&self, committed: &ApiQuery, succeeded: bool, now: DateTime<Utc>) -> RunOutcome {
        if !committed.is_active() {
            self.scheduler.disarm(&committed.id);
            if committed.status == QueryStatus::PausedErrors && !succeeded {
                tracing::warn!(
                    query_id = %committed.id,
                    consecutive_errors = committed.consecutive_error_count,
                    "query_paused_errors"
                );
                return RunOutcome::PausedErrors {
                    consecutive_errors: committed.consecutive_error_count,
                };
            }
            return if succeeded {
                RunOutcome::Refreshed { next: None }
            } else {
                RunOutcome::Failed {
                    consecutive_errors: committed.consecutive_error_count,
                    next: None,
                }
            };
        }

        let next = self.scheduler.arm_next(committed, now);
        // A delete or pause that landed after the commit may have disarmed before we armed
        match self.store.get(&committed.id) {
            Some(current) if current.is_active() => {}
            _ => {
                self.scheduler.disarm(&committed.id);
            }
        }

        if succeeded {
            tracing::debug!(query_id = %committed.id, next_due = %next.due_at, "query_refreshed");
            RunOutcome::Refreshed { next: Some(next) }
        } else {
            RunOutcome::Failed {
                consecutive_errors: committed.consecutive_error_count,
                next: Some(next),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryLimits;
    use crate::query::{validate, QueryDraft};
    use crate::scheduler::{ManualPort, SchedulerPort};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Upstream that replays scripted results; an empty script succeeds
    #[derive(Default)]
    struct ScriptedUpstream {
        script: Mutex<VecDeque<Result<serde_json::Value, UpstreamError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedUpstream {
        fn push_ok(&self, body: serde_json::Value) {
            self.script.lock().push_back(Ok(body));
        }
        fn push_err(&self) {
            self.script.lock().push_back(Err(UpstreamError::Status {
                status: 503,
                body: "unavailable".into(),
            }));
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn fetch(&self, _request: &str) -> Result<serde_json::Value, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(serde_json::json!({"rows": []})))
        }
    }

    struct Harness {
        store: Arc<QueryStore>,
        usage: Arc<UsageTracker>,
        port: Arc<ManualPort>,
        scheduler: Arc<Scheduler>,
        upstream: Arc<ScriptedUpstream>,
        executor: Executor,
    }

    fn harness() -> Harness {
        let config = SchedulingConfig::default();
        let store = Arc::new(QueryStore::new());
        let usage = Arc::new(UsageTracker::new(&config));
        let port = Arc::new(ManualPort::new());
        let scheduler = Arc::new(Scheduler::new(port.clone(), &config));
        let upstream = Arc::new(ScriptedUpstream::default());
        let executor = Executor::new(
            store.clone(),
            usage.clone(),
            scheduler.clone(),
            upstream.clone(),
            &config,
        );
        Harness {
            store,
            usage,
            port,
            scheduler,
            upstream,
            executor,
        }
    }

    impl Harness {
        fn add_query(&self) -> Arc<ApiQuery> {
            let draft = QueryDraft::new("q", "https://example.com/data", 60);
            let query = ApiQuery::new(validate(&draft, &QueryLimits::default()).unwrap(), Utc::now());
            let stored = self.store.create(query).unwrap();
            self.usage.register(&stored.id, Utc::now());
            self.scheduler.arm_initial(&stored, Utc::now());
            stored
        }

        fn fire(&self, id: &QueryId) -> Arm {
            self.port.take(id).expect("query should be armed")
        }
    }

    #[tokio::test]
    async fn test_success_caches_and_rearms() {
        let h = harness();
        let query = h.add_query();
        h.upstream.push_ok(serde_json::json!({"rows": [["7"]]}));

        let arm = h.fire(&query.id);
        let outcome = h.executor.execute(&arm).await;
        assert!(matches!(outcome, RunOutcome::Refreshed { next: Some(_) }));

        let stored = h.store.get(&query.id).unwrap();
        assert_eq!(stored.run_generation, 1);
        assert!(stored.last_success_at.is_some());
        assert_eq!(
            stored.cached_response.as_ref().unwrap().content,
            serde_json::json!({"rows": [["7"]]})
        );
        let next = h.port.pending(&query.id).unwrap();
        assert_eq!(next.generation, 1);
        assert!(next.due_at >= stored.last_run_at.unwrap() + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_error_limit_pauses_without_rearm() {
        let h = harness();
        let query = h.add_query();
        for _ in 0..3 {
            h.upstream.push_err();
        }

        let first = h.executor.execute(&h.fire(&query.id)).await;
        assert!(matches!(first, RunOutcome::Failed { consecutive_errors: 1, next: Some(_) }));
        let second = h.executor.execute(&h.fire(&query.id)).await;
        assert!(matches!(second, RunOutcome::Failed { consecutive_errors: 2, .. }));
        let third = h.executor.execute(&h.fire(&query.id)).await;
        assert_eq!(third, RunOutcome::PausedErrors { consecutive_errors: 3 });

        let stored = h.store.get(&query.id).unwrap();
        assert_eq!(stored.status, QueryStatus::PausedErrors);
        assert!(stored.last_error.is_some());
        assert!(h.port.pending(&query.id).is_none());
    }

    #[tokio::test]
    async fn test_success_resets_error_count() {
        let h = harness();
        let query = h.add_query();
        h.upstream.push_err();
        h.upstream.push_err();
        h.upstream.push_ok(serde_json::json!({}));
        h.upstream.push_err();

        for _ in 0..4 {
            let arm = h.fire(&query.id);
            h.executor.execute(&arm).await;
        }
        let stored = h.store.get(&query.id).unwrap();
        assert_eq!(stored.status, QueryStatus::Active);
        assert_eq!(stored.consecutive_error_count, 1);
        assert!(stored.cached_response.is_some());
    }

    #[tokio::test]
    async fn test_abandoned_query_paused_without_upstream_call() {
        let h = harness();
        let query = h.add_query();
        h.usage.remove(&query.id);

        let outcome = h.executor.execute(&h.fire(&query.id)).await;
        assert_eq!(outcome, RunOutcome::Abandoned);
        assert_eq!(h.upstream.calls(), 0);
        assert_eq!(h.store.get(&query.id).unwrap().status, QueryStatus::PausedAbandoned);
        assert!(h.port.pending(&query.id).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_fire_runs_once() {
        let h = harness();
        let query = h.add_query();
        let arm = h.fire(&query.id);

        assert!(matches!(h.executor.execute(&arm).await, RunOutcome::Refreshed { .. }));
        assert_eq!(
            h.executor.execute(&arm).await,
            RunOutcome::Skipped(SkipReason::StaleGeneration { armed: 0, current: 1 })
        );
        assert_eq!(h.upstream.calls(), 1);
        assert_eq!(h.port.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_fire_after_delete_is_noop() {
        let h = harness();
        let query = h.add_query();
        let arm = h.fire(&query.id);
        h.store.delete(&query.id).unwrap();

        assert_eq!(
            h.executor.execute(&arm).await,
            RunOutcome::Skipped(SkipReason::NotFound)
        );
        assert_eq!(h.upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_run_now_on_paused_query_keeps_status() {
        let h = harness();
        let query = h.add_query();
        h.store
            .update(&query.id, 1, |q| {
                q.status = QueryStatus::PausedErrors;
                q.consecutive_error_count = 3;
            })
            .unwrap();
        h.scheduler.disarm(&query.id);

        let outcome = h.executor.run_now(&query.id).await;
        assert_eq!(outcome, RunOutcome::Refreshed { next: None });
        let stored = h.store.get(&query.id).unwrap();
        assert_eq!(stored.status, QueryStatus::PausedErrors);
        assert_eq!(stored.consecutive_error_count, 0);
        assert!(stored.cached_response.is_some());
        assert!(h.port.pending(&query.id).is_none());
    }

    #[tokio::test]
    async fn test_run_now_skips_disabled() {
        let h = harness();
        let query = h.add_query();
        h.store
            .update(&query.id, 1, |q| q.status = QueryStatus::Disabled)
            .unwrap();
        assert_eq!(
            h.executor.run_now(&query.id).await,
            RunOutcome::Skipped(SkipReason::NotActive {
                status: QueryStatus::Disabled
            })
        );
        assert_eq!(h.upstream.calls(), 0);
        assert_eq!(h.executor.stats().skipped, 1);
    }
}
