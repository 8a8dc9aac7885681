//! Scheduler
//!
//! Decides when each active query runs next and registers that decision with
//! a [`SchedulerPort`], the delayed-execution primitive.
//!
//! ## Timing
//!
//! - On creation or reactivation: `now + jitter`
//! - After a run: `last_run_at + refresh_interval + jitter`, never earlier than `now + jitter`
//!
//! Jitter is drawn uniformly from `[0, max_random_countdown]` seconds for every
//! decision so queries sharing an interval do not hit the upstream API at the
//! same instant.
//!
//! ## Delivery
//!
//! A port holds at most one arm per query; arming again replaces the previous
//! arm. Ports may deliver an arm more than once or late, so the executor
//! checks the query's status and `run_generation` before acting.
//!
//! A port drops an arm when it fires, so a query whose run is in flight has
//! no arm until the executor re-arms it. The executor marks such queries with
//! [`Scheduler::begin_run`] and the sweep leaves them alone.

mod manual;
mod timer;

pub use manual::ManualPort;
pub use timer::TimerQueue;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;

use crate::config::SchedulingConfig;
use crate::query::{ApiQuery, QueryId};
use crate::store::QueryStore;

/// A registration to run one query no earlier than `due_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Arm {
    pub query_id: QueryId,
    /// The query's `run_generation` when this arm was made
    pub generation: u64,
    pub due_at: DateTime<Utc>,
}

/// Durable "invoke no earlier than T" primitive
pub trait SchedulerPort: Send + Sync {
    /// Register `arm`, replacing any outstanding arm for the same query
    fn schedule(&self, arm: Arm);

    /// Drop the outstanding arm for a query; returns whether one existed
    fn cancel(&self, query_id: &QueryId) -> bool;

    /// The outstanding arm for a query, if any
    fn pending(&self, query_id: &QueryId) -> Option<Arm>;

    /// Number of outstanding arms
    fn pending_count(&self) -> usize;
}

/// What a sweep changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Active queries that were missing an arm (or had a stale one)
    pub armed: usize,
    /// Arms dropped because their query is no longer active
    pub cancelled: usize,
}

/// Marks a query's run as in flight until dropped
pub struct RunGuard<'a> {
    in_flight: &'a DashMap<QueryId, usize>,
    query_id: QueryId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut runs) = self.in_flight.get_mut(&self.query_id) {
            *runs = runs.saturating_sub(1);
        }
        self.in_flight.remove_if(&self.query_id, |_, runs| *runs == 0);
    }
}

/// Computes run times and arms the port
pub struct Scheduler {
    port: Arc<dyn SchedulerPort>,
    max_random_countdown: u64,
    /// Runs in flight per query
    in_flight: DashMap<QueryId, usize>,
}

impl Scheduler {
    pub fn new(port: Arc<dyn SchedulerPort>, config: &SchedulingConfig) -> Self {
        Scheduler {
            port,
            max_random_countdown: config.max_random_countdown,
            in_flight: DashMap::new(),
        }
    }

    pub fn port(&self) -> &Arc<dyn SchedulerPort> {
        &self.port
    }

    /// Random countdown in `[0, max_random_countdown]` seconds, millisecond resolution
    pub fn jitter(&self) -> ChronoDuration {
        let max_ms = self.max_random_countdown.saturating_mul(1000);
        let ms = rand::thread_rng().gen_range(0..=max_ms);
        ChronoDuration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }

    fn arm_at(&self, query: &ApiQuery, base: DateTime<Utc>) -> Arm {
        let due_at = base.checked_add_signed(self.jitter()).unwrap_or(base);
        let arm = Arm {
            query_id: query.id,
            generation: query.run_generation,
            due_at,
        };
        self.port.schedule(arm);
        tracing::debug!(
            query_id = %query.id,
            generation = arm.generation,
            due_at = %arm.due_at,
            "query_armed"
        );
        arm
    }

    /// Arm a new or reactivated query: jitter only, no base interval
    pub fn arm_initial(&self, query: &ApiQuery, now: DateTime<Utc>) -> Arm {
        self.arm_at(query, now)
    }

    /// Arm the next scheduled run after `query.last_run_at`
    pub fn arm_next(&self, query: &ApiQuery, now: DateTime<Utc>) -> Arm {
        self.arm_at(query, query.next_due(now))
    }

    /// Cancel a query's outstanding arm
    pub fn disarm(&self, query_id: &QueryId) -> bool {
        let cancelled = self.port.cancel(query_id);
        if cancelled {
            tracing::debug!(query_id = %query_id, "query_disarmed");
        }
        cancelled
    }

    pub fn pending(&self, query_id: &QueryId) -> Option<Arm> {
        self.port.pending(query_id)
    }

    /// Mark a fired query as running; the sweep skips it while the guard lives
    pub fn begin_run(&self, query_id: &QueryId) -> RunGuard<'_> {
        *self.in_flight.entry(*query_id).or_insert(0) += 1;
        RunGuard {
            in_flight: &self.in_flight,
            query_id: *query_id,
        }
    }

    pub fn is_running(&self, query_id: &QueryId) -> bool {
        self.in_flight.contains_key(query_id)
    }

    /// Make the port agree with the store: every active query armed for its
    /// current generation, no arms for anything else. Queries with a run in
    /// flight are re-armed by that run.
    pub fn sweep(&self, store: &QueryStore, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for query in store.list() {
            let pending = self.port.pending(&query.id);
            if query.is_active() {
                if self.is_running(&query.id) {
                    continue;
                }
                let up_to_date = pending.is_some_and(|arm| arm.generation == query.run_generation);
                if !up_to_date {
                    self.arm_next(&query, now);
                    report.armed += 1;
                }
            } else if pending.is_some() && self.port.cancel(&query.id) {
                report.cancelled += 1;
            }
        }
        if report.armed > 0 || report.cancelled > 0 {
            tracing::info!(armed = report.armed, cancelled = report.cancelled, "scheduler_sweep");
        }
        report
    }
}
