//! In-process timer queue.
//!
//! Each arm is a tokio task that sleeps until its due time and then hands the
//! arm to the dispatcher channel. The map entry is the source of truth: a task
//! only fires if its token is still the one registered for the query, so a
//! replaced or cancelled arm can never be delivered even if its task already
//! woke up.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Arm, SchedulerPort};
use crate::query::QueryId;

struct Scheduled {
    arm: Arm,
    token: u64,
    task: JoinHandle<()>,
}

pub struct TimerQueue {
    entries: Arc<DashMap<QueryId, Scheduled>>,
    next_token: AtomicU64,
    fired: mpsc::UnboundedSender<Arm>,
    runtime: Handle,
}

impl TimerQueue {
    /// Create a queue whose timers run on `runtime`. Fired arms arrive on the
    /// returned receiver.
    pub fn new(runtime: Handle) -> (Arc<Self>, mpsc::UnboundedReceiver<Arm>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let queue = TimerQueue {
            entries: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
            fired,
            runtime,
        };
        (Arc::new(queue), rx)
    }

    fn spawn_timer(&self, arm: Arm, token: u64) -> JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        let fired = self.fired.clone();
        let delay = (arm.due_at - Utc::now()).to_std().unwrap_or_default();

        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let current = entries.remove_if(&arm.query_id, |_, scheduled| scheduled.token == token);
            if current.is_none() {
                return;
            }
            if fired.send(arm).is_err() {
                tracing::debug!(query_id = %arm.query_id, "timer_fired_after_shutdown");
            }
        })
    }
}

impl SchedulerPort for TimerQueue {
    fn schedule(&self, arm: Arm) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        // Spawn while holding the entry so the timer cannot look before it is registered
        match self.entries.entry(arm.query_id) {
            Entry::Occupied(mut slot) => {
                let task = self.spawn_timer(arm, token);
                let previous = slot.insert(Scheduled { arm, token, task });
                previous.task.abort();
            }
            Entry::Vacant(slot) => {
                let task = self.spawn_timer(arm, token);
                slot.insert(Scheduled { arm, token, task });
            }
        }
    }

    fn cancel(&self, query_id: &QueryId) -> bool {
        match self.entries.remove(query_id) {
            Some((_, scheduled)) => {
                scheduled.task.abort();
                true
            }
            None => false,
        }
    }

    fn pending(&self, query_id: &QueryId) -> Option<Arm> {
        self.entries.get(query_id).map(|s| s.arm)
    }

    fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tokio::time::timeout;

    fn arm(query_id: QueryId, generation: u64, in_ms: i64) -> Arm {
        Arm {
            query_id,
            generation,
            due_at: Utc::now() + ChronoDuration::milliseconds(in_ms),
        }
    }

    #[tokio::test]
    async fn test_due_arm_is_delivered_once() {
        let (queue, mut rx) = TimerQueue::new(Handle::current());
        let id = QueryId::new();
        queue.schedule(arm(id, 0, 10));
        assert_eq!(queue.pending_count(), 1);

        let fired = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.query_id, id);
        assert_eq!(queue.pending_count(), 0);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_arm_never_fires() {
        let (queue, mut rx) = TimerQueue::new(Handle::current());
        let id = QueryId::new();
        queue.schedule(arm(id, 0, 50));
        assert!(queue.cancel(&id));
        assert!(!queue.cancel(&id));
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_rearm_replaces_previous_timer() {
        let (queue, mut rx) = TimerQueue::new(Handle::current());
        let id = QueryId::new();
        queue.schedule(arm(id, 1, 60_000));
        queue.schedule(arm(id, 2, 0));
        assert_eq!(queue.pending_count(), 1);

        let fired = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.generation, 2);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_past_due_arm_fires_immediately() {
        let (queue, mut rx) = TimerQueue::new(Handle::current());
        let id = QueryId::new();
        queue.schedule(arm(id, 0, -5_000));
        let fired = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.query_id, id);
    }
}
