//! Externally driven scheduler port.
//!
//! Arms are held in memory until something (a cron job, a test, an admin
//! call) asks for the ones that are due. Useful when the delayed-execution
//! primitive lives outside the process.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{Arm, SchedulerPort};
use crate::query::QueryId;

#[derive(Default)]
pub struct ManualPort {
    arms: DashMap<QueryId, Arm>,
}

impl ManualPort {
    pub fn new() -> Self {
        ManualPort {
            arms: DashMap::new(),
        }
    }

    /// Remove and return every arm due at or before `now`, earliest first
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Arm> {
        let due_ids: Vec<QueryId> = self
            .arms
            .iter()
            .filter(|e| e.due_at <= now)
            .map(|e| *e.key())
            .collect();
        let mut due: Vec<Arm> = due_ids
            .into_iter()
            .filter_map(|id| self.arms.remove_if(&id, |_, arm| arm.due_at <= now))
            .map(|(_, arm)| arm)
            .collect();
        due.sort_by_key(|arm| arm.due_at);
        due
    }

    /// Remove and return the arm for one query regardless of its due time
    pub fn take(&self, query_id: &QueryId) -> Option<Arm> {
        self.arms.remove(query_id).map(|(_, arm)| arm)
    }
}

impl SchedulerPort for ManualPort {
    fn schedule(&self, arm: Arm) {
        self.arms.insert(arm.query_id, arm);
    }

    fn cancel(&self, query_id: &QueryId) -> bool {
        self.arms.remove(query_id).is_some()
    }

    fn pending(&self, query_id: &QueryId) -> Option<Arm> {
        self.arms.get(query_id).map(|arm| *arm)
    }

    fn pending_count(&self) -> usize {
        self.arms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_take_due_only_returns_due_arms() {
        let port = ManualPort::new();
        let now = Utc::now();
        let early = Arm {
            query_id: QueryId::new(),
            generation: 0,
            due_at: now - ChronoDuration::seconds(5),
        };
        let later = Arm {
            query_id: QueryId::new(),
            generation: 0,
            due_at: now + ChronoDuration::seconds(5),
        };
        port.schedule(later);
        port.schedule(early);

        assert_eq!(port.take_due(now), vec![early]);
        assert_eq!(port.pending_count(), 1);
        assert_eq!(port.take(&later.query_id), Some(later));
        assert_eq!(port.pending_count(), 0);
    }
}
