//! Query Manager
//!
//! Creation, deletion and status changes. Every path that makes a query
//! `active` seeds its usage counter and arms it with jitter only; every path
//! that takes it out of `active` cancels its arm.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{QueryLimits, TemplateConfig, UpstreamConfig};
use crate::query::{validate, ApiQuery, QueryDraft, QueryId, QueryStatus, ValidationError};
use crate::scheduler::Scheduler;
use crate::store::{QueryStore, StoreError};
use crate::usage::UsageTracker;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Query not found: {0}")]
    NotFound(QueryId),

    #[error("{name}: {source}")]
    Invalid {
        name: String,
        #[source]
        source: ValidationError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A query created for an app, as reported to the management API caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRef {
    pub id: QueryId,
    /// Template name, without the app id and date prefix
    pub name: String,
    pub start_date: String,
    pub end_date: String,
}

pub type CreateOutcome = Result<QueryRef, ManagerError>;

pub struct QueryManager {
    store: Arc<QueryStore>,
    usage: Arc<UsageTracker>,
    scheduler: Arc<Scheduler>,
    limits: QueryLimits,
    templates: TemplateConfig,
    analytics_property: String,
}

impl QueryManager {
    pub fn new(
        store: Arc<QueryStore>,
        usage: Arc<UsageTracker>,
        scheduler: Arc<Scheduler>,
        limits: QueryLimits,
        templates: TemplateConfig,
        upstream: &UpstreamConfig,
    ) -> Self {
        QueryManager {
            store,
            usage,
            scheduler,
            limits,
            templates,
            analytics_property: upstream.analytics_property.clone(),
        }
    }

    /// Validate, store, and arm one query
    pub fn create_query(&self, draft: &QueryDraft) -> Result<Arc<ApiQuery>, ManagerError> {
        let validated = validate(draft, &self.limits).map_err(|source| ManagerError::Invalid {
            name: draft.name.clone(),
            source,
        })?;
        let now = Utc::now();
        let stored = self.store.create(ApiQuery::new(validated, now))?;
        self.register_usage(&stored.id, now);
        self.scheduler.arm_initial(&stored, now);
        tracing::info!(
            query_id = %stored.id,
            name = %stored.name,
            refresh_interval = stored.refresh_interval,
            "query_created"
        );
        Ok(stored)
    }

    /// Create one query per template and date range for `app_id`.
    ///
    /// Items succeed or fail independently. App id 0 is treated as missing
    /// and creates nothing.
    pub fn create_queries(&self, app_id: u64) -> Vec<CreateOutcome> {
        if app_id == 0 {
            return Vec::new();
        }

        let mut outcomes = Vec::new();
        for template in &self.templates.queries {
            for range in &self.templates.date_ranges {
                let request = template
                    .base_url
                    .replace("{analytics_property}", &self.analytics_property)
                    .replace("{app_id}", &app_id.to_string())
                    .replace("{start_date}", &range.start)
                    .replace("{end_date}", &range.end);
                let draft = QueryDraft::new(
                    format!("ID:{app_id} - {} - {}", template.name, range.start),
                    request,
                    template.refresh_interval,
                );

                let outcome = self.create_query(&draft).map(|stored| QueryRef {
                    id: stored.id,
                    name: template.name.clone(),
                    start_date: range.start.clone(),
                    end_date: range.end.clone(),
                });
                if let Err(e) = &outcome {
                    tracing::warn!(app_id, error = %e, "query_create_failed");
                }
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Start the usage window, undoing it if a delete got in first
    fn register_usage(&self, id: &QueryId, now: DateTime<Utc>) {
        self.usage.register(id, now);
        if !self.store.contains(id) {
            self.usage.remove(id);
        }
    }

    /// Delete one query with its arm and usage counters. Returns false if it did not exist.
    pub fn delete_query(&self, id: &QueryId) -> bool {
        match self.store.delete(id) {
            Ok(_) => {
                self.scheduler.disarm(id);
                self.usage.remove(id);
                tracing::info!(query_id = %id, "query_deleted");
                true
            }
            Err(_) => false,
        }
    }

    /// Delete each id that parses and exists; returns those deleted
    pub fn delete_queries<S: AsRef<str>>(&self, raw_ids: &[S]) -> Vec<QueryId> {
        raw_ids
            .iter()
            .filter_map(|raw| raw.as_ref().parse::<QueryId>().ok())
            .filter(|id| self.delete_query(id))
            .collect()
    }

    /// Change a query's status.
    ///
    /// Reactivation clears the error count, restarts the abandonment window,
    /// invalidates any arm still in flight, and arms with jitter only.
    pub fn set_status(&self, id: &QueryId, status: QueryStatus) -> Result<Arc<ApiQuery>, ManagerError> {
        let committed = loop {
            let current = self.store.get(id).ok_or(ManagerError::NotFound(*id))?;
            if current.status == status {
                if status == QueryStatus::Active && self.scheduler.pending(id).is_none() {
                    self.scheduler.arm_initial(&current, Utc::now());
                }
                return Ok(current);
            }

            let result = self.store.update(id, current.version, |q| {
                q.status = status;
                if status == QueryStatus::Active {
                    q.consecutive_error_count = 0;
                    q.run_generation += 1;
                }
            });
            match result {
                Ok(committed) => break committed,
                Err(e) if e.is_conflict() => continue,
                Err(e) if e.is_not_found() => return Err(ManagerError::NotFound(*id)),
                Err(e) => return Err(e.into()),
            }
        };

        if committed.is_active() {
            let now = Utc::now();
            self.register_usage(id, now);
            self.scheduler.arm_initial(&committed, now);
            if !self.store.get(id).is_some_and(|q| q.is_active()) {
                self.scheduler.disarm(id);
            }
        } else {
            self.scheduler.disarm(id);
        }

        tracing::info!(query_id = %id, status = %committed.status, "query_status_changed");
        Ok(committed)
    }

    pub fn get(&self, id: &QueryId) -> Option<Arc<ApiQuery>> {
        self.store.get(id)
    }

    pub fn list(&self) -> Vec<Arc<ApiQuery>> {
        self.store.list()
    }

    pub fn list_by_status(&self, status: QueryStatus) -> Vec<Arc<ApiQuery>> {
        self.store.list_by_status(status)
    }
}
