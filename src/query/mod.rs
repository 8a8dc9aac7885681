//! API Query Model
//!
//! An [`ApiQuery`] is one registered recurring upstream request: a resolved
//! URL, a refresh interval, its lifecycle status, and the last good response.
//!
//! ## Lifecycle
//!
//! ```text
//!            create (validated)
//!                  │
//!                  ▼
//!   ┌──────────► Active ──── error limit reached ───► PausedErrors
//!   │              │
//!   │              └──────── no reads in window ────► PausedAbandoned
//!   │                                                     │
//!   └──────────── set_status(active) ◄────────────────────┘
//!
//!   Disabled: owner switched the query off; readers get `invalidRequest`.
//! ```
//!
//! Records are versioned by the store; every committed write bumps `version`,
//! and every committed run outcome bumps `run_generation`.

pub mod validator;

pub use validator::{validate, ValidatedQuery, ValidationError, Violation, ViolationKind};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque, externally visible query identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(Uuid);

impl QueryId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        QueryId(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(QueryId)
    }
}

/// Scheduling status of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Scheduled and refreshed on its interval
    Active,
    /// Paused after too many consecutive upstream failures
    PausedErrors,
    /// Paused because nobody has read it recently
    PausedAbandoned,
    /// Switched off by the owner
    Disabled,
}

impl QueryStatus {
    pub const ALL: [QueryStatus; 4] = [
        QueryStatus::Active,
        QueryStatus::PausedErrors,
        QueryStatus::PausedAbandoned,
        QueryStatus::Disabled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Active => "active",
            QueryStatus::PausedErrors => "paused_errors",
            QueryStatus::PausedAbandoned => "paused_abandoned",
            QueryStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueryStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "Unknown status '{s}'. Valid statuses: active, paused_errors, paused_abandoned, disabled"
                )
            })
    }
}

/// Last successful upstream payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Upstream JSON body, stored as received
    pub content: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

/// Most recent upstream failure, kept for the admin view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One registered recurring upstream request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiQuery {
    pub id: QueryId,
    pub name: String,
    /// Fully resolved upstream URL
    pub request: String,
    /// Seconds between scheduled executions
    pub refresh_interval: u64,
    pub status: QueryStatus,
    pub consecutive_error_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Shared so that store snapshots of large payloads stay cheap to clone
    pub cached_response: Option<Arc<CachedResponse>>,
    pub last_error: Option<RunError>,
    /// Bumped on every committed run outcome
    #[serde(default)]
    pub run_generation: u64,
    /// Store-managed compare-and-set key
    #[serde(default)]
    pub version: u64,
}

impl ApiQuery {
    /// Build a fresh active query from a validated definition
    pub fn new(validated: ValidatedQuery, now: DateTime<Utc>) -> Self {
        let (name, request, refresh_interval) = validated.into_parts();
        ApiQuery {
            id: QueryId::new(),
            name,
            request,
            refresh_interval,
            status: QueryStatus::Active,
            consecutive_error_count: 0,
            created_at: now,
            last_run_at: None,
            last_success_at: None,
            cached_response: None,
            last_error: None,
            run_generation: 0,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == QueryStatus::Active
    }

    /// Whether at least one run has ever succeeded
    pub fn has_response(&self) -> bool {
        self.cached_response.is_some()
    }

    pub fn refresh_interval_duration(&self) -> ChronoDuration {
        ChronoDuration::seconds(i64::try_from(self.refresh_interval).unwrap_or(i64::MAX))
    }

    /// When the next refresh is due before jitter: `last_run_at + refresh_interval`,
    /// or `now` for a query that has never run. Never earlier than `now`.
    pub fn next_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_run_at {
            Some(last) => last
                .checked_add_signed(self.refresh_interval_duration())
                .map_or(now, |due| due.max(now)),
            None => now,
        }
    }
}

/// A query definition as submitted, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDraft {
    pub name: String,
    pub request: String,
    pub refresh_interval: u64,
}

impl QueryDraft {
    pub fn new(name: impl Into<String>, request: impl Into<String>, refresh_interval: u64) -> Self {
        QueryDraft {
            name: name.into(),
            request: request.into(),
            refresh_interval,
        }
    }
}
