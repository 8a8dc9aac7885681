//! # superproxy
//!
//! A caching proxy in front of a rate-limited analytics API. Clients register
//! long-lived queries; the proxy refreshes each one on its own interval and
//! serves the last good response to readers.
//!
//! ## Architecture
//!
//! ```text
//! QueryManager ──► validate ──► QueryStore ──► Scheduler (arm with jitter)
//!                                   ▲                │
//!                                   │                ▼ fire
//!                                   └──────────── Executor ──► Upstream API
//!                                        commit        │
//!                                                      └──► Scheduler (re-arm)
//!
//! QueryReader ──► QueryStore (read) + UsageTracker (record)
//! ```
//!
//! ## Lifecycle
//!
//! - Failing queries pause after `query_error_limit` consecutive errors
//! - Queries nobody reads for `refresh_interval * abandoned_interval_multiple`
//!   pause before their next upstream call
//! - Paused queries keep serving their last good response
//!
//! ## Usage
//!
//! ```rust,ignore
//! use superproxy::{Config, Engine};
//!
//! let config = Config::load()?;
//! let (engine, fired) = Engine::from_config(config)?;
//! superproxy::rest::start_http_server(engine, fired).await?;
//! ```

pub mod config;
pub mod engine;
pub mod executor;
pub mod manager;
pub mod query;
pub mod reader;
pub mod render;
pub mod rest;
pub mod scheduler;
pub mod store;
pub mod upstream;
pub mod usage;

pub use config::Config;
pub use engine::{Engine, EngineError};
pub use executor::{Executor, RunOutcome, SkipReason};
pub use manager::{ManagerError, QueryManager, QueryRef};
pub use query::{ApiQuery, CachedResponse, QueryDraft, QueryId, QueryStatus};
pub use reader::{QueryReader, ReadError};
pub use render::ResponseFormat;
pub use scheduler::{Arm, ManualPort, Scheduler, SchedulerPort, TimerQueue};
pub use store::{QueryStore, StoreError, StoreResult};
pub use upstream::{HttpUpstream, Upstream, UpstreamError};
pub use usage::UsageTracker;
