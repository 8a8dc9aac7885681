//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (SUPERPROXY_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [scheduling]
//! query_error_limit = 3
//! max_random_countdown = 60
//!
//! [upstream]
//! timeout_secs = 10
//! analytics_property = "ga:12345678"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! SUPERPROXY_SCHEDULING__QUERY_ERROR_LIMIT=5
//! SUPERPROXY_HTTP__PORT=9090
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: QueryLimits,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub templates: TemplateConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Static limits a query definition must satisfy before it is accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLimits {
    /// Maximum query name length in characters
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,

    /// Maximum upstream request URL length in characters
    #[serde(default = "default_max_url_length")]
    pub max_url_length: usize,

    /// Shortest allowed refresh interval in seconds
    #[serde(default = "default_min_interval")]
    pub min_interval: u64,

    /// Longest allowed refresh interval in seconds (29 days)
    #[serde(default = "default_max_interval")]
    pub max_interval: u64,
}

/// Scheduling and lifecycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Consecutive upstream failures before a query is paused
    #[serde(default = "default_query_error_limit")]
    pub query_error_limit: u32,

    /// A query is abandoned when it has not been read for
    /// `refresh_interval * abandoned_interval_multiple` seconds
    #[serde(default = "default_abandoned_interval_multiple")]
    pub abandoned_interval_multiple: u64,

    /// Upper bound (inclusive) of the random countdown added to every arm, in seconds
    #[serde(default = "default_max_random_countdown")]
    pub max_random_countdown: u64,

    /// Number of usage counter shards per query
    #[serde(default = "default_usage_shards")]
    pub usage_shards: usize,

    /// How often the scheduler re-checks that every active query is armed. 0 = startup only.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Log upstream response errors
    #[serde(default = "default_true")]
    pub log_errors: bool,
}

/// Upstream analytics API client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Per-request timeout in seconds; must stay below `limits.min_interval`
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,

    /// Analytics property substituted for `{analytics_property}` in templates
    #[serde(default = "default_analytics_property")]
    pub analytics_property: String,

    /// Optional bearer token sent with every upstream request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// A query template resolved once per date range when queries are created for an app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTemplate {
    pub name: String,
    /// URL with `{analytics_property}`, `{app_id}`, `{start_date}` and `{end_date}` placeholders
    pub base_url: String,
    pub refresh_interval: u64,
}

/// Relative date range in the upstream API's date syntax (e.g. `7daysAgo`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

/// Query templates and date ranges used by the management API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "default_templates")]
    pub queries: Vec<QueryTemplate>,

    #[serde(default = "default_date_ranges")]
    pub date_ranges: Vec<DateRange>,
}

/// Store persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the store snapshot
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Snapshot file name inside `data_dir`
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,

    /// Snapshot interval in seconds (0 = only on shutdown)
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional log file; stdout when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP server bind address
    #[serde(default = "default_http_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Bearer tokens accepted on management and admin routes (empty = not enforced)
    #[serde(default)]
    pub management_tokens: Vec<String>,

    /// Strip account identifiers from responses served to public callers
    #[serde(default = "default_true")]
    pub anonymize_responses: bool,

    /// Format used when a reader does not ask for one
    #[serde(default = "default_format")]
    pub default_format: String,

    /// Allowed CORS origins (empty = same-origin only, unless cors_allow_all is true)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Explicitly allow all CORS origins
    #[serde(default)]
    pub cors_allow_all: bool,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Configuration that loaded but cannot be used
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid configuration value for '{field}': {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

// Default value functions
fn default_max_name_length() -> usize {
    115
}
fn default_max_url_length() -> usize {
    2000
}
fn default_min_interval() -> u64 {
    15
}
fn default_max_interval() -> u64 {
    2_505_600
}
fn default_query_error_limit() -> u32 {
    3
}
fn default_abandoned_interval_multiple() -> u64 {
    2
}
fn default_max_random_countdown() -> u64 {
    60
}
fn default_usage_shards() -> usize {
    10
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_upstream_timeout_secs() -> u64 {
    10
}
fn default_analytics_property() -> String {
    "ga:105878091".to_string()
}
fn default_user_agent() -> String {
    format!("superproxy/{}", env!("CARGO_PKG_VERSION"))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_snapshot_file() -> String {
    "queries.json".to_string()
}
fn default_persist_interval_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_http_host() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_format() -> String {
    "json".to_string()
}
fn default_max_body_bytes() -> usize {
    65_536 // 64 KB
}

fn default_date_ranges() -> Vec<DateRange> {
    ["7daysAgo", "30daysAgo", "90daysAgo"]
        .into_iter()
        .map(|start| DateRange {
            start: start.to_string(),
            end: "yesterday".to_string(),
        })
        .collect()
}

fn template(name: &str, host: &str, params: &str) -> QueryTemplate {
    QueryTemplate {
        name: name.to_string(),
        base_url: format!(
            "https://{host}/analytics/v3/data/ga?ids={{analytics_property}}&{params}&\
             start-date={{start_date}}&end-date={{end_date}}&samplingLevel=HIGHER_PRECISION"
        ),
        refresh_interval: 86400,
    }
}

fn default_templates() -> Vec<QueryTemplate> {
    vec![
        template(
            "Total Sessions",
            "www.googleapis.com",
            "metrics=ga:sessions&filters=ga:dimension3%3D%3D{app_id}",
        ),
        template(
            "Average Time On Page",
            "www.googleapis.com",
            "metrics=ga:avgTimeOnPage&filters=ga:dimension3%3D%3D{app_id}",
        ),
        template(
            "New vs Returning",
            "content.googleapis.com",
            "dimensions=ga%3AuserType&metrics=ga%3Asessions&filters=ga%3Adimension3%3D%3D{app_id}",
        ),
        template(
            "Clicked Content Items",
            "content.googleapis.com",
            "dimensions=ga%3AeventLabel&metrics=ga%3AtotalEvents&\
             filters=ga%3Adimension3%3D%3D{app_id};ga:eventCategory%3D%3DContent%20Item&\
             sort=-ga%3AtotalEvents&max-results=10",
        ),
        template(
            "Shared Content Items",
            "www.googleapis.com",
            "dimensions=ga:eventCategory,ga:eventLabel&metrics=ga:totalEvents&\
             filters=ga:dimension3%3D%3D{app_id};ga:eventAction%3D%3Dshare&\
             sort=-ga:totalEvents&max-results=10",
        ),
        template(
            "Location",
            "content.googleapis.com",
            "dimensions=ga%3Acountry&metrics=ga%3Asessions&filters=ga%3Adimension3%3D%3D{app_id}",
        ),
        template(
            "Sessions by Day",
            "content.googleapis.com",
            "dimensions=ga%3Aday&metrics=ga%3Asessions&filters=ga%3Adimension3%3D%3D{app_id}",
        ),
    ]
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (SUPERPROXY_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("SUPERPROXY_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SUPERPROXY_").split("__"))
            .extract()
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: String| Err(ConfigError { field, reason });

        if self.limits.min_interval == 0 {
            return invalid("limits.min_interval", "must be at least 1 second".into());
        }
        if self.limits.min_interval > self.limits.max_interval {
            return invalid(
                "limits.min_interval",
                format!(
                    "{} exceeds limits.max_interval ({})",
                    self.limits.min_interval, self.limits.max_interval
                ),
            );
        }
        if self.upstream.timeout_secs == 0 || self.upstream.timeout_secs >= self.limits.min_interval
        {
            return invalid(
                "upstream.timeout_secs",
                format!(
                    "must be between 1 and {} (below limits.min_interval)",
                    self.limits.min_interval - 1
                ),
            );
        }
        if self.scheduling.query_error_limit == 0 {
            return invalid("scheduling.query_error_limit", "must be at least 1".into());
        }
        if self.scheduling.abandoned_interval_multiple == 0 {
            return invalid(
                "scheduling.abandoned_interval_multiple",
                "must be at least 1".into(),
            );
        }
        if self.scheduling.usage_shards == 0 {
            return invalid("scheduling.usage_shards", "must be at least 1".into());
        }
        Ok(())
    }
}

impl QueryLimits {
    /// Whether `seconds` is an acceptable refresh interval
    pub fn interval_in_range(&self, seconds: u64) -> bool {
        (self.min_interval..=self.max_interval).contains(&seconds)
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl StorageConfig {
    /// Full path of the store snapshot
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }
}

impl Default for QueryLimits {
    fn default() -> Self {
        QueryLimits {
            max_name_length: default_max_name_length(),
            max_url_length: default_max_url_length(),
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        SchedulingConfig {
            query_error_limit: default_query_error_limit(),
            abandoned_interval_multiple: default_abandoned_interval_multiple(),
            max_random_countdown: default_max_random_countdown(),
            usage_shards: default_usage_shards(),
            sweep_interval_secs: default_sweep_interval_secs(),
            log_errors: true,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            timeout_secs: default_upstream_timeout_secs(),
            analytics_property: default_analytics_property(),
            access_token: None,
            user_agent: default_user_agent(),
        }
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        TemplateConfig {
            queries: default_templates(),
            date_ranges: default_date_ranges(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: default_data_dir(),
            snapshot_file: default_snapshot_file(),
            persist_interval_secs: default_persist_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            host: default_http_host(),
            port: default_http_port(),
            management_tokens: Vec::new(),
            anonymize_responses: true,
            default_format: default_format(),
            cors_origins: Vec::new(),
            cors_allow_all: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}
