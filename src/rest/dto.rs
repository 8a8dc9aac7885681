//! REST API Data Transfer Objects
//!
//! Defines request/response types for the REST API endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, StatusCount};
use crate::executor::{ExecutorStats, RunOutcome};
use crate::manager::QueryRef;
use crate::query::{ApiQuery, QueryId, QueryStatus, RunError};

/// JSON response: { success, data?, error? }
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

// Probe and stats DTOs

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthDto {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsDto {
    pub queries: usize,
    pub by_status: Vec<StatusCount>,
    pub pending_arms: usize,
    pub tracked_usage: usize,
    pub executor: ExecutorStats,
    pub uptime_secs: u64,
}

// Management API DTOs

/// `app_id` may arrive in the query string or the JSON body
#[derive(Debug, Default, Deserialize)]
pub struct CreateQueriesParams {
    #[serde(default)]
    pub app_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateQueriesResponse {
    pub query_ids: Vec<QueryRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQueriesRequest {
    #[serde(default)]
    pub query_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteQueriesResponse {
    pub query_ids: Vec<String>,
}

// Reader DTOs

#[derive(Debug, Default, Deserialize)]
pub struct ReadParams {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

// Admin DTOs

#[derive(Debug, Default, Deserialize)]
pub struct ListQueriesParams {
    #[serde(default)]
    pub status: Option<String>,
}

/// Query summary for the admin API
#[derive(Debug, Serialize)]
pub struct QueryDto {
    pub id: QueryId,
    pub name: String,
    pub request: String,
    pub refresh_interval: u64,
    pub status: QueryStatus,
    pub consecutive_error_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    pub has_response: bool,
    pub total_reads: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_access: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl QueryDto {
    pub fn from_query(query: &ApiQuery, engine: &Engine) -> Self {
        QueryDto {
            id: query.id,
            name: query.name.clone(),
            request: query.request.clone(),
            refresh_interval: query.refresh_interval,
            status: query.status,
            consecutive_error_count: query.consecutive_error_count,
            created_at: query.created_at,
            last_run_at: query.last_run_at,
            last_success_at: query.last_success_at,
            last_error: query.last_error.clone(),
            has_response: query.has_response(),
            total_reads: engine.usage().total_reads(&query.id),
            last_access: engine.usage().last_access(&query.id),
            next_run_at: engine.scheduler().pending(&query.id).map(|arm| arm.due_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueryListDto {
    pub queries: Vec<QueryDto>,
    pub count: usize,
}

/// Query summary plus the cached payload
#[derive(Debug, Serialize)]
pub struct QueryDetailDto {
    #[serde(flatten)]
    pub query: QueryDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct RunResultDto {
    #[serde(flatten)]
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryDto>,
}
