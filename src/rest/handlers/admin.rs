//! Admin Handlers
//!
//! Probes, statistics, and owner actions on individual queries.

use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::{Extension, Json};

use super::parse_query_id;
use crate::engine::Engine;
use crate::executor::{RunOutcome, SkipReason};
use crate::query::QueryStatus;
use crate::rest::dto::{
    ApiResponse, HealthDto, ListQueriesParams, QueryDetailDto, QueryDto, QueryListDto,
    RunResultDto, StatsDto, StatusChangeRequest,
};
use crate::rest::error::RestError;

/// Health check endpoint
pub async fn health(Extension(engine): Extension<Arc<Engine>>) -> Json<ApiResponse<HealthDto>> {
    Json(ApiResponse::success(HealthDto {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: engine.uptime_seconds(),
    }))
}

/// Liveness probe
pub async fn liveness() -> &'static str {
    "OK"
}

/// Readiness probe
pub async fn readiness() -> &'static str {
    "READY"
}

/// Engine statistics endpoint
pub async fn stats(Extension(engine): Extension<Arc<Engine>>) -> Json<ApiResponse<StatsDto>> {
    let stats = engine.stats();
    Json(ApiResponse::success(StatsDto {
        queries: stats.queries,
        by_status: stats.by_status,
        pending_arms: stats.pending_arms,
        tracked_usage: stats.tracked_usage,
        executor: stats.executor,
        uptime_secs: stats.uptime_secs,
    }))
}

/// List queries, optionally filtered by `?status=`
pub async fn list_queries(
    Extension(engine): Extension<Arc<Engine>>,
    Query(params): Query<ListQueriesParams>,
) -> Result<Json<ApiResponse<QueryListDto>>, RestError> {
    let queries = match params.status.as_deref() {
        Some(raw) => {
            let status: QueryStatus = raw.parse().map_err(RestError::bad_request)?;
            engine.manager().list_by_status(status)
        }
        None => engine.manager().list(),
    };

    let queries: Vec<QueryDto> = queries
        .iter()
        .map(|q| QueryDto::from_query(q, &engine))
        .collect();
    let count = queries.len();
    Ok(Json(ApiResponse::success(QueryListDto { queries, count })))
}

/// One query with its cached payload
pub async fn get_query(
    Extension(engine): Extension<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<QueryDetailDto>>, RestError> {
    let id = parse_query_id(&id)?;
    let query = engine
        .manager()
        .get(&id)
        .ok_or_else(|| RestError::not_found(format!("Query not found: {id}")))?;

    Ok(Json(ApiResponse::success(QueryDetailDto {
        query: QueryDto::from_query(&query, &engine),
        fetched_at: query.cached_response.as_ref().map(|r| r.fetched_at),
        response: query.cached_response.as_ref().map(|r| r.content.clone()),
    })))
}

/// Change a query's status (`{"status": "active"}` reactivates)
pub async fn set_status(
    Extension(engine): Extension<Arc<Engine>>,
    Path(id): Path<String>,
    Json(request): Json<StatusChangeRequest>,
) -> Result<Json<ApiResponse<QueryDto>>, RestError> {
    let id = parse_query_id(&id)?;
    let status: QueryStatus = request.status.parse().map_err(RestError::bad_request)?;
    let query = engine.manager().set_status(&id, status)?;
    Ok(Json(ApiResponse::success(QueryDto::from_query(&query, &engine))))
}

/// Run a query now, outside its schedule
pub async fn run_query(
    Extension(engine): Extension<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<RunResultDto>>, RestError> {
    let id = parse_query_id(&id)?;
    let outcome = engine.executor().run_now(&id).await;
    match outcome {
        RunOutcome::Skipped(SkipReason::NotFound) => {
            Err(RestError::not_found(format!("Query not found: {id}")))
        }
        RunOutcome::Skipped(SkipReason::NotActive { status }) => Err(RestError::bad_request(
            format!("Query {id} is {status} and cannot be run"),
        )),
        outcome => {
            let query = engine
                .manager()
                .get(&id)
                .map(|q| QueryDto::from_query(&q, &engine));
            Ok(Json(ApiResponse::success(RunResultDto { outcome, query })))
        }
    }
}
