//! Management Handlers
//!
//! Bulk creation and deletion of an app's queries.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Query;
use axum::{Extension, Json};

use crate::engine::Engine;
use crate::rest::dto::{
    CreateQueriesParams, CreateQueriesResponse, DeleteQueriesRequest, DeleteQueriesResponse,
};

/// `app_id` from the query string, else from a JSON body; a string or a number
fn app_id(params: &CreateQueriesParams, body: &[u8]) -> Option<u64> {
    if let Some(raw) = &params.app_id {
        return raw.trim().parse().ok();
    }
    let body: serde_json::Value = serde_json::from_slice(body).ok()?;
    match body.get("app_id")? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Create the template queries for an app.
///
/// A missing or unparsable `app_id` creates nothing and returns an empty list.
pub async fn create_queries(
    Extension(engine): Extension<Arc<Engine>>,
    Query(params): Query<CreateQueriesParams>,
    body: Bytes,
) -> Json<CreateQueriesResponse> {
    let Some(app_id) = app_id(&params, &body) else {
        return Json(CreateQueriesResponse {
            query_ids: Vec::new(),
            errors: Vec::new(),
        });
    };

    let mut query_ids = Vec::new();
    let mut errors = Vec::new();
    for outcome in engine.manager().create_queries(app_id) {
        match outcome {
            Ok(created) => query_ids.push(created),
            Err(e) => errors.push(e.to_string()),
        }
    }
    Json(CreateQueriesResponse { query_ids, errors })
}

/// Delete queries by id; returns the ids that were deleted
pub async fn delete_queries(
    Extension(engine): Extension<Arc<Engine>>,
    Json(request): Json<DeleteQueriesRequest>,
) -> Json<DeleteQueriesResponse> {
    let deleted = engine.manager().delete_queries(&request.query_ids);
    Json(DeleteQueriesResponse {
        query_ids: deleted.iter().map(ToString::to_string).collect(),
    })
}
