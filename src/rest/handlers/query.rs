//! Public Query Handler
//!
//! Serves the cached response of one query in the requested format.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::Query;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Extension;

use crate::engine::Engine;
use crate::reader::ReadError;
use crate::render::{self, ResponseFormat};
use crate::rest::dto::ReadParams;
use crate::rest::error::{ReaderError, RestError};
use crate::rest::Caller;

/// `GET /query?id=<id>&format=<format>`
pub async fn read_query(
    Extension(engine): Extension<Arc<Engine>>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<ReadParams>,
) -> Response {
    let raw_id = params.id.as_deref().unwrap_or_default();
    let read = match engine.reader().read(raw_id) {
        Ok(read) => read,
        Err(e) => return ReaderError(e).into_response(),
    };

    let http = &engine.config().http;
    let requested = params
        .format
        .as_deref()
        .filter(|f| !f.trim().is_empty())
        .unwrap_or(http.default_format.as_str());
    let Ok(format) = requested.parse::<ResponseFormat>() else {
        return ReaderError(ReadError::InvalidRequest).into_response();
    };

    let content = if http.anonymize_responses && caller == Caller::Public {
        Cow::Owned(render::anonymize(&read.response.content))
    } else {
        Cow::Borrowed(&read.response.content)
    };

    match render::render(&content, format) {
        Ok(rendered) => ([(header::CONTENT_TYPE, rendered.content_type)], rendered.body).into_response(),
        Err(e) => {
            tracing::error!(query_id = %read.query_id, error = %e, "render_failed");
            RestError::internal("Failed to render response").into_response()
        }
    }
}
