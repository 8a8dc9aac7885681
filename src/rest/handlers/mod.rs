//! REST API Handlers
//!
//! Contains all HTTP endpoint handlers organized by audience.

pub mod admin;
pub mod management;
pub mod query;

use crate::query::QueryId;
use crate::rest::error::RestError;

/// Parse a path id, mapping garbage to 404 like an unknown id
pub(crate) fn parse_query_id(raw: &str) -> Result<QueryId, RestError> {
    raw.parse()
        .map_err(|_| RestError::not_found(format!("Query not found: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_id() {
        let id = QueryId::new();
        assert_eq!(parse_query_id(&id.to_string()).unwrap(), id);
        let err = parse_query_id("abc").unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::NOT_FOUND);
        assert_eq!(err.error.code, "NOT_FOUND");
    }
}
