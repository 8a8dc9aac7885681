//! Public read path: resolve a raw id to the cached response and record the access.

use std::sync::Arc;
use thiserror::Error;

use crate::query::{CachedResponse, QueryId, QueryStatus};
use crate::store::QueryStore;
use crate::usage::UsageTracker;

/// Errors returned to readers. Codes and messages are part of the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("The query is not yet available. Wait and try again later.")]
    InactiveQuery,

    #[error("The query id is invalid or the API Query is disabled.")]
    InvalidRequest,

    #[error("Invalid query id.")]
    InvalidQueryId,
}

impl ReadError {
    /// Stable error code used in response bodies
    pub fn code(self) -> &'static str {
        match self {
            ReadError::InactiveQuery => "inactiveQuery",
            ReadError::InvalidRequest => "invalidRequest",
            ReadError::InvalidQueryId => "invalidQueryId",
        }
    }

    /// HTTP status sent with the error
    pub fn http_status(self) -> u16 {
        400
    }
}

/// A successful read
#[derive(Debug, Clone)]
pub struct QueryRead {
    pub query_id: QueryId,
    pub status: QueryStatus,
    pub response: Arc<CachedResponse>,
}

pub struct QueryReader {
    store: Arc<QueryStore>,
    usage: Arc<UsageTracker>,
}

impl QueryReader {
    pub fn new(store: Arc<QueryStore>, usage: Arc<UsageTracker>) -> Self {
        QueryReader { store, usage }
    }

    /// Look up a query by its raw external id.
    ///
    /// Paused queries still serve their last good response. Any lookup that
    /// finds the query counts as a read, including ones that return an error.
    pub fn read(&self, raw_id: &str) -> Result<QueryRead, ReadError> {
        let id: QueryId = raw_id.parse().map_err(|_| ReadError::InvalidQueryId)?;
        let query = self.store.get(&id).ok_or(ReadError::InvalidQueryId)?;
        self.usage.record_access(&id);

        if query.status == QueryStatus::Disabled {
            return Err(ReadError::InvalidRequest);
        }
        let response = query
            .cached_response
            .as_ref()
            .ok_or(ReadError::InactiveQuery)?;

        Ok(QueryRead {
            query_id: id,
            status: query.status,
            response: Arc::clone(response),
        })
    }
}
