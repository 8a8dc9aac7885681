//! Upstream analytics API client.
//!
//! The executor talks to the upstream through the [`Upstream`] trait so tests
//! can swap in a scripted fake. [`HttpUpstream`] is the reqwest-backed client
//! used by the server.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use thiserror::Error;

use crate::config::UpstreamConfig;

/// Why an upstream request produced no usable payload
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream request timed out after {0}s")]
    Timeout(u64),

    #[error("Upstream transport error: {0}")]
    Transport(String),

    #[error("Upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Upstream returned a body that is not JSON: {0}")]
    Malformed(String),

    #[error("Upstream client could not be built: {0}")]
    Client(String),
}

/// Longest upstream error body kept in messages
const MAX_ERROR_BODY: usize = 512;

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Perform one GET against the fully resolved request URL
    async fn fetch(&self, request: &str) -> Result<serde_json::Value, UpstreamError>;
}

/// reqwest client with a per-request timeout
pub struct HttpUpstream {
    client: Client,
    timeout_secs: u64,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.access_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| UpstreamError::Client(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| UpstreamError::Client(e.to_string()))?;

        Ok(HttpUpstream {
            client,
            timeout_secs: config.timeout_secs,
        })
    }

    fn classify(&self, err: &reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout(self.timeout_secs)
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: &str) -> Result<serde_json::Value, UpstreamError> {
        let response = self
            .client
            .get(request)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(&e))?;

        if !status.is_success() {
            let mut body = body;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| UpstreamError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn upstream(timeout_secs: u64) -> HttpUpstream {
        HttpUpstream::new(&UpstreamConfig {
            timeout_secs,
            access_token: Some("secret".to_string()),
            ..UpstreamConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_json_body() {
        let base = serve(Router::new().route(
            "/data",
            get(|headers: axum::http::HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                axum::Json(serde_json::json!({"rows": [["42"]], "auth": auth}))
            }),
        ))
        .await;

        let body = upstream(5).fetch(&format!("{base}/data")).await.unwrap();
        assert_eq!(body["rows"][0][0], "42");
        assert_eq!(body["auth"], "Bearer secret");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let base = serve(Router::new().route(
            "/limited",
            get(|| async { (StatusCode::TOO_MANY_REQUESTS, "quota exceeded") }),
        ))
        .await;

        match upstream(5).fetch(&format!("{base}/limited")).await {
            Err(UpstreamError::Status { status, body }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "quota exceeded");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let base = serve(Router::new().route("/html", get(|| async { "<html></html>" }))).await;
        assert!(matches!(
            upstream(5).fetch(&format!("{base}/html")).await,
            Err(UpstreamError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let base = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "{}"
            }),
        ))
        .await;
        assert!(matches!(
            upstream(1).fetch(&format!("{base}/slow")).await,
            Err(UpstreamError::Timeout(1))
        ));
    }
}
