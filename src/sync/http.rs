//! HTTP implementation of [`RemoteApi`].
//!
//! Routes:
//! - `POST   {base}/api/{collection}` create
//! - `PATCH  {base}/api/{collection}/{id}` update
//! - `DELETE {base}/api/{collection}/{id}` delete

use serde::Deserialize;
use std::time::Duration;

use super::api::{ApiError, CreateRequest, RemoteApi, ServerRecord, UpdateRequest};
use crate::model::EntityKind;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// `reqwest`-backed remote API client.
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

/// Error body shape: `{"error": "..."}` or `{"message": "..."}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl HttpRemoteApi {
    /// Create a client for the server at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
            token,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/api/{}", self.base_url, kind.collection())
    }

    fn entity_url(&self, kind: EntityKind, id: &str) -> String {
        format!("{}/{id}", self.collection_url(kind))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url).timeout(self.timeout);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(ApiError::Http {
            status: status.as_u16(),
            message: error_message(&text, status),
        })
    }

    async fn record(&self, builder: reqwest::RequestBuilder) -> Result<ServerRecord, ApiError> {
        let response = self.send(builder).await?;
        response
            .json::<ServerRecord>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

impl RemoteApi for HttpRemoteApi {
    async fn create(&self, kind: EntityKind, request: &CreateRequest) -> Result<ServerRecord, ApiError> {
        let url = self.collection_url(kind);
        tracing::debug!(%url, client_id = %request.client_id, "POST create");
        self.record(self.request(reqwest::Method::POST, &url).json(request))
            .await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        request: &UpdateRequest,
    ) -> Result<ServerRecord, ApiError> {
        let url = self.entity_url(kind, id);
        tracing::debug!(%url, "PATCH update");
        self.record(self.request(reqwest::Method::PATCH, &url).json(request))
            .await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), ApiError> {
        let url = self.entity_url(kind, id);
        tracing::debug!(%url, "DELETE");
        self.send(self.request(reqwest::Method::DELETE, &url)).await?;
        Ok(())
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(err.to_string())
    }
}

/// Pull the server's message out of an error body, falling back to the raw
/// text or the status reason.
fn error_message(body: &str, status: reqwest::StatusCode) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_urls() {
        let api = HttpRemoteApi::new("https://taskflow.example/", None);
        assert_eq!(api.base_url(), "https://taskflow.example");
        assert_eq!(
            api.collection_url(EntityKind::TeamMember),
            "https://taskflow.example/api/team"
        );
        assert_eq!(
            api.entity_url(EntityKind::Task, "t1"),
            "https://taskflow.example/api/tasks/t1"
        );
    }

    #[test]
    fn test_error_message_prefers_json_fields() {
        assert_eq!(
            error_message(r#"{"error":"Task not found"}"#, StatusCode::NOT_FOUND),
            "Task not found"
        );
        assert_eq!(
            error_message(r#"{"message":"title required"}"#, StatusCode::BAD_REQUEST),
            "title required"
        );
        assert_eq!(error_message("upstream down", StatusCode::BAD_GATEWAY), "upstream down");
        assert_eq!(error_message("", StatusCode::SERVICE_UNAVAILABLE), "Service Unavailable");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let api = HttpRemoteApi::new("http://127.0.0.1:9", None)
            .with_timeout(Duration::from_secs(2));
        let err = api.delete(EntityKind::Task, "t1").await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_) | ApiError::Timeout));
    }
}
