//! HTTP transport implementation.
//!
//! Every request carries the device's bearer token. Non-success statuses
//! are mapped through [`SyncError::from_status`] using the `{"error": ...}`
//! body the server sends.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use notesync_protocol::{
    Attachment, ChangesQuery, ChangesResponse, ErrorBody, PullRequest, PullResponse, PushRequest,
    PushResponse, UploadQuery,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

/// HTTP-based sync transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    token: String,
    client: Client,
}

impl HttpTransport {
    /// Creates a transport for the server and token in `config`.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("notesync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self {
            base_url: config.server_url.clone(),
            token: config.token.clone(),
            client,
        })
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> SyncResult<Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let fallback = status.canonical_reason().unwrap_or("request failed").to_string();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => fallback,
        };
        tracing::debug!(status = status.as_u16(), %message, "request failed");
        Err(SyncError::from_status(status.as_u16(), message))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> SyncResult<T> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid response body: {e}")))
    }
}

fn map_reqwest(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout
    } else if err.is_builder() {
        SyncError::transport_fatal(err.to_string())
    } else {
        SyncError::transport_retryable(err.to_string())
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.send_json(self.client.post(self.url("/sync/push")).json(request))
            .await
    }

    async fn changes(&self, query: &ChangesQuery) -> SyncResult<ChangesResponse> {
        self.send_json(self.client.get(self.url("/sync/changes")).query(query))
            .await
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.send_json(self.client.post(self.url("/sync/pull")).json(request))
            .await
    }

    async fn upload(&self, query: &UploadQuery, bytes: Vec<u8>) -> SyncResult<Attachment> {
        let request = self
            .client
            .post(self.url("/attachments/upload"))
            .query(query)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        self.send_json(request).await
    }

    async fn download(&self, attachment_id: &str) -> SyncResult<Vec<u8>> {
        let url = self.url(&format!("/attachments/{attachment_id}/download"));
        let response = self.send(self.client.get(url)).await?;
        let bytes = response.bytes().await.map_err(map_reqwest)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transport_uses_the_configured_server() {
        let config = SyncConfig::new("http://127.0.0.1:9/", "tok", "dev-a");
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.base_url(), "http://127.0.0.1:9");
        assert_eq!(transport.url("/sync/push"), "http://127.0.0.1:9/sync/push");
    }

    #[tokio::test]
    async fn unreachable_server_is_retryable() {
        // Port 9 (discard) is closed on test machines.
        let config = SyncConfig::new("http://127.0.0.1:9", "tok", "dev-a")
            .with_timeout(Duration::from_secs(2));
        let transport = HttpTransport::new(&config).unwrap();

        let err = transport.pull(&PullRequest::default()).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
