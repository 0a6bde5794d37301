//! HTTP transport for `tether-server`.
//!
//! Routes:
//! - `POST /sync/push` with a [`PushRequest`], answered by a [`PushResult`]
//! - `GET /sync/changes?since=N`, answered by a [`ChangeSet`]
//! - `GET /sync/deletions?since=N`, answered by a [`DeletionSet`]
//!
//! Connection failures, timeouts and 5xx responses are retryable; any other
//! non-success status is not.

use super::{ChangeSet, Checkpoint, DeletionSet, NetworkError, PushRequest, PushResult, RemoteGateway};
use crate::Operation;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Talks to a `tether-server` instance.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    /// Gateway for `base_url` (e.g. `http://localhost:3000`) with a client
    /// that gives up on a request after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::fatal(format!("cannot build http client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Use a preconfigured client.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, NetworkError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn push(&self, operation: &Operation) -> PushResult {
        let request = PushRequest {
            operation: operation.clone(),
        };
        let sent = self
            .client
            .post(self.url("/sync/push"))
            .json(&request)
            .send()
            .await;
        let result = match sent {
            Ok(response) => decode::<PushResult>(response).await,
            Err(err) => Err(transport_error(err)),
        };
        result.unwrap_or_else(PushResult::from)
    }

    async fn pull_changes(&self, since: Checkpoint) -> Result<ChangeSet, NetworkError> {
        self.get_json(&format!("/sync/changes?since={}", since.value()))
            .await
    }

    async fn pull_deletions(&self, since: Checkpoint) -> Result<DeletionSet, NetworkError> {
        self.get_json(&format!("/sync/deletions?since={}", since.value()))
            .await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, NetworkError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| NetworkError::fatal(format!("malformed response: {e}")))
}

fn transport_error(err: reqwest::Error) -> NetworkError {
    if err.is_decode() || err.is_builder() {
        NetworkError::fatal(err.to_string())
    } else {
        NetworkError::retryable(err.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> NetworkError {
    let message = if body.is_empty() {
        format!("server returned {status}")
    } else {
        format!("server returned {status}: {body}")
    };
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    NetworkError { message, retryable }
}
