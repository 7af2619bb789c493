//! Transport to the remote sync endpoint.

use super::{PushRequest, PushResponse};
use crate::{config::SyncConfig, error::Result, Error};
use async_trait::async_trait;
use tracing::debug;

/// Sends a batch of records to the remote and returns its verdict.
///
/// Any error is treated as a transport failure and retried by the engine.
#[async_trait]
pub trait SyncTransport: Send + Sync + std::fmt::Debug {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse>;
}

/// JSON over HTTP: `POST {endpoint}` with an optional bearer token.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(Error::Network("no sync endpoint configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Network(format!("sync endpoint returned {status}: {body}")));
        }

        let reply: PushResponse = response.json().await?;
        debug!(
            records = request.records.len(),
            conflicts = reply.conflicts.len(),
            rejected = reply.rejected.len(),
            "push answered"
        );
        Ok(reply)
    }
}
