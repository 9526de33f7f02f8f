//! REST client for the hub's `/api/register` endpoint.

use std::time::Duration;

use serde::Deserialize;

use crate::error::TransportError;
use crate::task::NodeInfo;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    hub_id: String,
}

#[derive(Debug, Clone)]
pub struct HubClient {
    base_url: String,
    client: reqwest::Client,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Announce this node and learn the hub's id.
    pub async fn register(&self, info: &NodeInfo) -> Result<String, TransportError> {
        let url = format!("{}/api/register", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(info)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("{url} returned {status}: {body}")));
        }

        let body: RegisterResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(body.hub_id)
    }
}
