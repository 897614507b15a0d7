//! HTTP version source.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use super::{BoxFuture, VersionSource};
use crate::error::{PatchError, PatchResult};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches the version descriptor with a GET request.
#[derive(Debug, Clone)]
pub struct HttpVersionSource {
    client: Client,
}

impl HttpVersionSource {
    /// Create a source with the default timeout.
    pub fn new() -> PatchResult<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a source with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> PatchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("chunkpatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PatchError::transport("http client", e.to_string()))?;
        Ok(Self { client })
    }

    /// Use an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl VersionSource for HttpVersionSource {
    fn fetch_version(&self, url: &str) -> BoxFuture<'_, PatchResult<Vec<u8>>> {
        let url = url.to_string();
        Box::pin(async move {
            debug!(url = %url, "Fetching version descriptor");

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| PatchError::transport(&url, e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(PatchError::transport(&url, format!("HTTP {}", status)));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| PatchError::transport(&url, e.to_string()))?;

            debug!(url = %url, bytes = body.len(), "Fetched version descriptor");
            Ok(body.to_vec())
        })
    }
}
