//! GCE metadata server client
//!
//! <https://cloud.google.com/compute/docs/metadata/overview>

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::SetupError;

/// GCE metadata service base URL
const GCE_METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

/// Required header for GCE metadata requests
const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR_VALUE: &str = "Google";

/// Trait for instance metadata lookups
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Short host name of this instance
    async fn hostname(&self) -> Result<String, SetupError>;

    /// A custom instance attribute; `None` when it is not set
    async fn attribute(&self, name: &str) -> Result<Option<String>, SetupError>;

    /// OAuth access token of the default service account
    async fn access_token(&self) -> Result<String, SetupError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Metadata server client
pub struct GceMetadata {
    client: Client,
    base_url: String,
}

impl GceMetadata {
    pub fn new() -> Result<Self, SetupError> {
        Self::with_base_url(GCE_METADATA_URL)
    }

    /// Create with a custom base URL (for testing)
    pub fn with_base_url(base_url: &str) -> Result<Self, SetupError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch a metadata path; `None` on 404
    async fn fetch(&self, path: &str) -> Result<Option<String>, SetupError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("Fetching GCE metadata: {}", url);

        let response = self
            .client
            .get(&url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await?)),
            status => Err(SetupError::Http(format!("Failed to fetch {}: {}", path, status))),
        }
    }
}

#[async_trait]
impl MetadataService for GceMetadata {
    async fn hostname(&self) -> Result<String, SetupError> {
        let fqdn = self
            .fetch("instance/hostname")
            .await?
            .ok_or_else(|| SetupError::Http("instance/hostname not found".to_string()))?;
        Ok(fqdn.split('.').next().unwrap_or_default().to_string())
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>, SetupError> {
        self.fetch(&format!("instance/attributes/{}", name)).await
    }

    async fn access_token(&self) -> Result<String, SetupError> {
        let body = self
            .fetch("instance/service-accounts/default/token")
            .await?
            .ok_or_else(|| SetupError::Http("no default service account".to_string()))?;
        let token: TokenResponse = serde_json::from_str(&body)?;
        Ok(token.access_token)
    }
}
