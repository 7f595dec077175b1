//! Cluster bucket client
//!
//! Reads `config.yaml` and the operator hook scripts from a Cloud Storage
//! bucket through the JSON API, authenticated with the instance's default
//! service account.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{MetadataService, ScriptFile, ScriptStore};
use crate::SetupError;
use crate::config::acquire::classify_document;
use crate::config::{ConfigSource, FetchOutcome};
use crate::scripts::ScriptCategory;

/// Cloud Storage JSON API endpoint
const STORAGE_API_URL: &str = "https://storage.googleapis.com";

/// Instance attribute holding the bucket URI when none is given explicitly
pub const BUCKET_ATTRIBUTE: &str = "slurm_bucket_path";

/// Instance attribute holding the node role
pub const ROLE_ATTRIBUTE: &str = "slurm_instance_role";

#[derive(Debug, Default, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

/// Split `gs://bucket/some/prefix` into (`bucket`, `some/prefix`)
pub fn parse_bucket_uri(uri: &str) -> Result<(String, String), SetupError> {
    let rest = uri.strip_prefix("gs://").unwrap_or(uri);
    let (bucket, prefix) = match rest.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        return Err(SetupError::Config(format!("invalid bucket URI: {:?}", uri)));
    }
    Ok((bucket.to_string(), prefix.to_string()))
}

/// Bucket-backed config source and script store
pub struct BucketStore {
    client: Client,
    api_base: String,
    bucket: String,
    prefix: String,
    metadata: Arc<dyn MetadataService>,
}

impl BucketStore {
    /// Create for an explicit `gs://` URI
    pub fn new(uri: &str, metadata: Arc<dyn MetadataService>) -> Result<Self, SetupError> {
        let (bucket, prefix) = parse_bucket_uri(uri)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            api_base: STORAGE_API_URL.to_string(),
            bucket,
            prefix,
            metadata,
        })
    }

    /// Create from the bucket URI published in instance metadata
    pub async fn from_metadata(metadata: Arc<dyn MetadataService>) -> Result<Self, SetupError> {
        let uri = metadata.attribute(BUCKET_ATTRIBUTE).await?.ok_or_else(|| {
            SetupError::Config(format!("instance attribute {} is not set", BUCKET_ATTRIBUTE))
        })?;
        info!("Using cluster bucket {}", uri);
        Self::new(uri.trim(), metadata)
    }

    /// Use a custom API endpoint (for testing)
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn object_name(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }

    fn objects_url(&self) -> Result<Url, SetupError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| SetupError::Config(format!("invalid storage endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| SetupError::Config("storage endpoint cannot be a base".to_string()))?
            .extend(["storage", "v1", "b", &self.bucket, "o"]);
        Ok(url)
    }

    /// Download an object; `None` when it does not exist
    async fn get_object(&self, name: &str) -> Result<Option<Vec<u8>>, SetupError> {
        let mut url = self.objects_url()?;
        url.path_segments_mut()
            .map_err(|_| SetupError::Config("storage endpoint cannot be a base".to_string()))?
            .push(name);
        debug!("Downloading gs://{}/{}", self.bucket, name);

        let token = self.metadata.access_token().await?;
        let response = self
            .client
            .get(url)
            .query(&[("alt", "media")])
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => Err(SetupError::Http(format!(
                "Failed to download gs://{}/{}: {}",
                self.bucket, name, status
            ))),
        }
    }

    /// Names of all objects under `prefix`
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, SetupError> {
        let url = self.objects_url()?;
        let token = self.metadata.access_token().await?;
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(url.clone())
                .query(&[("prefix", prefix)])
                .bearer_auth(&token);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(SetupError::Http(format!(
                    "Failed to list gs://{}/{}: {}",
                    self.bucket,
                    prefix,
                    response.status()
                )));
            }
            let page: ObjectList = serde_json::from_str(&response.text().await?)?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(names)
    }
}

#[async_trait]
impl ConfigSource for BucketStore {
    fn name(&self) -> &'static str {
        "Bucket"
    }

    async fn fetch(&self) -> FetchOutcome {
        let raw = match self.get_object(&self.object_name("config.yaml")).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return FetchOutcome::NotReady(format!(
                    "gs://{}/{} does not exist",
                    self.bucket,
                    self.object_name("config.yaml")
                ));
            }
            Err(e) => return FetchOutcome::Fatal(e.to_string()),
        };

        let raw = match String::from_utf8(raw) {
            Ok(raw) => raw,
            Err(e) => return FetchOutcome::NotReady(format!("config.yaml is not UTF-8: {}", e)),
        };

        let mut config = match classify_document(&raw) {
            FetchOutcome::Ready(config) => config,
            other => return other,
        };

        if config.instance_role.is_unset() {
            match self.metadata.attribute(ROLE_ATTRIBUTE).await {
                Ok(Some(role)) => config.instance_role = role.trim().to_string().into(),
                Ok(None) => {}
                Err(e) => return FetchOutcome::Fatal(e.to_string()),
            }
        }

        FetchOutcome::Ready(config)
    }
}

#[async_trait]
impl ScriptStore for BucketStore {
    async fn fetch_scripts(&self, category: ScriptCategory) -> Result<Vec<ScriptFile>, SetupError> {
        let dir = self.object_name(&format!("custom_scripts/{}/", category.dir_name()));
        let mut scripts = Vec::new();

        for name in self.list_objects(&dir).await? {
            let Some(relative) = name.strip_prefix(&dir) else {
                continue;
            };
            if relative.is_empty() || relative.ends_with('/') {
                continue;
            }
            let Some(content) = self.get_object(&name).await? else {
                continue;
            };
            scripts.push(ScriptFile {
                relative_path: PathBuf::from(relative),
                content,
            });
        }

        debug!("Fetched {} {} scripts", scripts.len(), category);
        Ok(scripts)
    }
}
