//! Mock cloud collaborators for testing
//!
//! Provides an in-memory metadata server and script store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

use super::{MetadataService, ScriptFile, ScriptStore};
use crate::SetupError;
use crate::scripts::ScriptCategory;

/// Mock metadata server
///
/// # Example
/// ```
/// use slurm_node_setup::cloud::mock::MockMetadata;
///
/// let md = MockMetadata::new()
///     .with_hostname("hpc-compute-3")
///     .with_attribute("slurmd_feature", "gpu");
/// ```
pub struct MockMetadata {
    hostname: String,
    attributes: HashMap<String, String>,
    token: String,
}

impl MockMetadata {
    pub fn new() -> Self {
        Self {
            hostname: "localhost".to_string(),
            attributes: HashMap::new(),
            token: "test-token".to_string(),
        }
    }

    /// Set the instance hostname
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    /// Set a custom instance attribute
    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }
}

impl Default for MockMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataService for MockMetadata {
    async fn hostname(&self) -> Result<String, SetupError> {
        Ok(self.hostname.clone())
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>, SetupError> {
        Ok(self.attributes.get(name).cloned())
    }

    async fn access_token(&self) -> Result<String, SetupError> {
        Ok(self.token.clone())
    }
}

/// Mock script store
#[derive(Default)]
pub struct MockScriptStore {
    scripts: HashMap<ScriptCategory, Vec<ScriptFile>>,
}

impl MockScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a script under a category
    pub fn with_script(
        mut self,
        category: ScriptCategory,
        relative_path: &str,
        content: impl AsRef<[u8]>,
    ) -> Self {
        self.scripts.entry(category).or_default().push(ScriptFile {
            relative_path: PathBuf::from(relative_path),
            content: content.as_ref().to_vec(),
        });
        self
    }
}

#[async_trait]
impl ScriptStore for MockScriptStore {
    async fn fetch_scripts(&self, category: ScriptCategory) -> Result<Vec<ScriptFile>, SetupError> {
        Ok(self.scripts.get(&category).cloned().unwrap_or_default())
    }
}
