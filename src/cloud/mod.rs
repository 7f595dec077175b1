//! Cloud collaborators
//!
//! The instance metadata server and the cluster bucket. The bucket is both
//! the configuration store and the home of operator hook scripts.

pub mod bucket;
pub mod metadata;
pub mod mock;

pub use bucket::BucketStore;
pub use metadata::{GceMetadata, MetadataService};

use crate::SetupError;
use crate::scripts::ScriptCategory;
use async_trait::async_trait;
use std::path::PathBuf;

/// A hook script fetched from the script store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    /// Path relative to the category directory (e.g. `00-mounts.sh`)
    pub relative_path: PathBuf,
    /// Raw object bytes; hooks may be compiled binaries
    pub content: Vec<u8>,
}

/// Trait for stores that publish operator hook scripts
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// All scripts published for one category
    async fn fetch_scripts(&self, category: ScriptCategory) -> Result<Vec<ScriptFile>, SetupError>;
}
