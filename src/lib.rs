//! slurm-node-setup library
//!
//! Bootstraps a Slurm cluster node into its role (controller, compute or
//! login) by reconciling local OS state against the cluster configuration
//! published to a bucket.
//!
//! # Design Principles
//!
//! - **Idempotent**: every reconciliation step checks before it mutates, so
//!   re-running the setup on a provisioned node is safe
//! - **Fail fast**: the first failing step aborts the run and is reported
//!   through the login banner
//! - **Explicit collaborators**: commands, metadata, scripts, identities and
//!   ownership changes all go through traits bundled in [`Host`]

pub mod cloud;
pub mod config;
pub mod exec;
pub mod identity;
pub mod paths;
pub mod reconcile;
pub mod scripts;
pub mod setup;
pub mod status;

mod error;

pub use error::SetupError;
pub use setup::{Bootstrap, SetupContext, SetupReport, SetupState};

use cloud::{MetadataService, ScriptStore};
use exec::{CommandRunner, SystemRunner};
use identity::{HostIdentities, IdentityDb};
use reconcile::{HostFs, OwnershipFs};
use std::path::Path;
use std::sync::Arc;

/// External collaborators of a setup run
#[derive(Clone)]
pub struct Host {
    pub runner: Arc<dyn CommandRunner>,
    pub metadata: Arc<dyn MetadataService>,
    pub scripts: Arc<dyn ScriptStore>,
    pub identities: Arc<dyn IdentityDb>,
    pub fs: Arc<dyn OwnershipFs>,
}

impl Host {
    /// The real host: processes, passwd/group and lchown
    pub fn system(metadata: Arc<dyn MetadataService>, scripts: Arc<dyn ScriptStore>) -> Self {
        Self {
            runner: Arc::new(SystemRunner::new()),
            metadata,
            scripts,
            identities: Arc::new(HostIdentities),
            fs: Arc::new(HostFs),
        }
    }

    /// Hand `path` to the slurm account
    pub async fn chown_slurm(&self, path: &Path, mode: Option<u32>) -> Result<(), SetupError> {
        identity::chown_account(
            &*self.identities,
            &*self.fs,
            identity::SLURM_USER,
            path,
            mode,
        )
        .await
    }
}
