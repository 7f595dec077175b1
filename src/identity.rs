//! Service account lookups
//!
//! Numeric ids of the accounts the setup hands files to (`slurm`, `munge`).

use crate::SetupError;
use crate::reconcile::OwnershipFs;
use nix::unistd::{Group, User};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;

/// Account owning the cluster directories
pub const SLURM_USER: &str = "slurm";

/// Account owning the munge key
pub const MUNGE_USER: &str = "munge";

/// Trait for user/group database lookups
pub trait IdentityDb: Send + Sync {
    fn user_id(&self, name: &str) -> Result<u32, SetupError>;

    fn group_id(&self, name: &str) -> Result<u32, SetupError>;
}

/// The host's passwd/group databases
#[derive(Debug, Default, Clone, Copy)]
pub struct HostIdentities;

impl IdentityDb for HostIdentities {
    fn user_id(&self, name: &str) -> Result<u32, SetupError> {
        User::from_name(name)
            .map_err(|e| SetupError::InvalidData(format!("cannot look up user {}: {}", name, e)))?
            .map(|user| user.uid.as_raw())
            .ok_or_else(|| SetupError::InvalidData(format!("no such user: {}", name)))
    }

    fn group_id(&self, name: &str) -> Result<u32, SetupError> {
        Group::from_name(name)
            .map_err(|e| SetupError::InvalidData(format!("cannot look up group {}: {}", name, e)))?
            .map(|group| group.gid.as_raw())
            .ok_or_else(|| SetupError::InvalidData(format!("no such group: {}", name)))
    }
}

/// Fixed identity table for testing
#[derive(Debug, Default, Clone)]
pub struct StaticIdentities {
    users: HashMap<String, u32>,
    groups: HashMap<String, u32>,
}

impl StaticIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user and a same-named group
    pub fn with_account(mut self, name: &str, uid: u32, gid: u32) -> Self {
        self.users.insert(name.to_string(), uid);
        self.groups.insert(name.to_string(), gid);
        self
    }
}

impl IdentityDb for StaticIdentities {
    fn user_id(&self, name: &str) -> Result<u32, SetupError> {
        self.users
            .get(name)
            .copied()
            .ok_or_else(|| SetupError::InvalidData(format!("no such user: {}", name)))
    }

    fn group_id(&self, name: &str) -> Result<u32, SetupError> {
        self.groups
            .get(name)
            .copied()
            .ok_or_else(|| SetupError::InvalidData(format!("no such group: {}", name)))
    }
}

/// Hand `path` to the account `name` (user and same-named group), then
/// optionally set its permission bits
pub async fn chown_account(
    ids: &dyn IdentityDb,
    fs: &dyn OwnershipFs,
    name: &str,
    path: &Path,
    mode: Option<u32>,
) -> Result<(), SetupError> {
    let uid = ids.user_id(name)?;
    let gid = ids.group_id(name)?;
    debug!("Handing {} to {} ({}:{})", path.display(), name, uid, gid);
    fs.chown(path, Some(uid), Some(gid))?;

    if let Some(mode) = mode {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| SetupError::resource(path, format!("chmod {:o} failed: {}", mode, e)))?;
    }
    Ok(())
}
