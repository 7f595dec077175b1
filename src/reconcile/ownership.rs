//! Recursive ownership remapping
//!
//! An [`OwnershipChange`] is a pure description: a subtree, the ids it
//! should end up with, and optionally the ids an entry must currently carry
//! to be touched at all. [`remap_ownership`] applies it through an
//! [`OwnershipFs`], so the walk can be exercised against [`SimulatedFs`].

use crate::SetupError;
use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Numeric owner of a filesystem entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// Desired ownership of a subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChange {
    pub root: PathBuf,
    pub uid: u32,
    pub gid: u32,
    /// Only entries currently owned by this uid get the new uid
    pub prev_uid: Option<u32>,
    /// Only entries currently in this gid get the new gid
    pub prev_gid: Option<u32>,
}

impl OwnershipChange {
    pub fn new(root: impl AsRef<Path>, uid: u32, gid: u32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            uid,
            gid,
            prev_uid: None,
            prev_gid: None,
        }
    }

    /// Restrict the change to entries currently owned by `prev`
    pub fn only_from(mut self, prev: Owner) -> Self {
        self.prev_uid = Some(prev.uid);
        self.prev_gid = Some(prev.gid);
        self
    }

    /// The (uid, gid) to set on an entry with `current` ownership.
    /// `None` in either slot leaves that id alone; `None` overall means the
    /// entry is already converged or belongs to someone else.
    pub fn plan(&self, current: Owner) -> Option<(Option<u32>, Option<u32>)> {
        let uid = (self.prev_uid.is_none_or(|p| p == current.uid) && current.uid != self.uid)
            .then_some(self.uid);
        let gid = (self.prev_gid.is_none_or(|p| p == current.gid) && current.gid != self.gid)
            .then_some(self.gid);
        if uid.is_none() && gid.is_none() {
            None
        } else {
            Some((uid, gid))
        }
    }
}

/// Filesystem operations needed for ownership reconciliation
pub trait OwnershipFs: Send + Sync {
    /// `root` followed by every descendant, without following symlinks
    fn walk(&self, root: &Path) -> Result<Vec<PathBuf>, SetupError>;

    fn owner(&self, path: &Path) -> Result<Owner, SetupError>;

    /// Change ownership of `path` itself (not a symlink's target)
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), SetupError>;
}

/// Apply `change` to every entry of its subtree.
///
/// Returns the number of entries whose ownership changed; a second call with
/// the same change returns zero.
pub fn remap_ownership(change: &OwnershipChange, fs: &dyn OwnershipFs) -> Result<usize, SetupError> {
    let mut changed = 0;
    for path in fs.walk(&change.root)? {
        let current = fs.owner(&path)?;
        if let Some((uid, gid)) = change.plan(current) {
            fs.chown(&path, uid, gid)?;
            changed += 1;
        }
    }
    info!(
        "Ownership of {} reconciled to {}:{} ({} entries changed)",
        change.root.display(),
        change.uid,
        change.gid,
        changed
    );
    Ok(changed)
}

/// The real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFs;

impl OwnershipFs for HostFs {
    fn walk(&self, root: &Path) -> Result<Vec<PathBuf>, SetupError> {
        if std::fs::symlink_metadata(root).is_err() {
            return Ok(Vec::new());
        }
        WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .map(|entry| {
                entry
                    .map(|e| e.into_path())
                    .map_err(|e| SetupError::resource(root, e.to_string()))
            })
            .collect()
    }

    fn owner(&self, path: &Path) -> Result<Owner, SetupError> {
        let meta = std::fs::symlink_metadata(path)
            .map_err(|e| SetupError::resource(path, e.to_string()))?;
        Ok(Owner::new(meta.uid(), meta.gid()))
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), SetupError> {
        debug!("chown {:?}:{:?} {}", uid, gid, path.display());
        std::os::unix::fs::lchown(path, uid, gid)
            .map_err(|e| SetupError::resource(path, format!("chown failed: {}", e)))
    }
}

/// In-memory filesystem for testing ownership logic
///
/// Unknown paths are reported as owned by root and are added on first chown.
#[derive(Debug, Default)]
pub struct SimulatedFs {
    entries: Mutex<BTreeMap<PathBuf, Owner>>,
    chowns: Mutex<Vec<(PathBuf, Option<u32>, Option<u32>)>>,
}

impl SimulatedFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry with the given owner
    pub fn with_entry(self, path: impl AsRef<Path>, uid: u32, gid: u32) -> Self {
        self.lock_entries()
            .insert(path.as_ref().to_path_buf(), Owner::new(uid, gid));
        self
    }

    /// Current owner of a simulated entry
    pub fn owner_of(&self, path: impl AsRef<Path>) -> Option<Owner> {
        self.lock_entries().get(path.as_ref()).copied()
    }

    /// Every chown performed so far
    pub fn chowns(&self) -> Vec<(PathBuf, Option<u32>, Option<u32>)> {
        match self.chowns.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Owner>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OwnershipFs for SimulatedFs {
    fn walk(&self, root: &Path) -> Result<Vec<PathBuf>, SetupError> {
        let entries = self.lock_entries();
        let mut paths: Vec<PathBuf> = entries
            .keys()
            .filter(|p| p.starts_with(root) && p.as_path() != root)
            .cloned()
            .collect();
        paths.insert(0, root.to_path_buf());
        Ok(paths)
    }

    fn owner(&self, path: &Path) -> Result<Owner, SetupError> {
        Ok(self.lock_entries().get(path).copied().unwrap_or_default())
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), SetupError> {
        let mut entries = self.lock_entries();
        let owner = entries.entry(path.to_path_buf()).or_default();
        if let Some(uid) = uid {
            owner.uid = uid;
        }
        if let Some(gid) = gid {
            owner.gid = gid;
        }
        match self.chowns.lock() {
            Ok(mut guard) => guard.push((path.to_path_buf(), uid, gid)),
            Err(poisoned) => poisoned.into_inner().push((path.to_path_buf(), uid, gid)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> SimulatedFs {
        SimulatedFs::new()
            .with_entry("/etc/slurm", 10, 10)
            .with_entry("/etc/slurm/slurm.conf", 10, 10)
            .with_entry("/etc/slurm/gres.conf", 20, 10)
            .with_entry("/etc/slurm/keys", 30, 30)
            .with_entry("/etc/slurm/keys/jwt.key", 10, 30)
            .with_entry("/etc/other", 10, 10)
    }

    #[test]
    fn test_guarded_remap_only_touches_previous_owner() {
        let fs = tree();
        let change = OwnershipChange::new("/etc/slurm", 99, 98).only_from(Owner::new(10, 10));

        remap_ownership(&change, &fs).unwrap();

        assert_eq!(fs.owner_of("/etc/slurm"), Some(Owner::new(99, 98)));
        assert_eq!(fs.owner_of("/etc/slurm/slurm.conf"), Some(Owner::new(99, 98)));
        // uid 20 untouched, gid 10 migrated independently
        assert_eq!(fs.owner_of("/etc/slurm/gres.conf"), Some(Owner::new(20, 98)));
        assert_eq!(fs.owner_of("/etc/slurm/keys"), Some(Owner::new(30, 30)));
        assert_eq!(fs.owner_of("/etc/slurm/keys/jwt.key"), Some(Owner::new(99, 30)));
        // outside the subtree
        assert_eq!(fs.owner_of("/etc/other"), Some(Owner::new(10, 10)));
    }

    #[test]
    fn test_remap_is_idempotent() {
        let fs = tree();
        let change = OwnershipChange::new("/etc/slurm", 99, 98).only_from(Owner::new(10, 10));

        assert_eq!(remap_ownership(&change, &fs).unwrap(), 4);
        let chowns = fs.chowns().len();

        assert_eq!(remap_ownership(&change, &fs).unwrap(), 0);
        assert_eq!(fs.chowns().len(), chowns);
    }

    #[test]
    fn test_unguarded_remap_takes_everything() {
        let fs = tree();
        let change = OwnershipChange::new("/etc/slurm/keys", 99, 98);
        assert_eq!(remap_ownership(&change, &fs).unwrap(), 2);
        assert_eq!(fs.owner_of("/etc/slurm/keys"), Some(Owner::new(99, 98)));
    }

    #[test]
    fn test_plan_skips_third_party_owner() {
        let change = OwnershipChange::new("/x", 99, 99).only_from(Owner::new(10, 10));
        assert_eq!(change.plan(Owner::new(20, 30)), None);
        assert_eq!(change.plan(Owner::new(10, 30)), Some((Some(99), None)));
        assert_eq!(change.plan(Owner::new(99, 99)), None);
    }

    #[test]
    fn test_host_fs_walk_includes_root_and_descendants() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();
        std::fs::write(temp.path().join("a/b/file"), "x").unwrap();

        let paths = HostFs.walk(temp.path()).unwrap();
        assert_eq!(paths[0], temp.path());
        assert_eq!(paths.len(), 4);

        let own = HostFs.owner(temp.path()).unwrap();
        // chown to our own ids is always permitted
        HostFs
            .chown(&temp.path().join("a/b/file"), Some(own.uid), Some(own.gid))
            .unwrap();
    }
}
