//! Mount table entries
//!
//! The mount table is only ever appended to. An entry is added when no line
//! matches the constructed entry exactly (modulo whitespace).

use crate::SetupError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// What kind of mount an entry describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// A block device or network filesystem of the given type
    Filesystem(String),
    /// A bind mount of another directory
    Bind,
}

/// A line in /etc/fstab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub kind: MountKind,
    pub options: Option<String>,
}

impl FstabEntry {
    pub fn filesystem(
        device: impl Into<String>,
        mount_point: impl AsRef<Path>,
        fs_type: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            mount_point: mount_point.as_ref().to_path_buf(),
            kind: MountKind::Filesystem(fs_type.into()),
            options: None,
        }
    }

    pub fn bind(source: impl AsRef<Path>, mount_point: impl AsRef<Path>) -> Self {
        Self {
            device: source.as_ref().display().to_string(),
            mount_point: mount_point.as_ref().to_path_buf(),
            kind: MountKind::Bind,
            options: None,
        }
    }

    pub fn with_options(mut self, options: Option<String>) -> Self {
        self.options = options;
        self
    }

    /// The full fstab line for this entry, without a trailing newline
    pub fn line(&self) -> String {
        match &self.kind {
            MountKind::Filesystem(fs_type) => format!(
                "{} {} {} {} 0 0",
                self.device,
                self.mount_point.display(),
                fs_type,
                self.options.as_deref().unwrap_or("defaults")
            ),
            MountKind::Bind => format!(
                "{} {} none bind 0 0",
                self.device,
                self.mount_point.display()
            ),
        }
    }

    fn matches(&self, line: &str) -> bool {
        let wanted = self.line();
        line.split_whitespace().eq(wanted.split_whitespace())
    }
}

/// Append `entry` to the mount table unless an identical line exists.
///
/// Returns whether the table was changed.
pub async fn ensure_fstab_entry(fstab: &Path, entry: &FstabEntry) -> Result<bool, SetupError> {
    let existing = match fs::read_to_string(fstab).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(SetupError::resource(fstab, e.to_string())),
    };

    if existing.lines().any(|line| entry.matches(line)) {
        debug!("fstab already has entry: {}", entry.line());
        return Ok(false);
    }

    let mut addition = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        addition.push('\n');
    }
    addition.push_str(&entry.line());
    addition.push('\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(fstab)
        .await
        .map_err(|e| SetupError::resource(fstab, e.to_string()))?;
    file.write_all(addition.as_bytes()).await?;
    file.flush().await?;

    info!("Added fstab entry: {}", entry.line());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_entry_lines() {
        let disk = FstabEntry::filesystem("/dev/disk/by-id/google-state", "/var/spool/slurm", "ext4");
        assert_eq!(
            disk.line(),
            "/dev/disk/by-id/google-state /var/spool/slurm ext4 defaults 0 0"
        );

        let bind = FstabEntry::bind("/var/spool/slurm/munge", "/etc/munge");
        assert_eq!(bind.line(), "/var/spool/slurm/munge /etc/munge none bind 0 0");

        let nfs = FstabEntry::filesystem("10.0.0.2:/home", "/home", "nfs")
            .with_options(Some("hard,intr".to_string()));
        assert_eq!(nfs.line(), "10.0.0.2:/home /home nfs hard,intr 0 0");
    }

    #[tokio::test]
    async fn test_ensure_entry_twice_yields_one_line() {
        let temp = TempDir::new().unwrap();
        let fstab = temp.path().join("fstab");
        fs::write(&fstab, "UUID=abc / xfs defaults 0 0\n").await.unwrap();

        let entry = FstabEntry::filesystem("/dev/sdb", "/var/spool/slurm", "ext4");
        assert!(ensure_fstab_entry(&fstab, &entry).await.unwrap());
        assert!(!ensure_fstab_entry(&fstab, &entry).await.unwrap());

        let content = fs::read_to_string(&fstab).await.unwrap();
        assert_eq!(content.lines().filter(|l| entry.matches(l)).count(), 1);
        assert!(content.starts_with("UUID=abc / xfs defaults 0 0\n"));
    }

    #[tokio::test]
    async fn test_ensure_entry_tolerates_whitespace_and_missing_newline() {
        let temp = TempDir::new().unwrap();
        let fstab = temp.path().join("fstab");
        fs::write(&fstab, "/src\t/dst   none bind 0 0").await.unwrap();

        let entry = FstabEntry::bind("/src", "/dst");
        assert!(!ensure_fstab_entry(&fstab, &entry).await.unwrap());

        let other = FstabEntry::bind("/src2", "/dst2");
        assert!(ensure_fstab_entry(&fstab, &other).await.unwrap());
        let content = fs::read_to_string(&fstab).await.unwrap();
        assert_eq!(content, "/src\t/dst   none bind 0 0\n/src2 /dst2 none bind 0 0\n");
    }

    #[tokio::test]
    async fn test_ensure_entry_creates_missing_table() {
        let temp = TempDir::new().unwrap();
        let fstab = temp.path().join("fstab");
        let entry = FstabEntry::bind("/a", "/b");
        assert!(ensure_fstab_entry(&fstab, &entry).await.unwrap());
        assert_eq!(fs::read_to_string(&fstab).await.unwrap(), "/a /b none bind 0 0\n");
    }
}
