//! Standard node paths
//!
//! Every host path the setup touches. All of them hang off a root directory
//! so a whole run can be pointed at a scratch tree.

use std::path::{Path, PathBuf};

/// Cluster directory shared between nodes
pub const SLURM_DIR: &str = "slurm";

/// Installation prefix of the Slurm binaries
pub const PREFIX_DIR: &str = "usr/local";

/// Node paths, rooted at `root` (default: /)
#[derive(Debug, Clone)]
pub struct NodePaths {
    pub root: PathBuf,
    /// Log directory override from config (`slurm_log_dir`)
    log_dir: Option<PathBuf>,
}

impl Default for NodePaths {
    fn default() -> Self {
        Self::new()
    }
}

impl NodePaths {
    /// Create with the real filesystem root
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Create with a custom root (useful for testing)
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            log_dir: None,
        }
    }

    /// Use a configured log directory instead of /var/log/slurm
    pub fn with_log_dir(mut self, log_dir: impl AsRef<Path>) -> Self {
        let log_dir = log_dir.as_ref();
        self.log_dir = Some(self.rooted(log_dir));
        self
    }

    fn rooted(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    // ==================== Cluster Directories ====================

    /// /slurm
    pub fn slurm(&self) -> PathBuf {
        self.rooted(SLURM_DIR)
    }

    /// /slurm/scripts
    pub fn scripts(&self) -> PathBuf {
        self.slurm().join("scripts")
    }

    /// /slurm/custom_scripts - operator hook scripts, one subdirectory per category
    pub fn custom_scripts(&self) -> PathBuf {
        self.slurm().join("custom_scripts")
    }

    /// /slurm/scripts/config.yaml - persisted configuration snapshot
    pub fn config_snapshot(&self) -> PathBuf {
        self.scripts().join("config.yaml")
    }

    /// /home
    pub fn home(&self) -> PathBuf {
        self.rooted("home")
    }

    /// /opt/apps
    pub fn apps(&self) -> PathBuf {
        self.rooted("opt/apps")
    }

    /// /etc/munge
    pub fn munge(&self) -> PathBuf {
        self.rooted("etc/munge")
    }

    /// /var/log/slurm unless overridden
    pub fn log(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.rooted("var/log/slurm"))
    }

    /// Setup log file, referenced by the failure banner
    pub fn setup_log(&self) -> PathBuf {
        self.log().join("setup.log")
    }

    // ==================== Slurm Installation ====================

    /// /usr/local
    pub fn prefix(&self) -> PathBuf {
        self.rooted(PREFIX_DIR)
    }

    /// /usr/local/etc/slurm
    pub fn slurm_etc(&self) -> PathBuf {
        self.prefix().join("etc/slurm")
    }

    /// /var/spool/slurm - controller state
    pub fn state(&self) -> PathBuf {
        self.rooted("var/spool/slurm")
    }

    /// /var/lib/slurm - home directory of the slurm account
    pub fn slurm_home(&self) -> PathBuf {
        self.rooted("var/lib/slurm")
    }

    /// /var/spool/slurmd
    pub fn slurmd_spool(&self) -> PathBuf {
        self.rooted("var/spool/slurmd")
    }

    /// Binary under the installation prefix
    pub fn slurm_bin(&self, name: &str) -> PathBuf {
        self.prefix().join("bin").join(name)
    }

    // ==================== System Files ====================

    /// /etc/motd
    pub fn motd(&self) -> PathBuf {
        self.rooted("etc/motd")
    }

    /// /etc/fstab
    pub fn fstab(&self) -> PathBuf {
        self.rooted("etc/fstab")
    }

    /// /etc/slurm
    pub fn etc_slurm_link(&self) -> PathBuf {
        self.rooted("etc/slurm")
    }

    /// /etc/sudoers.d/slurm
    pub fn sudoers(&self) -> PathBuf {
        self.rooted("etc/sudoers.d/slurm")
    }

    /// /etc/sysconfig
    pub fn sysconfig(&self) -> PathBuf {
        self.rooted("etc/sysconfig")
    }

    /// /etc/default
    pub fn etc_default(&self) -> PathBuf {
        self.rooted("etc/default")
    }

    /// /etc/nsswitch.conf
    pub fn nsswitch(&self) -> PathBuf {
        self.rooted("etc/nsswitch.conf")
    }

    /// /usr/lib64 - NSS module directory
    pub fn lib64(&self) -> PathBuf {
        self.rooted("usr/lib64")
    }

    /// /etc/exports.d/slurm.exports
    pub fn nfs_exports(&self) -> PathBuf {
        self.rooted("etc/exports.d/slurm.exports")
    }

    /// /etc/my.cnf.d, or /etc/mysql/conf.d on Debian derivatives
    pub fn mysql_conf_dir(&self) -> PathBuf {
        let rhel = self.rooted("etc/my.cnf.d");
        if rhel.exists() {
            rhel
        } else {
            self.rooted("etc/mysql/conf.d")
        }
    }

    /// /etc/google-cloud-ops-agent/config.yaml
    pub fn ops_agent_config(&self) -> PathBuf {
        self.rooted("etc/google-cloud-ops-agent/config.yaml")
    }

    /// Resolve an arbitrary absolute host path under the root
    pub fn host(&self, path: impl AsRef<Path>) -> PathBuf {
        self.rooted(path)
    }
}
