//! Cluster configuration parsing and types
//!
//! Handles parsing of the `config.yaml` document published to the cluster
//! bucket. A parsed [`Configuration`] is an immutable snapshot for the rest
//! of the run.

pub mod acquire;
pub mod mock;

pub use acquire::{ConfigAcquirer, ConfigSource, FetchOutcome};

use crate::SetupError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Hook timeout used when a category has no configured value
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default slurmctld port range advertised to slurmd and sackd
pub const DEFAULT_CONTROL_PORT: &str = "6820-6830";

/// Functional identity of this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeRole {
    Controller,
    Compute,
    Login,
    /// Any other value (including none at all), kept verbatim for reporting
    Unrecognized(String),
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::Unrecognized(String::new())
    }
}

impl NodeRole {
    /// No role was given at all
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unrecognized(s) if s.is_empty())
    }
}

impl From<String> for NodeRole {
    fn from(s: String) -> Self {
        match s.as_str() {
            "controller" => Self::Controller,
            "compute" => Self::Compute,
            "login" => Self::Login,
            _ => Self::Unrecognized(s),
        }
    }
}

impl From<NodeRole> for String {
    fn from(role: NodeRole) -> Self {
        role.to_string()
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Controller => write!(f, "controller"),
            NodeRole::Compute => write!(f, "compute"),
            NodeRole::Login => write!(f, "login"),
            NodeRole::Unrecognized(other) => write!(f, "{}", other),
        }
    }
}

/// Parsed `config.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Cluster name registered with the accounting database
    pub slurm_cluster_name: String,

    /// Role of this instance; filled from instance metadata when absent
    pub instance_role: NodeRole,

    pub slurm_control_host: Option<String>,
    pub slurm_control_addr: Option<String>,
    pub slurm_control_host_port: Option<String>,

    /// Hook timeouts in seconds; zero or negative disables the timeout
    pub controller_startup_scripts_timeout: Option<i64>,
    pub compute_startup_scripts_timeout: Option<i64>,
    pub login_startup_scripts_timeout: Option<i64>,

    /// Controller lives outside this deployment
    pub hybrid: bool,
    pub hybrid_conf: Option<HybridConf>,

    pub controller_state_disk: Option<StateDisk>,

    /// Accounting database credentials are managed externally
    pub cloudsql_secret: Option<String>,

    pub slurm_log_dir: Option<PathBuf>,

    #[serde(default)]
    pub network_storage: Vec<NetworkStorage>,

    #[serde(default)]
    pub login_network_storage: Vec<NetworkStorage>,

    /// Keys this tool does not read (nodesets, partitions, ...), kept so the
    /// persisted snapshot matches the published document
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

/// Hybrid deployment overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConf {
    pub slurm_uid: Option<u32>,
    pub slurm_gid: Option<u32>,
}

/// Persistent disk holding controller state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDisk {
    pub device_name: Option<String>,
}

/// Network filesystem mounted on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStorage {
    pub server_ip: String,
    pub remote_mount: String,
    pub local_mount: PathBuf,
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
    #[serde(default)]
    pub mount_options: Option<String>,
}

fn default_fs_type() -> String {
    "nfs".to_string()
}

impl Configuration {
    /// Parse configuration from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Reject documents that parse but are not usable yet
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.slurm_cluster_name.trim().is_empty() {
            return Err(SetupError::ConfigNotReady(
                "slurm_cluster_name is missing".to_string(),
            ));
        }
        Ok(())
    }

    /// Render the snapshot back to YAML for persisting on the node
    pub fn to_yaml(&self) -> Result<String, SetupError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Controller host name, falling back to `<cluster>-controller`
    pub fn control_host(&self) -> String {
        self.slurm_control_host
            .clone()
            .unwrap_or_else(|| format!("{}-controller", self.slurm_cluster_name))
    }

    pub fn control_host_port(&self) -> &str {
        self.slurm_control_host_port
            .as_deref()
            .unwrap_or(DEFAULT_CONTROL_PORT)
    }

    /// `--conf-server` value for slurmd and sackd
    pub fn conf_server(&self) -> String {
        let host = match &self.slurm_control_addr {
            Some(addr) => format!("{}({})", self.control_host(), addr),
            None => self.control_host(),
        };
        format!("{}:{}", host, self.control_host_port())
    }

    /// State disk device name, if one is attached
    pub fn state_disk_device(&self) -> Option<&str> {
        self.controller_state_disk
            .as_ref()
            .and_then(|d| d.device_name.as_deref())
    }

    /// uid/gid override requested for the slurm identity in hybrid mode
    pub fn hybrid_ids(&self) -> Option<(u32, u32)> {
        if !self.hybrid {
            return None;
        }
        let conf = self.hybrid_conf.as_ref()?;
        Some((conf.slurm_uid?, conf.slurm_gid?))
    }
}
