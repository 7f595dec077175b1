//! Provisioning steps shared between roles

use super::SetupContext;
use crate::config::{NetworkStorage, NodeRole};
use crate::exec::{CommandLine, SERVICE_TIMEOUT};
use crate::identity::{MUNGE_USER, chown_account};
use crate::paths::NodePaths;
use crate::reconcile::{FstabEntry, ensure_symlink, reconcile_network_mount};
use crate::{Host, SetupError};
use serde_yaml::{Mapping, Value};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Monitoring agent unit
pub const OPS_AGENT_UNIT: &str = "google-cloud-ops-agent.service";

const CLUSTER_INFO_PROCESSOR: &str = "add_cluster_info";
const SLURM_LOG_PIPELINES: [&str; 2] = ["slurmlog_pipeline", "slurmlog2_pipeline"];

const JWT_KEY_BYTES: usize = 32;
const MUNGE_KEY_BYTES: usize = 1024;

/// Directories the controller exports to the other nodes
const CONTROLLER_EXPORTS: [&str; 2] = ["/home", "/opt/apps"];

const NFS_EXPORT_OPTIONS: &str = "*(rw,no_subtree_check,no_root_squash)";

const SUDOERS: &str = "
# Allow SlurmUser to manage the slurm daemons
slurm ALL= NOPASSWD: /usr/bin/systemctl restart slurmd.service
slurm ALL= NOPASSWD: /usr/bin/systemctl restart sackd.service
slurm ALL= NOPASSWD: /usr/bin/systemctl restart slurmctld.service
";

const MYSQL_SLURM_CNF: &str = "
[mysqld]
bind-address=127.0.0.1
innodb_buffer_pool_size=1024M
innodb_log_file_size=64M
innodb_lock_wait_timeout=900
";

const MAINTENANCE_SCRIPT: &str = r#"#!/bin/bash

#SBATCH --priority=low
#SBATCH --time=180

METADATA="http://metadata.google.internal/computeMetadata/v1/instance"
VM_NAME=$(curl -s "$METADATA/name" -H "Metadata-Flavor: Google")
ZONE=$(curl -s "$METADATA/zone" -H "Metadata-Flavor: Google" | cut -d '/' -f 4)

gcloud compute instances perform-maintenance "$VM_NAME" --zone="$ZONE"
"#;

// ==================== Service Manager ====================

/// `systemctl <args>`, failing on a non-zero exit
pub async fn systemctl(host: &Host, args: &[&str]) -> Result<(), SetupError> {
    host.runner
        .run_checked(&CommandLine::systemctl(args.iter().copied()))
        .await?;
    Ok(())
}

/// `systemctl enable` then `systemctl restart`
pub async fn enable_restart(host: &Host, unit: &str) -> Result<(), SetupError> {
    systemctl(host, &["enable", unit]).await?;
    systemctl(host, &["restart", unit]).await
}

/// `systemctl status` for each unit; an inactive unit fails the setup
pub async fn check_services(host: &Host, units: &[&str]) -> Result<(), SetupError> {
    info!("Check status of cluster services");
    for unit in units {
        systemctl(host, &["status", unit]).await?;
    }
    Ok(())
}

// ==================== Layout ====================

/// Persist the acquired configuration on the node
pub async fn persist_config(ctx: &SetupContext) -> Result<(), SetupError> {
    let snapshot = ctx.paths.config_snapshot();
    if let Some(parent) = snapshot.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&snapshot, ctx.config.to_yaml()?).await?;
    debug!("Configuration saved to {}", snapshot.display());
    Ok(())
}

/// Create the cluster directories and links
pub async fn configure_dirs(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let p = &ctx.paths;

    for dir in [
        p.home(),
        p.apps(),
        p.slurm(),
        p.scripts(),
        p.custom_scripts(),
        p.munge(),
        p.log(),
        p.prefix(),
    ] {
        fs::create_dir_all(&dir).await?;
    }
    for dir in [p.slurm(), p.scripts(), p.custom_scripts()] {
        host.chown_slurm(&dir, None).await?;
    }
    for dir in [p.slurm_etc(), p.state(), p.slurm_home()] {
        fs::create_dir_all(&dir).await?;
        host.chown_slurm(&dir, None).await?;
    }

    for (link, target) in [
        (p.etc_slurm_link(), p.slurm_etc()),
        (p.scripts().join("etc"), p.slurm_etc()),
        (p.scripts().join("log"), p.log()),
    ] {
        ensure_symlink(&link, &target).await?;
    }
    Ok(())
}

// ==================== Monitoring Agent ====================

fn mapping_at<'a>(map: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping, SetupError> {
    map.get_mut(key)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| SetupError::InvalidData(format!("ops agent config has no '{}' section", key)))
}

fn static_label(value: &str) -> Value {
    let mut label = Mapping::new();
    label.insert("static_value".into(), value.into());
    Value::Mapping(label)
}

/// Label every Slurm log record with the cluster and host name.
///
/// Adds the `add_cluster_info` processor and appends it to the Slurm log
/// pipelines once. Key order of the document is preserved.
pub fn add_cluster_info(doc: &mut Value, cluster: &str, hostname: &str) -> Result<(), SetupError> {
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| SetupError::InvalidData("ops agent config is not a mapping".to_string()))?;
    let logging = mapping_at(root, "logging")?;

    let mut fields = Mapping::new();
    fields.insert(r#"labels."cluster_name""#.into(), static_label(cluster));
    fields.insert(r#"labels."hostname""#.into(), static_label(hostname));
    let mut processor = Mapping::new();
    processor.insert("type".into(), "modify_fields".into());
    processor.insert("fields".into(), Value::Mapping(fields));
    mapping_at(logging, "processors")?.insert(CLUSTER_INFO_PROCESSOR.into(), Value::Mapping(processor));

    let pipelines = mapping_at(mapping_at(logging, "service")?, "pipelines")?;
    for name in SLURM_LOG_PIPELINES {
        let processors = mapping_at(pipelines, name)?
            .get_mut("processors")
            .and_then(Value::as_sequence_mut)
            .ok_or_else(|| SetupError::InvalidData(format!("pipeline {} has no processors", name)))?;
        if !processors.iter().any(|p| p.as_str() == Some(CLUSTER_INFO_PROCESSOR)) {
            processors.push(CLUSTER_INFO_PROCESSOR.into());
        }
    }
    Ok(())
}

/// Add deployment labels to the monitoring agent, if it is running
pub async fn setup_cloud_ops(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let active = host
        .runner
        .run(&CommandLine::systemctl(["is-active", "--quiet", OPS_AGENT_UNIT]))
        .await?
        .success();
    if !active {
        debug!("{} is not active", OPS_AGENT_UNIT);
        return Ok(());
    }

    let path = ctx.paths.ops_agent_config();
    let raw = fs::read_to_string(&path)
        .await
        .map_err(|e| SetupError::resource(&path, e.to_string()))?;
    let mut doc: Value = serde_yaml::from_str(&raw)?;
    add_cluster_info(&mut doc, &ctx.config.slurm_cluster_name, &ctx.hostname)?;
    fs::write(&path, serde_yaml::to_string(&doc)?).await?;

    info!("Added cluster labels to {}", path.display());
    systemctl(host, &["restart", OPS_AGENT_UNIT]).await
}

// ==================== Keys ====================

async fn read_entropy(source: &str, len: usize) -> Result<Vec<u8>, SetupError> {
    let mut file = fs::File::open(source)
        .await
        .map_err(|e| SetupError::resource(source, e.to_string()))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_secret(path: &Path, secret: &[u8]) -> Result<(), SetupError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .await
        .map_err(|e| SetupError::resource(path, e.to_string()))?;
    file.write_all(secret).await?;
    file.flush().await?;
    Ok(())
}

/// slurmctld JWT signing key
pub fn jwt_key_path(paths: &NodePaths) -> PathBuf {
    paths.state().join("jwt_hs256.key")
}

/// Generate the JWT key if absent; readable by slurm only
pub async fn setup_jwt_key(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let key = jwt_key_path(&ctx.paths);
    if fs::try_exists(&key).await? {
        info!("JWT key already exists. Skipping key generation.");
    } else {
        write_secret(&key, &read_entropy("/dev/urandom", JWT_KEY_BYTES).await?).await?;
        info!("Generated JWT key {}", key.display());
    }
    host.chown_slurm(&key, Some(0o400)).await
}

/// Generate the munge key if absent; readable by munge only
pub async fn setup_munge_key(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let key = ctx.paths.munge().join("munge.key");
    if fs::try_exists(&key).await? {
        info!("Munge key already exists. Skipping key generation.");
    } else {
        write_secret(&key, &read_entropy("/dev/random", MUNGE_KEY_BYTES).await?).await?;
        info!("Generated munge key {}", key.display());
    }
    chown_account(&*host.identities, &*host.fs, MUNGE_USER, &key, Some(0o400)).await?;
    systemctl(host, &["restart", "munge"]).await
}

// ==================== System Files ====================

/// Let slurm restart its own daemons
pub async fn setup_sudoers(paths: &NodePaths) -> Result<(), SetupError> {
    let sudoers = paths.sudoers();
    if let Some(parent) = sudoers.parent() {
        fs::create_dir_all(parent).await?;
    }
    // sudo ignores drop-ins with a '.' in the name
    let staged = sudoers.with_extension("new");
    fs::write(&staged, SUDOERS).await?;
    fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o440)).await?;
    fs::rename(&staged, &sudoers).await?;
    Ok(())
}

/// Write a service default-environment file (`/etc/sysconfig/<file>` or
/// `/etc/default/<file>`)
pub async fn update_system_config(paths: &NodePaths, file: &str, content: &str) -> Result<(), SetupError> {
    let conf_dir = if paths.sysconfig().is_dir() {
        paths.sysconfig()
    } else if paths.etc_default().is_dir() {
        paths.etc_default()
    } else {
        return Err(SetupError::resource(
            paths.sysconfig(),
            "cannot determine system configuration directory",
        ));
    };

    let target = conf_dir.join(file);
    fs::write(&target, content).await?;
    debug!("Wrote {}", target.display());
    Ok(())
}

/// Put `slurm` first in the passwd and group sources. Lines that already
/// list it are left alone.
pub fn enable_nss_slurm(nsswitch: &str) -> String {
    nsswitch
        .split_inclusive('\n')
        .map(|line| {
            for db in ["passwd:", "group:"] {
                if let Some(rest) = line.strip_prefix(db) {
                    let sources = rest.trim_start_matches([' ', '\t']);
                    let gap = &rest[..rest.len() - sources.len()];
                    if gap.is_empty() || sources.split_whitespace().any(|s| s == "slurm") {
                        return line.to_string();
                    }
                    return format!("{}{}slurm {}", db, gap, sources);
                }
            }
            line.to_string()
        })
        .collect()
}

/// Install and enable the nss_slurm module
pub async fn setup_nss_slurm(ctx: &SetupContext) -> Result<(), SetupError> {
    let p = &ctx.paths;
    fs::create_dir_all(p.slurmd_spool()).await?;

    let module = p.lib64().join("libnss_slurm.so.2");
    if fs::symlink_metadata(&module).await.is_ok() {
        debug!("{} already present", module.display());
    } else {
        ensure_symlink(&module, &p.prefix().join("lib/libnss_slurm.so.2")).await?;
    }

    let path = p.nsswitch();
    let current = fs::read_to_string(&path)
        .await
        .map_err(|e| SetupError::resource(&path, e.to_string()))?;
    let updated = enable_nss_slurm(&current);
    if updated != current {
        fs::write(&path, updated).await?;
        info!("Enabled nss_slurm in {}", path.display());
    }
    Ok(())
}

// ==================== Storage ====================

/// Network filesystems this node mounts.
///
/// Nodes other than the controller also mount the controller's exports,
/// unless an external filesystem already covers that directory.
pub fn storage_entries(ctx: &SetupContext) -> Vec<NetworkStorage> {
    let config = &ctx.config;
    let mut entries = config.network_storage.clone();
    if *ctx.role() == NodeRole::Login {
        entries.extend(config.login_network_storage.iter().cloned());
    }

    if *ctx.role() != NodeRole::Controller && !config.hybrid {
        for export in CONTROLLER_EXPORTS {
            if !entries.iter().any(|e| e.local_mount == Path::new(export)) {
                entries.push(NetworkStorage {
                    server_ip: config.control_host(),
                    remote_mount: export.to_string(),
                    local_mount: PathBuf::from(export),
                    fs_type: "nfs".to_string(),
                    mount_options: None,
                });
            }
        }
    }
    entries
}

/// Register and mount every network filesystem of this node
pub async fn setup_network_storage(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let fstab = ctx.paths.fstab();
    for storage in storage_entries(ctx) {
        let entry = FstabEntry::filesystem(
            format!("{}:{}", storage.server_ip, storage.remote_mount),
            ctx.paths.host(&storage.local_mount),
            storage.fs_type.as_str(),
        )
        .with_options(storage.mount_options.clone());
        reconcile_network_mount(&*host.runner, &fstab, &entry).await?;
    }
    Ok(())
}

/// Export the controller directories not provided by external storage
pub async fn setup_nfs_exports(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let external: Vec<&Path> = ctx
        .config
        .network_storage
        .iter()
        .map(|s| s.local_mount.as_path())
        .collect();
    let exports: String = CONTROLLER_EXPORTS
        .iter()
        .filter(|dir| !external.contains(&Path::new(dir)))
        .map(|dir| format!("{} {}\n", dir, NFS_EXPORT_OPTIONS))
        .collect();

    let path = ctx.paths.nfs_exports();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&path, exports).await?;

    host.runner
        .run_checked(&CommandLine::new("exportfs").arg("-ra").timeout(SERVICE_TIMEOUT))
        .await?;
    Ok(())
}

// ==================== Accounting Database ====================

fn mysql(statement: String) -> CommandLine {
    CommandLine::new("mysql")
        .args(["-u", "root", "-e"])
        .arg(statement)
        .timeout(SERVICE_TIMEOUT)
}

/// Local MariaDB for slurmdbd: config, service, and the slurm SQL users
pub async fn configure_mysql(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let cnf = ctx.paths.mysql_conf_dir().join("mysql_slurm.cnf");
    if !fs::try_exists(&cnf).await? {
        if let Some(parent) = cnf.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&cnf, MYSQL_SLURM_CNF).await?;
    }
    enable_restart(host, "mariadb").await?;

    for db_host in ["localhost".to_string(), ctx.config.control_host()] {
        let account = format!("'slurm'@'{}'", db_host);
        // dropping a user that does not exist yet fails; ignore it
        host.runner
            .run(&mysql(format!("drop user {}", account)))
            .await?;
        host.runner
            .run_checked(&mysql(format!("create user {}", account)))
            .await?;
        host.runner
            .run_checked(&mysql(format!("grant all on slurm_acct_db.* TO {}", account)))
            .await?;
    }
    Ok(())
}

// ==================== Maintenance ====================

/// Batch script that triggers host maintenance on the node it runs on
pub async fn setup_maintenance_script(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let path = ctx.paths.custom_scripts().join("perform_maintenance.sh");
    fs::write(&path, MAINTENANCE_SCRIPT).await?;
    host.chown_slurm(&path, Some(0o755)).await
}
