//! Disk, bind and network mounts

use super::fstab::{FstabEntry, ensure_fstab_entry};
use crate::SetupError;
use crate::exec::{CommandLine, CommandRunner, SERVICE_TIMEOUT};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

async fn is_mounted(runner: &dyn CommandRunner, mount_point: &Path) -> Result<bool, SetupError> {
    let output = runner
        .run(&CommandLine::new("mountpoint").arg("-q").arg(mount_point.display().to_string()))
        .await?;
    Ok(output.success())
}

async fn daemon_reload(runner: &dyn CommandRunner) -> Result<(), SetupError> {
    runner
        .run_checked(&CommandLine::systemctl(["daemon-reload"]))
        .await?;
    Ok(())
}

async fn mount(runner: &dyn CommandRunner, mount_point: &Path) -> Result<(), SetupError> {
    if is_mounted(runner, mount_point).await? {
        debug!("{} is already mounted", mount_point.display());
        return Ok(());
    }
    runner
        .run_checked(&CommandLine::new("mount").arg(mount_point.display().to_string()))
        .await?;
    Ok(())
}

/// Format (if blank), register and mount a block device.
///
/// The device is formatted only when `file -s` reports no filesystem
/// signature on it.
pub async fn reconcile_disk_mount(
    runner: &dyn CommandRunner,
    fstab: &Path,
    device: &str,
    mount_point: &Path,
    fs_type: &str,
) -> Result<(), SetupError> {
    info!("Reconciling mount of {} on {}", device, mount_point.display());

    let rdevice = runner
        .run_checked(&CommandLine::new("realpath").arg(device))
        .await?
        .stdout
        .trim()
        .to_string();
    let signature = runner
        .run_checked(&CommandLine::new("file").args(["-s", &rdevice]))
        .await?
        .stdout;
    if !signature.contains("filesystem") {
        info!("No filesystem on {}, formatting as {}", rdevice, fs_type);
        runner
            .run_checked(&CommandLine::new("mkfs").args(["-t", fs_type, "-q", &rdevice]))
            .await?;
    }

    ensure_fstab_entry(fstab, &FstabEntry::filesystem(device, mount_point, fs_type)).await?;
    daemon_reload(runner).await?;

    fs::create_dir_all(mount_point).await?;
    mount(runner, mount_point).await
}

/// Bind-mount `source` onto `mount_point` and persist it in the mount table
pub async fn reconcile_bind_mount(
    runner: &dyn CommandRunner,
    fstab: &Path,
    source: &Path,
    mount_point: &Path,
) -> Result<(), SetupError> {
    info!(
        "Reconciling bind mount of {} on {}",
        source.display(),
        mount_point.display()
    );
    fs::create_dir_all(source).await?;
    fs::create_dir_all(mount_point).await?;

    if is_mounted(runner, mount_point).await? {
        debug!("{} is already mounted", mount_point.display());
    } else {
        runner
            .run_checked(
                &CommandLine::new("mount")
                    .arg("--bind")
                    .arg(source.display().to_string())
                    .arg(mount_point.display().to_string())
                    .timeout(SERVICE_TIMEOUT),
            )
            .await?;
    }

    ensure_fstab_entry(fstab, &FstabEntry::bind(source, mount_point)).await?;
    daemon_reload(runner).await
}

/// Register and mount a network filesystem
pub async fn reconcile_network_mount(
    runner: &dyn CommandRunner,
    fstab: &Path,
    entry: &FstabEntry,
) -> Result<(), SetupError> {
    info!("Reconciling network mount {}", entry.line());
    fs::create_dir_all(&entry.mount_point).await?;
    ensure_fstab_entry(fstab, entry).await?;
    daemon_reload(runner).await?;
    mount(runner, &entry.mount_point).await
}
