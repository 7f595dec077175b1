//! Controller setup

use super::SetupContext;
use super::common::{self, check_services, enable_restart, systemctl};
use super::render;
use crate::config::NodeRole;
use crate::exec::{CommandLine, SERVICE_TIMEOUT};
use crate::reconcile::{reconcile_bind_mount, reconcile_disk_mount};
use crate::scripts;
use crate::{Host, SetupError};
use tracing::info;

/// Controller state disks are formatted with this filesystem
const STATE_DISK_FS: &str = "ext4";

/// Run the controller setup
pub async fn setup(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    info!("Setting up controller");
    host.chown_slurm(&ctx.paths.config_snapshot(), Some(0o600))
        .await?;
    scripts::install_custom_scripts(host, &ctx.paths, &NodeRole::Controller).await?;
    render::gen_controller_configs(ctx, host).await?;

    if let Some(device) = ctx.config.state_disk_device() {
        mount_state_disk(ctx, host, device).await?;
        mount_munge_key_dir(ctx, host).await?;
    }

    common::setup_jwt_key(ctx, host).await?;
    common::setup_munge_key(ctx, host).await?;
    common::setup_sudoers(&ctx.paths).await?;
    common::setup_network_storage(ctx, host).await?;

    scripts::run_scripts(&*host.runner, &ctx.paths, &ctx.config, &NodeRole::Controller).await?;

    if ctx.config.cloudsql_secret.as_deref().is_none_or(str::is_empty) {
        common::configure_mysql(ctx, host).await?;
    }

    enable_restart(host, "slurmdbd").await?;
    tokio::time::sleep(ctx.settle_delay).await;
    register_cluster(ctx, host).await?;

    enable_restart(host, "slurmctld").await?;
    enable_restart(host, "slurmrestd").await?;

    // exports go last, they tell the other nodes the controller is up
    systemctl(host, &["enable", "nfs-server"]).await?;
    systemctl(host, &["start", "nfs-server"]).await?;
    common::setup_nfs_exports(ctx, host).await?;
    systemctl(host, &["enable", "--now", "slurmcmd.timer"]).await?;

    check_services(host, &["munge", "slurmdbd", "slurmctld", "slurmrestd"]).await?;

    systemctl(host, &["enable", "slurm_load_bq.timer"]).await?;
    systemctl(host, &["start", "slurm_load_bq.timer"]).await?;
    systemctl(host, &["status", "slurm_load_bq.timer"]).await?;

    common::setup_maintenance_script(ctx, host).await?;

    info!("Done setting up controller");
    Ok(())
}

/// Format, register and mount the state disk on the state directory
async fn mount_state_disk(ctx: &SetupContext, host: &Host, device_name: &str) -> Result<(), SetupError> {
    let device = format!("/dev/disk/by-id/google-{}", device_name);
    let state = ctx.paths.state();
    reconcile_disk_mount(&*host.runner, &ctx.paths.fstab(), &device, &state, STATE_DISK_FS).await?;
    host.chown_slurm(&state, None).await
}

/// Keep the munge key on the state disk
async fn mount_munge_key_dir(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    reconcile_bind_mount(
        &*host.runner,
        &ctx.paths.fstab(),
        &ctx.paths.state().join("munge"),
        &ctx.paths.munge(),
    )
    .await
}

/// Register the cluster with the accounting database.
///
/// `sacctmgr` reports an existing cluster on stdout with a low non-zero
/// status; that counts as success. Any status above 1 is a failure.
pub async fn register_cluster(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let cmd = CommandLine::new(ctx.paths.slurm_bin("sacctmgr").display().to_string())
        .args(["-i", "add", "cluster", &ctx.config.slurm_cluster_name])
        .timeout(SERVICE_TIMEOUT);
    let output = host.runner.run(&cmd).await?;

    if output.stdout.contains("already exists") {
        info!("{}", output.stdout.trim());
        return Ok(());
    }
    match output.code {
        Some(code) if code <= 1 => Ok(()),
        _ => output.check(&cmd).map(|_| ()),
    }
}
