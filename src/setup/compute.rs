//! Compute node setup

use super::SetupContext;
use super::common::{self, check_services, enable_restart, systemctl};
use super::hybrid;
use crate::config::{Configuration, NodeRole};
use crate::exec::CommandLine;
use crate::scripts;
use crate::{Host, SetupError};
use tracing::{debug, info};

/// Instance attribute with extra slurmd node features
pub const FEATURE_ATTRIBUTE: &str = "slurmd_feature";

/// `SLURMD_OPTIONS` line for the slurmd default-environment file
pub fn slurmd_options(config: &Configuration, feature: Option<&str>) -> String {
    let mut options = vec![format!("--conf-server=\"{}\"", config.conf_server())];
    if let Some(feature) = feature {
        options.push(format!("--conf=\"Feature={}\"", feature));
        options.push("-Z".to_string());
    }
    format!("SLURMD_OPTIONS='{}'", options.join(" "))
}

/// Number of NVIDIA devices in `lspci` output
pub fn count_nvidia_devices(lspci: &str) -> usize {
    lspci
        .lines()
        .filter(|line| line.to_ascii_lowercase().contains("nvidia"))
        .count()
}

async fn slurmd_feature(host: &Host) -> Option<String> {
    match host.metadata.attribute(FEATURE_ATTRIBUTE).await {
        Ok(feature) => feature,
        Err(e) => {
            debug!("Cannot read {}: {}", FEATURE_ATTRIBUTE, e);
            None
        }
    }
}

/// Load the NVIDIA driver if the node has a GPU
async fn probe_gpus(host: &Host) -> Result<(), SetupError> {
    let lspci = match host.runner.run(&CommandLine::new("lspci")).await {
        Ok(output) if output.success() => output.stdout,
        Ok(_) | Err(_) => {
            debug!("lspci unavailable, assuming no GPU");
            return Ok(());
        }
    };

    let gpus = count_nvidia_devices(&lspci);
    if gpus > 0 {
        info!("Found {} NVIDIA device(s)", gpus);
        host.runner
            .run_checked(&CommandLine::new("nvidia-smi"))
            .await?;
    }
    Ok(())
}

/// Run the compute node setup
pub async fn setup(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    info!("Setting up compute");
    if ctx.config.hybrid {
        hybrid::migrate_identity(ctx, host).await?;
    }
    host.chown_slurm(&ctx.paths.config_snapshot(), Some(0o600))
        .await?;

    let feature = slurmd_feature(host).await;
    common::update_system_config(
        &ctx.paths,
        "slurmd",
        &slurmd_options(&ctx.config, feature.as_deref()),
    )
    .await?;
    scripts::install_custom_scripts(host, &ctx.paths, &NodeRole::Compute).await?;

    common::setup_nss_slurm(ctx).await?;
    common::setup_network_storage(ctx, host).await?;

    probe_gpus(host).await?;

    scripts::run_scripts(&*host.runner, &ctx.paths, &ctx.config, &NodeRole::Compute).await?;

    common::setup_sudoers(&ctx.paths).await?;
    systemctl(host, &["restart", "munge"]).await?;
    enable_restart(host, "slurmd").await?;
    systemctl(host, &["enable", "--now", "slurmcmd.timer"]).await?;

    check_services(host, &["munge", "slurmd"]).await?;

    info!("Done setting up compute");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slurmd_options() {
        let config = Configuration {
            slurm_cluster_name: "hpc".to_string(),
            slurm_control_addr: Some("10.0.0.5".to_string()),
            ..Default::default()
        };
        assert_eq!(
            slurmd_options(&config, None),
            r#"SLURMD_OPTIONS='--conf-server="hpc-controller(10.0.0.5):6820-6830"'"#
        );
        assert_eq!(
            slurmd_options(&config, Some("gpu")),
            r#"SLURMD_OPTIONS='--conf-server="hpc-controller(10.0.0.5):6820-6830" --conf="Feature=gpu" -Z'"#
        );
    }

    #[test]
    fn test_count_nvidia_devices() {
        let lspci = "\
00:04.0 3D controller: NVIDIA Corporation GA100 [A100 SXM4 40GB] (rev a1)
00:05.0 3D controller: NVIDIA Corporation GA100 [A100 SXM4 40GB] (rev a1)
00:03.0 Non-VGA unclassified device: Red Hat, Inc. Virtio SCSI
";
        assert_eq!(count_nvidia_devices(lspci), 2);
        assert_eq!(count_nvidia_devices(""), 0);
    }
}
