//! Controller configuration rendering
//!
//! `cloud.conf` carries the deployment-specific part of `slurm.conf`; the
//! site `slurm.conf` includes it.

use super::SetupContext;
use super::common::jwt_key_path;
use crate::{Host, SetupError};
use minijinja::{Environment, context};
use tokio::fs;
use tracing::info;

const CLOUD_CONF_TEMPLATE: &str = "\
# Generated by slurm-node-setup, changes will be overwritten.
ClusterName={{ cluster_name }}
SlurmctldHost={{ control_host }}{% if control_addr %}({{ control_addr }}){% endif %}
SlurmctldPort={{ control_port }}
SlurmctldParameters=enable_configless
StateSaveLocation={{ state_dir }}
SlurmctldLogFile={{ log_dir }}/slurmctld.log
SlurmdLogFile={{ log_dir }}/slurmd-%n.log
AuthAltTypes=auth/jwt
AuthAltParameters=jwt_key={{ jwt_key }}
";

/// Render `cloud.conf` for this cluster
pub fn render_cloud_conf(ctx: &SetupContext) -> Result<String, SetupError> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template("cloud.conf", CLOUD_CONF_TEMPLATE)?;
    let template = env.get_template("cloud.conf")?;

    let config = &ctx.config;
    Ok(template.render(context! {
        cluster_name => config.slurm_cluster_name,
        control_host => config.control_host(),
        control_addr => config.slurm_control_addr,
        control_port => config.control_host_port(),
        state_dir => ctx.paths.state().display().to_string(),
        log_dir => ctx.paths.log().display().to_string(),
        jwt_key => jwt_key_path(&ctx.paths).display().to_string(),
    })?)
}

/// Write the generated controller configuration
pub async fn gen_controller_configs(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    let etc = ctx.paths.slurm_etc();
    fs::create_dir_all(&etc).await?;

    let target = etc.join("cloud.conf");
    fs::write(&target, render_cloud_conf(ctx)?).await?;
    host.chown_slurm(&target, Some(0o644)).await?;
    info!("Generated {}", target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::paths::NodePaths;
    use std::time::Duration;

    fn ctx(config: Configuration) -> SetupContext {
        SetupContext {
            config,
            paths: NodePaths::new(),
            hostname: "hpc-controller".to_string(),
            settle_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_render_cloud_conf() {
        let conf = render_cloud_conf(&ctx(Configuration {
            slurm_cluster_name: "hpc".to_string(),
            slurm_control_addr: Some("10.0.0.5".to_string()),
            ..Default::default()
        }))
        .unwrap();

        assert!(conf.contains("ClusterName=hpc\n"));
        assert!(conf.contains("SlurmctldHost=hpc-controller(10.0.0.5)\n"));
        assert!(conf.contains("SlurmctldPort=6820-6830\n"));
        assert!(conf.contains("StateSaveLocation=/var/spool/slurm\n"));
        assert!(conf.contains("jwt_key=/var/spool/slurm/jwt_hs256.key\n"));
    }

    #[test]
    fn test_render_without_control_addr() {
        let conf = render_cloud_conf(&ctx(Configuration {
            slurm_cluster_name: "hpc".to_string(),
            slurm_control_host: Some("ctl".to_string()),
            ..Default::default()
        }))
        .unwrap();
        assert!(conf.contains("SlurmctldHost=ctl\n"));
    }
}
