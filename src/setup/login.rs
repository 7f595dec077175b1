//! Login node setup

use super::SetupContext;
use super::common::{self, check_services, enable_restart, systemctl};
use crate::config::{Configuration, NodeRole};
use crate::scripts;
use crate::{Host, SetupError};
use tracing::info;

/// `SACKD_OPTIONS` line for the sackd default-environment file
pub fn sackd_options(config: &Configuration) -> String {
    format!("SACKD_OPTIONS='--conf-server=\"{}\"'", config.conf_server())
}

/// Run the login node setup
pub async fn setup(ctx: &SetupContext, host: &Host) -> Result<(), SetupError> {
    info!("Setting up login");
    common::update_system_config(&ctx.paths, "sackd", &sackd_options(&ctx.config)).await?;
    scripts::install_custom_scripts(host, &ctx.paths, &NodeRole::Login).await?;

    common::setup_network_storage(ctx, host).await?;
    common::setup_sudoers(&ctx.paths).await?;
    systemctl(host, &["restart", "munge"]).await?;
    enable_restart(host, "sackd").await?;
    systemctl(host, &["enable", "--now", "slurmcmd.timer"]).await?;

    scripts::run_scripts(&*host.runner, &ctx.paths, &ctx.config, &NodeRole::Login).await?;

    check_services(host, &["munge", "sackd"]).await?;

    info!("Done setting up login");
    Ok(())
}
