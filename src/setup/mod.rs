//! Node setup orchestration
//!
//! A run moves through a fixed set of states:
//!
//! ```text
//! Start -> ConfigAcquired -> RoleDispatched(role) -> Complete
//!                                     \------------> Failed
//! ```
//!
//! Any error from any step ends the run in `Failed`; a failed run is never
//! retried. The banner brackets the whole run.

pub mod common;
pub mod compute;
pub mod controller;
pub mod hybrid;
pub mod login;
pub mod render;

use crate::config::{ConfigAcquirer, ConfigSource, Configuration, NodeRole};
use crate::paths::NodePaths;
use crate::status::StatusSignaler;
use crate::{Host, SetupError};
use std::time::Duration;
use tracing::{error, info};

/// Wait between restarting slurmdbd and registering the cluster
pub const DBD_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Everything a role setup needs, built once the configuration is acquired
#[derive(Debug, Clone)]
pub struct SetupContext {
    /// Immutable for the rest of the run
    pub config: Configuration,
    pub paths: NodePaths,
    pub hostname: String,
    pub settle_delay: Duration,
}

impl SetupContext {
    pub fn role(&self) -> &NodeRole {
        &self.config.instance_role
    }
}

/// States of a setup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupState {
    Start,
    ConfigAcquired,
    RoleDispatched(NodeRole),
    Complete,
    Failed,
}

/// Outcome of a setup run
#[derive(Debug)]
pub struct SetupReport {
    /// States visited, in order
    pub transitions: Vec<SetupState>,
    /// The error that ended the run in `Failed`
    pub error: Option<SetupError>,
}

impl SetupReport {
    fn new() -> Self {
        Self {
            transitions: vec![SetupState::Start],
            error: None,
        }
    }

    fn enter(&mut self, state: SetupState) {
        info!("Setup state: {:?}", state);
        self.transitions.push(state);
    }

    pub fn final_state(&self) -> &SetupState {
        self.transitions.last().unwrap_or(&SetupState::Start)
    }

    pub fn succeeded(&self) -> bool {
        *self.final_state() == SetupState::Complete
    }
}

/// Drives a setup run against a [`Host`]
pub struct Bootstrap {
    host: Host,
    paths: NodePaths,
    acquirer: ConfigAcquirer,
    settle_delay: Duration,
}

impl Bootstrap {
    pub fn new(host: Host, paths: NodePaths) -> Self {
        Self {
            host,
            paths,
            acquirer: ConfigAcquirer::new(),
            settle_delay: DBD_SETTLE_DELAY,
        }
    }

    /// Use a custom acquirer (e.g. a shorter backoff)
    pub fn with_acquirer(mut self, acquirer: ConfigAcquirer) -> Self {
        self.acquirer = acquirer;
        self
    }

    /// Override the slurmdbd settle delay
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    async fn context(&self, config: Configuration) -> Result<SetupContext, SetupError> {
        let hostname = self.host.metadata.hostname().await?;
        let paths = match &config.slurm_log_dir {
            Some(dir) => self.paths.clone().with_log_dir(dir),
            None => self.paths.clone(),
        };
        Ok(SetupContext {
            config,
            paths,
            hostname,
            settle_delay: self.settle_delay,
        })
    }

    /// Full node setup for the role named in the configuration
    pub async fn run(&self, source: &dyn ConfigSource) -> SetupReport {
        let mut report = SetupReport::new();
        let status = StatusSignaler::new(&self.paths, &*self.host.runner);
        let result = self.provision(source, &status, &mut report).await;
        self.finish(result, false, &status, report).await
    }

    /// Hybrid setup: only generate the controller configuration
    pub async fn run_hybrid(&self, source: &dyn ConfigSource) -> SetupReport {
        let mut report = SetupReport::new();
        let status = StatusSignaler::new(&self.paths, &*self.host.runner);
        let result = self.provision_hybrid(source, &mut report).await;
        self.finish(result, true, &status, report).await
    }

    async fn provision(
        &self,
        source: &dyn ConfigSource,
        status: &StatusSignaler<'_>,
        report: &mut SetupReport,
    ) -> Result<(), SetupError> {
        status.pending().await?;

        info!("Starting setup, fetching config");
        let config = self.acquirer.acquire(source).await;
        report.enter(SetupState::ConfigAcquired);

        let ctx = self.context(config).await?;
        common::persist_config(&ctx).await?;
        common::setup_cloud_ops(&ctx, &self.host).await?;
        common::configure_dirs(&ctx, &self.host).await?;

        let role = ctx.role().clone();
        report.enter(SetupState::RoleDispatched(role.clone()));
        match &role {
            NodeRole::Controller => controller::setup(&ctx, &self.host).await?,
            NodeRole::Compute => compute::setup(&ctx, &self.host).await?,
            NodeRole::Login => login::setup(&ctx, &self.host).await?,
            NodeRole::Unrecognized(name) => {
                error!("Unknown node role: {:?}, no role setup performed", name)
            }
        }

        status.complete(&role).await
    }

    async fn provision_hybrid(
        &self,
        source: &dyn ConfigSource,
        report: &mut SetupReport,
    ) -> Result<(), SetupError> {
        info!("Starting hybrid setup, fetching config");
        let config = self.acquirer.acquire(source).await;
        report.enter(SetupState::ConfigAcquired);

        let ctx = self.context(config).await?;
        common::persist_config(&ctx).await?;

        info!("Generating the config files");
        render::gen_controller_configs(&ctx, &self.host).await?;
        info!("Success");
        Ok(())
    }

    async fn finish(
        &self,
        result: Result<(), SetupError>,
        hybrid: bool,
        status: &StatusSignaler<'_>,
        mut report: SetupReport,
    ) -> SetupReport {
        match result {
            Ok(()) => report.enter(SetupState::Complete),
            Err(e) => {
                log_failure(&e);
                error!("Aborting setup...");
                if let Err(banner) = status.failed(hybrid).await {
                    error!("Cannot signal setup failure: {}", banner);
                }
                report.enter(SetupState::Failed);
                report.error = Some(e);
            }
        }
        report
    }
}

fn log_failure(e: &SetupError) {
    match e {
        SetupError::CommandTimeout {
            command,
            timeout,
            stdout,
            stderr,
        } => error!(
            "Command timed out:\n    command={}\n    timeout={:?}\n    stdout:\n{}\n    stderr:\n{}\n",
            command,
            timeout,
            stdout.trim(),
            stderr.trim()
        ),
        SetupError::CommandFailed {
            command,
            code,
            stdout,
            stderr,
        } => error!(
            "Command failed:\n    command={}\n    returncode={:?}\n    stdout:\n{}\n    stderr:\n{}\n",
            command,
            code,
            stdout.trim(),
            stderr.trim()
        ),
        other => error!("Setup failed: {}", other),
    }
}
