//! Setup status banners
//!
//! The login banner (`/etc/motd`) tells anyone logging in whether the node
//! is still being set up, ready, or broken. Each change is also broadcast
//! to logged-in sessions with `wall`.

use crate::SetupError;
use crate::config::NodeRole;
use crate::exec::{CommandLine, CommandRunner, SERVICE_TIMEOUT};
use crate::paths::NodePaths;
use tokio::fs;
use tracing::debug;

const BANNER_HEADER: &str = r"
   _____ __
  / ___// /_  ___________ ___
  \__ \/ / / / / ___/ __ `__ \
 ___/ / / /_/ / /  / / / / / /
/____/_/\__,_/_/  /_/ /_/ /_/

";

const PENDING_MESSAGE: &str = "*** Slurm is currently being configured in the background. ***";

const HOME_MOUNT_NOTE: &str = "
/home on the controller was mounted over the existing /home.
Log back in to ensure your home directory is correct.
";

/// Writes the banner and broadcasts status changes
pub struct StatusSignaler<'a> {
    paths: &'a NodePaths,
    runner: &'a dyn CommandRunner,
}

impl<'a> StatusSignaler<'a> {
    pub fn new(paths: &'a NodePaths, runner: &'a dyn CommandRunner) -> Self {
        Self { paths, runner }
    }

    async fn write_banner(&self, message: Option<&str>) -> Result<(), SetupError> {
        let motd = self.paths.motd();
        if let Some(parent) = motd.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = match message {
            Some(message) => format!("{}{}\n\n", BANNER_HEADER, message),
            None => BANNER_HEADER.to_string(),
        };
        fs::write(&motd, body).await?;
        debug!("Banner written to {}", motd.display());
        Ok(())
    }

    async fn wall(&self, message: &str) -> Result<(), SetupError> {
        self.runner
            .run_checked(
                &CommandLine::new("wall")
                    .args(["-n", message])
                    .timeout(SERVICE_TIMEOUT),
            )
            .await?;
        Ok(())
    }

    /// Setup has started
    pub async fn pending(&self) -> Result<(), SetupError> {
        self.write_banner(Some(PENDING_MESSAGE)).await?;
        self.wall(PENDING_MESSAGE).await
    }

    /// Setup finished. Nodes other than the controller also get a note
    /// about /home having been mounted over.
    pub async fn complete(&self, role: &NodeRole) -> Result<(), SetupError> {
        self.write_banner(None).await?;
        self.wall(&format!("*** Slurm {} setup complete ***", role))
            .await?;
        if *role != NodeRole::Controller {
            self.wall(HOME_MOUNT_NOTE).await?;
        }
        Ok(())
    }

    /// Setup failed; points at the setup log. Does nothing for hybrid runs,
    /// which have no interactive console.
    pub async fn failed(&self, hybrid: bool) -> Result<(), SetupError> {
        if hybrid {
            debug!("Hybrid setup, leaving the banner alone");
            return Ok(());
        }
        let message = format!(
            "*** Slurm setup failed! Please view log: {} ***",
            self.paths.setup_log().display()
        );
        self.write_banner(Some(&message)).await?;
        self.wall(&message).await
    }
}
