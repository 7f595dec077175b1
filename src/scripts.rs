//! Operator hook scripts
//!
//! Hooks live under `<custom_scripts>/<category>.d/`, are fetched from the
//! script store at the start of each role setup and run later in that setup.
//! Execution is sequential and stops at the first hook that fails.

use crate::config::{Configuration, DEFAULT_SCRIPT_TIMEOUT, NodeRole};
use crate::exec::{CommandLine, CommandRunner};
use crate::paths::NodePaths;
use crate::{Host, SetupError};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// Hooks whose file name ends with this are never run
pub const DISABLED_SUFFIX: &str = ".disabled";

/// Role phase a hook belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptCategory {
    Controller,
    Compute,
    Nodeset,
    Login,
}

impl ScriptCategory {
    pub const ALL: [ScriptCategory; 4] = [
        ScriptCategory::Controller,
        ScriptCategory::Compute,
        ScriptCategory::Nodeset,
        ScriptCategory::Login,
    ];

    /// Directory name under the custom scripts root
    pub fn dir_name(&self) -> &'static str {
        match self {
            ScriptCategory::Controller => "controller.d",
            ScriptCategory::Compute => "compute.d",
            ScriptCategory::Nodeset => "nodeset.d",
            ScriptCategory::Login => "login.d",
        }
    }

    /// Categories run on a node of `role`, in order
    pub fn run_for(role: &NodeRole) -> &'static [ScriptCategory] {
        match role {
            NodeRole::Controller => &[ScriptCategory::Controller],
            NodeRole::Compute => &[ScriptCategory::Compute, ScriptCategory::Nodeset],
            NodeRole::Login => &[ScriptCategory::Login],
            NodeRole::Unrecognized(_) => &[],
        }
    }

    /// Categories installed on a node of `role`; the controller keeps all of
    /// them but only runs its own
    pub fn installed_for(role: &NodeRole) -> &'static [ScriptCategory] {
        match role {
            NodeRole::Controller => &Self::ALL,
            other => Self::run_for(other),
        }
    }

    fn configured_timeout(&self, config: &Configuration) -> Option<i64> {
        match self {
            ScriptCategory::Controller => config.controller_startup_scripts_timeout,
            ScriptCategory::Compute | ScriptCategory::Nodeset => {
                config.compute_startup_scripts_timeout
            }
            ScriptCategory::Login => config.login_startup_scripts_timeout,
        }
    }
}

impl std::fmt::Display for ScriptCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.dir_name().trim_end_matches(".d");
        write!(f, "{}", name)
    }
}

/// Timeout for hooks of `category`.
///
/// Unset falls back to 300s; zero or negative means no timeout at all.
pub fn resolve_timeout(config: &Configuration, category: ScriptCategory) -> Option<Duration> {
    match category.configured_timeout(config) {
        None => Some(DEFAULT_SCRIPT_TIMEOUT),
        Some(secs) if secs <= 0 => None,
        Some(secs) => Some(Duration::from_secs(secs.unsigned_abs())),
    }
}

/// A discovered hook script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionScript {
    pub path: PathBuf,
    pub category: ScriptCategory,
    pub enabled: bool,
    pub timeout: Option<Duration>,
}

impl ExtensionScript {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Every regular file under the category directories of `role`, in
/// traversal order. Disabled hooks are included with `enabled == false`.
pub fn discover(
    custom_dir: &Path,
    role: &NodeRole,
    config: &Configuration,
) -> Result<Vec<ExtensionScript>, SetupError> {
    let mut scripts = Vec::new();

    for &category in ScriptCategory::run_for(role) {
        let dir = custom_dir.join(category.dir_name());
        if !dir.is_dir() {
            debug!("No hook directory {}", dir.display());
            continue;
        }
        let timeout = resolve_timeout(config, category);

        for entry in WalkDir::new(&dir).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| SetupError::resource(&dir, e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let enabled = !entry.file_name().to_string_lossy().ends_with(DISABLED_SUFFIX);
            scripts.push(ExtensionScript {
                path: entry.into_path(),
                category,
                enabled,
                timeout,
            });
        }
    }

    Ok(scripts)
}

/// Run the enabled hooks of `role` one after another.
///
/// The first hook that cannot start, times out, or exits non-zero aborts
/// the run and its error is returned.
pub async fn run_scripts(
    runner: &dyn CommandRunner,
    paths: &NodePaths,
    config: &Configuration,
    role: &NodeRole,
) -> Result<(), SetupError> {
    let custom_dir = paths.custom_scripts();
    let scripts: Vec<ExtensionScript> = discover(&custom_dir, role, config)?
        .into_iter()
        .filter(|s| s.enabled)
        .collect();

    let listing: Vec<String> = scripts
        .iter()
        .map(|s| {
            s.path
                .strip_prefix(&custom_dir)
                .unwrap_or(&s.path)
                .display()
                .to_string()
        })
        .collect();
    debug!("custom scripts to run: {}/({})", custom_dir.display(), listing.join(","));

    for script in &scripts {
        run_script(runner, script).await?;
    }
    Ok(())
}

async fn run_script(runner: &dyn CommandRunner, script: &ExtensionScript) -> Result<(), SetupError> {
    let name = script.name();
    info!("running script {} with timeout={:?}", name, script.timeout);

    let cmd = CommandLine::new(script.path.display().to_string()).with_timeout(script.timeout);
    match runner.run(&cmd).await {
        Ok(output) => {
            info!(
                "{} returncode={:?}\nstdout={}stderr={}",
                name, output.code, output.stdout, output.stderr
            );
            output.check(&cmd).map(|_| ()).inspect_err(|_| {
                error!("script {} exited with a non-zero status", script.path.display());
            })
        }
        Err(e @ SetupError::Resource { .. }) => {
            error!("script {} is not executable", script.path.display());
            Err(e)
        }
        Err(e @ SetupError::CommandTimeout { .. }) => {
            error!(
                "script {} did not complete within timeout={:?}",
                script.path.display(),
                script.timeout
            );
            Err(e)
        }
        Err(e) => {
            error!("script {} encountered an error: {}", script.path.display(), e);
            Err(e)
        }
    }
}

/// Fetch the hooks published for `role` and write them under the custom
/// scripts root, executable and owned by slurm.
pub async fn install_custom_scripts(
    host: &Host,
    paths: &NodePaths,
    role: &NodeRole,
) -> Result<usize, SetupError> {
    let custom_dir = paths.custom_scripts();
    let mut installed = 0;

    for &category in ScriptCategory::installed_for(role) {
        for script in host.scripts.fetch_scripts(category).await? {
            let dest = custom_dir.join(category.dir_name()).join(&script.relative_path);
            let contained = script
                .relative_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
            if !contained {
                return Err(SetupError::resource(&dest, "hook path escapes the scripts directory"));
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
                host.chown_slurm(parent, None).await?;
            }

            debug!("installing custom script: {}", dest.display());
            fs::write(&dest, &script.content).await?;
            host.chown_slurm(&dest, Some(0o755)).await?;
            installed += 1;
        }
    }

    info!("Installed {} custom script(s) for role {}", installed, role);
    Ok(installed)
}
