//! slurm-node-setup - bootstrap a Slurm cluster node
//!
//! Runs once at boot:
//! - Fetches the cluster configuration from the cluster bucket
//! - Sets the node up for its role (controller, compute or login)
//! - Reports progress through the login banner

use anyhow::Context;
use clap::Parser;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use slurm_node_setup::cloud::{BucketStore, GceMetadata, MetadataService};
use slurm_node_setup::paths::NodePaths;
use slurm_node_setup::{Bootstrap, Host};

#[derive(Parser)]
#[command(name = "slurm-node-setup")]
#[command(author, version, about = "Bootstrap a Slurm cluster node into its role", long_about = None)]
struct Cli {
    /// Do the hybrid setup (generate controller configs only)
    #[arg(long)]
    hybrid: bool,

    /// The bucket URI where config.yaml is (hybrid setup only)
    #[arg(long, env = "SLURM_BUCKET_PATH")]
    bucket: Option<String>,

    /// Unused, to be removed
    #[arg(long = "slurmd-feature", hide = true)]
    slurmd_feature: Option<String>,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8, log_file: &Path) -> anyhow::Result<()> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stderr only when the log directory is not writable
    let file = std::fs::create_dir_all(log_file.parent().unwrap_or(Path::new("/")))
        .and_then(|_| OpenOptions::new().create(true).append(true).open(log_file))
        .ok();
    let file_layer = file.map(|f| fmt::layer().with_ansi(false).with_writer(Mutex::new(f)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(file_layer)
        .try_init()
        .context("Failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let paths = NodePaths::new();
    init_logging(cli.verbose, &paths.setup_log())?;

    if cli.slurmd_feature.is_some() {
        warn!("--slurmd-feature is deprecated and ignored");
    }

    let metadata: Arc<dyn MetadataService> =
        Arc::new(GceMetadata::new().context("Failed to create metadata client")?);
    let bucket = match (&cli.bucket, cli.hybrid) {
        (Some(uri), true) => BucketStore::new(uri, metadata.clone()),
        (Some(_), false) => {
            warn!("--bucket only applies to the hybrid setup, using the instance bucket");
            BucketStore::from_metadata(metadata.clone()).await
        }
        (None, _) => BucketStore::from_metadata(metadata.clone()).await,
    };
    let bucket = Arc::new(bucket.context("Failed to locate the cluster bucket")?);

    let host = Host::system(metadata, bucket.clone());
    let bootstrap = Bootstrap::new(host, paths);

    let report = if cli.hybrid {
        bootstrap.run_hybrid(&*bucket).await
    } else {
        bootstrap.run(&*bucket).await
    };

    if report.succeeded() {
        info!("Setup finished");
        Ok(ExitCode::SUCCESS)
    } else {
        error!("Setup failed, see {}", NodePaths::new().setup_log().display());
        Ok(ExitCode::FAILURE)
    }
}
