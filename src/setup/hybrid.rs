//! Hybrid identity migration
//!
//! In a hybrid cluster the slurm account must carry the same numeric ids as
//! on the external controller. When the configured ids differ from the local
//! ones, the account is renumbered and the files it owned are handed over.

use super::SetupContext;
use crate::exec::{CommandLine, CommandOutput};
use crate::identity::SLURM_USER;
use crate::reconcile::{Owner, OwnershipChange, remap_ownership};
use crate::{Host, SetupError};
use tracing::{error, info};

async fn renumber(host: &Host, cmd: CommandLine) -> bool {
    match host.runner.run(&cmd).await {
        Ok(CommandOutput {
            code: Some(0), ..
        }) => true,
        Ok(output) => {
            error!(
                "Cannot run '{}' rc={:?} stdout={} stderr={}",
                cmd, output.code, output.stdout, output.stderr
            );
            false
        }
        Err(e) => {
            error!("Cannot run '{}': {}", cmd, e);
            false
        }
    }
}

/// Renumber the slurm account to the configured hybrid ids.
///
/// The group goes first, then the user. If either rename fails the
/// migration stops there, is logged, and setup carries on. Ownership is
/// handed over only when a rename happened. Returns whether it did.
pub async fn migrate_identity(ctx: &SetupContext, host: &Host) -> Result<bool, SetupError> {
    let Some((uid, gid)) = ctx.config.hybrid_ids() else {
        return Ok(false);
    };

    let cur_gid = host.identities.group_id(SLURM_USER)?;
    let cur_uid = host.identities.user_id(SLURM_USER)?;
    let mut renamed = false;

    if cur_gid != gid {
        let cmd = CommandLine::new("groupmod").args(["-g", &gid.to_string(), SLURM_USER]);
        if !renumber(host, cmd).await {
            return Ok(false);
        }
        renamed = true;
    }
    if cur_uid != uid {
        let cmd = CommandLine::new("usermod").args(["-u", &uid.to_string(), SLURM_USER]);
        if !renumber(host, cmd).await {
            return Ok(false);
        }
        renamed = true;
    }
    if !renamed {
        return Ok(false);
    }

    info!(
        "slurm renumbered from {}:{} to {}:{}, updating ownership",
        cur_uid, cur_gid, uid, gid
    );
    let previous = Owner::new(cur_uid, cur_gid);
    let p = &ctx.paths;
    for root in [p.slurm_home(), p.slurm_etc(), p.log(), p.slurm()] {
        let change = OwnershipChange::new(&root, uid, gid).only_from(previous);
        remap_ownership(&change, &*host.fs)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::{MockMetadata, MockScriptStore};
    use crate::config::{Configuration, HybridConf};
    use crate::exec::mock::{MockResponse, MockRunner};
    use crate::identity::StaticIdentities;
    use crate::paths::NodePaths;
    use crate::reconcile::SimulatedFs;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx(uid: u32, gid: u32) -> SetupContext {
        SetupContext {
            config: Configuration {
                slurm_cluster_name: "hpc".to_string(),
                hybrid: true,
                hybrid_conf: Some(HybridConf {
                    slurm_uid: Some(uid),
                    slurm_gid: Some(gid),
                }),
                ..Default::default()
            },
            paths: NodePaths::new(),
            hostname: "hpc-compute-0".to_string(),
            settle_delay: Duration::ZERO,
        }
    }

    fn host(runner: MockRunner, fs: Arc<SimulatedFs>) -> Host {
        Host {
            runner: Arc::new(runner),
            metadata: Arc::new(MockMetadata::new()),
            scripts: Arc::new(MockScriptStore::new()),
            identities: Arc::new(StaticIdentities::new().with_account(SLURM_USER, 10, 10)),
            fs,
        }
    }

    fn tree() -> SimulatedFs {
        SimulatedFs::new()
            .with_entry("/var/lib/slurm", 10, 10)
            .with_entry("/usr/local/etc/slurm/slurm.conf", 10, 10)
            .with_entry("/var/log/slurm/slurmd.log", 20, 10)
            .with_entry("/slurm/scripts/hook.sh", 30, 30)
    }

    #[tokio::test]
    async fn test_matching_ids_do_nothing() {
        let fs = Arc::new(tree());
        let runner = MockRunner::new();
        let host = host(runner, fs.clone());

        assert!(!migrate_identity(&ctx(10, 10), &host).await.unwrap());
        assert!(fs.chowns().is_empty());
    }

    #[tokio::test]
    async fn test_renumber_and_remap_guarded() {
        let fs = Arc::new(tree());
        let host = host(MockRunner::new(), fs.clone());

        assert!(migrate_identity(&ctx(99, 98), &host).await.unwrap());

        assert_eq!(fs.owner_of("/usr/local/etc/slurm/slurm.conf"), Some(Owner::new(99, 98)));
        assert_eq!(fs.owner_of("/var/log/slurm/slurmd.log"), Some(Owner::new(20, 98)));
        assert_eq!(fs.owner_of("/slurm/scripts/hook.sh"), Some(Owner::new(30, 30)));
    }

    #[tokio::test]
    async fn test_group_first_then_user() {
        let runner = Arc::new(MockRunner::new());
        let host = Host {
            runner: runner.clone(),
            ..host(MockRunner::new(), Arc::new(tree()))
        };

        migrate_identity(&ctx(99, 98), &host).await.unwrap();
        assert_eq!(
            runner.commands(),
            vec!["groupmod -g 98 slurm", "usermod -u 99 slurm"]
        );
    }

    #[tokio::test]
    async fn test_failed_rename_is_soft_and_skips_remap() {
        let fs = Arc::new(tree());
        let runner = MockRunner::new().respond("usermod", MockResponse::exit(4, ""));
        let host = host(runner, fs.clone());

        assert!(!migrate_identity(&ctx(99, 98), &host).await.unwrap());
        assert!(fs.chowns().is_empty());
    }
}
