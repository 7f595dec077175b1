//! Whole setup runs against a scratch root, a recording command runner and
//! a simulated ownership table

use slurm_node_setup::cloud::mock::{MockMetadata, MockScriptStore};
use slurm_node_setup::config::mock::MockSource;
use slurm_node_setup::config::{ConfigAcquirer, Configuration, FetchOutcome, NodeRole};
use slurm_node_setup::exec::mock::{MockResponse, MockRunner};
use slurm_node_setup::identity::StaticIdentities;
use slurm_node_setup::paths::NodePaths;
use slurm_node_setup::reconcile::{Owner, SimulatedFs};
use slurm_node_setup::scripts::ScriptCategory;
use slurm_node_setup::{Bootstrap, Host, SetupError, SetupReport, SetupState};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

const CONTROLLER: &str = "slurm_cluster_name: hpc\ninstance_role: controller\n";
const COMPUTE: &str = "slurm_cluster_name: hpc\ninstance_role: compute\n";
const LOGIN: &str = "slurm_cluster_name: hpc\ninstance_role: login\n";

/// A scratch node
struct Node {
    _temp: TempDir,
    paths: NodePaths,
    runner: Arc<MockRunner>,
    fs: Arc<SimulatedFs>,
}

impl Node {
    fn new(runner: MockRunner) -> Self {
        Self::with_fs(runner, SimulatedFs::new())
    }

    fn with_fs(runner: MockRunner, fs: SimulatedFs) -> Self {
        let temp = TempDir::new().unwrap();
        let paths = NodePaths::with_root(temp.path());
        std::fs::create_dir_all(paths.sysconfig()).unwrap();
        std::fs::write(paths.nsswitch(), "passwd:     files\ngroup:      files\n").unwrap();

        // monitoring agent not running
        let runner = runner.respond("is-active", MockResponse::exit(3, ""));
        Self {
            _temp: temp,
            paths,
            runner: Arc::new(runner),
            fs: Arc::new(fs),
        }
    }

    fn host(&self, store: MockScriptStore) -> Host {
        Host {
            runner: self.runner.clone(),
            metadata: Arc::new(MockMetadata::new().with_hostname("hpc-node-0")),
            scripts: Arc::new(store),
            identities: Arc::new(
                StaticIdentities::new()
                    .with_account("slurm", 10, 10)
                    .with_account("munge", 20, 20),
            ),
            fs: self.fs.clone(),
        }
    }

    fn bootstrap(&self, store: MockScriptStore) -> Bootstrap {
        Bootstrap::new(self.host(store), self.paths.clone()).with_settle_delay(Duration::ZERO)
    }

    async fn run(&self, yaml: &str, store: MockScriptStore) -> SetupReport {
        let config = Configuration::from_yaml(yaml).unwrap();
        let source = MockSource::new(vec![FetchOutcome::Ready(config)]);
        self.bootstrap(store).run(&source).await
    }

    fn motd(&self) -> String {
        std::fs::read_to_string(self.paths.motd()).unwrap()
    }

    fn before(&self, first: &str, second: &str) -> bool {
        let a = self.runner.position(first).unwrap();
        let b = self.runner.position(second).unwrap();
        a < b
    }
}

/// In-memory log sink for asserting on emitted events
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ==================== Controller ====================

#[tokio::test]
async fn test_controller_setup_order() {
    let node = Node::new(MockRunner::new());
    let report = node.run(CONTROLLER, MockScriptStore::new()).await;

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(
        report.transitions,
        vec![
            SetupState::Start,
            SetupState::ConfigAcquired,
            SetupState::RoleDispatched(NodeRole::Controller),
            SetupState::Complete,
        ]
    );

    assert!(node.before("wall -n *** Slurm is currently being configured", "restart munge"));
    assert!(node.before("restart munge", "mysql -u root -e create user 'slurm'@'localhost'"));
    assert!(node.before("restart slurmdbd", "sacctmgr -i add cluster hpc"));
    assert!(node.before("sacctmgr", "restart slurmctld"));
    assert!(node.before("start nfs-server", "exportfs -ra"));
    assert!(node.before("exportfs", "status slurmrestd"));
    assert!(node.runner.ran("wall -n *** Slurm controller setup complete ***"));
    assert!(!node.runner.ran("/home on the controller"));

    let p = &node.paths;
    assert!(p.config_snapshot().exists());
    assert!(p.slurm_etc().join("cloud.conf").exists());
    assert!(p.custom_scripts().join("perform_maintenance.sh").exists());
    assert_eq!(std::fs::read_link(p.etc_slurm_link()).unwrap(), p.slurm_etc());
    assert_eq!(
        std::fs::read(p.state().join("jwt_hs256.key")).unwrap().len(),
        32
    );
    assert_eq!(std::fs::read(p.munge().join("munge.key")).unwrap().len(), 1024);
    assert_eq!(
        node.fs.owner_of(p.munge().join("munge.key")),
        Some(Owner::new(20, 20))
    );
    assert_eq!(
        std::fs::read_to_string(p.nfs_exports()).unwrap(),
        "/home *(rw,no_subtree_check,no_root_squash)\n/opt/apps *(rw,no_subtree_check,no_root_squash)\n"
    );
}

#[tokio::test]
async fn test_controller_external_database_skips_mariadb() {
    let node = Node::new(MockRunner::new());
    let yaml = format!("{}cloudsql_secret: projects/p/secrets/db\n", CONTROLLER);
    let report = node.run(&yaml, MockScriptStore::new()).await;

    assert!(report.succeeded());
    assert!(!node.runner.ran("mariadb"));
    assert!(!node.runner.ran("mysql"));
    assert!(node.runner.ran("restart slurmdbd"));
}

#[tokio::test]
async fn test_cluster_already_registered_is_success() {
    let runner = MockRunner::new().respond(
        "sacctmgr",
        MockResponse::exit(1, " This cluster hpc already exists.  Not adding.\n"),
    );
    let node = Node::new(runner);

    let report = node.run(CONTROLLER, MockScriptStore::new()).await;
    assert!(report.succeeded(), "{:?}", report.error);
    assert!(node.runner.ran("restart slurmctld"));
}

#[tokio::test]
async fn test_cluster_registration_low_status_tolerated() {
    let node = Node::new(MockRunner::new().respond("sacctmgr", MockResponse::exit(1, "")));
    assert!(node.run(CONTROLLER, MockScriptStore::new()).await.succeeded());
}

#[tokio::test]
async fn test_cluster_registration_failure_escalates() {
    let node = Node::new(MockRunner::new().respond("sacctmgr", MockResponse::exit(2, "")));
    let report = node.run(CONTROLLER, MockScriptStore::new()).await;

    assert_eq!(*report.final_state(), SetupState::Failed);
    assert!(matches!(
        report.error,
        Some(SetupError::CommandFailed { code: Some(2), .. })
    ));
    assert!(!node.runner.ran("restart slurmctld"));
    assert!(node.motd().contains("Slurm setup failed! Please view log:"));
    assert!(node.runner.ran("wall -n *** Slurm setup failed!"));
}

#[tokio::test]
async fn test_controller_rerun_converges() {
    let runner = MockRunner::new()
        .respond("realpath", MockResponse::exit(0, "/dev/sdb\n"))
        .respond("file -s", MockResponse::exit(0, "/dev/sdb: Linux ext4 filesystem data"));
    let node = Node::new(runner);
    let yaml = format!("{}controller_state_disk:\n  device_name: state\n", CONTROLLER);

    assert!(node.run(&yaml, MockScriptStore::new()).await.succeeded());
    let jwt = std::fs::read(node.paths.state().join("jwt_hs256.key")).unwrap();
    let fstab = std::fs::read_to_string(node.paths.fstab()).unwrap();
    assert_eq!(fstab.lines().count(), 2);
    assert!(fstab.starts_with("/dev/disk/by-id/google-state "));
    assert!(fstab.contains(" none bind 0 0"));

    let report = node.run(&yaml, MockScriptStore::new()).await;
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(std::fs::read_to_string(node.paths.fstab()).unwrap(), fstab);
    assert_eq!(
        std::fs::read(node.paths.state().join("jwt_hs256.key")).unwrap(),
        jwt
    );
    assert!(!node.runner.ran("mkfs"));
}

// ==================== Compute ====================

#[tokio::test]
async fn test_compute_setup() {
    let node = Node::new(MockRunner::new().respond(
        "lspci",
        MockResponse::exit(0, "00:04.0 3D controller: NVIDIA Corporation Device 20b0\n"),
    ));
    let store = MockScriptStore::new()
        .with_script(ScriptCategory::Compute, "10-a.sh", "#!/bin/sh\ntrue\n")
        .with_script(ScriptCategory::Nodeset, "20-b.sh", "#!/bin/sh\ntrue\n")
        .with_script(ScriptCategory::Login, "30-c.sh", "#!/bin/sh\ntrue\n");

    let report = node.run(COMPUTE, store).await;
    assert!(report.succeeded(), "{:?}", report.error);

    let p = &node.paths;
    assert_eq!(
        std::fs::read_to_string(p.sysconfig().join("slurmd")).unwrap(),
        r#"SLURMD_OPTIONS='--conf-server="hpc-controller:6820-6830"'"#
    );
    assert!(
        std::fs::read_to_string(p.nsswitch())
            .unwrap()
            .starts_with("passwd:     slurm files")
    );
    let fstab = std::fs::read_to_string(p.fstab()).unwrap();
    assert!(fstab.contains("hpc-controller:/home "));
    assert!(fstab.contains("hpc-controller:/opt/apps "));

    assert!(node.runner.ran("nvidia-smi"));
    assert!(node.before("10-a.sh", "20-b.sh"));
    assert!(node.before("20-b.sh", "restart slurmd"));
    assert!(!node.runner.ran("30-c.sh"));
    assert!(node.runner.ran("/home on the controller"));
}

#[tokio::test]
async fn test_compute_hook_failure_aborts_run() {
    let runner = MockRunner::new().respond("02-bad.sh", MockResponse::exit(1, "boom"));
    let node = Node::new(runner);
    let store = MockScriptStore::new()
        .with_script(ScriptCategory::Compute, "01-ok.sh", "#!/bin/sh\n")
        .with_script(ScriptCategory::Compute, "02-bad.sh", "#!/bin/sh\nexit 1\n")
        .with_script(ScriptCategory::Compute, "03-never.sh", "#!/bin/sh\n");

    let report = node.run(COMPUTE, store).await;

    assert_eq!(*report.final_state(), SetupState::Failed);
    match &report.error {
        Some(SetupError::CommandFailed { command, code, .. }) => {
            assert!(command.ends_with("02-bad.sh"));
            assert_eq!(*code, Some(1));
        }
        other => panic!("Expected CommandFailed, got {:?}", other),
    }
    assert!(node.runner.ran("01-ok.sh"));
    assert!(!node.runner.ran("03-never.sh"));
    assert!(!node.runner.ran("restart slurmd"));
    assert!(node.motd().contains("setup failed"));
}

#[tokio::test]
async fn test_hybrid_compute_migrates_identity() {
    let temp_fs = SimulatedFs::new();
    let node = Node::with_fs(MockRunner::new(), temp_fs);
    let yaml = format!(
        "{}hybrid: true\nhybrid_conf:\n  slurm_uid: 990\n  slurm_gid: 991\n",
        COMPUTE
    );

    let report = node.run(&yaml, MockScriptStore::new()).await;
    assert!(report.succeeded(), "{:?}", report.error);

    assert!(node.before("groupmod -g 991 slurm", "usermod -u 990 slurm"));
    // directories handed to slurm by the layout step follow the new ids
    assert_eq!(node.fs.owner_of(node.paths.slurm()), Some(Owner::new(990, 991)));
    assert_eq!(
        node.fs.owner_of(node.paths.slurm_etc()),
        Some(Owner::new(990, 991))
    );
    // hybrid nodes do not mount the controller exports
    assert!(!node.paths.fstab().exists());
}

// ==================== Login ====================

#[tokio::test]
async fn test_login_setup() {
    let node = Node::new(MockRunner::new());
    let yaml = format!(
        "{}login_network_storage:\n  - server_ip: 10.0.0.9\n    remote_mount: /scratch\n    local_mount: /scratch\n    fs_type: nfs\n    mount_options: defaults,hard\n",
        LOGIN
    );

    let report = node.run(&yaml, MockScriptStore::new()).await;
    assert!(report.succeeded(), "{:?}", report.error);

    assert_eq!(
        std::fs::read_to_string(node.paths.sysconfig().join("sackd")).unwrap(),
        r#"SACKD_OPTIONS='--conf-server="hpc-controller:6820-6830"'"#
    );
    let fstab = std::fs::read_to_string(node.paths.fstab()).unwrap();
    assert!(fstab.contains("10.0.0.9:/scratch "));
    assert!(fstab.contains(" nfs defaults,hard 0 0"));
    assert!(node.before("restart sackd", "status sackd"));
    assert!(node.runner.ran("wall -n *** Slurm login setup complete ***"));
}

#[tokio::test]
async fn test_login_hook_timeout_aborts_run() {
    let node = Node::new(MockRunner::new().respond("slow.sh", MockResponse::Timeout));
    let store = MockScriptStore::new().with_script(ScriptCategory::Login, "slow.sh", "#!/bin/sh\n");
    let yaml = format!("{}login_startup_scripts_timeout: 5\n", LOGIN);

    let report = node.run(&yaml, store).await;

    match &report.error {
        Some(SetupError::CommandTimeout { timeout, .. }) => {
            assert_eq!(*timeout, Duration::from_secs(5));
        }
        other => panic!("Expected CommandTimeout, got {:?}", other),
    }
    assert!(!node.runner.ran("status sackd"));
}

// ==================== Dispatch ====================

#[tokio::test]
async fn test_unrecognized_role_completes_without_role_setup() {
    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let node = Node::new(MockRunner::new());
    let report = node
        .run("slurm_cluster_name: hpc\ninstance_role: gateway\n", MockScriptStore::new())
        .await;

    assert_eq!(
        report.transitions,
        vec![
            SetupState::Start,
            SetupState::ConfigAcquired,
            SetupState::RoleDispatched(NodeRole::Unrecognized("gateway".to_string())),
            SetupState::Complete,
        ]
    );
    assert!(logs.contents().contains("Unknown node role: \"gateway\""));

    // only banners and the monitoring agent probe
    for line in node.runner.lines() {
        let probe = line.program == "systemctl" && line.args.first().map(String::as_str) == Some("is-active");
        assert!(line.program == "wall" || probe, "unexpected command: {}", line);
    }
    assert!(!node.paths.sysconfig().join("slurmd").exists());
    assert!(!node.paths.sudoers().exists());
}

#[tokio::test]
async fn test_config_not_ready_is_retried() {
    let node = Node::new(MockRunner::new());
    let config = Configuration::from_yaml(LOGIN).unwrap();
    let source = MockSource::new(vec![
        FetchOutcome::NotReady("config.yaml does not exist".to_string()),
        FetchOutcome::Fatal("connection refused".to_string()),
        FetchOutcome::Ready(config),
    ]);

    let report = node
        .bootstrap(MockScriptStore::new())
        .with_acquirer(ConfigAcquirer::new().with_backoff(Duration::from_millis(1)))
        .run(&source)
        .await;

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(source.calls(), 3);
}

// ==================== Hybrid ====================

#[tokio::test]
async fn test_hybrid_setup_renders_configs_without_banner() {
    let node = Node::new(MockRunner::new());
    let config = Configuration::from_yaml(CONTROLLER).unwrap();
    let source = MockSource::new(vec![FetchOutcome::Ready(config)]);

    let report = node.bootstrap(MockScriptStore::new()).run_hybrid(&source).await;

    assert_eq!(
        report.transitions,
        vec![SetupState::Start, SetupState::ConfigAcquired, SetupState::Complete]
    );
    assert!(node.paths.slurm_etc().join("cloud.conf").exists());
    assert!(node.runner.commands().is_empty());
    assert!(!node.paths.motd().exists());
}

#[tokio::test]
async fn test_hybrid_failure_leaves_banner_alone() {
    let node = Node::new(MockRunner::new());
    // the generated config directory cannot be created over a file
    std::fs::create_dir_all(node.paths.prefix().join("etc")).unwrap();
    std::fs::write(node.paths.slurm_etc(), "not a directory").unwrap();

    let config = Configuration::from_yaml(CONTROLLER).unwrap();
    let source = MockSource::new(vec![FetchOutcome::Ready(config)]);
    let report = node.bootstrap(MockScriptStore::new()).run_hybrid(&source).await;

    assert_eq!(*report.final_state(), SetupState::Failed);
    assert!(node.runner.commands().is_empty());
    assert!(!node.paths.motd().exists());
}
