//! End-to-end session behaviour against in-memory cluster, control plane and
//! object storage.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use devbox_core::fakes::{
    FakeCluster, FakeControlPlane, MemoryBlobConnector, MemoryBlobStore, WorkflowCall,
};
use devbox_core::{
    BinaryGroup, BinaryTarget, ContentDigest, Devbox, DevboxConfig, DevboxContext, DevboxError,
    PollPolicy, SessionInfo,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Fixture {
    cluster: Arc<FakeCluster>,
    control_plane: Arc<FakeControlPlane>,
    store: Arc<MemoryBlobStore>,
    workspace: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(workspace.path().join("src")).unwrap();
        std::fs::write(workspace.path().join("src/lib.rs"), "pub fn v() -> u8 { 1 }\n").unwrap();
        Self {
            cluster: Arc::new(FakeCluster::new()),
            control_plane: Arc::new(FakeControlPlane::new()),
            store: Arc::new(MemoryBlobStore::new()),
            workspace,
        }
    }

    fn config(&self) -> DevboxConfig {
        let mut config = DevboxConfig::new("abc", self.workspace.path())
            .with_interceptor(BinaryTarget::command(
                "devbox-interceptor",
                "sh",
                &["-c", "echo interceptor > interceptor.out"],
                "interceptor.out",
            ))
            .with_groups(vec![BinaryGroup {
                name: "agent".to_string(),
                targets: vec![BinaryTarget::command(
                    "agent",
                    "sh",
                    &["-c", "cat src/lib.rs > agent.out"],
                    "agent.out",
                )],
                source_dirs: vec!["src".into()],
                restart_agent: true,
            }]);
        config.debounce = Duration::from_millis(300);
        config.readiness = PollPolicy::fixed(Duration::from_millis(10), Duration::from_secs(5));
        config.terminating_retry = Duration::from_millis(5);
        config.upload.base_delay = Duration::from_millis(1);
        config
    }

    fn devbox(&self, config: DevboxConfig) -> Devbox {
        Devbox::new(DevboxContext {
            cluster: self.cluster.clone(),
            control_plane: self.control_plane.clone(),
            blobs: Arc::new(MemoryBlobConnector::new(self.store.clone())),
            config,
        })
    }

    fn save(&self, relative: &str, content: &str) {
        std::fs::write(self.workspace.path().join(relative), content).unwrap();
    }
}

/// Start a session in the background; resolves once it is ready.
async fn start(
    devbox: &Devbox,
    token: &CancellationToken,
) -> (SessionInfo, JoinHandle<Result<(), DevboxError>>) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let session = devbox.clone();
    let run_token = token.clone();
    let handle = tokio::spawn(async move {
        session
            .run(&run_token, move |info| {
                let _ = ready_tx.send(info.clone());
            })
            .await
    });
    let info = tokio::time::timeout(Duration::from_secs(30), ready_rx)
        .await
        .expect("session not ready in time")
        .expect("session ended before becoming ready");
    // let the watchers register
    tokio::time::sleep(Duration::from_millis(500)).await;
    (info, handle)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn session_lives_until_interrupted() {
    let fixture = Fixture::new();
    let devbox = fixture.devbox(fixture.config());
    let token = CancellationToken::new();

    let (info, handle) = start(&devbox, &token).await;
    assert_eq!(info.namespace, "devbox-abc");
    assert_eq!(info.environment.name, "abc");
    assert!(fixture.control_plane.has_environment_named("abc"));
    assert!(fixture.cluster.has_namespace("devbox-abc"));
    assert_eq!(fixture.cluster.webhooks().len(), 1);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();

    assert!(!fixture.cluster.has_namespace("devbox-abc"));
    assert!(fixture.cluster.webhooks().is_empty());
    assert!(fixture.control_plane.environments().is_empty());
    assert_eq!(fixture.control_plane.deleted(), vec![info.environment.id]);
}

#[tokio::test]
async fn uploaded_binary_matches_local_build() {
    let fixture = Fixture::new();
    let devbox = fixture.devbox(fixture.config());
    let token = CancellationToken::new();

    let (_, handle) = start(&devbox, &token).await;
    let local = read(&devbox.config().output_dir().join("agent"));
    let remote = fixture.store.object("bin/agent").unwrap();
    assert_eq!(ContentDigest::from_bytes(&remote), ContentDigest::from_bytes(&local));

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn burst_of_saves_rebuilds_once() {
    let fixture = Fixture::new();
    let devbox = fixture.devbox(fixture.config());
    let token = CancellationToken::new();

    let (_, handle) = start(&devbox, &token).await;
    assert_eq!(fixture.cluster.pod_creations("devbox-agent"), 1);

    fixture.save("src/lib.rs", "pub fn v() -> u8 { 2 }\n");
    tokio::time::sleep(Duration::from_millis(50)).await;
    fixture.save("src/lib.rs", "pub fn v() -> u8 { 3 }\n");

    wait_until("rebuild", || devbox.rebuild_counts().completed >= 1).await;
    // nothing else is pending
    tokio::time::sleep(Duration::from_millis(800)).await;

    let counts = devbox.rebuild_counts();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.restarts, 1);
    assert_eq!(fixture.cluster.pod_creations("devbox-agent"), 2);
    assert_eq!(
        fixture.store.object("bin/agent").unwrap(),
        b"pub fn v() -> u8 { 3 }\n"
    );

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_rebuild_keeps_session_running() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.groups[0].targets = vec![BinaryTarget::command(
        "agent",
        "sh",
        &["-c", "grep -q broken src/lib.rs && exit 1; cat src/lib.rs > agent.out"],
        "agent.out",
    )];
    let devbox = fixture.devbox(config);
    let token = CancellationToken::new();

    let (_, handle) = start(&devbox, &token).await;
    fixture.save("src/lib.rs", "broken\n");
    wait_until("failed rebuild", || devbox.rebuild_counts().failed >= 1).await;
    assert!(!handle.is_finished());
    assert_eq!(fixture.cluster.pod_creations("devbox-agent"), 1);

    fixture.save("src/lib.rs", "pub fn v() -> u8 { 4 }\n");
    wait_until("recovery", || devbox.rebuild_counts().completed >= 1).await;

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn foreign_namespace_aborts_and_survives() {
    let fixture = Fixture::new();
    fixture.cluster.insert_namespace("devbox-abc", None);
    let devbox = fixture.devbox(fixture.config());
    let token = CancellationToken::new();

    let err = devbox.run(&token, |_| {}).await.unwrap_err();
    assert!(err.to_string().contains("not a devbox namespace"));
    assert!(fixture.cluster.has_namespace("devbox-abc"));
    assert!(fixture.control_plane.environments().is_empty());
}

#[tokio::test]
async fn manifests_are_mirrored_and_followed() {
    let fixture = Fixture::new();
    let manifests = fixture.workspace.path().join("workflows");
    std::fs::create_dir_all(&manifests).unwrap();
    std::fs::write(
        manifests.join("smoke.yaml"),
        "kind: TestWorkflow\nmetadata:\n  name: smoke\nspec:\n  steps: [{shell: echo hi}]\n",
    )
    .unwrap();
    let config = fixture.config().with_sync_paths(vec![manifests.clone()]);
    let devbox = fixture.devbox(config);
    let token = CancellationToken::new();

    let (info, handle) = start(&devbox, &token).await;
    assert!(fixture.control_plane.calls().contains(&WorkflowCall::Create {
        environment: info.environment.id.clone(),
        kind: devbox_core::control_plane::ResourceKind::Workflow,
        name: "smoke".to_string(),
    }));

    std::fs::write(
        manifests.join("smoke.yaml"),
        "kind: TestWorkflow\nmetadata:\n  name: smoke\nspec:\n  steps: [{shell: echo bye}]\n",
    )
    .unwrap();
    wait_until("resource update", || {
        fixture
            .control_plane
            .calls()
            .iter()
            .any(|call| matches!(call, WorkflowCall::Update { name, .. } if name == "smoke"))
    })
    .await;

    token.cancel();
    handle.await.unwrap().unwrap();
}
