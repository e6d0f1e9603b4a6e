//! Orchestration loop.
//!
//! [`Devbox::provision`] brings a session up in strict order: environment,
//! namespace, object storage, interceptor, binaries, webhook, agent.
//! [`Devbox::watch`] then runs one watcher per binary group and feeds file
//! changes into that group's [`RebuildSlot`]. [`Devbox::teardown`] removes
//! the namespace, the webhook and the environment, once.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::{join_all, try_join_all};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::AgentPod;
use crate::blob::BlobConnector;
use crate::builder::Binary;
use crate::cluster::ClusterClient;
use crate::config::{BinaryGroup, DevboxConfig, Platform};
use crate::control_plane::{ControlPlane, Environment};
use crate::crd_sync::CrdSync;
use crate::error::{BlobError, BuildError, ClusterError, DevboxError, ProvisionError, WatchError};
use crate::interceptor::PodInterceptor;
use crate::namespace::{NamespaceProvisioner, AGENT_SERVICE_ACCOUNT};
use crate::obs::{
    emit_rebuild_cancelled, emit_rebuild_failed, emit_rebuild_finished, emit_rebuild_started,
    emit_teardown_error, PhaseTimer,
};
use crate::rebuild::{RebuildCounts, RebuildSlot, RebuildStats};
use crate::storage::{ObjectStorage, Upload};
use crate::watcher::FsWatcher;

/// Collaborators of one session, built once by the caller.
pub struct DevboxContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub blobs: Arc<dyn BlobConnector>,
    pub config: DevboxConfig,
}

/// What a user needs to reach a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub environment: Environment,
    pub namespace: String,
    pub dashboard_url: String,
}

struct Group {
    spec: BinaryGroup,
    binaries: Vec<Arc<Binary>>,
    roots: Vec<PathBuf>,
    // set once a changed artifact is uploaded, cleared after the agent is back
    restart_pending: AtomicBool,
}

/// A provisioned session, ready to watch.
pub struct Session {
    pub info: SessionInfo,
    groups: Vec<Arc<Group>>,
    resources: Option<CrdSync>,
}

#[derive(Debug, Default)]
struct Progress {
    environment: Option<Environment>,
    namespace: bool,
}

struct RebuildOutcome {
    hashes: String,
    changed: bool,
    restarted: bool,
}

struct Inner {
    ctx: DevboxContext,
    namespace: NamespaceProvisioner,
    storage: ObjectStorage,
    interceptor: PodInterceptor,
    agent: AgentPod,
    progress: Mutex<Progress>,
    torn_down: tokio::sync::Mutex<bool>,
    stats: RebuildStats,
}

impl Inner {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One development session.
#[derive(Clone)]
pub struct Devbox {
    inner: Arc<Inner>,
}

async fn phase<T, E, Fut>(token: &CancellationToken, name: &str, work: Fut) -> Result<T, DevboxError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<ProvisionError>,
{
    if token.is_cancelled() {
        return Err(DevboxError::Cancelled);
    }
    let timer = PhaseTimer::start(name);
    match work.await {
        Ok(value) => {
            timer.finish();
            Ok(value)
        }
        Err(_) if token.is_cancelled() => {
            info!(phase = %name, "interrupted");
            Err(DevboxError::Cancelled)
        }
        Err(e) => {
            let e = e.into();
            timer.fail(&e);
            Err(DevboxError::provisioning(name, e))
        }
    }
}

fn combined<T, E: Into<ProvisionError>>(results: Vec<Result<T, E>>) -> Result<Vec<T>, ProvisionError> {
    let mut values = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => errors.push(e.into()),
        }
    }
    match ProvisionError::combine(errors) {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

fn prepare_groups(config: &DevboxConfig, platform: &Platform) -> Result<Vec<Arc<Group>>, BuildError> {
    let output_dir = config.output_dir();
    config
        .groups
        .iter()
        .map(|spec| {
            let binaries = spec
                .targets
                .iter()
                .map(|target| {
                    Binary::from_target(target, &config.workspace, &output_dir, platform)
                        .map(Arc::new)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(Group {
                spec: spec.clone(),
                binaries,
                roots: config.watch_roots(spec),
                restart_pending: AtomicBool::new(false),
            }))
        })
        .collect()
}

fn is_foreign_namespace(err: &DevboxError) -> bool {
    matches!(
        err,
        DevboxError::Provisioning {
            source: ProvisionError::Cluster(ClusterError::NotDevboxNamespace(_)),
            ..
        }
    )
}

impl Devbox {
    pub fn new(ctx: DevboxContext) -> Self {
        let config = &ctx.config;
        let ns = config.namespace();
        let namespace = NamespaceProvisioner::new(
            ctx.cluster.clone(),
            ns.clone(),
            config.terminating_retry,
            config.readiness.timeout,
        );
        let storage = ObjectStorage::new(
            ctx.cluster.clone(),
            &ns,
            &config.images.storage,
            ctx.blobs.clone(),
            config.readiness,
            config.upload,
        );
        let interceptor = PodInterceptor::new(
            ctx.cluster.clone(),
            &ns,
            &config.images.placeholder,
            config.readiness,
        );
        let agent = AgentPod::new(
            ctx.cluster.clone(),
            &ns,
            &config.images.agent,
            &config.images.placeholder,
            AGENT_SERVICE_ACCOUNT,
            config.readiness,
        );
        Self {
            inner: Arc::new(Inner {
                ctx,
                namespace,
                storage,
                interceptor,
                agent,
                progress: Mutex::new(Progress::default()),
                torn_down: tokio::sync::Mutex::new(false),
                stats: RebuildStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &DevboxConfig {
        &self.inner.ctx.config
    }

    pub fn rebuild_counts(&self) -> RebuildCounts {
        self.inner.stats.snapshot()
    }

    /// Provision, watch until `token` fires, then tear down.
    ///
    /// Interruption is a clean exit; a provisioning failure is returned after
    /// whatever was already created has been removed.
    pub async fn run<F>(&self, token: &CancellationToken, on_ready: F) -> Result<(), DevboxError>
    where
        F: FnOnce(&SessionInfo),
    {
        let result = match self.provision(token).await {
            Ok(session) => {
                on_ready(&session.info);
                self.watch(session, token).await
            }
            Err(e) => Err(e),
        };
        let failures = self.teardown().await;
        if !failures.is_empty() {
            warn!(failures = failures.len(), "teardown incomplete");
        }
        match result {
            Err(DevboxError::Cancelled) => Ok(()),
            other => other,
        }
    }

    pub async fn provision(&self, token: &CancellationToken) -> Result<Session, DevboxError> {
        let inner = &self.inner;
        let ctx = &inner.ctx;
        let config = &ctx.config;

        let environment = phase(
            token,
            "create environment",
            ctx.control_plane.create_environment(&config.name),
        )
        .await?;
        inner.progress().environment = Some(environment.clone());

        inner.progress().namespace = true;
        if let Err(e) = phase(token, "create namespace", inner.namespace.create(token)).await {
            if is_foreign_namespace(&e) {
                inner.progress().namespace = false;
            }
            return Err(e);
        }

        phase(token, "deploy object storage", inner.storage.deploy(token)).await?;
        phase(
            token,
            "wait for object storage",
            inner.storage.wait_for_ready(token),
        )
        .await?;
        phase(token, "connect object storage", inner.storage.connect(token)).await?;

        let platform = phase(token, "detect platform", ctx.cluster.node_platform()).await?;
        info!(platform = %platform, "cluster platform");

        let interceptor = phase(token, "build interceptor", async {
            let binary = Binary::from_target(
                &config.interceptor,
                &config.workspace,
                &config.output_dir(),
                &platform,
            )?;
            binary.build(token).await?;
            Ok::<_, BuildError>(binary)
        })
        .await?;
        phase(
            token,
            "deploy interceptor",
            inner.interceptor.deploy(
                interceptor.output_path(),
                &config.images.init,
                &config.images.toolkit,
                token,
            ),
        )
        .await?;
        phase(
            token,
            "wait for interceptor",
            inner.interceptor.wait_for_ready(token),
        )
        .await?;

        let groups = phase(token, "prepare binaries", async {
            prepare_groups(config, &platform)
        })
        .await?;
        let binaries: Vec<Arc<Binary>> = groups
            .iter()
            .flat_map(|g| g.binaries.iter().cloned())
            .collect();
        phase(token, "build binaries", async {
            combined(join_all(binaries.iter().map(|b| b.build(token))).await)
        })
        .await?;
        phase(token, "upload binaries", async {
            combined(join_all(binaries.iter().map(|b| self.upload_binary(b, token))).await)
        })
        .await?;

        phase(token, "enable webhook", inner.interceptor.enable()).await?;

        let connection = ctx.control_plane.connection();
        phase(
            token,
            "deploy agent",
            inner.agent.deploy(&environment, &connection, token),
        )
        .await?;
        phase(token, "wait for agent", inner.agent.wait_for_ready(token)).await?;

        let resources = if config.sync_paths.is_empty() {
            None
        } else {
            let sync = phase(token, "load manifests", async {
                CrdSync::load(&config.sync_paths)
            })
            .await?;
            let timer = PhaseTimer::start("push manifests");
            let failures = sync
                .push_all(
                    ctx.control_plane.workflow_client(&environment.id),
                    config.crd_push_concurrency,
                )
                .await;
            for (name, e) in &failures {
                warn!(resource = %name, error = %e, "failed to push resource");
            }
            timer.finish();
            Some(sync)
        };

        Ok(Session {
            info: SessionInfo {
                dashboard_url: ctx.control_plane.dashboard_url(&environment),
                namespace: config.namespace(),
                environment,
            },
            groups,
            resources,
        })
    }

    async fn upload_binary(&self, binary: &Binary, token: &CancellationToken) -> Result<Upload, BlobError> {
        let data = tokio::fs::read(binary.output_path()).await?;
        self.inner.storage.upload(binary.name(), data, token).await
    }

    /// Follow source changes until `token` fires.
    ///
    /// A watcher that fails stops only its own group; the session stays up.
    pub async fn watch(&self, session: Session, token: &CancellationToken) -> Result<(), DevboxError> {
        let mut loops = Vec::new();
        for group in &session.groups {
            let devbox = self.clone();
            let group = Arc::clone(group);
            let token = token.clone();
            loops.push(tokio::spawn(async move {
                let name = group.spec.name.clone();
                (name, devbox.watch_group(group, token).await)
            }));
        }
        if let Some(resources) = session.resources {
            let devbox = self.clone();
            let environment = session.info.environment.id.clone();
            let token = token.clone();
            loops.push(tokio::spawn(async move {
                let result = devbox.follow_resources(resources, &environment, token).await;
                ("manifests".to_string(), result)
            }));
        }
        info!(loops = loops.len(), "watching for changes");

        for joined in join_all(loops).await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => error!(watch = %name, error = %e, "watch loop stopped"),
                Err(e) => error!(error = %e, "watch loop panicked"),
            }
        }
        token.cancelled().await;
        Ok(())
    }

    async fn watch_group(&self, group: Arc<Group>, token: CancellationToken) -> Result<(), WatchError> {
        let mut watcher = FsWatcher::sources(&group.roots)?;
        let mut slot = RebuildSlot::new(
            group.spec.name.clone(),
            token.clone(),
            self.config().debounce,
        );
        let result = loop {
            match watcher.next(&token).await {
                Ok(path) => {
                    debug!(group = %slot.group(), path = %path.display(), "source changed");
                    let devbox = self.clone();
                    let group = Arc::clone(&group);
                    slot.trigger(move |session| async move {
                        devbox.rebuild(&group, &path, &session).await;
                    })
                    .await;
                }
                Err(WatchError::Cancelled) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        slot.finish().await;
        result
    }

    async fn rebuild(&self, group: &Group, path: &Path, token: &CancellationToken) {
        let name = group.spec.name.as_str();
        let started = Instant::now();
        emit_rebuild_started(name, &path.display().to_string());
        match self.run_rebuild(group, token).await {
            Ok(outcome) => {
                emit_rebuild_finished(
                    name,
                    &outcome.hashes,
                    outcome.changed,
                    started.elapsed().as_millis() as u64,
                );
                self.inner.stats.record_completed(outcome.restarted);
            }
            Err(_) if token.is_cancelled() => {
                emit_rebuild_cancelled(name);
                self.inner.stats.record_cancelled();
            }
            Err(e) => {
                emit_rebuild_failed(name, &e);
                self.inner.stats.record_failed();
            }
        }
    }

    async fn run_rebuild(&self, group: &Group, token: &CancellationToken) -> Result<RebuildOutcome, DevboxError> {
        let digests = try_join_all(group.binaries.iter().map(|b| b.build(token))).await?;
        let uploads =
            try_join_all(group.binaries.iter().map(|b| self.upload_binary(b, token))).await?;

        let changed = uploads.iter().any(|u| u.changed);
        if changed && group.spec.restart_agent {
            group.restart_pending.store(true, Ordering::SeqCst);
        }
        let mut restarted = false;
        if group.restart_pending.load(Ordering::SeqCst) {
            let agent = &self.inner.agent;
            agent
                .restart(token)
                .await
                .map_err(|e| DevboxError::provisioning("restart agent", e))?;
            agent
                .wait_for_ready(token)
                .await
                .map_err(|e| DevboxError::provisioning("wait for agent", e))?;
            group.restart_pending.store(false, Ordering::SeqCst);
            restarted = true;
        }

        Ok(RebuildOutcome {
            hashes: digests
                .iter()
                .map(|d| d.short())
                .collect::<Vec<_>>()
                .join(","),
            changed,
            restarted,
        })
    }

    async fn follow_resources(
        &self,
        mut resources: CrdSync,
        environment: &str,
        token: CancellationToken,
    ) -> Result<(), WatchError> {
        let client = self.inner.ctx.control_plane.workflow_client(environment);
        loop {
            let update = match resources.next(&token).await {
                Ok(update) => update,
                Err(WatchError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };
            match update.apply(client.as_ref()).await {
                Ok(()) => info!(kind = %update.kind, name = %update.name, op = ?update.op, "resource synced"),
                Err(e) => warn!(kind = %update.kind, name = %update.name, error = %e, "resource sync failed"),
            }
        }
    }

    /// Delete the namespace, the webhook and the environment.
    ///
    /// Runs at most once; later calls return immediately. Steps that fail
    /// are logged and returned, the remaining steps still run.
    pub async fn teardown(&self) -> Vec<DevboxError> {
        let mut done = self.inner.torn_down.lock().await;
        if *done {
            return Vec::new();
        }
        *done = true;

        let (environment, namespace) = {
            let progress = self.inner.progress();
            (progress.environment.clone(), progress.namespace)
        };
        let mut failures = Vec::new();
        if namespace {
            record(
                "delete namespace",
                self.inner.namespace.destroy().await,
                &mut failures,
            );
            record(
                "disable webhook",
                self.inner.interceptor.disable().await,
                &mut failures,
            );
        }
        if let Some(environment) = environment {
            record(
                "delete environment",
                self.inner
                    .ctx
                    .control_plane
                    .delete_environment(&environment.id)
                    .await,
                &mut failures,
            );
        }
        failures
    }
}

fn record<E>(step: &str, result: Result<(), E>, failures: &mut Vec<DevboxError>)
where
    E: std::error::Error + 'static,
{
    match result {
        Ok(()) => info!(step = %step, "teardown step done"),
        Err(e) => {
            emit_teardown_error(step, &e);
            failures.push(DevboxError::Teardown(format!("{step}: {e}")));
        }
    }
}

/// Delete `environments`, returning how many were removed.
pub async fn delete_environments(control_plane: &dyn ControlPlane, environments: &[Environment]) -> usize {
    let results = join_all(
        environments
            .iter()
            .map(|environment| control_plane.delete_environment(&environment.id)),
    )
    .await;
    let mut deleted = 0;
    for (environment, result) in environments.iter().zip(results) {
        match result {
            Ok(()) => deleted += 1,
            Err(e) => warn!(environment = %environment.id, error = %e, "failed to delete environment"),
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BinaryTarget;
    use crate::fakes::{FakeCluster, FakeControlPlane, MemoryBlobConnector, MemoryBlobStore};
    use crate::poll::PollPolicy;
    use std::time::Duration;

    struct Harness {
        cluster: Arc<FakeCluster>,
        control_plane: Arc<FakeControlPlane>,
        store: Arc<MemoryBlobStore>,
        devbox: Devbox,
        dir: tempfile::TempDir,
    }

    fn harness(setup: impl FnOnce(&FakeCluster, &FakeControlPlane)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.src"), "agent v1").unwrap();
        let cluster = Arc::new(FakeCluster::new());
        let control_plane = Arc::new(FakeControlPlane::new());
        setup(&cluster, &control_plane);
        let store = Arc::new(MemoryBlobStore::new());

        let mut config = DevboxConfig::new("abc", dir.path())
            .with_interceptor(BinaryTarget::command(
                "devbox-interceptor",
                "sh",
                &["-c", "echo server > interceptor.out"],
                "interceptor.out",
            ))
            .with_groups(vec![BinaryGroup {
                name: "agent".to_string(),
                targets: vec![BinaryTarget::command(
                    "agent",
                    "sh",
                    &["-c", "cp agent.src agent.out"],
                    "agent.out",
                )],
                source_dirs: Vec::new(),
                restart_agent: true,
            }]);
        config.readiness = PollPolicy::fixed(Duration::from_millis(10), Duration::from_secs(2));
        config.terminating_retry = Duration::from_millis(5);
        config.upload.base_delay = Duration::from_millis(1);

        let devbox = Devbox::new(DevboxContext {
            cluster: cluster.clone(),
            control_plane: control_plane.clone(),
            blobs: Arc::new(MemoryBlobConnector::new(store.clone())),
            config,
        });
        Harness {
            cluster,
            control_plane,
            store,
            devbox,
            dir,
        }
    }

    #[tokio::test]
    async fn provision_brings_everything_up() {
        let h = harness(|_, _| {});
        let token = CancellationToken::new();

        let session = h.devbox.provision(&token).await.unwrap();
        assert_eq!(session.info.namespace, "devbox-abc");
        assert_eq!(session.info.environment.name, "abc");
        assert!(session.info.dashboard_url.contains(&session.info.environment.id));

        assert!(h.cluster.has_namespace("devbox-abc"));
        for pod in ["devbox-storage", "devbox-interceptor", "devbox-agent"] {
            assert!(h.cluster.pod("devbox-abc", pod).is_some(), "missing {pod}");
        }
        assert_eq!(h.cluster.webhooks().len(), 1);
        assert_eq!(h.store.object("bin/agent").unwrap(), b"agent v1");
        token.cancel();
    }

    #[tokio::test]
    async fn teardown_runs_once() {
        let h = harness(|_, _| {});
        let token = CancellationToken::new();
        let session = h.devbox.provision(&token).await.unwrap();

        let (first, second) = tokio::join!(h.devbox.teardown(), h.devbox.teardown());
        assert!(first.is_empty() && second.is_empty());
        assert!(!h.cluster.has_namespace("devbox-abc"));
        assert!(h.cluster.webhooks().is_empty());
        assert_eq!(h.control_plane.deleted(), vec![session.info.environment.id]);
        token.cancel();
    }

    #[tokio::test]
    async fn failed_build_tears_down_partial_session() {
        let h = harness(|_, _| {});
        std::fs::remove_file(h.dir.path().join("agent.src")).unwrap();
        let token = CancellationToken::new();

        let err = h.devbox.run(&token, |_| {}).await.unwrap_err();
        match err {
            DevboxError::Provisioning { phase, .. } => assert_eq!(phase, "build binaries"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!h.cluster.has_namespace("devbox-abc"));
        assert!(h.cluster.webhooks().is_empty());
        assert!(h.control_plane.environments().is_empty());
    }

    #[tokio::test]
    async fn foreign_namespace_is_left_alone() {
        let h = harness(|cluster, _| cluster.insert_namespace("devbox-abc", None));
        let token = CancellationToken::new();

        let err = h.devbox.run(&token, |_| {}).await.unwrap_err();
        assert!(is_foreign_namespace(&err));
        assert!(h.cluster.has_namespace("devbox-abc"));
        assert!(h.control_plane.environments().is_empty());
    }

    #[tokio::test]
    async fn environment_failure_creates_nothing() {
        let h = harness(|_, control_plane| control_plane.fail_environment_creation());
        let token = CancellationToken::new();

        let err = h.devbox.run(&token, |_| {}).await.unwrap_err();
        assert!(err.to_string().starts_with("create environment failed"));
        assert_eq!(h.cluster.namespace_creations("devbox-abc"), 0);
        assert!(h.control_plane.deleted().is_empty());
    }

    #[tokio::test]
    async fn obsolete_environments_are_deleted() {
        let control_plane = FakeControlPlane::new();
        control_plane.insert_environment("old-1", false);
        control_plane.insert_environment("old-2", false);
        control_plane.insert_environment("live", true);

        let obsolete = control_plane.list_obsolete_environments().await.unwrap();
        assert_eq!(obsolete.len(), 2);
        let deleted = delete_environments(&control_plane, &obsolete).await;
        assert_eq!(deleted, 2);
        assert_eq!(control_plane.environments().len(), 1);
    }
}
