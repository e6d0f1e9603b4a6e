//! In-memory fakes for the cluster, control plane and blob store (testing only)
//!
//! `FakeCluster` keeps every object in maps and reports pods as started and
//! ready as soon as they are created. `FakeControlPlane` hands out sequential
//! environment ids. `MemoryBlobStore` can inject put failures and stalls.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{
    ContainerStatus, Namespace, Pod, PodStatus, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::net::TcpStream;

use crate::blob::{BlobConnector, BlobStore};
use crate::cluster::{
    BoxedPortStream, ClusterClient, ClusterResult, ExecOutput, DEVBOX_LABEL,
};
use crate::config::Platform;
use crate::control_plane::{
    AgentConnection, ControlPlane, ControlPlaneResult, Environment, ResourceKind, WorkflowClient,
};
use crate::error::{BlobError, ClusterError, ControlPlaneError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `k=v` and bare `k` (exists) terms joined by commas.
fn selector_matches(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.and_then(|l| l.get(key)).is_some_and(|v| v == value),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// FakeCluster
// ---------------------------------------------------------------------------

/// One recorded remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub stdin: Vec<u8>,
}

/// Names of access objects in one namespace, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RbacSnapshot {
    pub service_accounts: Vec<String>,
    pub roles: Vec<String>,
    pub role_bindings: Vec<String>,
}

#[derive(Debug)]
struct ClusterState {
    namespaces: BTreeMap<String, Namespace>,
    namespace_creations: HashMap<String, usize>,
    terminating: HashMap<String, usize>,
    service_accounts: Vec<(String, ServiceAccount)>,
    roles: Vec<(String, Role)>,
    role_bindings: Vec<(String, RoleBinding)>,
    secrets: BTreeMap<(String, String), Secret>,
    pods: BTreeMap<(String, String), Pod>,
    pod_creations: HashMap<String, usize>,
    services: BTreeMap<(String, String), Service>,
    webhooks: BTreeMap<String, MutatingWebhookConfiguration>,
    webhook_creations: usize,
    execs: Vec<ExecCall>,
    exec_failure: Option<String>,
    exposed: HashMap<(String, u16), SocketAddr>,
    pods_ready: bool,
    next_ip: u32,
    platform: Platform,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            namespaces: BTreeMap::new(),
            namespace_creations: HashMap::new(),
            terminating: HashMap::new(),
            service_accounts: Vec::new(),
            roles: Vec::new(),
            role_bindings: Vec::new(),
            secrets: BTreeMap::new(),
            pods: BTreeMap::new(),
            pod_creations: HashMap::new(),
            services: BTreeMap::new(),
            webhooks: BTreeMap::new(),
            webhook_creations: 0,
            execs: Vec::new(),
            exec_failure: None,
            exposed: HashMap::new(),
            pods_ready: true,
            next_ip: 1,
            platform: Platform::new("linux", "amd64"),
        }
    }
}

/// In-memory cluster.
#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readiness reported by pods created from now on.
    pub fn set_pods_ready(&self, ready: bool) {
        lock(&self.state).pods_ready = ready;
    }

    pub fn set_platform(&self, platform: Platform) {
        lock(&self.state).platform = platform;
    }

    /// Make every exec report failure with `output`.
    pub fn fail_exec(&self, output: &str) {
        lock(&self.state).exec_failure = Some(output.to_string());
    }

    /// The next `times` creations of `name` report a terminating namespace.
    pub fn terminate_namespace_for(&self, name: &str, times: usize) {
        lock(&self.state)
            .terminating
            .insert(name.to_string(), times);
    }

    /// Seed a namespace; `marker` becomes the devbox label value.
    pub fn insert_namespace(&self, name: &str, marker: Option<&str>) {
        let labels = marker.map(|m| BTreeMap::from([(DEVBOX_LABEL.to_string(), m.to_string())]));
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels,
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        lock(&self.state)
            .namespaces
            .insert(name.to_string(), namespace);
    }

    /// Route port-forwards of `pod:port` to a local listener.
    pub fn expose(&self, pod: &str, port: u16, addr: SocketAddr) {
        lock(&self.state)
            .exposed
            .insert((pod.to_string(), port), addr);
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        lock(&self.state).namespaces.contains_key(name)
    }

    pub fn namespace_creations(&self, name: &str) -> usize {
        lock(&self.state)
            .namespace_creations
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn rbac(&self, namespace: &str) -> RbacSnapshot {
        let state = lock(&self.state);
        let in_namespace = |ns: &String| ns == namespace;
        RbacSnapshot {
            service_accounts: state
                .service_accounts
                .iter()
                .filter(|(ns, _)| in_namespace(ns))
                .map(|(_, a)| name_of(&a.metadata))
                .collect(),
            roles: state
                .roles
                .iter()
                .filter(|(ns, _)| in_namespace(ns))
                .map(|(_, r)| name_of(&r.metadata))
                .collect(),
            role_bindings: state
                .role_bindings
                .iter()
                .filter(|(ns, _)| in_namespace(ns))
                .map(|(_, b)| name_of(&b.metadata))
                .collect(),
        }
    }

    pub fn roles(&self, namespace: &str) -> Vec<Role> {
        lock(&self.state)
            .roles
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        lock(&self.state)
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        lock(&self.state).pods.get(&key(namespace, name)).cloned()
    }

    /// Successful creations of pods called `name`, across namespaces.
    pub fn pod_creations(&self, name: &str) -> usize {
        lock(&self.state)
            .pod_creations
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        lock(&self.state).services.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        lock(&self.state).secrets.get(&key(namespace, name)).cloned()
    }

    pub fn webhooks(&self) -> Vec<MutatingWebhookConfiguration> {
        lock(&self.state).webhooks.values().cloned().collect()
    }

    pub fn webhook_creations(&self) -> usize {
        lock(&self.state).webhook_creations
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        lock(&self.state).execs.clone()
    }
}

fn with_status(mut pod: Pod, ready: bool, ip: String) -> Pod {
    let statuses = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| ContainerStatus {
                    name: c.name.clone(),
                    image: c.image.clone().unwrap_or_default(),
                    ready,
                    started: Some(true),
                    ..ContainerStatus::default()
                })
                .collect()
        })
        .unwrap_or_default();
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        pod_ip: Some(ip),
        container_statuses: Some(statuses),
        ..PodStatus::default()
    });
    pod
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>> {
        Ok(lock(&self.state).namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<()> {
        let name = name_of(&namespace.metadata);
        let mut state = lock(&self.state);
        if let Some(remaining) = state.terminating.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClusterError::Terminating(format!("namespace {name}")));
            }
        }
        if state.namespaces.contains_key(&name) {
            return Err(ClusterError::AlreadyExists(format!("namespace {name}")));
        }
        state.namespaces.insert(name.clone(), namespace.clone());
        *state.namespace_creations.entry(name).or_default() += 1;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        if state.namespaces.remove(name).is_none() {
            return Err(ClusterError::NotFound(format!("namespace {name}")));
        }
        state.service_accounts.retain(|(ns, _)| ns != name);
        state.roles.retain(|(ns, _)| ns != name);
        state.role_bindings.retain(|(ns, _)| ns != name);
        state.secrets.retain(|(ns, _), _| ns != name);
        state.pods.retain(|(ns, _), _| ns != name);
        state.services.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let name = name_of(&account.metadata);
        if state
            .service_accounts
            .iter()
            .any(|(ns, a)| ns == namespace && name_of(&a.metadata) == name)
        {
            return Err(ClusterError::AlreadyExists(format!("service account {name}")));
        }
        state
            .service_accounts
            .push((namespace.to_string(), account.clone()));
        Ok(())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let name = name_of(&role.metadata);
        if state
            .roles
            .iter()
            .any(|(ns, r)| ns == namespace && name_of(&r.metadata) == name)
        {
            return Err(ClusterError::AlreadyExists(format!("role {name}")));
        }
        state.roles.push((namespace.to_string(), role.clone()));
        Ok(())
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let name = name_of(&binding.metadata);
        if state
            .role_bindings
            .iter()
            .any(|(ns, b)| ns == namespace && name_of(&b.metadata) == name)
        {
            return Err(ClusterError::AlreadyExists(format!("role binding {name}")));
        }
        state
            .role_bindings
            .push((namespace.to_string(), binding.clone()));
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let id = key(namespace, &name_of(&secret.metadata));
        if state.secrets.contains_key(&id) {
            return Err(ClusterError::AlreadyExists(format!("secret {}", id.1)));
        }
        state.secrets.insert(id, secret.clone());
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let name = name_of(&pod.metadata);
        let id = key(namespace, &name);
        if state.pods.contains_key(&id) {
            return Err(ClusterError::AlreadyExists(format!("pod {name}")));
        }
        let ip = format!("10.0.0.{}", state.next_ip);
        state.next_ip += 1;
        let pod = with_status(pod.clone(), state.pods_ready, ip);
        state.pods.insert(id, pod);
        *state.pod_creations.entry(name).or_default() += 1;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        lock(&self.state)
            .pods
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("pod {name}")))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>> {
        Ok(lock(&self.state)
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && selector_matches(pod.metadata.labels.as_ref(), label_selector)
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let id = key(namespace, &name_of(&service.metadata));
        if state.services.contains_key(&id) {
            return Err(ClusterError::AlreadyExists(format!("service {}", id.1)));
        }
        state.services.insert(id, service.clone());
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        lock(&self.state)
            .services
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("service {name}")))
    }

    async fn create_mutating_webhook(
        &self,
        webhook: &MutatingWebhookConfiguration,
    ) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let name = name_of(&webhook.metadata);
        if state.webhooks.contains_key(&name) {
            return Err(ClusterError::AlreadyExists(format!("webhook {name}")));
        }
        state.webhooks.insert(name, webhook.clone());
        state.webhook_creations += 1;
        Ok(())
    }

    async fn delete_mutating_webhook(&self, name: &str) -> ClusterResult<()> {
        lock(&self.state)
            .webhooks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("webhook {name}")))
    }

    async fn delete_mutating_webhooks(&self, label_selector: &str) -> ClusterResult<()> {
        lock(&self.state)
            .webhooks
            .retain(|_, w| !selector_matches(w.metadata.labels.as_ref(), label_selector));
        Ok(())
    }

    async fn exec_with_stdin(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Vec<u8>,
    ) -> ClusterResult<ExecOutput> {
        let mut state = lock(&self.state);
        if !state.pods.contains_key(&key(namespace, pod)) {
            return Err(ClusterError::NotFound(format!("pod {pod}")));
        }
        state.execs.push(ExecCall {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
            command: command.to_vec(),
            stdin,
        });
        Ok(match &state.exec_failure {
            Some(output) => ExecOutput {
                success: false,
                output: output.clone(),
            },
            None => ExecOutput {
                success: true,
                output: String::new(),
            },
        })
    }

    async fn port_forward(
        &self,
        _namespace: &str,
        pod: &str,
        port: u16,
    ) -> ClusterResult<BoxedPortStream> {
        let addr = lock(&self.state)
            .exposed
            .get(&(pod.to_string(), port))
            .copied()
            .ok_or_else(|| ClusterError::PortForward(format!("{pod}:{port} is not exposed")))?;
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }

    async fn node_platform(&self) -> ClusterResult<Platform> {
        Ok(lock(&self.state).platform.clone())
    }
}

// ---------------------------------------------------------------------------
// FakeControlPlane
// ---------------------------------------------------------------------------

/// One recorded workflow operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowCall {
    Create {
        environment: String,
        kind: ResourceKind,
        name: String,
    },
    Update {
        environment: String,
        kind: ResourceKind,
        name: String,
    },
    Delete {
        environment: String,
        kind: ResourceKind,
        name: String,
    },
}

#[derive(Debug, Default)]
struct ControlPlaneState {
    environments: BTreeMap<String, Environment>,
    connected: HashSet<String>,
    deleted: Vec<String>,
    calls: Vec<WorkflowCall>,
    fail_creation: bool,
}

/// In-memory control plane.
#[derive(Debug, Default)]
pub struct FakeControlPlane {
    state: Arc<Mutex<ControlPlaneState>>,
    next_id: AtomicUsize,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_environment(&self, name: &str) -> Environment {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Environment {
            id: format!("env-{n}"),
            name: name.to_string(),
            agent_token: format!("token-{n}"),
            organization_id: "org-test".to_string(),
        }
    }

    /// Seed an environment left behind by an earlier run.
    pub fn insert_environment(&self, name: &str, connected: bool) -> Environment {
        let environment = self.next_environment(name);
        let mut state = lock(&self.state);
        if connected {
            state.connected.insert(environment.id.clone());
        }
        state
            .environments
            .insert(environment.id.clone(), environment.clone());
        environment
    }

    pub fn fail_environment_creation(&self) {
        lock(&self.state).fail_creation = true;
    }

    pub fn environments(&self) -> Vec<Environment> {
        lock(&self.state).environments.values().cloned().collect()
    }

    pub fn has_environment_named(&self, name: &str) -> bool {
        lock(&self.state)
            .environments
            .values()
            .any(|e| e.name == name)
    }

    /// Ids passed to `delete_environment`, in call order.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    pub fn calls(&self) -> Vec<WorkflowCall> {
        lock(&self.state).calls.clone()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn create_environment(&self, name: &str) -> ControlPlaneResult<Environment> {
        if lock(&self.state).fail_creation {
            return Err(ControlPlaneError::Status {
                status: 500,
                body: "environment creation failed".to_string(),
            });
        }
        let environment = self.next_environment(name);
        lock(&self.state)
            .environments
            .insert(environment.id.clone(), environment.clone());
        Ok(environment)
    }

    async fn delete_environment(&self, id: &str) -> ControlPlaneResult<()> {
        let mut state = lock(&self.state);
        state.environments.remove(id);
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn list_obsolete_environments(&self) -> ControlPlaneResult<Vec<Environment>> {
        let state = lock(&self.state);
        Ok(state
            .environments
            .values()
            .filter(|e| !state.connected.contains(&e.id))
            .cloned()
            .collect())
    }

    fn connection(&self) -> AgentConnection {
        AgentConnection {
            api_uri: "https://api.example.com:443".to_string(),
            agent_uri: "agent.example.com:443".to_string(),
            ui_uri: "https://app.example.com".to_string(),
            organization_id: "org-test".to_string(),
            insecure: false,
        }
    }

    fn dashboard_url(&self, environment: &Environment) -> String {
        format!(
            "https://app.example.com/organization/{}/environment/{}/dashboard/test-workflows",
            environment.organization_id, environment.id
        )
    }

    fn workflow_client(&self, environment_id: &str) -> Arc<dyn WorkflowClient> {
        Arc::new(FakeWorkflowClient {
            environment: environment_id.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

struct FakeWorkflowClient {
    environment: String,
    state: Arc<Mutex<ControlPlaneState>>,
}

#[async_trait]
impl WorkflowClient for FakeWorkflowClient {
    async fn create(&self, kind: ResourceKind, body: &serde_json::Value) -> ControlPlaneResult<()> {
        let name = body["metadata"]["name"]
            .as_str()
            .ok_or_else(|| ControlPlaneError::Decode("missing metadata.name".to_string()))?;
        lock(&self.state).calls.push(WorkflowCall::Create {
            environment: self.environment.clone(),
            kind,
            name: name.to_string(),
        });
        Ok(())
    }

    async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        _body: &serde_json::Value,
    ) -> ControlPlaneResult<()> {
        lock(&self.state).calls.push(WorkflowCall::Update {
            environment: self.environment.clone(),
            kind,
            name: name.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> ControlPlaneResult<()> {
        lock(&self.state).calls.push(WorkflowCall::Delete {
            environment: self.environment.clone(),
            kind,
            name: name.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

/// In-memory blob store backed by a `HashMap<key, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    bucket_ready: AtomicBool,
    puts: AtomicUsize,
    put_attempts: AtomicUsize,
    failures: AtomicUsize,
    stalled: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` puts.
    pub fn fail_next_puts(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make every following put hang.
    pub fn stall_puts(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn bucket_ready(&self) -> bool {
        self.bucket_ready.load(Ordering::SeqCst)
    }

    /// Successful puts.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn put_attempts(&self) -> usize {
        self.put_attempts.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(key).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn ensure_bucket(&self) -> Result<(), BlobError> {
        self.bucket_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BlobError::Put {
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        lock(&self.objects).insert(key.to_string(), data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        self.object(key)
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }
}

/// Hands out one shared [`MemoryBlobStore`].
#[derive(Debug)]
pub struct MemoryBlobConnector {
    store: Arc<MemoryBlobStore>,
    endpoints: Mutex<Vec<String>>,
}

impl MemoryBlobConnector {
    pub fn new(store: Arc<MemoryBlobStore>) -> Self {
        Self {
            store,
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoints(&self) -> Vec<String> {
        lock(&self.endpoints).clone()
    }
}

#[async_trait]
impl BlobConnector for MemoryBlobConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BlobStore>, BlobError> {
        lock(&self.endpoints).push(endpoint.to_string());
        Ok(self.store.clone())
    }
}
