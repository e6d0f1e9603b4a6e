//! Cluster connector.
//!
//! [`ClusterClient`] is the seam between devbox components and the cluster
//! API. [`KubeCluster`] talks to a real cluster; `fakes::FakeCluster` keeps
//! everything in memory for tests.

mod kube_client;

pub use self::kube_client::KubeCluster;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Platform;
use crate::error::ClusterError;

/// Marks namespaces and pods created by devbox.
pub const DEVBOX_LABEL: &str = "devbox.io/devbox";
/// Ties cluster-scoped objects to the namespace that owns them.
pub const DEVBOX_NAME_LABEL: &str = "devbox.io/devbox-name";
/// Present on pods spawned for workflow executions.
pub const RESOURCE_ID_LABEL: &str = "testworkflowid-resource";
/// Pod annotation carrying the serialized workflow spec.
pub const SPEC_ANNOTATION: &str = "testworkflows.testkube.io/spec";

/// Result alias for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Bidirectional byte stream to a forwarded pod port.
pub trait PortStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PortStream for T {}

pub type BoxedPortStream = Box<dyn PortStream>;

/// Outcome of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Cluster operations used by devbox.
///
/// Create calls map a conflict to [`ClusterError::AlreadyExists`] or
/// [`ClusterError::Terminating`]; delete calls map absence to
/// [`ClusterError::NotFound`]. Deletes are foreground with zero grace.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>>;
    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<()>;
    async fn delete_namespace(&self, name: &str) -> ClusterResult<()>;

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> ClusterResult<()>;
    async fn create_role(&self, namespace: &str, role: &Role) -> ClusterResult<()>;
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> ClusterResult<()>;
    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Option<Secret>>;
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ClusterResult<()>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()>;
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>>;

    async fn create_service(&self, namespace: &str, service: &Service) -> ClusterResult<()>;
    async fn delete_service(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn create_mutating_webhook(
        &self,
        webhook: &MutatingWebhookConfiguration,
    ) -> ClusterResult<()>;
    async fn delete_mutating_webhook(&self, name: &str) -> ClusterResult<()>;
    async fn delete_mutating_webhooks(&self, label_selector: &str) -> ClusterResult<()>;

    /// Run `command` in a container, feeding `stdin` and closing it.
    async fn exec_with_stdin(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Vec<u8>,
    ) -> ClusterResult<ExecOutput>;

    /// Open one tunnel to `port` on a pod.
    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> ClusterResult<BoxedPortStream>;

    /// Platform of the cluster nodes.
    async fn node_platform(&self) -> ClusterResult<Platform>;
}

/// Treat absence as success.
pub fn ignore_not_found(result: ClusterResult<()>) -> ClusterResult<()> {
    match result {
        Err(ClusterError::NotFound(_)) => Ok(()),
        other => other,
    }
}
