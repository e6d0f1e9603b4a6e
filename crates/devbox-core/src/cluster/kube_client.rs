use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{BoxedPortStream, ClusterClient, ClusterResult, ExecOutput};
use crate::config::Platform;
use crate::error::ClusterError;

/// [`ClusterClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the local kubeconfig or the in-cluster service account.
    pub async fn try_default() -> ClusterResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Api(format!("failed to load cluster configuration: {e}")))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn delete_params() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..DeleteParams::default()
    }
}

fn map_err(err: kube::Error, what: impl Into<String>) -> ClusterError {
    let what = what.into();
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(what),
        kube::Error::Api(ae) if ae.code == 409 && ae.message.contains("being deleted") => {
            ClusterError::Terminating(what)
        }
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::AlreadyExists(what),
        other => ClusterError::Api(format!("{what}: {other}")),
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| map_err(e, format!("namespace {name}")))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let name = namespace.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), namespace)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("namespace {name}")))
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &delete_params())
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("namespace {name}")))
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> ClusterResult<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let name = account.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), account)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("service account {namespace}/{name}")))
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> ClusterResult<()> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        let name = role.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), role)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("role {namespace}/{name}")))
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> ClusterResult<()> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let name = binding.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), binding)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("role binding {namespace}/{name}")))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| map_err(e, format!("secret {namespace}/{name}")))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), secret)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("secret {namespace}/{name}")))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ClusterResult<()> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("pod {namespace}/{name}")))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.pods(namespace)
            .delete(name, &delete_params())
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("pod {namespace}/{name}")))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ClusterResult<Vec<Pod>> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| map_err(e, format!("pods {namespace} [{label_selector}]")))?;
        Ok(list.items)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> ClusterResult<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let name = service.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), service)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("service {namespace}/{name}")))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &delete_params())
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("service {namespace}/{name}")))
    }

    async fn create_mutating_webhook(
        &self,
        webhook: &MutatingWebhookConfiguration,
    ) -> ClusterResult<()> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let name = webhook.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), webhook)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("mutating webhook {name}")))
    }

    async fn delete_mutating_webhook(&self, name: &str) -> ClusterResult<()> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        api.delete(name, &delete_params())
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("mutating webhook {name}")))
    }

    async fn delete_mutating_webhooks(&self, label_selector: &str) -> ClusterResult<()> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        api.delete_collection(&delete_params(), &ListParams::default().labels(label_selector))
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, format!("mutating webhooks [{label_selector}]")))
    }

    async fn exec_with_stdin(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Vec<u8>,
    ) -> ClusterResult<ExecOutput> {
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .pods(namespace)
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| map_err(e, format!("exec in {namespace}/{pod}")))?;

        let mut writer = attached
            .stdin()
            .ok_or_else(|| ClusterError::Exec("stdin channel unavailable".to_string()))?;
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let write = async move {
            writer.write_all(&stdin).await?;
            writer.shutdown().await
        };
        let ((), out, err) = tokio::try_join!(write, read_all(stdout), read_all(stderr))?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        if let Err(e) = attached.join().await {
            debug!(pod = %pod, error = %e, "exec stream closed with error");
        }

        let mut output = String::from_utf8_lossy(&out).into_owned();
        output.push_str(&String::from_utf8_lossy(&err));
        let success = status
            .as_ref()
            .map(|s| s.status.as_deref() == Some("Success"))
            .unwrap_or(false);
        if !success {
            if let Some(message) = status.and_then(|s| s.message) {
                output.push_str(&message);
            }
        }
        Ok(ExecOutput { success, output })
    }

    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> ClusterResult<BoxedPortStream> {
        let mut forwarder = self
            .pods(namespace)
            .portforward(pod, &[port])
            .await
            .map_err(|e| map_err(e, format!("port forward to {namespace}/{pod}:{port}")))?;
        let stream = forwarder.take_stream(port).ok_or_else(|| {
            ClusterError::PortForward(format!("no stream for {namespace}/{pod}:{port}"))
        })?;
        let pod = pod.to_string();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                warn!(pod = %pod, port = port, error = %e, "port forward ended with error");
            }
        });
        Ok(Box::new(stream))
    }

    async fn node_platform(&self) -> ClusterResult<Platform> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|e| map_err(e, "nodes"))?;
        let info = nodes
            .items
            .first()
            .and_then(|node| node.status.as_ref())
            .and_then(|status| status.node_info.as_ref())
            .ok_or_else(|| ClusterError::NotFound("node info".to_string()))?;
        Ok(Platform::new(
            info.operating_system.clone(),
            info.architecture.clone(),
        ))
    }
}
