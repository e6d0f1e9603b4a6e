//! Handle over one devbox-managed pod and its service.
//!
//! Pods carry `devbox.io/devbox=<name>` and are found by that label.
//! Creating over an existing pod replaces it; restart deletes and recreates
//! from the stored definition.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{
    ContainerPort, EmptyDirVolumeSource, EnvVar, Pod, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::{ignore_not_found, ClusterClient, ClusterResult, DEVBOX_LABEL};
use crate::error::ClusterError;
use crate::poll::{poll_until, PollPolicy};

/// A pod and service pair that share one name.
pub struct PodHandle {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
    readiness: PollPolicy,
    definition: Mutex<Option<Pod>>,
}

impl PodHandle {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        readiness: PollPolicy,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            name: name.into(),
            readiness,
            definition: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Label selector matching this pod.
    pub fn selector(&self) -> String {
        format!("{DEVBOX_LABEL}={}", self.name)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(DEVBOX_LABEL.to_string(), self.name.clone())])
    }

    /// Create the pod, replacing one with the same name.
    pub async fn create(&self, mut pod: Pod, token: &CancellationToken) -> ClusterResult<()> {
        pod.metadata.name = Some(self.name.clone());
        pod.metadata.namespace = Some(self.namespace.clone());
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(self.labels());
        *self
            .definition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pod.clone());

        match self.cluster.create_pod(&self.namespace, &pod).await {
            Err(ClusterError::AlreadyExists(_)) => {
                debug!(pod = %self.name, "replacing existing pod");
                self.delete(token).await?;
                self.cluster.create_pod(&self.namespace, &pod).await
            }
            other => other,
        }
    }

    /// Create a ClusterIP service selecting this pod, replacing an existing one.
    pub async fn create_service(&self, ports: Vec<ServicePort>) -> ClusterResult<()> {
        let service = Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.labels()),
                ports: Some(ports),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        match self.cluster.create_service(&self.namespace, &service).await {
            Err(ClusterError::AlreadyExists(_)) => {
                ignore_not_found(self.cluster.delete_service(&self.namespace, &self.name).await)?;
                self.cluster.create_service(&self.namespace, &service).await
            }
            other => other,
        }
    }

    /// Delete the pod and wait until it is gone.
    pub async fn delete(&self, token: &CancellationToken) -> ClusterResult<()> {
        ignore_not_found(self.cluster.delete_pod(&self.namespace, &self.name).await)?;
        let selector = self.selector();
        let (cluster, namespace, selector) = (&self.cluster, &self.namespace, &selector);
        poll_until(
            &self.readiness,
            token,
            &format!("pod {} deletion", self.name),
            || async move {
                let pods = cluster.list_pods(namespace, selector).await?;
                Ok(pods.is_empty().then_some(()))
            },
        )
        .await
    }

    /// Delete and recreate from the last definition.
    pub async fn restart(&self, token: &CancellationToken) -> ClusterResult<()> {
        let pod = self
            .definition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| ClusterError::NotFound(format!("definition of pod {}", self.name)))?;
        self.delete(token).await?;
        self.cluster.create_pod(&self.namespace, &pod).await
    }

    /// Wait until every container has started.
    pub async fn wait_for_started(&self, token: &CancellationToken) -> ClusterResult<()> {
        self.wait_for(token, "started", is_started).await
    }

    /// Wait until every container reports ready.
    pub async fn wait_for_ready(&self, token: &CancellationToken) -> ClusterResult<()> {
        self.wait_for(token, "ready", is_ready).await
    }

    async fn wait_for(
        &self,
        token: &CancellationToken,
        state: &str,
        check: fn(&Pod) -> bool,
    ) -> ClusterResult<()> {
        let selector = self.selector();
        let (cluster, namespace, name, selector) =
            (&self.cluster, &self.namespace, &self.name, &selector);
        poll_until(
            &self.readiness,
            token,
            &format!("pod {name} {state}"),
            || async move {
                let pods = cluster.list_pods(namespace, selector).await?;
                let mut live = pods
                    .iter()
                    .filter(|p| p.metadata.deletion_timestamp.is_none())
                    .peekable();
                if live.peek().is_none() {
                    return Err(ClusterError::NotFound(format!("pod {name}")));
                }
                Ok(live.any(check).then_some(()))
            },
        )
        .await
    }

    /// Cluster IP of the live pod, if assigned.
    pub async fn ip(&self) -> ClusterResult<Option<String>> {
        let pods = self
            .cluster
            .list_pods(&self.namespace, &self.selector())
            .await?;
        Ok(pods
            .into_iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .find_map(|p| p.status.and_then(|s| s.pod_ip)))
    }
}

fn container_statuses(pod: &Pod) -> &[k8s_openapi::api::core::v1::ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[])
}

fn is_started(pod: &Pod) -> bool {
    let statuses = container_statuses(pod);
    !statuses.is_empty() && statuses.iter().all(|c| c.started == Some(true))
}

fn is_ready(pod: &Pod) -> bool {
    let statuses = container_statuses(pod);
    !statuses.is_empty() && statuses.iter().all(|c| c.ready)
}

pub(crate) fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

pub(crate) fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    }
}

pub(crate) fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..VolumeMount::default()
    }
}

pub(crate) fn container_port(name: &str, port: u16) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: i32::from(port),
        protocol: Some("TCP".to_string()),
        ..ContainerPort::default()
    }
}

/// TCP service port.
pub fn service_port(name: &str, port: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: i32::from(port),
        protocol: Some("TCP".to_string()),
        target_port: Some(
            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(i32::from(port)),
        ),
        ..ServicePort::default()
    }
}
