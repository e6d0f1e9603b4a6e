//! Agent pod.
//!
//! An init container fetches the latest `bin/agent` from object storage into
//! a shared volume and the agent image runs it, so a restart always picks up
//! the most recent upload.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, HTTPGetAction, Pod, PodSpec, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::{ClusterClient, ClusterResult};
use crate::control_plane::{AgentConnection, Environment};
use crate::pod::{container_port, empty_dir, env_var, mount, service_port, PodHandle};
use crate::poll::PollPolicy;
use crate::storage;

pub const AGENT_NAME: &str = "devbox-agent";
pub const AGENT_PORT: u16 = 8088;
const BIN_DIR: &str = "/.devbox";

pub struct AgentPod {
    pod: PodHandle,
    image: String,
    fetch_image: String,
    service_account: String,
}

impl AgentPod {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace: &str,
        image: &str,
        fetch_image: &str,
        service_account: &str,
        readiness: PollPolicy,
    ) -> Self {
        Self {
            pod: PodHandle::new(cluster, namespace, AGENT_NAME, readiness),
            image: image.to_string(),
            fetch_image: fetch_image.to_string(),
            service_account: service_account.to_string(),
        }
    }

    pub fn pod(&self) -> &PodHandle {
        &self.pod
    }

    pub async fn deploy(
        &self,
        environment: &Environment,
        connection: &AgentConnection,
        token: &CancellationToken,
    ) -> ClusterResult<()> {
        self.pod
            .create(self.definition(environment, connection), token)
            .await?;
        self.pod
            .create_service(vec![service_port("http", AGENT_PORT)])
            .await?;
        info!(environment = %environment.id, "agent deployed");
        Ok(())
    }

    fn definition(&self, environment: &Environment, connection: &AgentConnection) -> Pod {
        let download = format!(
            "set -e; wget -O {BIN_DIR}/agent {}/agent; chmod 777 {BIN_DIR}/agent",
            storage::download_base()
        );
        let insecure = connection.insecure.to_string();
        Pod {
            spec: Some(PodSpec {
                service_account_name: Some(self.service_account.clone()),
                termination_grace_period_seconds: Some(1),
                volumes: Some(vec![empty_dir("devbox"), empty_dir("tmp")]),
                init_containers: Some(vec![Container {
                    name: "devbox-init".to_string(),
                    image: Some(self.fetch_image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), download]),
                    volume_mounts: Some(vec![mount("devbox", BIN_DIR)]),
                    ..Container::default()
                }]),
                containers: vec![Container {
                    name: "server".to_string(),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    command: Some(vec![format!("{BIN_DIR}/agent")]),
                    env: Some(vec![
                        env_var("NAMESPACE", self.pod.namespace()),
                        env_var("JOB_SERVICE_ACCOUNT_NAME", crate::namespace::JOB_SERVICE_ACCOUNT),
                        env_var("TESTKUBE_PRO_API_KEY", environment.agent_token.as_str()),
                        env_var("TESTKUBE_PRO_ORG_ID", environment.organization_id.as_str()),
                        env_var("TESTKUBE_PRO_ENV_ID", environment.id.as_str()),
                        env_var("TESTKUBE_PRO_URL", connection.agent_uri.as_str()),
                        env_var("TESTKUBE_PRO_TLS_INSECURE", insecure.as_str()),
                        env_var("TESTKUBE_PRO_SKIP_VERIFY", insecure.as_str()),
                        env_var("TESTKUBE_PRO_UI_URL", connection.ui_uri.as_str()),
                    ]),
                    ports: Some(vec![container_port("http", AGENT_PORT)]),
                    volume_mounts: Some(vec![mount("devbox", BIN_DIR), mount("tmp", "/tmp")]),
                    readiness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            path: Some("/health".to_string()),
                            port: IntOrString::Int(i32::from(AGENT_PORT)),
                            scheme: Some("HTTP".to_string()),
                            ..HTTPGetAction::default()
                        }),
                        period_seconds: Some(1),
                        ..Probe::default()
                    }),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    pub async fn wait_for_ready(&self, token: &CancellationToken) -> ClusterResult<()> {
        self.pod.wait_for_ready(token).await
    }

    /// Recreate the pod so it downloads the latest agent binary.
    pub async fn restart(&self, token: &CancellationToken) -> ClusterResult<()> {
        self.pod.restart(token).await?;
        info!("agent restarted");
        Ok(())
    }
}
