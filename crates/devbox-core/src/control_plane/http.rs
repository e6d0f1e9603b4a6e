use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    agent_uri, normalize_api_uri, wire_name, AgentConnection, ControlPlane, ControlPlaneResult,
    Environment, ResourceKind, WorkflowClient, ENVIRONMENT_PREFIX,
};
use crate::config::ControlPlaneConfig;
use crate::error::ControlPlaneError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentRecord {
    id: String,
    name: String,
    #[serde(default)]
    agent_token: String,
    #[serde(default)]
    organization_id: String,
    #[serde(default)]
    connected: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateEnvironmentRequest<'a> {
    name: &'a str,
    owner: &'a str,
}

async fn check(response: Response) -> ControlPlaneResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ControlPlaneError::Status {
        status: status.as_u16(),
        body,
    })
}

/// REST connector for the control plane.
pub struct HttpControlPlane {
    config: ControlPlaneConfig,
    api_uri: String,
    http: reqwest::Client,
    workflow_clients: Mutex<HashMap<String, Arc<HttpWorkflowClient>>>,
}

impl HttpControlPlane {
    pub fn new(config: ControlPlaneConfig) -> ControlPlaneResult<Self> {
        if config.organization_id.is_empty() {
            return Err(ControlPlaneError::Config(
                "organization id is required".to_string(),
            ));
        }
        let api_uri = normalize_api_uri(&config.api_url)?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("devbox/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(config.insecure)
            .build()?;
        Ok(Self {
            config,
            api_uri,
            http,
            workflow_clients: Mutex::new(HashMap::new()),
        })
    }

    fn environments_url(&self) -> String {
        format!(
            "{}/organizations/{}/environments",
            self.api_uri, self.config.organization_id
        )
    }

    fn environment_from(&self, record: EnvironmentRecord) -> Environment {
        let name = record
            .name
            .strip_prefix(ENVIRONMENT_PREFIX)
            .unwrap_or(&record.name)
            .to_string();
        let organization_id = if record.organization_id.is_empty() {
            self.config.organization_id.clone()
        } else {
            record.organization_id
        };
        Environment {
            id: record.id,
            name,
            agent_token: record.agent_token,
            organization_id,
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_environment(&self, name: &str) -> ControlPlaneResult<Environment> {
        let wire = wire_name(name);
        let request = CreateEnvironmentRequest {
            name: &wire,
            owner: &self.config.organization_id,
        };
        let response = self
            .http
            .post(self.environments_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;
        let record: EnvironmentRecord = check(response).await?.json().await?;
        debug!(environment_id = %record.id, "environment created");
        Ok(self.environment_from(record))
    }

    async fn delete_environment(&self, id: &str) -> ControlPlaneResult<()> {
        let response = self
            .http
            .delete(format!("{}/{}", self.environments_url(), id))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn list_obsolete_environments(&self) -> ControlPlaneResult<Vec<Environment>> {
        let response = self
            .http
            .get(self.environments_url())
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;
        let records: Vec<EnvironmentRecord> = check(response).await?.json().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.name.starts_with(ENVIRONMENT_PREFIX) && !r.connected)
            .map(|r| self.environment_from(r))
            .collect())
    }

    fn connection(&self) -> AgentConnection {
        AgentConnection {
            api_uri: self.api_uri.clone(),
            agent_uri: agent_uri(&self.api_uri).unwrap_or_else(|_| self.api_uri.clone()),
            ui_uri: self.config.ui_url.clone(),
            organization_id: self.config.organization_id.clone(),
            insecure: self.config.insecure,
        }
    }

    fn dashboard_url(&self, environment: &Environment) -> String {
        format!(
            "{}/organization/{}/environment/{}/dashboard/test-workflows",
            self.config.ui_url.trim_end_matches('/'),
            environment.organization_id,
            environment.id
        )
    }

    fn workflow_client(&self, environment_id: &str) -> Arc<dyn WorkflowClient> {
        let mut clients = self
            .workflow_clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let client = clients
            .entry(environment_id.to_string())
            .or_insert_with(|| {
                Arc::new(HttpWorkflowClient {
                    base_url: format!("{}/{}/agent", self.environments_url(), environment_id),
                    api_key: self.config.api_key.clone(),
                    http: self.http.clone(),
                })
            })
            .clone();
        client
    }
}

/// Workflow CRUD against one environment.
pub struct HttpWorkflowClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

#[async_trait]
impl WorkflowClient for HttpWorkflowClient {
    async fn create(&self, kind: ResourceKind, body: &serde_json::Value) -> ControlPlaneResult<()> {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, kind.collection()))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        body: &serde_json::Value,
    ) -> ControlPlaneResult<()> {
        let response = self
            .http
            .put(format!("{}/{}/{}", self.base_url, kind.collection(), name))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> ControlPlaneResult<()> {
        let response = self
            .http
            .delete(format!("{}/{}/{}", self.base_url, kind.collection(), name))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn control_plane(server: &MockServer) -> HttpControlPlane {
        let config = ControlPlaneConfig::new(&server.uri(), "key-1", "org-1")
            .with_ui_url("https://app.example.com/");
        HttpControlPlane::new(config).unwrap()
    }

    #[tokio::test]
    async fn create_environment_prefixes_wire_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/organizations/org-1/environments"))
            .and(header("authorization", "Bearer key-1"))
            .and(body_json(json!({"name": "devbox-abc", "owner": "org-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "env-1",
                "name": "devbox-abc",
                "agentToken": "tkcagnt_x",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let env = control_plane(&server).create_environment("abc").await.unwrap();
        assert_eq!(env.id, "env-1");
        assert_eq!(env.name, "abc");
        assert_eq!(env.agent_token, "tkcagnt_x");
        assert_eq!(env.organization_id, "org-1");
    }

    #[tokio::test]
    async fn obsolete_means_prefixed_and_never_connected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/organizations/org-1/environments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "1", "name": "devbox-old", "connected": false},
                {"id": "2", "name": "devbox-live", "connected": true},
                {"id": "3", "name": "production", "connected": false},
            ])))
            .mount(&server)
            .await;

        let obsolete = control_plane(&server)
            .list_obsolete_environments()
            .await
            .unwrap();
        assert_eq!(obsolete.len(), 1);
        assert_eq!(obsolete[0].id, "1");
        assert_eq!(obsolete[0].name, "old");
    }

    #[tokio::test]
    async fn delete_missing_environment_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/organizations/org-1/environments/env-9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        control_plane(&server).delete_environment("env-9").await.unwrap();
    }

    #[tokio::test]
    async fn server_errors_surface_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let err = control_plane(&server)
            .create_environment("abc")
            .await
            .unwrap_err();
        match err {
            ControlPlaneError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "quota exceeded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn workflow_client_targets_environment_agent() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(
                "/organizations/org-1/environments/env-1/agent/test-workflow-templates/tpl",
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let cp = control_plane(&server);
        let client = cp.workflow_client("env-1");
        client
            .update(ResourceKind::Template, "tpl", &json!({"kind": "TestWorkflowTemplate"}))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&client, &cp.workflow_client("env-1")));
    }

    #[test]
    fn dashboard_url_points_at_environment() {
        let config = ControlPlaneConfig::new("api.example.com", "k", "org-1")
            .with_ui_url("https://app.example.com/");
        let cp = HttpControlPlane::new(config).unwrap();
        let env = Environment {
            id: "env-1".into(),
            name: "abc".into(),
            agent_token: String::new(),
            organization_id: "org-1".into(),
        };
        assert_eq!(
            cp.dashboard_url(&env),
            "https://app.example.com/organization/org-1/environment/env-1/dashboard/test-workflows"
        );
        assert_eq!(cp.connection().agent_uri, "agent.example.com:443");
    }

    #[test]
    fn organization_is_required() {
        let config = ControlPlaneConfig::new("api.example.com", "k", "");
        assert!(matches!(
            HttpControlPlane::new(config),
            Err(ControlPlaneError::Config(_))
        ));
    }
}
