//! Control-plane connector.
//!
//! Creates and deletes ephemeral environments and hands out workflow
//! clients scoped to one environment.

mod http;

pub use http::{HttpControlPlane, HttpWorkflowClient};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ControlPlaneError;

/// Reserved wire-name prefix of devbox environments.
pub const ENVIRONMENT_PREFIX: &str = "devbox-";

pub type ControlPlaneResult<T> = std::result::Result<T, ControlPlaneError>;

/// A disposable control-plane execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    /// Session name, without the reserved prefix.
    pub name: String,
    pub agent_token: String,
    pub organization_id: String,
}

/// Addresses the agent needs to reach the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConnection {
    /// `scheme://host:port` of the REST API.
    pub api_uri: String,
    /// `host:port` of the agent endpoint.
    pub agent_uri: String,
    pub ui_uri: String,
    pub organization_id: String,
    pub insecure: bool,
}

/// Kind of a declarative workflow resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Template,
    Workflow,
}

impl ResourceKind {
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "TestWorkflow" => Some(ResourceKind::Workflow),
            "TestWorkflowTemplate" => Some(ResourceKind::Template),
            _ => None,
        }
    }

    /// REST collection segment.
    pub fn collection(&self) -> &'static str {
        match self {
            ResourceKind::Workflow => "test-workflows",
            ResourceKind::Template => "test-workflow-templates",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Workflow => f.write_str("TestWorkflow"),
            ResourceKind::Template => f.write_str("TestWorkflowTemplate"),
        }
    }
}

/// Environment lifecycle on the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_environment(&self, name: &str) -> ControlPlaneResult<Environment>;

    /// Deleting an environment that no longer exists succeeds.
    async fn delete_environment(&self, id: &str) -> ControlPlaneResult<()>;

    /// Devbox environments that were created but never connected.
    async fn list_obsolete_environments(&self) -> ControlPlaneResult<Vec<Environment>>;

    fn connection(&self) -> AgentConnection;

    fn dashboard_url(&self, environment: &Environment) -> String;

    /// Client for workflow CRUD inside one environment; built on first use.
    fn workflow_client(&self, environment_id: &str) -> Arc<dyn WorkflowClient>;
}

/// Workflow and template CRUD for one environment.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    async fn create(&self, kind: ResourceKind, body: &serde_json::Value) -> ControlPlaneResult<()>;
    async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        body: &serde_json::Value,
    ) -> ControlPlaneResult<()>;
    async fn delete(&self, kind: ResourceKind, name: &str) -> ControlPlaneResult<()>;
}

fn parse(raw: &str) -> ControlPlaneResult<Url> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    Url::parse(&with_scheme).map_err(|e| ControlPlaneError::Config(format!("invalid uri {raw}: {e}")))
}

/// `scheme://host:port`, defaulting to https and the scheme's port.
pub fn normalize_api_uri(raw: &str) -> ControlPlaneResult<String> {
    let url = parse(raw)?;
    let host = url
        .host_str()
        .ok_or_else(|| ControlPlaneError::Config(format!("missing host in {raw}")))?;
    let port = url.port_or_known_default().unwrap_or(443);
    Ok(format!("{}://{}:{}", url.scheme(), host, port))
}

/// `host:port` of the agent endpoint: `api.` hosts become `agent.` hosts.
pub fn agent_uri(raw: &str) -> ControlPlaneResult<String> {
    let url = parse(raw)?;
    let host = url
        .host_str()
        .ok_or_else(|| ControlPlaneError::Config(format!("missing host in {raw}")))?;
    let host = match host.strip_prefix("api.") {
        Some(rest) => format!("agent.{rest}"),
        None => host.to_string(),
    };
    let port = url.port_or_known_default().unwrap_or(443);
    Ok(format!("{host}:{port}"))
}

/// Wire name of an environment for a session name.
pub fn wire_name(name: &str) -> String {
    format!("{ENVIRONMENT_PREFIX}{name}")
}
