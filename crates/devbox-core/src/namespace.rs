//! Namespace provisioner.
//!
//! Owns the session namespace, its service accounts, roles and bindings.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::{ignore_not_found, ClusterClient, ClusterResult, DEVBOX_LABEL, DEVBOX_NAME_LABEL};
use crate::error::ClusterError;
use crate::poll::sleep_or_cancel;

pub const AGENT_SERVICE_ACCOUNT: &str = "devbox-account";
pub const JOB_SERVICE_ACCOUNT: &str = "devbox-job-account";
pub const ROLE: &str = "devbox-role";
pub const EXECUTION_ROLE: &str = "devbox-execution-role";

const NAMESPACE_MARKER: &str = "namespace";
const ALL_VERBS: [&str; 7] = ["get", "watch", "list", "create", "patch", "update", "delete"];

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..PolicyRule::default()
    }
}

fn with_deletecollection(verbs: &[&str]) -> Vec<&'static str> {
    let mut all: Vec<&'static str> = ALL_VERBS.to_vec();
    all.retain(|v| verbs.contains(v));
    all.push("deletecollection");
    all
}

fn ignore_exists(result: ClusterResult<()>) -> ClusterResult<()> {
    match result {
        Err(ClusterError::AlreadyExists(_)) => Ok(()),
        other => other,
    }
}

/// Creates and destroys one devbox namespace.
pub struct NamespaceProvisioner {
    cluster: Arc<dyn ClusterClient>,
    name: String,
    terminating_retry: Duration,
    timeout: Duration,
    created: Mutex<bool>,
}

impl NamespaceProvisioner {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        name: impl Into<String>,
        terminating_retry: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            name: name.into(),
            terminating_retry,
            timeout,
            created: Mutex::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_account(&self) -> &'static str {
        AGENT_SERVICE_ACCOUNT
    }

    pub fn job_service_account(&self) -> &'static str {
        JOB_SERVICE_ACCOUNT
    }

    /// Create the namespace and its access objects. No-op once done.
    pub async fn create(&self, token: &CancellationToken) -> ClusterResult<()> {
        let mut created = self.created.lock().await;
        if *created {
            return Ok(());
        }
        self.create_namespace(token).await?;
        self.create_access().await?;
        *created = true;
        info!(namespace = %self.name, "namespace ready");
        Ok(())
    }

    async fn create_namespace(&self, token: &CancellationToken) -> ClusterResult<()> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(BTreeMap::from([(
                    DEVBOX_LABEL.to_string(),
                    NAMESPACE_MARKER.to_string(),
                )])),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };

        let deadline = Instant::now() + self.timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(ClusterError::Timeout(format!("namespace {}", self.name)));
            }
            match self.cluster.create_namespace(&namespace).await {
                Ok(()) => return Ok(()),
                Err(ClusterError::Terminating(_)) => {
                    debug!(namespace = %self.name, "previous namespace still terminating");
                }
                Err(ClusterError::AlreadyExists(_)) => {
                    let existing = self.cluster.get_namespace(&self.name).await?;
                    let owned = existing
                        .as_ref()
                        .and_then(|ns| ns.metadata.labels.as_ref())
                        .and_then(|labels| labels.get(DEVBOX_LABEL))
                        .is_some_and(|marker| marker == NAMESPACE_MARKER);
                    if existing.is_some() && !owned {
                        return Err(ClusterError::NotDevboxNamespace(self.name.clone()));
                    }
                    debug!(namespace = %self.name, "deleting leftover devbox namespace");
                    ignore_not_found(self.cluster.delete_namespace(&self.name).await)?;
                }
                Err(e) => return Err(e),
            }
            if !sleep_or_cancel(token, self.terminating_retry).await {
                return Err(ClusterError::Cancelled);
            }
        }
    }

    async fn create_access(&self) -> ClusterResult<()> {
        let ns = self.name.as_str();
        for account in [AGENT_SERVICE_ACCOUNT, JOB_SERVICE_ACCOUNT] {
            let account = ServiceAccount {
                metadata: meta(account),
                ..ServiceAccount::default()
            };
            ignore_exists(self.cluster.create_service_account(ns, &account).await)?;
        }

        let role = Role {
            metadata: meta(ROLE),
            rules: Some(vec![
                rule("", &["secrets", "configmaps"], &ALL_VERBS),
                rule("coordination.k8s.io", &["leases"], &ALL_VERBS),
                rule(
                    "testworkflows.testkube.io",
                    &[
                        "testworkflows",
                        "testworkflows/status",
                        "testworkflowtemplates",
                        "testworkflowexecutions",
                    ],
                    &with_deletecollection(&ALL_VERBS),
                ),
                rule(
                    "tests.testkube.io",
                    &["testtriggers", "testexecutions", "testsuiteexecutions"],
                    &with_deletecollection(&ALL_VERBS),
                ),
            ]),
        };
        ignore_exists(self.cluster.create_role(ns, &role).await)?;

        let execution_role = Role {
            metadata: meta(EXECUTION_ROLE),
            rules: Some(vec![
                rule(
                    "batch",
                    &["jobs"],
                    &with_deletecollection(&["get", "watch", "list", "create", "delete"]),
                ),
                rule(
                    "",
                    &["pods", "persistentvolumeclaims", "secrets", "configmaps"],
                    &with_deletecollection(&ALL_VERBS),
                ),
                rule("", &["pods/log", "events"], &["get", "watch", "list"]),
            ]),
        };
        ignore_exists(self.cluster.create_role(ns, &execution_role).await)?;

        let bindings = [
            (format!("{ROLE}-rb"), ROLE, AGENT_SERVICE_ACCOUNT),
            (format!("{EXECUTION_ROLE}-rb"), EXECUTION_ROLE, AGENT_SERVICE_ACCOUNT),
            (format!("{EXECUTION_ROLE}-job-rb"), EXECUTION_ROLE, JOB_SERVICE_ACCOUNT),
        ];
        for (name, role, account) in bindings {
            let binding = RoleBinding {
                metadata: meta(&name),
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "Role".to_string(),
                    name: role.to_string(),
                },
                subjects: Some(vec![Subject {
                    kind: "ServiceAccount".to_string(),
                    name: account.to_string(),
                    namespace: Some(ns.to_string()),
                    ..Subject::default()
                }]),
            };
            ignore_exists(self.cluster.create_role_binding(ns, &binding).await)?;
        }
        Ok(())
    }

    /// Delete the namespace and the webhooks registered for it.
    ///
    /// Absence counts as success, so repeated calls never fail.
    pub async fn destroy(&self) -> ClusterResult<()> {
        let mut created = self.created.lock().await;
        ignore_not_found(self.cluster.delete_namespace(&self.name).await)?;
        ignore_not_found(
            self.cluster
                .delete_mutating_webhooks(&format!("{DEVBOX_NAME_LABEL}={}", self.name))
                .await,
        )?;
        *created = false;
        info!(namespace = %self.name, "namespace deleted");
        Ok(())
    }
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        ..ObjectMeta::default()
    }
}
