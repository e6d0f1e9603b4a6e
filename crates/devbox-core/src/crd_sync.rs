//! Mirrors local workflow manifests into an environment.
//!
//! Multi-document YAML files under the sync paths are loaded and keyed by
//! kind and name. Reloading a file produces `Create`, `Update` and `Delete`
//! updates against what was known before; only documents of kind
//! `TestWorkflow` and `TestWorkflowTemplate` are tracked.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlaneResult, ResourceKind, WorkflowClient};
use crate::error::{ControlPlaneError, ProvisionError, WatchError};
use crate::watcher::{is_manifest_file, FsWatcher};

/// One tracked document.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub name: String,
    pub source: PathBuf,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Create,
    Update,
    Delete,
}

/// A change to push to the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpdate {
    pub op: UpdateOp,
    pub kind: ResourceKind,
    pub name: String,
    /// Absent for deletions.
    pub body: Option<serde_json::Value>,
}

impl ResourceUpdate {
    /// Send this update through `client`.
    pub async fn apply(&self, client: &dyn WorkflowClient) -> ControlPlaneResult<()> {
        match (self.op, &self.body) {
            (UpdateOp::Create, Some(body)) => client.create(self.kind, body).await,
            (UpdateOp::Update, Some(body)) => client.update(self.kind, &self.name, body).await,
            (UpdateOp::Delete, _) => client.delete(self.kind, &self.name).await,
            (_, None) => Err(ControlPlaneError::Decode(format!(
                "{} {} has no body",
                self.kind, self.name
            ))),
        }
    }
}

type Key = (ResourceKind, String);

pub struct CrdSync {
    resources: BTreeMap<Key, Resource>,
    pending: VecDeque<ResourceUpdate>,
    watcher: FsWatcher,
}

impl CrdSync {
    /// Load every manifest under `roots`. Unreadable or invalid files fail the load.
    ///
    /// Watching starts before the first file is read.
    pub fn load(roots: &[PathBuf]) -> Result<Self, ProvisionError> {
        let roots: Vec<PathBuf> = roots
            .iter()
            .map(|root| std::fs::canonicalize(root).unwrap_or_else(|_| root.clone()))
            .collect();
        let watcher = FsWatcher::new(&roots, is_manifest_file)?;
        let mut sync = Self {
            resources: BTreeMap::new(),
            pending: VecDeque::new(),
            watcher,
        };
        let mut files = Vec::new();
        for root in &roots {
            collect_manifests(root, &mut files)
                .map_err(|e| ProvisionError::Manifest(format!("{}: {e}", root.display())))?;
        }
        for file in files {
            for resource in parse_file(&file)? {
                sync.resources
                    .insert((resource.kind, resource.name.clone()), resource);
            }
        }
        info!(resources = sync.resources.len(), "manifests loaded");
        Ok(sync)
    }

    /// Tracked resources, templates first.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Re-read one file and queue the resulting updates.
    pub fn reload(&mut self, path: &Path) {
        let current = if path.exists() {
            match parse_file(path) {
                Ok(resources) => resources,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping invalid manifest");
                    return;
                }
            }
        } else {
            Vec::new()
        };

        let previous: Vec<Key> = self
            .resources
            .iter()
            .filter(|(_, r)| r.source == path)
            .map(|(key, _)| key.clone())
            .collect();

        for resource in &current {
            let key = (resource.kind, resource.name.clone());
            let op = match self.resources.get(&key) {
                None => UpdateOp::Create,
                Some(known) if known.body != resource.body => UpdateOp::Update,
                Some(_) => continue,
            };
            self.pending.push_back(ResourceUpdate {
                op,
                kind: resource.kind,
                name: resource.name.clone(),
                body: Some(resource.body.clone()),
            });
        }

        for key in previous {
            if current.iter().any(|r| r.kind == key.0 && r.name == key.1) {
                continue;
            }
            self.resources.remove(&key);
            self.pending.push_back(ResourceUpdate {
                op: UpdateOp::Delete,
                kind: key.0,
                name: key.1,
                body: None,
            });
        }

        for resource in current {
            self.resources
                .insert((resource.kind, resource.name.clone()), resource);
        }
    }

    /// Next update, following the sync paths for changes.
    pub async fn next(&mut self, token: &CancellationToken) -> Result<ResourceUpdate, WatchError> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Ok(update);
            }
            let path = self.watcher.next(token).await?;
            debug!(path = %path.display(), "manifest changed");
            self.reload(&path);
        }
    }

    /// Create every tracked resource, templates before workflows, at most
    /// `concurrency` requests in flight. Returns the failures.
    pub async fn push_all(
        &self,
        client: Arc<dyn WorkflowClient>,
        concurrency: usize,
    ) -> Vec<(String, ControlPlaneError)> {
        let mut failures = Vec::new();
        for kind in [ResourceKind::Template, ResourceKind::Workflow] {
            let batch: Vec<&Resource> = self.resources.values().filter(|r| r.kind == kind).collect();
            let requests: Vec<BoxFuture<'_, (String, ControlPlaneResult<()>)>> = batch
                .into_iter()
                .map(|resource| {
                    let client = Arc::clone(&client);
                    async move {
                        let result = client.create(resource.kind, &resource.body).await;
                        (resource.name.clone(), result)
                    }
                    .boxed()
                })
                .collect();
            let results: Vec<(String, ControlPlaneResult<()>)> = stream::iter(requests)
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;
            failures.extend(
                results
                    .into_iter()
                    .filter_map(|(name, result)| result.err().map(|e| (name, e))),
            );
        }
        failures
    }
}

fn collect_manifests(path: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if path.is_file() {
        files.push(path.to_path_buf());
        return Ok(());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for entry in entries {
        let hidden = entry
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        if hidden {
            continue;
        }
        if entry.is_dir() {
            collect_manifests(&entry, files)?;
        } else if is_manifest_file(&entry) {
            files.push(entry);
        }
    }
    Ok(())
}

fn parse_file(path: &Path) -> Result<Vec<Resource>, ProvisionError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ProvisionError::Manifest(format!("{}: {e}", path.display())))?;
    parse_documents(&text, path)
}

fn parse_documents(text: &str, source: &Path) -> Result<Vec<Resource>, ProvisionError> {
    let mut resources = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| ProvisionError::Manifest(format!("{}: {e}", source.display())))?;
        if value.is_null() {
            continue;
        }
        let body: serde_json::Value = serde_json::to_value(&value)
            .map_err(|e| ProvisionError::Manifest(format!("{}: {e}", source.display())))?;
        let Some(kind) = body["kind"].as_str().and_then(ResourceKind::from_kind) else {
            continue;
        };
        let Some(name) = body["metadata"]["name"].as_str().map(str::to_string) else {
            warn!(path = %source.display(), kind = %kind, "document without a name");
            continue;
        };
        resources.push(Resource {
            kind,
            name,
            source: source.to_path_buf(),
            body,
        });
    }
    Ok(resources)
}
