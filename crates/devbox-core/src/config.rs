//! Session configuration.
//!
//! [`DevboxConfig`] is built once by the CLI and handed to every component.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::poll::PollPolicy;

pub const DEFAULT_AGENT_IMAGE: &str = "kubeshop/testkube-api-server:latest";
pub const DEFAULT_INIT_IMAGE: &str = "kubeshop/testkube-tw-init:latest";
pub const DEFAULT_TOOLKIT_IMAGE: &str = "kubeshop/testkube-tw-toolkit:latest";
pub const DEFAULT_STORAGE_IMAGE: &str = "minio/minio:RELEASE.2024-10-13T13-34-11Z";
pub const DEFAULT_PLACEHOLDER_IMAGE: &str = "busybox:1.36.1-musl";

/// Operating system and CPU architecture of the cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Rust target triple for a statically linked build on this platform.
    pub fn target_triple(&self) -> Option<&'static str> {
        match (self.os.as_str(), self.arch.as_str()) {
            ("linux", "amd64") => Some("x86_64-unknown-linux-musl"),
            ("linux", "arm64") => Some("aarch64-unknown-linux-musl"),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() => Ok(Self::new(os, arch)),
            _ => Err(format!("invalid platform '{s}', expected os/arch")),
        }
    }
}

/// How one artifact gets built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildRecipe {
    /// `cargo build --release --package P --bin B --target <triple>`
    Cargo { package: String, bin: String },
    /// Arbitrary command producing `artifact`, relative to the workspace.
    Command {
        program: String,
        args: Vec<String>,
        artifact: PathBuf,
    },
}

/// One artifact to build and ship into the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryTarget {
    /// Object storage key suffix and log name.
    pub name: String,
    pub recipe: BuildRecipe,
}

impl BinaryTarget {
    pub fn cargo(name: &str, package: &str) -> Self {
        Self {
            name: name.to_string(),
            recipe: BuildRecipe::Cargo {
                package: package.to_string(),
                bin: name.to_string(),
            },
        }
    }

    pub fn command(name: &str, program: &str, args: &[&str], artifact: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            recipe: BuildRecipe::Command {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                artifact: artifact.into(),
            },
        }
    }
}

/// Binaries that are rebuilt together when their sources change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryGroup {
    pub name: String,
    pub targets: Vec<BinaryTarget>,
    /// Directories watched for changes, relative to the workspace.
    pub source_dirs: Vec<PathBuf>,
    /// Restart the agent pod when an artifact of this group changed.
    pub restart_agent: bool,
}

/// Container images used by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Images {
    pub agent: String,
    pub init: String,
    pub toolkit: String,
    pub storage: String,
    pub placeholder: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT_IMAGE.to_string(),
            init: DEFAULT_INIT_IMAGE.to_string(),
            toolkit: DEFAULT_TOOLKIT_IMAGE.to_string(),
            storage: DEFAULT_STORAGE_IMAGE.to_string(),
            placeholder: DEFAULT_PLACEHOLDER_IMAGE.to_string(),
        }
    }
}

/// Linear retry for uploads: attempt `n` waits `base_delay * n` after failing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UploadRetry {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for UploadRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Everything a session needs, constructed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevboxConfig {
    /// Session name; the environment name and namespace derive from it.
    pub name: String,
    pub images: Images,
    /// Root of the source tree being built.
    pub workspace: PathBuf,
    /// Built once before the interceptor deploys; not rebuilt on changes.
    pub interceptor: BinaryTarget,
    pub groups: Vec<BinaryGroup>,
    /// Paths with declarative workflow resources to mirror.
    pub sync_paths: Vec<PathBuf>,
    pub debounce: Duration,
    pub readiness: PollPolicy,
    pub terminating_retry: Duration,
    pub upload: UploadRetry,
    pub crd_push_concurrency: usize,
}

impl DevboxConfig {
    pub fn new(name: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            images: Images::default(),
            workspace: workspace.into(),
            interceptor: BinaryTarget::cargo("devbox-interceptor", "devbox-interceptor"),
            groups: default_groups(),
            sync_paths: Vec::new(),
            debounce: Duration::from_millis(300),
            readiness: PollPolicy::default(),
            terminating_retry: Duration::from_millis(200),
            upload: UploadRetry::default(),
            crd_push_concurrency: 30,
        }
    }

    pub fn with_images(mut self, images: Images) -> Self {
        self.images = images;
        self
    }

    pub fn with_sync_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.sync_paths = paths;
        self
    }

    pub fn with_groups(mut self, groups: Vec<BinaryGroup>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_interceptor(mut self, target: BinaryTarget) -> Self {
        self.interceptor = target;
        self
    }

    /// Namespace that hosts the session.
    pub fn namespace(&self) -> String {
        format!("devbox-{}", self.name)
    }

    /// Absolute watch roots of a group.
    ///
    /// Source dirs missing from the workspace are skipped; with none left the
    /// whole workspace is watched.
    pub fn watch_roots(&self, group: &BinaryGroup) -> Vec<PathBuf> {
        let roots: Vec<PathBuf> = group
            .source_dirs
            .iter()
            .map(|dir| resolve(&self.workspace, dir))
            .filter(|dir| dir.exists())
            .collect();
        if roots.is_empty() {
            return vec![self.workspace.clone()];
        }
        roots
    }

    /// Directory where built artifacts are collected.
    pub fn output_dir(&self) -> PathBuf {
        self.workspace.join("target").join("devbox")
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Agent group restarts the agent pod; the workflow group feeds job pods.
///
/// Each group watches the crate directories of its own packages.
pub fn default_groups() -> Vec<BinaryGroup> {
    vec![
        BinaryGroup {
            name: "agent".to_string(),
            targets: vec![BinaryTarget::cargo("agent", "agent")],
            source_dirs: vec![PathBuf::from("crates/agent")],
            restart_agent: true,
        },
        BinaryGroup {
            name: "workflow".to_string(),
            targets: vec![
                BinaryTarget::cargo("init", "init"),
                BinaryTarget::cargo("toolkit", "toolkit"),
            ],
            source_dirs: vec![PathBuf::from("crates/init"), PathBuf::from("crates/toolkit")],
            restart_agent: false,
        },
    ]
}

/// Control-plane connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub api_url: String,
    pub api_key: String,
    pub organization_id: String,
    pub ui_url: String,
    /// Skip TLS verification.
    pub insecure: bool,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            api_url: std::env::var("DEVBOX_API_URL")
                .unwrap_or_else(|_| "https://api.testkube.io".to_string()),
            api_key: std::env::var("DEVBOX_API_KEY").unwrap_or_default(),
            organization_id: std::env::var("DEVBOX_ORG_ID").unwrap_or_default(),
            ui_url: std::env::var("DEVBOX_UI_URL")
                .unwrap_or_else(|_| "https://app.testkube.io".to_string()),
            insecure: std::env::var("DEVBOX_INSECURE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn new(api_url: &str, api_key: &str, organization_id: &str) -> Self {
        Self {
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            organization_id: organization_id.to_string(),
            ui_url: String::new(),
            insecure: false,
        }
    }

    pub fn with_ui_url(mut self, ui_url: &str) -> Self {
        self.ui_url = ui_url.to_string();
        self
    }
}
