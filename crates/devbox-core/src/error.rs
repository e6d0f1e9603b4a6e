//! Error types for devbox.
//!
//! Each concern gets its own enum; [`DevboxError`] is the top-level taxonomy
//! the orchestrator reports against.

use thiserror::Error;

/// Errors raised by the cluster connector.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Resource exists but is being deleted
    #[error("being deleted: {0}")]
    Terminating(String),

    /// Namespace exists but was not created by devbox
    #[error("namespace {0} already exists and is not a devbox namespace")]
    NotDevboxNamespace(String),

    /// Polling gave up
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    /// Remote command failed
    #[error("exec failed: {0}")]
    Exec(String),

    #[error("port forward failed: {0}")]
    PortForward(String),

    /// Any other API failure
    #[error("cluster api error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// Errors raised by the control-plane connector.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("request failed: {0}")]
    Http(String),

    /// Non-success status from the API
    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ControlPlaneError::Decode(err.to_string())
        } else {
            ControlPlaneError::Http(err.to_string())
        }
    }
}

/// Errors raised while compiling a binary.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to start compiler for {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Compiler exited unsuccessfully; `output` holds stdout and stderr
    #[error("build of {name} failed:\n{output}")]
    Failed { name: String, output: String },

    #[error("build of {0} cancelled")]
    Cancelled(String),

    #[error("cannot build {name} for platform {platform}")]
    UnsupportedPlatform { name: String, platform: String },

    #[error("failed to read artifact {path}: {source}")]
    Artifact {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the blob store.
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob store connection failed: {0}")]
    Connect(String),

    #[error("upload of {key} failed: {message}")]
    Put { key: String, message: String },

    #[error("download of {key} failed: {message}")]
    Get { key: String, message: String },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("upload of {0} cancelled")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the filesystem watcher.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watch backend error: {0}")]
    Backend(String),

    /// Event stream ended and cannot be restarted
    #[error("watcher closed")]
    Closed,

    #[error("watch cancelled")]
    Cancelled,
}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        WatchError::Backend(err.to_string())
    }
}

/// Errors raised while generating certificates.
#[derive(Error, Debug)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generate(String),
}

impl From<rcgen::Error> for CertError {
    fn from(err: rcgen::Error) -> Self {
        CertError::Generate(err.to_string())
    }
}

/// Failure of a single provisioning step.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// Several parallel steps failed
    #[error("{}", join_errors(.0))]
    Multiple(Vec<ProvisionError>),
}

fn join_errors(errors: &[ProvisionError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ProvisionError {
    /// Collapse a batch of failures; `None` when there were none.
    pub fn combine(mut errors: Vec<ProvisionError>) -> Option<ProvisionError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ProvisionError::Multiple(errors)),
        }
    }
}

/// Top-level error taxonomy.
#[derive(Error, Debug)]
pub enum DevboxError {
    /// Fatal; remaining startup steps are aborted and teardown runs
    #[error("{phase} failed: {source}")]
    Provisioning {
        phase: String,
        #[source]
        source: ProvisionError,
    },

    /// Recoverable inside a rebuild session
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Recoverable inside a rebuild session
    #[error("upload failed: {0}")]
    Upload(#[from] BlobError),

    /// Logged, never blocks exit
    #[error("teardown failed: {0}")]
    Teardown(String),

    /// Fatal to the watch loop only
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("cancelled")]
    Cancelled,
}

impl DevboxError {
    pub fn provisioning(phase: impl Into<String>, source: impl Into<ProvisionError>) -> Self {
        DevboxError::Provisioning {
            phase: phase.into(),
            source: source.into(),
        }
    }
}

/// Result alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, DevboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_error_names_phase() {
        let err = DevboxError::provisioning(
            "create namespace",
            ClusterError::NotDevboxNamespace("devbox-abc".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "create namespace failed: namespace devbox-abc already exists and is not a devbox namespace"
        );
    }

    #[test]
    fn build_failure_embeds_output() {
        let err = BuildError::Failed {
            name: "agent".to_string(),
            output: "error[E0425]: cannot find value".to_string(),
        };
        assert!(err.to_string().contains("error[E0425]"));
    }

    #[test]
    fn combined_errors_list_every_failure() {
        assert!(ProvisionError::combine(Vec::new()).is_none());
        let combined = ProvisionError::combine(vec![
            BuildError::Cancelled("agent".to_string()).into(),
            BuildError::Cancelled("init".to_string()).into(),
        ])
        .unwrap();
        assert_eq!(
            combined.to_string(),
            "build of agent cancelled; build of init cancelled"
        );
    }

    #[test]
    fn not_found_is_detected() {
        assert!(ClusterError::NotFound("pod x".into()).is_not_found());
        assert!(!ClusterError::Cancelled.is_not_found());
    }
}
