//! Devbox Core Library
//!
//! Provisions an ephemeral development session in a cluster, keeps it in sync
//! with local source changes and removes it again on exit.

pub mod agent;
pub mod blob;
pub mod builder;
pub mod cert;
pub mod cluster;
pub mod config;
pub mod control_plane;
pub mod crd_sync;
pub mod digest;
pub mod error;
pub mod fakes;
pub mod forward;
pub mod interceptor;
pub mod namespace;
pub mod obs;
pub mod orchestrator;
pub mod pod;
pub mod poll;
pub mod rebuild;
pub mod storage;
pub mod telemetry;
pub mod watcher;

pub use blob::{BlobConnector, BlobStore, S3BlobConnector, S3BlobStore};
pub use builder::Binary;
pub use cluster::{ClusterClient, KubeCluster};
pub use config::{
    BinaryGroup, BinaryTarget, BuildRecipe, ControlPlaneConfig, DevboxConfig, Images, Platform,
    UploadRetry,
};
pub use control_plane::{
    AgentConnection, ControlPlane, Environment, HttpControlPlane, WorkflowClient,
};
pub use crd_sync::CrdSync;
pub use digest::ContentDigest;
pub use error::{
    BlobError, BuildError, ClusterError, ControlPlaneError, DevboxError, ProvisionError, Result,
    WatchError,
};
pub use forward::PortForward;
pub use orchestrator::{delete_environments, Devbox, DevboxContext, Session, SessionInfo};
pub use poll::PollPolicy;
pub use rebuild::{RebuildCounts, RebuildSlot};
pub use telemetry::init_tracing;
