//! Object storage pod.
//!
//! A single MinIO container holds every uploaded binary. The orchestrator
//! writes through a forwarded port; pods inside the namespace read over
//! plain HTTP from the service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Probe, TCPSocketAction};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob::{BlobConnector, BlobStore};
use crate::cluster::{ClusterClient, ClusterResult};
use crate::config::UploadRetry;
use crate::digest::ContentDigest;
use crate::error::{BlobError, ClusterError};
use crate::forward;
use crate::pod::{container_port, empty_dir, env_var, mount, service_port, PodHandle};
use crate::poll::{sleep_or_cancel, PollPolicy};

pub const STORAGE_NAME: &str = "devbox-storage";
pub const DATA_PORT: u16 = 9000;
pub const CONSOLE_PORT: u16 = 9090;
pub const BUCKET: &str = "devbox";
pub const ACCESS_KEY: &str = "minioadmin";
pub const SECRET_KEY: &str = "minioadmin";

/// Object key of a binary.
pub fn object_key(binary: &str) -> String {
    format!("bin/{binary}")
}

/// Base URL pods in the namespace download binaries from.
pub fn download_base() -> String {
    format!("http://{STORAGE_NAME}:{DATA_PORT}/{BUCKET}/bin")
}

/// Local ports of both forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedPorts {
    pub data: u16,
    pub console: u16,
}

/// Result of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub key: String,
    pub digest: ContentDigest,
    /// False when the stored object already had this digest.
    pub changed: bool,
}

pub struct ObjectStorage {
    cluster: Arc<dyn ClusterClient>,
    pod: PodHandle,
    image: String,
    connector: Arc<dyn BlobConnector>,
    retry: UploadRetry,
    forwarded: tokio::sync::Mutex<Option<ForwardedPorts>>,
    store: OnceCell<Arc<dyn BlobStore>>,
    uploaded: Mutex<HashMap<String, ContentDigest>>,
}

impl ObjectStorage {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace: &str,
        image: &str,
        connector: Arc<dyn BlobConnector>,
        readiness: PollPolicy,
        retry: UploadRetry,
    ) -> Self {
        Self {
            pod: PodHandle::new(cluster.clone(), namespace, STORAGE_NAME, readiness),
            cluster,
            image: image.to_string(),
            connector,
            retry,
            forwarded: tokio::sync::Mutex::new(None),
            store: OnceCell::new(),
            uploaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn pod(&self) -> &PodHandle {
        &self.pod
    }

    pub async fn deploy(&self, token: &CancellationToken) -> ClusterResult<()> {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "minio".to_string(),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    args: Some(vec![
                        "server".to_string(),
                        "/data".to_string(),
                        "--console-address".to_string(),
                        format!(":{CONSOLE_PORT}"),
                    ]),
                    env: Some(vec![
                        env_var("MINIO_ROOT_USER", ACCESS_KEY),
                        env_var("MINIO_ROOT_PASSWORD", SECRET_KEY),
                    ]),
                    ports: Some(vec![
                        container_port("api", DATA_PORT),
                        container_port("console", CONSOLE_PORT),
                    ]),
                    readiness_probe: Some(Probe {
                        tcp_socket: Some(TCPSocketAction {
                            port: IntOrString::Int(i32::from(DATA_PORT)),
                            ..TCPSocketAction::default()
                        }),
                        period_seconds: Some(1),
                        ..Probe::default()
                    }),
                    volume_mounts: Some(vec![mount("data", "/data")]),
                    ..Container::default()
                }],
                volumes: Some(vec![empty_dir("data")]),
                ..PodSpec::default()
            }),
            ..Pod::default()
        };
        self.pod.create(pod, token).await?;
        self.pod
            .create_service(vec![
                service_port("api", DATA_PORT),
                service_port("console", CONSOLE_PORT),
            ])
            .await
    }

    pub async fn wait_for_ready(&self, token: &CancellationToken) -> ClusterResult<()> {
        self.pod.wait_for_ready(token).await
    }

    /// Forward the data and console ports once; later calls return the same ports.
    ///
    /// The forwards live until `token` is cancelled.
    pub async fn forward(&self, token: &CancellationToken) -> ClusterResult<ForwardedPorts> {
        let mut forwarded = self.forwarded.lock().await;
        if let Some(ports) = *forwarded {
            return Ok(ports);
        }
        let namespace = self.pod.namespace();
        let data = forward::start(
            self.cluster.clone(),
            namespace,
            STORAGE_NAME,
            DATA_PORT,
            0,
            token,
        )
        .await?;
        let console = forward::start(
            self.cluster.clone(),
            namespace,
            STORAGE_NAME,
            CONSOLE_PORT,
            0,
            token,
        )
        .await?;
        let ports = ForwardedPorts {
            data: data.local_port,
            console: console.local_port,
        };
        info!(data = ports.data, console = ports.console, "object storage forwarded");
        *forwarded = Some(ports);
        Ok(ports)
    }

    /// Blob store client over the forwarded data port. Connects once.
    pub async fn connect(&self, token: &CancellationToken) -> Result<Arc<dyn BlobStore>, BlobError> {
        let store = self
            .store
            .get_or_try_init(|| async {
                let ports = self
                    .forward(token)
                    .await
                    .map_err(|e: ClusterError| BlobError::Connect(e.to_string()))?;
                let store = self
                    .connector
                    .connect(&format!("http://127.0.0.1:{}", ports.data))
                    .await?;
                store.ensure_bucket().await?;
                Ok::<_, BlobError>(store)
            })
            .await?;
        Ok(Arc::clone(store))
    }

    /// Upload `data` as binary `name`.
    ///
    /// Skips the transfer when the stored object already has the same digest.
    /// Failed attempts are retried with a linear delay. Cancellation abandons
    /// an in-flight transfer and stops retrying.
    pub async fn upload(
        &self,
        name: &str,
        data: Vec<u8>,
        token: &CancellationToken,
    ) -> Result<Upload, BlobError> {
        let key = object_key(name);
        let digest = ContentDigest::from_bytes(&data);
        if self.stored_digest(&key) == Some(digest) {
            debug!(key = %key, hash = %digest.short(), "upload skipped, content unchanged");
            return Ok(Upload {
                key,
                digest,
                changed: false,
            });
        }

        let store = self.connect(token).await?;
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            if token.is_cancelled() {
                return Err(BlobError::Cancelled(key));
            }
            let result = tokio::select! {
                _ = token.cancelled() => return Err(BlobError::Cancelled(key.clone())),
                result = store.put(&key, data.clone()) => result,
            };
            match result {
                Ok(()) => {
                    self.uploaded
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(key.clone(), digest);
                    info!(key = %key, hash = %digest.short(), bytes = data.len(), "uploaded");
                    return Ok(Upload {
                        key,
                        digest,
                        changed: true,
                    });
                }
                Err(e) if attempt == attempts => return Err(e),
                Err(e) => {
                    warn!(key = %key, attempt = attempt, error = %e, "upload failed, retrying");
                    if !sleep_or_cancel(token, self.retry.base_delay * attempt).await {
                        return Err(BlobError::Cancelled(key));
                    }
                }
            }
        }
        Err(BlobError::Cancelled(key))
    }

    /// Read a binary back from the store.
    pub async fn download(&self, name: &str, token: &CancellationToken) -> Result<Vec<u8>, BlobError> {
        let store = self.connect(token).await?;
        store.get(&object_key(name)).await
    }

    fn stored_digest(&self, key: &str) -> Option<ContentDigest> {
        self.uploaded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeCluster, MemoryBlobConnector, MemoryBlobStore};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn storage(cluster: &Arc<FakeCluster>, store: &Arc<MemoryBlobStore>) -> ObjectStorage {
        ObjectStorage::new(
            cluster.clone(),
            "devbox-abc",
            "minio:test",
            Arc::new(MemoryBlobConnector::new(store.clone())),
            PollPolicy::fixed(Duration::from_millis(10), Duration::from_secs(2)),
            UploadRetry {
                attempts: 5,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn deploy_creates_pod_and_service() {
        let cluster = Arc::new(FakeCluster::new());
        let store = Arc::new(MemoryBlobStore::new());
        let storage = storage(&cluster, &store);
        let token = CancellationToken::new();

        storage.deploy(&token).await.unwrap();
        storage.wait_for_ready(&token).await.unwrap();

        let service = cluster.service("devbox-abc", STORAGE_NAME).unwrap();
        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 2);
        let pod = &cluster.pods("devbox-abc")[0];
        let probe = pod.spec.as_ref().unwrap().containers[0]
            .readiness_probe
            .clone()
            .unwrap();
        assert!(probe.tcp_socket.is_some());
    }

    #[tokio::test]
    async fn forward_is_idempotent() {
        let cluster = Arc::new(FakeCluster::new());
        let store = Arc::new(MemoryBlobStore::new());
        let storage = storage(&cluster, &store);
        let token = CancellationToken::new();

        let first = storage.forward(&token).await.unwrap();
        let second = storage.forward(&token).await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.data, first.console);
        token.cancel();
    }

    #[tokio::test]
    async fn forwarded_port_reaches_pod() {
        let cluster = Arc::new(FakeCluster::new());
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        cluster.expose(STORAGE_NAME, DATA_PORT, upstream.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            socket.write_all(b"minio").await.unwrap();
        });

        let store = Arc::new(MemoryBlobStore::new());
        let storage = storage(&cluster, &store);
        let token = CancellationToken::new();
        let ports = storage.forward(&token).await.unwrap();

        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", ports.data))
            .await
            .unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"minio");
        token.cancel();
    }

    #[tokio::test]
    async fn uploaded_content_reads_back_with_same_hash() {
        let cluster = Arc::new(FakeCluster::new());
        let store = Arc::new(MemoryBlobStore::new());
        let storage = storage(&cluster, &store);
        let token = CancellationToken::new();

        let data = b"\x7fELF agent binary".to_vec();
        let upload = storage.upload("agent", data.clone(), &token).await.unwrap();
        assert!(upload.changed);
        assert_eq!(upload.key, "bin/agent");

        let back = storage.download("agent", &token).await.unwrap();
        assert_eq!(ContentDigest::from_bytes(&back), upload.digest);
        assert!(store.bucket_ready());
        token.cancel();
    }

    #[tokio::test]
    async fn unchanged_upload_is_skipped() {
        let cluster = Arc::new(FakeCluster::new());
        let store = Arc::new(MemoryBlobStore::new());
        let storage = storage(&cluster, &store);
        let token = CancellationToken::new();

        storage.upload("init", b"v1".to_vec(), &token).await.unwrap();
        let again = storage.upload("init", b"v1".to_vec(), &token).await.unwrap();
        assert!(!again.changed);
        assert_eq!(store.puts(), 1);

        let changed = storage.upload("init", b"v2".to_vec(), &token).await.unwrap();
        assert!(changed.changed);
        assert_eq!(store.puts(), 2);
        token.cancel();
    }

    #[tokio::test]
    async fn failed_puts_are_retried() {
        let cluster = Arc::new(FakeCluster::new());
        let store = Arc::new(MemoryBlobStore::new());
        store.fail_next_puts(3);
        let storage = storage(&cluster, &store);
        let token = CancellationToken::new();

        let upload = storage.upload("toolkit", b"tk".to_vec(), &token).await.unwrap();
        assert!(upload.changed);
        assert_eq!(store.put_attempts(), 4);
        token.cancel();
    }

    #[tokio::test]
    async fn gives_up_after_last_attempt() {
        let cluster = Arc::new(FakeCluster::new());
        let store = Arc::new(MemoryBlobStore::new());
        store.fail_next_puts(10);
        let storage = storage(&cluster, &store);
        let token = CancellationToken::new();

        let err = storage
            .upload("toolkit", b"tk".to_vec(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Put { .. }));
        assert_eq!(store.put_attempts(), 5);
        token.cancel();
    }

    #[tokio::test]
    async fn cancelled_upload_is_not_retried() {
        let cluster = Arc::new(FakeCluster::new());
        let store = Arc::new(MemoryBlobStore::new());
        let storage = storage(&cluster, &store);
        let token = CancellationToken::new();
        storage.connect(&token).await.unwrap();

        let session = token.child_token();
        session.cancel();
        let err = storage
            .upload("agent", b"a".to_vec(), &session)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Cancelled(_)));
        assert_eq!(store.put_attempts(), 0);
        token.cancel();
    }

    #[tokio::test]
    async fn cancellation_abandons_stalled_put() {
        let cluster = Arc::new(FakeCluster::new());
        let store = Arc::new(MemoryBlobStore::new());
        let storage = storage(&cluster, &store);
        let token = CancellationToken::new();
        storage.connect(&token).await.unwrap();
        store.stall_puts();

        let session = token.child_token();
        let canceller = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            storage.upload("agent", b"a".to_vec(), &session),
        )
        .await
        .expect("upload kept waiting after cancellation")
        .unwrap_err();
        assert!(matches!(err, BlobError::Cancelled(_)));
        assert_eq!(store.put_attempts(), 1);
        assert!(store.object("bin/agent").is_none());
        token.cancel();
    }
}
