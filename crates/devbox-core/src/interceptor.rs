//! Pod interceptor.
//!
//! A placeholder container waits for `/app/server-ready`, then execs the
//! injected bootstrap server. The server binary and the flag arrive as a
//! gzipped tar stream on the stdin of `tar -xzf - -C /app`, in that order,
//! so the flag never lands before the binary is complete.
//!
//! Once the server is ready, [`PodInterceptor::enable`] registers the
//! mutating webhook that routes new execution pods through it.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{
    Container, HTTPGetAction, Pod, PodSpec, Probe, Secret, SecretVolumeSource, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cert::{service_dns_names, CertificateBundle};
use crate::cluster::{
    ignore_not_found, ClusterClient, ClusterResult, DEVBOX_NAME_LABEL, RESOURCE_ID_LABEL,
};
use crate::error::{ClusterError, ProvisionError};
use crate::pod::{empty_dir, mount, service_port, PodHandle};
use crate::poll::PollPolicy;
use crate::storage;

pub const INTERCEPTOR_NAME: &str = "devbox-interceptor";
pub const CERT_SECRET: &str = "devbox-interceptor-cert";
pub const INTERCEPTOR_PORT: u16 = 8443;
pub const WEBHOOK_NAME: &str = "devbox.kb.io";
const CONTAINER: &str = "interceptor";
const SERVER_ENTRY: &str = "server";
const READY_ENTRY: &str = "server-ready";

/// One file in an injection stream.
#[derive(Debug, Clone, Copy)]
pub struct TarEntry<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
    pub mode: u32,
}

/// Gzipped tar archive of `entries`, written in order.
pub fn tar_stream(entries: &[TarEntry<'_>]) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(entry.mode);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(entry.data.len() as u64);
        builder.append_data(&mut header, entry.name, entry.data)?;
    }
    builder.finish()?;
    let archive = builder.into_inner()?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&archive)?;
    encoder.finish()
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Name of the webhook configuration owned by `namespace`.
pub fn webhook_configuration_name(namespace: &str) -> String {
    format!("{INTERCEPTOR_NAME}-webhook-{namespace}")
}

pub struct PodInterceptor {
    cluster: Arc<dyn ClusterClient>,
    pod: PodHandle,
    placeholder_image: String,
    bundle: Mutex<Option<CertificateBundle>>,
}

impl PodInterceptor {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace: &str,
        placeholder_image: &str,
        readiness: PollPolicy,
    ) -> Self {
        Self {
            pod: PodHandle::new(cluster.clone(), namespace, INTERCEPTOR_NAME, readiness),
            cluster,
            placeholder_image: placeholder_image.to_string(),
            bundle: Mutex::new(None),
        }
    }

    pub fn pod(&self) -> &PodHandle {
        &self.pod
    }

    fn namespace(&self) -> &str {
        self.pod.namespace()
    }

    /// Deploy the placeholder pod and inject the server binary into it.
    pub async fn deploy(
        &self,
        binary_path: &Path,
        init_image: &str,
        toolkit_image: &str,
        token: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let namespace = self.namespace().to_string();
        let bundle = self.certificate(&namespace).await?;
        *self
            .bundle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(bundle);

        self.pod
            .create(self.placeholder_pod(init_image, toolkit_image), token)
            .await?;
        self.pod
            .create_service(vec![service_port("api", INTERCEPTOR_PORT)])
            .await?;
        self.pod.wait_for_started(token).await?;

        let binary = tokio::fs::read(binary_path)
            .await
            .map_err(ClusterError::from)?;
        let stream = tar_stream(&[
            TarEntry {
                name: SERVER_ENTRY,
                data: &binary,
                mode: 0o755,
            },
            TarEntry {
                name: READY_ENTRY,
                data: &[1],
                mode: 0o644,
            },
        ])
        .map_err(ClusterError::from)?;
        debug!(bytes = stream.len(), "streaming interceptor binary");

        let command: Vec<String> = ["tar", "-xzf", "-", "-C", "/app"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self
            .cluster
            .exec_with_stdin(&namespace, INTERCEPTOR_NAME, CONTAINER, &command, stream)
            .await?;
        if !output.success {
            return Err(ClusterError::Exec(format!(
                "failed to stream interceptor binary: {}",
                output.output
            ))
            .into());
        }
        info!(namespace = %namespace, "interceptor binary injected");
        Ok(())
    }

    fn placeholder_pod(&self, init_image: &str, toolkit_image: &str) -> Pod {
        let script = format!(
            "while [ ! -f /app/{READY_ENTRY} ]; do sleep 1; done\n/app/{SERVER_ENTRY} --storage-url {} {} {}",
            shell_quote(&storage::download_base()),
            shell_quote(init_image),
            shell_quote(toolkit_image),
        );
        Pod {
            spec: Some(PodSpec {
                termination_grace_period_seconds: Some(1),
                volumes: Some(vec![
                    empty_dir("server"),
                    Volume {
                        name: "certs".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(CERT_SECRET.to_string()),
                            ..SecretVolumeSource::default()
                        }),
                        ..Volume::default()
                    },
                ]),
                containers: vec![Container {
                    name: CONTAINER.to_string(),
                    image: Some(self.placeholder_image.clone()),
                    command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
                    volume_mounts: Some(vec![mount("server", "/app"), mount("certs", "/certs")]),
                    readiness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            path: Some("/health".to_string()),
                            port: IntOrString::Int(i32::from(INTERCEPTOR_PORT)),
                            scheme: Some("HTTPS".to_string()),
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

    /// Store a fresh certificate, or reuse the one a previous run left behind.
    async fn certificate(&self, namespace: &str) -> Result<CertificateBundle, ProvisionError> {
        let bundle = CertificateBundle::generate(
            INTERCEPTOR_NAME,
            &service_dns_names(INTERCEPTOR_NAME, namespace),
        )?;
        match self
            .cluster
            .create_secret(namespace, &certificate_secret(&bundle))
            .await
        {
            Ok(()) => Ok(bundle),
            Err(ClusterError::AlreadyExists(_)) => {
                let secret = self
                    .cluster
                    .get_secret(namespace, CERT_SECRET)
                    .await?
                    .ok_or_else(|| ClusterError::NotFound(format!("secret {CERT_SECRET}")))?;
                debug!(namespace = %namespace, "reusing interceptor certificate");
                Ok(bundle_from_secret(&secret)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the HTTPS readiness probe.
    pub async fn wait_for_ready(&self, token: &CancellationToken) -> ClusterResult<()> {
        self.pod.wait_for_ready(token).await
    }

    /// Register the webhook, replacing a previous registration.
    pub async fn enable(&self) -> ClusterResult<()> {
        let ca = self
            .bundle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|b| b.ca_cert.clone())
            .ok_or_else(|| ClusterError::NotFound("interceptor certificate".to_string()))?;
        self.disable().await?;
        self.cluster
            .create_mutating_webhook(&self.webhook(ca))
            .await?;
        info!(namespace = %self.namespace(), "webhook enabled");
        Ok(())
    }

    /// Remove the webhook registration. Absence counts as success.
    pub async fn disable(&self) -> ClusterResult<()> {
        ignore_not_found(
            self.cluster
                .delete_mutating_webhook(&webhook_configuration_name(self.namespace()))
                .await,
        )
    }

    fn webhook(&self, ca_cert: String) -> MutatingWebhookConfiguration {
        let namespace = self.namespace().to_string();
        MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(webhook_configuration_name(&namespace)),
                labels: Some(BTreeMap::from([(
                    DEVBOX_NAME_LABEL.to_string(),
                    namespace.clone(),
                )])),
                ..ObjectMeta::default()
            },
            webhooks: Some(vec![MutatingWebhook {
                name: WEBHOOK_NAME.to_string(),
                client_config: WebhookClientConfig {
                    service: Some(ServiceReference {
                        name: INTERCEPTOR_NAME.to_string(),
                        namespace: namespace.clone(),
                        path: Some("/mutate".to_string()),
                        port: Some(i32::from(INTERCEPTOR_PORT)),
                    }),
                    ca_bundle: Some(ByteString(ca_cert.into_bytes())),
                    ..WebhookClientConfig::default()
                },
                rules: Some(vec![RuleWithOperations {
                    api_groups: Some(vec![String::new()]),
                    api_versions: Some(vec!["v1".to_string()]),
                    resources: Some(vec!["pods".to_string()]),
                    operations: Some(vec!["CREATE".to_string()]),
                    scope: Some("Namespaced".to_string()),
                }]),
                namespace_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: "kubernetes.io/metadata.name".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![namespace]),
                    }]),
                    ..LabelSelector::default()
                }),
                object_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: RESOURCE_ID_LABEL.to_string(),
                        operator: "Exists".to_string(),
                        values: None,
                    }]),
                    ..LabelSelector::default()
                }),
                side_effects: "None".to_string(),
                admission_review_versions: vec!["v1".to_string()],
                ..MutatingWebhook::default()
            }]),
        }
    }
}

fn certificate_secret(bundle: &CertificateBundle) -> Secret {
    let entry = |key: &str, pem: &str| (key.to_string(), ByteString(pem.as_bytes().to_vec()));
    Secret {
        metadata: ObjectMeta {
            name: Some(CERT_SECRET.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([
            entry("ca.crt", &bundle.ca_cert),
            entry("tls.crt", &bundle.leaf_cert),
            entry("tls.key", &bundle.leaf_key),
        ])),
        ..Secret::default()
    }
}

fn bundle_from_secret(secret: &Secret) -> ClusterResult<CertificateBundle> {
    let field = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|value| String::from_utf8_lossy(&value.0).into_owned())
            .ok_or_else(|| ClusterError::NotFound(format!("{key} in secret {CERT_SECRET}")))
    };
    Ok(CertificateBundle {
        ca_cert: field("ca.crt")?,
        ca_key: String::new(),
        leaf_cert: field("tls.crt")?,
        leaf_key: field("tls.key")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeCluster;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::time::Duration;

    fn interceptor(cluster: &Arc<FakeCluster>) -> PodInterceptor {
        PodInterceptor::new(
            cluster.clone(),
            "devbox-abc",
            "busybox:1.36.1-musl",
            PollPolicy::fixed(Duration::from_millis(10), Duration::from_secs(2)),
        )
    }

    fn entries(stream: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(GzDecoder::new(stream));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().to_string();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    async fn deployed(cluster: &Arc<FakeCluster>) -> PodInterceptor {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("devbox-interceptor");
        std::fs::write(&binary, b"\x7fELF interceptor").unwrap();
        let interceptor = interceptor(cluster);
        interceptor
            .deploy(
                &binary,
                "init:1",
                "toolkit:1",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        interceptor
    }

    #[test]
    fn tar_stream_keeps_entry_order() {
        let stream = tar_stream(&[
            TarEntry {
                name: "server",
                data: b"bin",
                mode: 0o755,
            },
            TarEntry {
                name: "server-ready",
                data: &[1],
                mode: 0o644,
            },
        ])
        .unwrap();
        let names: Vec<String> = entries(&stream).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["server", "server-ready"]);
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("img:1"), "'img:1'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[tokio::test]
    async fn deploy_injects_binary_then_flag() {
        let cluster = Arc::new(FakeCluster::new());
        deployed(&cluster).await;

        let execs = cluster.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].command, vec!["tar", "-xzf", "-", "-C", "/app"]);
        assert_eq!(execs[0].container, "interceptor");
        let files = entries(&execs[0].stdin);
        assert_eq!(files[0], ("server".to_string(), b"\x7fELF interceptor".to_vec()));
        assert_eq!(files[1], ("server-ready".to_string(), vec![1]));
    }

    #[tokio::test]
    async fn deploy_stores_certificate_and_placeholder() {
        let cluster = Arc::new(FakeCluster::new());
        deployed(&cluster).await;

        let secret = cluster.secret("devbox-abc", CERT_SECRET).unwrap();
        let data = secret.data.unwrap();
        assert!(data.contains_key("ca.crt"));
        assert!(data.contains_key("tls.crt"));
        assert!(data.contains_key("tls.key"));

        let pod = cluster.pod("devbox-abc", INTERCEPTOR_NAME).unwrap();
        let command = pod.spec.unwrap().containers[0].command.clone().unwrap();
        assert!(command[2].starts_with("while [ ! -f /app/server-ready ]"));
        assert!(command[2].ends_with("'init:1' 'toolkit:1'"));
        assert!(cluster.service("devbox-abc", INTERCEPTOR_NAME).is_some());
    }

    #[tokio::test]
    async fn existing_certificate_is_reused() {
        let cluster = Arc::new(FakeCluster::new());
        let earlier = CertificateBundle {
            ca_cert: "earlier ca".to_string(),
            ca_key: String::new(),
            leaf_cert: "earlier crt".to_string(),
            leaf_key: "earlier key".to_string(),
        };
        cluster
            .create_secret("devbox-abc", &certificate_secret(&earlier))
            .await
            .unwrap();

        let interceptor = deployed(&cluster).await;
        interceptor.enable().await.unwrap();

        let data = cluster.secret("devbox-abc", CERT_SECRET).unwrap().data.unwrap();
        assert_eq!(data["tls.crt"].0, b"earlier crt".to_vec());
        let binding = cluster.webhooks();
        let hook = &binding[0].webhooks.as_ref().unwrap()[0];
        assert_eq!(
            hook.client_config.ca_bundle.as_ref().unwrap().0,
            b"earlier ca".to_vec()
        );
    }

    #[tokio::test]
    async fn failed_injection_reports_output() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_exec("tar: short read");
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("server");
        std::fs::write(&binary, b"bin").unwrap();

        let err = interceptor(&cluster)
            .deploy(&binary, "init:1", "toolkit:1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tar: short read"));
    }

    #[tokio::test]
    async fn enable_twice_leaves_one_registration() {
        let cluster = Arc::new(FakeCluster::new());
        let interceptor = deployed(&cluster).await;

        interceptor.enable().await.unwrap();
        interceptor.enable().await.unwrap();

        let webhooks = cluster.webhooks();
        assert_eq!(webhooks.len(), 1);
        assert_eq!(cluster.webhook_creations(), 2);
        let hook = &webhooks[0].webhooks.as_ref().unwrap()[0];
        assert_eq!(hook.name, WEBHOOK_NAME);
        assert_eq!(hook.side_effects, "None");
        let selector = hook.object_selector.as_ref().unwrap();
        assert_eq!(
            selector.match_expressions.as_ref().unwrap()[0].key,
            RESOURCE_ID_LABEL
        );
    }

    #[tokio::test]
    async fn disable_tolerates_absence() {
        let cluster = Arc::new(FakeCluster::new());
        let interceptor = deployed(&cluster).await;
        interceptor.disable().await.unwrap();
        interceptor.enable().await.unwrap();
        interceptor.disable().await.unwrap();
        interceptor.disable().await.unwrap();
        assert!(cluster.webhooks().is_empty());
    }

    #[tokio::test]
    async fn enable_requires_deploy() {
        let cluster = Arc::new(FakeCluster::new());
        let err = interceptor(&cluster).enable().await.unwrap_err();
        assert!(err.is_not_found());
    }
}
