//! Pod rewriting.
//!
//! Workflow pods get a shared `devbox` volume and a leading init container
//! that downloads the freshly built `init` (and `toolkit`, when the pod uses
//! it) from object storage. Entrypoints and spec paths are then pointed at
//! the downloaded copies.

use devbox_core::cluster::{RESOURCE_ID_LABEL, SPEC_ANNOTATION};
use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, Pod, Volume, VolumeMount};

pub const DEVBOX_VOLUME: &str = "devbox";
pub const DEVBOX_DIR: &str = "/.tk-devbox";
const FETCH_CONTAINER: &str = "devbox-init";
const WGET: &str = "/.tktw-bin/wget";

/// Images and storage location the rewrite refers to.
#[derive(Debug, Clone)]
pub struct MutationConfig {
    pub init_image: String,
    pub toolkit_image: String,
    /// Base URL that serves `init` and `toolkit`.
    pub storage_url: String,
}

impl MutationConfig {
    pub fn new(init_image: &str, toolkit_image: &str, storage_url: &str) -> Self {
        Self {
            init_image: init_image.to_string(),
            toolkit_image: toolkit_image.to_string(),
            storage_url: storage_url.trim_end_matches('/').to_string(),
        }
    }

    fn is_own_image(&self, image: Option<&str>) -> bool {
        image == Some(self.init_image.as_str()) || image == Some(self.toolkit_image.as_str())
    }
}

fn is_workflow_pod(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(RESOURCE_ID_LABEL))
        .is_some_and(|id| !id.is_empty())
}

/// Rewrite `pod` in place. Returns `false` when the pod is not a workflow pod.
pub fn mutate_pod(pod: &mut Pod, config: &MutationConfig) -> bool {
    if !is_workflow_pod(pod) {
        return false;
    }
    let Some(spec) = pod.spec.as_mut() else {
        return false;
    };

    let uses_toolkit = spec
        .init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .any(|c| c.image.as_deref() == Some(config.toolkit_image.as_str()));

    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: DEVBOX_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    });

    let init_containers = spec.init_containers.get_or_insert_with(Vec::new);
    init_containers.insert(0, fetch_container(config, uses_toolkit));
    for container in init_containers.iter_mut().chain(spec.containers.iter_mut()) {
        redirect_entrypoint(container, config);
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: DEVBOX_VOLUME.to_string(),
                mount_path: DEVBOX_DIR.to_string(),
                ..VolumeMount::default()
            });
    }

    if let Some(annotation) = pod
        .metadata
        .annotations
        .as_mut()
        .and_then(|annotations| annotations.get_mut(SPEC_ANNOTATION))
    {
        let target = format!("\"{DEVBOX_DIR}/toolkit\"");
        *annotation = annotation
            .replace("\"/toolkit\"", &target)
            .replace("\"/.tktw/toolkit\"", &target);
    }
    true
}

fn fetch_script(config: &MutationConfig, uses_toolkit: bool) -> String {
    let binaries: &[&str] = if uses_toolkit {
        &["init", "toolkit"]
    } else {
        &["init"]
    };
    let mut lines = vec!["set -e".to_string()];
    for name in binaries {
        lines.push(format!(
            "{WGET} -O {DEVBOX_DIR}/{name} {}/{name} || exit 1",
            config.storage_url
        ));
    }
    for name in binaries {
        lines.push(format!("chmod 777 {DEVBOX_DIR}/{name}"));
    }
    lines.push(format!("ls -lah {DEVBOX_DIR}"));
    lines.join("\n")
}

fn fetch_container(config: &MutationConfig, uses_toolkit: bool) -> Container {
    Container {
        name: FETCH_CONTAINER.to_string(),
        image: Some(config.init_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![fetch_script(config, uses_toolkit)]),
        ..Container::default()
    }
}

fn redirect_entrypoint(container: &mut Container, config: &MutationConfig) {
    let own_image = config.is_own_image(container.image.as_deref());
    if let Some(entry) = container.command.as_mut().and_then(|c| c.first_mut()) {
        if (own_image && entry == "/init") || entry == "/.tktw/init" {
            *entry = format!("{DEVBOX_DIR}/init");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn config() -> MutationConfig {
        MutationConfig::new("tw-init:1", "tw-toolkit:1", "http://devbox-storage:9000/devbox/bin/")
    }

    fn container(name: &str, image: &str, command: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            command: Some(vec![command.to_string()]),
            ..Container::default()
        }
    }

    fn workflow_pod(containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([(
                    RESOURCE_ID_LABEL.to_string(),
                    "run-1".to_string(),
                )])),
                annotations: Some(BTreeMap::from([(
                    SPEC_ANNOTATION.to_string(),
                    r#"{"toolkit":"/.tktw/toolkit","other":"/toolkit"}"#.to_string(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                init_containers: Some(vec![container("setup", "tw-init:1", "/init")]),
                containers,
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn untracked_pods_are_left_alone() {
        let mut pod = workflow_pod(vec![container("main", "alpine", "/bin/true")]);
        pod.metadata.labels = None;
        let before = pod.clone();
        assert!(!mutate_pod(&mut pod, &config()));
        assert_eq!(pod, before);
    }

    #[test]
    fn workflow_pod_fetches_init_first() {
        let mut pod = workflow_pod(vec![container("main", "alpine", "/.tktw/init")]);
        assert!(mutate_pod(&mut pod, &config()));

        let spec = pod.spec.unwrap();
        let init = spec.init_containers.unwrap();
        assert_eq!(init[0].name, "devbox-init");
        let script = &init[0].args.as_ref().unwrap()[0];
        assert!(script.contains("-O /.tk-devbox/init http://devbox-storage:9000/devbox/bin/init"));
        assert!(!script.contains("toolkit"));

        assert_eq!(init[1].command.as_ref().unwrap()[0], "/.tk-devbox/init");
        assert_eq!(spec.containers[0].command.as_ref().unwrap()[0], "/.tk-devbox/init");
        assert!(spec
            .volumes
            .unwrap()
            .iter()
            .any(|v| v.name == DEVBOX_VOLUME && v.empty_dir.is_some()));
        for c in init.iter().chain(spec.containers.iter()) {
            assert!(c
                .volume_mounts
                .as_ref()
                .unwrap()
                .iter()
                .any(|m| m.mount_path == DEVBOX_DIR));
        }
    }

    #[test]
    fn toolkit_pods_also_fetch_toolkit() {
        let mut pod = workflow_pod(vec![container("main", "tw-toolkit:1", "/toolkit")]);
        mutate_pod(&mut pod, &config());
        let init = pod.spec.unwrap().init_containers.unwrap();
        let script = &init[0].args.as_ref().unwrap()[0];
        assert!(script.contains("/.tk-devbox/toolkit http://devbox-storage:9000/devbox/bin/toolkit"));
        assert!(script.contains("chmod 777 /.tk-devbox/toolkit"));
    }

    #[test]
    fn plain_init_command_is_kept_for_foreign_images() {
        let mut pod = workflow_pod(vec![container("main", "alpine", "/init")]);
        mutate_pod(&mut pod, &config());
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers[0].command.as_ref().unwrap()[0], "/init");
    }

    #[test]
    fn spec_annotation_points_at_downloaded_toolkit() {
        let mut pod = workflow_pod(vec![container("main", "alpine", "/bin/true")]);
        mutate_pod(&mut pod, &config());
        let annotations = pod.metadata.annotations.unwrap();
        assert_eq!(
            annotations[SPEC_ANNOTATION],
            r#"{"toolkit":"/.tk-devbox/toolkit","other":"/.tk-devbox/toolkit"}"#
        );
    }

    #[test]
    fn containers_without_command_are_tolerated() {
        let mut main = container("main", "tw-init:1", "/init");
        main.command = None;
        let mut pod = workflow_pod(vec![main]);
        assert!(mutate_pod(&mut pod, &config()));
        assert!(pod.spec.unwrap().containers[0].command.is_none());
    }
}
