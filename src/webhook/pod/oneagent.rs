//! OneAgent code-module injection
//!
//! Adds the agent binary volume (CSI-published or emptyDir), wires the
//! install container to unpack into it, and preloads the agent library into
//! every eligible application container via `LD_PRELOAD`.

use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, SecretKeySelector,
    SecretVolumeSource, Volume, VolumeMount,
};
use tracing::debug;

use super::containers::new_containers;
use super::mutation_request::{
    plain_env, MutationRequest, CONFIG_SECRET_NAME, CONFIG_VOLUME_NAME, DEFAULT_INSTALL_PATH,
    INSTALL_PATH_ANNOTATION, TECHNOLOGIES_ANNOTATION,
};
use super::mutator::PodMutator;
use crate::Result;

/// Name of the CSI driver publishing agent binaries
pub const CSI_DRIVER_NAME: &str = "csi.oneagent.dynatrace.com";

/// Volume holding the agent binaries
const BIN_VOLUME: &str = "oneagent-bin";

/// Volume shared between the install container and the app containers
const SHARE_VOLUME: &str = "oneagent-share";

/// Injects the OneAgent code module
pub struct OneAgentMutator;

impl PodMutator for OneAgentMutator {
    fn name(&self) -> &'static str {
        "oneagent"
    }

    fn is_enabled(&self, request: &MutationRequest) -> bool {
        request.dynakube.needs_app_injection()
    }

    fn is_injected(&self, request: &MutationRequest) -> bool {
        request.containers().iter().any(has_preload)
    }

    fn mutate(&self, request: &mut MutationRequest) -> Result<()> {
        let install_path = request
            .pod_annotation_or(INSTALL_PATH_ANNOTATION, DEFAULT_INSTALL_PATH)
            .to_string();
        let technologies = request
            .pod_annotation_or(TECHNOLOGIES_ANNOTATION, "all")
            .to_string();

        let (bin_volume, mode) = agent_volume(request);
        add_volumes(request, bin_volume);
        decorate_install_container(request, &technologies, &install_path, mode);

        for index in new_containers(&request.dynakube, &request.pod, has_preload) {
            self.inject_container(request, index, &install_path);
        }

        Ok(())
    }

    fn reinvoke(&self, request: &mut MutationRequest) -> bool {
        let install_path = request
            .pod_annotation_or(INSTALL_PATH_ANNOTATION, DEFAULT_INSTALL_PATH)
            .to_string();

        let missing = new_containers(&request.dynakube, &request.pod, has_preload);
        for index in &missing {
            debug!(container = *index, "instrumenting container added by a later webhook");
            self.inject_container(request, *index, &install_path);
        }

        !missing.is_empty()
    }
}

impl OneAgentMutator {
    fn inject_container(&self, request: &mut MutationRequest, index: usize, install_path: &str) {
        // register the container with the install script first
        let (name, image) = {
            let container = &request.containers()[index];
            (
                container.name.clone(),
                container.image.clone().unwrap_or_default(),
            )
        };
        request
            .install_container
            .env
            .get_or_insert_with(Vec::new)
            .extend([
                plain_env(format!("CONTAINER_{}_NAME", index + 1).as_str(), name.clone()),
                plain_env(format!("CONTAINER_{}_IMAGE", index + 1).as_str(), image),
            ]);

        let proxy_configured = request
            .dynakube
            .spec
            .proxy
            .as_ref()
            .is_some_and(|proxy| proxy.value.is_some() || proxy.value_from.is_some());

        let Some(spec) = request.pod.spec.as_mut() else {
            return;
        };
        let container = &mut spec.containers[index];

        container.volume_mounts.get_or_insert_with(Vec::new).extend([
            VolumeMount {
                name: SHARE_VOLUME.to_string(),
                mount_path: "/etc/ld.so.preload".to_string(),
                sub_path: Some("ld.so.preload".to_string()),
                ..Default::default()
            },
            VolumeMount {
                name: BIN_VOLUME.to_string(),
                mount_path: install_path.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: SHARE_VOLUME.to_string(),
                mount_path: "/var/lib/dynatrace/oneagent/agent/config/container.conf".to_string(),
                sub_path: Some(format!("container_{name}.conf")),
                ..Default::default()
            },
        ]);

        let env = container.env.get_or_insert_with(Vec::new);
        env.push(plain_env(
            "LD_PRELOAD",
            format!("{install_path}/agent/lib64/liboneagentproc.so"),
        ));
        if proxy_configured {
            env.push(EnvVar {
                name: "DT_PROXY".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: CONFIG_SECRET_NAME.to_string(),
                        key: "proxy".to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            });
        }
    }
}

fn has_preload(container: &Container) -> bool {
    container
        .env
        .as_ref()
        .is_some_and(|env| env.iter().any(|var| var.name == "LD_PRELOAD"))
}

/// The binary volume source and the install mode it implies
fn agent_volume(request: &MutationRequest) -> (Volume, &'static str) {
    if request.dynakube.needs_csi_driver() {
        (
            Volume {
                name: BIN_VOLUME.to_string(),
                csi: Some(CSIVolumeSource {
                    driver: CSI_DRIVER_NAME.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            "provisioned",
        )
    } else {
        (
            Volume {
                name: BIN_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            "installer",
        )
    }
}

fn add_volumes(request: &mut MutationRequest, bin_volume: Volume) {
    let Some(spec) = request.pod.spec.as_mut() else {
        return;
    };
    spec.volumes.get_or_insert_with(Vec::new).extend([
        bin_volume,
        Volume {
            name: SHARE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: CONFIG_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(CONFIG_SECRET_NAME.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]);
}

fn decorate_install_container(
    request: &mut MutationRequest,
    technologies: &str,
    install_path: &str,
    mode: &str,
) {
    request
        .install_container
        .env
        .get_or_insert_with(Vec::new)
        .extend([
            plain_env("FLAVOR", "multidistro"),
            plain_env("TECHNOLOGIES", technologies),
            plain_env("INSTALLPATH", install_path),
            plain_env("MODE", mode),
            plain_env("ONEAGENT_INJECTED", "true"),
        ]);

    request
        .install_container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .extend([
            VolumeMount {
                name: BIN_VOLUME.to_string(),
                mount_path: "/mnt/bin".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: SHARE_VOLUME.to_string(),
                mount_path: "/mnt/share".to_string(),
                ..Default::default()
            },
        ]);
}
