//! Metadata enrichment injection
//!
//! Rides along with code-module injection: mounts an enrichment emptyDir the
//! agent writes workload metadata into, and tells the install container which
//! workload owns the pod so traces carry the right entity attributes.

use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, Pod, Volume, VolumeMount};

use super::containers::new_containers;
use super::mutation_request::{plain_env, MutationRequest};
use super::mutator::PodMutator;
use crate::Result;

/// Volume carrying the enrichment files
const ENRICHMENT_VOLUME: &str = "metadata-enrichment";

/// Mount point of the enrichment files in every injected container
const ENRICHMENT_PATH: &str = "/var/lib/dynatrace/enrichment";

/// Injects workload metadata enrichment
pub struct MetadataMutator;

impl PodMutator for MetadataMutator {
    fn name(&self) -> &'static str {
        "metadata-enrichment"
    }

    fn is_enabled(&self, request: &MutationRequest) -> bool {
        request.dynakube.needs_app_injection()
    }

    fn is_injected(&self, request: &MutationRequest) -> bool {
        request
            .pod
            .spec
            .as_ref()
            .and_then(|spec| spec.volumes.as_ref())
            .is_some_and(|volumes| volumes.iter().any(|v| v.name == ENRICHMENT_VOLUME))
    }

    fn mutate(&self, request: &mut MutationRequest) -> Result<()> {
        let (workload_kind, workload_name) = workload_of(&request.pod, &request.base_pod_name());

        request
            .install_container
            .env
            .get_or_insert_with(Vec::new)
            .extend([
                plain_env("DT_WORKLOAD_KIND", workload_kind),
                plain_env("DT_WORKLOAD_NAME", workload_name),
                plain_env("METADATA_ENRICHMENT_INJECTED", "true"),
            ]);
        request
            .install_container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(enrichment_mount());

        if let Some(spec) = request.pod.spec.as_mut() {
            spec.volumes.get_or_insert_with(Vec::new).push(Volume {
                name: ENRICHMENT_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        for index in new_containers(&request.dynakube, &request.pod, has_enrichment_mount) {
            mount_into(request, index);
        }

        Ok(())
    }

    fn reinvoke(&self, request: &mut MutationRequest) -> bool {
        let missing = new_containers(&request.dynakube, &request.pod, has_enrichment_mount);
        for index in &missing {
            mount_into(request, *index);
        }
        !missing.is_empty()
    }
}

/// The pod's controlling workload: kind and name of the controller owner
/// reference, or the pod itself when it stands alone
fn workload_of(pod: &Pod, base_pod_name: &str) -> (String, String) {
    let controller = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|owners| owners.iter().find(|owner| owner.controller == Some(true)));

    match controller {
        Some(owner) => (owner.kind.clone(), owner.name.clone()),
        None => (String::new(), base_pod_name.to_string()),
    }
}

fn has_enrichment_mount(container: &Container) -> bool {
    container
        .volume_mounts
        .as_ref()
        .is_some_and(|mounts| mounts.iter().any(|m| m.name == ENRICHMENT_VOLUME))
}

fn enrichment_mount() -> VolumeMount {
    VolumeMount {
        name: ENRICHMENT_VOLUME.to_string(),
        mount_path: ENRICHMENT_PATH.to_string(),
        ..Default::default()
    }
}

fn mount_into(request: &mut MutationRequest, index: usize) {
    if let Some(spec) = request.pod.spec.as_mut() {
        spec.containers[index]
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(enrichment_mount());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::dynakube::{AppInjectSpec, OneAgentSpec};
    use crate::crd::{DynaKube, DynaKubeSpec};
    use k8s_openapi::api::core::v1::{Namespace, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn injecting_dk() -> DynaKube {
        DynaKube::new(
            "dk",
            DynaKubeSpec {
                one_agent: Some(OneAgentSpec {
                    application_monitoring: Some(AppInjectSpec::default()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    fn owned_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                generate_name: Some("payments-5b7c9-".into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: "ReplicaSet".into(),
                    name: "payments-5b7c9".into(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn workload_comes_from_the_controller_owner() {
        let mut req =
            MutationRequest::new(owned_pod(), Namespace::default(), injecting_dk(), "img");
        MetadataMutator.mutate(&mut req).unwrap();

        let env = req.install_container.env.as_ref().unwrap();
        let value_of = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.as_deref())
        };
        assert_eq!(value_of("DT_WORKLOAD_KIND"), Some("ReplicaSet"));
        assert_eq!(value_of("DT_WORKLOAD_NAME"), Some("payments-5b7c9"));
    }

    #[test]
    fn standalone_pod_falls_back_to_its_base_name() {
        let mut pod = owned_pod();
        pod.metadata.owner_references = None;
        let mut req = MutationRequest::new(pod, Namespace::default(), injecting_dk(), "img");
        MetadataMutator.mutate(&mut req).unwrap();

        let env = req.install_container.env.as_ref().unwrap();
        let name = env
            .iter()
            .find(|e| e.name == "DT_WORKLOAD_NAME")
            .and_then(|e| e.value.as_deref());
        assert_eq!(name, Some("payments-5b7c9"));
    }

    #[test]
    fn containers_get_the_enrichment_mount_once() {
        let mut req =
            MutationRequest::new(owned_pod(), Namespace::default(), injecting_dk(), "img");
        MetadataMutator.mutate(&mut req).unwrap();
        assert!(MetadataMutator.is_injected(&req));
        assert!(has_enrichment_mount(&req.containers()[0]));

        // reinvocation with nothing new is a no-op
        assert!(!MetadataMutator.reinvoke(&mut req));
    }
}
