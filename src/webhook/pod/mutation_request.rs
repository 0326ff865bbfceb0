//! Data carried between pod mutators
//!
//! One [`MutationRequest`] lives for the duration of one admission call. The
//! install init container is assembled incrementally by the mutators and only
//! appended to the pod once at least one mutator actually applied.

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, Namespace, ObjectFieldSelector, Pod, SecurityContext,
    VolumeMount,
};
use kube::ResourceExt;

use crate::crd::DynaKube;
use crate::FAILURE_POLICY_ANNOTATION;

/// Name of the synthetic init container the webhook injects
pub const INSTALL_CONTAINER_NAME: &str = "install-oneagent";

/// Secret mounted into the install container with the generated init script
pub const CONFIG_SECRET_NAME: &str = "dynatrace-dynakube-config";

/// Volume name of the injection config mount
pub const CONFIG_VOLUME_NAME: &str = "injection-config";

/// Annotation overriding the code-module technology selection
pub const TECHNOLOGIES_ANNOTATION: &str = "oneagent.dynatrace.com/technologies";

/// Annotation overriding the agent install path inside the workload container
pub const INSTALL_PATH_ANNOTATION: &str = "oneagent.dynatrace.com/install-path";

/// Default agent install path inside workload containers
pub const DEFAULT_INSTALL_PATH: &str = "/opt/dynatrace/oneagent-paas";

/// Failure policy making mutation errors deny the pod
pub const FAILURE_POLICY_FAIL: &str = "fail";

/// State shared by all mutators during one admission call
pub struct MutationRequest {
    /// The pod being mutated
    pub pod: Pod,
    /// The pod's namespace, already fetched
    pub namespace: Namespace,
    /// The DynaKube the namespace is bound to
    pub dynakube: DynaKube,
    /// The install init container under assembly
    pub install_container: Container,
}

impl MutationRequest {
    /// Seed the request; the install container starts with the bookkeeping
    /// env vars and the injection-config mount, and mutators add their own.
    pub fn new(pod: Pod, namespace: Namespace, dynakube: DynaKube, webhook_image: &str) -> Self {
        let install_container = seed_install_container(&pod, webhook_image);
        Self {
            pod,
            namespace,
            dynakube,
            install_container,
        }
    }

    /// One pod annotation, if present
    pub fn pod_annotation(&self, key: &str) -> Option<&str> {
        self.pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    /// Pod annotation with a fallback
    pub fn pod_annotation_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.pod_annotation(key).unwrap_or(default)
    }

    /// The failure policy requested by the pod; `"silent"` unless opted in
    pub fn failure_policy(&self) -> &str {
        self.pod_annotation_or(FAILURE_POLICY_ANNOTATION, "silent")
    }

    /// Set one pod annotation
    pub fn set_pod_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.pod
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.into());
    }

    /// The pod's generate-name stem, used as the stable workload-ish name
    pub fn base_pod_name(&self) -> String {
        let name = self
            .pod
            .metadata
            .generate_name
            .clone()
            .unwrap_or_else(|| self.pod.name_any());
        match name.rfind('-') {
            Some(dash) => name[..dash].to_string(),
            None => name,
        }
    }

    /// Containers of the pod spec (empty slice when the spec is missing)
    pub fn containers(&self) -> &[Container] {
        self.pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default()
    }
}

fn seed_install_container(pod: &Pod, webhook_image: &str) -> Container {
    let containers_count = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.len())
        .unwrap_or_default();
    let failure_policy = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(FAILURE_POLICY_ANNOTATION))
        .cloned()
        .unwrap_or_else(|| "silent".to_string());
    let base_pod_name = {
        let name = pod
            .metadata
            .generate_name
            .clone()
            .or_else(|| pod.metadata.name.clone())
            .unwrap_or_default();
        match name.rfind('-') {
            Some(dash) => name[..dash].to_string(),
            None => name,
        }
    };

    // run with the first app container's security context so the volume
    // contents end up readable by the workload
    let security_context: Option<SecurityContext> = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.security_context.clone());

    Container {
        name: INSTALL_CONTAINER_NAME.to_string(),
        image: Some(webhook_image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/usr/bin/env".to_string()]),
        args: Some(vec!["bash".to_string(), "/mnt/config/init.sh".to_string()]),
        env: Some(vec![
            plain_env("CONTAINERS_COUNT", containers_count.to_string()),
            plain_env("FAILURE_POLICY", failure_policy),
            field_env("K8S_PODNAME", "metadata.name"),
            field_env("K8S_PODUID", "metadata.uid"),
            plain_env("K8S_BASEPODNAME", base_pod_name),
            field_env("K8S_NAMESPACE", "metadata.namespace"),
            field_env("K8S_NODE_NAME", "spec.nodeName"),
        ]),
        security_context,
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME_NAME.to_string(),
            mount_path: "/mnt/config".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Literal env var
pub fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// Downward-API env var
pub fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}
