//! Per-container injection eligibility
//!
//! A container is excluded when an annotation `container.inject.dynatrace.com/<name>: "false"`
//! is present on either the DynaKube or the pod. Exclusion is honored on the
//! initial invocation and on reinvocations alike.

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;

use crate::crd::DynaKube;
use crate::CONTAINER_INJECT_PREFIX;

/// Whether a named container is opted out of injection on the CR or the pod
pub fn is_excluded(dynakube: &DynaKube, pod: &Pod, container_name: &str) -> bool {
    let key = format!("{CONTAINER_INJECT_PREFIX}{container_name}");

    let excluded_on = |annotations: Option<&std::collections::BTreeMap<String, String>>| {
        annotations.is_some_and(|map| map.get(&key).map(String::as_str) == Some("false"))
    };

    excluded_on(dynakube.metadata.annotations.as_ref())
        || excluded_on(pod.metadata.annotations.as_ref())
}

/// Indices of the pod's containers that still need injection: not excluded
/// and not yet carrying this mutator's marks per `already_injected`
pub fn new_containers(
    dynakube: &DynaKube,
    pod: &Pod,
    already_injected: impl Fn(&Container) -> bool,
) -> Vec<usize> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };

    spec.containers
        .iter()
        .enumerate()
        .filter(|(_, container)| !is_excluded(dynakube, pod, &container.name))
        .filter(|(_, container)| !already_injected(container))
        .map(|(index, _)| index)
        .collect()
}
