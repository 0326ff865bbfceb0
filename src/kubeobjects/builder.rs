//! Object builder kit
//!
//! Builders assemble Kubernetes objects from small, pure field-writers
//! ("options"). `build(owner, target, options)` applies each option to the
//! target in order and finally stamps the owner reference, so every object
//! the operator creates is garbage-collected with its DynaKube.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, LocalObjectReference, PodSpec, Secret, Service, ServicePort, Toleration,
    Volume,
};
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};

use crate::{Error, Result};

/// A pure field-writer applied to the object under construction
pub type BuildOption<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Apply `options` to `target` in order, then set the owner reference.
///
/// The owner must already exist in the cluster (it needs a UID); passing an
/// owner without one is a programming error and fails the build.
pub fn build<T, O>(owner: Option<&O>, mut target: T, options: Vec<BuildOption<T>>) -> Result<T>
where
    T: Resource<DynamicType = ()>,
    O: Resource<DynamicType = ()>,
{
    for option in options {
        option(&mut target);
    }

    if let Some(owner) = owner {
        let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
            Error::validation(format!(
                "owner {}/{} has no uid, cannot set owner reference",
                owner.namespace().unwrap_or_default(),
                owner.name_any(),
            ))
        })?;
        target.meta_mut().owner_references = Some(vec![owner_ref]);
    }

    Ok(target)
}

// =============================================================================
// Generic metadata options
// =============================================================================

/// Set the object name
pub fn with_name<T: Resource<DynamicType = ()>>(name: impl Into<String>) -> BuildOption<T> {
    let name = name.into();
    Box::new(move |obj| obj.meta_mut().name = Some(name))
}

/// Set the object namespace
pub fn with_namespace<T: Resource<DynamicType = ()>>(ns: impl Into<String>) -> BuildOption<T> {
    let ns = ns.into();
    Box::new(move |obj| obj.meta_mut().namespace = Some(ns))
}

/// Merge labels into the object metadata
pub fn with_labels<T: Resource<DynamicType = ()>>(
    labels: BTreeMap<String, String>,
) -> BuildOption<T> {
    Box::new(move |obj| {
        obj.meta_mut()
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels);
    })
}

/// Merge annotations into the object metadata
pub fn with_annotations<T: Resource<DynamicType = ()>>(
    annotations: BTreeMap<String, String>,
) -> BuildOption<T> {
    Box::new(move |obj| {
        obj.meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations);
    })
}

// =============================================================================
// Secret / ConfigMap options
// =============================================================================

/// Set the secret payload
pub fn secret_data(data: BTreeMap<String, ByteString>) -> BuildOption<Secret> {
    Box::new(move |secret| secret.data = Some(data))
}

/// Set the secret type (e.g. `kubernetes.io/tls`)
pub fn secret_type(type_: impl Into<String>) -> BuildOption<Secret> {
    let type_ = type_.into();
    Box::new(move |secret| secret.type_ = Some(type_))
}

/// Set the config map payload
pub fn config_map_data(data: BTreeMap<String, String>) -> BuildOption<ConfigMap> {
    Box::new(move |cm| cm.data = Some(data))
}

// =============================================================================
// Service options
// =============================================================================

/// Set the service selector
pub fn service_selector(selector: BTreeMap<String, String>) -> BuildOption<Service> {
    Box::new(move |svc| {
        svc.spec.get_or_insert_with(Default::default).selector = Some(selector);
    })
}

/// Set the service ports
pub fn service_ports(ports: Vec<ServicePort>) -> BuildOption<Service> {
    Box::new(move |svc| {
        svc.spec.get_or_insert_with(Default::default).ports = Some(ports);
    })
}

// =============================================================================
// Job options
// =============================================================================

/// Access the pod spec inside a Job, materializing the nested defaults
fn job_pod_spec(job: &mut Job) -> &mut PodSpec {
    job.spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

/// Set the single container the Job runs
pub fn job_container(container: Container) -> BuildOption<Job> {
    Box::new(move |job| job_pod_spec(job).containers = vec![container])
}

/// Merge annotations into the Job's pod template
pub fn job_pod_annotations(annotations: BTreeMap<String, String>) -> BuildOption<Job> {
    Box::new(move |job| {
        job.spec
            .get_or_insert_with(Default::default)
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations);
    })
}

/// Merge labels into the Job's pod template
pub fn job_pod_labels(labels: BTreeMap<String, String>) -> BuildOption<Job> {
    Box::new(move |job| {
        job.spec
            .get_or_insert_with(Default::default)
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels);
    })
}

/// Set pod tolerations
pub fn job_tolerations(tolerations: Vec<Toleration>) -> BuildOption<Job> {
    Box::new(move |job| {
        if !tolerations.is_empty() {
            job_pod_spec(job).tolerations = Some(tolerations);
        }
    })
}

/// Set image pull secrets on the pod
pub fn job_pull_secrets(names: Vec<String>) -> BuildOption<Job> {
    Box::new(move |job| {
        if !names.is_empty() {
            job_pod_spec(job).image_pull_secrets = Some(
                names
                    .into_iter()
                    .map(|name| LocalObjectReference { name })
                    .collect(),
            );
        }
    })
}

/// Set pod volumes
pub fn job_volumes(volumes: Vec<Volume>) -> BuildOption<Job> {
    Box::new(move |job| job_pod_spec(job).volumes = Some(volumes))
}

/// Set the pod priority class
pub fn job_priority_class(name: impl Into<String>) -> BuildOption<Job> {
    let name = name.into();
    Box::new(move |job| job_pod_spec(job).priority_class_name = Some(name))
}

/// Control service-account token automounting
pub fn job_automount_service_account_token(automount: bool) -> BuildOption<Job> {
    Box::new(move |job| {
        job_pod_spec(job).automount_service_account_token = Some(automount);
    })
}

/// Restart failed pods in place instead of creating new ones
pub fn job_restart_policy_on_failure() -> BuildOption<Job> {
    Box::new(|job| job_pod_spec(job).restart_policy = Some("OnFailure".to_string()))
}

/// Garbage-collect the Job this long after it finishes
pub fn job_ttl_seconds_after_finished(seconds: i32) -> BuildOption<Job> {
    Box::new(move |job| {
        job.spec
            .get_or_insert_with(Default::default)
            .ttl_seconds_after_finished = Some(seconds);
    })
}

/// Time-box the Job
pub fn job_active_deadline_seconds(seconds: i64) -> BuildOption<Job> {
    Box::new(move |job| {
        job.spec
            .get_or_insert_with(Default::default)
            .active_deadline_seconds = Some(seconds);
    })
}

/// Run the pod under the given service account.
///
/// Sets both the modern field and the deprecated `serviceAccount` alias;
/// older admission tooling still reads the alias.
pub fn job_service_account(name: impl Into<String>) -> BuildOption<Job> {
    let name = name.into();
    Box::new(move |job| {
        let spec = job_pod_spec(job);
        spec.service_account_name = Some(name.clone());
        #[allow(deprecated)]
        {
            spec.service_account = Some(name);
        }
    })
}

/// Pin the pod to a node
pub fn job_node_name(name: impl Into<String>) -> BuildOption<Job> {
    let name = name.into();
    Box::new(move |job| job_pod_spec(job).node_name = Some(name))
}
