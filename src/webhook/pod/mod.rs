//! Pod mutating webhook
//!
//! The entry point for code-module injection. One admission call runs the
//! registered [`mutator::PodMutator`]s sequentially; a reinvocation (the API
//! server calling back after another webhook changed the pod) runs the
//! narrower `reinvoke` pass instead. Mutation errors fail open unless the pod
//! opted into the `fail` policy, so a broken injection path never blocks
//! unrelated deployments.

pub mod containers;
pub mod mutation_request;
pub mod mutator;

mod metadata;
mod oneagent;

pub use metadata::MetadataMutator;
pub use oneagent::OneAgentMutator;

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use self::mutation_request::{MutationRequest, FAILURE_POLICY_FAIL};
use self::mutator::PodMutator;
use super::WebhookState;
use crate::{INJECTED_ANNOTATION, INJECTION_INSTANCE_LABEL, INJECT_ANNOTATION, REASON_ANNOTATION};

/// The ordered mutator chain
pub struct PodWebhook {
    mutators: Vec<Box<dyn PodMutator>>,
}

impl Default for PodWebhook {
    fn default() -> Self {
        Self::new()
    }
}

impl PodWebhook {
    /// The production chain: OneAgent first, then metadata enrichment
    pub fn new() -> Self {
        Self::with_mutators(vec![Box::new(OneAgentMutator), Box::new(MetadataMutator)])
    }

    /// Chain with explicit mutators (tests)
    pub fn with_mutators(mutators: Vec<Box<dyn PodMutator>>) -> Self {
        Self { mutators }
    }

    /// Initial invocation: run every enabled mutator, then finalize the pod.
    /// Returns whether anything was injected, or the denial message when the
    /// pod opted into the `fail` policy and a mutator failed.
    pub fn apply(&self, request: &mut MutationRequest) -> std::result::Result<bool, String> {
        let mut applied = false;

        for mutator in &self.mutators {
            if !mutator.is_enabled(request) {
                debug!(mutator = mutator.name(), "mutator not enabled, skipping");
                continue;
            }
            match mutator.mutate(request) {
                Ok(()) => applied = true,
                Err(err) => {
                    warn!(mutator = mutator.name(), error = %err, "mutation failed");
                    request.set_pod_annotation(
                        REASON_ANNOTATION,
                        format!("{}: {}", mutator.name(), err),
                    );
                    if request.failure_policy() == FAILURE_POLICY_FAIL {
                        return Err(format!(
                            "injection failed for mutator {}: {}",
                            mutator.name(),
                            err
                        ));
                    }
                }
            }
        }

        if applied {
            let install_container = request.install_container.clone();
            if let Some(spec) = request.pod.spec.as_mut() {
                spec.init_containers
                    .get_or_insert_with(Vec::new)
                    .push(install_container);
            }
            request.set_pod_annotation(INJECTED_ANNOTATION, "true");
        }

        Ok(applied)
    }

    /// Reinvocation: cover containers added since the initial pass. Returns
    /// whether anything changed.
    pub fn reinvoke(&self, request: &mut MutationRequest) -> bool {
        let mut changed = false;
        for mutator in &self.mutators {
            if mutator.is_injected(request) && mutator.reinvoke(request) {
                changed = true;
            }
        }
        changed
    }
}

/// Axum handler for `POST /inject`
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Pod> = match body.try_into() {
        Ok(request) => request,
        Err(err) => {
            error!(error = %err, "failed to parse pod admission request");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };

    let response = mutate_pod(&state, &PodWebhook::new(), &request).await;
    Json(response.into_review())
}

async fn mutate_pod(
    state: &WebhookState,
    webhook: &PodWebhook,
    request: &AdmissionRequest<Pod>,
) -> AdmissionResponse {
    let Some(pod) = &request.object else {
        return AdmissionResponse::from(request);
    };

    if pod
        .annotations()
        .get(INJECT_ANNOTATION)
        .map(String::as_str)
        == Some("false")
    {
        debug!(pod = %pod.name_any(), "pod opted out of injection");
        return AdmissionResponse::from(request);
    }

    let namespace_name = request.namespace.clone().unwrap_or_default();
    let namespace = match state.reader.get_namespace(&namespace_name).await {
        Ok(Some(namespace)) => namespace,
        Ok(None) => {
            return AdmissionResponse::from(request)
                .deny(format!("namespace '{namespace_name}' not found"));
        }
        Err(err) => {
            error!(error = %err, "could not read namespace before pod injection");
            return AdmissionResponse::from(request).deny(err.to_string());
        }
    };

    let Some(instance) = namespace.labels().get(INJECTION_INSTANCE_LABEL).cloned() else {
        debug!(namespace = %namespace_name, "namespace carries no instance label, skipping");
        return AdmissionResponse::from(request);
    };

    let dynakube = match state.reader.get_dynakube(&instance).await {
        Ok(Some(dynakube)) => dynakube,
        Ok(None) => {
            return AdmissionResponse::from(request).deny(format!(
                "namespace '{namespace_name}' is assigned to DynaKube instance '{instance}' but it doesn't exist"
            ));
        }
        Err(err) => {
            error!(error = %err, "could not read dynakube before pod injection");
            return AdmissionResponse::from(request).deny(err.to_string());
        }
    };

    if !dynakube.needs_app_injection() {
        return AdmissionResponse::from(request);
    }

    let mut mutation =
        MutationRequest::new(pod.clone(), namespace, dynakube, &state.webhook_image);

    // a pod already carrying the injected mark is a reinvocation
    if pod.annotations().contains_key(INJECTED_ANNOTATION) {
        if webhook.reinvoke(&mut mutation) {
            info!(pod = %pod.name_any(), "reinvocation covered containers added by later webhooks");
            return patch_response(request, pod, &mutation.pod);
        }
        return AdmissionResponse::from(request);
    }

    match webhook.apply(&mut mutation) {
        Ok(true) => {
            info!(
                pod = %pod.name_any(),
                namespace = %namespace_name,
                dynakube = %instance,
                "injecting into pod"
            );
            patch_response(request, pod, &mutation.pod)
        }
        // a failed silent mutation may still have annotated the reason
        Ok(false) => patch_response(request, pod, &mutation.pod),
        Err(message) => AdmissionResponse::from(request).deny(message),
    }
}

fn patch_response(
    request: &AdmissionRequest<Pod>,
    original: &Pod,
    mutated: &Pod,
) -> AdmissionResponse {
    let (original_json, mutated_json) = match (
        serde_json::to_value(original),
        serde_json::to_value(mutated),
    ) {
        (Ok(original_json), Ok(mutated_json)) => (original_json, mutated_json),
        (Err(err), _) | (_, Err(err)) => {
            error!(error = %err, "could not serialize pod for patching");
            return AdmissionResponse::from(request).deny(err.to_string());
        }
    };

    let patch = json_patch::diff(&original_json, &mutated_json);
    if patch.0.is_empty() {
        return AdmissionResponse::from(request);
    }

    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "could not serialize pod patch");
            AdmissionResponse::from(request).deny(err.to_string())
        }
    }
}
