//! Namespace mutating webhook
//!
//! Binds namespaces to DynaKubes: a namespace matched by exactly one
//! app-injecting DynaKube gets the instance label the pod webhook later keys
//! on; a namespace matched by none gets the label cleared. More than one
//! match is an invariant violation and is denied outright, because the pod
//! webhook could not resolve the namespace to a single configuration.
//!
//! The `updated-via-dynakube` annotation is a loop breaker: the reconciler
//! stamps it when it updates a namespace itself, and this webhook's only job
//! on such an update is to strip it again.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use k8s_openapi::api::core::v1::Namespace;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, error, info};

use super::WebhookState;
use crate::crd::DynaKube;
use crate::validation::namespace_selector::{is_ignored_namespace, selects_namespace};
use crate::{INJECTION_INSTANCE_LABEL, UPDATED_VIA_DYNAKUBE_ANNOTATION};

/// Axum handler for `POST /label-ns`
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Namespace>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Namespace> = match body.try_into() {
        Ok(request) => request,
        Err(err) => {
            error!(error = %err, "failed to parse namespace admission request");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };

    let response = mutate_namespace(&state, &request).await;
    Json(response.into_review())
}

async fn mutate_namespace(
    state: &WebhookState,
    request: &AdmissionRequest<Namespace>,
) -> AdmissionResponse {
    let Some(namespace) = &request.object else {
        return AdmissionResponse::from(request);
    };

    if is_ignored_namespace(namespace, &state.operator_namespace) {
        debug!(namespace = %namespace.name_any(), "namespace exempt from mapping");
        return AdmissionResponse::from(request);
    }

    let dynakubes = match state.reader.list_dynakubes().await {
        Ok(dynakubes) => dynakubes,
        Err(err) => {
            error!(error = %err, "could not list dynakubes for namespace mapping");
            return AdmissionResponse::from(request)
                .deny(format!("namespace mapping failed to read cluster state: {err}"));
        }
    };

    match map_namespace(namespace, &dynakubes) {
        Ok(mutated) => patch_response(request, namespace, &mutated),
        Err(message) => AdmissionResponse::from(request).deny(message),
    }
}

/// Pure mapping step: strip the loop-breaker annotation, or recompute the
/// instance label against the current DynaKube set
pub fn map_namespace(
    namespace: &Namespace,
    dynakubes: &[DynaKube],
) -> std::result::Result<Namespace, String> {
    let mut mutated = namespace.clone();

    // reconciler-initiated update: only strip the marker, touch nothing else
    if let Some(annotations) = mutated.metadata.annotations.as_mut() {
        if annotations.remove(UPDATED_VIA_DYNAKUBE_ANNOTATION).is_some() {
            debug!(namespace = %namespace.name_any(), "stripping reconciler loop-breaker annotation");
            return Ok(mutated);
        }
    }

    let matching: Vec<&DynaKube> = dynakubes
        .iter()
        .filter(|dk| dk.needs_app_injection())
        .filter(|dk| selects_namespace(dk, namespace))
        .collect();

    match matching.as_slice() {
        [] => {
            if let Some(labels) = mutated.metadata.labels.as_mut() {
                labels.remove(INJECTION_INSTANCE_LABEL);
            }
        }
        [dynakube] => {
            info!(
                namespace = %namespace.name_any(),
                dynakube = %dynakube.name_any(),
                "mapping namespace to dynakube"
            );
            mutated
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(INJECTION_INSTANCE_LABEL.to_string(), dynakube.name_any());
        }
        many => {
            let mut names: Vec<String> = many.iter().map(|dk| dk.name_any()).collect();
            names.sort();
            return Err(format!(
                "namespace '{}' matches more than one DynaKube ({}); fix the namespace selectors so exactly one matches",
                namespace.name_any(),
                names.join(", ")
            ));
        }
    }

    Ok(mutated)
}

fn patch_response(
    request: &AdmissionRequest<Namespace>,
    original: &Namespace,
    mutated: &Namespace,
) -> AdmissionResponse {
    let (original_json, mutated_json) = match (
        serde_json::to_value(original),
        serde_json::to_value(mutated),
    ) {
        (Ok(original_json), Ok(mutated_json)) => (original_json, mutated_json),
        (Err(err), _) | (_, Err(err)) => {
            error!(error = %err, "could not serialize namespace for patching");
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
            error!(error = %err, "could not serialize namespace patch");
            AdmissionResponse::from(request).deny(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeCrReader;
    use super::*;
    use crate::crd::dynakube::{AppInjectSpec, OneAgentSpec};
    use crate::crd::DynaKubeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use std::collections::BTreeMap;

    fn injecting_dk(name: &str, selector: Option<&[(&str, &str)]>) -> DynaKube {
        DynaKube {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("dynatrace".into()),
                ..Default::default()
            },
            spec: DynaKubeSpec {
                api_url: "https://tenant.live.dynatrace.com/api".into(),
                one_agent: Some(OneAgentSpec {
                    application_monitoring: Some(AppInjectSpec::default()),
                    ..Default::default()
                }),
                namespace_selector: selector.map(|pairs| LabelSelector {
                    match_labels: Some(
                        pairs
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        }
    }

    fn plain_namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn review_request(namespace: &Namespace) -> AdmissionRequest<Namespace> {
        let review = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "ns-review",
                "kind": {"group": "", "version": "v1", "kind": "Namespace"},
                "resource": {"group": "", "version": "v1", "resource": "namespaces"},
                "operation": "UPDATE",
                "userInfo": {},
                "object": serde_json::to_value(namespace).unwrap(),
            }
        });
        let review: AdmissionReview<Namespace> = serde_json::from_value(review).unwrap();
        review.try_into().unwrap()
    }

    fn state_with(dynakubes: Vec<DynaKube>) -> WebhookState {
        WebhookState {
            reader: Arc::new(FakeCrReader::with_dynakubes(dynakubes)),
            operator_namespace: "dynatrace".into(),
            webhook_image: "dynatrace-webhook:test".into(),
        }
    }

    /// Story: a single matching DynaKube stamps its instance label
    #[test]
    fn single_match_sets_the_instance_label() {
        let namespace = plain_namespace("apps", &[("team", "a")]);
        let dynakubes = vec![injecting_dk("dk", Some(&[("team", "a")]))];

        let mutated = map_namespace(&namespace, &dynakubes).unwrap();
        assert_eq!(
            mutated.labels().get(INJECTION_INSTANCE_LABEL),
            Some(&"dk".to_string())
        );
    }

    /// Story: when the last matching DynaKube goes away, the label is cleared
    #[test]
    fn no_match_clears_a_stale_instance_label() {
        let namespace = plain_namespace("apps", &[(INJECTION_INSTANCE_LABEL, "gone")]);

        let mutated = map_namespace(&namespace, &[]).unwrap();
        assert!(!mutated.labels().contains_key(INJECTION_INSTANCE_LABEL));
    }

    /// Story: ambiguous mapping is rejected instead of picking a winner
    #[test]
    fn two_matches_are_rejected() {
        let namespace = plain_namespace("apps", &[("team", "a")]);
        let dynakubes = vec![
            injecting_dk("first", Some(&[("team", "a")])),
            injecting_dk("second", None),
        ];

        let message = map_namespace(&namespace, &dynakubes).unwrap_err();
        assert!(message.contains("more than one DynaKube"));
        assert!(message.contains("first, second"));
    }

    /// Story: a reconciler-stamped namespace only loses the marker annotation
    #[test]
    fn loop_breaker_annotation_is_stripped_and_nothing_else_happens() {
        let mut namespace = plain_namespace("apps", &[("team", "a")]);
        namespace.metadata.annotations = Some(BTreeMap::from([(
            UPDATED_VIA_DYNAKUBE_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        // a matching DynaKube exists, but the marker path must not map
        let dynakubes = vec![injecting_dk("dk", Some(&[("team", "a")]))];

        let mutated = map_namespace(&namespace, &dynakubes).unwrap();
        assert!(!mutated
            .annotations()
            .contains_key(UPDATED_VIA_DYNAKUBE_ANNOTATION));
        assert!(!mutated.labels().contains_key(INJECTION_INSTANCE_LABEL));
    }

    /// Story: the operator's own namespace passes through untouched
    #[tokio::test]
    async fn own_namespace_is_allowed_with_empty_patch() {
        let state = state_with(vec![injecting_dk("dk", None)]);
        let namespace = plain_namespace("dynatrace", &[]);
        let request = review_request(&namespace);

        let response = mutate_namespace(&state, &request).await;
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    /// Story: end to end through the admission path, the patch carries the label
    #[tokio::test]
    async fn admission_response_patches_the_label_in() {
        let state = state_with(vec![injecting_dk("dk", Some(&[("inject", "true")]))]);
        let namespace = plain_namespace("apps", &[("inject", "true")]);
        let request = review_request(&namespace);

        let response = mutate_namespace(&state, &request).await;
        assert!(response.allowed);

        let patch: json_patch::Patch =
            serde_json::from_slice(&response.patch.expect("patch must be set")).unwrap();
        let patched = {
            let mut doc = serde_json::to_value(&namespace).unwrap();
            json_patch::patch(&mut doc, &patch).unwrap();
            doc
        };
        assert_eq!(
            patched["metadata"]["labels"][INJECTION_INSTANCE_LABEL],
            serde_json::json!("dk")
        );
    }
}
