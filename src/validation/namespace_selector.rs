//! Namespace-selector overlap rule
//!
//! Two app-injecting DynaKubes may never select the same namespace: the pod
//! webhook resolves a namespace to exactly one instance label, so an overlap
//! would make injection ambiguous.

use super::ValidationContext;
use crate::crd::DynaKube;
use crate::kubeobjects::selector::selector_matches;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;

pub(crate) const ERROR_CONFLICTING_NAMESPACE_SELECTOR: &str = "The DynaKube's specification tries to inject into namespaces where another Dynakube already injects into, which is not supported. Make sure the namespaceSelector doesn't conflict with other Dynakubes namespaceSelector";

/// Deny when this DynaKube and another app-injecting DynaKube both select
/// at least one common namespace
pub fn conflicting_namespace_selector(ctx: &ValidationContext) -> Option<String> {
    if !ctx.dynakube.needs_app_injection() {
        return None;
    }

    let injecting_peers: Vec<&DynaKube> = ctx
        .other_dynakubes
        .iter()
        .filter(|other| other.needs_app_injection())
        .collect();
    if injecting_peers.is_empty() {
        return None;
    }

    for namespace in ctx.namespaces {
        if is_ignored_namespace(namespace, ctx.operator_namespace) {
            continue;
        }
        if !selects_namespace(ctx.dynakube, namespace) {
            continue;
        }
        if injecting_peers
            .iter()
            .any(|other| selects_namespace(other, namespace))
        {
            return Some(ERROR_CONFLICTING_NAMESPACE_SELECTOR.to_string());
        }
    }

    None
}

/// System namespaces and the operator's own namespace never get injection
pub fn is_ignored_namespace(namespace: &Namespace, operator_namespace: &str) -> bool {
    let name = namespace.name_any();
    name == operator_namespace || name.starts_with("kube-") || name.starts_with("openshift")
}

/// An absent selector selects every namespace
pub fn selects_namespace(dynakube: &DynaKube, namespace: &Namespace) -> bool {
    let labels = namespace.metadata.labels.clone().unwrap_or_default();
    match &dynakube.spec.namespace_selector {
        Some(selector) => selector_matches(selector, &labels),
        None => true,
    }
}
