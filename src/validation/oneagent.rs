//! OneAgent rules: mode exclusivity, node-selector overlap, CSI requirement

use std::collections::BTreeMap;

use super::ValidationContext;
use crate::crd::DynaKube;
use kube::ResourceExt;

pub(crate) const ERROR_CONFLICTING_ONEAGENT_MODE: &str = "The DynaKube's specification tries to use multiple oneagent modes at the same time, which is not supported.";

pub(crate) const ERROR_NODE_SELECTOR_CONFLICT: &str = "The DynaKube's specification tries to specify a nodeSelector conflicts with an another Dynakube's nodeSelector, which is not supported. The conflicting Dynakube: ";

pub(crate) const ERROR_CSI_REQUIRED: &str = "The DynaKube's specification enables a OneAgent mode which requires the CSI driver, but the CSI driver module is disabled.";

/// At most one OneAgent mode may be configured
pub fn conflicting_oneagent_mode(ctx: &ValidationContext) -> Option<String> {
    let dk = ctx.dynakube;

    let configured_modes = [
        dk.is_application_monitoring(),
        dk.is_cloud_native_fullstack(),
        dk.is_classic_fullstack(),
        dk.is_host_monitoring(),
    ]
    .iter()
    .filter(|enabled| **enabled)
    .count();

    if configured_modes > 1 {
        return Some(ERROR_CONFLICTING_ONEAGENT_MODE.to_string());
    }

    None
}

/// Host-agent node selectors of two DynaKubes may not overlap unless the
/// multiple-agents-per-node feature flag is set
pub fn conflicting_node_selector(ctx: &ValidationContext) -> Option<String> {
    let dk = ctx.dynakube;

    if !dk.needs_oneagent_daemonset() || dk.allows_multiple_agents_per_node() {
        return None;
    }

    let Some(node_selector) = dk.node_selector() else {
        return None;
    };

    let mut conflicting: Vec<String> = ctx
        .other_dynakubes
        .iter()
        .filter(|other| other.needs_oneagent_daemonset())
        .filter(|other| !other.allows_multiple_agents_per_node())
        .filter(|other| {
            other
                .node_selector()
                .is_some_and(|other_selector| selectors_overlap(node_selector, other_selector))
        })
        .map(|other| other.name_any())
        .collect();

    if conflicting.is_empty() {
        return None;
    }

    conflicting.sort();

    Some(format!(
        "{ERROR_NODE_SELECTOR_CONFLICT}{}",
        conflicting.join(", ")
    ))
}

/// Cloud-native full stack (and CSI-opted application monitoring) need the
/// CSI driver module
pub fn missing_csi_driver(ctx: &ValidationContext) -> Option<String> {
    if ctx.dynakube.needs_csi_driver() && !ctx.modules.csi_driver {
        return Some(ERROR_CSI_REQUIRED.to_string());
    }

    None
}

/// Two label sets overlap when either, read as a selector, matches the other
fn selectors_overlap(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> bool {
    is_subset(a, b) || is_subset(b, a)
}

fn is_subset(subset: &BTreeMap<String, String>, superset: &BTreeMap<String, String>) -> bool {
    subset
        .iter()
        .all(|(key, value)| superset.get(key) == Some(value))
}

/// Whether another DynaKube's host agents would land on the same nodes
pub fn has_node_conflict(dk: &DynaKube, other: &DynaKube) -> bool {
    match (dk.node_selector(), other.node_selector()) {
        (Some(a), Some(b)) => selectors_overlap(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{valid_dynakube, validate_standalone, validate_with};
    use super::*;
    use crate::crd::dynakube::{
        CloudNativeFullStackSpec, HostInjectSpec, OneAgentSpec, FF_MULTIPLE_ONEAGENTS_ON_NODE,
    };
    use crate::FEATURE_FLAG_PREFIX;

    fn host_monitoring_dk(name: &str, selector: &[(&str, &str)]) -> DynaKube {
        let mut dk = valid_dynakube(name);
        dk.spec.one_agent = Some(OneAgentSpec {
            host_monitoring: Some(HostInjectSpec {
                node_selector: Some(
                    selector
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                image: None,
            }),
            ..Default::default()
        });
        dk
    }

    #[test]
    fn single_mode_is_fine_two_modes_are_not() {
        let mut dk = valid_dynakube("dk");
        dk.spec.one_agent = Some(OneAgentSpec {
            host_monitoring: Some(HostInjectSpec::default()),
            ..Default::default()
        });
        assert!(validate_standalone(&dk).is_allowed());

        dk.spec.one_agent = Some(OneAgentSpec {
            host_monitoring: Some(HostInjectSpec::default()),
            cloud_native_full_stack: Some(CloudNativeFullStackSpec::default()),
            ..Default::default()
        });
        let result = validate_standalone(&dk);
        assert!(!result.is_allowed());
        assert!(result.errors[0].contains("multiple oneagent modes"));
    }

    #[test]
    fn overlapping_node_selectors_name_the_conflicting_dynakube() {
        let dk = host_monitoring_dk("first", &[("pool", "monitored")]);
        let other = host_monitoring_dk("second", &[("pool", "monitored"), ("zone", "a")]);

        let result = validate_with(&dk, &[other], &[]);
        assert!(!result.is_allowed());
        assert!(result.errors[0].contains("second"));
    }

    #[test]
    fn disjoint_node_selectors_do_not_conflict() {
        let dk = host_monitoring_dk("first", &[("pool", "a")]);
        let other = host_monitoring_dk("second", &[("pool", "b")]);

        assert!(validate_with(&dk, &[other], &[]).is_allowed());
    }

    #[test]
    fn feature_flag_overrides_node_selector_conflict() {
        let mut dk = host_monitoring_dk("first", &[("pool", "monitored")]);
        dk.metadata.annotations = Some(std::collections::BTreeMap::from([(
            format!("{FEATURE_FLAG_PREFIX}{FF_MULTIPLE_ONEAGENTS_ON_NODE}"),
            "true".to_string(),
        )]));
        let other = host_monitoring_dk("second", &[("pool", "monitored")]);

        assert!(validate_with(&dk, &[other], &[]).is_allowed());
    }

    #[test]
    fn missing_node_selector_never_conflicts() {
        let mut dk = valid_dynakube("first");
        dk.spec.one_agent = Some(OneAgentSpec {
            host_monitoring: Some(HostInjectSpec::default()),
            ..Default::default()
        });
        let other = host_monitoring_dk("second", &[("pool", "monitored")]);

        assert!(validate_with(&dk, &[other], &[]).is_allowed());
    }
}
