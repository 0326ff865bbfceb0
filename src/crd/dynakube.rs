//! DynaKube custom resource
//!
//! The DynaKube CR is the single configuration surface for a Dynatrace
//! installation in a cluster: which OneAgent mode runs on the nodes, which
//! namespaces receive code-module injection, and which ActiveGate
//! capabilities are deployed. The core treats it as read-only input except
//! for status and annotations.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DEPRECATED_FEATURE_FLAG_PREFIX, FEATURE_FLAG_PREFIX};

/// Feature flag allowing multiple OneAgents on the same node
pub const FF_MULTIPLE_ONEAGENTS_ON_NODE: &str = "multiple-oneagents-on-node";

/// The DynaKube spec
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "dynatrace.com",
    version = "v1beta1",
    kind = "DynaKube",
    namespaced,
    status = "DynaKubeStatus",
    shortname = "dk"
)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeSpec {
    /// Dynatrace environment API URL; must end with `/api`
    #[serde(default)]
    pub api_url: String,

    /// Name of the secret holding the API and PaaS tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<String>,

    /// Optional proxy for all outbound connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<DynaKubeProxy>,

    /// Names of image pull secrets used by agent containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_pull_secret: Vec<String>,

    /// Selector binding workload namespaces to this DynaKube.
    /// At most one DynaKube may select a given namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// OneAgent deployment modes (mutually exclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_agent: Option<OneAgentSpec>,

    /// ActiveGate configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_gate: Option<ActiveGateSpec>,

    /// Deprecated standalone routing section; superseded by the `routing`
    /// ActiveGate capability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<DeprecatedSectionSpec>,

    /// Deprecated standalone kubernetes-monitoring section; superseded by
    /// the `kubernetes-monitoring` ActiveGate capability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_monitoring: Option<DeprecatedSectionSpec>,
}

/// Proxy configuration: a raw value or a secret reference, never both
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeProxy {
    /// Proxy URL in plain text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Name of a secret whose `proxy` key holds the URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

/// OneAgent deployment modes; exactly one may be configured
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    /// Full host and application monitoring via DaemonSet-installed agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classic_full_stack: Option<HostInjectSpec>,

    /// Host-only monitoring via DaemonSet-installed agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_monitoring: Option<HostInjectSpec>,

    /// Application-only monitoring via webhook injection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_monitoring: Option<AppInjectSpec>,

    /// Host monitoring plus webhook injection backed by the CSI driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_native_full_stack: Option<CloudNativeFullStackSpec>,
}

/// Host-agent settings shared by the DaemonSet-based modes
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostInjectSpec {
    /// Restricts host agents to matching nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Custom OneAgent image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Application-injection settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppInjectSpec {
    /// Custom code-modules image delivered by the job installer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_modules_image: Option<String>,

    /// Whether injection goes through the CSI driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_csi_driver: Option<bool>,
}

/// Cloud-native full stack combines host agents with app injection
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudNativeFullStackSpec {
    /// Host-agent settings
    #[serde(default, flatten)]
    pub host_inject: HostInjectSpec,

    /// Application-injection settings
    #[serde(default, flatten)]
    pub app_inject: AppInjectSpec,
}

/// ActiveGate configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGateSpec {
    /// Requested capabilities, by display name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    /// Resource requests/limits for the ActiveGate container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Name of a `kubernetes.io/tls` secret securing ActiveGate endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

/// Deprecated standalone ActiveGate section (routing / kubernetes monitoring)
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeprecatedSectionSpec {
    /// Whether the deprecated section is enabled
    #[serde(default)]
    pub enabled: bool,
}

/// Observed DynaKube state
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeStatus {
    /// Deployment phase summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Timestamp of the last status update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_timestamp: Option<String>,
}

// =============================================================================
// ActiveGate capabilities
// =============================================================================

/// Closed set of ActiveGate capabilities.
///
/// The CR carries display names (strings); parsing them into this enum makes
/// an unknown capability impossible to propagate past validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Network routing through the ActiveGate
    Routing,
    /// Kubernetes API monitoring
    Kubemon,
    /// Metrics ingest endpoint
    MetricsIngest,
    /// Dynatrace API endpoint
    DynatraceApi,
    /// StatsD ingest endpoint
    StatsdIngest,
}

impl Capability {
    /// Every capability, in display order
    pub const ALL: [Capability; 5] = [
        Capability::Routing,
        Capability::Kubemon,
        Capability::MetricsIngest,
        Capability::DynatraceApi,
        Capability::StatsdIngest,
    ];

    /// Frozen display names; these appear verbatim in CRs
    pub fn display_name(&self) -> &'static str {
        match self {
            Capability::Routing => "routing",
            Capability::Kubemon => "kubemon",
            Capability::MetricsIngest => "metrics-ingest",
            Capability::DynatraceApi => "dynatrace-api",
            Capability::StatsdIngest => "statsd-ingest",
        }
    }

    /// Parse a display name; `None` for unknown capabilities
    pub fn parse(name: &str) -> Option<Capability> {
        Capability::ALL
            .into_iter()
            .find(|capability| capability.display_name() == name)
    }
}

// =============================================================================
// Accessors
// =============================================================================

impl DynaKube {
    /// The configured environment API URL
    pub fn api_url(&self) -> &str {
        &self.spec.api_url
    }

    /// Whether application monitoring mode is configured
    pub fn is_application_monitoring(&self) -> bool {
        self.spec
            .one_agent
            .as_ref()
            .is_some_and(|oa| oa.application_monitoring.is_some())
    }

    /// Whether cloud-native full stack mode is configured
    pub fn is_cloud_native_fullstack(&self) -> bool {
        self.spec
            .one_agent
            .as_ref()
            .is_some_and(|oa| oa.cloud_native_full_stack.is_some())
    }

    /// Whether classic full stack mode is configured
    pub fn is_classic_fullstack(&self) -> bool {
        self.spec
            .one_agent
            .as_ref()
            .is_some_and(|oa| oa.classic_full_stack.is_some())
    }

    /// Whether host monitoring mode is configured
    pub fn is_host_monitoring(&self) -> bool {
        self.spec
            .one_agent
            .as_ref()
            .is_some_and(|oa| oa.host_monitoring.is_some())
    }

    /// Whether any mode installs host agents via DaemonSet
    pub fn needs_oneagent_daemonset(&self) -> bool {
        self.is_classic_fullstack() || self.is_host_monitoring() || self.is_cloud_native_fullstack()
    }

    /// Whether any mode injects code modules into application pods
    pub fn needs_app_injection(&self) -> bool {
        self.is_application_monitoring() || self.is_cloud_native_fullstack()
    }

    /// Whether injection for this DynaKube requires the CSI driver
    pub fn needs_csi_driver(&self) -> bool {
        if self.is_cloud_native_fullstack() {
            return true;
        }
        self.spec
            .one_agent
            .as_ref()
            .and_then(|oa| oa.application_monitoring.as_ref())
            .and_then(|app| app.use_csi_driver)
            .unwrap_or(false)
    }

    /// The code-modules image delivered to injected pods, if configured
    pub fn code_modules_image(&self) -> Option<&str> {
        let one_agent = self.spec.one_agent.as_ref()?;

        if let Some(cloud_native) = &one_agent.cloud_native_full_stack {
            return cloud_native.app_inject.code_modules_image.as_deref();
        }

        one_agent
            .application_monitoring
            .as_ref()?
            .code_modules_image
            .as_deref()
    }

    /// Node selector of the host-agent spec, whichever mode carries one
    pub fn node_selector(&self) -> Option<&BTreeMap<String, String>> {
        let one_agent = self.spec.one_agent.as_ref()?;

        if let Some(classic) = &one_agent.classic_full_stack {
            return classic.node_selector.as_ref();
        }
        if let Some(host) = &one_agent.host_monitoring {
            return host.node_selector.as_ref();
        }
        if let Some(cloud_native) = &one_agent.cloud_native_full_stack {
            return cloud_native.host_inject.node_selector.as_ref();
        }

        None
    }

    /// Whether the modern ActiveGate section is in use
    pub fn active_gate_mode(&self) -> bool {
        self.spec
            .active_gate
            .as_ref()
            .is_some_and(|ag| !ag.capabilities.is_empty())
    }

    /// Whether a deprecated standalone ActiveGate section is enabled
    pub fn deprecated_active_gate_mode(&self) -> bool {
        self.spec.routing.as_ref().is_some_and(|r| r.enabled)
            || self
                .spec
                .kubernetes_monitoring
                .as_ref()
                .is_some_and(|km| km.enabled)
    }

    /// Read a feature flag from the annotations.
    ///
    /// The current `feature.dynatrace.com/` prefix wins over the deprecated
    /// `alpha.operator.dynatrace.com/feature-` prefix.
    pub fn feature_flag(&self, name: &str) -> Option<&str> {
        let annotations = self.metadata.annotations.as_ref()?;

        annotations
            .get(&format!("{FEATURE_FLAG_PREFIX}{name}"))
            .or_else(|| annotations.get(&format!("{DEPRECATED_FEATURE_FLAG_PREFIX}{name}")))
            .map(String::as_str)
    }

    /// Whether this DynaKube opted into multiple agents per node
    pub fn allows_multiple_agents_per_node(&self) -> bool {
        self.feature_flag(FF_MULTIPLE_ONEAGENTS_ON_NODE) == Some("true")
    }

    /// Whether any annotation still uses the deprecated feature-flag prefix
    pub fn has_deprecated_feature_flags(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|annotations| {
                annotations
                    .keys()
                    .any(|key| key.starts_with(DEPRECATED_FEATURE_FLAG_PREFIX))
            })
    }
}
