//! EdgeConnect custom resource
//!
//! The core does not reconcile EdgeConnect; it only needs the type for the
//! support archive (manifest collection) and the CRD version check.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The EdgeConnect spec
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "dynatrace.com",
    version = "v1alpha1",
    kind = "EdgeConnect",
    namespaced,
    shortname = "ec"
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeConnectSpec {
    /// Dynatrace API server the EdgeConnect pairs with
    #[serde(default)]
    pub api_server: String,

    /// Host patterns routed through this EdgeConnect
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_patterns: Vec<String>,

    /// Number of EdgeConnect replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}
