//! Dynatrace Operator core - Kubernetes operator for the Dynatrace agent suite
//!
//! The operator reconciles the `DynaKube` custom resource into the set of
//! Kubernetes objects required to inject and operate Dynatrace agents:
//! privileged host agents, application-level code-module injection (mutating
//! admission webhook + CSI-managed volumes), ActiveGate gateway pods, and
//! supporting config/secrets.
//!
//! # Modules
//!
//! - [`crd`] - DynaKube / EdgeConnect custom resource definitions
//! - [`validation`] - validating webhook pipeline for DynaKube resources
//! - [`webhook`] - mutating webhooks for Pods and Namespaces
//! - [`certificates`] - TLS certificate rotation for the webhook server
//! - [`installer`] - per-node code-module download Jobs
//! - [`kubeobjects`] - generic typed builders and CRUD for Kubernetes objects
//! - [`support_archive`] - diagnostics bundle (streaming ZIP) for bug reports
//! - [`settings`] - process-wide configuration from environment JSON
//! - [`shutdown`] - graceful-shutdown coordination for the webhook server
//! - [`startup`] - process assembly: probes, servers, startup checks
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod certificates;
pub mod crd;
pub mod error;
pub mod installer;
pub mod kubeobjects;
pub mod logging;
pub mod settings;
pub mod shutdown;
pub mod startup;
pub mod support_archive;
pub mod validation;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Stable identifiers
// =============================================================================
// These labels and annotations are part of the operator's public contract:
// selectors, Helm charts, and the injected workloads all depend on the exact
// strings. Never change them without a migration path.

/// Standard Kubernetes app-name label, set on every object the operator owns
pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";

/// Standard Kubernetes managed-by label
pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Standard Kubernetes version label; checked against the process version at startup
pub const APP_VERSION_LABEL: &str = "app.kubernetes.io/version";

/// Component label value used on code-module download Jobs
pub const APP_COMPONENT_CODE_MODULE: &str = "code-module";

/// Injection marker set on namespaces by the namespace webhook, binding the
/// namespace to a specific DynaKube
pub const INJECTION_INSTANCE_LABEL: &str = "dynakube.internal.dynatrace.com/instance";

/// Annotation set to `"true"` on pods once the pod webhook injected them
pub const INJECTED_ANNOTATION: &str = "dynakube.dynatrace.com/injected";

/// Free-text annotation explaining why injection was skipped
pub const REASON_ANNOTATION: &str = "dynakube.dynatrace.com/reason";

/// Annotation opting a pod out of injection when set to `"false"`
pub const INJECT_ANNOTATION: &str = "dynatrace.com/inject";

/// Annotation selecting the injection failure policy: `"fail"` or `"silent"` (default)
pub const FAILURE_POLICY_ANNOTATION: &str = "oneagent.dynatrace.com/failure-policy";

/// Annotation prefix excluding a single container from injection; the suffix
/// is the container name and the value must be `"false"`
pub const CONTAINER_INJECT_PREFIX: &str = "container.inject.dynatrace.com/";

/// Content-hash annotation written by the object query kit for O(1) change detection
pub const TEMPLATE_HASH_ANNOTATION: &str = "internal.operator.dynatrace.com/template-hash";

/// Transient namespace annotation used to break the webhook/reconciler update loop
pub const UPDATED_VIA_DYNAKUBE_ANNOTATION: &str = "updated-via-dynakube";

/// Annotation prefix of the current feature-flag format
pub const FEATURE_FLAG_PREFIX: &str = "feature.dynatrace.com/";

/// Annotation prefix of the deprecated feature-flag format; raises a warning
pub const DEPRECATED_FEATURE_FLAG_PREFIX: &str = "alpha.operator.dynatrace.com/feature-";

/// Name of the operator's webhook configurations and webhook deployment
pub const WEBHOOK_NAME: &str = "dynatrace-webhook";

/// App name the operator stamps on its own components
pub const OPERATOR_NAME: &str = "dynatrace-operator";

/// CRD name of the DynaKube custom resource
pub const DYNAKUBE_CRD_NAME: &str = "dynakubes.dynatrace.com";

/// CRD name of the EdgeConnect custom resource
pub const EDGECONNECT_CRD_NAME: &str = "edgeconnects.dynatrace.com";

/// Environment variable carrying the process version (stamped at build time)
pub const APP_VERSION_ENV: &str = "APP_VERSION";

/// Environment variable naming the node the CSI driver pod runs on
pub const NODE_NAME_ENV: &str = "KUBE_NODE_NAME";

/// Environment variable with the root of the CSI driver's node-local data directory
pub const CSI_DATA_DIR_ENV: &str = "CSI_DATA_DIR";

/// Environment variable with the operator pod's namespace
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Environment variable with the operator pod's name
pub const POD_NAME_ENV: &str = "POD_NAME";
