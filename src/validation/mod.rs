//! DynaKube validating webhook
//!
//! Validation is an ordered chain of pure functions over a pre-gathered
//! [`ValidationContext`]: the handler reads cluster state once (other
//! DynaKubes, namespaces, referenced secrets), then every rule is a plain
//! function from context to an optional message. Denying rules compose into
//! a numbered list; warning rules ride along on allow and deny alike.

pub mod activegate;
pub mod api_url;
pub mod namespace_selector;
pub mod oneagent;
pub mod proxy;
pub mod warnings;

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::Json;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, ListParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::{Client, ResourceExt};
use tracing::{error, info};

use crate::crd::DynaKube;
use crate::settings::ModuleSettings;
use crate::Result;

/// Generic banner appended whenever any warning mentions a preview feature
pub const BASE_PREVIEW_WARNING: &str =
    "PREVIEW features are NOT production ready and may break at any time! Use at your own risk.";

/// Everything a validator may look at; gathered once per admission call
pub struct ValidationContext<'a> {
    /// The DynaKube under review
    pub dynakube: &'a DynaKube,
    /// Every other DynaKube in the cluster
    pub other_dynakubes: &'a [DynaKube],
    /// Every namespace in the cluster
    pub namespaces: &'a [Namespace],
    /// The proxy secret referenced by `spec.proxy.valueFrom`, if any
    pub proxy_secret: Option<&'a Secret>,
    /// The ActiveGate TLS secret referenced by `spec.activeGate.tlsSecretName`, if any
    pub tls_secret: Option<&'a Secret>,
    /// Feature-module toggles
    pub modules: &'a ModuleSettings,
    /// The operator's own namespace (excluded from mapping checks)
    pub operator_namespace: &'a str,
}

/// A denying rule: non-empty result rejects the DynaKube
pub type ValidatorFn = fn(&ValidationContext) -> Option<String>;

/// A warning rule: non-empty result is surfaced but does not deny
pub type WarningFn = fn(&ValidationContext) -> Option<String>;

/// Denying rules, in declaration order; the numbered denial list follows
/// this order exactly.
pub const VALIDATORS: &[(&str, ValidatorFn)] = &[
    ("api-url-well-formed", api_url::no_api_url),
    ("api-url-suffix", api_url::invalid_api_url),
    (
        "no-conflicting-oneagent-mode",
        oneagent::conflicting_oneagent_mode,
    ),
    (
        "no-conflicting-active-gate-sections",
        activegate::conflicting_sections,
    ),
    (
        "active-gate-capabilities-known",
        activegate::invalid_capabilities,
    ),
    (
        "active-gate-capabilities-unique",
        activegate::duplicate_capabilities,
    ),
    (
        "no-namespace-selector-overlap",
        namespace_selector::conflicting_namespace_selector,
    ),
    (
        "no-node-selector-overlap",
        oneagent::conflicting_node_selector,
    ),
    ("csi-required-for-cloud-native", oneagent::missing_csi_driver),
    ("proxy-url-safe", proxy::invalid_proxy),
    ("active-gate-tls-secret-shape", activegate::invalid_tls_secret),
];

/// Warning rules, in declaration order
pub const WARNING_VALIDATORS: &[(&str, WarningFn)] = &[
    ("preview-feature", warnings::preview_capability),
    (
        "deprecated-feature-flag-format",
        warnings::deprecated_feature_flags,
    ),
    (
        "missing-active-gate-memory-limit",
        activegate::missing_memory_limit,
    ),
];

/// Outcome of running the full pipeline
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// Denying messages, in validator-declaration order
    pub errors: Vec<String>,
    /// Warnings, in declaration order, plus the preview banner when earned
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Whether the DynaKube passes
    pub fn is_allowed(&self) -> bool {
        self.errors.is_empty()
    }

    /// The numbered denial message
    pub fn denial_message(&self) -> String {
        self.errors
            .iter()
            .enumerate()
            .map(|(index, message)| format!("{}. {}", index + 1, message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run every validator and warning rule over the context
pub fn validate(ctx: &ValidationContext) -> ValidationResult {
    let mut result = ValidationResult::default();

    for (name, validator) in VALIDATORS {
        if let Some(message) = validator(ctx) {
            info!(rule = name, dynakube = %ctx.dynakube.name_any(), "dynakube rejected by rule");
            result.errors.push(message);
        }
    }

    for (name, warning) in WARNING_VALIDATORS {
        if let Some(message) = warning(ctx) {
            info!(rule = name, dynakube = %ctx.dynakube.name_any(), "dynakube warning");
            result.warnings.push(message);
        }
    }

    if result.warnings.iter().any(|w| w.contains("PREVIEW")) {
        result.warnings.push(BASE_PREVIEW_WARNING.to_string());
    }

    result
}

// =============================================================================
// Cluster state gathering
// =============================================================================

/// Read access the handler needs to assemble a [`ValidationContext`]
#[async_trait]
pub trait ValidationReader: Send + Sync {
    /// All DynaKubes in the cluster
    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>>;
    /// All namespaces in the cluster
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;
    /// One secret, `None` on NotFound
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// [`ValidationReader`] over a live cluster
pub struct ClusterReader {
    client: Client,
}

impl ClusterReader {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ValidationReader for ClusterReader {
    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>> {
        let api: Api<DynaKube> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Shared state of the validating webhook endpoint
pub struct ValidationWebhook {
    reader: Arc<dyn ValidationReader>,
    operator_namespace: String,
}

impl ValidationWebhook {
    /// Webhook over a live cluster
    pub fn new(client: Client, operator_namespace: impl Into<String>) -> Self {
        Self::with_reader(Arc::new(ClusterReader::new(client)), operator_namespace)
    }

    /// Webhook over an arbitrary reader (tests)
    pub fn with_reader(
        reader: Arc<dyn ValidationReader>,
        operator_namespace: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            operator_namespace: operator_namespace.into(),
        }
    }

    /// Validate one admission request
    pub async fn review(&self, request: &AdmissionRequest<DynaKube>) -> AdmissionResponse {
        let Some(dynakube) = &request.object else {
            return AdmissionResponse::from(request);
        };

        let gathered = match self.gather(dynakube).await {
            Ok(gathered) => gathered,
            Err(err) => {
                error!(error = %err, "could not gather cluster state for validation");
                return AdmissionResponse::from(request)
                    .deny(format!("validation failed to read cluster state: {err}"));
            }
        };

        let ctx = ValidationContext {
            dynakube,
            other_dynakubes: &gathered.other_dynakubes,
            namespaces: &gathered.namespaces,
            proxy_secret: gathered.proxy_secret.as_ref(),
            tls_secret: gathered.tls_secret.as_ref(),
            modules: &crate::settings::get().modules,
            operator_namespace: &self.operator_namespace,
        };

        let result = validate(&ctx);

        let mut response = if result.is_allowed() {
            AdmissionResponse::from(request)
        } else {
            AdmissionResponse::from(request).deny(result.denial_message())
        };

        if !result.warnings.is_empty() {
            response.warnings = Some(result.warnings);
        }

        response
    }

    async fn gather(&self, dynakube: &DynaKube) -> Result<GatheredState> {
        let namespace = dynakube.namespace().unwrap_or_default();

        let other_dynakubes = self
            .reader
            .list_dynakubes()
            .await?
            .into_iter()
            .filter(|other| other.name_any() != dynakube.name_any())
            .collect();

        let namespaces = self.reader.list_namespaces().await?;

        let proxy_secret = match dynakube
            .spec
            .proxy
            .as_ref()
            .and_then(|proxy| proxy.value_from.as_deref())
        {
            Some(secret_name) => self.reader.get_secret(&namespace, secret_name).await?,
            None => None,
        };

        let tls_secret = match dynakube
            .spec
            .active_gate
            .as_ref()
            .and_then(|ag| ag.tls_secret_name.as_deref())
        {
            Some(secret_name) => self.reader.get_secret(&namespace, secret_name).await?,
            None => None,
        };

        Ok(GatheredState {
            other_dynakubes,
            namespaces,
            proxy_secret,
            tls_secret,
        })
    }
}

struct GatheredState {
    other_dynakubes: Vec<DynaKube>,
    namespaces: Vec<Namespace>,
    proxy_secret: Option<Secret>,
    tls_secret: Option<Secret>,
}

/// Axum handler for `POST /validate`
pub async fn validate_handler(
    State(webhook): State<Arc<ValidationWebhook>>,
    Json(body): Json<AdmissionReview<DynaKube>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynaKube> = match body.try_into() {
        Ok(request) => request,
        Err(err) => {
            error!(error = %err, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };

    let response = webhook.review(&request).await;
    Json(response.into_review())
}
