//! Process-wide settings loaded from environment JSON
//!
//! Helm computes per-installation configuration (security contexts, resource
//! requests, tolerations) and hands it to the operator through environment
//! variables holding JSON documents. The operator needs a single consistent
//! view of them, so the parsed snapshot is initialized exactly once on first
//! access and never mutated afterwards. Environment changes after the first
//! read are invisible by design.
//!
//! Malformed or absent JSON is never fatal: the documented fallback is used
//! and a log record is emitted. Tests exercise the pure parsers
//! ([`JobSettings::from_json`], [`ModuleSettings::from_json`]) directly since
//! the once-init cell cannot be reset.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use k8s_openapi::api::core::v1::{ResourceRequirements, SecurityContext, Toleration};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable holding the serialized [`JobSettings`]
pub const JOB_SETTINGS_ENV: &str = "job.json";

/// Environment variable holding the serialized [`ModuleSettings`]
pub const MODULE_SETTINGS_ENV: &str = "modules.json";

/// Pod-level configuration inherited by code-module download Jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    /// Security context applied to the download container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    /// Resource requests/limits applied to the download container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Tolerations applied to the Job pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Extra annotations merged into the Job pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Extra labels merged into the Job pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Feature-module toggles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleSettings {
    /// Whether the CSI driver integration is deployed
    pub csi_driver: bool,
    /// Whether ActiveGate reconciliation is active
    pub activegate: bool,
    /// Whether OneAgent reconciliation is active
    pub oneagent: bool,
    /// Whether supportability tooling (support archive, troubleshoot) is active
    pub supportability: bool,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            csi_driver: true,
            activegate: true,
            oneagent: true,
            supportability: true,
        }
    }
}

impl JobSettings {
    /// Parse settings from a JSON document, falling back to defaults.
    ///
    /// - empty input -> fallback
    /// - non-JSON input -> fallback plus a warning
    /// - valid JSON -> parsed struct
    pub fn from_json(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }

        match serde_json::from_str(raw) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(env = JOB_SETTINGS_ENV, error = %err, "malformed job settings, using fallback");
                Self::default()
            }
        }
    }
}

impl ModuleSettings {
    /// Parse module toggles from a JSON document, falling back to all-enabled.
    pub fn from_json(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }

        match serde_json::from_str(raw) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(env = MODULE_SETTINGS_ENV, error = %err, "malformed module settings, using fallback");
                Self::default()
            }
        }
    }
}

/// The immutable process-wide settings snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    /// Job pod configuration
    pub job: JobSettings,
    /// Feature-module toggles
    pub modules: ModuleSettings,
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Return the process-wide settings, reading the environment on first call only
pub fn get() -> &'static Settings {
    SETTINGS.get_or_init(|| Settings {
        job: JobSettings::from_json(&std::env::var(JOB_SETTINGS_ENV).unwrap_or_default()),
        modules: ModuleSettings::from_json(&std::env::var(MODULE_SETTINGS_ENV).unwrap_or_default()),
    })
}
