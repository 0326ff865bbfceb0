//! ActiveGate rules: capability set, deprecated sections, TLS secret shape

use super::ValidationContext;
use crate::crd::Capability;

pub(crate) const ERROR_CONFLICTING_ACTIVE_GATE_SECTIONS: &str = "The DynaKube's specification tries to use the deprecated ActiveGate section(s) alongside the new ActiveGate section, which is not supported.";

pub(crate) const ERROR_INVALID_ACTIVE_GATE_CAPABILITY: &str = "The DynaKube's specification tries to use an invalid capability in ActiveGate section, invalid capability=";

pub(crate) const ERROR_DUPLICATE_ACTIVE_GATE_CAPABILITY: &str = "The DynaKube's specification tries to specify duplicate capabilities in the ActiveGate section, duplicate capability=";

pub(crate) const ERROR_INVALID_TLS_SECRET: &str = "The DynaKube's specification references an ActiveGate TLS secret that does not exist or is missing the 'server.crt' or 'server.key' keys.";

pub(crate) const WARNING_MISSING_MEMORY_LIMIT: &str =
    "ActiveGate specification is missing a memory limit. This can cause excess memory usage.";

/// Secret keys the ActiveGate TLS secret must carry
const TLS_SECRET_KEYS: [&str; 2] = ["server.crt", "server.key"];

/// The deprecated routing/kubernetes-monitoring sections may not be combined
/// with the modern capabilities list
pub fn conflicting_sections(ctx: &ValidationContext) -> Option<String> {
    if ctx.dynakube.active_gate_mode() && ctx.dynakube.deprecated_active_gate_mode() {
        return Some(ERROR_CONFLICTING_ACTIVE_GATE_SECTIONS.to_string());
    }

    None
}

/// Every requested capability must be a known display name
pub fn invalid_capabilities(ctx: &ValidationContext) -> Option<String> {
    let capabilities = &ctx.dynakube.spec.active_gate.as_ref()?.capabilities;

    for capability in capabilities {
        if Capability::parse(capability).is_none() {
            return Some(format!(
                "{ERROR_INVALID_ACTIVE_GATE_CAPABILITY}{capability}. Make sure you correctly specify the ActiveGate capabilities in your custom resource."
            ));
        }
    }

    None
}

/// Capabilities may be requested at most once
pub fn duplicate_capabilities(ctx: &ValidationContext) -> Option<String> {
    let capabilities = &ctx.dynakube.spec.active_gate.as_ref()?.capabilities;

    let mut seen = std::collections::BTreeSet::new();
    for capability in capabilities {
        if !seen.insert(capability) {
            return Some(format!(
                "{ERROR_DUPLICATE_ACTIVE_GATE_CAPABILITY}{capability}. Make sure you don't duplicate an Activegate capability in your custom resource."
            ));
        }
    }

    None
}

/// A referenced TLS secret must exist and carry the server certificate pair
pub fn invalid_tls_secret(ctx: &ValidationContext) -> Option<String> {
    ctx.dynakube
        .spec
        .active_gate
        .as_ref()?
        .tls_secret_name
        .as_ref()?;

    let Some(secret) = ctx.tls_secret else {
        return Some(ERROR_INVALID_TLS_SECRET.to_string());
    };

    let has_all_keys = TLS_SECRET_KEYS.iter().all(|key| {
        secret
            .data
            .as_ref()
            .is_some_and(|data| data.contains_key(*key))
    });

    if !has_all_keys {
        return Some(ERROR_INVALID_TLS_SECRET.to_string());
    }

    None
}

/// Warn when the ActiveGate container has no memory limit
pub fn missing_memory_limit(ctx: &ValidationContext) -> Option<String> {
    let active_gate = ctx.dynakube.spec.active_gate.as_ref()?;
    if active_gate.capabilities.is_empty() {
        return None;
    }

    let has_memory_limit = active_gate
        .resources
        .as_ref()
        .and_then(|resources| resources.limits.as_ref())
        .is_some_and(|limits| limits.contains_key("memory"));

    if !has_memory_limit {
        return Some(WARNING_MISSING_MEMORY_LIMIT.to_string());
    }

    None
}
