//! Non-denying advisories: preview capabilities and deprecated flag prefixes

use super::ValidationContext;
use crate::crd::Capability;

/// Capabilities still in preview
const PREVIEW_CAPABILITIES: &[Capability] = &[Capability::StatsdIngest];

pub(crate) const WARNING_DEPRECATED_FEATURE_FLAGS: &str = "feature flag annotations with the 'alpha.operator.dynatrace.com/feature-' prefix are deprecated and will be ignored in a future release. Use the 'feature.dynatrace.com/' prefix instead.";

/// Warn for every preview capability in use; the caller appends the generic
/// preview banner when any warning mentions PREVIEW
pub fn preview_capability(ctx: &ValidationContext) -> Option<String> {
    let capabilities = &ctx.dynakube.spec.active_gate.as_ref()?.capabilities;

    for preview in PREVIEW_CAPABILITIES {
        if capabilities.iter().any(|c| c == preview.display_name()) {
            return Some(format!(
                "{} is a PREVIEW ActiveGate capability.",
                preview.display_name()
            ));
        }
    }

    None
}

/// Warn when any annotation still uses the deprecated feature-flag prefix
pub fn deprecated_feature_flags(ctx: &ValidationContext) -> Option<String> {
    if ctx.dynakube.has_deprecated_feature_flags() {
        return Some(WARNING_DEPRECATED_FEATURE_FLAGS.to_string());
    }

    None
}
