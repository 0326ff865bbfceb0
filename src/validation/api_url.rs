//! API URL rules

use super::ValidationContext;

/// Placeholder shipped in the example custom resource
pub const EXAMPLE_API_URL: &str = "https://ENVIRONMENTID.live.dynatrace.com/api";

pub(crate) const ERROR_NO_API_URL: &str = "The DynaKube's specification is missing the API URL or still has the example value set. Make sure you correctly specify the URL in your custom resource.";

pub(crate) const ERROR_INVALID_API_URL: &str = "The DynaKube's specification has an invalid API URL. The API URL has to end with '/api'.";

/// Deny empty API URLs and the example placeholder
pub fn no_api_url(ctx: &ValidationContext) -> Option<String> {
    let api_url = ctx.dynakube.api_url();

    if api_url.is_empty() || api_url == EXAMPLE_API_URL {
        return Some(ERROR_NO_API_URL.to_string());
    }

    None
}

/// Deny API URLs not ending with `/api`
pub fn invalid_api_url(ctx: &ValidationContext) -> Option<String> {
    let api_url = ctx.dynakube.api_url();

    if api_url.is_empty() || api_url == EXAMPLE_API_URL {
        // already denied by no_api_url; avoid double-reporting
        return None;
    }

    if !api_url.ends_with("/api") {
        return Some(ERROR_INVALID_API_URL.to_string());
    }

    None
}
