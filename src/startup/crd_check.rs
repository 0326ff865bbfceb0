//! CRD version check
//!
//! Helm stamps the installed CRDs with the chart version. At startup the
//! process compares that stamp against its own `APP_VERSION`: a mismatch is
//! expected during rolling upgrades and only logged, but a CRD without the
//! stamp (or a process without a version) points at a broken installation
//! and is an error.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::{Error, Result, APP_VERSION_ENV, APP_VERSION_LABEL, DYNAKUBE_CRD_NAME, EDGECONNECT_CRD_NAME};

/// Compare one CRD's version label against the running process version
pub fn verify_crd_version(crd: &CustomResourceDefinition, app_version: &str) -> Result<()> {
    let name = crd.name_any();
    let label = crd
        .labels()
        .get(APP_VERSION_LABEL)
        .ok_or_else(|| {
            Error::config(format!(
                "CRD '{name}' carries no '{APP_VERSION_LABEL}' label"
            ))
        })?;

    if label != app_version {
        warn!(
            crd = %name,
            installed = %label,
            running = %app_version,
            "CRD version differs from the operator version"
        );
    } else {
        info!(crd = %name, version = %label, "CRD version matches");
    }

    Ok(())
}

/// Check both operator CRDs against `APP_VERSION`
pub async fn check_crd_versions(client: Client) -> Result<()> {
    let app_version = std::env::var(APP_VERSION_ENV)
        .map_err(|_| Error::config(format!("{APP_VERSION_ENV} is not set")))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client);
    for crd_name in [DYNAKUBE_CRD_NAME, EDGECONNECT_CRD_NAME] {
        let crd = crds.get(crd_name).await?;
        verify_crd_version(&crd, &app_version)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn crd(labels: Option<BTreeMap<String, String>>) -> CustomResourceDefinition {
        CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(DYNAKUBE_CRD_NAME.into()),
                labels,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn matching_version_passes() {
        let crd = crd(Some(BTreeMap::from([(
            APP_VERSION_LABEL.to_string(),
            "1.3.0".to_string(),
        )])));
        assert!(verify_crd_version(&crd, "1.3.0").is_ok());
    }

    #[test]
    fn version_mismatch_is_tolerated() {
        let crd = crd(Some(BTreeMap::from([(
            APP_VERSION_LABEL.to_string(),
            "1.2.0".to_string(),
        )])));
        // logged, not fatal: upgrades roll the operator and the CRDs separately
        assert!(verify_crd_version(&crd, "1.3.0").is_ok());
    }

    #[test]
    fn missing_label_is_an_error() {
        let err = verify_crd_version(&crd(None), "1.3.0").unwrap_err();
        assert!(err.to_string().contains(APP_VERSION_LABEL));
    }
}
