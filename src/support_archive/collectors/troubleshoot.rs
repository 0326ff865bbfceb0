//! In-cluster self-checks
//!
//! Answers the questions support asks first: does the operator namespace
//! exist, is any DynaKube deployed, and do the deployed DynaKubes carry the
//! fields nothing works without. Results go into `troubleshoot.txt`; the
//! checks themselves never abort the bundle.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Client, ResourceExt};

use crate::support_archive::archive::SupportArchive;
use crate::support_archive::Collector;
use crate::webhook::{ClusterCrReader, CrReader};
use crate::Result;

const REPORT_FILE: &str = "troubleshoot.txt";

/// Runs the self-checks and writes the report
pub struct TroubleshootCollector {
    reader: Arc<dyn CrReader>,
    namespace: String,
}

impl TroubleshootCollector {
    /// Collector over a live cluster
    pub fn new(client: Client, namespace: &str) -> Self {
        Self::with_reader(Arc::new(ClusterCrReader::new(client, namespace)), namespace)
    }

    /// Collector over an arbitrary reader (tests)
    pub fn with_reader(reader: Arc<dyn CrReader>, namespace: &str) -> Self {
        Self {
            reader,
            namespace: namespace.to_string(),
        }
    }

    async fn report(&self) -> String {
        let mut report = String::new();

        match self.reader.get_namespace(&self.namespace).await {
            Ok(Some(_)) => check_ok(&mut report, "namespace", &self.namespace),
            Ok(None) => check_failed(
                &mut report,
                "namespace",
                &format!("namespace '{}' does not exist", self.namespace),
            ),
            Err(err) => check_failed(&mut report, "namespace", &err.to_string()),
        }

        match self.reader.list_dynakubes().await {
            Ok(dynakubes) if dynakubes.is_empty() => {
                check_failed(&mut report, "dynakube", "no DynaKube deployed")
            }
            Ok(dynakubes) => {
                for dynakube in dynakubes {
                    let name = dynakube.name_any();
                    if dynakube.api_url().is_empty() {
                        check_failed(
                            &mut report,
                            "dynakube",
                            &format!("'{name}' has no API URL"),
                        );
                    } else if dynakube.spec.tokens.is_none() {
                        check_failed(
                            &mut report,
                            "dynakube",
                            &format!("'{name}' references no token secret"),
                        );
                    } else {
                        check_ok(&mut report, "dynakube", &name);
                    }
                }
            }
            Err(err) => check_failed(&mut report, "dynakube", &err.to_string()),
        }

        report
    }
}

fn check_ok(report: &mut String, check: &str, subject: &str) {
    let _ = writeln!(report, "[{check}] OK: {subject}");
}

fn check_failed(report: &mut String, check: &str, reason: &str) {
    let _ = writeln!(report, "[{check}] FAILED: {reason}");
}

#[async_trait]
impl Collector for TroubleshootCollector {
    fn name(&self) -> &'static str {
        "troubleshoot"
    }

    async fn collect(&self, archive: &SupportArchive) -> Result<()> {
        let report = self.report().await;
        archive.add_file(REPORT_FILE, report.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DynaKube, DynaKubeSpec};
    use crate::webhook::testing::FakeCrReader;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_namespace_and_dynakube_are_both_reported() {
        let reader = Arc::new(FakeCrReader::with_dynakubes(vec![]));
        let report = TroubleshootCollector::with_reader(reader, "dynatrace")
            .report()
            .await;

        assert!(report.contains("[namespace] FAILED"));
        assert!(report.contains("no DynaKube deployed"));
    }

    #[tokio::test]
    async fn incomplete_dynakube_is_flagged_with_its_name() {
        let reader = Arc::new(FakeCrReader::with_dynakubes(vec![DynaKube::new(
            "empty",
            DynaKubeSpec::default(),
        )]));
        reader.add_namespace(namespace("dynatrace"));

        let report = TroubleshootCollector::with_reader(reader, "dynatrace")
            .report()
            .await;

        assert!(report.contains("[namespace] OK"));
        assert!(report.contains("'empty' has no API URL"));
    }
}
