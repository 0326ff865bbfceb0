//! Operator pod logs
//!
//! Fetches current and previous logs of every container of every operator
//! pod. Errors are scoped as narrowly as possible: one unreadable container
//! (a fresh pod has no previous instance, for example) never costs the logs
//! of its siblings.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use crate::support_archive::archive::SupportArchive;
use crate::support_archive::Collector;
use crate::{Result, APP_MANAGED_BY_LABEL, APP_NAME_LABEL, OPERATOR_NAME};

/// Source of pods and their logs; the cluster in production, a fake in tests
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Pods matching a label selector
    async fn pods(&self, label_selector: &str) -> Result<Vec<Pod>>;

    /// One container's log, optionally of the previous instance
    async fn logs(&self, pod: &str, container: &str, previous: bool) -> Result<String>;
}

struct ClusterLogSource {
    api: Api<Pod>,
}

#[async_trait]
impl LogSource for ClusterLogSource {
    async fn pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api.list(&params).await?.items)
    }

    async fn logs(&self, pod: &str, container: &str, previous: bool) -> Result<String> {
        let params = LogParams {
            container: Some(container.to_string()),
            previous,
            ..Default::default()
        };
        Ok(self.api.logs(pod, &params).await?)
    }
}

/// Writes `logs/<pod>/<container>[_previous].log` for the operator's pods
pub struct LogCollector {
    source: Box<dyn LogSource>,
    managed_logs: bool,
}

impl LogCollector {
    /// Collector over a live cluster
    pub fn new(client: Client, namespace: &str, managed_logs: bool) -> Self {
        Self::with_source(
            Box::new(ClusterLogSource {
                api: Api::namespaced(client, namespace),
            }),
            managed_logs,
        )
    }

    /// Collector over an arbitrary source (tests)
    pub fn with_source(source: Box<dyn LogSource>, managed_logs: bool) -> Self {
        Self {
            source,
            managed_logs,
        }
    }

    async fn collect_pod(&self, archive: &SupportArchive, pod: &Pod) -> Result<()> {
        let pod_name = pod.name_any();
        let containers = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();

        for container in containers {
            match self.source.logs(&pod_name, &container.name, false).await {
                Ok(log) => archive.add_file(
                    &format!("logs/{pod_name}/{}.log", container.name),
                    log.as_bytes(),
                )?,
                Err(err) => {
                    warn!(pod = %pod_name, container = %container.name, error = %err, "log fetch failed")
                }
            }

            // most containers have no previous instance; not worth a warning
            match self.source.logs(&pod_name, &container.name, true).await {
                Ok(log) => archive.add_file(
                    &format!("logs/{pod_name}/{}_previous.log", container.name),
                    log.as_bytes(),
                )?,
                Err(err) => {
                    debug!(pod = %pod_name, container = %container.name, error = %err, "no previous log")
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Collector for LogCollector {
    fn name(&self) -> &'static str {
        "logs"
    }

    async fn collect(&self, archive: &SupportArchive) -> Result<()> {
        let mut selectors = vec![format!("{APP_NAME_LABEL}={OPERATOR_NAME}")];
        if self.managed_logs {
            selectors.push(format!("{APP_MANAGED_BY_LABEL}={OPERATOR_NAME}"));
        }

        for selector in selectors {
            let pods = match self.source.pods(&selector).await {
                Ok(pods) => pods,
                Err(err) => {
                    warn!(%selector, error = %err, "pod list failed");
                    continue;
                }
            };

            for pod in pods {
                if let Err(err) = self.collect_pod(archive, &pod).await {
                    warn!(pod = %pod.name_any(), error = %err, "pod log collection failed");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::io::Cursor;

    fn pod(name: &str, containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|c| Container {
                        name: c.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    struct FakeSource {
        pods: Vec<Pod>,
        broken_container: Option<String>,
    }

    #[async_trait]
    impl LogSource for FakeSource {
        async fn pods(&self, _: &str) -> Result<Vec<Pod>> {
            Ok(self.pods.clone())
        }

        async fn logs(&self, pod: &str, container: &str, previous: bool) -> Result<String> {
            if self.broken_container.as_deref() == Some(container) {
                return Err(Error::support_archive("container log unavailable"));
            }
            if previous {
                return Err(Error::support_archive("no previous instance"));
            }
            Ok(format!("log of {pod}/{container}"))
        }
    }

    fn file_names(archive: SupportArchive) -> Vec<String> {
        let mut sink = Vec::new();
        archive.close_into(&mut sink).unwrap();
        let zip = zip::ZipArchive::new(Cursor::new(sink)).unwrap();
        zip.file_names().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn every_container_gets_its_own_file() {
        let source = FakeSource {
            pods: vec![pod("operator-0", &["operator"]), pod("webhook-0", &["webhook", "sidecar"])],
            broken_container: None,
        };

        let archive = SupportArchive::new().unwrap();
        LogCollector::with_source(Box::new(source), false)
            .collect(&archive)
            .await
            .unwrap();

        let names = file_names(archive);
        assert!(names.contains(&"logs/operator-0/operator.log".to_string()));
        assert!(names.contains(&"logs/webhook-0/webhook.log".to_string()));
        assert!(names.contains(&"logs/webhook-0/sidecar.log".to_string()));
        // previous instances don't exist in the fake and are skipped quietly
        assert!(!names.iter().any(|n| n.ends_with("_previous.log")));
    }

    /// Story: one unreadable container never aborts the collector
    #[tokio::test]
    async fn broken_container_is_skipped_not_fatal() {
        let source = FakeSource {
            pods: vec![pod("webhook-0", &["webhook", "sidecar"])],
            broken_container: Some("webhook".to_string()),
        };

        let archive = SupportArchive::new().unwrap();
        LogCollector::with_source(Box::new(source), false)
            .collect(&archive)
            .await
            .unwrap();

        let names = file_names(archive);
        assert!(!names.contains(&"logs/webhook-0/webhook.log".to_string()));
        assert!(names.contains(&"logs/webhook-0/sidecar.log".to_string()));
    }
}
