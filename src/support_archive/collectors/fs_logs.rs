//! On-disk log capture
//!
//! Some components keep logs on their pod filesystem that never reach the
//! container runtime. This collector remote-execs into the operator pods,
//! lists the log directory and ships every file it finds.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::{Client, ResourceExt};
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::support_archive::archive::SupportArchive;
use crate::support_archive::Collector;
use crate::{Error, Result, APP_NAME_LABEL, OPERATOR_NAME};

/// Directory the components write their on-disk logs into
const LOG_DIR: &str = "/var/log/dynatrace-operator";

/// Command execution inside a running pod
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Pods eligible for filesystem capture
    async fn pods(&self, label_selector: &str) -> Result<Vec<Pod>>;

    /// Run a command in the pod's first container, return stdout
    async fn exec(&self, pod: &str, command: &[&str]) -> Result<String>;
}

struct ClusterExec {
    api: Api<Pod>,
}

#[async_trait]
impl RemoteExec for ClusterExec {
    async fn pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api.list(&params).await?.items)
    }

    async fn exec(&self, pod: &str, command: &[&str]) -> Result<String> {
        let params = AttachParams::default().stderr(false);
        let mut attached = self.api.exec(pod, command.to_vec(), &params).await?;

        let mut stdout = attached
            .stdout()
            .ok_or_else(|| Error::support_archive("exec returned no stdout stream"))?;
        let mut buffer = Vec::new();
        stdout
            .read_to_end(&mut buffer)
            .await
            .map_err(|err| Error::support_archive(format!("exec stream failed: {err}")))?;
        attached
            .join()
            .await
            .map_err(|err| Error::support_archive(format!("exec join failed: {err}")))?;

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Writes `logs/<pod>/fs/<file>` for every on-disk log file
pub struct FsLogCollector {
    exec: Box<dyn RemoteExec>,
}

impl FsLogCollector {
    /// Collector over a live cluster
    pub fn new(client: Client, namespace: &str) -> Self {
        Self::with_exec(Box::new(ClusterExec {
            api: Api::namespaced(client, namespace),
        }))
    }

    /// Collector over an arbitrary executor (tests)
    pub fn with_exec(exec: Box<dyn RemoteExec>) -> Self {
        Self { exec }
    }

    async fn collect_pod(&self, archive: &SupportArchive, pod_name: &str) -> Result<()> {
        let listing = self
            .exec
            .exec(pod_name, &["/bin/sh", "-c", &format!("ls -1 {LOG_DIR} 2>/dev/null")])
            .await?;

        for file in listing.lines().filter(|line| !line.is_empty()) {
            // no shell around cat: listed names may carry spaces or metacharacters
            match self
                .exec
                .exec(pod_name, &["cat", &format!("{LOG_DIR}/{file}")])
                .await
            {
                Ok(contents) => archive.add_file(
                    &format!("logs/{pod_name}/fs/{file}"),
                    contents.as_bytes(),
                )?,
                Err(err) => warn!(pod = %pod_name, %file, error = %err, "file capture failed"),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Collector for FsLogCollector {
    fn name(&self) -> &'static str {
        "fs-logs"
    }

    async fn collect(&self, archive: &SupportArchive) -> Result<()> {
        let selector = format!("{APP_NAME_LABEL}={OPERATOR_NAME}");
        let pods = self.exec.pods(&selector).await?;

        for pod in pods {
            let pod_name = pod.name_any();
            if let Err(err) = self.collect_pod(archive, &pod_name).await {
                warn!(pod = %pod_name, error = %err, "filesystem log capture failed");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::io::{Cursor, Read};

    struct FakeExec {
        listing: &'static str,
        commands: std::sync::Arc<std::sync::Mutex<Vec<Vec<String>>>>,
    }

    impl FakeExec {
        fn with_listing(listing: &'static str) -> Self {
            Self {
                listing,
                commands: std::sync::Arc::default(),
            }
        }
    }

    #[async_trait]
    impl RemoteExec for FakeExec {
        async fn pods(&self, _: &str) -> Result<Vec<Pod>> {
            Ok(vec![Pod {
                metadata: ObjectMeta {
                    name: Some("operator-0".into()),
                    ..Default::default()
                },
                ..Default::default()
            }])
        }

        async fn exec(&self, _: &str, command: &[&str]) -> Result<String> {
            self.commands
                .lock()
                .unwrap()
                .push(command.iter().map(|arg| arg.to_string()).collect());

            let last = command.last().unwrap();
            if last.starts_with("ls") {
                Ok(self.listing.to_string())
            } else if last.ends_with("csi.log") {
                Ok("csi contents".to_string())
            } else if last.ends_with("audit 2026-08.log") {
                Ok("audit contents".to_string())
            } else {
                Err(Error::support_archive("file vanished"))
            }
        }
    }

    /// Story: listed files are captured one by one; a vanished file is skipped
    #[tokio::test]
    async fn listed_files_are_captured_individually() {
        let archive = SupportArchive::new().unwrap();
        FsLogCollector::with_exec(Box::new(FakeExec::with_listing(
            "csi.log\nprovisioner.log\n",
        )))
        .collect(&archive)
        .await
        .unwrap();

        let mut sink = Vec::new();
        archive.close_into(&mut sink).unwrap();
        let mut zip = zip::ZipArchive::new(Cursor::new(sink)).unwrap();

        let mut contents = String::new();
        zip.by_name("logs/operator-0/fs/csi.log")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "csi contents");

        let names: Vec<_> = zip.file_names().collect();
        assert!(!names.contains(&"logs/operator-0/fs/provisioner.log"));
    }

    /// Story: a file name with spaces is captured verbatim because cat gets
    /// the path as its own argv element, not a shell line
    #[tokio::test]
    async fn file_names_with_spaces_survive_the_capture() {
        let exec = FakeExec::with_listing("audit 2026-08.log\n");
        let commands = exec.commands.clone();

        let archive = SupportArchive::new().unwrap();
        FsLogCollector::with_exec(Box::new(exec))
            .collect(&archive)
            .await
            .unwrap();

        let recorded = commands.lock().unwrap();
        assert_eq!(
            recorded.last().unwrap(),
            &vec![
                "cat".to_string(),
                "/var/log/dynatrace-operator/audit 2026-08.log".to_string()
            ]
        );
        drop(recorded);

        let mut sink = Vec::new();
        archive.close_into(&mut sink).unwrap();
        let mut zip = zip::ZipArchive::new(Cursor::new(sink)).unwrap();

        let mut contents = String::new();
        zip.by_name("logs/operator-0/fs/audit 2026-08.log")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "audit contents");
    }
}
