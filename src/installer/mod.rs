//! Code-module job installer
//!
//! Runs inside the CSI driver on each node. Installation is a polled state
//! machine over two observables: does the target directory exist on disk,
//! and does the download Job exist in the cluster. Each
//! [`JobInstaller::install_agent`] call advances at most one step and
//! returns whether the agent binaries are ready; the CSI driver keeps
//! polling until they are.

pub mod job;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use kube::Client;
use tracing::{debug, info};

use crate::crd::DynaKube;
use crate::kubeobjects::query::{ClusterApi, ObjectApi};
use crate::settings::JobSettings;
use crate::{Error, Result};

/// Name of the symlink publishing the active agent version
const CURRENT_LINK: &str = "current";

/// Node-local paths the installer works against
#[derive(Debug, Clone)]
pub struct InstallerPaths {
    /// Root of the CSI driver's node-local data directory (host path)
    pub csi_data_dir: PathBuf,
    /// Directory holding the per-version agent binaries and the `current` link
    pub shared_dir: PathBuf,
    /// Scratch directory handed to the download Job
    pub work_dir: PathBuf,
}

/// Installs one agent version onto one node via a download Job
pub struct JobInstaller {
    api: Arc<dyn ObjectApi<Job>>,
    dynakube: DynaKube,
    namespace: String,
    image_uri: String,
    node_name: String,
    paths: InstallerPaths,
    settings: JobSettings,
}

impl JobInstaller {
    /// Installer over a live cluster
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        dynakube: DynaKube,
        namespace: &str,
        image_uri: &str,
        node_name: &str,
        paths: InstallerPaths,
        settings: JobSettings,
    ) -> Self {
        Self::with_api(
            Arc::new(ClusterApi::new(client)),
            dynakube,
            namespace,
            image_uri,
            node_name,
            paths,
            settings,
        )
    }

    /// Installer over an arbitrary API (in-memory store in tests)
    #[allow(clippy::too_many_arguments)]
    pub fn with_api(
        api: Arc<dyn ObjectApi<Job>>,
        dynakube: DynaKube,
        namespace: &str,
        image_uri: &str,
        node_name: &str,
        paths: InstallerPaths,
        settings: JobSettings,
    ) -> Self {
        Self {
            api,
            dynakube,
            namespace: namespace.to_string(),
            image_uri: image_uri.to_string(),
            node_name: node_name.to_string(),
            paths,
            settings,
        }
    }

    /// Advance the installation one step.
    ///
    /// Returns `Ok(true)` once the binaries are on disk and published via the
    /// `current` symlink, `Ok(false)` while the download Job is pending, and
    /// an error when the Job reported a failed pod. Retries are safe: the Job
    /// name is content-addressed, so a second call never creates a duplicate.
    pub async fn install_agent(&self, target_dir: &Path) -> Result<bool> {
        std::fs::create_dir_all(&self.paths.shared_dir)
            .map_err(|err| Error::io(self.paths.shared_dir.display().to_string(), err))?;

        let job_name = job::job_name(&self.image_uri, &self.node_name);

        if target_dir.is_dir() {
            publish_current(&self.paths.shared_dir, target_dir)?;

            // the Job served its purpose; absence is fine
            match self.api.delete(&self.namespace, &job_name, true).await {
                Ok(()) => debug!(job = %job_name, "download job cleaned up"),
                Err(err) if err.is_not_found() => {}
                Err(err) => debug!(job = %job_name, error = %err, "download job cleanup failed"),
            }

            return Ok(true);
        }

        if let Some(existing) = self.api.get(&self.namespace, &job_name).await? {
            let failed = existing
                .status
                .as_ref()
                .and_then(|status| status.failed)
                .unwrap_or(0);
            if failed > 0 {
                return Err(Error::installer(format!("job failing: {job_name}")));
            }
            debug!(job = %job_name, "download job still running");
            return Ok(false);
        }

        let job = job::build_download_job(
            &self.dynakube,
            &self.namespace,
            &self.image_uri,
            &self.node_name,
            &self.paths.csi_data_dir,
            target_dir,
            &self.paths.work_dir,
            &self.settings,
        )?;
        self.api.create(&job).await?;
        info!(
            job = %job_name,
            image = %self.image_uri,
            node = %self.node_name,
            "download job created"
        );

        Ok(false)
    }
}

/// Point `<shared>/current` at the freshly installed version. A failure here
/// leaves a target directory no symlink references, so the directory is
/// removed and the whole attempt retried from scratch.
fn publish_current(shared_dir: &Path, target_dir: &Path) -> Result<()> {
    let link = shared_dir.join(CURRENT_LINK);
    if std::fs::symlink_metadata(&link).is_ok() {
        return Ok(());
    }

    #[cfg(unix)]
    let linked = std::os::unix::fs::symlink(target_dir, &link);
    #[cfg(not(unix))]
    let linked = std::os::windows::fs::symlink_dir(target_dir, &link);

    if let Err(err) = linked {
        let _ = std::fs::remove_dir_all(target_dir);
        return Err(Error::io(link.display().to_string(), err));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DynaKubeSpec;
    use crate::kubeobjects::query::testing::FakeApi;
    use k8s_openapi::api::batch::v1::JobStatus;

    fn installed_dynakube() -> DynaKube {
        let mut dk = DynaKube::new("dynakube", DynaKubeSpec::default());
        dk.metadata.namespace = Some("dynatrace".into());
        dk.metadata.uid = Some("uid-1".into());
        dk
    }

    fn installer(api: Arc<FakeApi<Job>>, base: &Path) -> JobInstaller {
        JobInstaller::with_api(
            api,
            installed_dynakube(),
            "dynatrace",
            "registry.example.com/oneagent:1.2.3",
            "node-1",
            InstallerPaths {
                csi_data_dir: base.to_path_buf(),
                shared_dir: base.join("shared"),
                work_dir: base.join("work"),
            },
            JobSettings::default(),
        )
    }

    /// Story: first poll creates the Job, second poll waits, and polling
    /// never creates duplicates
    #[tokio::test]
    async fn polling_creates_exactly_one_job_and_waits() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        let installer = installer(api.clone(), dir.path());
        let target = dir.path().join("codemodules/1.2.3");

        assert!(!installer.install_agent(&target).await.unwrap());
        assert!(!installer.install_agent(&target).await.unwrap());
        assert!(!installer.install_agent(&target).await.unwrap());

        assert_eq!(*api.creates.lock().unwrap(), 1);
        let job_name = job::job_name("registry.example.com/oneagent:1.2.3", "node-1");
        assert!(api.contains("dynatrace", &job_name));
    }

    /// Story: once the Job wrote the binaries, the version is published and
    /// the Job cleaned up
    #[tokio::test]
    async fn finished_download_publishes_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        let installer = installer(api.clone(), dir.path());
        let target = dir.path().join("codemodules/1.2.3");

        assert!(!installer.install_agent(&target).await.unwrap());

        // the download Job materializes the target directory
        std::fs::create_dir_all(&target).unwrap();

        assert!(installer.install_agent(&target).await.unwrap());

        let link = dir.path().join("shared").join(CURRENT_LINK);
        assert_eq!(std::fs::read_link(&link).unwrap(), target);
        let job_name = job::job_name("registry.example.com/oneagent:1.2.3", "node-1");
        assert!(!api.contains("dynatrace", &job_name));

        // ready state is stable even after the Job is long gone
        assert!(installer.install_agent(&target).await.unwrap());
    }

    #[tokio::test]
    async fn failed_job_surfaces_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        let installer = installer(api.clone(), dir.path());
        let target = dir.path().join("codemodules/1.2.3");

        installer.install_agent(&target).await.unwrap();

        let job_name = job::job_name("registry.example.com/oneagent:1.2.3", "node-1");
        let mut failing = api.stored("dynatrace", &job_name).unwrap();
        failing.status = Some(JobStatus {
            failed: Some(1),
            ..Default::default()
        });
        api.seed(failing);

        let err = installer.install_agent(&target).await.unwrap_err();
        assert!(err.to_string().contains("failing"));
    }

    #[test]
    fn failed_publish_rolls_the_target_back() {
        let dir = tempfile::tempdir().unwrap();
        // "shared" is a file, so creating shared/current fails
        let shared = dir.path().join("shared");
        std::fs::write(&shared, b"not a directory").unwrap();

        let target = dir.path().join("codemodules/1.2.3");
        std::fs::create_dir_all(&target).unwrap();

        assert!(publish_current(&shared, &target).is_err());
        assert!(!target.exists(), "partial state must be rolled back");
    }

    #[test]
    fn existing_link_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared");
        std::fs::create_dir_all(&shared).unwrap();

        let old_target = dir.path().join("codemodules/1.2.2");
        let new_target = dir.path().join("codemodules/1.2.3");
        std::fs::create_dir_all(&old_target).unwrap();
        std::fs::create_dir_all(&new_target).unwrap();

        publish_current(&shared, &old_target).unwrap();
        publish_current(&shared, &new_target).unwrap();

        let link = shared.join(CURRENT_LINK);
        assert_eq!(std::fs::read_link(&link).unwrap(), old_target);
    }
}
