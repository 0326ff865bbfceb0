//! Webhook certificate watcher
//!
//! An external controller rotates the webhook's serving certificate inside a
//! Secret; this module mirrors that Secret to disk where the TLS listener
//! reads it. Startup blocks on the first successful sync so the server never
//! comes up without a certificate, then a background loop re-syncs every six
//! hours. Errors inside the loop are logged and the loop continues.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::kubeobjects::query::{ClusterApi, ObjectApi};
use crate::{Error, Result, WEBHOOK_NAME};

/// Suffix appended to the webhook name to form the certificate secret name
pub const CERT_SECRET_SUFFIX: &str = "-certs";

/// Files mirrored from the secret to the certificate directory
const CERT_FILES: [&str; 3] = ["tls.crt", "tls.key", "ca.crt"];

/// How long startup waits for the secret before giving up
const INITIAL_WAIT: Duration = Duration::from_secs(5 * 60);

/// Retry cadence while waiting for the secret at startup
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Cadence of the background re-sync loop; also the minimum remaining
/// validity the serving certificate must have
const UPDATE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Mirrors the webhook certificate secret to disk
pub struct CertificateWatcher {
    api: Arc<dyn ObjectApi<Secret>>,
    namespace: String,
    secret_name: String,
    cert_dir: PathBuf,
    tls_config: Option<RustlsConfig>,
}

impl CertificateWatcher {
    /// Watcher over a live cluster
    pub fn new(client: Client, namespace: &str, cert_dir: impl Into<PathBuf>) -> Self {
        Self::with_api(Arc::new(ClusterApi::new(client)), namespace, cert_dir)
    }

    /// Watcher over an arbitrary API (in-memory store in tests)
    pub fn with_api(
        api: Arc<dyn ObjectApi<Secret>>,
        namespace: &str,
        cert_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            namespace: namespace.to_string(),
            secret_name: format!("{WEBHOOK_NAME}{CERT_SECRET_SUFFIX}"),
            cert_dir: cert_dir.into(),
            tls_config: None,
        }
    }

    /// Reload this TLS listener config after every successful sync
    pub fn with_tls_config(mut self, tls_config: RustlsConfig) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    /// Path of the certificate file served to clients
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(CERT_FILES[0])
    }

    /// Path of the private key file
    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(CERT_FILES[1])
    }

    /// Block until the certificate secret exists and is mirrored to disk.
    ///
    /// Retries every 10 seconds for up to 5 minutes. A missing secret is the
    /// expected state right after installation (the rotation controller may
    /// not have run yet) and is logged at info; everything else is an error.
    pub async fn wait_for_certificates(&self) -> Result<()> {
        let deadline = Instant::now() + INITIAL_WAIT;

        loop {
            match self.update_certificates().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_not_found() => {
                    info!(
                        secret = %self.secret_name,
                        "certificate secret not created yet, waiting"
                    );
                }
                Err(err) => {
                    error!(error = %err, "failed to sync certificates, retrying");
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::certificate(format!(
                    "timed out waiting for certificate secret '{}'",
                    self.secret_name
                )));
            }
            sleep(RETRY_INTERVAL).await;
        }
    }

    /// Background loop: re-sync every 6 hours until cancelled. Sync failures
    /// are logged and the loop keeps going; the certificate on disk stays
    /// valid until the next attempt.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(UPDATE_INTERVAL) => {}
            }

            if let Err(err) = self.update_certificates().await {
                error!(error = %err, "periodic certificate sync failed");
            }
        }
    }

    /// One sync: read the secret, mirror changed files to disk, validate the
    /// serving certificate's remaining lifetime, reload the TLS listener.
    pub async fn update_certificates(&self) -> Result<()> {
        let secret = self
            .api
            .get(&self.namespace, &self.secret_name)
            .await?
            .ok_or_else(secret_not_found)?;

        create_cert_dir(&self.cert_dir)?;

        let data = secret.data.unwrap_or_default();
        for file in CERT_FILES {
            let bytes = data
                .get(file)
                .map(|b| b.0.as_slice())
                .ok_or_else(|| {
                    Error::certificate(format!(
                        "certificate secret '{}' is missing key '{file}'",
                        self.secret_name
                    ))
                })?;
            write_if_changed(&self.cert_dir.join(file), bytes)?;
        }

        let cert_pem = data.get(CERT_FILES[0]).map(|b| b.0.as_slice()).unwrap_or_default();
        validate_not_outdated(cert_pem)?;

        if let Some(tls_config) = &self.tls_config {
            let config = crate::webhook::tls_server_config(&self.cert_path(), &self.key_path())?;
            tls_config.reload_from_config(config);
            info!("webhook tls listener reloaded");
        }

        Ok(())
    }
}

fn secret_not_found() -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message: "certificate secret not found".into(),
        reason: "NotFound".into(),
        code: 404,
    }))
}

fn create_cert_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o775)
            .create(dir)
            .map_err(|err| Error::io(dir.display().to_string(), err))
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir).map_err(|err| Error::io(dir.display().to_string(), err))
    }
}

/// Write the file only when it is missing or its bytes differ; the agent of
/// the injected workloads reads these files, hence the wide mode.
fn write_if_changed(path: &Path, bytes: &[u8]) -> Result<()> {
    let current = std::fs::read(path).ok();
    if current.as_deref() == Some(bytes) {
        return Ok(());
    }

    std::fs::write(path, bytes).map_err(|err| Error::io(path.display().to_string(), err))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
            .map_err(|err| Error::io(path.display().to_string(), err))?;
    }

    info!(path = %path.display(), "certificate file updated");
    Ok(())
}

/// The serving certificate must outlive the next sync interval
fn validate_not_outdated(cert_pem: &[u8]) -> Result<()> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem)
        .map_err(|err| Error::certificate(format!("could not parse certificate pem: {err}")))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|err| Error::certificate(format!("could not parse certificate: {err}")))?;

    let not_after = cert.validity().not_after.timestamp();
    let minimum = chrono::Utc::now().timestamp() + UPDATE_INTERVAL.as_secs() as i64;
    if not_after <= minimum {
        return Err(Error::certificate("certificate is outdated"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubeobjects::query::testing::FakeApi;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use rcgen::{CertificateParams, KeyPair};
    use std::collections::BTreeMap;

    fn self_signed(not_after_year: i32) -> (String, String) {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["dynatrace-webhook.dynatrace.svc".into()])
            .unwrap();
        params.not_after = rcgen::date_time_ymd(not_after_year, 1, 1);
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    fn cert_secret(cert_pem: &str, key_pem: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(format!("{WEBHOOK_NAME}{CERT_SECRET_SUFFIX}")),
                namespace: Some("dynatrace".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("tls.crt".to_string(), ByteString(cert_pem.as_bytes().to_vec())),
                ("tls.key".to_string(), ByteString(key_pem.as_bytes().to_vec())),
                ("ca.crt".to_string(), ByteString(cert_pem.as_bytes().to_vec())),
            ])),
            ..Default::default()
        }
    }

    fn watcher(api: Arc<FakeApi<Secret>>, dir: &Path) -> CertificateWatcher {
        CertificateWatcher::with_api(api, "dynatrace", dir)
    }

    #[tokio::test]
    async fn sync_mirrors_all_three_files_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        let (cert_pem, key_pem) = self_signed(2099);
        api.seed(cert_secret(&cert_pem, &key_pem));

        let certs_dir = dir.path().join("certs");
        watcher(api, &certs_dir).update_certificates().await.unwrap();

        assert_eq!(
            std::fs::read_to_string(certs_dir.join("tls.crt")).unwrap(),
            cert_pem
        );
        assert_eq!(
            std::fs::read_to_string(certs_dir.join("tls.key")).unwrap(),
            key_pem
        );
        assert!(certs_dir.join("ca.crt").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_and_directory_carry_the_agreed_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        let (cert_pem, key_pem) = self_signed(2099);
        api.seed(cert_secret(&cert_pem, &key_pem));

        let certs_dir = dir.path().join("certs");
        watcher(api, &certs_dir).update_certificates().await.unwrap();

        let dir_mode = std::fs::metadata(&certs_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o775);
        let file_mode = std::fs::metadata(certs_dir.join("tls.crt"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o666);
    }

    #[tokio::test]
    async fn unchanged_files_are_left_alone_and_changes_win() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        let (cert_pem, key_pem) = self_signed(2099);
        api.seed(cert_secret(&cert_pem, &key_pem));

        let certs_dir = dir.path().join("certs");
        let w = watcher(api.clone(), &certs_dir);
        w.update_certificates().await.unwrap();
        w.update_certificates().await.unwrap();

        // rotation lands on disk
        let (rotated_cert, rotated_key) = self_signed(2099);
        api.seed(cert_secret(&rotated_cert, &rotated_key));
        w.update_certificates().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(certs_dir.join("tls.crt")).unwrap(),
            rotated_cert
        );
    }

    #[tokio::test]
    async fn nearly_expired_certificate_is_rejected_after_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        // expired long ago, well under the 6h margin
        let (cert_pem, key_pem) = self_signed(2020);
        api.seed(cert_secret(&cert_pem, &key_pem));

        let certs_dir = dir.path().join("certs");
        let err = watcher(api, &certs_dir)
            .update_certificates()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("certificate is outdated"));

        // the file write precedes validation
        assert!(certs_dir.join("tls.crt").is_file());
    }

    #[tokio::test]
    async fn missing_secret_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        let (cert_pem, _) = self_signed(2099);
        let mut secret = cert_secret(&cert_pem, "unused");
        secret.data.as_mut().unwrap().remove("tls.key");
        api.seed(secret);

        let err = watcher(api, dir.path())
            .update_certificates()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tls.key"));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_wait_retries_until_the_secret_appears() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        let certs_dir = dir.path().join("certs");
        let w = Arc::new(watcher(api.clone(), &certs_dir));

        let seeder = {
            let api = api.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(25)).await;
                let (cert_pem, key_pem) = self_signed(2099);
                api.seed(cert_secret(&cert_pem, &key_pem));
            })
        };

        w.wait_for_certificates().await.unwrap();
        seeder.await.unwrap();
        assert!(certs_dir.join("tls.crt").is_file());
    }
}
