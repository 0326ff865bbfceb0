//! Mutating webhooks for Pods and Namespaces
//!
//! The webhook server carries three admission endpoints behind one TLS
//! listener:
//!
//! - `POST /inject` - pod mutation (code-module injection)
//! - `POST /label-ns` - namespace mutation (instance-label mapping)
//! - `POST /validate` - DynaKube validation ([`crate::validation`])
//!
//! plus `/livez` and `/readyz`. Every admission request is counted against
//! the [`crate::shutdown::ShutdownManager`] so the drain can wait for
//! in-flight calls.

pub mod namespace;
pub mod pod;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::info;

use crate::crd::DynaKube;
use crate::shutdown::ShutdownManager;
use crate::validation::ValidationWebhook;
use crate::{Error, Result};

/// Read access the mutating webhooks need; a trait seam so handler logic is
/// testable without a cluster
#[async_trait]
pub trait CrReader: Send + Sync {
    /// One DynaKube from the operator namespace, `None` on NotFound
    async fn get_dynakube(&self, name: &str) -> Result<Option<DynaKube>>;
    /// All DynaKubes in the operator namespace
    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>>;
    /// One namespace, `None` on NotFound
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;
}

/// [`CrReader`] over a live cluster
pub struct ClusterCrReader {
    client: Client,
    operator_namespace: String,
}

impl ClusterCrReader {
    /// Wrap a kube client scoped to the operator namespace
    pub fn new(client: Client, operator_namespace: impl Into<String>) -> Self {
        Self {
            client,
            operator_namespace: operator_namespace.into(),
        }
    }
}

#[async_trait]
impl CrReader for ClusterCrReader {
    async fn get_dynakube(&self, name: &str) -> Result<Option<DynaKube>> {
        let api: Api<DynaKube> = Api::namespaced(self.client.clone(), &self.operator_namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_dynakubes(&self) -> Result<Vec<DynaKube>> {
        let api: Api<DynaKube> = Api::namespaced(self.client.clone(), &self.operator_namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

/// Shared state of the mutating webhook endpoints
pub struct WebhookState {
    /// Cluster reader used by both mutating webhooks
    pub reader: Arc<dyn CrReader>,
    /// The operator's own namespace
    pub operator_namespace: String,
    /// Image run as the install init container (the webhook's own image)
    pub webhook_image: String,
}

/// State behind the health probes. Liveness follows the shutdown manager;
/// readiness follows the serving-certificate files, so losing them pulls the
/// endpoint out of rotation until the watcher restores them.
#[derive(Clone)]
pub struct HealthState {
    shutdown: ShutdownManager,
    cert_paths: Arc<Vec<PathBuf>>,
}

impl HealthState {
    /// Probe state; an empty path list reports always-ready (processes that
    /// serve no TLS)
    pub fn new(shutdown: ShutdownManager, cert_paths: Vec<PathBuf>) -> Self {
        Self {
            shutdown,
            cert_paths: Arc::new(cert_paths),
        }
    }

    fn is_ready(&self) -> bool {
        self.cert_paths.iter().all(|path| path.is_file())
    }
}

/// Assemble the webhook router: admission endpoints, health probes, and the
/// in-flight request counter
pub fn router(
    state: Arc<WebhookState>,
    validation: Arc<ValidationWebhook>,
    shutdown: ShutdownManager,
    cert_paths: Vec<PathBuf>,
) -> Router {
    let admission = Router::new()
        .route("/inject", post(pod::mutate_handler))
        .route("/label-ns", post(namespace::mutate_handler))
        .with_state(state)
        .merge(
            Router::new()
                .route("/validate", post(crate::validation::validate_handler))
                .with_state(validation),
        )
        .layer(middleware::from_fn_with_state(
            shutdown.clone(),
            track_in_flight,
        ));

    admission.merge(health_router(HealthState::new(shutdown, cert_paths)))
}

/// The `/livez` and `/readyz` probe routes
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn track_in_flight(
    State(shutdown): State<ShutdownManager>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = shutdown.track_request();
    next.run(request).await
}

async fn livez(State(health): State<HealthState>) -> StatusCode {
    if health.shutdown.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readyz(State(health): State<HealthState>) -> StatusCode {
    if health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// TLS listener config for the webhook server: TLS 1.3 only, certificate and
/// key from the files the certificate watcher maintains. Used for the
/// initial config and for every rotation reload.
pub fn tls_server_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<Arc<rustls::ServerConfig>> {
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};

    let certs = CertificateDer::pem_file_iter(cert_path)
        .map_err(|err| {
            Error::certificate(format!("cannot read {}: {err}", cert_path.display()))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| {
            Error::certificate(format!("cannot parse {}: {err}", cert_path.display()))
        })?;
    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|err| Error::certificate(format!("cannot read {}: {err}", key_path.display())))?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::certificate(format!("invalid serving certificate: {err}")))?;

    Ok(Arc::new(config))
}

/// Serve the router over TLS until the shutdown drain cancels the server.
///
/// `tls` is the hot-reloadable config the certificate watcher updates in
/// place; rotation needs no listener restart.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    tls: RustlsConfig,
    shutdown: &ShutdownManager,
) -> Result<()> {
    let handle = axum_server::Handle::new();
    let token = shutdown.cancellation_token();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            token.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(5)));
        }
    });

    info!(%addr, "webhook server listening");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|err| Error::config(format!("webhook server failed: {err}")))
}
