//! Process assembly
//!
//! Wires the servers together: the TLS webhook listener, the plain-HTTP
//! health probes, the metrics endpoint, the certificate watcher task and the
//! shutdown coordinator. All ports are environment-overridable so the Helm
//! chart controls them without a rebuild.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::crd_check;
use crate::certificates::CertificateWatcher;
use crate::shutdown::ShutdownManager;
use crate::validation::ValidationWebhook;
use crate::webhook::{self, ClusterCrReader, HealthState, WebhookState};
use crate::{
    Error, Result, APP_VERSION_ENV, DYNAKUBE_CRD_NAME, EDGECONNECT_CRD_NAME, OPERATOR_NAME,
    POD_NAME_ENV, POD_NAMESPACE_ENV, WEBHOOK_NAME,
};

/// Environment variable overriding the webhook TLS port
pub const WEBHOOK_PORT_ENV: &str = "WEBHOOK_PORT";

/// Environment variable overriding the metrics bind address
pub const METRICS_BIND_ADDRESS_ENV: &str = "METRICS_BIND_ADDRESS";

/// Environment variable overriding the health-probe bind address
pub const HEALTH_PROBE_BIND_ADDRESS_ENV: &str = "HEALTH_PROBE_BIND_ADDRESS";

const DEFAULT_WEBHOOK_PORT: u16 = 8443;
const DEFAULT_METRICS_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_HEALTH_PROBE_ADDRESS: &str = "0.0.0.0:10080";

/// Listen addresses of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddresses {
    /// TLS admission listener
    pub webhook: SocketAddr,
    /// Plain-HTTP metrics listener
    pub metrics: SocketAddr,
    /// Plain-HTTP probe listener
    pub health_probe: SocketAddr,
}

impl ServerAddresses {
    /// Resolve the addresses from the environment, with chart defaults
    pub fn from_env() -> Result<Self> {
        let port = parse_port(
            std::env::var(WEBHOOK_PORT_ENV).ok().as_deref(),
            DEFAULT_WEBHOOK_PORT,
        )?;
        Ok(Self {
            webhook: SocketAddr::from(([0, 0, 0, 0], port)),
            metrics: parse_bind_address(
                std::env::var(METRICS_BIND_ADDRESS_ENV).ok().as_deref(),
                DEFAULT_METRICS_ADDRESS,
            )?,
            health_probe: parse_bind_address(
                std::env::var(HEALTH_PROBE_BIND_ADDRESS_ENV).ok().as_deref(),
                DEFAULT_HEALTH_PROBE_ADDRESS,
            )?,
        })
    }
}

fn parse_port(raw: Option<&str>, default: u16) -> Result<u16> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::config(format!("invalid port '{raw}'"))),
    }
}

/// Controller-runtime style addresses like `:8080` mean "all interfaces"
fn parse_bind_address(raw: Option<&str>, default: &str) -> Result<SocketAddr> {
    let raw = raw.unwrap_or(default);
    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    normalized
        .parse()
        .map_err(|_| Error::config(format!("invalid bind address '{raw}'")))
}

/// CLI options of the `webhook-server` subcommand
#[derive(Debug, Clone)]
pub struct WebhookServerOptions {
    /// Directory the certificate watcher maintains
    pub certs_dir: PathBuf,
    /// Certificate file name inside `certs_dir`
    pub cert_file: String,
    /// Private key file name inside `certs_dir`
    pub key_file: String,
}

fn metrics_router() -> Router {
    let version = std::env::var(APP_VERSION_ENV).unwrap_or_else(|_| "unknown".to_string());
    let body = format!(
        "# HELP {name}_info Build information\n# TYPE {name}_info gauge\n{name}_info{{version=\"{version}\"}} 1\n",
        name = OPERATOR_NAME.replace('-', "_"),
    );
    Router::new().route("/metrics", get(move || async move { body }))
}

/// Serve a plain-HTTP router until the token cancels
async fn serve_plain(addr: SocketAddr, app: Router, token: CancellationToken) -> Result<()> {
    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            token.cancelled().await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(1)));
        }
    });

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|err| Error::config(format!("server on {addr} failed: {err}")))
}

/// The webhook pod injects its own image as the install container, so it
/// reads it off its own pod spec
async fn discover_webhook_image(client: Client, namespace: &str) -> Result<String> {
    let pod_name = std::env::var(POD_NAME_ENV)
        .map_err(|_| Error::config(format!("{POD_NAME_ENV} is not set")))?;

    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let pod = pods.get(&pod_name).await?;

    let spec = pod
        .spec
        .ok_or_else(|| Error::config(format!("pod '{pod_name}' has no spec")))?;
    spec.containers
        .iter()
        .find(|container| container.name == WEBHOOK_NAME)
        .or_else(|| spec.containers.first())
        .and_then(|container| container.image.clone())
        .ok_or_else(|| Error::config(format!("pod '{pod_name}' carries no usable image")))
}

/// Run the `webhook-server` subcommand: startup checks, certificate barrier,
/// the three listeners, and the shutdown drain.
pub async fn run_webhook_server(options: WebhookServerOptions) -> Result<()> {
    let addresses = ServerAddresses::from_env()?;
    let client = Client::try_default()
        .await
        .map_err(|err| Error::config(format!("cannot connect to the cluster: {err}")))?;
    let namespace = std::env::var(POD_NAMESPACE_ENV)
        .map_err(|_| Error::config(format!("{POD_NAMESPACE_ENV} is not set")))?;

    crd_check::check_crd_versions(client.clone()).await?;

    // the server must never come up without a serving certificate
    let watcher = CertificateWatcher::new(client.clone(), &namespace, &options.certs_dir);
    watcher.wait_for_certificates().await?;

    let cert_path = options.certs_dir.join(&options.cert_file);
    let key_path = options.certs_dir.join(&options.key_file);
    let tls = RustlsConfig::from_config(webhook::tls_server_config(&cert_path, &key_path)?);

    let shutdown = ShutdownManager::new();

    let watcher = watcher.with_tls_config(tls.clone());
    tokio::spawn({
        let token = shutdown.cancellation_token();
        async move { watcher.run(token).await }
    });

    let webhook_image = discover_webhook_image(client.clone(), &namespace).await?;
    let state = Arc::new(WebhookState {
        reader: Arc::new(ClusterCrReader::new(client.clone(), namespace.clone())),
        operator_namespace: namespace.clone(),
        webhook_image,
    });
    let validation = Arc::new(ValidationWebhook::new(client, namespace));
    let cert_paths = vec![cert_path, key_path];
    let app = webhook::router(
        state,
        validation,
        shutdown.clone(),
        cert_paths.clone(),
    );

    tokio::spawn(serve_plain(
        addresses.health_probe,
        webhook::health_router(HealthState::new(shutdown.clone(), cert_paths)),
        shutdown.cancellation_token(),
    ));
    tokio::spawn(serve_plain(
        addresses.metrics,
        metrics_router(),
        shutdown.cancellation_token(),
    ));
    tokio::spawn(shutdown.clone().listen());

    webhook::serve(addresses.webhook, app, tls, &shutdown).await
}

/// Run the default `operator` subcommand.
///
/// The reconcile controllers ship as their own deployment; this process runs
/// the startup checks and hosts the probe endpoints the chart points at.
pub async fn run_operator() -> Result<()> {
    let addresses = ServerAddresses::from_env()?;
    let client = Client::try_default()
        .await
        .map_err(|err| Error::config(format!("cannot connect to the cluster: {err}")))?;

    crd_check::check_crd_versions(client).await?;

    let shutdown = ShutdownManager::new();
    tokio::spawn(shutdown.clone().listen());
    tokio::spawn(serve_plain(
        addresses.metrics,
        metrics_router(),
        shutdown.cancellation_token(),
    ));

    info!("operator started");
    serve_plain(
        addresses.health_probe,
        webhook::health_router(HealthState::new(shutdown.clone(), Vec::new())),
        shutdown.cancellation_token(),
    )
    .await
}

/// Run the `crd-cleanup` subcommand: drop the conversion-webhook wiring from
/// the CRDs so uninstalling the webhook deployment cannot strand them, while
/// answering the chart's liveness probe.
pub async fn run_crd_cleanup() -> Result<()> {
    let addresses = ServerAddresses::from_env()?;
    let client = Client::try_default()
        .await
        .map_err(|err| Error::config(format!("cannot connect to the cluster: {err}")))?;

    let shutdown = ShutdownManager::new();
    let probe = tokio::spawn(serve_plain(
        addresses.health_probe,
        webhook::health_router(HealthState::new(shutdown.clone(), Vec::new())),
        shutdown.cancellation_token(),
    ));

    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let patch = serde_json::json!({
        "spec": {"conversion": {"strategy": "None", "webhook": null}}
    });
    for crd_name in [DYNAKUBE_CRD_NAME, EDGECONNECT_CRD_NAME] {
        match crds
            .patch(crd_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!(crd = %crd_name, "conversion webhook removed"),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                info!(crd = %crd_name, "CRD already gone")
            }
            Err(err) => return Err(err.into()),
        }
    }

    shutdown.cancellation_token().cancel();
    let _ = probe.await;
    Ok(())
}
