//! Dynatrace operator binary
//!
//! One image, several subcommands: the operator process, the webhook server,
//! the support-archive collector and the uninstall-time CRD cleanup. Helm
//! picks the subcommand per deployment.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kube::Client;

use dynatrace_operator::startup::{self, WebhookServerOptions};
use dynatrace_operator::support_archive::ArchiveOptions;
use dynatrace_operator::{logging, support_archive, APP_VERSION_ENV, POD_NAMESPACE_ENV};

#[derive(Parser, Debug)]
#[command(name = "dynatrace-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator process (default)
    Operator,

    /// Run the admission webhook server
    WebhookServer {
        /// Directory the serving certificate is synced into
        #[arg(long, default_value = "/tmp/webhook/certs")]
        certs_dir: PathBuf,

        /// Certificate file name inside the certs directory
        #[arg(long, default_value = "tls.crt")]
        cert: String,

        /// Private key file name inside the certs directory
        #[arg(long, default_value = "tls.key")]
        cert_key: String,
    },

    /// Stream a diagnostics ZIP bundle to stdout
    SupportArchive {
        /// Namespace the operator components run in
        #[arg(long, env = POD_NAMESPACE_ENV)]
        namespace: String,

        /// Write the bundle to stdout (the only supported sink)
        #[arg(long, required = true)]
        stdout: bool,

        /// Seconds to wait before collection starts
        #[arg(long, default_value_t = 0)]
        delay: u64,

        /// Also collect logs of pods the operator manages
        #[arg(long, default_value_t = false)]
        managed_logs: bool,

        /// Size in MiB of each synthetic load file
        #[arg(long, default_value_t = 10)]
        loadsim_file_size: usize,

        /// Number of synthetic load files; 0 disables the load simulation
        #[arg(long, default_value_t = 0)]
        loadsim_files: usize,

        /// Cap on collected warning events
        #[arg(long, default_value_t = 300)]
        num_events: u32,
    },

    /// Remove conversion-webhook wiring from the CRDs (uninstall hook)
    CrdCleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(err) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("cannot install the aws-lc-rs crypto provider: {err:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Operator) | None => {
            logging::init();
            startup::run_operator().await?;
        }
        Some(Commands::WebhookServer {
            certs_dir,
            cert,
            cert_key,
        }) => {
            logging::init();
            startup::run_webhook_server(WebhookServerOptions {
                certs_dir,
                cert_file: cert,
                key_file: cert_key,
            })
            .await?;
        }
        Some(Commands::SupportArchive {
            namespace,
            stdout: _,
            delay,
            managed_logs,
            loadsim_file_size,
            loadsim_files,
            num_events,
        }) => {
            // the bundle goes to stdout, so logs tee into a buffer that is
            // drained into the bundle itself
            let buffer = logging::init_with_buffer();
            let client = Client::try_default().await?;
            let options = ArchiveOptions {
                namespace,
                delay,
                managed_logs,
                loadsim_file_size,
                loadsim_files,
                num_events,
            };
            let version =
                std::env::var(APP_VERSION_ENV).unwrap_or_else(|_| "unknown".to_string());

            let mut stdout = std::io::stdout().lock();
            support_archive::execute(client, &options, &version, buffer, &mut stdout).await?;
            stdout.flush()?;
        }
        Some(Commands::CrdCleanup) => {
            logging::init();
            startup::run_crd_cleanup().await?;
        }
    }

    Ok(())
}
