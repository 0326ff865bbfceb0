//! Startup checks and process assembly

pub mod crd_check;
pub mod operator;

pub use operator::{
    run_crd_cleanup, run_operator, run_webhook_server, ServerAddresses, WebhookServerOptions,
};
