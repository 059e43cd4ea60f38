//! Validating admission webhook for FusionAccess
//!
//! Served over HTTPS with rustls from the serving certificate mounted into
//! the operator pod. Health endpoints share the listener.

pub mod admission;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use admission::{AdmissionGate, AdmissionLookup, KubeAdmissionLookup, Verdict};

/// Path the ValidatingWebhookConfiguration points at
pub const VALIDATE_PATH: &str = "/validate-fusion-storage-openshift-io-v1alpha1-fusionaccess";

/// Time in-flight reviews get to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The serving certificate or key could not be loaded
    #[error("TLS config error: {0}")]
    Tls(String),

    /// The listener failed
    #[error("webhook server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Admission rules
    pub gate: AdmissionGate,
}

impl WebhookState {
    /// Wrap `gate` for the router
    pub fn new(gate: AdmissionGate) -> Self {
        Self { gate }
    }
}

/// Listener settings for the webhook server
#[derive(Clone, Debug)]
pub struct WebhookServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key
    pub key_path: PathBuf,
}

/// Router with the admission and health endpoints
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(VALIDATE_PATH, post(admission::validate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhook until `cancel` fires
pub async fn serve(
    config: WebhookServerConfig,
    state: Arc<WebhookState>,
    cancel: CancellationToken,
) -> Result<(), WebhookError> {
    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| {
            WebhookError::Tls(format!(
                "{} / {}: {e}",
                config.cert_path.display(),
                config.key_path.display()
            ))
        })?;

    let handle = Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(addr = %config.addr, "starting admission webhook server");
    axum_server::bind_rustls(config.addr, tls_config)
        .handle(handle)
        .serve(webhook_router(state).into_make_service())
        .await?;

    info!("admission webhook server stopped");
    Ok(())
}
