//! Fusion Access Operator - installs IBM Storage Scale on OpenShift

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use fusion_common::crd::FusionAccess;
use fusion_common::kube_utils::create_client;
use fusion_common::telemetry::{init_telemetry, TelemetryConfig};
use fusion_controller::client::KubeClientImpl;
use fusion_operator::config::OperatorConfig;
use fusion_operator::controller_runner::build_fusion_access_controller;
use fusion_operator::startup::ensure_crds_installed;
use fusion_operator::webhook::{
    self, AdmissionGate, KubeAdmissionLookup, WebhookServerConfig, WebhookState,
};

type Task = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Fusion Access - operator for IBM Storage Scale on OpenShift
#[derive(Parser, Debug)]
#[command(name = "fusion-access-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run the FusionAccess controller (default mode)
    Controller,
    /// Run only the validating admission webhook
    Webhook,
    /// Run the controller and the webhook in one process
    All,
}

impl Commands {
    fn runs_controller(self) -> bool {
        matches!(self, Commands::Controller | Commands::All)
    }

    fn runs_webhook(self) -> bool {
        matches!(self, Commands::Webhook | Commands::All)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS is set up (kube client and webhook)
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The operator cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&FusionAccess::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    let mode = cli.command.unwrap_or(Commands::Controller);
    run(cli.config, mode).await
}

async fn run(config: OperatorConfig, mode: Commands) -> anyhow::Result<()> {
    tracing::info!(
        ?mode,
        namespace = %config.namespace,
        policy = %config.policy(),
        "Fusion Access operator starting..."
    );

    let client = create_client(config.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let mut tasks: Vec<Task> = Vec::new();

    if mode.runs_controller() {
        // Operator installs its own CRDs on startup
        ensure_crds_installed(&client).await?;

        tracing::info!("Starting controllers...");
        for controller in build_fusion_access_controller(
            client.clone(),
            config.controller_settings(),
            cancel.clone(),
        ) {
            tasks.push(Box::pin(async move {
                controller.await;
                Ok(())
            }));
        }
    }

    if mode.runs_webhook() {
        tasks.push(webhook_task(client, &config, cancel.clone()));
    }

    // The first task to finish ends the process; the rest are told to stop
    let (result, _, _) = futures::future::select_all(tasks).await;
    cancel.cancel();
    tracing::info!("Fusion Access operator stopped");
    result
}

fn webhook_task(client: Client, config: &OperatorConfig, cancel: CancellationToken) -> Task {
    let lookup = KubeAdmissionLookup::new(Arc::new(KubeClientImpl::new(client)));
    let gate = AdmissionGate::new(Arc::new(lookup), config.policy());
    let state = Arc::new(WebhookState::new(gate));
    let server = WebhookServerConfig {
        addr: config.webhook_addr,
        cert_path: config.webhook_cert.clone(),
        key_path: config.webhook_key.clone(),
    };

    Box::pin(async move {
        webhook::serve(server, state, cancel)
            .await
            .map_err(|e| anyhow::anyhow!("Admission webhook failed: {}", e))
    })
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    token.cancel();
}
