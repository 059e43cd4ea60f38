//! Controller runner - builds the FusionAccess controller future
//!
//! Returns boxed futures so the caller decides how to compose them with the
//! webhook server.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use fusion_common::crd::FusionAccess;
use fusion_controller::{error_policy, reconcile, Context, ControllerSettings};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the FusionAccess controller future
///
/// `cancel` is handed to the reconcile context; long waits inside a
/// reconcile stop when it fires.
pub fn build_fusion_access_controller(
    client: Client,
    settings: ControllerSettings,
    cancel: CancellationToken,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let ctx = Arc::new(
        Context::builder(client.clone(), settings)
            .cancellation(cancel)
            .build(),
    );
    let instances: Api<FusionAccess> = Api::all(client);

    tracing::info!("- FusionAccess controller");

    vec![Box::pin(
        Controller::new(
            instances,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("FusionAccess")),
    )]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
