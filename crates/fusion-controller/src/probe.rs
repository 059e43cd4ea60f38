//! Image-pull probe
//!
//! Proves the registry credential works by scheduling a throwaway pod that
//! runs the product's test image and watching whether the kubelet manages to
//! pull it. The outcome is a value ([`ProbeOutcome`]) that the controller
//! records once in status; only infrastructure problems are errors.

use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, LocalObjectReference, Pod, PodSpec,
};
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fusion_common::Error;

use crate::client::KubeClient;

/// Fixed name of the probe pod
pub const PROBE_POD_NAME: &str = "fusion-image-check";

/// Waiting reasons that mean the kubelet gave up on the image
const PULL_FAILURE_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "ErrImageNeverPull",
    "RegistryUnavailable",
    "ImageInspectError",
];

/// Message prefix for pull failures
pub const PULL_FAILED_PREFIX: &str = "image pull failed";

/// Message for a probe that ran out of time
pub const TIMEOUT_MESSAGE: &str = "timeout waiting for image pull status";

/// Probe tuning
#[derive(Clone, Debug)]
pub struct ProbeSettings {
    /// Total time allowed for the pull
    pub timeout: Duration,
    /// Delay between pod status reads
    pub interval: Duration,
    /// Pull secret the pod references, if any
    pub pull_secret: Option<String>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(2),
            pull_secret: None,
        }
    }
}

/// What the probe found out
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A container reached Running, so the image was pulled
    Pullable,
    /// The pull failed or never finished; the message says which
    Unpullable(String),
}

impl ProbeOutcome {
    /// Whether the image could be pulled
    pub fn is_pullable(&self) -> bool {
        matches!(self, ProbeOutcome::Pullable)
    }

    /// Failure text, `None` when pullable
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ProbeOutcome::Pullable => None,
            ProbeOutcome::Unpullable(msg) => Some(msg),
        }
    }
}

/// Pull progress derived from one pod status snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PullState {
    /// Nothing conclusive yet
    Pending,
    /// Some container is running
    Pulled,
    /// Some container is stuck on a pull error
    Failed(String),
}

/// Build the probe pod for `image`
pub fn probe_pod(image: &str, pull_secret: Option<&str>, deadline: Duration) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(PROBE_POD_NAME.to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_string(),
                    fusion_common::FIELD_MANAGER.to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            active_deadline_seconds: Some(
                i64::try_from(deadline.as_secs().max(1)).unwrap_or(i64::MAX),
            ),
            image_pull_secrets: pull_secret.map(|name| {
                vec![LocalObjectReference {
                    name: name.to_string(),
                }]
            }),
            containers: vec![Container {
                name: "image-check".to_string(),
                image: Some(image.to_string()),
                image_pull_policy: Some("Always".to_string()),
                command: Some(vec!["sleep".to_string(), "3600".to_string()]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
}

/// Classify a pod status snapshot
///
/// A pull failure on any container wins over a running one.
pub fn classify(pod: &Pod) -> PullState {
    let mut running = false;
    for status in container_statuses(pod) {
        let Some(state) = &status.state else {
            continue;
        };
        if let Some(waiting) = &state.waiting {
            let reason = waiting.reason.as_deref().unwrap_or_default();
            if PULL_FAILURE_REASONS.contains(&reason) {
                let message = waiting.message.as_deref().unwrap_or_default();
                return PullState::Failed(format!("{PULL_FAILED_PREFIX}: {reason}/{message}"));
            }
        }
        if state.running.is_some() {
            running = true;
        }
    }
    if running {
        PullState::Pulled
    } else {
        PullState::Pending
    }
}

fn pod_image(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.as_deref())
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Whether a leftover check pod can stand in for a fresh one
///
/// Only a live pod for the same image qualifies. A finished pod, or one
/// already stuck on a pull error, reports on an earlier attempt.
fn adoptable(pod: &Pod, image: &str) -> bool {
    pod_image(pod) == Some(image)
        && !matches!(pod_phase(pod), Some("Failed") | Some("Succeeded"))
        && !matches!(classify(pod), PullState::Failed(_))
}

/// Launch the check pod, adopting a live leftover one that runs the same image
async fn launch(
    kube: &dyn KubeClient,
    namespace: &str,
    image: &str,
    settings: &ProbeSettings,
) -> Result<(), Error> {
    let pod = probe_pod(image, settings.pull_secret.as_deref(), settings.timeout);
    match kube.create_pod(namespace, &pod).await {
        Ok(()) => {
            info!(namespace, image, "launched image pull probe");
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            let existing = kube.get_pod(namespace, PROBE_POD_NAME).await?;
            match existing {
                Some(pod) if adoptable(&pod, image) => {
                    info!(namespace, image, "adopting existing image pull probe");
                    Ok(())
                }
                other => {
                    warn!(
                        namespace,
                        expected = image,
                        found = ?other.as_ref().and_then(pod_image),
                        phase = ?other.as_ref().and_then(pod_phase),
                        "stale image check pod found, deleting"
                    );
                    kube.delete_pod(namespace, PROBE_POD_NAME).await?;
                    Err(Error::probe(format!(
                        "stale pod {PROBE_POD_NAME} was deleted; retrying"
                    )))
                }
            }
        }
        Err(e) => Err(e),
    }
}

/// Check whether `image` can be pulled in `namespace`
///
/// Returns the outcome once a container runs, a pull error shows up, or the
/// deadline passes. Pod creation and status read errors are returned as
/// errors without retrying; the caller's requeue handles them. A cancelled
/// token aborts the wait promptly.
pub async fn check_image_pullable(
    kube: &dyn KubeClient,
    namespace: &str,
    image: &str,
    settings: &ProbeSettings,
    cancel: &CancellationToken,
) -> Result<ProbeOutcome, Error> {
    launch(kube, namespace, image, settings).await?;

    let deadline = tokio::time::Instant::now() + settings.timeout;
    let outcome = loop {
        let state = kube
            .get_pod(namespace, PROBE_POD_NAME)
            .await?
            .map(|pod| classify(&pod))
            .unwrap_or(PullState::Pending);

        match state {
            PullState::Pulled => break ProbeOutcome::Pullable,
            PullState::Failed(msg) => break ProbeOutcome::Unpullable(msg),
            PullState::Pending => debug!(namespace, image, "image pull still pending"),
        }

        if tokio::time::Instant::now() >= deadline {
            break ProbeOutcome::Unpullable(TIMEOUT_MESSAGE.to_string());
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled("image pull probe")),
            _ = tokio::time::sleep(settings.interval) => {}
        }
    };

    // Failed probes stay around for `kubectl describe`
    if outcome.is_pullable() {
        if let Err(e) = kube.delete_pod(namespace, PROBE_POD_NAME).await {
            warn!(namespace, error = %e, "failed to delete image pull probe pod");
        }
    }

    Ok(outcome)
}
