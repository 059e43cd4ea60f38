//! Kubernetes Event recording for the Fusion Access controller.
//!
//! Events show up in `kubectl describe fusionaccess` and are the place a
//! cluster admin looks first when the installation stalls. Publishing is
//! fire-and-forget: a failed event is logged and never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about a resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`.
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What the controller was doing (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event (tests, dry runs)
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// Declared product version is not supported on this platform
    pub const UNSUPPORTED_VERSION: &str = "UnsupportedVersion";
    /// Registry credential verified by pulling the test image
    pub const IMAGE_PULL_SUCCEEDED: &str = "ImagePullSucceeded";
    /// Test image could not be pulled
    pub const IMAGE_PULL_FAILED: &str = "ImagePullFailed";
    /// MachineConfig rollout finished
    pub const KERNEL_CONFIG_APPLIED: &str = "KernelConfigApplied";
    /// Product manifests applied
    pub const MANIFESTS_APPLIED: &str = "ManifestsApplied";
    /// Pull secret could not be written to some namespaces
    pub const PULL_SECRET_PROPAGATION_FAILED: &str = "PullSecretPropagationFailed";
    /// Backing Storage Scale cluster object created
    pub const BACKING_CLUSTER_CREATED: &str = "BackingClusterCreated";
    /// Another FusionAccess already owns the installation
    pub const DUPLICATE_INSTANCE: &str = "DuplicateInstance";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Compatibility evaluation
    pub const VERSION_CHECK: &str = "VersionCheck";
    /// Image-pull probe
    pub const PROBE: &str = "Probe";
    /// Creating or updating managed objects
    pub const INSTALL: &str = "Install";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reasons_are_pascal_case() {
        for reason in [
            reasons::UNSUPPORTED_VERSION,
            reasons::IMAGE_PULL_FAILED,
            reasons::BACKING_CLUSTER_CREATED,
            reasons::DUPLICATE_INSTANCE,
        ] {
            assert!(reason.chars().next().is_some_and(|c| c.is_ascii_uppercase()));
            assert!(!reason.contains(' '));
        }
    }

    #[tokio::test]
    async fn noop_publisher_accepts_events() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::UNSUPPORTED_VERSION,
                actions::VERSION_CHECK,
                Some("Storage Scale 5.1.5.0 is not supported on OpenShift 4.16.0".to_string()),
            )
            .await;
    }
}
