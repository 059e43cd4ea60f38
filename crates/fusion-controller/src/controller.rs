//! FusionAccess reconciliation
//!
//! Each reconcile re-reads the resource, checks that it is the one instance
//! allowed to drive the installation, and then runs the pending steps from
//! [`crate::steps::plan`] in order. Every step is idempotent, so a reconcile
//! that fails half way is simply run again by the controller runtime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use fusion_common::crd::{FusionAccess, FusionAccessStatus, ImagePullCheck};
use fusion_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use fusion_common::version::{
    unsupported_message, CompatibilityMatrix, VersionPolicy, VersionVerdict,
};
use fusion_common::{Error, DEFAULT_OPERATOR_NAMESPACE, DEFAULT_PULL_SECRET_NAME};

use crate::backing_cluster::{ensure_backing_cluster, BackingClusterState};
use crate::client::{
    read_platform_version, ClusterResources, ClusterResourcesImpl, KubeClient, KubeClientImpl,
};
use crate::console::{ensure_console_plugin, DEFAULT_PLUGIN_IMAGE};
use crate::discovery::apply_discovery_agent;
use crate::kernel::{apply_kernel_config, RolloutSettings};
use crate::manifests::{DirectoryManifestSource, ManifestSource};
use crate::probe::{check_image_pullable, ProbeOutcome, ProbeSettings};
use crate::secrets::{propagate_credential, CredentialSource, SecretCredentialSource};
use crate::steps::{plan, Step};

/// Name the controller reports events as
pub const CONTROLLER_NAME: &str = "fusion-access-controller";

/// Default delay before a successful reconcile runs again
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

/// Delay before a failed reconcile is retried
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Operator-wide settings, fixed at start-up
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Namespace the operator runs in; probe and discovery agent live here
    pub operator_namespace: String,
    /// Name of the operator's own pull secret
    pub pull_secret_name: String,
    /// Root of the per-version manifest directories
    pub manifest_dir: PathBuf,
    /// Console plugin image
    pub console_plugin_image: String,
    /// Image-pull probe tuning
    pub probe: ProbeSettings,
    /// MachineConfigPool rollout wait tuning
    pub rollout: RolloutSettings,
    /// Requeue delay after a successful reconcile
    pub resync: Duration,
    /// What to do with unsupported version combinations
    pub version_policy: VersionPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            pull_secret_name: DEFAULT_PULL_SECRET_NAME.to_string(),
            manifest_dir: PathBuf::from("/manifests"),
            console_plugin_image: DEFAULT_PLUGIN_IMAGE.to_string(),
            probe: ProbeSettings {
                pull_secret: Some(DEFAULT_PULL_SECRET_NAME.to_string()),
                ..Default::default()
            },
            rollout: RolloutSettings::default(),
            resync: DEFAULT_RESYNC,
            version_policy: VersionPolicy::default(),
        }
    }
}

/// Controller context shared by every reconcile
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, settings).build();
/// ```
pub struct Context {
    /// Typed Kubernetes operations
    pub kube: Arc<dyn KubeClient>,
    /// Untyped operations on objects owned by other operators
    pub resources: Arc<dyn ClusterResources>,
    /// Registry credential to propagate
    pub credentials: Arc<dyn CredentialSource>,
    /// Per-version install manifests
    pub manifests: Arc<dyn ManifestSource>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Product/platform compatibility table
    pub matrix: CompatibilityMatrix,
    /// Start-up settings
    pub settings: ControllerSettings,
    /// Cancelled on shutdown; interrupts long waits
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, settings: ControllerSettings) -> ContextBuilder {
        ContextBuilder::new(client, settings)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        resources: Arc<dyn ClusterResources>,
        credentials: Arc<dyn CredentialSource>,
        manifests: Arc<dyn ManifestSource>,
    ) -> Self {
        Self {
            kube,
            resources,
            credentials,
            manifests,
            events: Arc::new(fusion_common::events::NoopEventPublisher),
            matrix: CompatibilityMatrix::builtin(),
            settings: ControllerSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(reference, type_, reason, action, Some(note))
            .await;
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every collaborator defaults to the real implementation over `client`.
pub struct ContextBuilder {
    client: Client,
    settings: ControllerSettings,
    kube: Option<Arc<dyn KubeClient>>,
    resources: Option<Arc<dyn ClusterResources>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    manifests: Option<Arc<dyn ManifestSource>>,
    events: Option<Arc<dyn EventPublisher>>,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(client: Client, settings: ControllerSettings) -> Self {
        Self {
            client,
            settings,
            kube: None,
            resources: None,
            credentials: None,
            manifests: None,
            events: None,
            cancel: None,
        }
    }

    /// Override the typed Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the untyped resource client
    pub fn cluster_resources(mut self, resources: Arc<dyn ClusterResources>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Override where the registry credential is read from
    pub fn credential_source(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Override where manifests are loaded from
    pub fn manifest_source(mut self, manifests: Arc<dyn ManifestSource>) -> Self {
        self.manifests = Some(manifests);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a shutdown token with the rest of the process
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let credentials = self.credentials.unwrap_or_else(|| {
            Arc::new(SecretCredentialSource::new(
                kube.clone(),
                self.settings.operator_namespace.clone(),
                self.settings.pull_secret_name.clone(),
            ))
        });
        Context {
            resources: self
                .resources
                .unwrap_or_else(|| Arc::new(ClusterResourcesImpl::new(self.client.clone()))),
            manifests: self.manifests.unwrap_or_else(|| {
                Arc::new(DirectoryManifestSource::new(self.settings.manifest_dir.clone()))
            }),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))),
            kube,
            credentials,
            matrix: CompatibilityMatrix::builtin(),
            settings: self.settings,
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

/// Reconcile a FusionAccess resource
#[instrument(
    skip(trigger, ctx),
    fields(
        fusion_access = %trigger.name_any(),
        namespace = %trigger.namespace().unwrap_or_default()
    )
)]
pub async fn reconcile(trigger: Arc<FusionAccess>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = trigger.name_any();
    let namespace = trigger.namespace().unwrap_or_default();

    // The watch cache may be stale; status written earlier in this process must be seen
    let Some(fa) = ctx.kube.get_fusion_access(&namespace, &name).await? else {
        debug!("FusionAccess is gone, nothing to do");
        return Ok(Action::await_change());
    };

    if let Some(owner) = active_instance(&ctx.kube.list_fusion_access().await?) {
        if !is_same_instance(&owner, &fa) {
            let note = format!(
                "FusionAccess {}/{} already manages this cluster; ignoring this instance",
                owner.namespace().unwrap_or_default(),
                owner.name_any()
            );
            warn!(%note, "duplicate FusionAccess");
            ctx.publish(
                &fa.object_ref(&()),
                EventType::Warning,
                reasons::DUPLICATE_INSTANCE,
                actions::RECONCILE,
                note,
            )
            .await;
            return Ok(Action::await_change());
        }
    }

    let steps = plan(&fa);
    info!(steps = ?steps.iter().map(|s| s.name()).collect::<Vec<_>>(), "reconciling FusionAccess");

    for step in steps {
        let span = tracing::info_span!("step", step = step.name());
        run_step(step, &fa, &ctx).instrument(span).await?;
    }

    info!("FusionAccess reconciled");
    Ok(Action::requeue(ctx.settings.resync))
}

/// Requeue policy for failed reconciles
///
/// Validation and serialization errors wait for the resource to change;
/// everything else is retried after a fixed delay.
pub fn error_policy(fa: Arc<FusionAccess>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        fusion_access = %fa.name_any(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

/// The instance allowed to act: oldest creation time, then namespace/name
fn active_instance(instances: &[FusionAccess]) -> Option<FusionAccess> {
    instances
        .iter()
        .filter(|fa| fa.meta().deletion_timestamp.is_none())
        .min_by(|a, b| {
            let key = |fa: &FusionAccess| {
                (
                    fa.meta().creation_timestamp.clone().map(|t| t.0),
                    fa.namespace().unwrap_or_default(),
                    fa.name_any(),
                )
            };
            key(a).cmp(&key(b))
        })
        .cloned()
}

fn is_same_instance(a: &FusionAccess, b: &FusionAccess) -> bool {
    a.namespace() == b.namespace() && a.name_any() == b.name_any()
}

async fn run_step(step: Step, fa: &FusionAccess, ctx: &Context) -> Result<(), Error> {
    debug!("running step");
    match step {
        Step::VersionGate => check_version(fa, ctx).await,
        Step::ImagePullCheck => run_image_pull_check(fa, ctx).await,
        Step::KernelConfig => {
            apply_kernel_config(
                ctx.resources.as_ref(),
                &fa.spec.kernel_config,
                &ctx.settings.rollout,
                &ctx.cancel,
            )
            .await?;
            ctx.publish(
                &fa.object_ref(&()),
                EventType::Normal,
                reasons::KERNEL_CONFIG_APPLIED,
                actions::INSTALL,
                format!("MachineConfigPool {} updated", fa.spec.kernel_config.pool_name()),
            )
            .await;
            Ok(())
        }
        Step::InstallManifests => install_manifests(fa, ctx).await,
        Step::PropagateCredential => {
            propagate(fa, ctx).await;
            Ok(())
        }
        Step::ConsolePlugin => {
            ensure_console_plugin(
                ctx.resources.as_ref(),
                &ctx.settings.operator_namespace,
                &ctx.settings.console_plugin_image,
            )
            .await
        }
        Step::DiscoveryAgent => {
            apply_discovery_agent(ctx.resources.as_ref(), &ctx.settings.operator_namespace).await
        }
        Step::BackingCluster => {
            let state = ensure_backing_cluster(
                ctx.resources.as_ref(),
                &fa.spec.backing_cluster.daemon_node_selector(),
            )
            .await?;
            if state == BackingClusterState::Created {
                ctx.publish(
                    &fa.object_ref(&()),
                    EventType::Normal,
                    reasons::BACKING_CLUSTER_CREATED,
                    actions::INSTALL,
                    "created Storage Scale cluster ibm-spectrum-scale".to_string(),
                )
                .await;
            }
            Ok(())
        }
    }
}

async fn check_version(fa: &FusionAccess, ctx: &Context) -> Result<(), Error> {
    let policy = ctx.settings.version_policy;
    if !policy.is_checked() {
        return Ok(());
    }

    let product = &fa.spec.product_version;
    let platform = match read_platform_version(ctx.kube.as_ref()).await {
        Ok(platform) => platform,
        Err(e) if policy == VersionPolicy::Enforce => return Err(e),
        Err(e) => {
            warn!(error = %e, "platform version unknown, skipping compatibility check");
            return Ok(());
        }
    };

    let supported = ctx.matrix.is_supported(product, &platform);
    match policy.evaluate(supported) {
        VersionVerdict::Allowed => {
            debug!(product = %product, platform = %platform, "version combination supported");
            Ok(())
        }
        VersionVerdict::Warn => {
            let note = unsupported_message(product, &platform);
            warn!(product = %product, platform = %platform, "{note}");
            ctx.publish(
                &fa.object_ref(&()),
                EventType::Warning,
                reasons::UNSUPPORTED_VERSION,
                actions::VERSION_CHECK,
                note,
            )
            .await;
            Ok(())
        }
        VersionVerdict::Deny => {
            let note = unsupported_message(product, &platform);
            ctx.publish(
                &fa.object_ref(&()),
                EventType::Warning,
                reasons::UNSUPPORTED_VERSION,
                actions::VERSION_CHECK,
                note.clone(),
            )
            .await;
            Err(Error::validation_for_field(
                format!("FusionAccess {}", fa.name_any()),
                "spec.productVersion",
                note,
            ))
        }
    }
}

async fn run_image_pull_check(fa: &FusionAccess, ctx: &Context) -> Result<(), Error> {
    let image = ctx.matrix.test_image(&fa.spec.product_version)?;
    let outcome = check_image_pullable(
        ctx.kube.as_ref(),
        &ctx.settings.operator_namespace,
        &image,
        &ctx.settings.probe,
        &ctx.cancel,
    )
    .await?;

    let status = FusionAccessStatus {
        image_pull_check: if outcome.is_pullable() {
            ImagePullCheck::Success
        } else {
            ImagePullCheck::Failed
        },
        image_pull_error: outcome.error_message().map(str::to_string),
    };
    ctx.kube
        .patch_fusion_access_status(
            &fa.namespace().unwrap_or_default(),
            &fa.name_any(),
            &status,
        )
        .await?;

    let reference = fa.object_ref(&());
    match outcome {
        ProbeOutcome::Pullable => {
            info!(image = %image, "test image pulled");
            ctx.publish(
                &reference,
                EventType::Normal,
                reasons::IMAGE_PULL_SUCCEEDED,
                actions::PROBE,
                format!("pulled {image}"),
            )
            .await;
        }
        ProbeOutcome::Unpullable(msg) => {
            warn!(image = %image, error = %msg, "test image could not be pulled");
            ctx.publish(
                &reference,
                EventType::Warning,
                reasons::IMAGE_PULL_FAILED,
                actions::PROBE,
                msg,
            )
            .await;
        }
    }
    Ok(())
}

async fn install_manifests(fa: &FusionAccess, ctx: &Context) -> Result<(), Error> {
    let version = &fa.spec.product_version;
    let manifests = ctx.manifests.load(version).await?;
    ctx.resources.apply_manifests(&manifests).await?;
    info!(version = %version, count = manifests.len(), "applied product manifests");
    ctx.publish(
        &fa.object_ref(&()),
        EventType::Normal,
        reasons::MANIFESTS_APPLIED,
        actions::INSTALL,
        format!("applied {} manifests for Storage Scale {version}", manifests.len()),
    )
    .await;
    Ok(())
}

/// Best-effort credential propagation; failures never stop the reconcile
async fn propagate(fa: &FusionAccess, ctx: &Context) {
    let credential = match ctx.credentials.credential().await {
        Ok(Some(credential)) => credential,
        Ok(None) => {
            warn!(
                secret = %ctx.settings.pull_secret_name,
                "pull secret not found, skipping entitlement propagation"
            );
            return;
        }
        Err(e) => {
            warn!(error = %e, "cannot read pull secret, skipping entitlement propagation");
            return;
        }
    };

    match propagate_credential(ctx.kube.as_ref(), &credential).await {
        Ok(report) => debug!(writes = report.writes(), "entitlement secrets up to date"),
        Err(e) => {
            warn!(error = %e, "entitlement propagation incomplete");
            ctx.publish(
                &fa.object_ref(&()),
                EventType::Warning,
                reasons::PULL_SECRET_PROPAGATION_FAILED,
                actions::INSTALL,
                e.to_string(),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClusterResources, MockKubeClient};
    use crate::manifests::MockManifestSource;
    use crate::probe::probe_pod;
    use crate::secrets::MockCredentialSource;
    use async_trait::async_trait;
    use fusion_common::crd::{
        ClusterVersion, ClusterVersionSpec, ClusterVersionStatus, FusionAccessSpec, Release,
        UpdateHistory, UpdateState,
    };
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, Pod,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::chrono::{TimeZone, Utc};
    use kube::api::DynamicObject;
    use mockall::mock;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    mock! {
        Events {}

        #[async_trait]
        impl EventPublisher for Events {
            async fn publish(
                &self,
                resource_ref: &ObjectReference,
                type_: EventType,
                reason: &str,
                action: &str,
                note: Option<String>,
            );
        }
    }

    const NS: &str = "ibm-fusion-access";

    fn sample(name: &str, version: &str) -> FusionAccess {
        let mut fa = FusionAccess::new(
            name,
            FusionAccessSpec {
                product_version: version.to_string(),
                ..Default::default()
            },
        );
        fa.metadata.namespace = Some(NS.to_string());
        fa
    }

    fn created_at(mut fa: FusionAccess, secs: i64) -> FusionAccess {
        fa.metadata.creation_timestamp = Utc.timestamp_opt(secs, 0).single().map(Time);
        fa
    }

    fn cluster_version(version: &str) -> ClusterVersion {
        let mut cv = ClusterVersion::new("version", ClusterVersionSpec::default());
        cv.status = Some(ClusterVersionStatus {
            desired: Release {
                version: version.to_string(),
                image: None,
            },
            history: vec![UpdateHistory {
                state: UpdateState::Completed,
                version: version.to_string(),
            }],
        });
        cv
    }

    fn probe_with_state(state: ContainerState) -> Pod {
        let mut pod = probe_pod("img", None, Duration::from_secs(60));
        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "image-check".to_string(),
                state: Some(state),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn running_probe() -> Pod {
        probe_with_state(ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        })
    }

    fn failed_probe() -> Pod {
        probe_with_state(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ErrImagePull".to_string()),
                message: Some("unauthorized".to_string()),
            }),
            ..Default::default()
        })
    }

    fn dynamic(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    fn console_config() -> DynamicObject {
        dynamic(json!({
            "apiVersion": "operator.openshift.io/v1",
            "kind": "Console",
            "metadata": { "name": "cluster" },
            "spec": { "plugins": ["fusion-access-console"] }
        }))
    }

    fn existing_scale_cluster() -> DynamicObject {
        dynamic(json!({
            "apiVersion": "scale.spectrum.ibm.com/v1beta1",
            "kind": "Cluster",
            "metadata": { "name": "ibm-spectrum-scale" },
            "spec": {}
        }))
    }

    /// Captured status updates, verified without coupling to mock internals
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<FusionAccessStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: FusionAccessStatus) {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .push(status);
        }

        fn last(&self) -> Option<FusionAccessStatus> {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
        }

        fn count(&self) -> usize {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .len()
        }
    }

    /// Shared state behind the kube mock: the stored resource plus counters
    #[derive(Clone)]
    struct Cluster {
        stored: Arc<Mutex<FusionAccess>>,
        status: StatusCapture,
        probes: Arc<AtomicU32>,
        secret_writes: Arc<AtomicU32>,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Cluster {
        fn new(fa: FusionAccess) -> Self {
            Self {
                stored: Arc::new(Mutex::new(fa)),
                status: StatusCapture::default(),
                probes: Arc::default(),
                secret_writes: Arc::default(),
                events: Arc::default(),
            }
        }

        fn trigger(&self) -> Arc<FusionAccess> {
            Arc::new(self.stored.lock().unwrap().clone())
        }

        fn kube(&self, platform: &'static str, probe: fn() -> Pod) -> MockKubeClient {
            self.kube_with(platform, probe, None)
        }

        fn kube_failing_secrets(
            &self,
            platform: &'static str,
            namespace: &'static str,
        ) -> MockKubeClient {
            self.kube_with(platform, running_probe, Some(namespace))
        }

        /// Kube mock whose stored FusionAccess reflects status patches
        fn kube_with(
            &self,
            platform: &'static str,
            probe: fn() -> Pod,
            failing_namespace: Option<&'static str>,
        ) -> MockKubeClient {
            let mut kube = MockKubeClient::new();

            let reader = self.stored.clone();
            kube.expect_get_fusion_access()
                .returning(move |_, _| Ok(Some(reader.lock().unwrap().clone())));
            let lister = self.stored.clone();
            kube.expect_list_fusion_access()
                .returning(move || Ok(vec![lister.lock().unwrap().clone()]));
            let writer = self.stored.clone();
            let capture = self.status.clone();
            kube.expect_patch_fusion_access_status()
                .returning(move |_, _, status| {
                    capture.record(status.clone());
                    writer.lock().unwrap().status = Some(status.clone());
                    Ok(())
                });
            kube.expect_get_cluster_version()
                .returning(move || Ok(Some(cluster_version(platform))));
            let probes = self.probes.clone();
            kube.expect_create_pod().returning(move |_, _| {
                probes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            kube.expect_get_pod().returning(move |_, _| Ok(Some(probe())));
            kube.expect_delete_pod().returning(|_, _| Ok(()));
            kube.expect_get_secret().returning(|_, _| Ok(None));
            let writes = self.secret_writes.clone();
            kube.expect_create_secret().returning(move |ns, _| {
                if Some(ns) == failing_namespace {
                    return Err(Error::internal("quota exceeded"));
                }
                writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            kube
        }

        /// Event mock recording every reason
        fn events(&self) -> MockEvents {
            let reasons = self.events.clone();
            let mut events = MockEvents::new();
            events.expect_publish().returning(move |_, _, reason, _, _| {
                reasons.lock().unwrap().push(reason.to_string());
            });
            events
        }

        fn event_count(&self, reason: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.as_str() == reason)
                .count()
        }
    }

    fn credentials() -> Arc<MockCredentialSource> {
        let mut source = MockCredentialSource::new();
        source
            .expect_credential()
            .returning(|| Ok(Some(b"{\"auths\":{}}".to_vec())));
        Arc::new(source)
    }

    fn manifests() -> Arc<MockManifestSource> {
        let mut source = MockManifestSource::new();
        source.expect_load().returning(|_| {
            Ok(vec![json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": "ibm-spectrum-scale" }
            })])
        });
        Arc::new(source)
    }

    /// Resources mock: console plugin already enabled, backing cluster as given
    fn resources(cluster_exists: bool) -> MockClusterResources {
        let mut resources = MockClusterResources::new();
        resources.expect_apply().returning(|_, _| Ok(()));
        resources.expect_apply_manifests().returning(|_| Ok(()));
        resources.expect_get().returning(move |key| {
            Ok(match key.api_resource.kind.as_str() {
                "Console" => Some(console_config()),
                "Cluster" if cluster_exists => Some(existing_scale_cluster()),
                _ => None,
            })
        });
        resources.expect_create().returning(|_, _| Ok(()));
        resources
    }

    fn context(
        cluster: &Cluster,
        kube: MockKubeClient,
        resources: MockClusterResources,
        credentials: Arc<dyn CredentialSource>,
    ) -> Context {
        let mut ctx = Context::for_testing(
            Arc::new(kube),
            Arc::new(resources),
            credentials,
            manifests(),
        );
        ctx.events = Arc::new(cluster.events());
        ctx
    }

    // ===== Lifecycle Flow Tests =====

    /// Story: a fresh FusionAccess runs the probe once, records Success, and
    /// settles into the periodic resync.
    #[tokio::test]
    async fn story_new_instance_records_probe_success_and_resyncs() {
        let cluster = Cluster::new(sample("fusionaccess-object", "5.2.2.0"));
        let ctx = Arc::new(context(
            &cluster,
            cluster.kube("4.16.3", running_probe),
            resources(false),
            credentials(),
        ));

        let action = reconcile(cluster.trigger(), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(DEFAULT_RESYNC));
        assert_eq!(
            cluster.status.last().map(|s| s.image_pull_check),
            Some(ImagePullCheck::Success)
        );
        assert_eq!(cluster.event_count(reasons::IMAGE_PULL_SUCCEEDED), 1);
        assert_eq!(cluster.event_count(reasons::MANIFESTS_APPLIED), 1);
        assert_eq!(cluster.secret_writes.load(Ordering::SeqCst), 4);
    }

    /// Story: a failed pull is recorded with its reason and the install still
    /// proceeds; the probe is not repeated on the next reconcile.
    #[tokio::test]
    async fn story_failed_probe_is_recorded_once() {
        let cluster = Cluster::new(sample("fusionaccess-object", "5.2.2.0"));
        let ctx = Arc::new(context(
            &cluster,
            cluster.kube("4.16.3", failed_probe),
            resources(false),
            credentials(),
        ));

        reconcile(cluster.trigger(), ctx.clone()).await.unwrap();
        reconcile(cluster.trigger(), ctx).await.unwrap();

        assert_eq!(cluster.probes.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.status.count(), 1);
        let status = cluster.status.last().unwrap();
        assert_eq!(status.image_pull_check, ImagePullCheck::Failed);
        assert!(status
            .image_pull_error
            .unwrap()
            .contains("image pull failed: ErrImagePull"));
        assert_eq!(cluster.event_count(reasons::IMAGE_PULL_FAILED), 1);
    }

    /// Story: after a manifest apply failure the next reconcile retries the
    /// manifests but neither re-runs the probe nor re-creates the cluster.
    #[tokio::test]
    async fn story_retry_after_manifest_failure_skips_completed_work() {
        let mut fa = sample("fusionaccess-object", "5.2.2.0");
        fa.spec.backing_cluster.enabled = true;
        let cluster = Cluster::new(fa);

        let manifest_calls = Arc::new(AtomicU32::new(0));
        let counter = manifest_calls.clone();
        let mut resources = MockClusterResources::new();
        resources.expect_apply().returning(|_, _| Ok(()));
        resources.expect_apply_manifests().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::internal("apiserver unavailable"))
            } else {
                Ok(())
            }
        });
        resources.expect_get().returning(|key| {
            Ok(match key.api_resource.kind.as_str() {
                "Console" => Some(console_config()),
                "Cluster" => Some(existing_scale_cluster()),
                _ => None,
            })
        });
        resources.expect_create().never();

        let ctx = Arc::new(context(
            &cluster,
            cluster.kube("4.16.3", running_probe),
            resources,
            credentials(),
        ));

        let err = reconcile(cluster.trigger(), ctx.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            error_policy(cluster.trigger(), &err, ctx.clone()),
            Action::requeue(ERROR_REQUEUE)
        );

        let action = reconcile(cluster.trigger(), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_RESYNC));
        assert_eq!(manifest_calls.load(Ordering::SeqCst), 2);
        assert_eq!(cluster.probes.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.status.count(), 1);
    }

    /// Story: with every optional step enabled, a missing backing cluster is
    /// created and announced with an event.
    #[tokio::test]
    async fn story_backing_cluster_created_when_absent() {
        let mut fa = sample("fusionaccess-object", "5.2.2.0");
        fa.spec.backing_cluster.enabled = true;
        fa.spec.discovery_agent.enabled = true;
        let cluster = Cluster::new(fa);

        let applied = Arc::new(Mutex::new(Vec::new()));
        let recorder = applied.clone();
        let mut resources = MockClusterResources::new();
        resources.expect_apply().returning(move |key, _| {
            recorder.lock().unwrap().push(key.api_resource.kind.clone());
            Ok(())
        });
        resources.expect_apply_manifests().returning(|_| Ok(()));
        resources.expect_get().returning(|key| {
            Ok(match key.api_resource.kind.as_str() {
                "Console" => Some(console_config()),
                _ => None,
            })
        });
        resources
            .expect_create()
            .withf(|key, _| key.name == "ibm-spectrum-scale")
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(context(
            &cluster,
            cluster.kube("4.16.3", running_probe),
            resources,
            credentials(),
        ));
        reconcile(cluster.trigger(), ctx).await.unwrap();

        assert!(applied
            .lock()
            .unwrap()
            .contains(&"LocalVolumeDiscovery".to_string()));
        assert_eq!(cluster.event_count(reasons::BACKING_CLUSTER_CREATED), 1);
    }

    // ===== Version Gate =====

    /// Story: under Enforce an unsupported combination stops the reconcile
    /// before anything is touched and waits for the resource to change.
    #[tokio::test]
    async fn story_enforced_version_gate_blocks_unsupported_platform() {
        let cluster = Cluster::new(sample("fusionaccess-object", "5.1.5.0"));
        let mut ctx = context(
            &cluster,
            cluster.kube("4.16.0", running_probe),
            MockClusterResources::new(),
            Arc::new(MockCredentialSource::new()),
        );
        ctx.settings.version_policy = VersionPolicy::Enforce;
        let ctx = Arc::new(ctx);

        let err = reconcile(cluster.trigger(), ctx.clone()).await.unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(error_policy(cluster.trigger(), &err, ctx), Action::await_change());
        assert_eq!(cluster.probes.load(Ordering::SeqCst), 0);
        assert_eq!(cluster.status.count(), 0);
        assert_eq!(cluster.event_count(reasons::UNSUPPORTED_VERSION), 1);
    }

    /// Story: the default WarnOnly policy warns with an event and installs anyway.
    #[tokio::test]
    async fn story_warn_only_version_gate_continues() {
        let cluster = Cluster::new(sample("fusionaccess-object", "5.1.5.0"));
        let ctx = Arc::new(context(
            &cluster,
            cluster.kube("4.16.0", running_probe),
            resources(false),
            credentials(),
        ));

        let action = reconcile(cluster.trigger(), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(DEFAULT_RESYNC));
        assert_eq!(cluster.event_count(reasons::UNSUPPORTED_VERSION), 1);
        assert_eq!(cluster.status.count(), 1);
    }

    #[tokio::test]
    async fn unreadable_platform_version_is_advisory_unless_enforced() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_cluster_version()
            .returning(|| Err(Error::internal("connection refused")));
        let mut ctx = Context::for_testing(
            Arc::new(kube),
            Arc::new(MockClusterResources::new()),
            Arc::new(MockCredentialSource::new()),
            Arc::new(MockManifestSource::new()),
        );
        let fa = sample("fusionaccess-object", "5.2.2.0");

        assert!(check_version(&fa, &ctx).await.is_ok());
        ctx.settings.version_policy = VersionPolicy::Enforce;
        assert!(check_version(&fa, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn ignore_policy_never_reads_the_platform() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_cluster_version().never();
        let mut ctx = Context::for_testing(
            Arc::new(kube),
            Arc::new(MockClusterResources::new()),
            Arc::new(MockCredentialSource::new()),
            Arc::new(MockManifestSource::new()),
        );
        ctx.settings.version_policy = VersionPolicy::Ignore;
        let fa = sample("fusionaccess-object", "1.0.0.0");
        assert!(check_version(&fa, &ctx).await.is_ok());
    }

    // ===== Edge Cases =====

    #[tokio::test]
    async fn deleted_resource_is_a_no_op() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_fusion_access().returning(|_, _| Ok(None));
        kube.expect_list_fusion_access().never();
        let ctx = Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(MockClusterResources::new()),
            Arc::new(MockCredentialSource::new()),
            Arc::new(MockManifestSource::new()),
        ));

        let action = reconcile(Arc::new(sample("gone", "5.2.2.0")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn unknown_product_version_stops_before_the_probe() {
        let cluster = Cluster::new(sample("fusionaccess-object", "9.9.9.9"));
        let ctx = Arc::new(context(
            &cluster,
            cluster.kube("4.16.0", running_probe),
            MockClusterResources::new(),
            Arc::new(MockCredentialSource::new()),
        ));

        let err = reconcile(cluster.trigger(), ctx.clone()).await.unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(error_policy(cluster.trigger(), &err, ctx), Action::await_change());
        assert_eq!(cluster.probes.load(Ordering::SeqCst), 0);
        assert_eq!(cluster.status.count(), 0);
    }

    #[tokio::test]
    async fn missing_pull_secret_skips_propagation_without_failing() {
        let cluster = Cluster::new(sample("fusionaccess-object", "5.2.2.0"));
        let mut source = MockCredentialSource::new();
        source.expect_credential().returning(|| Ok(None));
        let ctx = Arc::new(context(
            &cluster,
            cluster.kube("4.16.3", running_probe),
            resources(false),
            Arc::new(source),
        ));

        let action = reconcile(cluster.trigger(), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(DEFAULT_RESYNC));
        assert_eq!(cluster.secret_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn partial_propagation_failure_does_not_fail_the_reconcile() {
        let cluster = Cluster::new(sample("fusionaccess-object", "5.2.2.0"));
        let kube = cluster.kube_failing_secrets("4.16.3", "ibm-spectrum-scale-csi");

        let ctx = Arc::new(context(&cluster, kube, resources(false), credentials()));
        let action = reconcile(cluster.trigger(), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(DEFAULT_RESYNC));
        assert_eq!(cluster.event_count(reasons::PULL_SECRET_PROPAGATION_FAILED), 1);
    }

    // ===== Singleton =====

    #[test]
    fn oldest_instance_is_active() {
        let older = created_at(sample("b", "5.2.2.0"), 1_000);
        let newer = created_at(sample("a", "5.2.2.0"), 2_000);
        let active = active_instance(&[newer, older]).unwrap();
        assert_eq!(active.name_any(), "b");
    }

    #[test]
    fn creation_ties_break_on_name() {
        let first = created_at(sample("alpha", "5.2.2.0"), 1_000);
        let second = created_at(sample("beta", "5.2.2.0"), 1_000);
        let active = active_instance(&[second, first]).unwrap();
        assert_eq!(active.name_any(), "alpha");
    }

    /// Story: a second FusionAccess that slipped past admission is ignored
    /// with a warning event; nothing is installed on its behalf.
    #[tokio::test]
    async fn story_duplicate_instance_is_ignored() {
        let owner = created_at(sample("fusionaccess-object", "5.2.2.0"), 1_000);
        let duplicate = created_at(sample("second", "5.2.2.0"), 2_000);
        let cluster = Cluster::new(duplicate.clone());

        let mut kube = MockKubeClient::new();
        let dup = duplicate.clone();
        kube.expect_get_fusion_access()
            .returning(move |_, _| Ok(Some(dup.clone())));
        let all = vec![owner, duplicate.clone()];
        kube.expect_list_fusion_access()
            .returning(move || Ok(all.clone()));
        kube.expect_get_cluster_version().never();
        kube.expect_create_pod().never();

        let ctx = Arc::new(context(
            &cluster,
            kube,
            MockClusterResources::new(),
            Arc::new(MockCredentialSource::new()),
        ));

        let action = reconcile(Arc::new(duplicate), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cluster.event_count(reasons::DUPLICATE_INSTANCE), 1);
    }
}
