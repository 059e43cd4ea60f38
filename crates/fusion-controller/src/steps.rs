//! Ordered reconcile steps
//!
//! The reconcile is a fixed sequence. Each step has a gate computed purely
//! from the FusionAccess resource, so a plan can be inspected and tested
//! without touching the cluster. Steps whose effect is already recorded in
//! status are `Satisfied`; steps switched off in spec are `Disabled`.

use std::fmt;

use fusion_common::crd::{FusionAccess, ImagePullCheck};

/// One reconcile step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    /// Evaluate product/platform compatibility
    VersionGate,
    /// One-time image-pull probe
    ImagePullCheck,
    /// MachineConfig rollout
    KernelConfig,
    /// Product manifest installation
    InstallManifests,
    /// Entitlement secret fan-out
    PropagateCredential,
    /// Console plugin resources and registration
    ConsolePlugin,
    /// LocalVolumeDiscovery object
    DiscoveryAgent,
    /// Storage Scale cluster object
    BackingCluster,
}

/// Whether a step should run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepGate {
    /// The step runs in this reconcile
    Pending,
    /// The step's effect is already recorded
    Satisfied,
    /// The step is switched off in spec
    Disabled,
}

impl Step {
    /// Execution order
    pub const ORDER: [Step; 8] = [
        Step::VersionGate,
        Step::ImagePullCheck,
        Step::KernelConfig,
        Step::InstallManifests,
        Step::PropagateCredential,
        Step::ConsolePlugin,
        Step::DiscoveryAgent,
        Step::BackingCluster,
    ];

    /// Stable name used in logs and span fields
    pub fn name(self) -> &'static str {
        match self {
            Step::VersionGate => "version-gate",
            Step::ImagePullCheck => "image-pull-check",
            Step::KernelConfig => "kernel-config",
            Step::InstallManifests => "install-manifests",
            Step::PropagateCredential => "propagate-credential",
            Step::ConsolePlugin => "console-plugin",
            Step::DiscoveryAgent => "discovery-agent",
            Step::BackingCluster => "backing-cluster",
        }
    }

    /// Gate for this step given the current resource
    pub fn gate(self, fa: &FusionAccess) -> StepGate {
        let enabled = |on: bool| if on { StepGate::Pending } else { StepGate::Disabled };
        match self {
            Step::ImagePullCheck => match fa.image_pull_check() {
                ImagePullCheck::NotRun => StepGate::Pending,
                ImagePullCheck::Success | ImagePullCheck::Failed => StepGate::Satisfied,
            },
            Step::KernelConfig => enabled(fa.spec.kernel_config.enabled),
            Step::DiscoveryAgent => enabled(fa.spec.discovery_agent.enabled),
            Step::BackingCluster => enabled(fa.spec.backing_cluster.enabled),
            Step::VersionGate
            | Step::InstallManifests
            | Step::PropagateCredential
            | Step::ConsolePlugin => StepGate::Pending,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Steps that run for `fa`, in execution order
pub fn plan(fa: &FusionAccess) -> Vec<Step> {
    Step::ORDER
        .into_iter()
        .filter(|step| step.gate(fa) == StepGate::Pending)
        .collect()
}
