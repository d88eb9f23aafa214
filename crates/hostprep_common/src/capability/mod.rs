//! Capability probe/remediate pairs
//!
//! Each provisioned capability probes live system state and, when the probe
//! reports a gap, tries to close it:
//!
//! ```text
//! probe() -> Satisfied | Unsatisfied(gap) | Unknown(failure)
//! Satisfied   -> done, no remediation
//! Unsatisfied -> remediate(gap)
//! Unknown     -> soft failure; the orchestrator decides whether it blocks
//! ```
//!
//! Probes never mutate the system, so running the pipeline again after a
//! partial failure only remediates what is still missing.

mod companion;
mod features;
mod image;
mod os_version;
mod subsystem;

pub use companion::{CompanionProcessCheck, ProcessTable, SysinfoProcessTable};
pub use features::OsFeatures;
pub use image::{ImageGap, RuntimeImage};
pub use os_version::{HostInfo, HostInfoSource, OsVersionCheck, WindowsHostInfo};
pub use subsystem::{SubsystemGap, VirtualizationSubsystem};

use crate::acquire::ArtifactAcquirer;
use crate::config::ProvisionConfig;
use crate::error::{ExecError, FetchError, ReleaseError};
use crate::exec::CommandRunner;
use crate::fetcher::ProgressSink;
use crate::release::{GitHubReleaseSource, HostArch, ReleaseSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identity of a pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    CompanionProcess,
    OsVersion,
    OsFeatures,
    Subsystem,
    RuntimeImage,
}

impl StepId {
    pub const ALL: [StepId; 5] = [
        StepId::CompanionProcess,
        StepId::OsVersion,
        StepId::OsFeatures,
        StepId::Subsystem,
        StepId::RuntimeImage,
    ];

    /// Execution order, 1-based
    pub fn ordinal(&self) -> u8 {
        match self {
            StepId::CompanionProcess => 1,
            StepId::OsVersion => 2,
            StepId::OsFeatures => 3,
            StepId::Subsystem => 4,
            StepId::RuntimeImage => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::CompanionProcess => "companion_process",
            StepId::OsVersion => "os_version",
            StepId::OsFeatures => "os_features",
            StepId::Subsystem => "subsystem",
            StepId::RuntimeImage => "runtime_image",
        }
    }

    /// Display name for UI
    pub fn display_name(&self) -> &'static str {
        match self {
            StepId::CompanionProcess => "Conflicting application closed",
            StepId::OsVersion => "Windows version",
            StepId::OsFeatures => "Windows features",
            StepId::Subsystem => "WSL installation",
            StepId::RuntimeImage => "Runtime image",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed reason code for a failed probe or remediation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    UnsupportedArchitecture { arch: HostArch },
    OsBuildTooOld { build: u32, minimum: u32 },
    OsQueryFailed,
    FeatureQueryFailed { feature: String },
    FeatureEnableFailed { feature: String, exit_code: Option<i32> },
    SubsystemNotInstalled,
    SubsystemOutdated { current: String, latest: String },
    SubsystemInstallFailed { exit_code: Option<i32> },
    SubsystemStatusUnknown,
    DefaultModeFailed { exit_code: Option<i32> },
    CompanionRunning { process: String, count: usize },
    ProcessQueryFailed,
    ImageInstallFailed { exit_code: Option<i32> },
    ImageUnregisterFailed { exit_code: Option<i32> },
    ImageVersionUnknown,
    ImageSetupFailed,
    ReleaseUnavailable,
    AssetNotFound,
    DownloadFailed,
    VerificationFailed,
    Timeout { program: String },
    PermissionDenied,
}

impl FailureReason {
    pub fn from_exec(error: &ExecError) -> Option<Self> {
        match error {
            ExecError::Timeout { program, .. } => Some(FailureReason::Timeout {
                program: program.clone(),
            }),
            e if e.is_permission_denied() => Some(FailureReason::PermissionDenied),
            _ => None,
        }
    }

    pub fn from_fetch(error: &FetchError) -> Self {
        match error {
            FetchError::MissingDigest { .. } | FetchError::VerificationFailed { .. } => {
                FailureReason::VerificationFailed
            }
            FetchError::Download(_) => FailureReason::DownloadFailed,
            FetchError::Timeout(_) => FailureReason::Timeout {
                program: "download".to_string(),
            },
            FetchError::Staging { source, .. }
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                FailureReason::PermissionDenied
            }
            FetchError::Staging { .. } => FailureReason::DownloadFailed,
            FetchError::Release(e) => Self::from_release(e),
        }
    }

    pub fn from_release(error: &ReleaseError) -> Self {
        match error {
            ReleaseError::AssetNotFound { .. } => FailureReason::AssetNotFound,
            _ => FailureReason::ReleaseUnavailable,
        }
    }
}

/// Why a probe could not decide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl ProbeFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// What a probe found missing; handed to the matching remediation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gap {
    CompanionRunning { process: String, count: usize },
    OsUnsupported { reason: FailureReason, description: String },
    FeaturesMissing { features: Vec<String> },
    Subsystem(SubsystemGap),
    Image(ImageGap),
}

impl Gap {
    pub fn describe(&self) -> String {
        match self {
            Gap::CompanionRunning { process, count } => {
                format!("{} is running ({} process(es))", process, count)
            }
            Gap::OsUnsupported { description, .. } => description.clone(),
            Gap::FeaturesMissing { features } => {
                format!("Windows features not enabled: {}", features.join(", "))
            }
            Gap::Subsystem(gap) => gap.describe(),
            Gap::Image(gap) => gap.describe(),
        }
    }
}

/// Result of probing a capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepState {
    Satisfied,
    /// Nothing to remediate, but only because a version policy decided it;
    /// the note says which check could not run
    Assumed(String),
    Unsatisfied(Gap),
    Unknown(ProbeFailure),
}

impl StepState {
    /// No remediation needed, whether verified or assumed
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StepState::Satisfied | StepState::Assumed(_))
    }
}

/// Result of a step: a skipped, successful or failed remediation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub requires_restart: bool,
    pub message: String,
    pub error_detail: Option<String>,
    pub reason: Option<FailureReason>,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            requires_restart: false,
            message: message.into(),
            error_detail: None,
            reason: None,
        }
    }

    pub fn restart(message: impl Into<String>) -> Self {
        Self {
            requires_restart: true,
            ..Self::ok(message)
        }
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            success: false,
            requires_restart: false,
            message: message.into(),
            error_detail: None,
            reason: Some(reason),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

/// A provisioned capability
#[async_trait]
pub trait Capability: Send + Sync {
    fn id(&self) -> StepId;

    /// Whether an `Unknown` probe result halts the pipeline
    fn unknown_blocks(&self) -> bool {
        true
    }

    /// Inspect live state without side effects
    async fn probe(&self) -> StepState;

    /// Try to close `gap`; called at most once per run
    async fn remediate(&self, gap: &Gap) -> Outcome;
}

/// Collaborators shared by all capabilities
#[derive(Clone)]
pub struct ProvisionContext {
    pub config: Arc<ProvisionConfig>,
    pub runner: Arc<dyn CommandRunner>,
    pub acquirer: Arc<ArtifactAcquirer>,
    pub progress: Arc<dyn ProgressSink>,
    pub arch: HostArch,
    pub subsystem_releases: Arc<dyn ReleaseSource>,
    pub image_releases: Arc<dyn ReleaseSource>,
}

impl ProvisionContext {
    /// Context whose release indexes are the endpoints named in `config`
    pub fn new(
        config: Arc<ProvisionConfig>,
        runner: Arc<dyn CommandRunner>,
        acquirer: Arc<ArtifactAcquirer>,
        progress: Arc<dyn ProgressSink>,
        arch: HostArch,
    ) -> Self {
        let timeout = config.release_index_timeout();
        let subsystem_releases: Arc<dyn ReleaseSource> = Arc::new(GitHubReleaseSource::new(
            config.subsystem.release_index_url.clone(),
            timeout,
        ));
        let image_releases: Arc<dyn ReleaseSource> = Arc::new(GitHubReleaseSource::new(
            config.image.release_index_url.clone(),
            timeout,
        ));
        Self {
            config,
            runner,
            acquirer,
            progress,
            arch,
            subsystem_releases,
            image_releases,
        }
    }

    pub fn with_release_sources(
        mut self,
        subsystem: Arc<dyn ReleaseSource>,
        image: Arc<dyn ReleaseSource>,
    ) -> Self {
        self.subsystem_releases = subsystem;
        self.image_releases = image;
        self
    }
}

/// The default five-step pipeline in execution order
pub fn standard_steps(
    ctx: &ProvisionContext,
    host: Arc<dyn HostInfoSource>,
    processes: Arc<dyn ProcessTable>,
) -> Vec<Arc<dyn Capability>> {
    let mut steps: Vec<Arc<dyn Capability>> = vec![
        Arc::new(CompanionProcessCheck::new(
            processes,
            ctx.config.companion.process_name.clone(),
        )),
        Arc::new(OsVersionCheck::new(host, ctx.config.os.clone())),
        Arc::new(OsFeatures::new(ctx.clone())),
        Arc::new(VirtualizationSubsystem::new(ctx.clone())),
        Arc::new(RuntimeImage::new(ctx.clone())),
    ];
    steps.sort_by_key(|s| s.id().ordinal());
    steps
}
