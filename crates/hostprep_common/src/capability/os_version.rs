//! Windows build and CPU architecture compatibility

use super::{Capability, FailureReason, Gap, Outcome, ProbeFailure, StepId, StepState};
use crate::config::OsConfig;
use crate::exec::{CommandRunner, CommandSpec};
use crate::release::HostArch;
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Host facts relevant to compatibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub arch: HostArch,
}

#[async_trait]
pub trait HostInfoSource: Send + Sync {
    async fn query(&self) -> Result<HostInfo, String>;
}

/// Reads the version from `cmd.exe /c ver` and the architecture from the
/// process environment
pub struct WindowsHostInfo {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl WindowsHostInfo {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Native architecture of the host. Under WOW64 the real value is in
    /// `PROCESSOR_ARCHITEW6432`.
    pub fn detect_arch(lookup: impl Fn(&str) -> Option<String>) -> Option<HostArch> {
        lookup("PROCESSOR_ARCHITEW6432")
            .or_else(|| lookup("PROCESSOR_ARCHITECTURE"))
            .and_then(|v| HostArch::parse(&v))
    }

    /// Parse `Microsoft Windows [Version 10.0.19045.3803]`
    pub fn parse_ver(output: &str) -> Option<(u32, u32, u32)> {
        let re = Regex::new(r"Version\s+(\d+)\.(\d+)\.(\d+)").ok()?;
        let caps = re.captures(output)?;
        Some((
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        ))
    }
}

#[async_trait]
impl HostInfoSource for WindowsHostInfo {
    async fn query(&self) -> Result<HostInfo, String> {
        let spec = CommandSpec::new("cmd.exe", ["/c", "ver"], self.timeout);
        let output = self.runner.run(&spec).await.map_err(|e| e.to_string())?;
        if !output.success() {
            return Err(format!("`{}` exited with {:?}", spec, output.exit_code));
        }
        let (major, minor, build) = Self::parse_ver(&output.stdout)
            .ok_or_else(|| format!("unrecognized version output: {:?}", output.stdout.trim()))?;
        let arch = Self::detect_arch(|k| std::env::var(k).ok())
            .or_else(|| HostArch::parse(std::env::consts::ARCH))
            .ok_or_else(|| "could not determine CPU architecture".to_string())?;
        Ok(HostInfo {
            major,
            minor,
            build,
            arch,
        })
    }
}

pub struct OsVersionCheck {
    host: Arc<dyn HostInfoSource>,
    config: OsConfig,
}

impl OsVersionCheck {
    pub fn new(host: Arc<dyn HostInfoSource>, config: OsConfig) -> Self {
        Self { host, config }
    }

    fn minimum_build(&self, arch: HostArch) -> Option<u32> {
        match arch {
            HostArch::X64 => Some(self.config.min_build_x64),
            HostArch::Arm64 => Some(self.config.min_build_arm64),
            HostArch::X86 => None,
        }
    }
}

#[async_trait]
impl Capability for OsVersionCheck {
    fn id(&self) -> StepId {
        StepId::OsVersion
    }

    async fn probe(&self) -> StepState {
        let info = match self.host.query().await {
            Ok(info) => info,
            Err(e) => {
                return StepState::Unknown(ProbeFailure::new(
                    FailureReason::OsQueryFailed,
                    format!("Could not determine the Windows version: {}", e),
                ))
            }
        };
        debug!(?info, "host info");

        let Some(minimum) = self.minimum_build(info.arch) else {
            return StepState::Unsatisfied(Gap::OsUnsupported {
                reason: FailureReason::UnsupportedArchitecture { arch: info.arch },
                description: format!("{} Windows is not supported", info.arch),
            });
        };

        if info.build < minimum {
            return StepState::Unsatisfied(Gap::OsUnsupported {
                reason: FailureReason::OsBuildTooOld {
                    build: info.build,
                    minimum,
                },
                description: format!(
                    "Windows {}.{} build {} is older than the required build {} for {}",
                    info.major, info.minor, info.build, minimum, info.arch
                ),
            });
        }

        info!(build = info.build, arch = %info.arch, "Windows version supported");
        StepState::Satisfied
    }

    async fn remediate(&self, gap: &Gap) -> Outcome {
        match gap {
            Gap::OsUnsupported {
                reason,
                description,
            } => Outcome::failed(reason.clone(), description.clone()),
            other => Outcome::failed(FailureReason::OsQueryFailed, other.describe()),
        }
    }
}
