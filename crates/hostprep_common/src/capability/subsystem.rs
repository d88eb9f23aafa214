//! Virtualization subsystem: presence, version and default mode
//!
//! Three independent checks feed one gap. Remediation installs through the
//! artifact acquirer only, so the package handed to msiexec is always a
//! verified, content-addressed file.

use super::features::EXIT_RESTART_REQUIRED;
use super::{Capability, FailureReason, Gap, Outcome, ProbeFailure, ProvisionContext, StepId, StepState};
use crate::error::ExecError;
use crate::exec::{CommandOutput, CommandSpec};
use crate::version;
use async_trait::async_trait;
use regex::Regex;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, info, warn};

/// msiexec: installation succeeded and a reboot was started
const EXIT_REBOOT_INITIATED: i32 = 1641;

/// Everything the subsystem probe found wrong
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemGap {
    pub installed: bool,
    pub current: Option<String>,
    pub latest: Option<String>,
    pub outdated: bool,
    pub default_mode_wrong: bool,
}

impl SubsystemGap {
    pub fn needs_install(&self) -> bool {
        !self.installed || self.outdated
    }

    pub fn describe(&self) -> String {
        if !self.installed {
            return "WSL is not installed".to_string();
        }
        let mut parts = Vec::new();
        if self.outdated {
            parts.push(format!(
                "WSL {} is older than {}",
                self.current.as_deref().unwrap_or("(unknown version)"),
                self.latest.as_deref().unwrap_or("the latest release")
            ));
        }
        if self.default_mode_wrong {
            parts.push("default WSL version is not 2".to_string());
        }
        parts.join("; ")
    }
}

pub struct VirtualizationSubsystem {
    ctx: ProvisionContext,
}

impl VirtualizationSubsystem {
    pub fn new(ctx: ProvisionContext) -> Self {
        Self { ctx }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.config.subsystem.probe_timeout_secs)
    }

    fn wsl(&self, args: &[&str], timeout: Duration) -> CommandSpec {
        CommandSpec::new("wsl.exe", args.iter().copied(), timeout)
    }

    /// `Ok(None)` when WSL is absent, `Ok(Some(version))` when installed
    async fn installed_version(&self) -> Result<Option<Option<String>>, ProbeFailure> {
        let spec = self.wsl(&["--version"], self.probe_timeout());
        match self.ctx.runner.run(&spec).await {
            Ok(output) if output.success() => Ok(Some(parse_wsl_version(&output.stdout))),
            // inbox wsl.exe without the store package rejects --version
            Ok(output) => {
                debug!(exit = ?output.exit_code, "wsl --version failed, treating WSL as absent");
                Ok(None)
            }
            Err(ExecError::Spawn { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(ProbeFailure::new(
                FailureReason::from_exec(&e).unwrap_or(FailureReason::SubsystemStatusUnknown),
                format!("Could not query WSL: {}", e),
            )),
        }
    }

    async fn latest_version(&self) -> Option<String> {
        match self.ctx.subsystem_releases.latest().await {
            Ok(release) => Some(release.tag_version),
            Err(e) => {
                warn!(
                    source = %self.ctx.subsystem_releases.describe(),
                    "latest WSL version unknown: {}", e
                );
                None
            }
        }
    }

    async fn default_version(&self) -> Result<Option<u32>, ProbeFailure> {
        let spec = self.wsl(&["--status"], self.probe_timeout());
        let output = self.ctx.runner.run(&spec).await.map_err(|e| {
            ProbeFailure::new(
                FailureReason::from_exec(&e).unwrap_or(FailureReason::SubsystemStatusUnknown),
                format!("Could not read WSL status: {}", e),
            )
        })?;
        Ok(parse_default_version(&output.stdout))
    }

    async fn install(&self) -> Result<bool, Outcome> {
        let config = &self.ctx.config.subsystem;
        let acquired = self
            .ctx
            .acquirer
            .acquire(
                self.ctx.subsystem_releases.as_ref(),
                self.ctx.arch,
                &config.asset_extension,
                Duration::from_secs(config.download_timeout_secs),
                self.ctx.progress.as_ref(),
            )
            .await
            .map_err(|e| {
                Outcome::failed(
                    FailureReason::from_fetch(&e),
                    "Could not obtain a verified WSL installer",
                )
                .with_detail(e.to_string())
            })?;

        let package = acquired.artifact.file_path.to_string_lossy().into_owned();
        let spec = CommandSpec::new(
            "msiexec.exe",
            ["/i", package.as_str(), "/quiet", "/norestart"],
            Duration::from_secs(config.install_timeout_secs),
        );
        info!(version = %acquired.version, package = %package, "installing WSL");

        let output = self.ctx.runner.run(&spec).await.map_err(|e| {
            Outcome::failed(
                FailureReason::from_exec(&e)
                    .unwrap_or(FailureReason::SubsystemInstallFailed { exit_code: None }),
                "WSL installer could not be run",
            )
            .with_detail(e.to_string())
        })?;

        match output.exit_code {
            Some(0) => Ok(false),
            Some(EXIT_RESTART_REQUIRED) | Some(EXIT_REBOOT_INITIATED) => Ok(true),
            code => Err(Outcome::failed(
                FailureReason::SubsystemInstallFailed { exit_code: code },
                format!("WSL installer failed (exit {:?})", code),
            )
            .with_detail(output.combined().trim().to_string())),
        }
    }

    async fn set_default_mode(&self) -> Result<(), Outcome> {
        let config = &self.ctx.config.subsystem;
        let mode = config.required_default_version.to_string();
        let spec = self.wsl(
            &["--set-default-version", mode.as_str()],
            Duration::from_secs(config.set_mode_timeout_secs),
        );
        let output: CommandOutput = self.ctx.runner.run(&spec).await.map_err(|e| {
            Outcome::failed(
                FailureReason::from_exec(&e)
                    .unwrap_or(FailureReason::DefaultModeFailed { exit_code: None }),
                "Could not set the default WSL version",
            )
            .with_detail(e.to_string())
        })?;

        if output.success() {
            info!(mode = %mode, "default WSL version set");
            Ok(())
        } else {
            Err(Outcome::failed(
                FailureReason::DefaultModeFailed {
                    exit_code: output.exit_code,
                },
                format!("Could not set the default WSL version to {}", mode),
            )
            .with_detail(output.combined().trim().to_string()))
        }
    }
}

/// First version number on the `WSL version: x.y.z.w` line
pub fn parse_wsl_version(output: &str) -> Option<String> {
    let re = Regex::new(r"(?im)^\s*WSL[^:\r\n]*:\s*v?(\d+(?:\.\d+)*)").ok()?;
    re.captures(output).map(|caps| caps[1].to_string())
}

/// `Default Version: 2` from `wsl --status`
pub fn parse_default_version(output: &str) -> Option<u32> {
    let re = Regex::new(r"(?im)^\s*Default Version\s*:\s*(\d+)").ok()?;
    re.captures(output).and_then(|caps| caps[1].parse().ok())
}

#[async_trait]
impl Capability for VirtualizationSubsystem {
    fn id(&self) -> StepId {
        StepId::Subsystem
    }

    async fn probe(&self) -> StepState {
        let config = &self.ctx.config.subsystem;
        let current = match self.installed_version().await {
            Ok(Some(current)) => current,
            Ok(None) => {
                return StepState::Unsatisfied(Gap::Subsystem(SubsystemGap {
                    installed: false,
                    current: None,
                    latest: None,
                    outdated: false,
                    default_mode_wrong: true,
                }))
            }
            Err(failure) => return StepState::Unknown(failure),
        };

        let latest = self.latest_version().await;
        let outdated = match current.as_deref() {
            Some(current) => version::update_required(
                current,
                latest.as_deref(),
                config.unknown_version_policy,
            ),
            None => {
                warn!(
                    policy = config.unknown_version_policy.as_str(),
                    "installed WSL version unreadable"
                );
                config.unknown_version_policy.decision()
            }
        };

        let default_mode = match self.default_version().await {
            Ok(mode) => mode,
            Err(failure) => return StepState::Unknown(failure),
        };
        let default_mode_wrong = default_mode != Some(config.required_default_version);

        debug!(
            current = ?current,
            latest = ?latest,
            outdated,
            default_mode = ?default_mode,
            "WSL probe"
        );

        if !outdated && !default_mode_wrong {
            return match version::undecided(current.as_deref(), latest.as_deref()) {
                Some(why) => StepState::Assumed(format!(
                    "WSL kept as installed ({}, policy {})",
                    why,
                    config.unknown_version_policy.as_str()
                )),
                None => StepState::Satisfied,
            };
        }
        StepState::Unsatisfied(Gap::Subsystem(SubsystemGap {
            installed: true,
            current,
            latest,
            outdated,
            default_mode_wrong,
        }))
    }

    async fn remediate(&self, gap: &Gap) -> Outcome {
        let Gap::Subsystem(gap) = gap else {
            return Outcome::failed(
                FailureReason::SubsystemStatusUnknown,
                format!("Unexpected gap for WSL: {}", gap.describe()),
            );
        };

        if gap.needs_install() {
            match self.install().await {
                Ok(true) => return Outcome::restart("WSL installed. Restart Windows to finish."),
                Ok(false) => {}
                Err(outcome) => return outcome,
            }
        }

        if !gap.installed || gap.default_mode_wrong {
            if let Err(outcome) = self.set_default_mode().await {
                return outcome;
            }
        }

        let message = match (gap.installed, gap.outdated) {
            (false, _) => "WSL installed",
            (true, true) => "WSL updated",
            (true, false) => "Default WSL version set",
        };
        Outcome::ok(message)
    }
}
