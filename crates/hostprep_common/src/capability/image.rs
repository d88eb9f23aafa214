//! Runtime image: registered WSL distribution with a current release
//!
//! The probe walks registration, then the version marker inside the image,
//! then the marker contents. Every unsatisfied sub-state gets the same
//! remediation: acquire a verified image, unregister the old one, import,
//! and wait for first-boot setup to report completion.

use super::{Capability, FailureReason, Gap, Outcome, ProbeFailure, ProvisionContext, StepId, StepState};
use crate::exec::{Completion, CommandSpec, MarkerDetector};
use crate::version;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageGap {
    NotInstalled,
    /// Registered, but the version marker is missing or unparseable
    VersionUnreadable,
    Outdated { current: String, latest: String },
}

impl ImageGap {
    pub fn describe(&self) -> String {
        match self {
            ImageGap::NotInstalled => "Runtime image is not installed".to_string(),
            ImageGap::VersionUnreadable => {
                "Runtime image is installed but its version cannot be read".to_string()
            }
            ImageGap::Outdated { current, latest } => {
                format!("Runtime image {} is older than {}", current, latest)
            }
        }
    }

    fn registered(&self) -> bool {
        !matches!(self, ImageGap::NotInstalled)
    }
}

/// Version from the marker file: either a bare version or `KEY=version`
pub fn parse_marker(content: &str) -> Option<String> {
    let line = content.lines().map(str::trim).find(|l| !l.is_empty())?;
    let value = match line.split_once('=') {
        Some((_, v)) => v.trim().trim_matches('"'),
        None => line,
    };
    version::normalize(value).ok().map(|v| v.to_string())
}

pub struct RuntimeImage {
    ctx: ProvisionContext,
}

impl RuntimeImage {
    pub fn new(ctx: ProvisionContext) -> Self {
        Self { ctx }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.config.image.probe_timeout_secs)
    }

    fn distro(&self) -> &str {
        &self.ctx.config.image.distro_name
    }

    async fn registered(&self) -> Result<bool, ProbeFailure> {
        let spec = CommandSpec::new("wsl.exe", ["--list", "--quiet"], self.probe_timeout());
        let output = self.ctx.runner.run(&spec).await.map_err(|e| {
            ProbeFailure::new(
                FailureReason::from_exec(&e).unwrap_or(FailureReason::SubsystemStatusUnknown),
                format!("Could not list WSL distributions: {}", e),
            )
        })?;
        // wsl exits non-zero when no distribution is registered
        if !output.success() {
            debug!(exit = ?output.exit_code, "no distributions listed");
            return Ok(false);
        }
        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().trim_matches('\0'))
            .any(|l| l.eq_ignore_ascii_case(self.distro())))
    }

    async fn installed_version(&self) -> Result<Option<String>, ProbeFailure> {
        let spec = CommandSpec::new(
            "wsl.exe",
            [
                "-d",
                self.distro(),
                "--",
                "cat",
                self.ctx.config.image.version_marker_path.as_str(),
            ],
            self.probe_timeout(),
        );
        let output = self.ctx.runner.run(&spec).await.map_err(|e| {
            ProbeFailure::new(
                FailureReason::from_exec(&e).unwrap_or(FailureReason::ImageVersionUnknown),
                format!("Could not read the runtime image version: {}", e),
            )
        })?;
        if !output.success() {
            warn!(exit = ?output.exit_code, "version marker unreadable");
            return Ok(None);
        }
        Ok(parse_marker(&output.stdout))
    }

    async fn latest_version(&self) -> Option<String> {
        match self.ctx.image_releases.latest().await {
            Ok(release) => Some(release.tag_version),
            Err(e) => {
                warn!(
                    source = %self.ctx.image_releases.describe(),
                    "latest image version unknown: {}", e
                );
                None
            }
        }
    }

    async fn unregister(&self) -> Result<(), Outcome> {
        let spec = CommandSpec::new(
            "wsl.exe",
            ["--unregister", self.distro()],
            Duration::from_secs(self.ctx.config.image.unregister_timeout_secs),
        );
        info!(distro = %self.distro(), "unregistering previous image");
        let output = self.ctx.runner.run(&spec).await.map_err(|e| {
            Outcome::failed(
                FailureReason::from_exec(&e)
                    .unwrap_or(FailureReason::ImageUnregisterFailed { exit_code: None }),
                "Could not remove the previous runtime image",
            )
            .with_detail(e.to_string())
        })?;
        if output.success() {
            Ok(())
        } else {
            Err(Outcome::failed(
                FailureReason::ImageUnregisterFailed {
                    exit_code: output.exit_code,
                },
                "Could not remove the previous runtime image",
            )
            .with_detail(output.combined().trim().to_string()))
        }
    }

    async fn first_boot(&self) -> Result<(), Outcome> {
        let config = &self.ctx.config.image;
        let mut args = vec!["-d".to_string(), self.distro().to_string(), "--".to_string()];
        args.extend(config.first_boot_command.iter().cloned());
        let spec = CommandSpec::new(
            "wsl.exe",
            args,
            Duration::from_secs(config.first_boot_timeout_secs),
        );
        let detector = MarkerDetector::new(config.completion_marker.clone());

        let completion = self
            .ctx
            .runner
            .run_until(&spec, &detector)
            .await
            .map_err(|e| {
                Outcome::failed(
                    FailureReason::from_exec(&e).unwrap_or(FailureReason::ImageSetupFailed),
                    "First-boot setup did not complete",
                )
                .with_detail(e.to_string())
            })?;

        match completion {
            Completion::Signalled { .. } => {
                info!("first-boot setup complete");
                Ok(())
            }
            Completion::Exited {
                exit_code,
                transcript,
            } => Err(Outcome::failed(
                FailureReason::ImageSetupFailed,
                format!(
                    "First-boot setup exited ({:?}) without reporting completion",
                    exit_code
                ),
            )
            .with_detail(transcript.join("\n"))),
        }
    }
}

#[async_trait]
impl Capability for RuntimeImage {
    fn id(&self) -> StepId {
        StepId::RuntimeImage
    }

    async fn probe(&self) -> StepState {
        match self.registered().await {
            Ok(true) => {}
            Ok(false) => return StepState::Unsatisfied(Gap::Image(ImageGap::NotInstalled)),
            Err(failure) => return StepState::Unknown(failure),
        }

        let current = match self.installed_version().await {
            Ok(Some(current)) => current,
            Ok(None) => return StepState::Unsatisfied(Gap::Image(ImageGap::VersionUnreadable)),
            Err(failure) => return StepState::Unknown(failure),
        };

        let latest = self.latest_version().await;
        let policy = self.ctx.config.image.unknown_version_policy;
        if !version::update_required(&current, latest.as_deref(), policy) {
            debug!(current = %current, latest = ?latest, "runtime image current");
            return match version::undecided(Some(&current), latest.as_deref()) {
                Some(why) => StepState::Assumed(format!(
                    "runtime image {} kept ({}, policy {})",
                    current,
                    why,
                    policy.as_str()
                )),
                None => StepState::Satisfied,
            };
        }

        StepState::Unsatisfied(Gap::Image(ImageGap::Outdated {
            current,
            latest: latest.unwrap_or_else(|| "the latest release".to_string()),
        }))
    }

    async fn remediate(&self, gap: &Gap) -> Outcome {
        let Gap::Image(gap) = gap else {
            return Outcome::failed(
                FailureReason::ImageVersionUnknown,
                format!("Unexpected gap for the runtime image: {}", gap.describe()),
            );
        };
        let config = &self.ctx.config.image;

        let acquired = match self
            .ctx
            .acquirer
            .acquire(
                self.ctx.image_releases.as_ref(),
                self.ctx.arch,
                &config.asset_extension,
                Duration::from_secs(config.download_timeout_secs),
                self.ctx.progress.as_ref(),
            )
            .await
        {
            Ok(a) => a,
            Err(e) => {
                return Outcome::failed(
                    FailureReason::from_fetch(&e),
                    "Could not obtain a verified runtime image",
                )
                .with_detail(e.to_string())
            }
        };

        if gap.registered() {
            if let Err(outcome) = self.unregister().await {
                return outcome;
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(&config.install_dir).await {
            let reason = if e.kind() == std::io::ErrorKind::PermissionDenied {
                FailureReason::PermissionDenied
            } else {
                FailureReason::ImageInstallFailed { exit_code: None }
            };
            return Outcome::failed(
                reason,
                format!("Could not create {}", config.install_dir.display()),
            )
            .with_detail(e.to_string());
        }

        let install_dir = config.install_dir.to_string_lossy().into_owned();
        let image = acquired.artifact.file_path.to_string_lossy().into_owned();
        let spec = CommandSpec::new(
            "wsl.exe",
            [
                "--import",
                self.distro(),
                install_dir.as_str(),
                image.as_str(),
                "--version",
                "2",
            ],
            Duration::from_secs(config.import_timeout_secs),
        );
        info!(distro = %self.distro(), version = %acquired.version, "importing runtime image");

        match self.ctx.runner.run(&spec).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                return Outcome::failed(
                    FailureReason::ImageInstallFailed {
                        exit_code: output.exit_code,
                    },
                    format!("Runtime image import failed (exit {:?})", output.exit_code),
                )
                .with_detail(output.combined().trim().to_string())
            }
            Err(e) => {
                return Outcome::failed(
                    FailureReason::from_exec(&e)
                        .unwrap_or(FailureReason::ImageInstallFailed { exit_code: None }),
                    "Runtime image import could not be run",
                )
                .with_detail(e.to_string())
            }
        }

        if let Err(outcome) = self.first_boot().await {
            return outcome;
        }
        Outcome::ok(format!("Runtime image {} installed", acquired.version))
    }
}
