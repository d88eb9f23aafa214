//! Windows optional features (WSL and the virtual machine platform)
//!
//! Idempotent per feature: remediation re-reads each feature's state and
//! only calls the enable action for features that are still disabled.

use super::{Capability, FailureReason, Gap, Outcome, ProbeFailure, ProvisionContext, StepId, StepState};
use crate::error::ExecError;
use crate::exec::{CommandOutput, CommandSpec};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// Exit code Windows installers use for "succeeded, reboot required"
pub const EXIT_RESTART_REQUIRED: i32 = 3010;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureState {
    Enabled,
    /// Enabled, waiting for a reboot
    EnablePending,
    Disabled,
}

impl FeatureState {
    /// Parse the `State : ...` line of `dism /get-featureinfo`
    pub fn parse(output: &str) -> Option<Self> {
        output.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if !key.trim().eq_ignore_ascii_case("state") {
                return None;
            }
            match value.trim().to_ascii_lowercase().as_str() {
                "enabled" => Some(FeatureState::Enabled),
                "enable pending" => Some(FeatureState::EnablePending),
                "disabled" | "disable pending" | "disabled with payload removed" => {
                    Some(FeatureState::Disabled)
                }
                _ => None,
            }
        })
    }
}

pub struct OsFeatures {
    ctx: ProvisionContext,
}

impl OsFeatures {
    pub fn new(ctx: ProvisionContext) -> Self {
        Self { ctx }
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.config.features.query_timeout_secs)
    }

    fn enable_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.config.features.enable_timeout_secs)
    }

    async fn query(&self, feature: &str) -> Result<FeatureState, ProbeFailure> {
        let spec = CommandSpec::new(
            "dism.exe",
            [
                "/online".to_string(),
                "/get-featureinfo".to_string(),
                format!("/featurename:{}", feature),
            ],
            self.query_timeout(),
        );
        let output = self.ctx.runner.run(&spec).await.map_err(|e| {
            let reason = FailureReason::from_exec(&e).unwrap_or(FailureReason::FeatureQueryFailed {
                feature: feature.to_string(),
            });
            ProbeFailure::new(reason, format!("Could not query feature {}: {}", feature, e))
        })?;

        if !output.success() {
            return Err(ProbeFailure::new(
                FailureReason::FeatureQueryFailed {
                    feature: feature.to_string(),
                },
                format!(
                    "dism could not query {} (exit {:?}): {}",
                    feature,
                    output.exit_code,
                    output.combined().trim()
                ),
            ));
        }

        FeatureState::parse(&output.stdout).ok_or_else(|| {
            ProbeFailure::new(
                FailureReason::FeatureQueryFailed {
                    feature: feature.to_string(),
                },
                format!("Unrecognized dism output for {}", feature),
            )
        })
    }

    async fn enable(&self, feature: &str) -> Result<bool, Outcome> {
        let spec = CommandSpec::new(
            "dism.exe",
            [
                "/online".to_string(),
                "/enable-feature".to_string(),
                format!("/featurename:{}", feature),
                "/all".to_string(),
                "/norestart".to_string(),
            ],
            self.enable_timeout(),
        );
        info!(feature, "enabling Windows feature");

        let output = self
            .ctx
            .runner
            .run(&spec)
            .await
            .map_err(|e| enable_error(feature, &e))?;
        interpret_enable(feature, &output)
    }
}

fn enable_error(feature: &str, error: &ExecError) -> Outcome {
    let reason = FailureReason::from_exec(error).unwrap_or(FailureReason::FeatureEnableFailed {
        feature: feature.to_string(),
        exit_code: None,
    });
    Outcome::failed(reason, format!("Failed to enable {}", feature)).with_detail(error.to_string())
}

/// `Ok(true)` when the feature is enabled but needs a reboot
fn interpret_enable(feature: &str, output: &CommandOutput) -> Result<bool, Outcome> {
    match output.exit_code {
        Some(0) => Ok(output.combined().to_ascii_lowercase().contains("restart")),
        Some(EXIT_RESTART_REQUIRED) => Ok(true),
        code => Err(Outcome::failed(
            FailureReason::FeatureEnableFailed {
                feature: feature.to_string(),
                exit_code: code,
            },
            format!("Failed to enable {} (exit {:?})", feature, code),
        )
        .with_detail(output.combined().trim().to_string())),
    }
}

#[async_trait]
impl Capability for OsFeatures {
    fn id(&self) -> StepId {
        StepId::OsFeatures
    }

    async fn probe(&self) -> StepState {
        let mut missing = Vec::new();
        for feature in &self.ctx.config.features.names {
            match self.query(feature).await {
                Ok(FeatureState::Enabled) => {}
                Ok(state) => missing.push((feature.clone(), state)),
                Err(failure) => return StepState::Unknown(failure),
            }
        }

        if missing.is_empty() {
            StepState::Satisfied
        } else {
            StepState::Unsatisfied(Gap::FeaturesMissing {
                features: missing.into_iter().map(|(f, _)| f).collect(),
            })
        }
    }

    async fn remediate(&self, gap: &Gap) -> Outcome {
        let Gap::FeaturesMissing { features } = gap else {
            return Outcome::failed(
                FailureReason::FeatureQueryFailed {
                    feature: String::new(),
                },
                format!("Unexpected gap for Windows features: {}", gap.describe()),
            );
        };

        let mut restart = false;
        let mut enabled = Vec::new();
        for feature in features {
            match self.query(feature).await {
                Ok(FeatureState::Enabled) => {
                    info!(feature = %feature, "already enabled, skipping");
                    continue;
                }
                Ok(FeatureState::EnablePending) => {
                    info!(feature = %feature, "enable pending reboot");
                    restart = true;
                    continue;
                }
                Ok(FeatureState::Disabled) => {}
                Err(failure) => {
                    warn!(feature = %feature, "state unknown before enabling: {}", failure.message);
                }
            }

            match self.enable(feature).await {
                Ok(needs_restart) => {
                    restart |= needs_restart;
                    enabled.push(feature.clone());
                }
                Err(outcome) => return outcome,
            }
        }

        let message = if enabled.is_empty() {
            "Windows features already enabled".to_string()
        } else {
            format!("Enabled {}", enabled.join(", "))
        };
        if restart {
            Outcome::restart(format!("{}. Restart Windows to finish.", message))
        } else {
            Outcome::ok(message)
        }
    }
}
