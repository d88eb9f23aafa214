//! Step orchestration
//!
//! ```text
//! Idle -> Running(i) -> Running(i+1) | Halted(step, category) | RestartPending | Completed
//! ```
//!
//! Steps run strictly in order, one at a time. Each step is probed; an
//! unsatisfied step is remediated once and probed again to verify. A failure
//! halts the run, a restart request stops it, and a user abort is honoured
//! only between steps.

use crate::capability::{Capability, Outcome, ProbeFailure, StepId, StepState};
use crate::classifier::{self, ErrorCategory};
use crate::reporter::{Reporter, StepPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Between-steps cancellation flag
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Terminal {
    /// Every step satisfied; `warnings` lists steps that could not be verified
    Completed { warnings: Vec<StepId> },
    HaltedAt { step: StepId, category: ErrorCategory },
    /// Stop now and resume on the next invocation after a restart
    RestartRequired { step: StepId },
    /// Operator stopped the run before `step` started
    Aborted { step: StepId },
}

impl Terminal {
    pub fn is_success(&self) -> bool {
        matches!(self, Terminal::Completed { .. })
    }

    /// The category an advisory is shown for, if any
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Terminal::HaltedAt { category, .. } => Some(*category),
            Terminal::Aborted { .. } => Some(ErrorCategory::UserDeclined),
            Terminal::Completed { .. } | Terminal::RestartRequired { .. } => None,
        }
    }

    pub fn step(&self) -> Option<StepId> {
        match self {
            Terminal::Completed { .. } => None,
            Terminal::HaltedAt { step, .. }
            | Terminal::RestartRequired { step }
            | Terminal::Aborted { step } => Some(*step),
        }
    }
}

/// Ordered step outcomes plus the terminal classification of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries: Vec<(StepId, Outcome)>,
    pub terminal: Terminal,
}

impl PipelineResult {
    pub fn outcome(&self, step: StepId) -> Option<&Outcome> {
        self.entries
            .iter()
            .find(|(id, _)| *id == step)
            .map(|(_, outcome)| outcome)
    }

    /// Outcome of the step the run stopped at
    pub fn last_outcome(&self) -> Option<&Outcome> {
        self.entries.last().map(|(_, outcome)| outcome)
    }
}

enum StepEnd {
    Continue(Outcome),
    Warn(Outcome),
    Halt(Outcome, ErrorCategory),
    Restart(Outcome),
}

pub struct StepOrchestrator {
    steps: Vec<Arc<dyn Capability>>,
    reporter: Arc<dyn Reporter>,
}

impl StepOrchestrator {
    pub fn new(mut steps: Vec<Arc<dyn Capability>>, reporter: Arc<dyn Reporter>) -> Self {
        steps.sort_by_key(|s| s.id().ordinal());
        Self { steps, reporter }
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id()).collect()
    }

    /// First step in `states` that a full run would stop at or remediate
    pub fn first_blocking(&self, states: &[(StepId, StepState)]) -> Option<StepId> {
        states.iter().find_map(|(id, state)| {
            let blocks = match state {
                StepState::Satisfied | StepState::Assumed(_) => false,
                StepState::Unsatisfied(_) => true,
                StepState::Unknown(_) => self
                    .steps
                    .iter()
                    .find(|s| s.id() == *id)
                    .map(|s| s.unknown_blocks())
                    .unwrap_or(true),
            };
            blocks.then_some(*id)
        })
    }

    pub async fn run(&self, run_id: Uuid, abort: &AbortHandle) -> PipelineResult {
        let started_at = Utc::now();
        let mut entries = Vec::new();
        let mut warnings = Vec::new();
        let mut terminal = None;

        info!(run_id = %run_id, steps = self.steps.len(), "pipeline started");

        for step in &self.steps {
            let id = step.id();
            if abort.is_requested() {
                warn!(step = %id, "run aborted by operator");
                terminal = Some(Terminal::Aborted { step: id });
                break;
            }

            match self.run_step(step.as_ref()).await {
                StepEnd::Continue(outcome) => entries.push((id, outcome)),
                StepEnd::Warn(outcome) => {
                    warnings.push(id);
                    entries.push((id, outcome));
                }
                StepEnd::Halt(outcome, category) => {
                    entries.push((id, outcome));
                    terminal = Some(Terminal::HaltedAt { step: id, category });
                    break;
                }
                StepEnd::Restart(outcome) => {
                    entries.push((id, outcome));
                    terminal = Some(Terminal::RestartRequired { step: id });
                    break;
                }
            }
        }

        let terminal = terminal.unwrap_or(Terminal::Completed { warnings });
        info!(run_id = %run_id, terminal = ?terminal, "pipeline finished");

        PipelineResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            entries,
            terminal,
        }
    }

    /// Probe every step in order without remediating anything
    pub async fn probe_only(&self) -> Vec<(StepId, StepState)> {
        let mut states = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let id = step.id();
            self.reporter.on_step_update(id, StepPhase::Probing, "Checking");
            let state = step.probe().await;
            let (phase, message) = match &state {
                StepState::Satisfied => (StepPhase::Satisfied, "Satisfied".to_string()),
                StepState::Assumed(note) => (StepPhase::Warning, note.clone()),
                StepState::Unsatisfied(gap) => (StepPhase::Failed, gap.describe()),
                StepState::Unknown(failure) => (StepPhase::Warning, failure.message.clone()),
            };
            self.reporter.on_step_update(id, phase, &message);
            states.push((id, state));
        }
        states
    }

    async fn run_step(&self, step: &dyn Capability) -> StepEnd {
        let id = step.id();
        self.reporter
            .on_step_update(id, StepPhase::Probing, &format!("Checking {}", id.display_name()));

        let gap = match step.probe().await {
            StepState::Satisfied => {
                self.reporter
                    .on_step_update(id, StepPhase::Satisfied, "Already satisfied");
                return StepEnd::Continue(Outcome::ok("Already satisfied"));
            }
            StepState::Assumed(note) => {
                warn!(step = %id, "not verified, keeping current install: {}", note);
                self.reporter.on_step_update(id, StepPhase::Warning, &note);
                return StepEnd::Warn(Outcome::ok(format!("Not verified: {}", note)));
            }
            StepState::Unknown(failure) => return self.unknown(step, failure),
            StepState::Unsatisfied(gap) => gap,
        };

        self.reporter
            .on_step_update(id, StepPhase::Remediating, &gap.describe());
        let outcome = step.remediate(&gap).await;

        if !outcome.success {
            return self.halt(id, outcome);
        }
        if outcome.requires_restart {
            self.reporter
                .on_step_update(id, StepPhase::RestartRequired, &outcome.message);
            return StepEnd::Restart(outcome);
        }

        match step.probe().await {
            StepState::Satisfied => {
                self.reporter
                    .on_step_update(id, StepPhase::Succeeded, &outcome.message);
                StepEnd::Continue(outcome)
            }
            StepState::Assumed(note) => {
                warn!(step = %id, "remediated, but could not verify: {}", note);
                self.reporter.on_step_update(id, StepPhase::Warning, &note);
                StepEnd::Warn(outcome)
            }
            StepState::Unsatisfied(still) => {
                let failed = Outcome {
                    success: false,
                    requires_restart: false,
                    message: format!("Still not satisfied after remediation: {}", still.describe()),
                    error_detail: Some(outcome.message),
                    reason: None,
                };
                self.halt(id, failed)
            }
            StepState::Unknown(failure) => self.unknown(step, failure),
        }
    }

    fn unknown(&self, step: &dyn Capability, failure: ProbeFailure) -> StepEnd {
        let id = step.id();
        if step.unknown_blocks() {
            let outcome = Outcome::failed(failure.reason, failure.message);
            return self.halt(id, outcome);
        }

        warn!(step = %id, "could not verify, continuing: {}", failure.message);
        self.reporter
            .on_step_update(id, StepPhase::Warning, &failure.message);
        StepEnd::Warn(Outcome {
            success: true,
            requires_restart: false,
            message: format!("Could not verify: {}", failure.message),
            error_detail: None,
            reason: Some(failure.reason),
        })
    }

    fn halt(&self, id: StepId, outcome: Outcome) -> StepEnd {
        let text = match &outcome.error_detail {
            Some(detail) => format!("{}\n{}", outcome.message, detail),
            None => outcome.message.clone(),
        };
        let category = classifier::classify(id, outcome.reason.as_ref(), &text);
        self.reporter
            .on_step_update(id, StepPhase::Failed, &outcome.message);
        StepEnd::Halt(outcome, category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{FailureReason, Gap};
    use crate::reporter::RecordingReporter;
    use crate::testing::FakeCapability;

    fn features_gap() -> Gap {
        Gap::FeaturesMissing {
            features: vec!["VirtualMachinePlatform".to_string()],
        }
    }

    fn orchestrator(
        steps: Vec<Arc<FakeCapability>>,
    ) -> (StepOrchestrator, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::new());
        let steps = steps
            .into_iter()
            .map(|s| s as Arc<dyn Capability>)
            .collect();
        (StepOrchestrator::new(steps, reporter.clone()), reporter)
    }

    #[tokio::test]
    async fn test_steps_run_in_ordinal_order() {
        let image = Arc::new(FakeCapability::satisfied(StepId::RuntimeImage));
        let os = Arc::new(FakeCapability::satisfied(StepId::OsVersion));
        let (o, _) = orchestrator(vec![image, os]);
        assert_eq!(o.step_ids(), vec![StepId::OsVersion, StepId::RuntimeImage]);

        let result = o.run(Uuid::new_v4(), &AbortHandle::new()).await;
        assert_eq!(result.terminal, Terminal::Completed { warnings: vec![] });
        assert_eq!(result.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_remediation_is_verified() {
        let features = Arc::new(FakeCapability::missing(StepId::OsFeatures, features_gap()));
        let (o, reporter) = orchestrator(vec![features.clone()]);

        let result = o.run(Uuid::new_v4(), &AbortHandle::new()).await;
        assert!(result.terminal.is_success());
        assert_eq!(features.probes(), 2);
        assert_eq!(
            reporter.phases(StepId::OsFeatures),
            vec![StepPhase::Probing, StepPhase::Remediating, StepPhase::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_failed_verification_halts_without_second_remediation() {
        let features = Arc::new(
            FakeCapability::missing(StepId::OsFeatures, features_gap())
                .scripted(vec![
                    StepState::Unsatisfied(features_gap()),
                    StepState::Unsatisfied(features_gap()),
                ]),
        );
        let later = Arc::new(FakeCapability::satisfied(StepId::Subsystem));
        let (o, _) = orchestrator(vec![features.clone(), later.clone()]);

        let result = o.run(Uuid::new_v4(), &AbortHandle::new()).await;
        assert_eq!(
            result.terminal,
            Terminal::HaltedAt {
                step: StepId::OsFeatures,
                category: ErrorCategory::OsFeatures
            }
        );
        assert_eq!(features.remediations(), 1);
        assert_eq!(later.probes(), 0);
    }

    #[tokio::test]
    async fn test_unknown_blocks_unless_step_is_soft() {
        let unknown = || {
            StepState::Unknown(ProbeFailure::new(
                FailureReason::ProcessQueryFailed,
                "process list unavailable",
            ))
        };

        let soft = Arc::new(
            FakeCapability::satisfied(StepId::CompanionProcess)
                .non_blocking()
                .scripted(vec![unknown()]),
        );
        let next = Arc::new(FakeCapability::satisfied(StepId::OsVersion));
        let (o, reporter) = orchestrator(vec![soft, next.clone()]);
        let result = o.run(Uuid::new_v4(), &AbortHandle::new()).await;
        assert_eq!(
            result.terminal,
            Terminal::Completed {
                warnings: vec![StepId::CompanionProcess]
            }
        );
        assert_eq!(next.probes(), 1);
        assert!(reporter
            .phases(StepId::CompanionProcess)
            .contains(&StepPhase::Warning));

        let hard = Arc::new(
            FakeCapability::satisfied(StepId::OsVersion).scripted(vec![StepState::Unknown(
                ProbeFailure::new(FailureReason::OsQueryFailed, "ver failed"),
            )]),
        );
        let next = Arc::new(FakeCapability::satisfied(StepId::OsFeatures));
        let (o, _) = orchestrator(vec![hard, next.clone()]);
        let result = o.run(Uuid::new_v4(), &AbortHandle::new()).await;
        assert_eq!(
            result.terminal,
            Terminal::HaltedAt {
                step: StepId::OsVersion,
                category: ErrorCategory::OsVersion
            }
        );
        assert_eq!(next.probes(), 0);
    }

    #[tokio::test]
    async fn test_abort_is_honoured_between_steps() {
        let first = Arc::new(FakeCapability::satisfied(StepId::OsVersion));
        let second = Arc::new(FakeCapability::satisfied(StepId::OsFeatures));
        let (o, _) = orchestrator(vec![first.clone(), second.clone()]);

        let abort = AbortHandle::new();
        abort.request();
        let result = o.run(Uuid::new_v4(), &abort).await;
        assert_eq!(
            result.terminal,
            Terminal::Aborted {
                step: StepId::OsVersion
            }
        );
        assert_eq!(result.terminal.category(), Some(ErrorCategory::UserDeclined));
        assert!(result.entries.is_empty());
        assert_eq!(first.probes() + second.probes(), 0);
    }

    #[tokio::test]
    async fn test_untyped_failure_uses_message_keywords() {
        let step = Arc::new(
            FakeCapability::missing(StepId::Subsystem, features_gap()).with_outcome(Outcome {
                success: false,
                requires_restart: false,
                message: "installer failed".to_string(),
                error_detail: Some("Access is denied.".to_string()),
                reason: None,
            }),
        );
        let (o, _) = orchestrator(vec![step]);
        let result = o.run(Uuid::new_v4(), &AbortHandle::new()).await;
        assert_eq!(
            result.terminal,
            Terminal::HaltedAt {
                step: StepId::Subsystem,
                category: ErrorCategory::Permission
            }
        );
    }

    #[tokio::test]
    async fn test_probe_only_never_remediates() {
        let features = Arc::new(FakeCapability::missing(StepId::OsFeatures, features_gap()));
        let os = Arc::new(FakeCapability::satisfied(StepId::OsVersion));
        let (o, _) = orchestrator(vec![features.clone(), os]);

        let states = o.probe_only().await;
        assert_eq!(states.len(), 2);
        assert!(states[0].1.is_satisfied());
        assert!(!states[1].1.is_satisfied());
        assert_eq!(features.remediations(), 0);
    }

    #[tokio::test]
    async fn test_first_blocking_skips_soft_unknowns() {
        let companion = Arc::new(
            FakeCapability::satisfied(StepId::CompanionProcess)
                .scripted(vec![StepState::Unknown(ProbeFailure::new(
                    FailureReason::ProcessQueryFailed,
                    "access denied",
                ))])
                .non_blocking(),
        );
        let features = Arc::new(FakeCapability::missing(StepId::OsFeatures, features_gap()));
        let os = Arc::new(FakeCapability::satisfied(StepId::OsVersion));
        let (o, _) = orchestrator(vec![companion, os, features]);

        let states = o.probe_only().await;
        assert_eq!(o.first_blocking(&states), Some(StepId::OsFeatures));
        assert_eq!(o.first_blocking(&states[..2]), None);
    }

    #[tokio::test]
    async fn test_assumed_state_completes_with_warning() {
        let subsystem = Arc::new(
            FakeCapability::satisfied(StepId::Subsystem)
                .scripted(vec![StepState::Assumed("latest version unknown".to_string())]),
        );
        let os = Arc::new(FakeCapability::satisfied(StepId::OsVersion));
        let (o, reporter) = orchestrator(vec![subsystem.clone(), os]);

        let result = o.run(Uuid::new_v4(), &AbortHandle::new()).await;
        assert_eq!(
            result.terminal,
            Terminal::Completed {
                warnings: vec![StepId::Subsystem]
            }
        );
        assert_eq!(subsystem.remediations(), 0);
        assert_eq!(
            reporter.phases(StepId::Subsystem),
            vec![StepPhase::Probing, StepPhase::Warning]
        );
        let states = o.probe_only().await;
        assert_eq!(o.first_blocking(&states), None);
    }
}
