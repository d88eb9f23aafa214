//! Step update sink
//!
//! The orchestrator pushes every phase change here instead of touching any
//! presentation state directly.

use crate::capability::StepId;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Probing,
    Satisfied,
    Remediating,
    Succeeded,
    /// Could not be verified; the run continues
    Warning,
    Failed,
    RestartRequired,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Probing => "probing",
            StepPhase::Satisfied => "satisfied",
            StepPhase::Remediating => "remediating",
            StepPhase::Succeeded => "succeeded",
            StepPhase::Warning => "warning",
            StepPhase::Failed => "failed",
            StepPhase::RestartRequired => "restart_required",
        }
    }

    /// Phases after which the orchestrator moves on or stops
    pub fn is_final(&self) -> bool {
        !matches!(self, StepPhase::Probing | StepPhase::Remediating)
    }
}

pub trait Reporter: Send + Sync {
    fn on_step_update(&self, step: StepId, phase: StepPhase, message: &str);
}

/// Writes step updates to the log
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn on_step_update(&self, step: StepId, phase: StepPhase, message: &str) {
        match phase {
            StepPhase::Failed => error!(step = %step, phase = phase.as_str(), "{}", message),
            StepPhase::Warning | StepPhase::RestartRequired => {
                warn!(step = %step, phase = phase.as_str(), "{}", message)
            }
            _ => info!(step = %step, phase = phase.as_str(), "{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepEvent {
    pub step: StepId,
    pub phase: StepPhase,
    pub message: String,
}

/// Keeps every update in memory
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<StepEvent>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StepEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn phases(&self, step: StepId) -> Vec<StepPhase> {
        self.events()
            .into_iter()
            .filter(|e| e.step == step)
            .map(|e| e.phase)
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn on_step_update(&self, step: StepId, phase: StepPhase, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(StepEvent {
                step,
                phase,
                message: message.to_string(),
            });
        }
    }
}

/// Forwards updates to several reporters
pub struct FanoutReporter {
    sinks: Vec<std::sync::Arc<dyn Reporter>>,
}

impl FanoutReporter {
    pub fn new(sinks: Vec<std::sync::Arc<dyn Reporter>>) -> Self {
        Self { sinks }
    }
}

impl Reporter for FanoutReporter {
    fn on_step_update(&self, step: StepId, phase: StepPhase, message: &str) {
        for sink in &self.sinks {
            sink.on_step_update(step, phase, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(RecordingReporter::new());
        let b = Arc::new(RecordingReporter::new());
        let fanout = FanoutReporter::new(vec![a.clone(), b.clone(), Arc::new(TracingReporter)]);

        fanout.on_step_update(StepId::OsVersion, StepPhase::Probing, "checking");
        fanout.on_step_update(StepId::OsVersion, StepPhase::Satisfied, "build 22631");

        assert_eq!(a.phases(StepId::OsVersion), vec![StepPhase::Probing, StepPhase::Satisfied]);
        assert_eq!(b.events().len(), 2);
        assert!(a.phases(StepId::Subsystem).is_empty());
    }

    #[test]
    fn test_final_phases() {
        assert!(!StepPhase::Probing.is_final());
        assert!(!StepPhase::Remediating.is_final());
        assert!(StepPhase::Warning.is_final());
        assert!(StepPhase::RestartRequired.is_final());
    }
}
