//! Companion application must not be running
//!
//! No remediation: closing another application is the operator's call. A
//! failed process query does not block the pipeline.

use super::{Capability, FailureReason, Gap, Outcome, ProbeFailure, StepId, StepState};
use async_trait::async_trait;
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, warn};

/// Process enumeration
pub trait ProcessTable: Send + Sync {
    /// Number of running processes whose image name equals `name`
    /// (case-insensitive)
    fn count_by_name(&self, name: &str) -> Result<usize, String>;
}

/// Process table backed by `sysinfo`
#[derive(Debug, Default)]
pub struct SysinfoProcessTable;

impl ProcessTable for SysinfoProcessTable {
    fn count_by_name(&self, name: &str) -> Result<usize, String> {
        let mut system = System::new();
        system.refresh_processes();
        let count = system
            .processes()
            .values()
            .filter(|p| p.name().eq_ignore_ascii_case(name))
            .count();
        debug!(process = name, count, "process scan");
        Ok(count)
    }
}

pub struct CompanionProcessCheck {
    processes: Arc<dyn ProcessTable>,
    process_name: String,
}

impl CompanionProcessCheck {
    pub fn new(processes: Arc<dyn ProcessTable>, process_name: String) -> Self {
        Self {
            processes,
            process_name,
        }
    }
}

#[async_trait]
impl Capability for CompanionProcessCheck {
    fn id(&self) -> StepId {
        StepId::CompanionProcess
    }

    fn unknown_blocks(&self) -> bool {
        false
    }

    async fn probe(&self) -> StepState {
        match self.processes.count_by_name(&self.process_name) {
            Ok(0) => StepState::Satisfied,
            Ok(count) => StepState::Unsatisfied(Gap::CompanionRunning {
                process: self.process_name.clone(),
                count,
            }),
            Err(e) => {
                warn!(process = %self.process_name, "could not enumerate processes: {}", e);
                StepState::Unknown(ProbeFailure::new(
                    FailureReason::ProcessQueryFailed,
                    format!("Could not check whether {} is running: {}", self.process_name, e),
                ))
            }
        }
    }

    async fn remediate(&self, gap: &Gap) -> Outcome {
        let (process, count) = match gap {
            Gap::CompanionRunning { process, count } => (process.clone(), *count),
            _ => (self.process_name.clone(), 0),
        };
        Outcome::failed(
            FailureReason::CompanionRunning {
                process: process.clone(),
                count,
            },
            format!(
                "{} is running. Quit it completely (including its tray icon), then run setup again.",
                process
            ),
        )
    }
}
