//! Process exit codes for unattended runs

use crate::capability::StepId;
use crate::classifier::ErrorCategory;
use crate::orchestrator::Terminal;

pub const EXIT_SUCCESS: i32 = 0;
/// Anything the pipeline did not classify (start-up errors, panics)
pub const EXIT_UNEXPECTED: i32 = 1;
pub const EXIT_UNSUPPORTED_OS: i32 = 2;
pub const EXIT_RESTART_REQUIRED: i32 = 3;
pub const EXIT_FEATURES_FAILED: i32 = 4;
pub const EXIT_SUBSYSTEM_FAILED: i32 = 5;
pub const EXIT_COMPANION_RUNNING: i32 = 6;
pub const EXIT_IMAGE_FAILED: i32 = 7;
pub const EXIT_ABORTED: i32 = 8;

/// Exit code for a failure at `step`
pub fn for_step(step: StepId) -> i32 {
    match step {
        StepId::CompanionProcess => EXIT_COMPANION_RUNNING,
        StepId::OsVersion => EXIT_UNSUPPORTED_OS,
        StepId::OsFeatures => EXIT_FEATURES_FAILED,
        StepId::Subsystem => EXIT_SUBSYSTEM_FAILED,
        StepId::RuntimeImage => EXIT_IMAGE_FAILED,
    }
}

/// Exit code for a category. Cross-cutting categories (network, timeout,
/// verification, ...) take the code of the step they happened in.
pub fn for_category(category: ErrorCategory, step: StepId) -> i32 {
    match category {
        ErrorCategory::OsVersion => EXIT_UNSUPPORTED_OS,
        ErrorCategory::OsFeatures => EXIT_FEATURES_FAILED,
        ErrorCategory::SubsystemNotInstalled
        | ErrorCategory::SubsystemVersionMismatch
        | ErrorCategory::SubsystemInstallFailed
        | ErrorCategory::SubsystemStatusUnknown => EXIT_SUBSYSTEM_FAILED,
        ErrorCategory::CompanionRunning => EXIT_COMPANION_RUNNING,
        ErrorCategory::ImageInstallFailed | ErrorCategory::ImageVersionUnknown => {
            EXIT_IMAGE_FAILED
        }
        ErrorCategory::UserDeclined => EXIT_ABORTED,
        ErrorCategory::Network
        | ErrorCategory::Permission
        | ErrorCategory::Verification
        | ErrorCategory::Timeout
        | ErrorCategory::Unknown => for_step(step),
    }
}

pub fn exit_code(terminal: &Terminal) -> i32 {
    match terminal {
        Terminal::Completed { .. } => EXIT_SUCCESS,
        Terminal::RestartRequired { .. } => EXIT_RESTART_REQUIRED,
        Terminal::Aborted { .. } => EXIT_ABORTED,
        Terminal::HaltedAt { step, category } => for_category(*category, *step),
    }
}
