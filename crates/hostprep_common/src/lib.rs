//! Hostprep Common - provisioning engine for a WSL-based runtime
//!
//! Probes live host state, remediates what is missing in a fixed order, and
//! only ever installs artifacts whose sha256 matched a published digest.

pub mod acquire;
pub mod capability;
pub mod classifier;
pub mod config;
pub mod error;
pub mod exec;
pub mod exit_codes;
pub mod fetcher;
pub mod integrity;
pub mod logging;
pub mod orchestrator;
pub mod release;
pub mod reporter;
pub mod resolver;
pub mod store;
pub mod testing;
pub mod version;

pub use capability::{Capability, FailureReason, Gap, Outcome, ProvisionContext, StepId, StepState};
pub use classifier::{advisory, Advisory, ErrorCategory};
pub use config::ProvisionConfig;
pub use orchestrator::{AbortHandle, PipelineResult, StepOrchestrator, Terminal};
pub use reporter::{Reporter, StepPhase};
