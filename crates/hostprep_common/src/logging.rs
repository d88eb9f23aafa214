//! Logging setup
//!
//! Two sinks: stderr for the operator and a plain-text file per run in the
//! per-user data directory. `HOSTPREP_LOG` overrides the filter.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};
use uuid::Uuid;

/// Environment variable holding an `EnvFilter` directive
pub const LOG_ENV: &str = "HOSTPREP_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Console UI with prompts
    Interactive,
    /// No prompts, log output only
    Quiet,
    /// No prompts, warnings and errors only
    VeryQuiet,
}

impl OutputMode {
    pub fn is_interactive(&self) -> bool {
        matches!(self, OutputMode::Interactive)
    }

    pub fn default_filter(&self) -> &'static str {
        match self {
            OutputMode::Interactive | OutputMode::Quiet => "info",
            OutputMode::VeryQuiet => "warn",
        }
    }

    /// Level for the stderr sink. The interactive console renders its own
    /// step output, so stderr only carries warnings there.
    fn stderr_level(&self) -> LevelFilter {
        match self {
            OutputMode::Interactive | OutputMode::VeryQuiet => LevelFilter::WARN,
            OutputMode::Quiet => LevelFilter::INFO,
        }
    }
}

pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hostprep")
        .join("logs")
}

pub fn log_file_path(dir: &Path, run_id: Uuid) -> PathBuf {
    dir.join(format!("hostprep-{}.log", run_id))
}

fn env_filter(mode: OutputMode, directive: Option<String>) -> EnvFilter {
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(mode.default_filter()))
}

/// Install the global subscriber and return the log file path
pub fn init_logging(mode: OutputMode, run_id: Uuid) -> Result<PathBuf> {
    let dir = log_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let path = log_file_path(&dir, run_id);
    let file = File::create(&path)
        .with_context(|| format!("Failed to create log file {}", path.display()))?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(mode.stderr_level());

    let file_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter(mode, std::env::var(LOG_ENV).ok()))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;

    tracing::info!(run_id = %run_id, log = %path.display(), "logging initialized");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filters() {
        assert_eq!(OutputMode::Interactive.default_filter(), "info");
        assert_eq!(OutputMode::Quiet.default_filter(), "info");
        assert_eq!(OutputMode::VeryQuiet.default_filter(), "warn");
        assert!(OutputMode::Interactive.is_interactive());
        assert!(!OutputMode::VeryQuiet.is_interactive());
    }

    #[test]
    fn test_log_file_is_named_after_run() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let path = log_file_path(tmp.path(), run_id);
        assert_eq!(path.parent(), Some(tmp.path()));
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some(format!("hostprep-{}.log", run_id).as_str())
        );
    }

    #[test]
    fn test_bad_directive_falls_back_to_mode_default() {
        let filter = env_filter(OutputMode::VeryQuiet, Some("hostprep=loud".to_string()));
        assert_eq!(filter.to_string(), "warn");
        let filter = env_filter(OutputMode::Quiet, Some("hostprep_common=debug".to_string()));
        assert_eq!(filter.to_string(), "hostprep_common=debug");
    }
}
