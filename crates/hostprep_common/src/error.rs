//! Error types for the provisioning engine.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("unparseable version string: {0:?}")]
    Unparseable(String),
}

/// Failures of an external tool invocation.
///
/// A non-zero exit code is not an error here; it is returned in the output.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s and was terminated", .after.as_secs())]
    Timeout { program: String, after: Duration },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            ExecError::Spawn { source, .. } | ExecError::Io { source, .. } => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            ExecError::Timeout { .. } => false,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ReleaseError {
    #[error("release index unreachable: {0}")]
    Http(String),

    #[error("release index returned HTTP {0}")]
    Status(u16),

    #[error("malformed release metadata: {0}")]
    Malformed(String),

    #[error("no asset matching *{extension} in release {tag}")]
    AssetNotFound { tag: String, extension: String },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("download timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("verification failed: no expected sha256 digest published for {asset}")]
    MissingDigest { asset: String },

    #[error("verification failed for {asset}: expected sha256 {expected}, got {actual}")]
    VerificationFailed {
        asset: String,
        expected: String,
        actual: String,
    },

    #[error("staging error at {}: {source}", .path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Release(#[from] ReleaseError),
}

impl FetchError {
    /// Verification failures are always terminal and never downgraded
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            FetchError::MissingDigest { .. } | FetchError::VerificationFailed { .. }
        )
    }
}
