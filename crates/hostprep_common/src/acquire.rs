//! Resolve, fetch and verify in one call
//!
//! Remediations that install something get their input only from here, so an
//! install can never see an artifact that skipped the integrity gate.

use crate::error::{FetchError, ReleaseError};
use crate::fetcher::{ArtifactFetcher, LocalArtifact, ProgressSink};
use crate::release::{HostArch, ReleaseSource};
use crate::resolver;
use std::time::Duration;
use tracing::{info, warn};

/// A verified artifact together with the release it came from
#[derive(Debug, Clone)]
pub struct AcquiredArtifact {
    pub version: String,
    pub file_name: String,
    pub artifact: LocalArtifact,
}

pub struct ArtifactAcquirer {
    fetcher: ArtifactFetcher,
}

impl ArtifactAcquirer {
    pub fn new(fetcher: ArtifactFetcher) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &ArtifactFetcher {
        &self.fetcher
    }

    pub async fn acquire(
        &self,
        source: &dyn ReleaseSource,
        arch: HostArch,
        extension: &str,
        download_timeout: Duration,
        progress: &dyn ProgressSink,
    ) -> Result<AcquiredArtifact, FetchError> {
        let release = source.latest().await.map_err(|e| {
            warn!(source = %source.describe(), "release metadata unavailable: {}", e);
            e
        })?;

        let asset = resolver::resolve(&release, arch, extension).ok_or_else(|| {
            ReleaseError::AssetNotFound {
                tag: release.tag_version.clone(),
                extension: extension.to_string(),
            }
        })?;

        let expected = resolver::expected_digest(&release, asset);
        info!(
            release = %release.tag_version,
            asset = %asset.file_name,
            digest_published = expected.is_some(),
            "acquiring artifact"
        );

        let artifact = self
            .fetcher
            .fetch(asset, expected.as_deref(), download_timeout, progress)
            .await?;

        Ok(AcquiredArtifact {
            version: release.tag_version.clone(),
            file_name: asset.file_name.clone(),
            artifact,
        })
    }
}
