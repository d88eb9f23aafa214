//! Artifact download, verification and staging
//!
//! `fetch` is the only way to obtain a [`LocalArtifact`]. A returned artifact
//! has been downloaded, hashed, matched against a published digest and moved
//! into the content-addressed store. Anything else is deleted before return.

use crate::error::FetchError;
use crate::integrity;
use crate::release::ReleaseAsset;
use crate::store::ArtifactStore;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// A downloaded file whose digest matched the published one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalArtifact {
    pub file_path: PathBuf,
    pub computed_digest: String,
}

/// Receives download progress in bytes
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, downloaded: u64, total: Option<u64>);
}

/// Sink that discards progress
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _downloaded: u64, _total: Option<u64>) {}
}

/// Transport that writes a URL's body to a local file
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Stream `url` into `dest`, returning the number of bytes written
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64, FetchError>;
}

/// HTTP(S) downloader with streamed writes
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("hostprep/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::Download(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Download(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| staging(dest, e))?;

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Download(e.to_string()))?;
            file.write_all(&chunk).await.map_err(|e| staging(dest, e))?;
            downloaded += chunk.len() as u64;
            progress.on_progress(downloaded, total);
        }

        file.sync_all().await.map_err(|e| staging(dest, e))?;

        if downloaded == 0 {
            return Err(FetchError::Download(format!("empty response body from {}", url)));
        }
        Ok(downloaded)
    }
}

fn staging(path: &Path, source: std::io::Error) -> FetchError {
    FetchError::Staging {
        path: path.to_path_buf(),
        source,
    }
}

/// Downloads, verifies and stages release assets
pub struct ArtifactFetcher {
    downloader: Arc<dyn Downloader>,
    store: ArtifactStore,
}

impl ArtifactFetcher {
    pub fn new(downloader: Arc<dyn Downloader>, store: ArtifactStore) -> Self {
        Self { downloader, store }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Fetch `asset` and verify it against `expected_digest`.
    ///
    /// No expected digest fails closed before any network traffic.
    pub async fn fetch(
        &self,
        asset: &ReleaseAsset,
        expected_digest: Option<&str>,
        timeout: Duration,
        progress: &dyn ProgressSink,
    ) -> Result<LocalArtifact, FetchError> {
        let expected = match expected_digest.map(integrity::canonical_digest) {
            Some(d) if integrity::is_sha256_hex(&d) => d,
            _ => {
                error!(asset = %asset.file_name, "no expected digest, refusing to download");
                return Err(FetchError::MissingDigest {
                    asset: asset.file_name.clone(),
                });
            }
        };

        let incoming = self.store.incoming_dir();
        tokio::fs::create_dir_all(&incoming)
            .await
            .map_err(|e| staging(&incoming, e))?;
        let temp_path = incoming.join(format!("{}.part", uuid::Uuid::new_v4()));

        info!(asset = %asset.file_name, url = %asset.download_url, "downloading");
        let result = tokio::time::timeout(
            timeout,
            self.downloader
                .download(&asset.download_url, &temp_path, progress),
        )
        .await;

        let bytes = match result {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                discard(&temp_path).await;
                return Err(e);
            }
            Err(_) => {
                discard(&temp_path).await;
                return Err(FetchError::Timeout(timeout));
            }
        };

        let hash_path = temp_path.clone();
        let computed = tokio::task::spawn_blocking(move || integrity::compute_digest(&hash_path))
            .await
            .map_err(|e| FetchError::Download(format!("digest task failed: {}", e)))
            .and_then(|r| r.map_err(|e| staging(&temp_path, e)));

        let computed = match computed {
            Ok(d) => d,
            Err(e) => {
                discard(&temp_path).await;
                return Err(e);
            }
        };

        if !integrity::verify(&computed, &expected) {
            error!(
                asset = %asset.file_name,
                expected = %expected,
                actual = %computed,
                "digest mismatch, deleting download"
            );
            discard(&temp_path).await;
            return Err(FetchError::VerificationFailed {
                asset: asset.file_name.clone(),
                expected,
                actual: computed,
            });
        }

        // admit re-hashes an already staged copy, keep it off the runtime
        let store = self.store.clone();
        let (admit_path, admit_digest, admit_name) =
            (temp_path.clone(), computed.clone(), asset.file_name.clone());
        let admitted =
            tokio::task::spawn_blocking(move || store.admit(&admit_path, &admit_digest, &admit_name))
                .await
                .map_err(|e| FetchError::Download(format!("staging task failed: {}", e)))
                .and_then(|r| r.map_err(|e| staging(&temp_path, e)));

        let file_path = match admitted {
            Ok(p) => p,
            Err(e) => {
                discard(&temp_path).await;
                return Err(e);
            }
        };

        info!(
            asset = %asset.file_name,
            bytes,
            digest = %computed,
            path = %file_path.display(),
            "artifact verified"
        );

        Ok(LocalArtifact {
            file_path,
            computed_digest: computed,
        })
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "failed to delete rejected download: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDownloader;
    use sha2::{Digest, Sha256};

    fn asset() -> ReleaseAsset {
        ReleaseAsset::new("image-x64.tar.gz", "https://example.invalid/image-x64.tar.gz")
    }

    fn digest_of(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn fetcher(downloader: Arc<FakeDownloader>, root: &Path) -> ArtifactFetcher {
        ArtifactFetcher::new(downloader, ArtifactStore::new(root))
    }

    fn files_under(root: &Path) -> usize {
        fn walk(dir: &Path) -> usize {
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| {
                            let p = e.path();
                            if p.is_dir() { walk(&p) } else { 1 }
                        })
                        .sum()
                })
                .unwrap_or(0)
        }
        walk(root)
    }

    #[tokio::test]
    async fn test_fetch_verifies_and_stages() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::serving(b"rootfs bytes".to_vec()));
        let f = fetcher(downloader.clone(), tmp.path());
        let expected = digest_of(b"rootfs bytes");

        let artifact = f
            .fetch(&asset(), Some(&expected.to_uppercase()), Duration::from_secs(5), &NoProgress)
            .await
            .unwrap();

        assert_eq!(artifact.computed_digest, expected);
        assert!(artifact.file_path.starts_with(tmp.path().join("sha256").join(&expected)));
        assert_eq!(std::fs::read(&artifact.file_path).unwrap(), b"rootfs bytes");
        assert_eq!(downloader.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_without_digest_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::serving(b"rootfs bytes".to_vec()));
        let f = fetcher(downloader.clone(), tmp.path());

        let err = f
            .fetch(&asset(), None, Duration::from_secs(5), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingDigest { .. }));
        assert!(err.is_verification());
        assert_eq!(files_under(tmp.path()), 0);

        let err = f
            .fetch(&asset(), Some("  "), Duration::from_secs(5), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingDigest { .. }));
    }

    #[tokio::test]
    async fn test_fetch_deletes_corrupted_download() {
        let tmp = tempfile::tempdir().unwrap();
        let mut corrupted = b"rootfs bytes".to_vec();
        corrupted[3] ^= 0x01;
        let downloader = Arc::new(FakeDownloader::serving(corrupted));
        let f = fetcher(downloader, tmp.path());
        let expected = digest_of(b"rootfs bytes");

        let err = f
            .fetch(&asset(), Some(&expected), Duration::from_secs(5), &NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::VerificationFailed { .. }));
        assert!(err.to_string().starts_with("verification failed"));
        assert_eq!(files_under(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_fetch_download_failure_is_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::failing("connection reset"));
        let f = fetcher(downloader, tmp.path());
        let expected = digest_of(b"anything");

        let err = f
            .fetch(&asset(), Some(&expected), Duration::from_secs(5), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Download(_)));
        assert!(!err.is_verification());
        assert_eq!(files_under(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader =
            Arc::new(FakeDownloader::serving(b"slow".to_vec()).with_delay(Duration::from_secs(5)));
        let f = fetcher(downloader, tmp.path());
        let expected = digest_of(b"slow");

        let err = f
            .fetch(&asset(), Some(&expected), Duration::from_millis(50), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
        assert_eq!(files_under(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_repeated_fetch_collapses_to_one_path() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::serving(b"same".to_vec()));
        let f = fetcher(downloader, tmp.path());
        let expected = digest_of(b"same");

        let a = f
            .fetch(&asset(), Some(&expected), Duration::from_secs(5), &NoProgress)
            .await
            .unwrap();
        let b = f
            .fetch(&asset(), Some(&expected), Duration::from_secs(5), &NoProgress)
            .await
            .unwrap();
        assert_eq!(a.file_path, b.file_path);
        assert_eq!(files_under(tmp.path()), 1);
    }

    #[tokio::test]
    async fn test_refetch_never_returns_a_tampered_staged_file() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::serving(b"genuine".to_vec()));
        let f = fetcher(downloader, tmp.path());
        let expected = digest_of(b"genuine");

        let first = f
            .fetch(&asset(), Some(&expected), Duration::from_secs(5), &NoProgress)
            .await
            .unwrap();
        std::fs::write(&first.file_path, b"evil!!!").unwrap();

        let second = f
            .fetch(&asset(), Some(&expected), Duration::from_secs(5), &NoProgress)
            .await
            .unwrap();
        assert_eq!(second.computed_digest, expected);
        assert_eq!(
            integrity::compute_digest(&second.file_path).unwrap(),
            expected
        );
        assert_eq!(files_under(tmp.path()), 1);
    }
}
