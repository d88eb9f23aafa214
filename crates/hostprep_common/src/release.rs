//! Remote release metadata
//!
//! Releases are published through a GitHub-style `releases/latest` endpoint.
//! The raw document is kept alongside the parsed view so digest extraction
//! can search fields the typed view does not model.

use crate::error::ReleaseError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Host CPU architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostArch {
    X64,
    Arm64,
    X86,
}

impl HostArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostArch::X64 => "x64",
            HostArch::Arm64 => "arm64",
            HostArch::X86 => "x86",
        }
    }

    /// Parse the values Windows reports in `PROCESSOR_ARCHITECTURE`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x64" | "x86_64" => Some(HostArch::X64),
            "arm64" | "aarch64" => Some(HostArch::Arm64),
            "x86" | "i386" | "i686" => Some(HostArch::X86),
            _ => None,
        }
    }

    /// File name tokens identifying an asset built for this architecture
    pub fn asset_tokens(&self) -> &'static [&'static str] {
        match self {
            HostArch::X64 => &["x64", "amd64", "x86_64"],
            HostArch::Arm64 => &["arm64", "aarch64"],
            HostArch::X86 => &["x86", "i386", "i686"],
        }
    }

    /// Infer the architecture an asset file name targets, if any.
    /// `x86_64` is checked before `x86`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        [HostArch::Arm64, HostArch::X64, HostArch::X86]
            .into_iter()
            .find(|arch| arch.asset_tokens().iter().any(|t| lower.contains(t)))
    }
}

impl fmt::Display for HostArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downloadable file of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub file_name: String,
    pub download_url: String,
    /// Per-asset sha256 when the index publishes one
    pub expected_digest: Option<String>,
    pub architecture_hint: Option<HostArch>,
}

impl ReleaseAsset {
    pub fn new(file_name: impl Into<String>, download_url: impl Into<String>) -> Self {
        let file_name = file_name.into();
        let architecture_hint = HostArch::from_file_name(&file_name);
        Self {
            file_name,
            download_url: download_url.into(),
            expected_digest: None,
            architecture_hint,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.expected_digest = Some(digest.into());
        self
    }
}

/// A release as seen by the resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    pub tag_version: String,
    pub assets: Vec<ReleaseAsset>,
    /// The full response text, searched for digest manifests
    pub raw_body: String,
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    digest: Option<String>,
}

impl ReleaseMetadata {
    /// Parse a GitHub `releases/latest` document
    pub fn from_github_json(raw: &str) -> Result<Self, ReleaseError> {
        let release: GitHubRelease =
            serde_json::from_str(raw).map_err(|e| ReleaseError::Malformed(e.to_string()))?;

        if release.tag_name.trim().is_empty() {
            return Err(ReleaseError::Malformed("empty tag_name".to_string()));
        }

        let assets = release
            .assets
            .into_iter()
            .map(|a| {
                let mut asset = ReleaseAsset::new(a.name, a.browser_download_url);
                asset.expected_digest = a.digest;
                asset
            })
            .collect();

        debug!(
            tag = %release.tag_name,
            has_notes = release.body.is_some(),
            "parsed release metadata"
        );

        Ok(Self {
            tag_version: release.tag_name,
            assets,
            raw_body: raw.to_string(),
        })
    }
}

/// Where release metadata comes from
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch the latest release
    async fn latest(&self) -> Result<ReleaseMetadata, ReleaseError>;

    /// Endpoint description for logs
    fn describe(&self) -> String;
}

/// Release index served over HTTP in the GitHub releases format
pub struct GitHubReleaseSource {
    url: String,
    timeout: Duration,
    user_agent: String,
}

impl GitHubReleaseSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            user_agent: format!("hostprep/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[async_trait]
impl ReleaseSource for GitHubReleaseSource {
    async fn latest(&self) -> Result<ReleaseMetadata, ReleaseError> {
        let client = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .build()
            .map_err(|e| ReleaseError::Http(e.to_string()))?;

        let response = client
            .get(&self.url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .map_err(|e| ReleaseError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ReleaseError::Status(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ReleaseError::Http(e.to_string()))?;

        ReleaseMetadata::from_github_json(&body)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "tag_name": "2.3.26",
        "body": "Bug fixes",
        "assets": [
            {
                "name": "wsl.2.3.26.0.x64.msi",
                "browser_download_url": "https://example.invalid/wsl.2.3.26.0.x64.msi",
                "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000001"
            },
            {
                "name": "wsl.2.3.26.0.arm64.msi",
                "browser_download_url": "https://example.invalid/wsl.2.3.26.0.arm64.msi"
            }
        ]
    }"#;

    #[test]
    fn test_parse_github_release() {
        let release = ReleaseMetadata::from_github_json(SAMPLE).unwrap();
        assert_eq!(release.tag_version, "2.3.26");
        assert_eq!(release.assets.len(), 2);
        assert_eq!(release.assets[0].architecture_hint, Some(HostArch::X64));
        assert_eq!(release.assets[1].architecture_hint, Some(HostArch::Arm64));
        assert!(release.assets[0].expected_digest.is_some());
        assert!(release.assets[1].expected_digest.is_none());
        assert_eq!(release.raw_body, SAMPLE);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            ReleaseMetadata::from_github_json("<html>rate limited</html>"),
            Err(ReleaseError::Malformed(_))
        ));
        assert!(ReleaseMetadata::from_github_json(r#"{"tag_name": " "}"#).is_err());
    }

    #[test]
    fn test_arch_from_file_name() {
        assert_eq!(HostArch::from_file_name("tool-x86_64.tar.gz"), Some(HostArch::X64));
        assert_eq!(HostArch::from_file_name("tool-AARCH64.tar.gz"), Some(HostArch::Arm64));
        assert_eq!(HostArch::from_file_name("tool-i686.zip"), Some(HostArch::X86));
        assert_eq!(HostArch::from_file_name("tool.tar.gz"), None);
    }

    #[test]
    fn test_arch_parse() {
        assert_eq!(HostArch::parse("AMD64"), Some(HostArch::X64));
        assert_eq!(HostArch::parse("ARM64"), Some(HostArch::Arm64));
        assert_eq!(HostArch::parse("x86"), Some(HostArch::X86));
        assert_eq!(HostArch::parse("IA64"), None);
    }
}
