//! Provisioning parameters
//!
//! Endpoints, names, thresholds and timeouts. Nothing here records what a
//! previous run did: every decision is re-derived from live probes.

use crate::version::UnknownVersionPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment override for the subsystem release index
pub const ENV_SUBSYSTEM_INDEX: &str = "HOSTPREP_SUBSYSTEM_INDEX_URL";
/// Environment override for the image release index
pub const ENV_IMAGE_INDEX: &str = "HOSTPREP_IMAGE_INDEX_URL";
/// Environment override for the artifact staging directory
pub const ENV_STAGING_DIR: &str = "HOSTPREP_STAGING_DIR";

fn app_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hostprep")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Exact process image name that must not be running
    pub process_name: String,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            process_name: "Docker Desktop.exe".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsConfig {
    pub min_build_x64: u32,
    pub min_build_arm64: u32,
    pub query_timeout_secs: u64,
}

impl Default for OsConfig {
    fn default() -> Self {
        Self {
            min_build_x64: 18362,
            min_build_arm64: 19041,
            query_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub names: Vec<String>,
    pub query_timeout_secs: u64,
    pub enable_timeout_secs: u64,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            names: vec![
                "Microsoft-Windows-Subsystem-Linux".to_string(),
                "VirtualMachinePlatform".to_string(),
            ],
            query_timeout_secs: 60,
            enable_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsystemConfig {
    pub release_index_url: String,
    pub asset_extension: String,
    pub required_default_version: u32,
    /// Applied when the installed or latest version cannot be determined
    pub unknown_version_policy: UnknownVersionPolicy,
    pub probe_timeout_secs: u64,
    pub set_mode_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for SubsystemConfig {
    fn default() -> Self {
        Self {
            release_index_url: "https://api.github.com/repos/microsoft/WSL/releases/latest"
                .to_string(),
            asset_extension: ".msi".to_string(),
            required_default_version: 2,
            unknown_version_policy: UnknownVersionPolicy::AssumeCurrent,
            probe_timeout_secs: 10,
            set_mode_timeout_secs: 60,
            install_timeout_secs: 300,
            download_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Name the image is registered under
    pub distro_name: String,
    pub release_index_url: String,
    pub asset_extension: String,
    pub install_dir: PathBuf,
    /// File inside the image holding its version
    pub version_marker_path: String,
    /// Command run inside the image after import
    pub first_boot_command: Vec<String>,
    /// Output line signalling that first boot finished
    pub completion_marker: String,
    /// Applied when the latest published version cannot be determined
    pub unknown_version_policy: UnknownVersionPolicy,
    pub probe_timeout_secs: u64,
    pub unregister_timeout_secs: u64,
    pub import_timeout_secs: u64,
    pub first_boot_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            distro_name: "hostprep".to_string(),
            release_index_url:
                "https://api.github.com/repos/hostprep/hostprep-image/releases/latest".to_string(),
            asset_extension: ".tar.gz".to_string(),
            install_dir: app_dir().join("distro"),
            version_marker_path: "/etc/hostprep-release".to_string(),
            first_boot_command: vec!["/usr/local/bin/hostprep-firstboot".to_string()],
            completion_marker: "hostprep: first boot complete".to_string(),
            unknown_version_policy: UnknownVersionPolicy::AssumeCurrent,
            probe_timeout_secs: 10,
            unregister_timeout_secs: 60,
            import_timeout_secs: 900,
            first_boot_timeout_secs: 300,
            download_timeout_secs: 900,
        }
    }
}

/// Complete configuration for a provisioning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub staging_dir: PathBuf,
    pub release_index_timeout_secs: u64,
    pub companion: CompanionConfig,
    pub os: OsConfig,
    pub features: FeaturesConfig,
    pub subsystem: SubsystemConfig,
    pub image: ImageConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            staging_dir: app_dir().join("artifacts"),
            release_index_timeout_secs: 10,
            companion: CompanionConfig::default(),
            os: OsConfig::default(),
            features: FeaturesConfig::default(),
            subsystem: SubsystemConfig::default(),
            image: ImageConfig::default(),
        }
    }
}

impl ProvisionConfig {
    /// Load from a TOML file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ProvisionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, or the given file, with `HOSTPREP_*` environment overrides applied
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_SUBSYSTEM_INDEX) {
            self.subsystem.release_index_url = url;
        }
        if let Some(url) = lookup(ENV_IMAGE_INDEX) {
            self.image.release_index_url = url;
        }
        if let Some(dir) = lookup(ENV_STAGING_DIR) {
            self.staging_dir = PathBuf::from(dir);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.features.names.is_empty() {
            anyhow::bail!("features.names must list at least one feature");
        }
        if self.image.distro_name.trim().is_empty() {
            anyhow::bail!("image.distro_name must not be empty");
        }
        if self.image.first_boot_command.is_empty() {
            anyhow::bail!("image.first_boot_command must not be empty");
        }
        if self.companion.process_name.trim().is_empty() {
            anyhow::bail!("companion.process_name must not be empty");
        }
        Ok(())
    }

    pub fn release_index_timeout(&self) -> Duration {
        Duration::from_secs(self.release_index_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProvisionConfig::default();
        assert_eq!(config.features.names.len(), 2);
        assert!(config.os.min_build_arm64 > config.os.min_build_x64);
        assert_eq!(config.subsystem.asset_extension, ".msi");
        assert_eq!(config.image.first_boot_timeout_secs, 300);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ProvisionConfig::from_toml(
            r#"
            [image]
            distro_name = "custom"
            unknown_version_policy = "assume_update_required"

            [subsystem]
            install_timeout_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.image.distro_name, "custom");
        assert_eq!(
            config.image.unknown_version_policy,
            UnknownVersionPolicy::AssumeUpdateRequired
        );
        assert_eq!(config.subsystem.install_timeout_secs, 120);
        assert_eq!(config.subsystem.required_default_version, 2);
        assert_eq!(config.companion, CompanionConfig::default());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(ProvisionConfig::from_toml("[features]\nnames = []").is_err());
        assert!(ProvisionConfig::from_toml("staging_dir = 5").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ProvisionConfig::default();
        config.apply_env_overrides(|key| match key {
            ENV_IMAGE_INDEX => Some("http://localhost:9999/latest".to_string()),
            ENV_STAGING_DIR => Some("/tmp/hp".to_string()),
            _ => None,
        });
        assert_eq!(config.image.release_index_url, "http://localhost:9999/latest");
        assert_eq!(config.staging_dir, PathBuf::from("/tmp/hp"));
        assert_eq!(
            config.subsystem.release_index_url,
            SubsystemConfig::default().release_index_url
        );
    }
}
