//! Failure classification and operator advisories
//!
//! Typed reason codes map totally onto a fixed category set. Messages without
//! a reason code fall back to keyword matching: step identity first, then
//! keywords, first match wins, `Unknown` otherwise. Each category has one
//! static advisory.

use crate::capability::{FailureReason, StepId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    OsVersion,
    OsFeatures,
    SubsystemNotInstalled,
    SubsystemVersionMismatch,
    SubsystemInstallFailed,
    SubsystemStatusUnknown,
    CompanionRunning,
    ImageInstallFailed,
    ImageVersionUnknown,
    Network,
    Permission,
    Verification,
    Timeout,
    UserDeclined,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 15] = [
        ErrorCategory::OsVersion,
        ErrorCategory::OsFeatures,
        ErrorCategory::SubsystemNotInstalled,
        ErrorCategory::SubsystemVersionMismatch,
        ErrorCategory::SubsystemInstallFailed,
        ErrorCategory::SubsystemStatusUnknown,
        ErrorCategory::CompanionRunning,
        ErrorCategory::ImageInstallFailed,
        ErrorCategory::ImageVersionUnknown,
        ErrorCategory::Network,
        ErrorCategory::Permission,
        ErrorCategory::Verification,
        ErrorCategory::Timeout,
        ErrorCategory::UserDeclined,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::OsVersion => "os_version",
            ErrorCategory::OsFeatures => "os_features",
            ErrorCategory::SubsystemNotInstalled => "subsystem_not_installed",
            ErrorCategory::SubsystemVersionMismatch => "subsystem_version_mismatch",
            ErrorCategory::SubsystemInstallFailed => "subsystem_install_failed",
            ErrorCategory::SubsystemStatusUnknown => "subsystem_status_unknown",
            ErrorCategory::CompanionRunning => "companion_running",
            ErrorCategory::ImageInstallFailed => "image_install_failed",
            ErrorCategory::ImageVersionUnknown => "image_version_unknown",
            ErrorCategory::Network => "network",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Verification => "verification",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::UserDeclined => "user_declined",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Accepts `snake_case` or `kebab-case`
    pub fn parse(s: &str) -> Option<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|c| c.as_str() == wanted)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a failed step.
///
/// `reason` wins when present; otherwise `message` is classified by keyword.
pub fn classify(step: StepId, reason: Option<&FailureReason>, message: &str) -> ErrorCategory {
    match reason {
        Some(reason) => classify_reason(reason),
        None => classify_message(step, message),
    }
}

pub fn classify_reason(reason: &FailureReason) -> ErrorCategory {
    match reason {
        FailureReason::UnsupportedArchitecture { .. }
        | FailureReason::OsBuildTooOld { .. }
        | FailureReason::OsQueryFailed => ErrorCategory::OsVersion,
        FailureReason::FeatureQueryFailed { .. } | FailureReason::FeatureEnableFailed { .. } => {
            ErrorCategory::OsFeatures
        }
        FailureReason::SubsystemNotInstalled => ErrorCategory::SubsystemNotInstalled,
        FailureReason::SubsystemOutdated { .. } => ErrorCategory::SubsystemVersionMismatch,
        FailureReason::SubsystemInstallFailed { .. } | FailureReason::DefaultModeFailed { .. } => {
            ErrorCategory::SubsystemInstallFailed
        }
        FailureReason::SubsystemStatusUnknown => ErrorCategory::SubsystemStatusUnknown,
        FailureReason::CompanionRunning { .. } | FailureReason::ProcessQueryFailed => {
            ErrorCategory::CompanionRunning
        }
        FailureReason::ImageInstallFailed { .. }
        | FailureReason::ImageUnregisterFailed { .. }
        | FailureReason::ImageSetupFailed => ErrorCategory::ImageInstallFailed,
        FailureReason::ImageVersionUnknown => ErrorCategory::ImageVersionUnknown,
        FailureReason::ReleaseUnavailable
        | FailureReason::AssetNotFound
        | FailureReason::DownloadFailed => ErrorCategory::Network,
        FailureReason::VerificationFailed => ErrorCategory::Verification,
        FailureReason::Timeout { .. } => ErrorCategory::Timeout,
        FailureReason::PermissionDenied => ErrorCategory::Permission,
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Keyword fallback for failures that carry no reason code
pub fn classify_message(step: StepId, raw: &str) -> ErrorCategory {
    match step {
        StepId::CompanionProcess => return ErrorCategory::CompanionRunning,
        StepId::OsVersion => return ErrorCategory::OsVersion,
        StepId::OsFeatures => return ErrorCategory::OsFeatures,
        StepId::Subsystem | StepId::RuntimeImage => {}
    }

    let msg = raw.to_lowercase();
    if contains_any(&msg, &["verification failed", "digest", "checksum"]) {
        return ErrorCategory::Verification;
    }
    if contains_any(&msg, &["timed out", "timeout"]) {
        return ErrorCategory::Timeout;
    }
    if contains_any(&msg, &["access is denied", "permission", "elevat", "administrator"]) {
        return ErrorCategory::Permission;
    }
    if contains_any(
        &msg,
        &["network", "connection", "unreachable", "dns", "http", "download failed"],
    ) {
        return ErrorCategory::Network;
    }

    match step {
        StepId::Subsystem => {
            if contains_any(&msg, &["not installed", "not found", "no installed"]) {
                ErrorCategory::SubsystemNotInstalled
            } else if contains_any(&msg, &["older", "outdated", "mismatch"]) {
                ErrorCategory::SubsystemVersionMismatch
            } else if contains_any(&msg, &["status", "could not query"]) {
                ErrorCategory::SubsystemStatusUnknown
            } else if contains_any(&msg, &["install", "msiexec", "default version"]) {
                ErrorCategory::SubsystemInstallFailed
            } else {
                ErrorCategory::Unknown
            }
        }
        StepId::RuntimeImage => {
            if contains_any(&msg, &["version", "marker"]) {
                ErrorCategory::ImageVersionUnknown
            } else if contains_any(&msg, &["import", "install", "unregister", "first-boot"]) {
                ErrorCategory::ImageInstallFailed
            } else {
                ErrorCategory::Unknown
            }
        }
        _ => ErrorCategory::Unknown,
    }
}

/// Static operator guidance for a category
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advisory {
    pub category: ErrorCategory,
    pub title: &'static str,
    pub description: &'static str,
    pub steps: &'static [&'static str],
    pub links: &'static [&'static str],
    /// Whether to offer a pre-filled issue report
    pub offer_report: bool,
}

const WSL_INSTALL: &str = "https://learn.microsoft.com/windows/wsl/install";
const WSL_MANUAL: &str = "https://learn.microsoft.com/windows/wsl/install-manual";
const WSL_TROUBLESHOOTING: &str = "https://learn.microsoft.com/windows/wsl/troubleshooting";
const WSL_RELEASES: &str = "https://github.com/microsoft/WSL/releases";

pub fn advisory(category: ErrorCategory) -> Advisory {
    let (title, description, steps, links, offer_report): (
        &'static str,
        &'static str,
        &'static [&'static str],
        &'static [&'static str],
        bool,
    ) = match category {
        ErrorCategory::OsVersion => (
            "Windows version not supported",
            "This version or edition of Windows cannot run WSL 2. 64-bit Windows 10 \
             build 18362 or later is required (build 19041 or later on ARM64); 32-bit \
             Windows is not supported.",
            &[
                "Open Settings > Windows Update and install all available updates.",
                "Check your build with `winver` and compare it with the requirement.",
                "Run setup again after updating.",
            ],
            &[WSL_INSTALL, WSL_MANUAL],
            false,
        ),
        ErrorCategory::OsFeatures => (
            "Windows features could not be enabled",
            "The Windows Subsystem for Linux and Virtual Machine Platform features \
             are required and could not be turned on.",
            &[
                "Make sure virtualization is enabled in your BIOS/UEFI settings.",
                "Open \"Turn Windows features on or off\" and enable both features manually.",
                "Restart Windows, then run setup again.",
            ],
            &[WSL_MANUAL, WSL_TROUBLESHOOTING],
            true,
        ),
        ErrorCategory::SubsystemNotInstalled => (
            "WSL is not installed",
            "The Windows Subsystem for Linux package is missing.",
            &[
                "Run setup again to install it automatically.",
                "Alternatively run `wsl --install --no-distribution` from an administrator prompt.",
            ],
            &[WSL_INSTALL, WSL_RELEASES],
            false,
        ),
        ErrorCategory::SubsystemVersionMismatch => (
            "WSL is out of date",
            "The installed WSL version is older than the version this runtime needs.",
            &[
                "Run `wsl --update` from an administrator prompt.",
                "Run setup again.",
            ],
            &[WSL_RELEASES],
            false,
        ),
        ErrorCategory::SubsystemInstallFailed => (
            "WSL installation failed",
            "The WSL installer or the default-version configuration did not succeed.",
            &[
                "Restart Windows and run setup again.",
                "Install the latest WSL package manually from the releases page.",
                "Run `wsl --set-default-version 2` from an administrator prompt.",
            ],
            &[WSL_RELEASES, WSL_TROUBLESHOOTING],
            true,
        ),
        ErrorCategory::SubsystemStatusUnknown => (
            "WSL status could not be determined",
            "WSL did not respond to status queries. It may be partially installed or \
             waiting for a restart.",
            &[
                "Restart Windows.",
                "Run `wsl --status` and check the output for errors.",
                "Run setup again.",
            ],
            &[WSL_TROUBLESHOOTING],
            true,
        ),
        ErrorCategory::CompanionRunning => (
            "A conflicting application is running",
            "Another application that manages WSL is running and would interfere with \
             setup.",
            &[
                "Quit the application completely, including its tray icon.",
                "Check Task Manager that no instance is left running.",
                "Run setup again.",
            ],
            &[],
            false,
        ),
        ErrorCategory::ImageInstallFailed => (
            "Runtime image installation failed",
            "The runtime image could not be imported into WSL or its first-boot setup \
             did not complete.",
            &[
                "Make sure there is enough free disk space.",
                "Run setup again; a failed image is removed and reinstalled.",
            ],
            &[WSL_TROUBLESHOOTING],
            true,
        ),
        ErrorCategory::ImageVersionUnknown => (
            "Runtime image version unknown",
            "The installed runtime image does not report a readable version.",
            &["Run setup again to reinstall the runtime image."],
            &[],
            true,
        ),
        ErrorCategory::Network => (
            "Network problem",
            "Release information or a download could not be retrieved.",
            &[
                "Check your internet connection and proxy settings.",
                "Make sure github.com and its download hosts are reachable.",
                "Run setup again.",
            ],
            &[],
            false,
        ),
        ErrorCategory::Permission => (
            "Insufficient permissions",
            "An operation was denied. Setup needs administrator rights for some steps.",
            &[
                "Run setup from an account with administrator rights.",
                "Accept the elevation prompt when it appears.",
            ],
            &[],
            false,
        ),
        ErrorCategory::Verification => (
            "Download verification failed",
            "A downloaded file did not match its published checksum, or no checksum was \
             published. The file was deleted and nothing was installed.",
            &[
                "Run setup again to download a fresh copy.",
                "If it keeps failing, your connection may be altering downloads.",
            ],
            &[],
            true,
        ),
        ErrorCategory::Timeout => (
            "Operation timed out",
            "A system tool did not finish in time and was stopped.",
            &[
                "Restart Windows to clear stuck installer processes.",
                "Run setup again.",
            ],
            &[WSL_TROUBLESHOOTING],
            true,
        ),
        ErrorCategory::UserDeclined => (
            "Setup cancelled",
            "Setup was stopped before it finished. Completed steps are kept and will be \
             skipped next time.",
            &["Run setup again when you are ready."],
            &[],
            false,
        ),
        ErrorCategory::Unknown => (
            "Unexpected error",
            "Setup failed for a reason it could not identify.",
            &[
                "Run setup again.",
                "If the problem persists, report it together with the log file.",
            ],
            &[],
            true,
        ),
    };

    Advisory {
        category,
        title,
        description,
        steps,
        links,
        offer_report,
    }
}
