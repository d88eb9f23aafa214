//! Version normalization and update decisions
//!
//! Versions arrive in many shapes: release tags (`v2.0.9`), marker files
//! (`1.4.0-rc1\n`), tool output (`2.0.9.0`). Everything is normalized to
//! `major.minor[.build[.revision]]` before comparison.

use crate::error::VersionError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// At most this many components take part in a comparison
const MAX_COMPONENTS: usize = 4;

/// A normalized dotted version with 2 to 4 numeric components
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedVersion {
    components: Vec<u64>,
}

impl NormalizedVersion {
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Component at `index`, missing components count as 0
    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }

    /// Compare component-wise, treating missing components as 0
    pub fn compare(&self, other: &Self) -> Ordering {
        for i in 0..MAX_COMPONENTS {
            match self.component(i).cmp(&other.component(i)) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for NormalizedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Normalize a raw version string.
///
/// Drops a leading `v`/`V`, truncates at the first `-`, strips everything
/// that is not a digit or a dot, then keeps at most four components.
/// A single component is padded to `major.0`.
pub fn normalize(raw: &str) -> Result<NormalizedVersion, VersionError> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    let trimmed = match trimmed.find('-') {
        Some(pos) => &trimmed[..pos],
        None => trimmed,
    };

    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut components = Vec::with_capacity(MAX_COMPONENTS);
    for part in cleaned.split('.').filter(|p| !p.is_empty()) {
        if components.len() == MAX_COMPONENTS {
            break;
        }
        let value = part
            .parse::<u64>()
            .map_err(|_| VersionError::Unparseable(raw.to_string()))?;
        components.push(value);
    }

    if components.is_empty() {
        return Err(VersionError::Unparseable(raw.to_string()));
    }
    if components.len() == 1 {
        components.push(0);
    }

    Ok(NormalizedVersion { components })
}

/// True when `candidate` is strictly newer than `baseline`.
///
/// Unparseable input on either side is reported as an error; callers that
/// need a decision use [`update_required`] with an explicit policy.
pub fn is_newer(candidate: &str, baseline: &str) -> Result<bool, VersionError> {
    let candidate = normalize(candidate)?;
    let baseline = normalize(baseline)?;
    Ok(candidate.compare(&baseline) == Ordering::Greater)
}

/// What an update decision returns when a version cannot be determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownVersionPolicy {
    /// Fail open: treat the component as outdated and update it
    AssumeUpdateRequired,
    /// Fail closed: keep what is installed
    AssumeCurrent,
}

impl UnknownVersionPolicy {
    pub fn decision(&self) -> bool {
        matches!(self, UnknownVersionPolicy::AssumeUpdateRequired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnknownVersionPolicy::AssumeUpdateRequired => "assume_update_required",
            UnknownVersionPolicy::AssumeCurrent => "assume_current",
        }
    }
}

/// Decide whether `current` must be updated to `latest`.
///
/// `latest` is `None` when the release index could not be reached.
pub fn update_required(
    current: &str,
    latest: Option<&str>,
    policy: UnknownVersionPolicy,
) -> bool {
    let Some(latest) = latest else {
        tracing::debug!(policy = policy.as_str(), "latest version unknown");
        return policy.decision();
    };
    match is_newer(latest, current) {
        Ok(newer) => newer,
        Err(e) => {
            tracing::warn!(
                current,
                latest,
                policy = policy.as_str(),
                "version comparison failed: {}",
                e
            );
            policy.decision()
        }
    }
}

/// Why an update decision fell back to the policy, if it did
pub fn undecided(current: Option<&str>, latest: Option<&str>) -> Option<&'static str> {
    match (current, latest) {
        (None, _) => Some("installed version unreadable"),
        (_, None) => Some("latest version unknown"),
        (Some(current), Some(latest)) => is_newer(latest, current)
            .err()
            .map(|_| "versions not comparable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_prefix_and_prerelease() {
        assert_eq!(normalize("v1.2.0-beta").unwrap(), normalize("1.2.0").unwrap());
        assert_eq!(normalize("V3.1").unwrap().to_string(), "3.1");
    }

    #[test]
    fn test_normalize_pads_single_component() {
        assert_eq!(normalize("7").unwrap().components(), &[7, 0]);
    }

    #[test]
    fn test_normalize_drops_noise() {
        assert_eq!(normalize("2.0.9.0\r\n").unwrap().to_string(), "2.0.9.0");
        assert_eq!(normalize("release 1.4b").unwrap().to_string(), "1.4");
    }

    #[test]
    fn test_normalize_ignores_extra_components() {
        assert_eq!(normalize("1.2.3.4.5.6").unwrap().components(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize("").is_err());
        assert!(normalize("latest").is_err());
        assert!(normalize("-1.0").is_err());
        assert!(normalize("99999999999999999999999.1").is_err());
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("1.10.0", "1.9.5").unwrap());
        assert!(!is_newer("2.0", "2.0.0.0").unwrap());
        assert!(!is_newer("1.9.5", "1.10.0").unwrap());
        assert!(is_newer("2.0.0.1", "2.0").unwrap());
        assert!(!is_newer("1.2.3.4.9", "1.2.3.4.1").unwrap());
    }

    #[test]
    fn test_update_required_uses_policy_on_unknown() {
        assert!(update_required("1.0", None, UnknownVersionPolicy::AssumeUpdateRequired));
        assert!(!update_required("1.0", None, UnknownVersionPolicy::AssumeCurrent));
        assert!(update_required("garbage", Some("1.0"), UnknownVersionPolicy::AssumeUpdateRequired));
        assert!(!update_required("garbage", Some("1.0"), UnknownVersionPolicy::AssumeCurrent));
    }

    #[test]
    fn test_update_required_compares_known_versions() {
        assert!(update_required("2.0.9", Some("v2.1.0"), UnknownVersionPolicy::AssumeCurrent));
        assert!(!update_required("2.1.0", Some("v2.1.0"), UnknownVersionPolicy::AssumeUpdateRequired));
    }

    #[test]
    fn test_undecided_names_the_missing_input() {
        assert_eq!(undecided(Some("2.0.1"), Some("2.1.0")), None);
        assert_eq!(undecided(Some("2.0.1"), None), Some("latest version unknown"));
        assert_eq!(undecided(None, Some("2.1.0")), Some("installed version unreadable"));
        assert_eq!(undecided(Some("2.0.1"), Some("nightly")), Some("versions not comparable"));
    }
}
