//! Asset selection and expected-digest extraction
//!
//! Selection filters by extension, prefers the host architecture, and falls
//! back to the first match because some releases ship one universal asset.
//! Digest extraction never guesses: no 64-hex value tied to the chosen asset
//! means no digest, and the fetcher fails closed.

use crate::integrity::{canonical_digest, is_sha256_hex};
use crate::release::{HostArch, ReleaseAsset, ReleaseMetadata};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

/// Pick the asset to download for `arch` among those ending in `extension`
pub fn resolve<'a>(
    release: &'a ReleaseMetadata,
    arch: HostArch,
    extension: &str,
) -> Option<&'a ReleaseAsset> {
    let extension = extension.to_ascii_lowercase();
    let matching: Vec<&ReleaseAsset> = release
        .assets
        .iter()
        .filter(|a| a.file_name.to_ascii_lowercase().ends_with(&extension))
        .collect();

    if let Some(asset) = matching
        .iter()
        .find(|a| a.architecture_hint == Some(arch))
    {
        debug!(asset = %asset.file_name, %arch, "resolved architecture-specific asset");
        return Some(*asset);
    }

    let fallback = matching.first().copied();
    if let Some(asset) = fallback {
        info!(
            asset = %asset.file_name,
            %arch,
            "no {} asset in release {}, falling back to first match",
            arch,
            release.tag_version
        );
    }
    fallback
}

/// Find the sha256 published for `asset`.
///
/// Order: the asset's own structured field, a `digest`/`sha256` key in the
/// raw document next to the asset's exact download URL, then a hash
/// manifest line in the release notes naming the asset's file.
pub fn expected_digest(release: &ReleaseMetadata, asset: &ReleaseAsset) -> Option<String> {
    if let Some(digest) = asset.expected_digest.as_deref().and_then(valid_digest) {
        return Some(digest);
    }

    if let Ok(doc) = serde_json::from_str::<Value>(&release.raw_body) {
        if let Some(digest) = digest_near_url(&doc, &asset.download_url) {
            return Some(digest);
        }
        let notes = doc.get("body").and_then(Value::as_str).unwrap_or_default();
        return digest_in_manifest(notes, &asset.file_name);
    }

    digest_in_manifest(&release.raw_body, &asset.file_name)
}

fn valid_digest(raw: &str) -> Option<String> {
    let digest = canonical_digest(raw);
    is_sha256_hex(&digest).then_some(digest)
}

/// Walk the document for an object holding `url` as one of its string values
/// and a digest-like key
fn digest_near_url(value: &Value, url: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            let holds_url = map.values().any(|v| v.as_str() == Some(url));
            if holds_url {
                for key in ["digest", "sha256", "checksum"] {
                    if let Some(d) = map.get(key).and_then(Value::as_str).and_then(valid_digest) {
                        return Some(d);
                    }
                }
            }
            map.values().find_map(|v| digest_near_url(v, url))
        }
        Value::Array(items) => items.iter().find_map(|v| digest_near_url(v, url)),
        _ => None,
    }
}

/// Scan free text for a line naming `file_name` with a 64-hex token on it.
/// Covers `sha256sum` output, `name: hash` lists and markdown tables.
fn digest_in_manifest(text: &str, file_name: &str) -> Option<String> {
    let name_pattern = format!(r"(?:^|[^\w.\-]){}(?:$|[^\w.\-])", regex::escape(file_name));
    let name_re = Regex::new(&name_pattern).ok()?;
    let hash_re = Regex::new(r"\b[0-9a-fA-F]{64}\b").ok()?;

    text.lines()
        .filter(|line| name_re.is_match(line))
        .find_map(|line| hash_re.find(line))
        .map(|m| m.as_str().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIGEST_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn release(names: &[&str]) -> ReleaseMetadata {
        ReleaseMetadata {
            tag_version: "1.0.0".to_string(),
            assets: names
                .iter()
                .map(|n| ReleaseAsset::new(*n, format!("https://example.invalid/{}", n)))
                .collect(),
            raw_body: String::new(),
        }
    }

    #[test]
    fn test_resolve_prefers_host_architecture() {
        let r = release(&["runner-x64.pkg", "runner-arm64.pkg"]);
        let asset = resolve(&r, HostArch::Arm64, ".pkg").unwrap();
        assert_eq!(asset.file_name, "runner-arm64.pkg");
        let asset = resolve(&r, HostArch::X64, ".pkg").unwrap();
        assert_eq!(asset.file_name, "runner-x64.pkg");
    }

    #[test]
    fn test_resolve_falls_back_to_single_asset() {
        let r = release(&["runner-arm64.pkg"]);
        let asset = resolve(&r, HostArch::X64, ".pkg").unwrap();
        assert_eq!(asset.file_name, "runner-arm64.pkg");
    }

    #[test]
    fn test_resolve_filters_extension() {
        let r = release(&["runner-x64.zip", "notes.txt", "runner.PKG"]);
        assert_eq!(resolve(&r, HostArch::X64, ".pkg").unwrap().file_name, "runner.PKG");
        assert!(resolve(&r, HostArch::X64, ".msi").is_none());
    }

    #[test]
    fn test_digest_from_structured_field() {
        let mut r = release(&["runner-x64.pkg"]);
        r.assets[0].expected_digest = Some(format!("sha256:{}", DIGEST_A.to_uppercase()));
        let asset = r.assets[0].clone();
        assert_eq!(expected_digest(&r, &asset).as_deref(), Some(DIGEST_A));
    }

    #[test]
    fn test_digest_colocated_with_url_in_raw_document() {
        let mut r = release(&["runner-x64.pkg", "runner-arm64.pkg"]);
        r.raw_body = format!(
            r#"{{"tag_name":"1.0.0","assets":[
                {{"name":"runner-x64.pkg","browser_download_url":"https://example.invalid/runner-x64.pkg","sha256":"{}"}},
                {{"name":"runner-arm64.pkg","browser_download_url":"https://example.invalid/runner-arm64.pkg","sha256":"{}"}}
            ]}}"#,
            DIGEST_A, DIGEST_B
        );
        let arm = r.assets[1].clone();
        assert_eq!(expected_digest(&r, &arm).as_deref(), Some(DIGEST_B));
    }

    #[test]
    fn test_digest_from_release_notes_manifest() {
        let mut r = release(&["runner-x64.pkg", "runner-x64.pkg.sig"]);
        r.raw_body = serde_json::json!({
            "tag_name": "1.0.0",
            "body": format!(
                "## Checksums\n{}  runner-x64.pkg.sig\n| runner-x64.pkg | {} |\n",
                DIGEST_B, DIGEST_A
            ),
        })
        .to_string();
        let asset = r.assets[0].clone();
        assert_eq!(expected_digest(&r, &asset).as_deref(), Some(DIGEST_A));
    }

    #[test]
    fn test_digest_absent_when_nothing_matches() {
        let mut r = release(&["runner-x64.pkg"]);
        r.raw_body = serde_json::json!({
            "tag_name": "1.0.0",
            "body": "sha256 for other-file.pkg: 1234",
        })
        .to_string();
        let asset = r.assets[0].clone();
        assert_eq!(expected_digest(&r, &asset), None);
    }

    #[test]
    fn test_short_digest_is_rejected() {
        let mut r = release(&["runner-x64.pkg"]);
        r.assets[0].expected_digest = Some("sha256:abc123".to_string());
        let asset = r.assets[0].clone();
        assert_eq!(expected_digest(&r, &asset), None);
    }
}
