//! Content-addressed staging for verified artifacts
//!
//! Layout: `<root>/sha256/<digest>/<file name>`. A second verified download
//! of the same bytes reuses the staged file, but only after re-hashing it.

use crate::integrity::{canonical_digest, compute_digest, is_sha256_hex, verify};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Keyed storage: verified digest -> artifact path
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for in-flight downloads; same volume as the store so the
    /// final move is a rename
    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join("incoming")
    }

    fn digest_dir(&self, digest: &str) -> io::Result<PathBuf> {
        let digest = canonical_digest(digest);
        if !is_sha256_hex(&digest) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a sha256 digest: {}", digest),
            ));
        }
        Ok(self.root.join("sha256").join(digest))
    }

    /// Path of a stored artifact with this digest, if present
    pub fn lookup(&self, digest: &str) -> Option<PathBuf> {
        let dir = self.digest_dir(digest).ok()?;
        fs::read_dir(&dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.is_file())
    }

    /// Move a verified file into its digest slot and return the final path.
    ///
    /// A file already in the slot is re-hashed. If it still matches, the
    /// incoming file is removed and the existing path is returned; if not,
    /// the slot is cleared and the incoming file takes its place.
    pub fn admit(&self, verified: &Path, digest: &str, file_name: &str) -> io::Result<PathBuf> {
        let dir = self.digest_dir(digest)?;
        if let Some(existing) = self.lookup(digest) {
            let actual = compute_digest(&existing)?;
            if verify(&actual, digest) {
                debug!(path = %existing.display(), "artifact already staged");
                fs::remove_file(verified)?;
                return Ok(existing);
            }
            warn!(
                path = %existing.display(),
                expected = %canonical_digest(digest),
                actual = %actual,
                "staged artifact no longer matches its digest, replacing"
            );
            clear_dir(&dir)?;
        }

        fs::create_dir_all(&dir)?;
        let dest = dir.join(sanitize_file_name(file_name));
        fs::rename(verified, &dest)?;
        debug!(path = %dest.display(), "artifact staged");
        Ok(dest)
    }
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Keep only the final path component and drop characters Windows rejects
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "artifact".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, data: &[u8]) -> String {
        fs::write(path, data).unwrap();
        compute_digest(path).unwrap()
    }

    #[test]
    fn test_admit_and_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let incoming = tmp.path().join("download.part");
        let digest = write(&incoming, b"payload");

        let path = store.admit(&incoming, &digest, "image.tar.gz").unwrap();
        assert!(path.ends_with(Path::new("sha256").join(&digest).join("image.tar.gz")));
        assert!(!incoming.exists());
        assert_eq!(store.lookup(&digest.to_uppercase()), Some(path));
    }

    #[test]
    fn test_admit_same_digest_collapses() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());

        let first = tmp.path().join("a.part");
        let digest = write(&first, b"payload");
        let p1 = store.admit(&first, &digest, "image.tar.gz").unwrap();

        let second = tmp.path().join("b.part");
        write(&second, b"payload");
        let p2 = store.admit(&second, &digest, "renamed.tar.gz").unwrap();

        assert_eq!(p1, p2);
        assert!(!second.exists());
    }

    #[test]
    fn test_admit_replaces_staged_file_that_changed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());

        let first = tmp.path().join("a.part");
        let digest = write(&first, b"genuine");
        let staged = store.admit(&first, &digest, "wsl.msi").unwrap();
        fs::write(&staged, b"evil!!!").unwrap();

        let second = tmp.path().join("b.part");
        write(&second, b"genuine");
        let path = store.admit(&second, &digest, "wsl.msi").unwrap();

        assert_eq!(compute_digest(&path).unwrap(), digest);
        assert_eq!(fs::read(&path).unwrap(), b"genuine");
        assert!(!second.exists());
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_rejects_non_digest_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        assert!(store.lookup("../../etc").is_none());
        let f = tmp.path().join("x");
        fs::write(&f, b"x").unwrap();
        assert!(store.admit(&f, "nothex", "x").is_err());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../evil.msi"), "evil.msi");
        assert_eq!(sanitize_file_name("a\\b\\c:d.msi"), "cd.msi");
        assert_eq!(sanitize_file_name(".."), "artifact");
    }
}
