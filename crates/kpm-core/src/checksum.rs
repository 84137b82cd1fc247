//! Content checksums for package trees.
//!
//! A package's sum is the SHA-256 over its sorted relative file paths and
//! file contents. Publishing records it in the artifact's manifest
//! annotations; resolution compares it against the sum in the lock file.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{CoreError, Result};
use crate::package::Dependency;

/// A content hash (SHA-256 hex digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Compute the SHA-256 hash of the given data.
    pub fn compute(data: &[u8]) -> Self {
        ContentHash(hex::encode(Sha256::digest(data)))
    }

    /// Hash a directory tree. `.git` directories are skipped.
    ///
    /// Each file contributes its `/`-separated relative path, a NUL byte,
    /// its length and its bytes, so renames and moves change the hash.
    pub fn of_dir(root: &Path) -> Result<Self> {
        let mut hasher = Sha256::new();
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
        {
            let entry = entry.map_err(|e| CoreError::Walk {
                path: root.to_path_buf(),
                detail: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let data = std::fs::read(entry.path())?;
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            hasher.update((data.len() as u64).to_le_bytes());
            hasher.update(&data);
        }
        Ok(ContentHash(hex::encode(hasher.finalize())))
    }

    /// Get the hex string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check a dependency's recorded sum against a trusted sum.
///
/// Passes when verification is disabled, the dependency is local, or no
/// sum has been recorded yet.
pub fn check(dep: &Dependency, trusted: &str, no_sum_check: bool) -> Result<()> {
    if dep.is_local() || dep.sum.is_empty() {
        return Ok(());
    }
    if dep.sum == trusted {
        return Ok(());
    }
    if no_sum_check {
        warn!(
            name = %dep.name,
            expected = %dep.sum,
            actual = %trusted,
            "checksum mismatch ignored"
        );
        return Ok(());
    }
    Err(CoreError::ChecksumMismatch {
        name: dep.name.clone(),
        expected: dep.sum.clone(),
        actual: trusted.to_string(),
    })
}
