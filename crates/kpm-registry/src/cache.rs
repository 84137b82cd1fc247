//! Two-tier on-disk package cache.
//!
//! Every remote source maps to a fixed pair of directories, computed from
//! the source's identity alone:
//!
//! ```text
//! <cache_root>/
//!   oci/
//!     src/<bucket>/<name>_<tag>      extracted, usable package tree
//!     cache/<bucket>/<name>_<tag>    raw downloaded artifact
//!   git/
//!     src/<bucket>/<name>_<ref>
//!     cache/<bucket>/<name>_<ref>
//! ```
//!
//! `bucket` is a short SHA-256 prefix of `<host>/<repository>`, which keeps
//! same-named repositories from different places apart and bounds the
//! fan-out of the top-level directories. The cache never fetches anything
//! itself: [`Cache::update`] hands the entry's paths to a caller-supplied
//! closure that populates them. It also does no locking; see
//! [`crate::lock::CacheLock`].

use std::path::{Path, PathBuf};

use tracing::debug;

use kpm_core::{ContentHash, Source, SourceKind};

use crate::error::{RegistryError, Result};

const SRC_TIER: &str = "src";
const ARTIFACT_TIER: &str = "cache";
const BUCKET_LEN: usize = 16;
const REF_HASH_LEN: usize = 8;

/// The two paths of one cached source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Extracted package tree.
    pub source_path: PathBuf,
    /// Raw artifact (archive) as downloaded.
    pub artifact_path: PathBuf,
}

/// A package cache backed by the filesystem.
#[derive(Debug, Clone)]
pub struct Cache {
    /// Root directory for the cache.
    root: PathBuf,
}

struct CacheKey {
    scheme: &'static str,
    bucket: String,
    dir_name: String,
}

impl Cache {
    /// Create a cache rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Cache { root: root.into() }
    }

    /// Get the root directory of this cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths a source is (or would be) cached at. Pure; touches neither
    /// the network nor the filesystem.
    pub fn entry(&self, source: &Source) -> Result<CacheEntry> {
        let key = cache_key(source)?;
        let scheme_dir = self.root.join(key.scheme);
        Ok(CacheEntry {
            source_path: scheme_dir.join(SRC_TIER).join(&key.bucket).join(&key.dir_name),
            artifact_path: scheme_dir
                .join(ARTIFACT_TIER)
                .join(&key.bucket)
                .join(&key.dir_name),
        })
    }

    /// The extracted tree of a cached source.
    ///
    /// Fails with [`RegistryError::CacheMiss`] when the source has not been
    /// cached, so callers can tell "download it" apart from real failures.
    pub fn find(&self, source: &Source) -> Result<PathBuf> {
        let entry = self.entry(source)?;
        if entry.source_path.is_dir() {
            debug!(source = %source, path = %entry.source_path.display(), "cache hit");
            Ok(entry.source_path)
        } else {
            Err(RegistryError::CacheMiss {
                source_str: source.to_string(),
            })
        }
    }

    /// The raw artifact directory of a cached source.
    pub fn find_artifact(&self, source: &Source) -> Result<PathBuf> {
        let entry = self.entry(source)?;
        if entry.artifact_path.is_dir() {
            Ok(entry.artifact_path)
        } else {
            Err(RegistryError::CacheMiss {
                source_str: source.to_string(),
            })
        }
    }

    /// Populate the entry for `source` through `fill`.
    ///
    /// The entry's parent directories exist when `fill` runs. If `fill`
    /// fails, whatever it wrote is removed so a later [`Cache::find`]
    /// misses instead of returning a partial tree.
    pub fn update<F>(&self, source: &Source, fill: F) -> Result<PathBuf>
    where
        F: FnOnce(&CacheEntry) -> Result<()>,
    {
        let entry = self.entry(source)?;
        for dir in [&entry.source_path, &entry.artifact_path] {
            if let Some(parent) = dir.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RegistryError::CacheError {
                    path: parent.to_path_buf(),
                    detail: format!("creating cache dir: {e}"),
                })?;
            }
        }

        if let Err(e) = fill(&entry) {
            for dir in [&entry.source_path, &entry.artifact_path] {
                if dir.exists() {
                    let _ = std::fs::remove_dir_all(dir);
                }
            }
            return Err(e);
        }

        if !entry.source_path.is_dir() {
            return Err(RegistryError::CacheError {
                path: entry.source_path,
                detail: format!("populating '{source}' produced no package tree"),
            });
        }
        debug!(source = %source, path = %entry.source_path.display(), "cache updated");
        Ok(entry.source_path)
    }

    /// Remove a source from the cache. Returns whether anything was removed.
    pub fn remove(&self, source: &Source) -> Result<bool> {
        let entry = self.entry(source)?;
        let mut removed = false;
        for dir in [entry.source_path, entry.artifact_path] {
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir).map_err(|e| RegistryError::CacheError {
                    path: dir.clone(),
                    detail: format!("removing cache entry: {e}"),
                })?;
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Remove every cached source. The lock file, if any, is kept.
    pub fn remove_all(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.root).map_err(|e| RegistryError::CacheError {
            path: self.root.clone(),
            detail: format!("listing cache: {e}"),
        })? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path).map_err(|e| RegistryError::CacheError {
                    path: path.clone(),
                    detail: format!("removing: {e}"),
                })?;
            }
        }
        Ok(())
    }

    /// Every extracted tree in the cache, sorted.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for scheme in ["oci", "git"] {
            let tier = self.root.join(scheme).join(SRC_TIER);
            if !tier.is_dir() {
                continue;
            }
            for bucket in std::fs::read_dir(&tier)? {
                let bucket = bucket?.path();
                if !bucket.is_dir() {
                    continue;
                }
                for entry in std::fs::read_dir(&bucket)? {
                    let path = entry?.path();
                    if path.is_dir() {
                        out.push(path);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn cache_key(source: &Source) -> Result<CacheKey> {
    let not_cacheable = |detail: &str| RegistryError::CacheError {
        path: PathBuf::new(),
        detail: format!("'{source}' {detail}"),
    };

    match source.kind() {
        SourceKind::Oci(_) | SourceKind::Registry(_) => {
            let oci = source.as_oci()?;
            let reference = match source.kind() {
                SourceKind::Registry(r) if oci.tag.is_empty() => r.version.as_str(),
                _ => oci.tag.as_str(),
            };
            if reference.is_empty() {
                return Err(not_cacheable("has no tag; resolve the latest tag first"));
            }
            Ok(CacheKey {
                scheme: "oci",
                bucket: bucket(&format!("{}/{}", oci.reg, oci.repo)),
                dir_name: format!("{}_{}", oci.repo_name(), sanitize(reference)),
            })
        }
        SourceKind::Git(git) => {
            let reference = git.reference()?;
            let (host, path) = git.host_and_path();
            Ok(CacheKey {
                scheme: "git",
                bucket: bucket(&format!("{host}/{path}")),
                dir_name: format!("{}_{}", git.repo_name(), sanitize(reference.as_str())),
            })
        }
        SourceKind::Local(_) => Err(not_cacheable("is local and is never cached")),
        SourceKind::SpecOnly => Err(not_cacheable("is not bound to a registry")),
    }
}

fn bucket(identity: &str) -> String {
    let hash = ContentHash::compute(identity.as_bytes());
    hash.as_str()[..BUCKET_LEN].to_string()
}

/// A path-safe form of a reference. A reference that had to be rewritten
/// gets a short hash of the original so `a/b` and `a_b` stay distinct.
fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect();
    if cleaned == s {
        return cleaned;
    }
    let hash = ContentHash::compute(s.as_bytes());
    format!("{cleaned}-{}", &hash.as_str()[..REF_HASH_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpm_core::{GitSource, ModSpec, OciSource};

    fn helloworld() -> Source {
        Source::oci("ghcr.io", "kcl-lang/helloworld", "0.1.2")
    }

    #[test]
    fn rewritten_references_do_not_collide() {
        let cache = Cache::new("/tmp/kpm-cache");
        let git = |branch: &str| {
            Source::git(GitSource::new("https://github.com/kcl-lang/flask").with_branch(branch))
        };
        let slash = cache.entry(&git("a/b")).unwrap();
        let underscore = cache.entry(&git("a_b")).unwrap();
        assert_ne!(slash.source_path, underscore.source_path);
        assert!(underscore.source_path.ends_with("flask_a_b"));
        assert_eq!(slash, cache.entry(&git("a/b")).unwrap());
        assert_eq!(sanitize("0.1.2"), "0.1.2");
    }

    #[test]
    fn entry_paths_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());

        let first = cache.entry(&helloworld()).unwrap();
        let second = cache.entry(&helloworld()).unwrap();
        assert_eq!(first, second);
        assert!(!first.source_path.exists());

        let rel = first.source_path.strip_prefix(dir.path()).unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(parts[0], "oci");
        assert_eq!(parts[1], "src");
        assert_eq!(parts[2].len(), BUCKET_LEN);
        assert_eq!(parts[3], "helloworld_0.1.2");
    }

    #[test]
    fn same_name_different_repo_do_not_collide() {
        let cache = Cache::new("/cache");
        let a = cache.entry(&Source::oci("ghcr.io", "org-a/k8s", "1.0")).unwrap();
        let b = cache.entry(&Source::oci("ghcr.io", "org-b/k8s", "1.0")).unwrap();
        assert_ne!(a.source_path, b.source_path);
    }

    #[test]
    fn registry_and_oci_share_an_entry() {
        let cache = Cache::new("/cache");
        let reg = Source::registry(
            "helloworld",
            "0.1.2",
            OciSource::new("ghcr.io", "kcl-lang/helloworld", "0.1.2"),
        );
        assert_eq!(cache.entry(&reg).unwrap(), cache.entry(&helloworld()).unwrap());
    }

    #[test]
    fn git_entries_use_the_ref() {
        let cache = Cache::new("/cache");
        let src = Source::git(GitSource::new("https://github.com/kcl-lang/flask.git").with_commit("ade147b"));
        let entry = cache.entry(&src).unwrap();
        assert!(entry.source_path.ends_with("flask_ade147b"));
        assert!(entry.source_path.starts_with("/cache/git/src"));

        let ambiguous = Source::git(GitSource::new("https://github.com/a/b"));
        assert!(cache.entry(&ambiguous).is_err());
    }

    #[test]
    fn uncacheable_sources() {
        let cache = Cache::new("/cache");
        assert!(cache.entry(&Source::local("/tmp/x")).is_err());
        assert!(cache.entry(&Source::oci("ghcr.io", "a/b", "")).is_err());
        let spec = Source::spec_only(ModSpec::new("x", "1")).unwrap();
        assert!(cache.entry(&spec).is_err());
    }

    #[test]
    fn find_misses_then_hits_after_update() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());

        let miss = cache.find(&helloworld()).unwrap_err();
        assert!(miss.is_cache_miss());

        let path = cache
            .update(&helloworld(), |entry| {
                std::fs::create_dir_all(&entry.source_path)?;
                std::fs::write(entry.source_path.join("main.k"), "a = 1")?;
                Ok(())
            })
            .unwrap();

        assert_eq!(cache.find(&helloworld()).unwrap(), path);
        assert!(path.join("main.k").is_file());
    }

    #[test]
    fn failed_update_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());

        let err = cache
            .update(&helloworld(), |entry| {
                std::fs::create_dir_all(&entry.source_path)?;
                std::fs::write(entry.source_path.join("partial"), "x")?;
                Err(RegistryError::Download {
                    source_str: "x".to_string(),
                    path: entry.source_path.clone(),
                    detail: "connection reset".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::Download { .. }));
        assert!(cache.find(&helloworld()).unwrap_err().is_cache_miss());
    }

    #[test]
    fn remove_and_remove_all() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let other = Source::oci("ghcr.io", "kcl-lang/k8s", "1.28");

        for src in [helloworld(), other.clone()] {
            cache
                .update(&src, |e| Ok(std::fs::create_dir_all(&e.source_path)?))
                .unwrap();
        }
        assert_eq!(cache.list().unwrap().len(), 2);

        assert!(cache.remove(&helloworld()).unwrap());
        assert!(!cache.remove(&helloworld()).unwrap());
        assert!(cache.find(&other).is_ok());

        std::fs::write(dir.path().join(".kpm.lock"), "").unwrap();
        cache.remove_all().unwrap();
        assert!(cache.find(&other).unwrap_err().is_cache_miss());
        assert!(dir.path().join(".kpm.lock").is_file());
    }
}
