//! Vendoring: copying every resolved remote dependency into the package's
//! `vendor/` directory so later builds need no network.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{debug, info};

use kpm_core::{Dependency, Package};

use crate::config::ResolveOptions;
use crate::downloader::Downloader;
use crate::error::{RegistryError, Result};
use crate::resolver::{arbitrate, DepsResolver};

const VISITED_DIR: &str = "visited";

/// Resolve `pkg` and arbitrate one entry per name.
fn resolve_locked(
    pkg: &Package,
    downloader: &dyn Downloader,
    options: &ResolveOptions,
) -> Result<IndexMap<String, Dependency>> {
    let mut locked = IndexMap::new();
    let mut resolver = DepsResolver::new(downloader, options);
    resolver.add_resolve_fn(|dep, _| arbitrate(&mut locked, dep));
    resolver.resolve(pkg)?;
    drop(resolver);
    Ok(locked)
}

/// Options whose downloads outlive the visit, so resolved paths stay usable.
fn with_stable_paths(options: &ResolveOptions) -> ResolveOptions {
    let mut opts = options.clone();
    if !opts.enable_cache && opts.visited_space.is_none() {
        opts.visited_space = Some(opts.cache_root.join(VISITED_DIR));
    }
    opts
}

/// Vendor every remote dependency of `pkg` into `pkg.vendor_path()`.
///
/// Returns the arbitrated dependency set with `local_full_path` pointing at
/// the vendored copies. Vendor entries not in that set are removed. Local
/// dependencies are never copied.
pub fn vendor_deps(
    pkg: &Package,
    downloader: &dyn Downloader,
    options: &ResolveOptions,
) -> Result<IndexMap<String, Dependency>> {
    let mut work = pkg.clone();
    work.vendor_mode = false;
    let opts = with_stable_paths(options);
    let mut locked = resolve_locked(&work, downloader, &opts)?;

    let vendor_dir = pkg.vendor_path();
    std::fs::create_dir_all(&vendor_dir)?;
    for dep in locked.values_mut() {
        if dep.is_local() {
            continue;
        }
        let target = vendor_dir.join(&dep.full_name);
        if !target.is_dir() {
            let from = dep.local_full_path.clone().ok_or_else(|| RegistryError::Download {
                source_str: dep.source.to_string(),
                path: target.clone(),
                detail: "dependency was resolved without a local path".to_string(),
            })?;
            copy_tree(&from, &target)?;
            debug!(name = %dep.full_name, from = %from.display(), "vendored");
        }
        dep.local_full_path = Some(target);
    }

    let keep: Vec<&str> = locked.values().map(|d| d.full_name.as_str()).collect();
    for entry in std::fs::read_dir(&vendor_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !keep.iter().any(|k| name.as_os_str() == *k) {
            debug!(path = %entry.path().display(), "removing stale vendor entry");
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
    }
    info!(package = %pkg.name(), vendored = keep.len(), path = %vendor_dir.display(), "vendor directory updated");
    Ok(locked)
}

/// Resolve `pkg` and map every dependency name to the directory holding it.
///
/// In vendor mode vendored copies are used where present. The returned
/// directories remain on disk after this call.
pub fn resolve_deps_into_map(
    pkg: &Package,
    downloader: &dyn Downloader,
    options: &ResolveOptions,
) -> Result<IndexMap<String, PathBuf>> {
    let opts = with_stable_paths(options);
    let locked = resolve_locked(pkg, downloader, &opts)?;
    Ok(locked
        .into_iter()
        .filter_map(|(name, dep)| dep.local_full_path.map(|p| (name, p)))
        .collect())
}

/// Copy `from` into a new directory `to`, skipping `.git`.
///
/// Files are copied, never linked: vendored trees are edited in place and
/// must not write through to the shared cache.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let mut staging = to.as_os_str().to_owned();
    staging.push(".partial");
    let staging = PathBuf::from(staging);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    let copy = || -> Result<()> {
        for entry in walkdir::WalkDir::new(from)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
        {
            let entry = entry.map_err(|e| RegistryError::CacheError {
                path: from.to_path_buf(),
                detail: e.to_string(),
            })?;
            let rel = entry.path().strip_prefix(from).map_err(|e| RegistryError::CacheError {
                path: entry.path().to_path_buf(),
                detail: e.to_string(),
            })?;
            let dest = staging.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&dest)?;
            } else {
                std::fs::copy(entry.path(), &dest)?;
            }
        }
        Ok(())
    };
    if let Err(e) = copy() {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }
    std::fs::rename(&staging, to)?;
    Ok(())
}
