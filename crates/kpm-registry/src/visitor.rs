//! Visitors turn a [`Source`] into a loaded [`Package`].
//!
//! Each visitor loads the package, hands it to a callback, and releases
//! whatever it needed to get there (temporary directories) before
//! returning, whether the callback succeeded or not. [`SourceVisitor`] picks
//! the right one for a source:
//!
//! | source                        | visitor             |
//! |-------------------------------|---------------------|
//! | git, oci, registry, spec-only | `RemoteVisitor`     |
//! | local `.tar` / `.tgz`         | `ArchiveVisitor`    |
//! | local path with a manifest    | `PkgVisitor`        |
//! | local path without one        | `VirtualPkgVisitor` |

use std::path::{Path, PathBuf};

use tracing::debug;

use kpm_core::{ModSpec, Package, Source, SourceKind, MANIFEST_FILE};

use crate::archive;
use crate::cache::Cache;
use crate::config::ResolveOptions;
use crate::downloader::{resolve_latest, DownloadOptions, Downloader};
use crate::error::{RegistryError, Result};

/// Callback receiving a visited package.
pub type VisitFn<'f> = dyn FnMut(&mut Package) -> Result<()> + 'f;

pub trait Visitor {
    /// Load `source` and run `f` on it. Fails without calling `f` when the
    /// source is not one this visitor handles.
    fn visit(&self, source: &Source, f: &mut VisitFn<'_>) -> Result<()>;
}

fn mismatch(visitor: &'static str, source: &Source) -> RegistryError {
    RegistryError::VisitorMismatch {
        visitor,
        source_str: source.to_string(),
    }
}

/// Load the package at `root`, or the sub-package `spec` names inside it.
fn load_package(root: &Path, spec: Option<&ModSpec>) -> Result<Package> {
    Ok(match spec {
        Some(spec) => Package::load_sub_package(root, spec)?,
        None => Package::load(root)?,
    })
}

/// A package that already exists on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct PkgVisitor;

impl Visitor for PkgVisitor {
    fn visit(&self, source: &Source, f: &mut VisitFn<'_>) -> Result<()> {
        if !source.is_local_path() || source.is_local_archive() {
            return Err(mismatch("PkgVisitor", source));
        }
        let root = source.find_root_path()?;
        let mut pkg = load_package(&root, source.mod_spec())?;
        f(&mut pkg)
    }
}

/// A bare directory of source files with no manifest.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualPkgVisitor;

impl VirtualPkgVisitor {
    /// A fresh, never-repeating package name.
    pub fn generate_name() -> String {
        format!("virtual_{}", uuid::Uuid::new_v4().simple())
    }
}

impl Visitor for VirtualPkgVisitor {
    fn visit(&self, source: &Source, f: &mut VisitFn<'_>) -> Result<()> {
        if !source.is_local_path() || source.is_local_archive() {
            return Err(mismatch("VirtualPkgVisitor", source));
        }
        let root = source.find_root_path()?;
        let mut pkg = Package::new_virtual(VirtualPkgVisitor::generate_name(), root);
        debug!(name = %pkg.name(), path = %pkg.home_path.display(), "synthesized package");
        f(&mut pkg)
    }
}

/// A git, OCI or registry source, fetched through the cache or a download area.
pub struct RemoteVisitor<'a> {
    pub downloader: &'a dyn Downloader,
    pub options: &'a ResolveOptions,
}

impl<'a> RemoteVisitor<'a> {
    pub fn new(downloader: &'a dyn Downloader, options: &'a ResolveOptions) -> Self {
        RemoteVisitor {
            downloader,
            options,
        }
    }

    fn download_opts(&self, source: &Source, local_path: PathBuf) -> DownloadOptions {
        DownloadOptions {
            source: source.clone(),
            local_path,
            artifact_path: None,
            platform: self.options.platform.clone(),
        }
    }

    fn visit_cached(&self, source: &Source, f: &mut VisitFn<'_>) -> Result<()> {
        let cache = Cache::new(&self.options.cache_root);
        let root = match cache.find(source) {
            Ok(path) => path,
            Err(e) if e.is_cache_miss() => cache.update(source, |entry| {
                let mut opts = self.download_opts(source, entry.source_path.clone());
                opts.artifact_path = Some(entry.artifact_path.clone());
                self.downloader.download(&opts)
            })?,
            Err(e) => return Err(e),
        };
        self.load_and_call(source, &root, f)
    }

    fn visit_in_space(&self, space: &Path, source: &Source, f: &mut VisitFn<'_>) -> Result<()> {
        let root = space.join(source.to_file_path());
        if !root.is_dir() {
            if let Err(e) = self.downloader.download(&self.download_opts(source, root.clone())) {
                if root.exists() {
                    let _ = std::fs::remove_dir_all(&root);
                }
                return Err(e);
            }
        }
        self.load_and_call(source, &root, f)
    }

    fn visit_in_tempdir(&self, source: &Source, f: &mut VisitFn<'_>) -> Result<()> {
        // Dropping the TempDir removes it on every path out of this function.
        let tmp = tempfile::Builder::new().prefix("kpm-visit-").tempdir()?;
        let root = tmp.path().join("pkg");
        self.downloader.download(&self.download_opts(source, root.clone()))?;
        self.load_and_call(source, &root, f)
    }

    fn load_and_call(&self, source: &Source, root: &Path, f: &mut VisitFn<'_>) -> Result<()> {
        let mut pkg = match source.mod_spec() {
            Some(spec) => {
                let pkg = Package::load_sub_package(root, spec)?;
                check_pinned_version(source, &spec.name, &spec.version, &pkg)?;
                pkg
            }
            None if root.join(MANIFEST_FILE).is_file() => {
                let pkg = Package::load(root)?;
                // `name:version` shorthand binds to a registry source carrying the pin.
                if let SourceKind::Registry(r) = source.kind() {
                    check_pinned_version(source, &r.name, &r.version, &pkg)?;
                }
                pkg
            }
            None => Package::new_virtual(remote_name(source), root),
        };
        f(&mut pkg)
    }
}

/// Fail unless `pkg` has the version `expected`; an empty pin accepts any.
fn check_pinned_version(source: &Source, name: &str, expected: &str, pkg: &Package) -> Result<()> {
    if expected.is_empty() || pkg.version() == expected {
        return Ok(());
    }
    Err(RegistryError::VersionMismatch {
        name: name.to_string(),
        source_str: source.to_string(),
        expected: expected.to_string(),
        actual: pkg.version().to_string(),
    })
}

/// Repository name of a remote source, used for manifest-less trees.
fn remote_name(source: &Source) -> String {
    match source.kind() {
        SourceKind::Git(g) => g.repo_name(),
        SourceKind::Oci(o) => o.repo_name().to_string(),
        SourceKind::Registry(r) => r.name.clone(),
        SourceKind::Local(_) | SourceKind::SpecOnly => VirtualPkgVisitor::generate_name(),
    }
}

impl Visitor for RemoteVisitor<'_> {
    fn visit(&self, source: &Source, f: &mut VisitFn<'_>) -> Result<()> {
        if !source.is_remote() {
            return Err(mismatch("RemoteVisitor", source));
        }
        let bound = self.options.settings.bind_default_registry(source);
        let pinned = resolve_latest(self.downloader, &bound)?;

        if self.options.enable_cache {
            self.visit_cached(&pinned, f)
        } else if let Some(space) = &self.options.visited_space {
            self.visit_in_space(space, &pinned, f)
        } else {
            self.visit_in_tempdir(&pinned, f)
        }
    }
}

/// A local `.tar` or `.tgz` package archive.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveVisitor;

impl Visitor for ArchiveVisitor {
    fn visit(&self, source: &Source, f: &mut VisitFn<'_>) -> Result<()> {
        if !source.is_local_archive() {
            return Err(mismatch("ArchiveVisitor", source));
        }
        let path = &source.as_local()?.path;
        let tmp = tempfile::Builder::new().prefix("kpm-archive-").tempdir()?;
        if source.is_local_tgz_path() {
            archive::extract_tgz(path, tmp.path())?;
        } else {
            archive::extract_tar(path, tmp.path())?;
        }
        let root = archive_root(tmp.path())?;
        let mut pkg = load_package(&root, source.mod_spec())?;
        f(&mut pkg)
    }
}

/// The extracted directory, or its single top-level directory when the
/// archive wraps the package in one.
fn archive_root(dir: &Path) -> Result<PathBuf> {
    if dir.join(MANIFEST_FILE).is_file() {
        return Ok(dir.to_path_buf());
    }
    let entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    match entries.as_slice() {
        [only] if only.is_dir() && only.join(MANIFEST_FILE).is_file() => Ok(only.clone()),
        _ => Ok(dir.to_path_buf()),
    }
}

/// The visitor for a source.
pub enum SourceVisitor<'a> {
    Pkg(PkgVisitor),
    Virtual(VirtualPkgVisitor),
    Remote(RemoteVisitor<'a>),
    Archive(ArchiveVisitor),
}

impl<'a> SourceVisitor<'a> {
    pub fn select(
        source: &Source,
        downloader: &'a dyn Downloader,
        options: &'a ResolveOptions,
    ) -> Self {
        if source.is_remote() {
            return SourceVisitor::Remote(RemoteVisitor::new(downloader, options));
        }
        if source.is_local_archive() {
            return SourceVisitor::Archive(ArchiveVisitor);
        }
        match source.find_root_path() {
            Ok(root) if !root.join(MANIFEST_FILE).is_file() && source.mod_spec().is_none() => {
                SourceVisitor::Virtual(VirtualPkgVisitor)
            }
            // A missing path surfaces its error from PkgVisitor.
            _ => SourceVisitor::Pkg(PkgVisitor),
        }
    }
}

impl Visitor for SourceVisitor<'_> {
    fn visit(&self, source: &Source, f: &mut VisitFn<'_>) -> Result<()> {
        match self {
            SourceVisitor::Pkg(v) => v.visit(source, f),
            SourceVisitor::Virtual(v) => v.visit(source, f),
            SourceVisitor::Remote(v) => v.visit(source, f),
            SourceVisitor::Archive(v) => v.visit(source, f),
        }
    }
}
