//! Recursive dependency resolution.
//!
//! [`DepsResolver`] walks a package's declared dependencies depth-first in
//! manifest order, loads each one through a [`SourceVisitor`], runs every
//! registered resolve function on the edge, then recurses into the
//! dependency's own declarations. The first error aborts the walk.
//!
//! Graph building and lock population are resolve functions, not part of
//! the traversal; [`update_package`] wires up both.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{debug, info};

use kpm_core::checksum;
use kpm_core::version;
use kpm_core::{ContentHash, Dependency, Package, Source};

use crate::config::ResolveOptions;
use crate::downloader::{resolve_latest, Downloader};
use crate::error::{RegistryError, Result};
use crate::graph::{DepGraph, Module};
use crate::visitor::{SourceVisitor, Visitor};

/// Observer of one resolved `(dependency, parent)` edge.
pub type ResolveFn<'a> = Box<dyn FnMut(&Dependency, &Package) -> Result<()> + 'a>;

/// State shared by one top-level resolve call.
struct Session {
    vendor_dir: Option<PathBuf>,
    root_locked: IndexMap<String, Dependency>,
}

pub struct DepsResolver<'a> {
    resolve_fns: Vec<ResolveFn<'a>>,
    downloader: &'a dyn Downloader,
    options: &'a ResolveOptions,
    /// Declared key of each direct dependency -> resolved package name.
    direct_names: IndexMap<String, String>,
}

impl<'a> DepsResolver<'a> {
    pub fn new(downloader: &'a dyn Downloader, options: &'a ResolveOptions) -> Self {
        DepsResolver {
            resolve_fns: Vec::new(),
            downloader,
            options,
            direct_names: IndexMap::new(),
        }
    }

    /// Register a function run on every edge, after those already registered.
    pub fn add_resolve_fn<F>(&mut self, f: F)
    where
        F: FnMut(&Dependency, &Package) -> Result<()> + 'a,
    {
        self.resolve_fns.push(Box::new(f));
    }

    /// The resolved package name of the root's dependency declared as `key`.
    ///
    /// Differs from `key` when the manifest aliases a package.
    pub fn resolved_name(&self, key: &str) -> Option<&str> {
        self.direct_names.get(key).map(String::as_str)
    }

    /// Resolve every dependency of `pkg`, transitively.
    pub fn resolve(&mut self, pkg: &Package) -> Result<()> {
        self.direct_names.clear();
        let session = Session {
            vendor_dir: pkg.vendor_mode.then(|| pkg.vendor_path()),
            root_locked: pkg.locked.clone(),
        };
        let mut ancestry = vec![pkg.name().to_string()];
        self.resolve_pkg(pkg, &session, &mut ancestry)
    }

    /// Bind spec-only sources and pin untagged OCI sources.
    fn normalize(&self, source: &Source) -> Result<Source> {
        let bound = self.options.settings.bind_default_registry(source);
        if bound.is_remote() {
            resolve_latest(self.downloader, &bound)
        } else {
            Ok(bound)
        }
    }

    fn resolve_pkg(&mut self, pkg: &Package, session: &Session, ancestry: &mut Vec<String>) -> Result<()> {
        for (key, declared) in &pkg.dependencies {
            let mut dep = declared.clone();
            dep.source = self.normalize(&dep.source.rebased(&pkg.home_path))?;
            if dep.version.is_empty() {
                if let Ok(oci) = dep.source.as_oci() {
                    dep.version = oci.tag.clone();
                }
            }
            dep.refresh_full_name();

            let visit_source = match session
                .vendor_dir
                .as_deref()
                .and_then(|dir| vendored_copy(dir, key, &dep, &session.root_locked))
            {
                Some(path) => Source::local(path),
                None => dep.source.clone(),
            };
            debug!(parent = %pkg.name(), dependency = %dep.name, source = %visit_source, "visiting");

            let (downloader, options) = (self.downloader, self.options);
            let visitor = SourceVisitor::select(&visit_source, downloader, options);
            visitor.visit(&visit_source, &mut |child: &mut Package| {
                self.on_visit(pkg, key, &mut dep, child, session, ancestry)
            })?;
            if ancestry.len() == 1 {
                self.direct_names.insert(key.clone(), dep.name.clone());
            }
        }
        Ok(())
    }

    fn on_visit(
        &mut self,
        parent: &Package,
        key: &str,
        dep: &mut Dependency,
        child: &mut Package,
        session: &Session,
        ancestry: &mut Vec<String>,
    ) -> Result<()> {
        // The loaded package is authoritative for identity; a synthesized
        // one takes the declared identity instead.
        if child.is_virtual {
            child.info.name = dep.name.clone();
        } else {
            dep.name = child.name().to_string();
        }
        if child.version().is_empty() {
            child.info.version = dep.version.clone();
        } else {
            dep.version = child.version().to_string();
        }
        dep.refresh_full_name();
        dep.local_full_path = Some(child.home_path.clone());

        if ancestry.contains(&dep.name) {
            return Err(RegistryError::DependencyCycle {
                parent: parent.name().to_string(),
                child: dep.name.clone(),
            });
        }

        if dep.source.is_remote() {
            let sum = ContentHash::of_dir(&child.home_path)?.to_string();
            checksum::check(dep, &sum, self.options.no_sum_check)?;
            let locked = session
                .root_locked
                .get(&dep.name)
                .or_else(|| session.root_locked.get(key));
            if let Some(locked) = locked {
                if locked.version == dep.version {
                    checksum::check(locked, &sum, self.options.no_sum_check)?;
                }
            }
            dep.sum = sum;
        }

        for f in self.resolve_fns.iter_mut() {
            f(dep, parent)?;
        }

        ancestry.push(dep.name.clone());
        let result = self.resolve_pkg(child, session, ancestry);
        ancestry.pop();
        result
    }
}

/// The vendored directory standing in for `dep`, if any.
///
/// Vendoring names each directory after the resolved version, which may
/// differ from the declared tag (`1.28` resolving to a package at
/// `1.28.0`). The declared full name is tried first, then the lock entry,
/// then any vendored package of the same name at or above the declared
/// version.
fn vendored_copy(
    vendor_dir: &Path,
    key: &str,
    dep: &Dependency,
    root_locked: &IndexMap<String, Dependency>,
) -> Option<PathBuf> {
    if dep.is_local() {
        return None;
    }
    let not_older = |v: &str| version::compare(v, &dep.version) != Ordering::Less;

    let declared = vendor_dir.join(&dep.full_name);
    if declared.is_dir() {
        return Some(declared);
    }
    if let Some(locked) = root_locked.get(key).or_else(|| root_locked.get(&dep.name)) {
        let path = vendor_dir.join(&locked.full_name);
        if same_origin(locked, dep) && not_older(&locked.version) && path.is_dir() {
            return Some(path);
        }
    }

    let mut names = vec![dep.name.clone()];
    if let Ok(oci) = dep.source.as_oci() {
        names.push(oci.repo_name().to_string());
    }
    std::fs::read_dir(vendor_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            names.iter().any(|n| file_name.starts_with(&format!("{n}_")))
        })
        .filter_map(|entry| Package::load(&entry.path()).ok())
        .filter(|p| names.iter().any(|n| n == p.name()) && not_older(p.version()))
        .max_by(|a, b| version::compare(a.version(), b.version()))
        .map(|p| p.home_path)
}

/// Add the edge `parent -> dep` to `graph`.
pub fn record_edge(graph: &mut DepGraph, dep: &Dependency, parent: &Package) -> Result<()> {
    let from = Module::new(parent.name(), parent.version());
    let to = Module::new(dep.name.as_str(), dep.version.as_str());
    graph.add_vertex(from.clone());
    graph.add_vertex(to.clone());
    graph.add_edge(&from, &to)
}

/// Record `dep` in `locked`, keeping one entry per name.
///
/// The greater version wins. A git dependency is never replaced and never
/// replaces: the first one seen stays. The same version of a name from two
/// different origins is an error.
pub fn arbitrate(locked: &mut IndexMap<String, Dependency>, dep: &Dependency) -> Result<()> {
    let Some(existing) = locked.get(&dep.name) else {
        locked.insert(dep.name.clone(), dep.clone());
        return Ok(());
    };
    if existing.source.is_git() || dep.source.is_git() {
        return Ok(());
    }
    match version::compare(&dep.version, &existing.version) {
        Ordering::Greater => {
            debug!(name = %dep.name, from = %existing.version, to = %dep.version, "newer version wins");
            locked.insert(dep.name.clone(), dep.clone());
            Ok(())
        }
        Ordering::Equal if !same_origin(existing, dep) => Err(RegistryError::ConflictingSources {
            name: dep.name.clone(),
            version: dep.version.clone(),
            first: existing.source.to_string(),
            second: dep.source.to_string(),
        }),
        _ => Ok(()),
    }
}

fn same_origin(a: &Dependency, b: &Dependency) -> bool {
    let sub = |d: &Dependency| d.source.mod_spec().map(|s| s.name.clone());
    if sub(a) != sub(b) {
        return false;
    }
    if let (Ok(x), Ok(y)) = (a.source.as_oci(), b.source.as_oci()) {
        return x.reg == y.reg && x.repo == y.repo;
    }
    if a.is_local() && b.is_local() {
        if let (Some(x), Some(y)) = (&a.local_full_path, &b.local_full_path) {
            let canon = |p: &PathBuf| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone());
            return canon(x) == canon(y);
        }
    }
    a.source == b.source
}

/// Resolve `pkg`, replace its lock state with the result and return the
/// dependency graph.
///
/// Declared dependencies receive their resolved sum and path; transitive
/// dependencies only appear in the lock state.
pub fn update_package(
    pkg: &mut Package,
    downloader: &dyn Downloader,
    options: &ResolveOptions,
) -> Result<DepGraph> {
    let mut graph = DepGraph::new();
    graph.add_vertex(Module::new(pkg.name(), pkg.version()));
    let mut locked = IndexMap::new();
    let direct_names = {
        let mut resolver = DepsResolver::new(downloader, options);
        resolver.add_resolve_fn(|dep, parent| record_edge(&mut graph, dep, parent));
        resolver.add_resolve_fn(|dep, _| arbitrate(&mut locked, dep));
        resolver.resolve(pkg)?;
        resolver.direct_names.clone()
    };

    for (key, dep) in pkg.dependencies.iter_mut() {
        let name = direct_names.get(key).unwrap_or(key);
        if let Some(resolved) = locked.get(name) {
            dep.sum = resolved.sum.clone();
            dep.local_full_path = resolved.local_full_path.clone();
        }
    }
    info!(package = %pkg.name(), resolved = locked.len(), "dependencies resolved");
    pkg.locked = locked;
    Ok(graph)
}
