//! Minimal version selection over a [`DepGraph`].
//!
//! The build list holds one version per module path: the greatest version
//! any reachable requirement asks for. Git versions are opaque and never
//! compared; the first one seen stays.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use kpm_core::version::{self, NONE};
use kpm_core::{Package, Source};

use crate::downloader::Downloader;
use crate::error::{RegistryError, Result};
use crate::graph::{DepGraph, Module};

/// The requirement source MVS runs against.
pub trait Reqs {
    /// Direct requirements of `m`.
    fn required(&self, m: &Module) -> Result<Vec<Module>>;

    /// The greater of two versions of `path`.
    fn max(&self, path: &str, v1: &str, v2: &str) -> String;

    /// The newest available version of `m`, or `m` itself.
    fn upgrade(&self, m: &Module) -> Result<Module>;

    /// The version before `m`, `none` when there is none.
    fn previous(&self, m: &Module) -> Result<Module>;
}

/// [`Reqs`] backed by a resolved graph and each module's source.
pub struct ReqsGraph<'a> {
    graph: &'a DepGraph,
    sources: HashMap<String, Source>,
    downloader: Option<&'a dyn Downloader>,
}

impl<'a> ReqsGraph<'a> {
    pub fn new(
        graph: &'a DepGraph,
        sources: HashMap<String, Source>,
        downloader: Option<&'a dyn Downloader>,
    ) -> Self {
        ReqsGraph {
            graph,
            sources,
            downloader,
        }
    }

    /// Sources taken from a package's lock state.
    pub fn from_package(
        graph: &'a DepGraph,
        pkg: &Package,
        downloader: Option<&'a dyn Downloader>,
    ) -> Self {
        let sources = pkg
            .locked
            .values()
            .map(|d| (d.name.clone(), d.source.clone()))
            .collect();
        ReqsGraph::new(graph, sources, downloader)
    }

    fn is_git(&self, path: &str) -> bool {
        self.sources.get(path).is_some_and(Source::is_git)
    }

    /// Published versions, or `None` where versions are not ordered.
    fn versions(&self, m: &Module) -> Result<Option<Vec<String>>> {
        let (Some(source), Some(downloader)) = (self.sources.get(&m.path), self.downloader) else {
            return Ok(None);
        };
        if source.is_git() || source.is_local_path() {
            return Ok(None);
        }
        Ok(Some(downloader.list_versions(source)?))
    }
}

impl Reqs for ReqsGraph<'_> {
    /// Versions that never took part in resolution have no known
    /// requirements and are leaves.
    fn required(&self, m: &Module) -> Result<Vec<Module>> {
        if !self.graph.contains(m) && !self.graph.versions_of(&m.path).is_empty() {
            return Ok(Vec::new());
        }
        self.graph.required(m)
    }

    fn max(&self, path: &str, v1: &str, v2: &str) -> String {
        if self.is_git(path) {
            let kept = if version::is_none(v1) { v2 } else { v1 };
            return kept.to_string();
        }
        version::max(v1, v2).to_string()
    }

    fn upgrade(&self, m: &Module) -> Result<Module> {
        let Some(versions) = self.versions(m)? else {
            return Ok(m.clone());
        };
        let latest = version::latest(versions.iter().map(String::as_str)).unwrap_or(NONE);
        Ok(Module::new(m.path.clone(), self.max(&m.path, &m.version, latest)))
    }

    fn previous(&self, m: &Module) -> Result<Module> {
        let Some(versions) = self.versions(m)? else {
            return Ok(m.clone());
        };
        let prev = version::previous(versions.iter().map(String::as_str), &m.version).unwrap_or(NONE);
        Ok(Module::new(m.path.clone(), prev))
    }
}

/// The build list of `target`: target first, then one module per path,
/// sorted by path.
pub fn build_list(target: &Module, reqs: &dyn Reqs) -> Result<Vec<Module>> {
    build_list_with(target, &[], &[], reqs)
}

/// The build list of `target` with explicit upgrade and downgrade requests.
///
/// `upgrades` become extra requirements of `target`; they may name modules
/// the graph has never seen, which are then leaves. `downgrades` cap their
/// paths as in [`downgrade_build_list`], and also cap any upgrade of the
/// same path.
pub fn build_list_with(
    target: &Module,
    upgrades: &[Module],
    downgrades: &[Module],
    reqs: &dyn Reqs,
) -> Result<Vec<Module>> {
    let mut limits = HashMap::new();
    for d in downgrades {
        if d.path == target.path {
            return Err(RegistryError::CannotDowngrade {
                module: target.to_string(),
                limit: d.version.clone(),
            });
        }
        limits.insert(d.path.clone(), d.version.clone());
    }
    select(target, upgrades, &limits, reqs)
}

/// The build list with `upgrades` added as extra requirements of `target`.
pub fn upgrade_build_list(target: &Module, upgrades: &[Module], reqs: &dyn Reqs) -> Result<Vec<Module>> {
    build_list_with(target, upgrades, &[], reqs)
}

/// Upgrade every module of the build list to its newest version.
pub fn upgrade_all(target: &Module, reqs: &dyn Reqs) -> Result<Vec<Module>> {
    let list = build_list(target, reqs)?;
    let mut upgrades = Vec::with_capacity(list.len());
    for m in list.iter().skip(1) {
        upgrades.push(reqs.upgrade(m)?);
    }
    upgrade_build_list(target, &upgrades, reqs)
}

/// The build list with no module above the versions in `downgrades`.
///
/// A requirement above its limit is walked back with [`Reqs::previous`];
/// one that cannot get under the limit is dropped. Dropping a direct
/// requirement of `target` fails with [`RegistryError::CannotDowngrade`].
pub fn downgrade_build_list(
    target: &Module,
    downgrades: &[Module],
    reqs: &dyn Reqs,
) -> Result<Vec<Module>> {
    build_list_with(target, &[], downgrades, reqs)
}

/// Bring `m` under its limit, if it has one.
fn clamp(m: Module, limits: &HashMap<String, String>, reqs: &dyn Reqs) -> Result<Option<Module>> {
    let Some(limit) = limits.get(&m.path) else {
        return Ok(Some(m));
    };
    let mut current = m;
    while version::compare(&current.version, limit) == Ordering::Greater {
        let prev = reqs.previous(&current)?;
        if version::is_none(&prev.version) || prev.version == current.version {
            return Ok(None);
        }
        current = prev;
    }
    Ok(Some(current))
}

fn select(
    target: &Module,
    extra: &[Module],
    limits: &HashMap<String, String>,
    reqs: &dyn Reqs,
) -> Result<Vec<Module>> {
    let requirements = |m: &Module| -> Result<Vec<Module>> {
        let mut children = match reqs.required(m) {
            // Only an upgrade can introduce a module resolution never saw.
            Err(RegistryError::UnknownModule { .. }) if m != target => Vec::new(),
            other => other?,
        };
        if m == target {
            children.extend(extra.iter().cloned());
        }
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            if child.path == target.path {
                continue;
            }
            match clamp(child.clone(), limits, reqs)? {
                Some(c) => out.push(c),
                None if m == target => {
                    return Err(RegistryError::CannotDowngrade {
                        module: child.to_string(),
                        limit: limits.get(&child.path).cloned().unwrap_or_default(),
                    })
                }
                None => {}
            }
        }
        Ok(out)
    };

    // Every version reachable from the target competes for its path.
    let mut selected: HashMap<String, String> = HashMap::new();
    let mut seen: HashSet<Module> = HashSet::from([target.clone()]);
    let mut queue = VecDeque::from([target.clone()]);
    while let Some(m) = queue.pop_front() {
        for child in requirements(&m)? {
            let chosen = match selected.get(&child.path) {
                Some(v) => reqs.max(&child.path, v, &child.version),
                None => child.version.clone(),
            };
            selected.insert(child.path.clone(), chosen);
            if seen.insert(child.clone()) {
                queue.push_back(child);
            }
        }
    }

    // Keep only what the selected versions still reach.
    let mut reached: BTreeMap<String, Module> = BTreeMap::new();
    let mut queue = VecDeque::from([target.clone()]);
    while let Some(m) = queue.pop_front() {
        for child in requirements(&m)? {
            let Some(version) = selected.get(&child.path) else {
                continue;
            };
            if reached.contains_key(&child.path) {
                continue;
            }
            let winner = Module::new(child.path.clone(), version.clone());
            reached.insert(child.path.clone(), winner.clone());
            queue.push_back(winner);
        }
    }

    let mut list = Vec::with_capacity(reached.len() + 1);
    list.push(target.clone());
    list.extend(reached.into_values());
    Ok(list)
}
