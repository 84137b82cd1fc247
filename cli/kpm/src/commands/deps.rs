//! `kpm add` and `kpm remove`: edit the declared dependencies, then
//! re-resolve so the lock file matches.

use anyhow::{bail, Context as _, Result};

use kpm_core::{Dependency, Package, Source, SourceKind};
use kpm_registry::{update_package, Downloader};

use crate::context::Context;

/// Name a dependency after what its source points at.
fn default_name(source: &Source) -> Option<String> {
    if let Some(spec) = source.mod_spec() {
        return Some(spec.name.clone());
    }
    match source.kind() {
        SourceKind::Local(l) => l
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
        SourceKind::Git(g) => Some(g.repo_name()),
        SourceKind::Oci(o) => Some(o.repo_name().to_string()),
        SourceKind::Registry(r) => Some(r.name.clone()),
        SourceKind::SpecOnly => None,
    }
}

fn default_version(source: &Source) -> String {
    match source.kind() {
        SourceKind::Oci(o) => o.tag.clone(),
        SourceKind::Registry(r) => r.version.clone(),
        SourceKind::Git(g) => g
            .tag
            .clone()
            .or_else(|| g.commit.clone())
            .or_else(|| g.branch.clone())
            .unwrap_or_default(),
        SourceKind::SpecOnly => source.mod_spec().map(|s| s.version.clone()).unwrap_or_default(),
        SourceKind::Local(_) => String::new(),
    }
}

/// Run `kpm add <source> [--name <name>]`.
///
/// Relative local paths are taken relative to the package directory.
pub fn add(
    pkg: &mut Package,
    source: &str,
    name: Option<&str>,
    ctx: &Context,
    downloader: &dyn Downloader,
) -> Result<()> {
    let parsed: Source = source
        .parse()
        .with_context(|| format!("invalid source '{source}'"))?;
    let parsed = parsed.rebased(&pkg.home_path);
    let name = match name.map(str::to_string).or_else(|| default_name(&parsed)) {
        Some(n) if !n.is_empty() => n,
        _ => bail!("cannot derive a dependency name from '{source}'; pass --name"),
    };

    if pkg.dependencies.contains_key(&name) {
        println!("Dependency '{name}' already present, replacing it");
    }
    let dep = Dependency::new(name.as_str(), default_version(&parsed), parsed);
    pkg.dependencies.insert(name.clone(), dep);

    update_package(pkg, downloader, &ctx.options)
        .with_context(|| format!("resolving '{name}'"))?;
    pkg.store()
        .with_context(|| format!("writing {}", pkg.manifest_path().display()))?;

    let added = &pkg.dependencies[&name];
    println!("Added dependency: {name} ({})", added.source);
    Ok(())
}

/// Run `kpm remove <name>`.
pub fn remove(pkg: &mut Package, name: &str, ctx: &Context, downloader: &dyn Downloader) -> Result<()> {
    if pkg.dependencies.shift_remove(name).is_none() {
        bail!("dependency '{name}' not found in {}", pkg.manifest_path().display());
    }

    update_package(pkg, downloader, &ctx.options)?;
    pkg.store()
        .with_context(|| format!("writing {}", pkg.manifest_path().display()))?;
    println!("Removed dependency: {name}");
    Ok(())
}
