//! `kpm resolve`, `kpm graph`, `kpm tree` and `kpm deps`.

use anyhow::{Context as _, Result};

use kpm_core::Package;
use kpm_registry::{
    format_graph, format_lock, format_tree, resolve_deps_into_map, update_package, DepGraph,
    Downloader, Module,
};

use crate::context::Context;

fn resolve_graph(pkg: &mut Package, ctx: &Context, downloader: &dyn Downloader) -> Result<DepGraph> {
    update_package(pkg, downloader, &ctx.options)
        .with_context(|| format!("resolving dependencies of '{}'", pkg.name()))
}

/// Run `kpm resolve`: resolve every dependency and rewrite the lock file.
pub fn resolve(pkg: &mut Package, ctx: &Context, downloader: &dyn Downloader) -> Result<()> {
    resolve_graph(pkg, ctx, downloader)?;
    pkg.store_lock()
        .with_context(|| format!("writing {}", pkg.lock_path().display()))?;

    if pkg.locked.is_empty() {
        println!("No dependencies.");
    } else {
        println!("Resolved {} dependencies:", pkg.locked.len());
        print!("{}", format_lock(&pkg.locked));
    }
    Ok(())
}

/// Run `kpm graph`: print every requirement edge.
pub fn graph(pkg: &mut Package, ctx: &Context, downloader: &dyn Downloader) -> Result<()> {
    let graph = resolve_graph(pkg, ctx, downloader)?;
    print!("{}", format_graph(&graph));
    Ok(())
}

/// Run `kpm tree`.
pub fn tree(pkg: &mut Package, ctx: &Context, downloader: &dyn Downloader) -> Result<()> {
    let graph = resolve_graph(pkg, ctx, downloader)?;
    let root = Module::new(pkg.name(), pkg.version());
    print!("{}", format_tree(&graph, &root)?);
    Ok(())
}

/// Run `kpm deps`: print where each dependency lives on disk.
pub fn deps(pkg: &Package, ctx: &Context, downloader: &dyn Downloader) -> Result<()> {
    let map = resolve_deps_into_map(pkg, downloader, &ctx.options)
        .with_context(|| format!("resolving dependencies of '{}'", pkg.name()))?;
    for (name, path) in &map {
        println!("{name} {}", path.display());
    }
    Ok(())
}
