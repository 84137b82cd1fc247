//! `kpm cache clean` and `kpm cache path`.

use anyhow::{Context as _, Result};

use kpm_core::Source;
use kpm_registry::Cache;

use crate::context::Context;

/// Remove every cached package.
pub fn clean(ctx: &Context) -> Result<()> {
    let cache = Cache::new(ctx.cache_root());
    let count = cache.list()?.len();
    cache
        .remove_all()
        .with_context(|| format!("cleaning {}", ctx.cache_root().display()))?;
    println!("Removed {count} cached packages from {}", ctx.cache_root().display());
    Ok(())
}

/// Print where `source` is (or would be) cached.
pub fn path(ctx: &Context, source: &str) -> Result<()> {
    let source: Source = source
        .parse()
        .with_context(|| format!("invalid source '{source}'"))?;
    let source = ctx.settings.bind_default_registry(&source);
    let entry = Cache::new(ctx.cache_root()).entry(&source)?;
    let state = if entry.source_path.is_dir() { "cached" } else { "not cached" };
    println!("{} ({state})", entry.source_path.display());
    println!("{}", entry.artifact_path.display());
    Ok(())
}
