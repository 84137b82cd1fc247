//! `kpm vendor`: copy every remote dependency into `vendor/`.

use anyhow::{Context as _, Result};

use kpm_core::Package;
use kpm_registry::{update_package, vendor_deps, Downloader};

use crate::context::Context;

/// Vendor all dependencies, then re-resolve against the vendored copies and
/// rewrite the lock file.
pub fn run(pkg: &mut Package, ctx: &Context, downloader: &dyn Downloader) -> Result<()> {
    let vendored = vendor_deps(pkg, downloader, &ctx.options)
        .with_context(|| format!("vendoring dependencies of '{}'", pkg.name()))?;

    pkg.vendor_mode = true;
    update_package(pkg, downloader, &ctx.options)?;
    pkg.store_lock()?;

    let remote = vendored.values().filter(|d| !d.is_local()).count();
    println!("Vendored {remote} dependencies into {}", pkg.vendor_path().display());
    Ok(())
}
