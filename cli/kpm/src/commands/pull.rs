//! `kpm pull <source> [dir]`: download one package without resolving it.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};

use kpm_core::Source;
use kpm_registry::downloader::resolve_latest;
use kpm_registry::{DownloadOptions, Downloader};

use crate::context::Context;

/// Download `source` into `dir`, or into `<cwd>/<source file path>`.
/// Returns the directory written.
pub fn run(
    source: &str,
    dir: Option<&Path>,
    cwd: &Path,
    ctx: &Context,
    downloader: &dyn Downloader,
) -> Result<PathBuf> {
    let parsed: Source = source
        .parse()
        .with_context(|| format!("invalid source '{source}'"))?;
    if !parsed.is_remote() {
        bail!("'{source}' is not a remote source");
    }
    let bound = ctx.settings.bind_default_registry(&parsed);
    let pinned = resolve_latest(downloader, &bound)?;

    let target = match dir {
        Some(d) => cwd.join(d),
        None => cwd.join(pinned.to_file_path()),
    };
    if target.is_dir() && std::fs::read_dir(&target)?.next().is_some() {
        bail!("{} already exists and is not empty", target.display());
    }

    let mut opts = DownloadOptions::new(pinned.clone(), &target);
    opts.platform = ctx.options.platform.clone();
    if let Err(e) = downloader.download(&opts) {
        if target.exists() {
            let _ = std::fs::remove_dir_all(&target);
        }
        return Err(e).with_context(|| format!("pulling '{pinned}'"));
    }
    println!("Pulled {pinned} into {}", target.display());
    Ok(target)
}
