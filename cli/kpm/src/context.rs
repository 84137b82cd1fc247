//! Per-invocation state shared by the commands: the loaded settings, the
//! resolve options derived from them and the package being worked on.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use tracing::debug;

use kpm_core::{Package, MANIFEST_FILE};
use kpm_registry::{CacheLock, DepDownloader, ResolveOptions, Settings};

/// Flags that shape how dependencies are resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveFlags {
    pub no_cache: bool,
    pub no_sum_check: bool,
    /// Resolve against the package's `vendor/` directory.
    pub vendor: bool,
}

pub struct Context {
    pub settings: Settings,
    pub options: ResolveOptions,
    pub vendor: bool,
}

impl Context {
    /// Settings from `$KPM_HOME/config.toml` (or `~/.kpm`).
    pub fn load(flags: ResolveFlags) -> Result<Self> {
        let settings = Settings::load().context("loading kpm settings")?;
        Context::with_settings(settings, flags)
    }

    pub fn with_settings(settings: Settings, flags: ResolveFlags) -> Result<Self> {
        let mut options = ResolveOptions::from_settings(settings.clone())
            .context("locating the package cache")?;
        options.enable_cache = !flags.no_cache;
        options.no_sum_check = flags.no_sum_check;
        Ok(Context {
            settings,
            options,
            vendor: flags.vendor,
        })
    }

    pub fn cache_root(&self) -> &Path {
        &self.options.cache_root
    }

    /// Hold the cache lock until the returned guard is dropped.
    pub fn lock_cache(&self) -> Result<CacheLock> {
        CacheLock::acquire(self.cache_root())
            .with_context(|| format!("locking cache at {}", self.cache_root().display()))
    }

    /// Load the package containing `start_dir` in this invocation's vendor mode.
    pub fn load_package(&self, start_dir: &Path) -> Result<Package> {
        let mut pkg = load_package_required(start_dir)?;
        pkg.vendor_mode = self.vendor;
        Ok(pkg)
    }

    pub fn downloader(&self) -> Result<DepDownloader> {
        DepDownloader::from_settings(&self.settings).context("creating registry client")
    }
}

/// Find the package containing `start_dir`, walking upward.
pub fn find_package_root(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = start_dir.to_path_buf();
    loop {
        if dir.join(MANIFEST_FILE).is_file() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load the package containing `start_dir`, returning error if not found.
pub fn load_package_required(start_dir: &Path) -> Result<Package> {
    match find_package_root(start_dir) {
        Some(dir) => {
            debug!(root = %dir.display(), "found package");
            Package::load(&dir)
                .with_context(|| format!("loading {}", dir.join(MANIFEST_FILE).display()))
        }
        None => bail!("no {MANIFEST_FILE} found in {} or any parent directory", start_dir.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_package_root_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "[package]\nname = \"parent\"\n").unwrap();

        let nested = dir.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_package_root(&nested).as_deref(), Some(dir.path()));
        let pkg = load_package_required(&nested).unwrap();
        assert_eq!(pkg.name(), "parent");
    }

    #[test]
    fn flags_shape_resolve_options() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_root: Some(dir.path().join("cache")),
            ..Settings::default()
        };
        let ctx = Context::with_settings(
            settings,
            ResolveFlags {
                no_cache: true,
                no_sum_check: true,
                vendor: true,
            },
        )
        .unwrap();
        assert!(!ctx.options.enable_cache);
        assert!(ctx.options.no_sum_check);
        std::fs::write(dir.path().join(MANIFEST_FILE), "[package]\nname = \"app\"\n").unwrap();
        assert!(ctx.load_package(dir.path()).unwrap().vendor_mode);
        assert_eq!(ctx.cache_root(), dir.path().join("cache"));
    }
}
