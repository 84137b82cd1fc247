//! Settings and per-session resolution options.
//!
//! `Settings` is the user-level configuration read from
//! `<kpm_home>/config.toml`. `ResolveOptions` is the explicit value threaded
//! through one resolution session; two sessions may use different options.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use kpm_core::{ModSpec, OciSource, Source, SourceKind};

use crate::error::{RegistryError, Result};

/// Environment variable overriding the kpm home directory.
pub const KPM_HOME_ENV: &str = "KPM_HOME";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_REGISTRY: &str = "ghcr.io";
const DEFAULT_REPO: &str = "kcl-lang";

/// Registry login for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Target platform of a multi-arch OCI artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    /// The platform this process runs on, in OCI vocabulary.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Platform {
            os: std::env::consts::OS.to_string(),
            architecture: architecture.to_string(),
        }
    }
}

/// User-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Registry that spec-only dependencies resolve against.
    #[serde(default = "default_registry")]
    pub default_oci_registry: String,
    /// Repository prefix under the default registry.
    #[serde(default = "default_repo")]
    pub default_oci_repo: String,
    /// Hosts reached over plain `http://`.
    #[serde(default)]
    pub plain_http: Vec<String>,
    /// Logins keyed by registry host.
    #[serde(default)]
    pub credentials: HashMap<String, Credentials>,
    /// Cache root; defaults to `<kpm_home>/cache`.
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
}

fn default_registry() -> String {
    DEFAULT_REGISTRY.to_string()
}

fn default_repo() -> String {
    DEFAULT_REPO.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            default_oci_registry: default_registry(),
            default_oci_repo: default_repo(),
            plain_http: Vec::new(),
            credentials: HashMap::new(),
            cache_root: None,
        }
    }
}

impl Settings {
    /// The kpm home directory: `$KPM_HOME`, else `~/.kpm`.
    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os(KPM_HOME_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".kpm")))
    }

    /// Load settings from the home directory, or defaults if there is no config file.
    pub fn load() -> Result<Self> {
        match Settings::home_dir() {
            Some(home) => Settings::load_from(&home.join(CONFIG_FILE)),
            None => Ok(Settings::default()),
        }
    }

    /// Load settings from a specific file; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.is_file() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Where the package cache lives.
    pub fn cache_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.cache_root {
            return Ok(root.clone());
        }
        Settings::home_dir()
            .map(|h| h.join("cache"))
            .ok_or_else(|| RegistryError::CacheError {
                path: PathBuf::new(),
                detail: "cannot determine home directory; set KPM_HOME".to_string(),
            })
    }

    pub fn credentials_for(&self, host: &str) -> Option<&Credentials> {
        self.credentials.get(host)
    }

    pub fn is_plain_http(&self, host: &str) -> bool {
        self.plain_http.iter().any(|h| h == host)
    }

    /// Bind a spec-only source to the default registry.
    ///
    /// `name:version` becomes `<default_registry>/<default_repo>/name` at
    /// tag `version`. Every other source is returned unchanged.
    pub fn bind_default_registry(&self, source: &Source) -> Source {
        match (source.kind(), source.mod_spec()) {
            (SourceKind::SpecOnly, Some(ModSpec { name, version })) => Source::registry(
                name.as_str(),
                version.as_str(),
                OciSource::new(
                    self.default_oci_registry.as_str(),
                    format!("{}/{}", self.default_oci_repo, name),
                    version.as_str(),
                ),
            ),
            _ => source.clone(),
        }
    }
}

/// Options for one resolution session.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Consult and populate the package cache for remote sources.
    pub enable_cache: bool,
    /// Root of the package cache.
    pub cache_root: PathBuf,
    /// Accept checksum mismatches (logged, not fatal).
    pub no_sum_check: bool,
    /// Persistent download area used when the cache is disabled.
    /// `None` downloads into temporary directories removed after each visit.
    pub visited_space: Option<PathBuf>,
    /// Platform hint for multi-arch artifacts.
    pub platform: Option<Platform>,
    pub settings: Settings,
}

impl ResolveOptions {
    pub fn new(settings: Settings, cache_root: impl Into<PathBuf>) -> Self {
        ResolveOptions {
            enable_cache: true,
            cache_root: cache_root.into(),
            no_sum_check: false,
            visited_space: None,
            platform: None,
            settings,
        }
    }

    /// Options derived from loaded settings.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let root = settings.cache_root()?;
        Ok(ResolveOptions::new(settings, root))
    }
}
