//! Registry error types.

use std::path::PathBuf;

use kpm_core::CoreError;

/// Errors that can occur while fetching, caching and resolving dependencies.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Source, manifest or checksum error from the core model.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The source has no entry in the cache. Callers download on this error.
    #[error("'{source_str}' is not in the cache")]
    CacheMiss { source_str: String },

    /// Cache I/O error.
    #[error("cache error at {path}: {detail}")]
    CacheError { path: PathBuf, detail: String },

    /// Another process holds the cache lock and waiting failed.
    #[error("cannot lock cache at {path}: {detail}")]
    CacheLocked { path: PathBuf, detail: String },

    /// Downloading a source failed.
    #[error("downloading '{source_str}' into {path}: {detail}")]
    Download {
        source_str: String,
        path: PathBuf,
        detail: String,
    },

    /// The OCI registry answered with an error.
    #[error("registry {reg} ({repo}): {detail}")]
    Oci {
        reg: String,
        repo: String,
        detail: String,
    },

    /// A registry has no tags for a repository.
    #[error("no tags found for {reg}/{repo}")]
    NoTags { reg: String, repo: String },

    /// A git command failed.
    #[error("git {url}: {detail}")]
    Git { url: String, detail: String },

    /// Reading or writing an archive failed.
    #[error("archive {path}: {detail}")]
    Archive { path: PathBuf, detail: String },

    /// A visitor was handed a source it does not handle.
    #[error("{visitor} cannot visit '{source_str}'")]
    VisitorMismatch {
        visitor: &'static str,
        source_str: String,
    },

    /// A loaded package does not have the version its source pinned.
    #[error("'{name}' from '{source_str}': expected version {expected}, found {actual}")]
    VersionMismatch {
        name: String,
        source_str: String,
        expected: String,
        actual: String,
    },

    /// Adding an edge to the dependency graph would create a cycle.
    #[error("dependency cycle: adding {parent} -> {child} closes a cycle")]
    DependencyCycle { parent: String, child: String },

    /// A module is not a vertex of the dependency graph.
    #[error("module {module} is not in the dependency graph")]
    UnknownModule { module: String },

    /// A module cannot be downgraded below a requested version.
    #[error("cannot downgrade {module} to {limit}")]
    CannotDowngrade { module: String, limit: String },

    /// Two non-git dependencies share a name and version but not an origin.
    #[error("'{name}' {version} is required from both '{first}' and '{second}'")]
    ConflictingSources {
        name: String,
        version: String,
        first: String,
        second: String,
    },

    /// Pushing a package failed validation.
    #[error("push failed: {detail}")]
    PushFailed { detail: String },

    /// The tag already exists in the registry.
    #[error("'{reference}' is already published")]
    AlreadyPublished { reference: String },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Whether this is the cache-miss sentinel.
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, RegistryError::CacheMiss { .. })
    }
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
