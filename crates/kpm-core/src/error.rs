//! Core error types.

use std::path::PathBuf;

/// Errors raised while parsing sources, loading packages, or checking sums.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A source string could not be parsed.
    #[error("invalid source '{source_str}': {detail}")]
    InvalidSource { source_str: String, detail: String },

    /// A source string used a scheme this tool does not understand.
    #[error("unsupported source scheme '{scheme}' in '{source_str}'")]
    UnsupportedScheme { scheme: String, source_str: String },

    /// A git source names more than one (or none) of branch/commit/tag.
    #[error("git source '{url}' must name exactly one of branch, commit or tag (found {count})")]
    AmbiguousGitRef { url: String, count: usize },

    /// A variant-specific operation was applied to a different variant.
    #[error("expected a {expected} source, found {found}")]
    WrongSourceKind {
        expected: &'static str,
        found: String,
    },

    /// No manifest file exists where one was required.
    #[error("no {file} found in {path}")]
    ManifestNotFound { path: PathBuf, file: &'static str },

    /// The manifest or lock file is structurally invalid.
    #[error("invalid manifest {path}: {detail}")]
    InvalidManifest { path: PathBuf, detail: String },

    /// A sub-package named by a mod spec was not found in a package tree.
    #[error("package '{name}' not found under {path}")]
    SubPackageNotFound { name: String, path: PathBuf },

    /// A recorded checksum does not match the trusted checksum.
    #[error("checksum mismatch for '{name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Semver parse error.
    #[error("invalid version: {0}")]
    Semver(#[from] semver::Error),

    /// Directory walk error.
    #[error("walking {path}: {detail}")]
    Walk { path: PathBuf, detail: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
