//! Core data model for kpm, the KCL package manager.
//!
//! Defines where dependencies come from ([`Source`]), what a package is on
//! disk ([`Package`], with its `kcl.mod` manifest and `kcl.mod.lock` lock
//! file), how package trees are checksummed, and how versions are ordered.
//! Nothing in this crate touches the network.

pub mod checksum;
pub mod error;
pub mod package;
pub mod source;
pub mod version;

// Re-exports for convenience.
pub use checksum::ContentHash;
pub use error::{CoreError, Result};
pub use package::{
    Dependency, DependencySpec, Package, PackageInfo, Profile, LOCK_FILE, MANIFEST_FILE,
    VENDOR_DIR,
};
pub use source::{GitRef, GitSource, LocalSource, ModSpec, OciSource, RegistrySource, Source, SourceKind};
