//! Dependency engine for kpm, the KCL package manager.
//!
//! Turns a loaded [`kpm_core::Package`] into a resolved, locked and
//! optionally vendored dependency set:
//!
//! - **Fetching**: OCI registries over HTTP and git repositories, behind the
//!   [`Downloader`] seam, with a two-tier on-disk [`Cache`] guarded by a
//!   process-wide file lock.
//! - **Visiting**: one visitor per source shape loads each dependency as a
//!   package (on disk, synthesized, downloaded or unpacked from an archive).
//! - **Resolution**: a depth-first walk with pluggable per-edge callbacks
//!   that build the [`DepGraph`] and arbitrate the lock state.
//! - **Selection**: minimal version selection over the graph.
//!
//! Checksums recorded at publish time are verified on download, and lock
//! file checksums are verified on every resolution.

pub mod archive;
pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod git;
pub mod graph;
pub mod lock;
pub mod mvs;
pub mod oci;
pub mod push;
pub mod resolver;
pub mod tree;
pub mod vendor;
pub mod visitor;

// Re-exports for convenience.
pub use cache::{Cache, CacheEntry};
pub use config::{Platform, ResolveOptions, Settings};
pub use downloader::{DepDownloader, DownloadOptions, Downloader};
pub use error::{RegistryError, Result};
pub use graph::{DepGraph, Module};
pub use lock::CacheLock;
pub use oci::{HttpOciClient, OciClient};
pub use push::{push_package, PushOptions, PushReport};
pub use resolver::{update_package, DepsResolver};
pub use tree::{format_graph, format_lock, format_tree};
pub use vendor::{resolve_deps_into_map, vendor_deps};
pub use visitor::{SourceVisitor, Visitor};
