//! Package publishing workflow.
//!
//! Validates a package and pushes it to an OCI registry as a single tar
//! layer. Tags are append-only and must increase: a tag that already exists
//! is rejected, and so is a version not newer than the latest published one.

use std::cmp::Ordering;

use indexmap::IndexMap;
use tracing::info;

use kpm_core::version;
use kpm_core::{ContentHash, OciSource, Package};

use crate::archive;
use crate::error::{RegistryError, Result};
use crate::oci::{ImageManifest, OciClient, SUM_ANNOTATION};

/// Options for the push operation.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Perform all validation but don't actually push.
    pub dry_run: bool,
}

/// Validation result from pre-push checks.
#[derive(Debug, Clone)]
pub struct PushValidation {
    /// Warnings (non-fatal).
    pub warnings: Vec<String>,
    /// Whether the package is ready to push.
    pub ready: bool,
}

/// What a push did (or would do, for a dry run).
#[derive(Debug, Clone)]
pub struct PushReport {
    pub reference: String,
    pub sum: String,
    pub warnings: Vec<String>,
    /// `None` for a dry run.
    pub manifest: Option<ImageManifest>,
}

/// Validate a package for pushing.
pub fn validate_for_push(pkg: &Package) -> PushValidation {
    let mut warnings = Vec::new();
    let mut ready = true;

    if pkg.name().is_empty() {
        warnings.push("package.name is required".to_string());
        ready = false;
    }

    if pkg.version().is_empty() {
        warnings.push("package.version is required".to_string());
        ready = false;
    }

    if pkg.info.description.is_none() {
        warnings.push("package.description is recommended".to_string());
    }

    for (name, dep) in &pkg.dependencies {
        if dep.is_local() {
            warnings.push(format!(
                "dependency '{name}' is a local path and will not resolve for consumers"
            ));
        }
    }

    PushValidation { warnings, ready }
}

/// Push `pkg` to `target`. An empty target tag means the package version.
pub fn push_package(
    pkg: &Package,
    target: &OciSource,
    client: &dyn OciClient,
    options: &PushOptions,
) -> Result<PushReport> {
    let validation = validate_for_push(pkg);
    if !validation.ready {
        return Err(RegistryError::PushFailed {
            detail: validation.warnings.join("; "),
        });
    }

    let mut target = target.clone();
    if target.tag.is_empty() {
        target.tag = pkg.version().to_string();
    }

    // Check if already published
    let tags = client.list_tags(&target.reg, &target.repo)?;
    if tags.iter().any(|t| *t == target.tag) {
        return Err(RegistryError::AlreadyPublished {
            reference: target.reference(),
        });
    }

    // Check version monotonicity
    if let Some(latest) = version::latest(tags.iter().map(String::as_str)) {
        if version::compare(&target.tag, latest) != Ordering::Greater {
            return Err(RegistryError::PushFailed {
                detail: format!(
                    "version {} is not newer than latest published version {}",
                    target.tag, latest
                ),
            });
        }
    }

    let sum = ContentHash::of_dir(&pkg.home_path)?.to_string();
    let mut report = PushReport {
        reference: target.reference(),
        sum,
        warnings: validation.warnings,
        manifest: None,
    };
    if options.dry_run {
        return Ok(report);
    }

    let scratch = tempfile::tempdir()?;
    let archive_path = scratch
        .path()
        .join(format!("{}_{}.tar", pkg.name(), target.tag));
    archive::pack_tar(&pkg.home_path, &archive_path)?;

    let mut annotations = IndexMap::new();
    annotations.insert(SUM_ANNOTATION.to_string(), report.sum.clone());
    let manifest = client.push(&target, &archive_path, &annotations)?;
    info!(reference = %report.reference, sum = %report.sum, "pushed");
    report.manifest = Some(manifest);
    Ok(report)
}
