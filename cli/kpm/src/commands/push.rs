//! `kpm push [<oci-ref>] [--dry-run]`.

use anyhow::{bail, Context as _, Result};

use kpm_core::{OciSource, Package, Source};
use kpm_registry::{push_package, OciClient, PushOptions};

use crate::context::Context;

/// The push target: `oci_ref` if given, else the package under the default
/// registry and repository.
fn target(pkg: &Package, oci_ref: Option<&str>, ctx: &Context) -> Result<OciSource> {
    let Some(oci_ref) = oci_ref else {
        return Ok(OciSource::new(
            ctx.settings.default_oci_registry.as_str(),
            format!("{}/{}", ctx.settings.default_oci_repo, pkg.name()),
            "",
        ));
    };
    let parsed: Source = oci_ref
        .parse()
        .with_context(|| format!("invalid reference '{oci_ref}'"))?;
    match parsed.as_oci() {
        Ok(oci) => Ok(oci.clone()),
        Err(_) => bail!("'{oci_ref}' is not an oci:// reference"),
    }
}

/// Run `kpm push`.
pub fn run(
    pkg: &Package,
    oci_ref: Option<&str>,
    dry_run: bool,
    ctx: &Context,
    client: &dyn OciClient,
) -> Result<()> {
    let target = target(pkg, oci_ref, ctx)?;
    let report = push_package(pkg, &target, client, &PushOptions { dry_run })
        .with_context(|| format!("pushing '{}'", pkg.name()))?;

    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    if dry_run {
        println!("Dry run: {} is ready to push (sum {}).", report.reference, report.sum);
    } else {
        println!("Pushed {} (sum {}).", report.reference, report.sum);
    }
    Ok(())
}
