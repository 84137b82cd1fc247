//! Fetching a source's bytes into a local directory.
//!
//! The [`Downloader`] is stateless per call. It never cleans up after a
//! failed download; callers (the cache, the remote visitor) own the target
//! directory and remove it.

use std::path::PathBuf;

use tracing::{debug, info};

use kpm_core::{ContentHash, CoreError, Source, SourceKind};

use crate::archive;
use crate::config::{Platform, Settings};
use crate::error::{RegistryError, Result};
use crate::git::{CommandGitClient, GitClient};
use crate::oci::{HttpOciClient, OciClient};

/// What to download and where.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub source: Source,
    /// Directory receiving the usable package tree.
    pub local_path: PathBuf,
    /// Directory keeping the raw artifact. `None` discards it after extraction.
    pub artifact_path: Option<PathBuf>,
    /// Platform hint for multi-arch OCI artifacts.
    pub platform: Option<Platform>,
}

impl DownloadOptions {
    pub fn new(source: Source, local_path: impl Into<PathBuf>) -> Self {
        DownloadOptions {
            source,
            local_path: local_path.into(),
            artifact_path: None,
            platform: None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait Downloader {
    /// Materialize `opts.source` into `opts.local_path`.
    fn download(&self, opts: &DownloadOptions) -> Result<()>;

    /// Published versions of a source. Empty where versions are not ordered
    /// (git, local).
    fn list_versions(&self, source: &Source) -> Result<Vec<String>>;
}

/// Pin an OCI or registry source without a tag to its latest tag.
/// Every other source is returned unchanged.
pub fn resolve_latest(downloader: &dyn Downloader, source: &Source) -> Result<Source> {
    let oci = match source.kind() {
        SourceKind::Oci(o) if o.tag.is_empty() => o,
        SourceKind::Registry(r) if r.oci.tag.is_empty() && r.version.is_empty() => &r.oci,
        SourceKind::Registry(r) if r.oci.tag.is_empty() => {
            let mut oci = r.oci.clone();
            oci.tag = r.version.clone();
            return Ok(rebuild(source, Source::registry(&r.name, &r.version, oci)));
        }
        _ => return Ok(source.clone()),
    };

    let tags = downloader.list_versions(source)?;
    let tag = kpm_core::version::latest(tags.iter().map(String::as_str))
        .ok_or_else(|| RegistryError::NoTags {
            reg: oci.reg.clone(),
            repo: oci.repo.clone(),
        })?
        .to_string();
    debug!(source = %source, %tag, "resolved latest tag");

    let mut pinned = oci.clone();
    pinned.tag = tag.clone();
    let new = match source.kind() {
        // The version stays empty: only a declared version is a pin.
        SourceKind::Registry(r) => Source::registry(&r.name, &r.version, pinned),
        _ => Source::oci(pinned.reg, pinned.repo, pinned.tag),
    };
    Ok(rebuild(source, new))
}

fn rebuild(old: &Source, new: Source) -> Source {
    match old.mod_spec() {
        Some(spec) => new.with_mod_spec(spec.clone()),
        None => new,
    }
}

/// Downloads OCI artifacts and git repositories.
pub struct DepDownloader {
    oci: Box<dyn OciClient>,
    git: Box<dyn GitClient>,
}

impl DepDownloader {
    pub fn new(oci: Box<dyn OciClient>, git: Box<dyn GitClient>) -> Self {
        DepDownloader { oci, git }
    }

    /// HTTP registry client and the system `git`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(DepDownloader::new(
            Box::new(HttpOciClient::new(settings.clone())?),
            Box::new(CommandGitClient::default()),
        ))
    }

    pub fn oci_client(&self) -> &dyn OciClient {
        self.oci.as_ref()
    }

    fn download_oci(&self, opts: &DownloadOptions) -> Result<()> {
        let source = resolve_latest(self, &opts.source)?;
        let oci = source.as_oci()?;

        // Without a persistent artifact directory the archive lands in a
        // scratch dir dropped (and deleted) at the end of this call.
        let scratch;
        let staging = match &opts.artifact_path {
            Some(p) => p.clone(),
            None => {
                scratch = tempfile::tempdir()?;
                scratch.path().to_path_buf()
            }
        };

        let pulled = self.oci.pull(oci, &staging, opts.platform.clone())?;
        std::fs::create_dir_all(&opts.local_path)?;
        for file in &pulled.files {
            if archive::is_archive(file) {
                archive::extract(file, &opts.local_path).map_err(|e| download_err(opts, e))?;
                if opts.artifact_path.is_none() {
                    std::fs::remove_file(file)?;
                }
            } else {
                let name = file.file_name().ok_or_else(|| {
                    download_err(opts, format!("pulled file {} has no name", file.display()))
                })?;
                std::fs::copy(file, opts.local_path.join(name))?;
            }
        }

        if let Some(expected) = pulled.manifest.sum() {
            let actual = ContentHash::of_dir(&opts.local_path)?;
            if actual.as_str() != expected {
                return Err(CoreError::ChecksumMismatch {
                    name: oci.repo_name().to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                }
                .into());
            }
        }
        info!(reference = %oci.reference(), path = %opts.local_path.display(), "downloaded");
        Ok(())
    }

    fn download_git(&self, opts: &DownloadOptions) -> Result<()> {
        let git = opts.source.as_git()?;
        git.reference()?;
        self.git.clone_repo(git, &opts.local_path)?;
        info!(url = %git.url, path = %opts.local_path.display(), "downloaded");
        Ok(())
    }
}

impl Downloader for DepDownloader {
    fn download(&self, opts: &DownloadOptions) -> Result<()> {
        match opts.source.kind() {
            SourceKind::Oci(_) | SourceKind::Registry(_) => self.download_oci(opts),
            SourceKind::Git(_) => self.download_git(opts),
            SourceKind::Local(_) => Err(download_err(opts, "local sources are not downloaded")),
            SourceKind::SpecOnly => Err(download_err(
                opts,
                "spec-only source must be bound to a registry first",
            )),
        }
    }

    fn list_versions(&self, source: &Source) -> Result<Vec<String>> {
        match source.kind() {
            SourceKind::Oci(o) => self.oci.list_tags(&o.reg, &o.repo),
            SourceKind::Registry(r) => self.oci.list_tags(&r.oci.reg, &r.oci.repo),
            SourceKind::Git(_) | SourceKind::Local(_) | SourceKind::SpecOnly => Ok(Vec::new()),
        }
    }
}

fn download_err(opts: &DownloadOptions, detail: impl std::fmt::Display) -> RegistryError {
    RegistryError::Download {
        source_str: opts.source.to_string(),
        path: opts.local_path.clone(),
        detail: detail.to_string(),
    }
}
