//! In-memory fakes shared by the scenario tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use indexmap::IndexMap;
use kpm_core::{GitSource, OciSource, Package, Source, MANIFEST_FILE};
use kpm_registry::downloader::{DownloadOptions, Downloader};
use kpm_registry::git::GitClient;
use kpm_registry::oci::{Descriptor, ImageManifest, OciClient, PulledArtifact, CONFIG_MEDIA_TYPE};
use kpm_registry::{Platform, RegistryError, Result};

/// A registry of packages named after their repository, counting downloads.
#[derive(Default)]
pub struct FakeRegistry {
    /// `(repo name, tag)` -> `[dependencies]` table body.
    packages: HashMap<(String, String), String>,
    downloads: Cell<usize>,
}

impl FakeRegistry {
    pub fn with(mut self, name: &str, tag: &str, deps: &str) -> Self {
        self.packages
            .insert((name.to_string(), tag.to_string()), deps.to_string());
        self
    }

    pub fn downloads(&self) -> usize {
        self.downloads.get()
    }
}

impl Downloader for FakeRegistry {
    fn download(&self, opts: &DownloadOptions) -> Result<()> {
        let oci = opts.source.as_oci()?;
        let key = (oci.repo_name().to_string(), oci.tag.clone());
        let deps = self.packages.get(&key).ok_or_else(|| RegistryError::Oci {
            reg: oci.reg.clone(),
            repo: oci.repo.clone(),
            detail: format!("no tag {}", oci.tag),
        })?;
        self.downloads.set(self.downloads.get() + 1);
        std::fs::create_dir_all(&opts.local_path)?;
        std::fs::write(
            opts.local_path.join(MANIFEST_FILE),
            format!(
                "[package]\nname = \"{}\"\nversion = \"{}\"\n\n[dependencies]\n{deps}",
                key.0, key.1
            ),
        )?;
        std::fs::write(opts.local_path.join("main.k"), format!("name = \"{}\"\n", key.0))?;
        Ok(())
    }

    fn list_versions(&self, source: &Source) -> Result<Vec<String>> {
        let oci = source.as_oci()?;
        Ok(self
            .packages
            .keys()
            .filter(|(name, _)| name == oci.repo_name())
            .map(|(_, tag)| tag.clone())
            .collect())
    }
}

/// `name = { oci = "oci://ghcr.io/kcl-lang/<name>", tag = "<tag>" }`
pub fn oci_dep(name: &str, tag: &str) -> String {
    format!("{name} = {{ oci = \"oci://ghcr.io/kcl-lang/{name}\", tag = \"{tag}\" }}\n")
}

/// Write and load a root package.
pub fn root_package(dir: &Path, deps: &str) -> Package {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join(MANIFEST_FILE),
        format!("[package]\nname = \"app\"\nversion = \"0.1.0\"\n\n[dependencies]\n{deps}"),
    )
    .unwrap();
    Package::load(dir).unwrap()
}

struct Pushed {
    archive: PathBuf,
    manifest: ImageManifest,
}

/// An OCI registry keeping pushed archives in a directory. Clones share
/// the same registry contents.
#[derive(Clone)]
pub struct FakeOci {
    store: PathBuf,
    pushed: Rc<RefCell<HashMap<String, Pushed>>>,
}

impl FakeOci {
    pub fn new(store: impl Into<PathBuf>) -> Self {
        FakeOci {
            store: store.into(),
            pushed: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Replace the annotations of a pushed reference.
    pub fn tamper(&self, reference: &str, annotations: IndexMap<String, String>) {
        if let Some(p) = self.pushed.borrow_mut().get_mut(reference) {
            p.manifest.annotations = annotations;
        }
    }
}

impl OciClient for FakeOci {
    fn fetch_manifest(&self, oci: &OciSource, _platform: Option<Platform>) -> Result<ImageManifest> {
        self.pushed
            .borrow()
            .get(&oci.reference())
            .map(|p| p.manifest.clone())
            .ok_or_else(|| RegistryError::Oci {
                reg: oci.reg.clone(),
                repo: oci.repo.clone(),
                detail: "manifest unknown".to_string(),
            })
    }

    fn pull(&self, oci: &OciSource, dest: &Path, platform: Option<Platform>) -> Result<PulledArtifact> {
        let manifest = self.fetch_manifest(oci, platform)?;
        let pushed = self.pushed.borrow();
        let archive = &pushed[&oci.reference()].archive;
        std::fs::create_dir_all(dest)?;
        let file = dest.join(format!("{}_{}.tar", oci.repo_name(), oci.tag));
        std::fs::copy(archive, &file)?;
        Ok(PulledArtifact {
            manifest,
            files: vec![file],
        })
    }

    fn push(
        &self,
        oci: &OciSource,
        archive: &Path,
        annotations: &IndexMap<String, String>,
    ) -> Result<ImageManifest> {
        std::fs::create_dir_all(&self.store)?;
        let kept = self.store.join(format!("{}_{}.tar", oci.repo_name(), oci.tag));
        std::fs::copy(archive, &kept)?;
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: None,
            config: Descriptor {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                digest: "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a".to_string(),
                size: 2,
                annotations: IndexMap::new(),
                platform: None,
            },
            layers: Vec::new(),
            annotations: annotations.clone(),
        };
        self.pushed.borrow_mut().insert(
            oci.reference(),
            Pushed {
                archive: kept,
                manifest: manifest.clone(),
            },
        );
        Ok(manifest)
    }

    fn list_tags(&self, reg: &str, repo: &str) -> Result<Vec<String>> {
        let prefix = format!("{reg}/{repo}:");
        Ok(self
            .pushed
            .borrow()
            .keys()
            .filter_map(|r| r.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

/// A git client for tests that never reach git.
pub struct NoGit;

impl GitClient for NoGit {
    fn clone_repo(&self, git: &GitSource, _dest: &Path) -> Result<()> {
        Err(RegistryError::Git {
            url: git.url.clone(),
            detail: "git is not available in this test".to_string(),
        })
    }
}
