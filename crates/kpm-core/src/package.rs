//! Packages: a `kcl.mod` manifest plus its `kcl.mod.lock` lock file.
//!
//! Declared dependencies (what the manifest asks for) and locked
//! dependencies (what resolution actually picked) are kept as two separate
//! insertion-ordered maps keyed by dependency name.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::source::{GitSource, ModSpec, Source, SourceKind};

/// Manifest file name.
pub const MANIFEST_FILE: &str = "kcl.mod";
/// Lock file name.
pub const LOCK_FILE: &str = "kcl.mod.lock";
/// Directory holding vendored dependencies inside a package.
pub const VENDOR_DIR: &str = "vendor";
/// Source file extension picked up as entries when no profile is declared.
pub const SOURCE_EXT: &str = "k";

const DEFAULT_EDITION: &str = "v0.10.0";

/// A dependency of a package, declared or resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    /// `name_version`, or just `name` for local dependencies.
    pub full_name: String,
    pub version: String,
    /// Content checksum; empty until resolved. Never checked for local sources.
    pub sum: String,
    /// Where the resolved tree lives on disk. Runtime only.
    pub local_full_path: Option<PathBuf>,
    pub source: Source,
}

impl Dependency {
    pub fn new(name: impl Into<String>, version: impl Into<String>, source: Source) -> Self {
        let mut dep = Dependency {
            name: name.into(),
            full_name: String::new(),
            version: version.into(),
            sum: String::new(),
            local_full_path: None,
            source,
        };
        dep.refresh_full_name();
        dep
    }

    pub fn with_sum(mut self, sum: impl Into<String>) -> Self {
        self.sum = sum.into();
        self
    }

    pub fn is_local(&self) -> bool {
        self.source.is_local_path()
    }

    /// Recompute `full_name` after `name` or `version` changed.
    pub fn refresh_full_name(&mut self) {
        self.full_name = if self.is_local() || self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.name, self.version)
        };
    }

    /// Build a dependency from its manifest declaration.
    pub fn from_spec(name: &str, spec: &DependencySpec, manifest: &Path) -> Result<Self> {
        let invalid = |detail: String| CoreError::InvalidManifest {
            path: manifest.to_path_buf(),
            detail,
        };

        let detail = match spec {
            DependencySpec::Version(v) => {
                let source = Source::spec_only(ModSpec::new(name, v.as_str()))?;
                return Ok(Dependency::new(name, v.as_str(), source));
            }
            DependencySpec::Detailed(d) => d,
        };

        let declared = [&detail.oci, &detail.git, &detail.path]
            .iter()
            .filter(|f| f.is_some())
            .count();
        if declared > 1 {
            return Err(invalid(format!(
                "dependency '{name}' declares more than one of oci, git, path"
            )));
        }

        let mod_spec = detail
            .package
            .as_ref()
            .map(|p| ModSpec::new(p.as_str(), detail.version.clone().unwrap_or_default()));
        // With a sub-package pin, `version` belongs to the sub-package.
        let own_version = if mod_spec.is_some() {
            None
        } else {
            detail.version.clone()
        };

        let (source, version) = if let Some(oci) = &detail.oci {
            let parsed: Source = oci.parse()?;
            let mut coords = parsed.as_oci().cloned().map_err(|_| {
                invalid(format!("dependency '{name}': '{oci}' is not an oci:// reference"))
            })?;
            if let Some(tag) = &detail.tag {
                coords.tag = tag.clone();
            }
            let version = own_version.unwrap_or_else(|| coords.tag.clone());
            (Source::oci(coords.reg, coords.repo, coords.tag), version)
        } else if let Some(url) = &detail.git {
            let git = GitSource {
                url: url.clone(),
                branch: detail.branch.clone(),
                commit: detail.commit.clone(),
                tag: detail.tag.clone(),
            };
            let version = own_version
                .or_else(|| detail.tag.clone())
                .or_else(|| detail.commit.clone())
                .or_else(|| detail.branch.clone())
                .unwrap_or_default();
            (Source::git(git), version)
        } else if let Some(path) = &detail.path {
            (Source::local(path), own_version.unwrap_or_default())
        } else {
            let version = detail.version.clone().unwrap_or_default();
            (Source::spec_only(ModSpec::new(name, version.as_str()))?, version)
        };

        let source = match mod_spec {
            Some(spec) => source.with_mod_spec(spec),
            None => source,
        };
        Ok(Dependency::new(name, version, source))
    }

    /// The manifest declaration for this dependency.
    pub fn to_spec(&self) -> DependencySpec {
        let mut d = DetailedSpec::default();
        match self.source.kind() {
            SourceKind::SpecOnly if self.source.mod_spec().is_some_and(|s| s.name == self.name) => {
                return DependencySpec::Version(self.version.clone());
            }
            SourceKind::SpecOnly => {
                d.version = Some(self.version.clone());
            }
            SourceKind::Local(l) => {
                d.path = Some(l.path.display().to_string());
            }
            SourceKind::Git(g) => {
                d.git = Some(g.url.clone());
                d.branch = g.branch.clone();
                d.commit = g.commit.clone();
                d.tag = g.tag.clone();
            }
            SourceKind::Oci(o) => {
                d.oci = Some(format!("oci://{}/{}", o.reg, o.repo));
                d.tag = Some(o.tag.clone()).filter(|t| !t.is_empty());
            }
            SourceKind::Registry(r) => {
                d.oci = Some(format!("oci://{}/{}", r.oci.reg, r.oci.repo));
                d.tag = Some(r.oci.tag.clone()).filter(|t| !t.is_empty());
            }
        }
        if let Some(spec) = self.source.mod_spec() {
            if !matches!(self.source.kind(), SourceKind::SpecOnly) {
                d.package = Some(spec.name.clone());
                d.version = Some(spec.version.clone()).filter(|v| !v.is_empty());
            }
        }
        DependencySpec::Detailed(d)
    }
}

/// A dependency declaration as written in `kcl.mod`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    /// `name = "0.1.0"`: a spec-only dependency on the default registry.
    Version(String),
    Detailed(DetailedSpec),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailedSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Sub-package to use inside a multi-package artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

/// The `[package]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    #[serde(default = "default_edition")]
    pub edition: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_edition() -> String {
    DEFAULT_EDITION.to_string()
}

/// The `[profile]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub entries: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    package: PackageInfo,
    #[serde(default)]
    dependencies: IndexMap<String, DependencySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<Profile>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LockFile {
    #[serde(default)]
    dependencies: IndexMap<String, LockedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockedEntry {
    name: String,
    full_name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    sum: String,
    source: String,
}

/// A loaded package.
#[derive(Debug, Clone)]
pub struct Package {
    pub info: PackageInfo,
    /// Declared dependencies, in manifest order.
    pub dependencies: IndexMap<String, Dependency>,
    /// Resolved dependencies (direct and transitive), in lock order.
    pub locked: IndexMap<String, Dependency>,
    pub profile: Option<Profile>,
    pub home_path: PathBuf,
    pub vendor_mode: bool,
    /// Synthesized packages have no manifest on disk.
    pub is_virtual: bool,
}

impl Package {
    /// Create a new package with no dependencies.
    pub fn new(name: impl Into<String>, version: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Package {
            info: PackageInfo {
                name: name.into(),
                edition: default_edition(),
                version: version.into(),
                description: None,
            },
            dependencies: IndexMap::new(),
            locked: IndexMap::new(),
            profile: None,
            home_path: home.into(),
            vendor_mode: false,
            is_virtual: false,
        }
    }

    /// An in-memory package for a directory that has no manifest.
    pub fn new_virtual(name: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        let mut pkg = Package::new(name, "", home);
        pkg.is_virtual = true;
        pkg
    }

    /// Load the package rooted at `home` (manifest required, lock optional).
    pub fn load(home: &Path) -> Result<Self> {
        let manifest_path = home.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(CoreError::ManifestNotFound {
                path: home.to_path_buf(),
                file: MANIFEST_FILE,
            });
        }
        let content = std::fs::read_to_string(&manifest_path)?;
        let manifest: ManifestFile =
            toml::from_str(&content).map_err(|e| CoreError::InvalidManifest {
                path: manifest_path.clone(),
                detail: e.to_string(),
            })?;

        let mut dependencies = IndexMap::new();
        for (name, spec) in &manifest.dependencies {
            let mut dep = Dependency::from_spec(name, spec, &manifest_path)?;
            dep.source = dep.source.rebased(home);
            dependencies.insert(name.clone(), dep);
        }

        let locked = load_lock(home)?;
        for (name, dep) in dependencies.iter_mut() {
            // Locked entries are keyed by package name, which an alias hides.
            let entry = locked
                .get(name)
                .or_else(|| locked.values().find(|l| l.source == dep.source));
            if let Some(l) = entry {
                dep.sum = l.sum.clone();
            }
        }

        debug!(path = %home.display(), name = %manifest.package.name, "loaded package");
        Ok(Package {
            info: manifest.package,
            dependencies,
            locked,
            profile: manifest.profile,
            home_path: home.to_path_buf(),
            vendor_mode: false,
            is_virtual: false,
        })
    }

    /// Load the sub-package named by `spec` from the tree rooted at `root`.
    ///
    /// The root itself is checked first, then every nested manifest.
    pub fn load_sub_package(root: &Path, spec: &ModSpec) -> Result<Self> {
        for entry in walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
        {
            let entry = entry.map_err(|e| CoreError::Walk {
                path: root.to_path_buf(),
                detail: e.to_string(),
            })?;
            if !entry.file_type().is_file() || entry.file_name() != MANIFEST_FILE {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            let pkg = Package::load(dir)?;
            if pkg.info.name == spec.name {
                return Ok(pkg);
            }
        }
        Err(CoreError::SubPackageNotFound {
            name: spec.name.clone(),
            path: root.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn version(&self) -> &str {
        &self.info.version
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.home_path.join(MANIFEST_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home_path.join(LOCK_FILE)
    }

    pub fn vendor_path(&self) -> PathBuf {
        self.home_path.join(VENDOR_DIR)
    }

    /// Entry files: the profile's entries, else every source file in the home directory.
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        if let Some(profile) = &self.profile {
            if !profile.entries.is_empty() {
                return Ok(profile
                    .entries
                    .iter()
                    .map(|e| self.home_path.join(e))
                    .collect());
            }
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.home_path)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == SOURCE_EXT) {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Write the manifest and the lock file.
    pub fn store(&self) -> Result<()> {
        let manifest = ManifestFile {
            package: self.info.clone(),
            dependencies: self
                .dependencies
                .iter()
                .map(|(name, dep)| (name.clone(), self.relative_spec(dep)))
                .collect(),
            profile: self.profile.clone(),
        };
        std::fs::write(self.manifest_path(), toml::to_string(&manifest)?)?;
        self.store_lock()
    }

    /// Write only the lock file.
    pub fn store_lock(&self) -> Result<()> {
        let lock = LockFile {
            dependencies: self
                .locked
                .iter()
                .map(|(name, dep)| {
                    (
                        name.clone(),
                        LockedEntry {
                            name: dep.name.clone(),
                            full_name: dep.full_name.clone(),
                            version: dep.version.clone(),
                            sum: dep.sum.clone(),
                            source: self.relative_source(&dep.source).to_string(),
                        },
                    )
                })
                .collect(),
        };
        std::fs::write(self.lock_path(), toml::to_string(&lock)?)?;
        Ok(())
    }

    fn relative_spec(&self, dep: &Dependency) -> DependencySpec {
        let mut dep = dep.clone();
        dep.source = self.relative_source(&dep.source);
        dep.to_spec()
    }

    /// Local paths under the home directory are written relative to it.
    fn relative_source(&self, source: &Source) -> Source {
        match source.kind() {
            SourceKind::Local(l) => match l.path.strip_prefix(&self.home_path) {
                Ok(rel) => {
                    let s = Source::local(rel);
                    match source.mod_spec() {
                        Some(spec) => s.with_mod_spec(spec.clone()),
                        None => s,
                    }
                }
                Err(_) => source.clone(),
            },
            _ => source.clone(),
        }
    }
}

fn load_lock(home: &Path) -> Result<IndexMap<String, Dependency>> {
    let lock_path = home.join(LOCK_FILE);
    if !lock_path.is_file() {
        return Ok(IndexMap::new());
    }
    let content = std::fs::read_to_string(&lock_path)?;
    let lock: LockFile = toml::from_str(&content).map_err(|e| CoreError::InvalidManifest {
        path: lock_path.clone(),
        detail: e.to_string(),
    })?;

    let mut locked = IndexMap::new();
    for (key, entry) in lock.dependencies {
        let source: Source = entry.source.parse()?;
        let dep = Dependency {
            name: entry.name,
            full_name: entry.full_name,
            version: entry.version,
            sum: entry.sum,
            local_full_path: None,
            source: source.rebased(home),
        };
        locked.insert(key, dep);
    }
    Ok(locked)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"[package]
name = "app"
edition = "v0.10.0"
version = "0.1.0"

[dependencies]
helloworld = "0.1.2"
k8s = { oci = "oci://ghcr.io/kcl-lang/k8s", tag = "1.28" }
flask = { git = "https://github.com/kcl-lang/flask.git", commit = "ade147b" }
local = { path = "../local" }
sub = { oci = "oci://ghcr.io/org/mono", tag = "1.0.0", package = "sub", version = "0.2.0" }

[profile]
entries = ["main.k"]
"#;

    fn write_pkg(dir: &Path, manifest: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    }

    #[test]
    fn load_manifest_preserves_declaration_order() {
        let dir = tempfile::tempdir().unwrap();
        write_pkg(dir.path(), MANIFEST);
        let pkg = Package::load(dir.path()).unwrap();

        assert_eq!(pkg.name(), "app");
        assert_eq!(pkg.version(), "0.1.0");
        let names: Vec<&str> = pkg.dependencies.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["helloworld", "k8s", "flask", "local", "sub"]);
        assert!(pkg.locked.is_empty());
    }

    #[test]
    fn dependency_kinds_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_pkg(dir.path(), MANIFEST);
        let pkg = Package::load(dir.path()).unwrap();

        let hello = &pkg.dependencies["helloworld"];
        assert!(matches!(hello.source.kind(), SourceKind::SpecOnly));
        assert_eq!(hello.full_name, "helloworld_0.1.2");

        let k8s = &pkg.dependencies["k8s"];
        assert_eq!(k8s.source.as_oci().unwrap().tag, "1.28");
        assert_eq!(k8s.version, "1.28");

        let flask = &pkg.dependencies["flask"];
        assert_eq!(flask.version, "ade147b");
        assert!(flask.source.is_git());

        let local = &pkg.dependencies["local"];
        assert_eq!(local.full_name, "local");
        assert_eq!(
            local.source.as_local().unwrap().path,
            dir.path().join("../local")
        );

        let sub = &pkg.dependencies["sub"];
        assert_eq!(sub.source.mod_spec(), Some(&ModSpec::new("sub", "0.2.0")));
        assert_eq!(sub.version, "1.0.0");
    }

    #[test]
    fn multiple_source_kinds_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_pkg(
            dir.path(),
            "[package]\nname = \"x\"\n\n[dependencies]\nbad = { oci = \"oci://a/b\", path = \"../b\" }\n",
        );
        let err = Package::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Package::load(dir.path()),
            Err(CoreError::ManifestNotFound { .. })
        ));
    }

    #[test]
    fn store_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        write_pkg(dir.path(), MANIFEST);
        let mut pkg = Package::load(dir.path()).unwrap();

        let resolved = Dependency::new(
            "helloworld",
            "0.1.2",
            Source::oci("ghcr.io", "kcl-lang/helloworld", "0.1.2"),
        )
        .with_sum("abc123");
        pkg.locked.insert("helloworld".to_string(), resolved.clone());
        pkg.store().unwrap();

        let reloaded = Package::load(dir.path()).unwrap();
        assert_eq!(
            reloaded.dependencies.keys().collect::<Vec<_>>(),
            pkg.dependencies.keys().collect::<Vec<_>>()
        );
        assert_eq!(reloaded.dependencies["sub"], pkg.dependencies["sub"]);
        assert_eq!(reloaded.dependencies["local"], pkg.dependencies["local"]);
        assert_eq!(reloaded.locked["helloworld"], resolved);
        assert_eq!(reloaded.dependencies["helloworld"].sum, "abc123");
    }

    #[test]
    fn aliased_dependency_takes_sum_from_lock() {
        let dir = tempfile::tempdir().unwrap();
        write_pkg(
            dir.path(),
            "[package]\nname = \"app\"\n\n[dependencies]\nhello = { oci = \"oci://ghcr.io/kcl-lang/helloworld\", tag = \"0.1.2\" }\n",
        );
        std::fs::write(
            dir.path().join(LOCK_FILE),
            "[dependencies.helloworld]\nname = \"helloworld\"\nfull_name = \"helloworld_0.1.2\"\nversion = \"0.1.2\"\nsum = \"abc\"\nsource = \"oci://ghcr.io/kcl-lang/helloworld?tag=0.1.2\"\n",
        )
        .unwrap();

        let pkg = Package::load(dir.path()).unwrap();
        assert_eq!(pkg.dependencies["hello"].sum, "abc");
    }

    #[test]
    fn load_sub_package_by_name() {
        let dir = tempfile::tempdir().unwrap();
        write_pkg(dir.path(), "[package]\nname = \"mono\"\nversion = \"1.0.0\"\n");
        write_pkg(
            &dir.path().join("pkgs/sub"),
            "[package]\nname = \"sub\"\nversion = \"0.2.0\"\n",
        );

        let sub = Package::load_sub_package(dir.path(), &ModSpec::new("sub", "")).unwrap();
        assert_eq!(sub.version(), "0.2.0");
        assert_eq!(sub.home_path, dir.path().join("pkgs/sub"));

        let err = Package::load_sub_package(dir.path(), &ModSpec::new("nope", "")).unwrap_err();
        assert!(matches!(err, CoreError::SubPackageNotFound { .. }));
    }

    #[test]
    fn entries_default_to_source_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.k"), "b = 1").unwrap();
        std::fs::write(dir.path().join("a.k"), "a = 1").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let pkg = Package::new_virtual("v", dir.path());
        let entries = pkg.entries().unwrap();
        assert_eq!(entries, vec![dir.path().join("a.k"), dir.path().join("b.k")]);
    }

    #[test]
    fn full_name_rules() {
        let remote = Dependency::new("k8s", "1.28", Source::oci("ghcr.io", "kcl-lang/k8s", "1.28"));
        assert_eq!(remote.full_name, "k8s_1.28");
        let local = Dependency::new("dep", "0.1.0", Source::local("/tmp/dep"));
        assert_eq!(local.full_name, "dep");
    }
}
