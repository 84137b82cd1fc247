//! Dependency sources.
//!
//! A [`Source`] says where a dependency comes from: a local path, a git
//! repository, an OCI artifact, a registry package (an OCI artifact that is
//! also addressed by name and version), or a bare name/version spec that is
//! bound to the default registry later. Any of these may carry a [`ModSpec`]
//! narrowing the source to one sub-package of a multi-package artifact.
//!
//! Canonical string forms:
//! ```text
//! oci://ghcr.io/kcl-lang/helloworld?tag=0.1.0
//! registry://ghcr.io/kcl-lang/helloworld?name=helloworld&version=0.1.0&tag=0.1.0
//! git://github.com/kcl-lang/flask?commit=ade147b      (https transport)
//! git+file:///tmp/repo?branch=main                     (any other transport)
//! helloworld:0.1.0                                     (spec only)
//! spec://helloworld                                    (spec only, latest)
//! ../path/to/pkg?mod=sub:0.2.0                         (local + mod spec)
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::error::{CoreError, Result};
use crate::package::MANIFEST_FILE;

const OCI_SCHEME: &str = "oci";
const REGISTRY_SCHEME: &str = "registry";
const GIT_SCHEME: &str = "git";
const SPEC_SCHEME: &str = "spec";
const FILE_SCHEME: &str = "file";
const GIT_TRANSPORT_PREFIX: &str = "git+";

/// A `name[:version]` pin on a package identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModSpec {
    pub name: String,
    /// Empty means "whatever version the artifact carries".
    #[serde(default)]
    pub version: String,
}

impl ModSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        ModSpec {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parse `name` or `name:version`.
    pub fn parse(s: &str) -> Result<Self> {
        let (name, version) = match s.split_once(':') {
            Some((n, v)) => (n, v),
            None => (s, ""),
        };
        if !is_package_ident(name) {
            return Err(CoreError::InvalidSource {
                source_str: s.to_string(),
                detail: format!("'{name}' is not a valid package name"),
            });
        }
        Ok(ModSpec::new(name, version))
    }
}

impl fmt::Display for ModSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.name, self.version)
        }
    }
}

/// A dependency on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalSource {
    pub path: PathBuf,
}

/// A git reference. Exactly one is used to fetch a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GitRef {
    Branch(String),
    Commit(String),
    Tag(String),
}

impl GitRef {
    pub fn as_str(&self) -> &str {
        match self {
            GitRef::Branch(s) | GitRef::Commit(s) | GitRef::Tag(s) => s,
        }
    }
}

/// A dependency hosted in a git repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GitSource {
    /// Clone URL, including its transport (`https://`, `file://`, `ssh://`, scp-like).
    pub url: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub tag: Option<String>,
}

impl GitSource {
    pub fn new(url: impl Into<String>) -> Self {
        GitSource {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// The single reference to check out.
    ///
    /// Fails when none or more than one of branch/commit/tag is set.
    pub fn reference(&self) -> Result<GitRef> {
        let refs: Vec<GitRef> = [
            self.branch.clone().map(GitRef::Branch),
            self.commit.clone().map(GitRef::Commit),
            self.tag.clone().map(GitRef::Tag),
        ]
        .into_iter()
        .flatten()
        .filter(|r| !r.as_str().is_empty())
        .collect();

        match <[GitRef; 1]>::try_from(refs) {
            Ok([r]) => Ok(r),
            Err(refs) => Err(CoreError::AmbiguousGitRef {
                url: self.url.clone(),
                count: refs.len(),
            }),
        }
    }

    /// Host and repository path, with any `.git` suffix removed.
    ///
    /// Handles URLs (`https://host/org/repo.git`) and scp-like remotes
    /// (`git@host:org/repo.git`). `file://` URLs report `localhost`.
    pub fn host_and_path(&self) -> (String, String) {
        let url = self.url.as_str();
        let (host, path) = if let Some((_, rest)) = url.split_once("://") {
            let rest = rest.rsplit_once('@').map(|(_, r)| r).unwrap_or(rest);
            match rest.split_once('/') {
                Some(("", p)) => ("localhost".to_string(), p.to_string()),
                Some((h, p)) => (h.to_string(), p.to_string()),
                None => (rest.to_string(), String::new()),
            }
        } else if let Some((h, p)) = url.split_once(':') {
            let h = h.rsplit_once('@').map(|(_, h)| h).unwrap_or(h);
            (h.to_string(), p.to_string())
        } else {
            ("localhost".to_string(), url.trim_start_matches('/').to_string())
        };
        let path = path.trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        (host, path.to_string())
    }

    /// Repository name: the last path segment of the URL.
    pub fn repo_name(&self) -> String {
        let (_, path) = self.host_and_path();
        path.rsplit('/').next().unwrap_or_default().to_string()
    }

    fn ref_label(&self) -> String {
        self.commit
            .as_deref()
            .or(self.tag.as_deref())
            .or(self.branch.as_deref())
            .unwrap_or("HEAD")
            .to_string()
    }
}

/// A dependency stored as an OCI artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OciSource {
    /// Registry host, optionally with a port (`ghcr.io`, `localhost:5000`).
    pub reg: String,
    /// Repository path inside the registry (`kcl-lang/helloworld`).
    pub repo: String,
    /// Empty means the latest tag available in the registry.
    pub tag: String,
}

impl OciSource {
    pub fn new(reg: impl Into<String>, repo: impl Into<String>, tag: impl Into<String>) -> Self {
        OciSource {
            reg: reg.into(),
            repo: repo.into(),
            tag: tag.into(),
        }
    }

    /// Last segment of the repository path.
    pub fn repo_name(&self) -> &str {
        self.repo.rsplit('/').next().unwrap_or(&self.repo)
    }

    /// `reg/repo:tag`, the form registries print.
    pub fn reference(&self) -> String {
        if self.tag.is_empty() {
            format!("{}/{}", self.reg, self.repo)
        } else {
            format!("{}/{}:{}", self.reg, self.repo, self.tag)
        }
    }
}

/// An OCI artifact addressed through a package name and version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RegistrySource {
    pub name: String,
    pub version: String,
    pub oci: OciSource,
}

/// Which kind of location a [`Source`] points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Local(LocalSource),
    Git(GitSource),
    Oci(OciSource),
    Registry(RegistrySource),
    /// Only a [`ModSpec`]; the registry is filled in from defaults.
    SpecOnly,
}

impl SourceKind {
    fn label(&self) -> &'static str {
        match self {
            SourceKind::Local(_) => "local",
            SourceKind::Git(_) => "git",
            SourceKind::Oci(_) => "oci",
            SourceKind::Registry(_) => "registry",
            SourceKind::SpecOnly => "spec-only",
        }
    }
}

/// Where a dependency comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    kind: SourceKind,
    mod_spec: Option<ModSpec>,
}

impl Source {
    /// Build a source, checking that a spec-only source carries its spec.
    pub fn new(kind: SourceKind, mod_spec: Option<ModSpec>) -> Result<Self> {
        if matches!(kind, SourceKind::SpecOnly) {
            match &mod_spec {
                Some(spec) if !spec.name.is_empty() => {}
                _ => {
                    return Err(CoreError::InvalidSource {
                        source_str: String::new(),
                        detail: "a spec-only source needs a package name".to_string(),
                    })
                }
            }
        }
        Ok(Source { kind, mod_spec })
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Source {
            kind: SourceKind::Local(LocalSource { path: path.into() }),
            mod_spec: None,
        }
    }

    pub fn git(git: GitSource) -> Self {
        Source {
            kind: SourceKind::Git(git),
            mod_spec: None,
        }
    }

    pub fn oci(reg: impl Into<String>, repo: impl Into<String>, tag: impl Into<String>) -> Self {
        Source {
            kind: SourceKind::Oci(OciSource::new(reg, repo, tag)),
            mod_spec: None,
        }
    }

    pub fn registry(name: impl Into<String>, version: impl Into<String>, oci: OciSource) -> Self {
        Source {
            kind: SourceKind::Registry(RegistrySource {
                name: name.into(),
                version: version.into(),
                oci,
            }),
            mod_spec: None,
        }
    }

    pub fn spec_only(spec: ModSpec) -> Result<Self> {
        Source::new(SourceKind::SpecOnly, Some(spec))
    }

    /// Attach a sub-package pin.
    pub fn with_mod_spec(mut self, spec: ModSpec) -> Self {
        self.mod_spec = Some(spec);
        self
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn mod_spec(&self) -> Option<&ModSpec> {
        self.mod_spec.as_ref()
    }

    pub fn as_local(&self) -> Result<&LocalSource> {
        match &self.kind {
            SourceKind::Local(l) => Ok(l),
            other => Err(self.wrong_kind("local", other)),
        }
    }

    pub fn as_git(&self) -> Result<&GitSource> {
        match &self.kind {
            SourceKind::Git(g) => Ok(g),
            other => Err(self.wrong_kind("git", other)),
        }
    }

    /// The OCI coordinates of an OCI or registry source.
    pub fn as_oci(&self) -> Result<&OciSource> {
        match &self.kind {
            SourceKind::Oci(o) => Ok(o),
            SourceKind::Registry(r) => Ok(&r.oci),
            other => Err(self.wrong_kind("oci", other)),
        }
    }

    pub fn as_registry(&self) -> Result<&RegistrySource> {
        match &self.kind {
            SourceKind::Registry(r) => Ok(r),
            other => Err(self.wrong_kind("registry", other)),
        }
    }

    fn wrong_kind(&self, expected: &'static str, found: &SourceKind) -> CoreError {
        CoreError::WrongSourceKind {
            expected,
            found: format!("{} source '{}'", found.label(), self),
        }
    }

    pub fn is_remote(&self) -> bool {
        match self.kind {
            SourceKind::Git(_)
            | SourceKind::Oci(_)
            | SourceKind::Registry(_)
            | SourceKind::SpecOnly => true,
            SourceKind::Local(_) => false,
        }
    }

    pub fn is_local_path(&self) -> bool {
        matches!(self.kind, SourceKind::Local(_))
    }

    pub fn is_local_tar_path(&self) -> bool {
        self.local_file_name()
            .is_some_and(|n| n.ends_with(".tar"))
    }

    pub fn is_local_tgz_path(&self) -> bool {
        self.local_file_name()
            .is_some_and(|n| n.ends_with(".tgz") || n.ends_with(".tar.gz"))
    }

    pub fn is_local_archive(&self) -> bool {
        self.is_local_tar_path() || self.is_local_tgz_path()
    }

    pub fn is_git(&self) -> bool {
        matches!(self.kind, SourceKind::Git(_))
    }

    fn local_file_name(&self) -> Option<String> {
        match &self.kind {
            SourceKind::Local(l) => l
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase()),
            _ => None,
        }
    }

    /// Rebase a relative local path against `base`; other sources are returned as is.
    pub fn rebased(&self, base: &Path) -> Source {
        match &self.kind {
            SourceKind::Local(l) if l.path.is_relative() => Source {
                kind: SourceKind::Local(LocalSource {
                    path: base.join(&l.path),
                }),
                mod_spec: self.mod_spec.clone(),
            },
            _ => self.clone(),
        }
    }

    /// The package root of a local source.
    ///
    /// A directory is its own root. For a file, the nearest ancestor holding
    /// a manifest is the root, falling back to the file's parent directory.
    pub fn find_root_path(&self) -> Result<PathBuf> {
        let local = self.as_local()?;
        let path = &local.path;
        if path.is_dir() {
            return Ok(path.clone());
        }
        if !path.exists() {
            return Err(CoreError::InvalidSource {
                source_str: self.to_string(),
                detail: format!("{} does not exist", path.display()),
            });
        }

        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut dir = parent.clone();
        loop {
            if dir.join(MANIFEST_FILE).is_file() {
                return Ok(dir);
            }
            if !dir.pop() {
                break;
            }
        }
        Ok(parent)
    }

    /// Relative path separating artifacts of different sources and refs on disk.
    pub fn to_file_path(&self) -> PathBuf {
        match &self.kind {
            SourceKind::Local(l) => l.path.clone(),
            SourceKind::Git(g) => {
                let (host, path) = g.host_and_path();
                let mut p = PathBuf::from(GIT_SCHEME).join(sanitize(&host));
                for seg in path.split('/').filter(|s| !s.is_empty()) {
                    p.push(sanitize(seg));
                }
                p.push(sanitize(&g.ref_label()));
                p
            }
            SourceKind::Oci(o) => oci_file_path(o, &o.tag),
            SourceKind::Registry(r) => {
                let reference = if r.oci.tag.is_empty() { &r.version } else { &r.oci.tag };
                oci_file_path(&r.oci, reference)
            }
            SourceKind::SpecOnly => {
                let spec = self.mod_spec.clone().unwrap_or_default();
                let version = if spec.version.is_empty() {
                    "latest".to_string()
                } else {
                    spec.version
                };
                PathBuf::from(SPEC_SCHEME)
                    .join(sanitize(&spec.name))
                    .join(sanitize(&version))
            }
        }
    }

    fn parse_remote(scheme: &str, rest: &str, original: &str) -> Result<Self> {
        let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut params = QueryParams::parse(query, original)?;
        let mod_spec = params.take("mod").map(|m| ModSpec::parse(&m)).transpose()?;

        let kind = match scheme {
            OCI_SCHEME => {
                let (reg, repo) = split_reg_repo(location, original)?;
                let tag = params.take("tag").unwrap_or_default();
                SourceKind::Oci(OciSource { reg, repo, tag })
            }
            REGISTRY_SCHEME => {
                let (reg, repo) = split_reg_repo(location, original)?;
                let tag = params.take("tag").unwrap_or_default();
                let version = params.take("version").unwrap_or_default();
                let name = params
                    .take("name")
                    .unwrap_or_else(|| repo.rsplit('/').next().unwrap_or_default().to_string());
                SourceKind::Registry(RegistrySource {
                    name,
                    version,
                    oci: OciSource { reg, repo, tag },
                })
            }
            GIT_SCHEME => {
                if location.is_empty() {
                    return Err(CoreError::InvalidSource {
                        source_str: original.to_string(),
                        detail: "missing git host".to_string(),
                    });
                }
                SourceKind::Git(GitSource {
                    url: format!("https://{location}"),
                    branch: params.take("branch"),
                    commit: params.take("commit"),
                    tag: params.take("tag"),
                })
            }
            SPEC_SCHEME => {
                let spec = ModSpec::new(location, params.take("version").unwrap_or_default());
                params.finish()?;
                return Source::spec_only(ModSpec::parse(&spec.to_string())?).map_err(|_| {
                    CoreError::InvalidSource {
                        source_str: original.to_string(),
                        detail: "missing package name".to_string(),
                    }
                });
            }
            other => {
                return Err(CoreError::UnsupportedScheme {
                    scheme: other.to_string(),
                    source_str: original.to_string(),
                })
            }
        };
        params.finish()?;
        Ok(Source { kind, mod_spec })
    }

    fn parse_git_transport(rest: &str, original: &str) -> Result<Self> {
        let (url, query) = rest.split_once('?').unwrap_or((rest, ""));
        if url.is_empty() {
            return Err(CoreError::InvalidSource {
                source_str: original.to_string(),
                detail: "missing git url".to_string(),
            });
        }
        let mut params = QueryParams::parse(query, original)?;
        let mod_spec = params.take("mod").map(|m| ModSpec::parse(&m)).transpose()?;
        let kind = SourceKind::Git(GitSource {
            url: url.to_string(),
            branch: params.take("branch"),
            commit: params.take("commit"),
            tag: params.take("tag"),
        });
        params.finish()?;
        Ok(Source { kind, mod_spec })
    }

    fn parse_local(s: &str) -> Result<Self> {
        let (path, mod_spec) = match s.rsplit_once("?mod=") {
            Some((p, m)) => (p, Some(ModSpec::parse(m)?)),
            None => (s, None),
        };
        let path = path
            .strip_prefix(&format!("{FILE_SCHEME}://"))
            .unwrap_or(path);
        if path.is_empty() {
            return Err(CoreError::InvalidSource {
                source_str: s.to_string(),
                detail: "empty path".to_string(),
            });
        }
        Ok(Source {
            kind: SourceKind::Local(LocalSource {
                path: PathBuf::from(path),
            }),
            mod_spec,
        })
    }
}

impl FromStr for Source {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidSource {
                source_str: String::new(),
                detail: "empty source".to_string(),
            });
        }

        if let Some(rest) = s.strip_prefix(GIT_TRANSPORT_PREFIX) {
            return Source::parse_git_transport(rest, s);
        }

        if let Some((scheme, rest)) = s.split_once("://") {
            if scheme == FILE_SCHEME {
                return Source::parse_local(s);
            }
            return Source::parse_remote(scheme, rest, s);
        }

        if let Some((name, version)) = s.split_once(':') {
            if is_package_ident(name)
                && name.len() > 1
                && !version.is_empty()
                && !version.contains(['/', '\\', '?'])
            {
                return Source::spec_only(ModSpec::new(name, version));
            }
        }

        Source::parse_local(s)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        let mut has_query = false;
        let mut push = |k: &str, v: &str| {
            if !v.is_empty() {
                query.append_pair(k, v);
                has_query = true;
            }
        };

        let base = match &self.kind {
            SourceKind::Local(l) => l.path.display().to_string(),
            SourceKind::Git(g) => {
                push("branch", g.branch.as_deref().unwrap_or_default());
                push("commit", g.commit.as_deref().unwrap_or_default());
                push("tag", g.tag.as_deref().unwrap_or_default());
                match g.url.strip_prefix("https://") {
                    Some(rest) => format!("{GIT_SCHEME}://{rest}"),
                    None => format!("{GIT_TRANSPORT_PREFIX}{}", g.url),
                }
            }
            SourceKind::Oci(o) => {
                push("tag", &o.tag);
                format!("{OCI_SCHEME}://{}/{}", o.reg, o.repo)
            }
            SourceKind::Registry(r) => {
                push("name", &r.name);
                push("version", &r.version);
                push("tag", &r.oci.tag);
                format!("{REGISTRY_SCHEME}://{}/{}", r.oci.reg, r.oci.repo)
            }
            SourceKind::SpecOnly => {
                let spec = self.mod_spec.clone().unwrap_or_default();
                return if spec.version.is_empty() {
                    write!(f, "{SPEC_SCHEME}://{}", spec.name)
                } else {
                    write!(f, "{}:{}", spec.name, spec.version)
                };
            }
        };

        if let Some(spec) = &self.mod_spec {
            if matches!(self.kind, SourceKind::Local(_)) {
                return write!(f, "{base}?mod={spec}");
            }
            push("mod", &spec.to_string());
        }

        if has_query {
            write!(f, "{base}?{}", query.finish())
        } else {
            write!(f, "{base}")
        }
    }
}

/// Query parameters of a source string; unknown keys are rejected.
struct QueryParams {
    pairs: Vec<(String, String)>,
    original: String,
}

impl QueryParams {
    fn parse(query: &str, original: &str) -> Result<Self> {
        let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Ok(QueryParams {
            pairs,
            original: original.to_string(),
        })
    }

    fn take(&mut self, key: &str) -> Option<String> {
        let idx = self.pairs.iter().position(|(k, _)| k == key)?;
        let (_, v) = self.pairs.remove(idx);
        if v.is_empty() {
            None
        } else {
            Some(v)
        }
    }

    fn finish(self) -> Result<()> {
        match self.pairs.first() {
            None => Ok(()),
            Some((k, _)) => Err(CoreError::InvalidSource {
                source_str: self.original,
                detail: format!("unknown parameter '{k}'"),
            }),
        }
    }
}

fn split_reg_repo(location: &str, original: &str) -> Result<(String, String)> {
    match location.trim_end_matches('/').split_once('/') {
        Some((reg, repo)) if !reg.is_empty() && !repo.is_empty() => {
            Ok((reg.to_string(), repo.to_string()))
        }
        _ => Err(CoreError::InvalidSource {
            source_str: original.to_string(),
            detail: "expected <registry>/<repository>".to_string(),
        }),
    }
}

fn oci_file_path(oci: &OciSource, reference: &str) -> PathBuf {
    let mut p = PathBuf::from(OCI_SCHEME).join(sanitize(&oci.reg));
    for seg in oci.repo.split('/').filter(|s| !s.is_empty()) {
        p.push(sanitize(seg));
    }
    p.push(if reference.is_empty() {
        "latest".to_string()
    } else {
        sanitize(reference)
    });
    p
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            ':' | '\\' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Package names: ASCII alphanumerics, `_`, `-` and `.`, not starting with `.` or `-`.
pub fn is_package_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
