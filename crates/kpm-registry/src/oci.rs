//! OCI distribution client.
//!
//! [`OciClient`] is the narrow pull/push contract the rest of the crate
//! uses. [`HttpOciClient`] speaks the OCI distribution HTTP API with
//! blocking `reqwest`, including the bearer-token handshake that most
//! public registries require even for anonymous pulls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use indexmap::IndexMap;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use kpm_core::version;
use kpm_core::OciSource;

use crate::config::{Platform, Settings};
use crate::error::{RegistryError, Result};

/// Manifest annotation carrying the package content checksum.
pub const SUM_ANNOTATION: &str = "org.kcllang.package.sum";
/// Standard annotation naming a layer's file.
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_LIST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// A content descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub annotations: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    fn for_blob(media_type: &str, data: &[u8]) -> Self {
        Descriptor {
            media_type: media_type.to_string(),
            digest: digest_of(data),
            size: data.len() as u64,
            annotations: IndexMap::new(),
            platform: None,
        }
    }
}

/// An image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub annotations: IndexMap<String, String>,
}

impl ImageManifest {
    /// The package checksum recorded at publish time, if any.
    pub fn sum(&self) -> Option<&str> {
        self.annotations
            .get(SUM_ANNOTATION)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// A multi-platform image index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// The manifest for `platform` (the host when `None`), else the first
    /// manifest without a platform, else the first manifest.
    pub fn select(&self, platform: Option<&Platform>) -> Option<&Descriptor> {
        let wanted = platform.cloned().unwrap_or_else(Platform::host);
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref() == Some(&wanted))
            .or_else(|| self.manifests.iter().find(|d| d.platform.is_none()))
            .or_else(|| self.manifests.first())
    }
}

/// Files written by a pull, plus the manifest they came from.
#[derive(Debug, Clone)]
pub struct PulledArtifact {
    pub manifest: ImageManifest,
    pub files: Vec<PathBuf>,
}

/// Registry operations used by the downloader and the push workflow.
#[cfg_attr(test, mockall::automock)]
pub trait OciClient {
    /// Fetch the image manifest of `oci`, choosing from an index by platform.
    fn fetch_manifest(&self, oci: &OciSource, platform: Option<Platform>) -> Result<ImageManifest>;

    /// Download every layer of `oci` into `dest`.
    fn pull(&self, oci: &OciSource, dest: &Path, platform: Option<Platform>) -> Result<PulledArtifact>;

    /// Upload `archive` as the single layer of `oci`, with manifest annotations.
    fn push(
        &self,
        oci: &OciSource,
        archive: &Path,
        annotations: &IndexMap<String, String>,
    ) -> Result<ImageManifest>;

    /// All tags of a repository. An unknown repository has none.
    fn list_tags(&self, reg: &str, repo: &str) -> Result<Vec<String>>;
}

/// The greatest tag of a repository.
pub fn latest_tag(client: &dyn OciClient, reg: &str, repo: &str) -> Result<String> {
    let tags = client.list_tags(reg, repo)?;
    version::latest(tags.iter().map(String::as_str))
        .map(str::to_string)
        .ok_or_else(|| RegistryError::NoTags {
            reg: reg.to_string(),
            repo: repo.to_string(),
        })
}

/// `sha256:<hex>` digest of a blob.
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// OCI client over HTTP.
pub struct HttpOciClient {
    http: Client,
    settings: Settings,
    /// Bearer tokens by `reg/repo`.
    tokens: Mutex<HashMap<String, String>>,
}

impl HttpOciClient {
    pub fn new(settings: Settings) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("kpm/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpOciClient {
            http,
            settings,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn scheme(&self, reg: &str) -> &'static str {
        if self.settings.is_plain_http(reg) {
            "http"
        } else {
            "https"
        }
    }

    fn repo_url(&self, reg: &str, repo: &str) -> String {
        format!("{}://{reg}/v2/{repo}", self.scheme(reg))
    }

    fn cached_token(&self, reg: &str, repo: &str) -> Option<String> {
        self.tokens
            .lock()
            .ok()
            .and_then(|t| t.get(&format!("{reg}/{repo}")).cloned())
    }

    fn remember_token(&self, reg: &str, repo: &str, token: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(format!("{reg}/{repo}"), token.to_string());
        }
    }

    fn authorize(&self, req: RequestBuilder, reg: &str, repo: &str) -> RequestBuilder {
        if let Some(token) = self.cached_token(reg, repo) {
            req.bearer_auth(token)
        } else if let Some(creds) = self.settings.credentials_for(reg) {
            req.basic_auth(&creds.username, Some(&creds.password))
        } else {
            req
        }
    }

    /// Send a request, answering one 401 challenge with a bearer token.
    fn send<F>(&self, reg: &str, repo: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let resp = self.authorize(build(&self.http), reg, repo).send()?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let token = self.fetch_token(reg, repo, &challenge)?;
        self.remember_token(reg, repo, &token);
        Ok(build(&self.http).bearer_auth(token).send()?)
    }

    fn fetch_token(&self, reg: &str, repo: &str, challenge: &str) -> Result<String> {
        let unauthorized = |detail: String| RegistryError::Oci {
            reg: reg.to_string(),
            repo: repo.to_string(),
            detail,
        };
        let (scheme, params) = parse_challenge(challenge);
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(unauthorized(
                "unauthorized; check the credentials configured for this registry".to_string(),
            ));
        }
        let realm = params
            .get("realm")
            .ok_or_else(|| unauthorized(format!("bearer challenge without realm: {challenge}")))?;

        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{repo}:pull"));
        let mut query = vec![("scope", scope)];
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }

        let mut req = self.http.get(realm.as_str()).query(&query);
        if let Some(creds) = self.settings.credentials_for(reg) {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }
        let resp = req.send()?;
        if !resp.status().is_success() {
            return Err(unauthorized(format!("token request failed: {}", resp.status())));
        }
        let body: TokenResponse = resp.json()?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| unauthorized("token response carried no token".to_string()))
    }

    fn expect_success(&self, reg: &str, repo: &str, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(RegistryError::Oci {
            reg: reg.to_string(),
            repo: repo.to_string(),
            detail: format!("{status}: {}", body.trim()),
        })
    }

    fn get_manifest_json(&self, oci: &OciSource, reference: &str) -> Result<serde_json::Value> {
        let url = format!("{}/manifests/{reference}", self.repo_url(&oci.reg, &oci.repo));
        let accept = [
            MANIFEST_MEDIA_TYPE,
            INDEX_MEDIA_TYPE,
            DOCKER_MANIFEST_MEDIA_TYPE,
            DOCKER_LIST_MEDIA_TYPE,
        ]
        .join(", ");
        let resp = self.send(&oci.reg, &oci.repo, |c| c.get(&url).header(ACCEPT, &accept))?;
        let resp = self.expect_success(&oci.reg, &oci.repo, resp)?;
        Ok(serde_json::from_slice(&resp.bytes()?)?)
    }

    fn fetch_blob(&self, oci: &OciSource, digest: &str) -> Result<Vec<u8>> {
        let url = format!("{}/blobs/{digest}", self.repo_url(&oci.reg, &oci.repo));
        let resp = self.send(&oci.reg, &oci.repo, |c| c.get(&url))?;
        let data = self.expect_success(&oci.reg, &oci.repo, resp)?.bytes()?.to_vec();
        verify_digest(oci, digest, &data)?;
        Ok(data)
    }

    fn upload_blob(&self, oci: &OciSource, data: &[u8]) -> Result<String> {
        let (reg, repo) = (oci.reg.as_str(), oci.repo.as_str());
        let digest = digest_of(data);
        let base = self.repo_url(reg, repo);

        let head_url = format!("{base}/blobs/{digest}");
        let existing = self.send(reg, repo, |c| c.head(&head_url))?;
        if existing.status().is_success() {
            debug!(%digest, "blob already present");
            return Ok(digest);
        }

        let start_url = format!("{base}/blobs/uploads/");
        let resp = self.send(reg, repo, |c| c.post(&start_url))?;
        let resp = self.expect_success(reg, repo, resp)?;
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::Oci {
                reg: reg.to_string(),
                repo: repo.to_string(),
                detail: "upload session without Location header".to_string(),
            })?;
        let location = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}://{reg}{location}", self.scheme(reg))
        };
        let sep = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{sep}digest={digest}");

        let resp = self.send(reg, repo, |c| {
            c.put(&put_url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(data.to_vec())
        })?;
        self.expect_success(reg, repo, resp)?;
        Ok(digest)
    }
}

impl OciClient for HttpOciClient {
    fn fetch_manifest(&self, oci: &OciSource, platform: Option<Platform>) -> Result<ImageManifest> {
        if oci.tag.is_empty() {
            return Err(RegistryError::Oci {
                reg: oci.reg.clone(),
                repo: oci.repo.clone(),
                detail: "a tag is required to fetch a manifest".to_string(),
            });
        }
        let value = self.get_manifest_json(oci, &oci.tag)?;
        if !is_index(&value) {
            return Ok(serde_json::from_value(value)?);
        }

        let index: ImageIndex = serde_json::from_value(value)?;
        let chosen = index
            .select(platform.as_ref())
            .ok_or_else(|| RegistryError::Oci {
                reg: oci.reg.clone(),
                repo: oci.repo.clone(),
                detail: format!("image index for '{}' is empty", oci.tag),
            })?;
        debug!(digest = %chosen.digest, "selected manifest from index");
        let value = self.get_manifest_json(oci, &chosen.digest)?;
        Ok(serde_json::from_value(value)?)
    }

    fn pull(&self, oci: &OciSource, dest: &Path, platform: Option<Platform>) -> Result<PulledArtifact> {
        let manifest = self.fetch_manifest(oci, platform)?;
        std::fs::create_dir_all(dest)?;

        let mut files = Vec::new();
        for layer in &manifest.layers {
            let data = self.fetch_blob(oci, &layer.digest)?;
            let name = layer
                .annotations
                .get(TITLE_ANNOTATION)
                .and_then(|t| Path::new(t).file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| {
                    format!("{}.tar", layer.digest.trim_start_matches("sha256:"))
                });
            let path = dest.join(name);
            std::fs::write(&path, &data)?;
            files.push(path);
        }
        info!(reference = %oci.reference(), layers = files.len(), "pulled");
        Ok(PulledArtifact { manifest, files })
    }

    fn push(
        &self,
        oci: &OciSource,
        archive: &Path,
        annotations: &IndexMap<String, String>,
    ) -> Result<ImageManifest> {
        let data = std::fs::read(archive)?;
        let config_data = b"{}".to_vec();

        self.upload_blob(oci, &data)?;
        self.upload_blob(oci, &config_data)?;

        let mut layer = Descriptor::for_blob(LAYER_MEDIA_TYPE, &data);
        if let Some(name) = archive.file_name() {
            layer
                .annotations
                .insert(TITLE_ANNOTATION.to_string(), name.to_string_lossy().into_owned());
        }
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MANIFEST_MEDIA_TYPE.to_string()),
            config: Descriptor::for_blob(CONFIG_MEDIA_TYPE, &config_data),
            layers: vec![layer],
            annotations: annotations.clone(),
        };

        let body = serde_json::to_vec(&manifest)?;
        let url = format!("{}/manifests/{}", self.repo_url(&oci.reg, &oci.repo), oci.tag);
        let resp = self.send(&oci.reg, &oci.repo, |c| {
            c.put(&url)
                .header(CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
                .body(body.clone())
        })?;
        self.expect_success(&oci.reg, &oci.repo, resp)?;
        info!(reference = %oci.reference(), "pushed");
        Ok(manifest)
    }

    fn list_tags(&self, reg: &str, repo: &str) -> Result<Vec<String>> {
        let url = format!("{}/tags/list", self.repo_url(reg, repo));
        let resp = self.send(reg, repo, |c| c.get(&url))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let list: TagList = self.expect_success(reg, repo, resp)?.json()?;
        Ok(list.tags.unwrap_or_default())
    }
}

fn is_index(value: &serde_json::Value) -> bool {
    match value.get("mediaType").and_then(|m| m.as_str()) {
        Some(INDEX_MEDIA_TYPE) | Some(DOCKER_LIST_MEDIA_TYPE) => true,
        Some(_) => false,
        None => value.get("manifests").is_some(),
    }
}

fn verify_digest(oci: &OciSource, digest: &str, data: &[u8]) -> Result<()> {
    if !digest.starts_with("sha256:") {
        warn!(%digest, "unsupported digest algorithm, not verified");
        return Ok(());
    }
    let actual = digest_of(data);
    if actual != digest {
        return Err(RegistryError::Oci {
            reg: oci.reg.clone(),
            repo: oci.repo.clone(),
            detail: format!("blob digest mismatch: expected {digest}, got {actual}"),
        });
    }
    Ok(())
}

/// Split a `WWW-Authenticate` header into its scheme and parameters.
///
/// Quoted values may contain commas (`scope="repository:a:pull,push"`).
fn parse_challenge(header: &str) -> (String, HashMap<String, String>) {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    (scheme.to_string(), params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bearer_challenge() {
        let (scheme, params) = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:kcl-lang/k8s:pull,push""#,
        );
        assert_eq!(scheme, "Bearer");
        assert_eq!(params["realm"], "https://ghcr.io/token");
        assert_eq!(params["service"], "ghcr.io");
        assert_eq!(params["scope"], "repository:kcl-lang/k8s:pull,push");
    }

    #[test]
    fn parse_basic_challenge() {
        let (scheme, params) = parse_challenge(r#"Basic realm="Registry Realm""#);
        assert_eq!(scheme, "Basic");
        assert_eq!(params["realm"], "Registry Realm");
    }

    #[test]
    fn manifest_sum_annotation() {
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a", "size": 2},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar", "digest": "sha256:abc", "size": 10, "annotations": {"org.opencontainers.image.title": "helloworld_0.1.2.tar"}}],
            "annotations": {"org.kcllang.package.sum": "deadbeef"}
        }"#;
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert!(!is_index(&value));
        let manifest: ImageManifest = serde_json::from_value(value).unwrap();
        assert_eq!(manifest.sum(), Some("deadbeef"));
        assert_eq!(manifest.layers[0].annotations[TITLE_ANNOTATION], "helloworld_0.1.2.tar");
    }

    #[test]
    fn index_platform_selection() {
        let desc = |digest: &str, os: &str, arch: &str| Descriptor {
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            digest: digest.to_string(),
            size: 1,
            annotations: IndexMap::new(),
            platform: Some(Platform {
                os: os.to_string(),
                architecture: arch.to_string(),
            }),
        };
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(INDEX_MEDIA_TYPE.to_string()),
            manifests: vec![desc("sha256:a", "linux", "amd64"), desc("sha256:b", "linux", "arm64")],
        };

        let arm = Platform {
            os: "linux".to_string(),
            architecture: "arm64".to_string(),
        };
        assert_eq!(index.select(Some(&arm)).unwrap().digest, "sha256:b");

        let other = Platform {
            os: "plan9".to_string(),
            architecture: "mips".to_string(),
        };
        assert_eq!(index.select(Some(&other)).unwrap().digest, "sha256:a");
    }

    #[test]
    fn index_detected_without_media_type() {
        let value = serde_json::json!({"schemaVersion": 2, "manifests": []});
        assert!(is_index(&value));
    }

    #[test]
    fn digest_verification() {
        let oci = OciSource::new("ghcr.io", "a/b", "1");
        let data = b"hello";
        assert!(verify_digest(&oci, &digest_of(data), data).is_ok());
        let err = verify_digest(&oci, &digest_of(b"other"), data).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn latest_tag_prefers_semver() {
        let mut client = MockOciClient::new();
        client
            .expect_list_tags()
            .returning(|_, _| Ok(vec!["0.1.0".into(), "0.10.0".into(), "0.9.1".into()]));
        assert_eq!(latest_tag(&client, "ghcr.io", "kcl-lang/k8s").unwrap(), "0.10.0");
    }

    #[test]
    fn latest_tag_without_tags() {
        let mut client = MockOciClient::new();
        client.expect_list_tags().returning(|_, _| Ok(Vec::new()));
        let err = latest_tag(&client, "ghcr.io", "kcl-lang/none").unwrap_err();
        assert!(matches!(err, RegistryError::NoTags { .. }));
    }

    #[test]
    fn plain_http_hosts() {
        let settings = Settings {
            plain_http: vec!["localhost:5001".to_string()],
            ..Default::default()
        };
        let client = HttpOciClient::new(settings).unwrap();
        assert_eq!(client.repo_url("localhost:5001", "a/b"), "http://localhost:5001/v2/a/b");
        assert_eq!(client.repo_url("ghcr.io", "a/b"), "https://ghcr.io/v2/a/b");
    }
}
