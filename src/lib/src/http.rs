//! HTTP-backed metadata and artifact retrieval
//!
//! Default implementations of the [`crate::remote`] traits for servers that
//! expose repository metadata and targets over plain HTTP(S):
//!
//! - [`HttpMetadataSource`]: downloads the role documents of the director
//!   and image repositories into the lockbox metadata stores.
//! - [`HttpArtifactFetcher`]: downloads OSTree commit objects, binary blobs
//!   and compose bundles, verifying SHA-256 (and length where declared)
//!   before anything is reported as fetched; for compose targets it also
//!   pulls the per-image registry manifests for the configured platforms.
//!
//! Registry access supports anonymous pulls and basic-auth logins from the
//! build configuration. Token-dance authentication schemes are a transport
//! concern outside this crate.

use crate::error::LockboxError;
use crate::remote::{
    AccessToken, ArtifactFetcher, BinaryFetchRequest, ComposeFetchRequest, MetadataSource,
    OstreeFetchRequest, RegistryAuth,
};
use std::io::Read;
use std::path::Path;

const DIRECTOR_ROLES: &[&str] = &["root.json", "timestamp.json", "snapshot.json", "targets.json"];
const IMAGE_REPO_ROLES: &[&str] =
    &["root.json", "timestamp.json", "snapshot.json", "targets.json"];

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

fn http_get(url: &str, token: Option<&AccessToken>, accept: Option<&str>) -> Result<Vec<u8>, LockboxError> {
    let mut request = ureq::get(url);
    if let Some(token) = token {
        request = request.header("Authorization", &format!("Bearer {}", token.reveal()));
    }
    if let Some(accept) = accept {
        request = request.header("Accept", accept);
    }
    let response = request
        .call()
        .map_err(|e| LockboxError::Transport(format!("GET {} failed: {}", url, e)))?;

    let mut body = Vec::new();
    response
        .into_body()
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| LockboxError::Transport(format!("Failed to read body of {}: {}", url, e)))?;
    Ok(body)
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Metadata source fetching role documents over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetadataSource {
    director_url: String,
    image_repo_url: String,
}

impl HttpMetadataSource {
    pub fn new(director_url: impl Into<String>, image_repo_url: impl Into<String>) -> Self {
        Self {
            director_url: director_url.into(),
            image_repo_url: image_repo_url.into(),
        }
    }

    fn download_into(
        base: &str,
        files: &[String],
        dest: &Path,
        token: &AccessToken,
    ) -> Result<(), LockboxError> {
        for file in files {
            let url = join_url(base, file);
            log::debug!("Downloading metadata '{}'", url);
            let body = http_get(&url, Some(token), None)?;
            std::fs::write(dest.join(file), body)?;
        }
        Ok(())
    }
}

impl MetadataSource for HttpMetadataSource {
    fn fetch_director_metadata(
        &self,
        lockbox_name: &str,
        dest: &Path,
        token: &AccessToken,
    ) -> Result<(), LockboxError> {
        let mut files: Vec<String> = DIRECTOR_ROLES.iter().map(|f| f.to_string()).collect();
        files.push(format!("{}.json", lockbox_name));
        files.push(crate::metadata::OFFLINE_SNAPSHOT_FILE.to_string());
        Self::download_into(&self.director_url, &files, dest, token)
    }

    fn fetch_image_repo_metadata(
        &self,
        dest: &Path,
        token: &AccessToken,
    ) -> Result<(), LockboxError> {
        let files: Vec<String> = IMAGE_REPO_ROLES.iter().map(|f| f.to_string()).collect();
        Self::download_into(&self.image_repo_url, &files, dest, token)
    }
}

/// Verify a downloaded payload against its descriptor.
fn verify_payload(
    target: &str,
    payload: &[u8],
    sha256: &str,
    length: Option<u64>,
) -> Result<(), LockboxError> {
    if let Some(expected) = length {
        if payload.len() as u64 != expected {
            return Err(LockboxError::Data(format!(
                "Target '{}' has length {}, expected {}",
                target,
                payload.len(),
                expected
            )));
        }
    }
    let digest = hex::encode(hmac_sha256::Hash::hash(payload));
    if !digest.eq_ignore_ascii_case(sha256) {
        return Err(LockboxError::Data(format!(
            "Target '{}' has sha256 {}, expected {}",
            target, digest, sha256
        )));
    }
    Ok(())
}

/// Artifact fetcher downloading targets over HTTP.
#[derive(Debug, Clone)]
pub struct HttpArtifactFetcher {
    /// Base URL of the OSTree repository.
    ostree_url: String,
    /// Base URL of the target store of the update server.
    repo_url: String,
}

impl HttpArtifactFetcher {
    pub fn new(ostree_url: impl Into<String>, repo_url: impl Into<String>) -> Self {
        Self {
            ostree_url: ostree_url.into(),
            repo_url: repo_url.into(),
        }
    }

    fn fetch_verified_blob(
        &self,
        req: &BinaryFetchRequest<'_>,
        token: &AccessToken,
    ) -> Result<(), LockboxError> {
        let url = join_url(&self.repo_url, &join_url("targets", req.target));
        let payload = http_get(&url, Some(token), None)?;
        verify_payload(req.target, &payload, req.sha256, Some(req.length))?;
        std::fs::write(req.images_dir.join(req.target), payload)?;
        log::debug!(
            "Stored binary target '{}' ({} bytes)",
            req.target,
            req.length
        );
        Ok(())
    }
}

impl ArtifactFetcher for HttpArtifactFetcher {
    fn fetch_ostree_artifact(
        &self,
        req: &OstreeFetchRequest<'_>,
        token: &AccessToken,
    ) -> Result<(), LockboxError> {
        // Only lowercase/uppercase ASCII hex may reach the slice below;
        // anything else in the catalog is malformed data, not a panic.
        if req.sha256.len() < 3 || !req.sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(LockboxError::Data(format!(
                "Target '{}' has a malformed sha256 '{}'",
                req.target, req.sha256
            )));
        }
        // Commit objects are content-addressed by their checksum.
        let object_path = format!("objects/{}/{}.commit", &req.sha256[..2], &req.sha256[2..]);
        let url = join_url(&self.ostree_url, &object_path);
        let payload = http_get(&url, Some(token), None)?;
        verify_payload(req.target, &payload, req.sha256, None)?;

        let file_name = format!("{}-{}.commit", req.name, req.version);
        std::fs::write(req.images_dir.join(file_name), payload)?;
        Ok(())
    }

    fn fetch_binary_artifact(
        &self,
        req: &BinaryFetchRequest<'_>,
        token: &AccessToken,
    ) -> Result<(), LockboxError> {
        self.fetch_verified_blob(req, token)
    }

    fn fetch_compose_artifact(
        &self,
        req: &ComposeFetchRequest<'_>,
        token: &AccessToken,
    ) -> Result<(), LockboxError> {
        self.fetch_verified_blob(&req.binary, token)?;

        let compose_raw = std::fs::read(req.binary.images_dir.join(req.binary.target))?;
        let compose = String::from_utf8_lossy(&compose_raw);
        for image in compose_image_refs(&compose)? {
            fetch_image_manifests(
                &image,
                req.platforms,
                req.registry_auth,
                req.metadata_dir,
            )?;
        }
        Ok(())
    }
}

/// Extract `image:` references from a canonical compose file.
fn compose_image_refs(compose: &str) -> Result<Vec<String>, LockboxError> {
    let re = regex::Regex::new(r##"(?m)^\s*image:\s*['"]?([^\s'"]+)"##)
        .map_err(|e| LockboxError::Protocol(format!("Invalid image pattern: {}", e)))?;
    Ok(re
        .captures_iter(compose)
        .map(|c| c[1].to_string())
        .collect())
}

/// One side of an `image:` reference, split into registry, repository and
/// reference (tag or digest).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageRef {
    registry: String,
    repository: String,
    reference: String,
}

fn parse_image_ref(image: &str) -> ImageRef {
    // Split off a digest first; it wins over a tag.
    let (name, reference) = if let Some((name, digest)) = image.split_once('@') {
        (name, digest.to_string())
    } else {
        // A colon after the last slash is a tag separator; earlier colons
        // belong to a registry host:port.
        let slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
        match image[slash..].rfind(':') {
            Some(i) => (&image[..slash + i], image[slash + i + 1..].to_string()),
            None => (image, "latest".to_string()),
        }
    };

    let (registry, mut repository) = match name.split_once('/') {
        // A first component with a dot, colon or "localhost" is a host.
        Some((host, rest))
            if host.contains('.') || host.contains(':') || host == "localhost" =>
        {
            (host.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };
    if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        repository = format!("library/{}", repository);
    }

    ImageRef {
        registry,
        repository,
        reference,
    }
}

fn sanitize_for_file_name(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn registry_auth_header(registry: &str, logins: &[RegistryAuth]) -> Option<String> {
    let login = logins.iter().find(|l| match &l.registry {
        Some(host) => host == registry,
        None => registry == DEFAULT_REGISTRY,
    })?;
    let raw = format!("{}:{}", login.username, login.password);
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, raw);
    Some(format!("Basic {}", encoded))
}

fn registry_get(
    registry: &str,
    path: &str,
    logins: &[RegistryAuth],
) -> Result<Vec<u8>, LockboxError> {
    let url = format!("https://{}/v2/{}", registry, path);
    let mut request = ureq::get(&url).header("Accept", MANIFEST_ACCEPT);
    if let Some(auth) = registry_auth_header(registry, logins) {
        request = request.header("Authorization", &auth);
    }
    let response = request
        .call()
        .map_err(|e| LockboxError::Transport(format!("GET {} failed: {}", url, e)))?;
    let mut body = Vec::new();
    response
        .into_body()
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| LockboxError::Transport(format!("Failed to read body of {}: {}", url, e)))?;
    Ok(body)
}

#[derive(Debug, serde::Deserialize)]
struct ManifestList {
    #[serde(default)]
    manifests: Vec<ManifestEntry>,
}

#[derive(Debug, serde::Deserialize)]
struct ManifestEntry {
    digest: String,
    #[serde(default)]
    platform: Option<ManifestPlatform>,
}

#[derive(Debug, serde::Deserialize)]
struct ManifestPlatform {
    os: String,
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
}

impl ManifestPlatform {
    fn matches(&self, requested: &str) -> bool {
        let full = match &self.variant {
            Some(variant) => format!("{}/{}/{}", self.os, self.architecture, variant),
            None => format!("{}/{}", self.os, self.architecture),
        };
        full == requested
    }
}

/// Fetch the manifests of one image for the requested platforms and write
/// them into the container-metadata store.
fn fetch_image_manifests(
    image: &str,
    platforms: &[String],
    logins: &[RegistryAuth],
    metadata_dir: &Path,
) -> Result<(), LockboxError> {
    let image_ref = parse_image_ref(image);
    log::info!(
        "Fetching manifests for image '{}' ({} platforms)",
        image,
        platforms.len()
    );

    let top_path = format!("{}/manifests/{}", image_ref.repository, image_ref.reference);
    let top = registry_get(&image_ref.registry, &top_path, logins)?;
    let list: ManifestList = serde_json::from_slice(&top)?;

    if list.manifests.is_empty() {
        // Single-platform image: the top document is the manifest itself.
        let file = format!("{}.json", sanitize_for_file_name(image));
        std::fs::write(metadata_dir.join(file), top)?;
        return Ok(());
    }

    for platform in platforms {
        let entry = list.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .map(|p| p.matches(platform))
                .unwrap_or(false)
        });
        let entry = match entry {
            Some(entry) => entry,
            None => {
                log::debug!("Image '{}' has no manifest for platform '{}'", image, platform);
                continue;
            }
        };
        let path = format!("{}/manifests/{}", image_ref.repository, entry.digest);
        let manifest = registry_get(&image_ref.registry, &path, logins)?;
        let file = format!(
            "{}_{}.json",
            sanitize_for_file_name(image),
            sanitize_for_file_name(platform)
        );
        std::fs::write(metadata_dir.join(file), manifest)?;
    }
    Ok(())
}
