//! Strongly-typed Uptane metadata documents
//!
//! The lockbox build consumes three document kinds:
//!
//! - **Offline-update targets** (`_type: "Offline-Updates"`, director
//!   repository): the artifacts one lockbox should carry, each with a
//!   SHA-256 hash and byte length.
//! - **Offline snapshot** (`_type: "Offline-Snapshot"`, director
//!   repository): vouches for the version and length of the targets
//!   document, blocking rollback and mix-and-match attacks.
//! - **Image-repository targets** (`targets.json`): the catalog of all
//!   published artifacts with their canonical identity and format.
//!
//! Documents arrive as JSON envelopes `{"signatures": [...], "signed": {...}}`.
//! Signature-envelope verification happens upstream; this module only parses
//! the signed body once into closed types and records the raw byte size and
//! digest that the consistency checks need.

use crate::error::LockboxError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Type tag of offline-update targets metadata.
pub const OFFLINE_TARGETS_TYPE: &str = "Offline-Updates";

/// Type tag of offline-update snapshot metadata.
pub const OFFLINE_SNAPSHOT_TYPE: &str = "Offline-Snapshot";

/// File name of the snapshot document inside the director store.
pub const OFFLINE_SNAPSHOT_FILE: &str = "offline-snapshot.json";

/// File name of the image-repository catalog inside its store.
pub const IMAGE_REPO_TARGETS_FILE: &str = "targets.json";

/// Hardware id marking a binary target as a container-compose bundle.
pub const DOCKER_COMPOSE_HWID: &str = "docker-compose";

const JSON_EXT: &str = ".json";

/// A parsed metadata document together with the facts about its raw form
/// that cross-document validation needs.
#[derive(Debug, Clone)]
pub struct MetadataDocument<T> {
    /// Where the document was read from.
    pub path: PathBuf,

    /// Byte size of the raw file.
    pub size: u64,

    /// SHA-256 of the raw file, hex-encoded.
    ///
    /// Recorded for diagnostics only. The snapshot's hash entry refers to
    /// the canonical JSON form, which generally differs from the raw file,
    /// so no hash cross-check is performed (see [`crate::validate`]).
    pub sha256: String,

    /// The parsed signed body.
    pub signed: T,
}

impl<T> MetadataDocument<T> {
    /// Base file name of the source document.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct SignedEnvelope<T> {
    signed: T,
}

/// Signed body of offline-update targets metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineTargetsBody {
    /// Declared type tag; must equal [`OFFLINE_TARGETS_TYPE`].
    #[serde(rename = "_type")]
    pub doc_type: String,

    /// Expiry timestamp (RFC 3339).
    pub expires: String,

    /// Document version, cross-checked against the snapshot.
    pub version: u64,

    /// Target name to content descriptor.
    pub targets: BTreeMap<String, TargetDescriptor>,
}

/// Content identity of one offline-update target.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetDescriptor {
    pub hashes: TargetHashes,
    pub length: u64,
}

/// Hash set of a target; only SHA-256 is consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetHashes {
    pub sha256: String,
}

/// Signed body of offline-update snapshot metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineSnapshotBody {
    /// Declared type tag; must equal [`OFFLINE_SNAPSHOT_TYPE`].
    #[serde(rename = "_type")]
    pub doc_type: String,

    /// Expiry timestamp (RFC 3339).
    pub expires: String,

    /// Snapshot version.
    pub version: u64,

    /// File name to recorded length/version of every vouched document.
    pub meta: BTreeMap<String, SnapshotFileInfo>,
}

/// What the snapshot records about one referenced metadata file.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotFileInfo {
    pub length: u64,
    pub version: u64,

    /// Hash of the canonical JSON form; not cross-checked against raw files.
    #[serde(default)]
    pub hashes: Option<TargetHashes>,
}

/// Signed body of the image-repository target catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageRepoTargetsBody {
    #[serde(rename = "_type")]
    pub doc_type: String,

    pub expires: String,

    pub version: u64,

    /// Catalog name to descriptor.
    pub targets: BTreeMap<String, ImageRepoTargetDescriptor>,
}

/// Catalog entry for one published artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageRepoTargetDescriptor {
    pub hashes: TargetHashes,
    pub length: u64,
    pub custom: TargetCustom,
}

/// Server-side annotations on a catalog entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetCustom {
    /// Declared artifact format.
    #[serde(rename = "targetFormat")]
    pub target_format: TargetFormat,

    /// Symbolic package name.
    pub name: String,

    /// Package version string.
    pub version: String,

    /// Device classes this target is compatible with.
    #[serde(rename = "hardwareIds", default)]
    pub hardware_ids: Vec<String>,
}

/// Closed enumeration of artifact formats the pipeline can dispatch.
///
/// A tag the catalog declares but this pipeline does not understand is
/// preserved as [`TargetFormat::Unknown`] at parse time and rejected with a
/// protocol error at dispatch, so catalog drift is reported by name instead
/// of failing an assertion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum TargetFormat {
    /// OSTree filesystem commit, fetched by content address.
    #[serde(rename = "OSTREE")]
    Ostree,

    /// Opaque binary blob, verified by hash and length.
    #[serde(rename = "BINARY")]
    Binary,

    /// Format tag this pipeline does not know how to handle.
    #[serde(untagged)]
    Unknown(String),
}

impl TargetCustom {
    /// Whether this target is a container-compose bundle.
    pub fn is_compose(&self) -> bool {
        self.hardware_ids.iter().any(|h| h == DOCKER_COMPOSE_HWID)
    }
}

/// Load and parse one signed metadata document, recording the raw size and
/// digest of the file alongside the parsed body.
pub fn load_metadata_document<T>(path: &Path) -> Result<MetadataDocument<T>, LockboxError>
where
    T: serde::de::DeserializeOwned,
{
    let raw = std::fs::read(path).map_err(|e| {
        LockboxError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read metadata file '{}': {}", path.display(), e),
        ))
    })?;
    let envelope: SignedEnvelope<T> = serde_json::from_slice(&raw)?;
    let digest = hmac_sha256::Hash::hash(&raw);

    Ok(MetadataDocument {
        path: path.to_path_buf(),
        size: raw.len() as u64,
        sha256: hex::encode(digest),
        signed: envelope.signed,
    })
}

/// Load the offline-update targets and snapshot documents for a lockbox.
///
/// `lockbox_name` may carry a `.json` suffix (the name of a local metadata
/// file); only the base name selects the targets document. The snapshot is
/// always read from [`OFFLINE_SNAPSHOT_FILE`] in the same directory.
pub fn load_offline_metadata(
    lockbox_name: &str,
    source_dir: &Path,
) -> Result<
    (
        MetadataDocument<OfflineTargetsBody>,
        MetadataDocument<OfflineSnapshotBody>,
    ),
    LockboxError,
> {
    let base_name = match lockbox_name.strip_suffix(JSON_EXT) {
        Some(stripped) => Path::new(stripped)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                LockboxError::Configuration(format!("Invalid lockbox name '{}'", lockbox_name))
            })?,
        None => lockbox_name,
    };
    let targets_file = source_dir.join(format!("{}{}", base_name, JSON_EXT));

    log::info!(
        "Loading offline-update targets metadata from '{}'",
        targets_file.display()
    );
    let targets = load_metadata_document(&targets_file)?;

    let snapshot_file = source_dir.join(OFFLINE_SNAPSHOT_FILE);
    log::info!(
        "Loading offline-update snapshot metadata from '{}'",
        snapshot_file.display()
    );
    let snapshot = load_metadata_document(&snapshot_file)?;

    Ok((targets, snapshot))
}

/// Load the image-repository target catalog from its metadata store.
pub fn load_image_repo_targets(
    source_dir: &Path,
) -> Result<MetadataDocument<ImageRepoTargetsBody>, LockboxError> {
    load_metadata_document(&source_dir.join(IMAGE_REPO_TARGETS_FILE))
}

/// Find the unique catalog entry matching an offline-update target.
///
/// A catalog entry matches when its SHA-256 and length are equal and its
/// name is comparable: either the catalog key or the custom package name
/// equals the offline-update target name. Returns `Ok(None)` when nothing
/// matches; more than one match is a data error, never a silent pick.
pub fn find_catalog_entry<'a>(
    catalog: &'a ImageRepoTargetsBody,
    sha256: &str,
    name: &str,
    length: u64,
) -> Result<Option<(&'a str, &'a ImageRepoTargetDescriptor)>, LockboxError> {
    let mut matches = catalog.targets.iter().filter(|(key, desc)| {
        desc.hashes.sha256 == sha256
            && desc.length == length
            && (key.as_str() == name || desc.custom.name == name)
    });

    let first = matches.next();
    if matches.next().is_some() {
        return Err(LockboxError::Data(format!(
            "Target '{}' matches more than one image-repo catalog entry",
            name
        )));
    }
    Ok(first.map(|(key, desc)| (key.as_str(), desc)))
}
