//! External capabilities consumed by the build pipeline
//!
//! The orchestrator never speaks a wire protocol itself. Everything that
//! touches a server or the host system sits behind one of these traits:
//!
//! - [`CredentialSource`] - resolve credentials to a bearer token
//! - [`MetadataSource`] - retrieve repository metadata into a store
//! - [`ArtifactFetcher`] - retrieve and verify content artifacts
//! - [`OwnershipFixer`] - post-build permission normalization
//!
//! Each trait ships with at least one concrete implementation usable
//! without a server: file/directory-backed for development and mirrored
//! repositories, recording doubles for tests. HTTP-backed implementations
//! live in [`crate::http`].
//!
//! Contract for fetchers: an implementation must verify the declared hash
//! and length itself before reporting success. The dispatcher never writes
//! an artifact it cannot attribute to a verified descriptor.

use crate::error::LockboxError;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Opaque bearer credential for the update server.
///
/// Resolved once per build and read-only afterwards. The token value is
/// kept out of `Debug` output so it cannot leak into logs.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token value, for building request headers.
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// Login for one container registry.
///
/// Threaded explicitly through the build configuration into compose
/// dispatch; there is no process-wide registry login state.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    /// Registry host; `None` selects the default registry.
    pub registry: Option<String>,
    pub username: String,
    pub password: String,
}

/// Resolves credentials to an access token.
pub trait CredentialSource: Send + Sync {
    fn resolve_access_token(&self) -> Result<AccessToken, LockboxError>;
}

/// Fixed token source for tests and pre-resolved tokens.
#[derive(Debug, Clone)]
pub struct StaticCredentialSource {
    token: String,
}

impl StaticCredentialSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CredentialSource for StaticCredentialSource {
    fn resolve_access_token(&self) -> Result<AccessToken, LockboxError> {
        Ok(AccessToken::new(self.token.clone()))
    }
}

/// Reads a bearer token from a file (first line, trimmed).
///
/// Credential-archive parsing is a separate concern; builds driven from a
/// pre-extracted token file use this source.
#[derive(Debug, Clone)]
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for FileCredentialSource {
    fn resolve_access_token(&self) -> Result<AccessToken, LockboxError> {
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            LockboxError::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to read credentials file '{}': {}",
                    self.path.display(),
                    e
                ),
            ))
        })?;
        let token = data.lines().next().unwrap_or("").trim();
        if token.is_empty() {
            return Err(LockboxError::Configuration(format!(
                "Credentials file '{}' contains no token",
                self.path.display()
            )));
        }
        Ok(AccessToken::new(token))
    }
}

/// Retrieves repository metadata into a local store.
pub trait MetadataSource: Send + Sync {
    /// Fetch director-repository metadata for one lockbox into `dest`.
    fn fetch_director_metadata(
        &self,
        lockbox_name: &str,
        dest: &Path,
        token: &AccessToken,
    ) -> Result<(), LockboxError>;

    /// Fetch image-repository metadata into `dest`.
    fn fetch_image_repo_metadata(
        &self,
        dest: &Path,
        token: &AccessToken,
    ) -> Result<(), LockboxError>;
}

/// Metadata source backed by local directories.
///
/// Copies every `.json` file from a mirrored director / image-repo
/// directory into the lockbox stores. Used for offline mirrors and tests.
#[derive(Debug, Clone)]
pub struct LocalMetadataSource {
    director_dir: PathBuf,
    image_repo_dir: PathBuf,
}

impl LocalMetadataSource {
    pub fn new(director_dir: impl Into<PathBuf>, image_repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            director_dir: director_dir.into(),
            image_repo_dir: image_repo_dir.into(),
        }
    }

    fn copy_json_files(src: &Path, dest: &Path) -> Result<(), LockboxError> {
        let entries = std::fs::read_dir(src).map_err(|e| {
            LockboxError::Transport(format!(
                "Failed to read metadata mirror '{}': {}",
                src.display(),
                e
            ))
        })?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let file_name = entry.file_name();
                std::fs::copy(&path, dest.join(&file_name))?;
            }
        }
        Ok(())
    }
}

impl MetadataSource for LocalMetadataSource {
    fn fetch_director_metadata(
        &self,
        lockbox_name: &str,
        dest: &Path,
        _token: &AccessToken,
    ) -> Result<(), LockboxError> {
        log::debug!(
            "Copying director metadata for lockbox '{}' from '{}'",
            lockbox_name,
            self.director_dir.display()
        );
        Self::copy_json_files(&self.director_dir, dest)
    }

    fn fetch_image_repo_metadata(
        &self,
        dest: &Path,
        _token: &AccessToken,
    ) -> Result<(), LockboxError> {
        Self::copy_json_files(&self.image_repo_dir, dest)
    }
}

/// Parameters of an OSTree commit fetch.
#[derive(Debug, Clone)]
pub struct OstreeFetchRequest<'a> {
    /// Catalog key of the target.
    pub target: &'a str,
    /// Content address of the commit.
    pub sha256: &'a str,
    /// Symbolic package name from the catalog.
    pub name: &'a str,
    /// Package version from the catalog.
    pub version: &'a str,
    /// Artifact store to write into.
    pub images_dir: &'a Path,
}

/// Parameters of a plain binary fetch.
#[derive(Debug, Clone)]
pub struct BinaryFetchRequest<'a> {
    pub target: &'a str,
    pub sha256: &'a str,
    /// Expected byte length; the fetcher must verify it.
    pub length: u64,
    pub name: &'a str,
    pub version: &'a str,
    pub images_dir: &'a Path,
}

/// Parameters of a container-compose fetch.
///
/// Covers the compose artifact itself plus the per-image manifests for the
/// requested platforms.
#[derive(Debug, Clone)]
pub struct ComposeFetchRequest<'a> {
    pub binary: BinaryFetchRequest<'a>,
    /// Platforms to retrieve image manifests for.
    pub platforms: &'a [String],
    /// Registry logins, if any.
    pub registry_auth: &'a [RegistryAuth],
    /// Container-metadata store to write manifests into.
    pub metadata_dir: &'a Path,
}

/// Retrieves content artifacts into the lockbox.
///
/// Implementations verify hash and length before reporting success.
pub trait ArtifactFetcher: Send + Sync {
    fn fetch_ostree_artifact(
        &self,
        req: &OstreeFetchRequest<'_>,
        token: &AccessToken,
    ) -> Result<(), LockboxError>;

    fn fetch_binary_artifact(
        &self,
        req: &BinaryFetchRequest<'_>,
        token: &AccessToken,
    ) -> Result<(), LockboxError>;

    fn fetch_compose_artifact(
        &self,
        req: &ComposeFetchRequest<'_>,
        token: &AccessToken,
    ) -> Result<(), LockboxError>;
}

/// One call observed by [`RecordingArtifactFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    Ostree {
        target: String,
        name: String,
        version: String,
    },
    Binary {
        target: String,
        sha256: String,
        length: u64,
    },
    Compose {
        target: String,
        platforms: Vec<String>,
    },
}

impl FetchEvent {
    /// Catalog key of the fetched target.
    pub fn target(&self) -> &str {
        match self {
            FetchEvent::Ostree { target, .. }
            | FetchEvent::Binary { target, .. }
            | FetchEvent::Compose { target, .. } => target,
        }
    }
}

/// Recording fetcher for tests and dry runs.
///
/// Records every dispatched fetch; optionally writes a marker file per
/// artifact into the store, and can be told to fail on a specific target
/// to exercise rollback paths.
#[derive(Debug, Default)]
pub struct RecordingArtifactFetcher {
    events: Mutex<Vec<FetchEvent>>,
    write_artifacts: bool,
    fail_on_target: Option<String>,
}

impl RecordingArtifactFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an empty artifact file per successful fetch.
    pub fn writing_artifacts() -> Self {
        Self {
            write_artifacts: true,
            ..Self::default()
        }
    }

    /// Fail with a transport error when the given catalog key is fetched.
    pub fn failing_on(mut self, target: impl Into<String>) -> Self {
        self.fail_on_target = Some(target.into());
        self
    }

    /// Snapshot of the calls observed so far.
    pub fn events(&self) -> Vec<FetchEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn record(
        &self,
        target: &str,
        dir: &Path,
        file_name: &str,
        event: FetchEvent,
    ) -> Result<(), LockboxError> {
        if self.fail_on_target.as_deref() == Some(target) {
            return Err(LockboxError::Transport(format!(
                "Injected fetch failure for target '{}'",
                target
            )));
        }
        if self.write_artifacts {
            std::fs::write(dir.join(file_name), b"")?;
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        Ok(())
    }
}

impl ArtifactFetcher for RecordingArtifactFetcher {
    fn fetch_ostree_artifact(
        &self,
        req: &OstreeFetchRequest<'_>,
        _token: &AccessToken,
    ) -> Result<(), LockboxError> {
        self.record(
            req.target,
            req.images_dir,
            req.target,
            FetchEvent::Ostree {
                target: req.target.to_string(),
                name: req.name.to_string(),
                version: req.version.to_string(),
            },
        )
    }

    fn fetch_binary_artifact(
        &self,
        req: &BinaryFetchRequest<'_>,
        _token: &AccessToken,
    ) -> Result<(), LockboxError> {
        self.record(
            req.target,
            req.images_dir,
            req.target,
            FetchEvent::Binary {
                target: req.target.to_string(),
                sha256: req.sha256.to_string(),
                length: req.length,
            },
        )
    }

    fn fetch_compose_artifact(
        &self,
        req: &ComposeFetchRequest<'_>,
        _token: &AccessToken,
    ) -> Result<(), LockboxError> {
        self.record(
            req.binary.target,
            req.binary.images_dir,
            req.binary.target,
            FetchEvent::Compose {
                target: req.binary.target.to_string(),
                platforms: req.platforms.to_vec(),
            },
        )
    }
}

/// Fetcher for metadata-only builds.
///
/// The orchestrator never dispatches a fetch when target fetching is
/// disabled; if one arrives anyway it is a state error, not a silent no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledArtifactFetcher;

impl DisabledArtifactFetcher {
    fn rejected(target: &str) -> LockboxError {
        LockboxError::State(format!(
            "Target fetching is disabled; refusing to fetch '{}'",
            target
        ))
    }
}

impl ArtifactFetcher for DisabledArtifactFetcher {
    fn fetch_ostree_artifact(
        &self,
        req: &OstreeFetchRequest<'_>,
        _token: &AccessToken,
    ) -> Result<(), LockboxError> {
        Err(Self::rejected(req.target))
    }

    fn fetch_binary_artifact(
        &self,
        req: &BinaryFetchRequest<'_>,
        _token: &AccessToken,
    ) -> Result<(), LockboxError> {
        Err(Self::rejected(req.target))
    }

    fn fetch_compose_artifact(
        &self,
        req: &ComposeFetchRequest<'_>,
        _token: &AccessToken,
    ) -> Result<(), LockboxError> {
        Err(Self::rejected(req.binary.target))
    }
}

/// Normalizes ownership of the finished output tree.
pub trait OwnershipFixer: Send + Sync {
    fn set_ownership(&self, path: &Path, recursive: bool) -> Result<(), LockboxError>;
}

/// Ownership fixer that leaves the tree as created.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpOwnershipFixer;

impl OwnershipFixer for NoOpOwnershipFixer {
    fn set_ownership(&self, _path: &Path, _recursive: bool) -> Result<(), LockboxError> {
        Ok(())
    }
}

/// Chown-based ownership fixer for builds running as root.
///
/// Lockboxes are typically built inside a privileged container and then
/// copied to removable media by an unprivileged user; this hands the whole
/// tree to that user.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct ChownOwnershipFixer {
    uid: u32,
    gid: u32,
}

#[cfg(unix)]
impl ChownOwnershipFixer {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    fn chown_tree(&self, path: &Path, recursive: bool) -> Result<(), LockboxError> {
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid))?;
        if recursive && path.is_dir() {
            for entry in std::fs::read_dir(path)? {
                self.chown_tree(&entry?.path(), true)?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
impl OwnershipFixer for ChownOwnershipFixer {
    fn set_ownership(&self, path: &Path, recursive: bool) -> Result<(), LockboxError> {
        log::debug!(
            "Setting ownership of '{}' to {}:{}",
            path.display(),
            self.uid,
            self.gid
        );
        self.chown_tree(path, recursive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_debug_is_redacted() {
        let token = AccessToken::new("super-secret");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("super-secret"));
        assert_eq!(token.reveal(), "super-secret");
    }

    #[test]
    fn test_static_credential_source() {
        let source = StaticCredentialSource::new("tok");
        assert_eq!(source.resolve_access_token().unwrap().reveal(), "tok");
    }

    #[test]
    fn test_file_credential_source() {
        let dir = std::env::temp_dir().join("lockbox-cred-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token");
        std::fs::write(&path, "  bearer-token-value  \nrest ignored\n").unwrap();

        let source = FileCredentialSource::new(&path);
        assert_eq!(
            source.resolve_access_token().unwrap().reveal(),
            "bearer-token-value"
        );

        std::fs::write(&path, "\n").unwrap();
        assert!(matches!(
            source.resolve_access_token(),
            Err(LockboxError::Configuration(_))
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_local_metadata_source_copies_json_only() {
        let base = std::env::temp_dir().join("lockbox-local-meta-test");
        let mirror = base.join("mirror");
        let dest = base.join("dest");
        std::fs::create_dir_all(&mirror).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(mirror.join("targets.json"), "{}").unwrap();
        std::fs::write(mirror.join("notes.txt"), "skip me").unwrap();

        let source = LocalMetadataSource::new(&mirror, &mirror);
        let token = AccessToken::new("t");
        source
            .fetch_director_metadata("some-lockbox", &dest, &token)
            .unwrap();

        assert!(dest.join("targets.json").exists());
        assert!(!dest.join("notes.txt").exists());

        std::fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn test_local_metadata_source_missing_mirror() {
        let base = std::env::temp_dir().join("lockbox-local-meta-missing");
        let source = LocalMetadataSource::new(base.join("nope"), base.join("nope"));
        let token = AccessToken::new("t");
        let res = source.fetch_image_repo_metadata(&base, &token);
        assert!(matches!(res, Err(LockboxError::Transport(_))));
    }

    #[test]
    fn test_disabled_fetcher_rejects_every_dispatch() {
        let fetcher = DisabledArtifactFetcher;
        let token = AccessToken::new("t");
        let dir = Path::new("/nonexistent");

        let err = fetcher
            .fetch_ostree_artifact(
                &OstreeFetchRequest {
                    target: "base-image-1.0",
                    sha256: "aa",
                    name: "base-image",
                    version: "1.0",
                    images_dir: dir,
                },
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, LockboxError::State(_)));

        let err = fetcher
            .fetch_binary_artifact(
                &BinaryFetchRequest {
                    target: "raw-blob-0.5",
                    sha256: "bb",
                    length: 1,
                    name: "raw-blob",
                    version: "0.5",
                    images_dir: dir,
                },
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, LockboxError::State(_)));
    }

    #[test]
    fn test_recording_fetcher_records_and_fails_on_demand() {
        let dir = std::env::temp_dir().join("lockbox-recording-fetcher-test");
        std::fs::create_dir_all(&dir).unwrap();

        let fetcher = RecordingArtifactFetcher::writing_artifacts().failing_on("bad-target");
        let token = AccessToken::new("t");

        fetcher
            .fetch_ostree_artifact(
                &OstreeFetchRequest {
                    target: "good-target",
                    sha256: "aa",
                    name: "base",
                    version: "1.0",
                    images_dir: &dir,
                },
                &token,
            )
            .unwrap();
        assert!(dir.join("good-target").exists());

        let err = fetcher
            .fetch_binary_artifact(
                &BinaryFetchRequest {
                    target: "bad-target",
                    sha256: "bb",
                    length: 1,
                    name: "app",
                    version: "2.0",
                    images_dir: &dir,
                },
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, LockboxError::Transport(_)));

        let events = fetcher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target(), "good-target");

        std::fs::remove_dir_all(&dir).ok();
    }
}
