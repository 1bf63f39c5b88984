//! Transactional lockbox build orchestration
//!
//! A build walks a fixed pipeline: prepare the output tree, fetch director
//! and image-repository metadata, validate the offline-update documents,
//! resolve and fetch every target, normalize ownership. The tree is atomic
//! from the caller's point of view: after the call returns it is either
//! fully present and populated, or absent.
//!
//! Atomicity is enforced by [`LockboxBuildContext`], a guard armed when the
//! output tree is created and disarmed only after the finalize step. Every
//! failing exit path, including panics unwinding through the builder, drops
//! the armed guard and removes the tree.

use crate::error::LockboxError;
use crate::metadata::{load_image_repo_targets, load_offline_metadata};
use crate::remote::{
    ArtifactFetcher, CredentialSource, MetadataSource, NoOpOwnershipFixer, OwnershipFixer,
    RegistryAuth,
};
use crate::resolve::{fetch_offline_targets, DispatchContext};
use crate::time::{SystemTimeSource, TimeSource};
use crate::validate::validate_offline_metadata;
use std::path::{Path, PathBuf};

/// Artifact store inside the lockbox.
pub const IMAGES_DIR: &str = "images";

/// Director-metadata store inside the lockbox.
pub const DIRECTOR_DIR: &str = "metadata/director";

/// Image-repository metadata store inside the lockbox.
pub const IMAGE_REPO_DIR: &str = "metadata/image-repo";

/// Container-metadata store inside the lockbox.
pub const DOCKER_METADATA_DIR: &str = "metadata/docker";

/// Default output directory name.
pub const DEFAULT_OUTPUT_DIR: &str = "update";

/// Default platform filter for compose targets.
pub const DEFAULT_PLATFORMS: &[&str] = &["linux/arm/v7", "linux/arm64"];

/// Build options for one lockbox.
#[derive(Debug, Clone)]
pub struct LockboxConfig {
    /// Remove a pre-existing output tree instead of aborting.
    pub force: bool,

    /// Run the metadata consistency validator (see [`crate::validate`]).
    pub validate: bool,

    /// Fetch content artifacts; when false the lockbox carries metadata only.
    pub fetch_targets: bool,

    /// Platform filter for compose targets.
    pub platforms: Vec<String>,

    /// Registry logins for compose targets.
    pub registry_auth: Vec<RegistryAuth>,
}

impl Default for LockboxConfig {
    fn default() -> Self {
        Self {
            force: false,
            validate: true,
            fetch_targets: true,
            platforms: DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect(),
            registry_auth: Vec::new(),
        }
    }
}

impl LockboxConfig {
    fn check(&self) -> Result<(), LockboxError> {
        if self.platforms.is_empty() {
            return Err(LockboxError::Configuration(
                "Platform filter must name at least one platform".to_string(),
            ));
        }
        if self.registry_auth.iter().any(|a| a.username.is_empty()) {
            return Err(LockboxError::Configuration(
                "Registry login with empty username".to_string(),
            ));
        }
        Ok(())
    }
}

/// The output tree of an in-flight build.
///
/// Created in the directory-preparation step; owns the root path until
/// [`commit`](Self::commit) disarms it. Dropping an armed context removes
/// the whole tree, which is what turns any error or panic between creation
/// and finalize into a clean rollback.
#[derive(Debug)]
pub struct LockboxBuildContext {
    root: PathBuf,
    armed: bool,
}

impl LockboxBuildContext {
    /// Create the output root and its four stores.
    ///
    /// A pre-existing root is a state error unless `force` is set, in which
    /// case the old tree is removed first. The state check happens before
    /// anything is touched on disk.
    pub fn create(root: &Path, force: bool) -> Result<Self, LockboxError> {
        if root.exists() {
            if force {
                log::debug!("Removing existing output directory '{}'", root.display());
                std::fs::remove_dir_all(root)?;
            } else {
                return Err(LockboxError::State(format!(
                    "Output directory '{}' already exists; please remove it or select \
                     another output directory",
                    root.display()
                )));
            }
        }

        std::fs::create_dir_all(root)?;
        let context = Self {
            root: root.to_path_buf(),
            armed: true,
        };
        // From here on, any failure rolls the tree back through Drop.
        std::fs::create_dir_all(context.images_dir())?;
        std::fs::create_dir_all(context.director_dir())?;
        std::fs::create_dir_all(context.image_repo_dir())?;
        std::fs::create_dir_all(context.docker_metadata_dir())?;
        Ok(context)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    pub fn director_dir(&self) -> PathBuf {
        self.root.join(DIRECTOR_DIR)
    }

    pub fn image_repo_dir(&self) -> PathBuf {
        self.root.join(IMAGE_REPO_DIR)
    }

    pub fn docker_metadata_dir(&self) -> PathBuf {
        self.root.join(DOCKER_METADATA_DIR)
    }

    /// Disarm the rollback guard and hand the finished tree to the caller.
    pub fn commit(mut self) -> PathBuf {
        self.armed = false;
        self.root.clone()
    }
}

impl Drop for LockboxBuildContext {
    fn drop(&mut self) {
        if self.armed && self.root.exists() {
            log::info!(
                "Removing output directory '{}' due to errors",
                self.root.display()
            );
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                // Nothing more we can do while unwinding; leave a trace.
                log::error!(
                    "Rollback of '{}' failed: {}; partial output may remain",
                    self.root.display(),
                    e
                );
            }
        }
    }
}

/// Orchestrates one lockbox build over pluggable external capabilities.
pub struct LockboxBuilder<'a> {
    config: LockboxConfig,
    credentials: &'a dyn CredentialSource,
    metadata_source: &'a dyn MetadataSource,
    fetcher: &'a dyn ArtifactFetcher,
    ownership: &'a dyn OwnershipFixer,
    clock: &'a dyn TimeSource,
}

const DEFAULT_OWNERSHIP: NoOpOwnershipFixer = NoOpOwnershipFixer;
const DEFAULT_CLOCK: SystemTimeSource = SystemTimeSource;

impl<'a> LockboxBuilder<'a> {
    pub fn new(
        config: LockboxConfig,
        credentials: &'a dyn CredentialSource,
        metadata_source: &'a dyn MetadataSource,
        fetcher: &'a dyn ArtifactFetcher,
    ) -> Self {
        Self {
            config,
            credentials,
            metadata_source,
            fetcher,
            ownership: &DEFAULT_OWNERSHIP,
            clock: &DEFAULT_CLOCK,
        }
    }

    /// Use a specific ownership fixer for the finalize step.
    pub fn with_ownership_fixer(mut self, ownership: &'a dyn OwnershipFixer) -> Self {
        self.ownership = ownership;
        self
    }

    /// Use a specific clock for expiry validation.
    pub fn with_clock(mut self, clock: &'a dyn TimeSource) -> Self {
        self.clock = clock;
        self
    }

    /// Build the lockbox `lockbox_name` into `output_dir`.
    ///
    /// On success the populated tree is retained and its root returned. On
    /// any failure the tree is removed before the error propagates.
    pub fn build(&self, lockbox_name: &str, output_dir: &Path) -> Result<PathBuf, LockboxError> {
        self.config.check()?;

        let context = LockboxBuildContext::create(output_dir, self.config.force)?;

        let token = self.credentials.resolve_access_token()?;

        log::info!("=>> Handle director-repository metadata");
        self.metadata_source
            .fetch_director_metadata(lockbox_name, &context.director_dir(), &token)?;

        log::info!("=>> Handle image-repository metadata");
        self.metadata_source
            .fetch_image_repo_metadata(&context.image_repo_dir(), &token)?;

        log::info!("=>> Process metadata");
        let (offline_targets, offline_snapshot) =
            load_offline_metadata(lockbox_name, &context.director_dir())?;
        if self.config.validate {
            validate_offline_metadata(&offline_targets, &offline_snapshot, self.clock)?;
        } else {
            log::warn!("Skipping offline-update metadata validation");
        }

        let catalog = load_image_repo_targets(&context.image_repo_dir())?;

        if self.config.fetch_targets {
            log::info!("=>> Handle Uptane targets");
            let images_dir = context.images_dir();
            let docker_metadata_dir = context.docker_metadata_dir();
            let dispatch = DispatchContext {
                images_dir: &images_dir,
                docker_metadata_dir: &docker_metadata_dir,
                platforms: &self.config.platforms,
                registry_auth: &self.config.registry_auth,
            };
            fetch_offline_targets(
                &offline_targets.signed,
                &catalog.signed,
                &dispatch,
                self.fetcher,
                &token,
            )?;
        } else {
            log::info!("=>> Handle Uptane targets [skipped]");
        }

        self.ownership.set_ownership(context.root(), true)?;

        Ok(context.commit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::OFFLINE_SNAPSHOT_FILE;
    use crate::remote::{LocalMetadataSource, RecordingArtifactFetcher, StaticCredentialSource};
    use crate::time::FixedTimeSource;

    // 2024-01-01T00:00:00Z
    const NOW: u64 = 1704067200;
    const LOCKBOX: &str = "factory-lockbox";

    struct Fixture {
        base: PathBuf,
        mirror_director: PathBuf,
        mirror_image_repo: PathBuf,
        output: PathBuf,
    }

    impl Fixture {
        /// Lay out a metadata mirror with consistent targets/snapshot
        /// documents: two OSTree targets and one compose target.
        fn new(tag: &str) -> Self {
            let base = std::env::temp_dir().join(format!("lockbox-build-test-{}", tag));
            std::fs::remove_dir_all(&base).ok();
            let mirror_director = base.join("mirror/director");
            let mirror_image_repo = base.join("mirror/image-repo");
            std::fs::create_dir_all(&mirror_director).unwrap();
            std::fs::create_dir_all(&mirror_image_repo).unwrap();

            let fixture = Self {
                output: base.join(DEFAULT_OUTPUT_DIR),
                base,
                mirror_director,
                mirror_image_repo,
            };
            fixture.write_targets_and_snapshot("2038-01-01T00:00:00Z", "2038-01-01T00:00:00Z");
            fixture.write_catalog();
            fixture
        }

        fn write_targets_and_snapshot(&self, targets_expires: &str, snapshot_expires: &str) {
            let targets = serde_json::json!({
                "signatures": [],
                "signed": {
                    "_type": "Offline-Updates",
                    "expires": targets_expires,
                    "version": 3,
                    "targets": {
                        "base-image-1.0": {"hashes": {"sha256": "aa11"}, "length": 4096},
                        "kernel-image-5.4": {"hashes": {"sha256": "ee55"}, "length": 2048},
                        "app-compose-2.3": {"hashes": {"sha256": "cc33"}, "length": 512}
                    }
                }
            });
            let targets_raw = serde_json::to_vec(&targets).unwrap();

            let mut snapshot = serde_json::json!({
                "signatures": [],
                "signed": {
                    "_type": "Offline-Snapshot",
                    "expires": snapshot_expires,
                    "version": 3,
                    "meta": {}
                }
            });
            snapshot["signed"]["meta"][format!("{}.json", LOCKBOX)] = serde_json::json!({
                "length": targets_raw.len(),
                "version": 3,
                "hashes": {"sha256": "00".repeat(32)}
            });

            std::fs::write(
                self.mirror_director.join(format!("{}.json", LOCKBOX)),
                &targets_raw,
            )
            .unwrap();
            std::fs::write(
                self.mirror_director.join(OFFLINE_SNAPSHOT_FILE),
                serde_json::to_vec(&snapshot).unwrap(),
            )
            .unwrap();
        }

        fn write_catalog(&self) {
            let catalog = serde_json::json!({
                "signatures": [],
                "signed": {
                    "_type": "Targets",
                    "expires": "2038-01-01T00:00:00Z",
                    "version": 9,
                    "targets": {
                        "base-image-1.0": {
                            "hashes": {"sha256": "aa11"},
                            "length": 4096,
                            "custom": {
                                "targetFormat": "OSTREE",
                                "name": "base-image",
                                "version": "1.0",
                                "hardwareIds": ["apalis-imx6"]
                            }
                        },
                        "kernel-image-5.4": {
                            "hashes": {"sha256": "ee55"},
                            "length": 2048,
                            "custom": {
                                "targetFormat": "OSTREE",
                                "name": "kernel-image",
                                "version": "5.4",
                                "hardwareIds": ["apalis-imx6"]
                            }
                        },
                        "app-compose-2.3": {
                            "hashes": {"sha256": "cc33"},
                            "length": 512,
                            "custom": {
                                "targetFormat": "BINARY",
                                "name": "app-compose",
                                "version": "2.3",
                                "hardwareIds": ["docker-compose"]
                            }
                        }
                    }
                }
            });
            std::fs::write(
                self.mirror_image_repo.join("targets.json"),
                serde_json::to_vec(&catalog).unwrap(),
            )
            .unwrap();
        }

        fn metadata_source(&self) -> LocalMetadataSource {
            LocalMetadataSource::new(&self.mirror_director, &self.mirror_image_repo)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.base).ok();
        }
    }

    fn run_build(
        fixture: &Fixture,
        config: LockboxConfig,
        fetcher: &RecordingArtifactFetcher,
    ) -> Result<PathBuf, LockboxError> {
        let credentials = StaticCredentialSource::new("token");
        let source = fixture.metadata_source();
        let clock = FixedTimeSource::from_unix_secs(NOW);
        LockboxBuilder::new(config, &credentials, &source, fetcher)
            .with_clock(&clock)
            .build(LOCKBOX, &fixture.output)
    }

    #[test]
    fn test_successful_build_retains_populated_tree() {
        let fixture = Fixture::new("success");
        let fetcher = RecordingArtifactFetcher::writing_artifacts();

        let root = run_build(&fixture, LockboxConfig::default(), &fetcher).unwrap();

        assert_eq!(root, fixture.output);
        assert!(root.join(IMAGES_DIR).is_dir());
        assert!(root.join(DIRECTOR_DIR).join(OFFLINE_SNAPSHOT_FILE).exists());
        assert!(root
            .join(DIRECTOR_DIR)
            .join(format!("{}.json", LOCKBOX))
            .exists());
        assert!(root.join(IMAGE_REPO_DIR).join("targets.json").exists());
        assert!(root.join(DOCKER_METADATA_DIR).is_dir());

        // Three artifacts written, three fetches dispatched.
        assert_eq!(fetcher.events().len(), 3);
        assert_eq!(std::fs::read_dir(root.join(IMAGES_DIR)).unwrap().count(), 3);
    }

    #[test]
    fn test_expired_snapshot_rolls_back() {
        let fixture = Fixture::new("expired");
        fixture.write_targets_and_snapshot("2038-01-01T00:00:00Z", "2023-12-31T00:00:00Z");
        let fetcher = RecordingArtifactFetcher::new();

        let err = run_build(&fixture, LockboxConfig::default(), &fetcher).unwrap_err();
        match err {
            LockboxError::Data(msg) => assert!(msg.contains("already expired")),
            other => panic!("expected DataError, got {:?}", other),
        }
        assert!(!fixture.output.exists());
        assert!(fetcher.events().is_empty());
    }

    #[test]
    fn test_unresolvable_target_rolls_back_after_metadata_fetch() {
        let fixture = Fixture::new("unresolved");
        // Remove one catalog entry so an offline target has no match.
        let catalog_path = fixture.mirror_image_repo.join("targets.json");
        let mut catalog: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&catalog_path).unwrap()).unwrap();
        catalog["signed"]["targets"]
            .as_object_mut()
            .unwrap()
            .remove("kernel-image-5.4");
        std::fs::write(&catalog_path, serde_json::to_vec(&catalog).unwrap()).unwrap();

        let fetcher = RecordingArtifactFetcher::new();
        let err = run_build(&fixture, LockboxConfig::default(), &fetcher).unwrap_err();
        match err {
            LockboxError::NotFound(msg) => assert!(msg.contains("kernel-image-5.4")),
            other => panic!("expected NotFoundError, got {:?}", other),
        }
        // Both metadata phases had completed; the tree is still gone.
        assert!(!fixture.output.exists());
    }

    #[test]
    fn test_mid_fetch_failure_rolls_back_earlier_artifacts() {
        let fixture = Fixture::new("midfail");
        let fetcher = RecordingArtifactFetcher::writing_artifacts().failing_on("base-image-1.0");

        let err = run_build(&fixture, LockboxConfig::default(), &fetcher).unwrap_err();
        assert!(matches!(err, LockboxError::Transport(_)));

        // The compose target sorted before the failing one had already been
        // written; the whole tree is removed anyway.
        assert_eq!(fetcher.events().len(), 1);
        assert!(!fixture.output.exists());
    }

    #[test]
    fn test_existing_output_without_force_aborts_untouched() {
        let fixture = Fixture::new("existing");
        std::fs::create_dir_all(&fixture.output).unwrap();
        std::fs::write(fixture.output.join("keep-me"), b"precious").unwrap();

        let fetcher = RecordingArtifactFetcher::new();
        let err = run_build(&fixture, LockboxConfig::default(), &fetcher).unwrap_err();
        assert!(matches!(err, LockboxError::State(_)));

        // No directory mutation happened: the pre-existing content survives.
        assert!(fixture.output.join("keep-me").exists());
        assert!(fetcher.events().is_empty());
    }

    #[test]
    fn test_force_replaces_existing_output() {
        let fixture = Fixture::new("force");
        std::fs::create_dir_all(&fixture.output).unwrap();
        std::fs::write(fixture.output.join("stale"), b"old").unwrap();

        let fetcher = RecordingArtifactFetcher::writing_artifacts();
        let config = LockboxConfig {
            force: true,
            ..LockboxConfig::default()
        };
        let root = run_build(&fixture, config, &fetcher).unwrap();

        assert!(!root.join("stale").exists());
        assert!(root.join(IMAGES_DIR).is_dir());
    }

    #[test]
    fn test_metadata_only_build_succeeds_with_empty_artifact_store() {
        let fixture = Fixture::new("metadata-only");
        let fetcher = RecordingArtifactFetcher::writing_artifacts();
        let config = LockboxConfig {
            fetch_targets: false,
            ..LockboxConfig::default()
        };

        let root = run_build(&fixture, config, &fetcher).unwrap();

        assert!(fetcher.events().is_empty());
        assert_eq!(std::fs::read_dir(root.join(IMAGES_DIR)).unwrap().count(), 0);
        assert!(root.join(IMAGE_REPO_DIR).join("targets.json").exists());
    }

    #[test]
    fn test_validation_can_be_disabled() {
        let fixture = Fixture::new("no-validate");
        fixture.write_targets_and_snapshot("2020-01-01T00:00:00Z", "2020-01-01T00:00:00Z");
        let fetcher = RecordingArtifactFetcher::writing_artifacts();
        let config = LockboxConfig {
            validate: false,
            ..LockboxConfig::default()
        };

        // Expired documents pass when the validator is disabled.
        run_build(&fixture, config, &fetcher).unwrap();
        assert_eq!(fetcher.events().len(), 3);
    }

    #[test]
    fn test_empty_platform_filter_is_configuration_error() {
        let fixture = Fixture::new("bad-config");
        let fetcher = RecordingArtifactFetcher::new();
        let config = LockboxConfig {
            platforms: Vec::new(),
            ..LockboxConfig::default()
        };

        let err = run_build(&fixture, config, &fetcher).unwrap_err();
        assert!(matches!(err, LockboxError::Configuration(_)));
        assert!(!fixture.output.exists());
    }

    #[test]
    fn test_context_drop_removes_armed_tree() {
        let base = std::env::temp_dir().join("lockbox-ctx-drop-test");
        std::fs::remove_dir_all(&base).ok();
        let root = base.join("out");

        let context = LockboxBuildContext::create(&root, false).unwrap();
        assert!(root.join(IMAGES_DIR).is_dir());
        drop(context);
        assert!(!root.exists());

        std::fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn test_context_commit_keeps_tree() {
        let base = std::env::temp_dir().join("lockbox-ctx-commit-test");
        std::fs::remove_dir_all(&base).ok();
        let root = base.join("out");

        let context = LockboxBuildContext::create(&root, false).unwrap();
        let committed = context.commit();
        assert_eq!(committed, root);
        assert!(root.exists());

        std::fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn test_rollback_survives_panic() {
        let base = std::env::temp_dir().join("lockbox-ctx-panic-test");
        std::fs::remove_dir_all(&base).ok();
        let root = base.join("out");
        let root_clone = root.clone();

        let result = std::panic::catch_unwind(move || {
            let _context = LockboxBuildContext::create(&root_clone, false).unwrap();
            panic!("interrupted");
        });
        assert!(result.is_err());
        assert!(!root.exists());

        std::fs::remove_dir_all(&base).ok();
    }
}
