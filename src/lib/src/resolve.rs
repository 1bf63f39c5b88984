//! Target resolution and format dispatch
//!
//! Every entry in the offline-update targets metadata must correspond to
//! exactly one entry in the image-repository catalog, matched by content:
//! SHA-256, name and byte length. The catalog entry carries the declared
//! format, which selects the fetch capability:
//!
//! - `OSTREE`: content-addressed commit into the artifact store
//! - `BINARY`: hash-and-length verified blob into the artifact store
//! - `BINARY` tagged `docker-compose`: compose artifact plus per-image
//!   manifests for the configured platforms into the container store
//!
//! A target with no catalog match aborts the build; a format tag the
//! pipeline does not recognize is a protocol error, since it means the
//! remote catalog drifted from the expected contract.

use crate::error::LockboxError;
use crate::metadata::{
    find_catalog_entry, ImageRepoTargetDescriptor, ImageRepoTargetsBody, OfflineTargetsBody,
    TargetDescriptor, TargetFormat,
};
use crate::remote::{
    AccessToken, ArtifactFetcher, BinaryFetchRequest, ComposeFetchRequest, OstreeFetchRequest,
    RegistryAuth,
};
use std::path::Path;

/// One offline-update target paired with its unique catalog entry.
#[derive(Debug, Clone)]
pub struct ResolvedTarget<'a> {
    /// Name used by the offline-update targets metadata.
    pub offline_name: &'a str,

    /// Key of the matching catalog entry.
    pub catalog_key: &'a str,

    /// The matching catalog descriptor.
    pub descriptor: &'a ImageRepoTargetDescriptor,
}

/// Resolve one offline-update entry against the catalog.
///
/// Zero matches is fatal; ambiguity is reported by
/// [`find_catalog_entry`] and propagated unchanged.
pub fn resolve_target<'a>(
    catalog: &'a ImageRepoTargetsBody,
    offline_name: &'a str,
    offline_desc: &TargetDescriptor,
) -> Result<ResolvedTarget<'a>, LockboxError> {
    match find_catalog_entry(
        catalog,
        &offline_desc.hashes.sha256,
        offline_name,
        offline_desc.length,
    )? {
        Some((catalog_key, descriptor)) => Ok(ResolvedTarget {
            offline_name,
            catalog_key,
            descriptor,
        }),
        None => Err(LockboxError::NotFound(format!(
            "Could not find target '{}' in image-repo metadata",
            offline_name
        ))),
    }
}

/// Destination stores and dispatch policy for target fetching.
#[derive(Debug, Clone)]
pub struct DispatchContext<'a> {
    /// Artifact store (`images/`).
    pub images_dir: &'a Path,

    /// Container-metadata store (`metadata/docker/`).
    pub docker_metadata_dir: &'a Path,

    /// Platform filter for compose targets.
    pub platforms: &'a [String],

    /// Registry logins for compose targets.
    pub registry_auth: &'a [RegistryAuth],
}

/// Route one resolved target to the fetch capability its format declares.
pub fn dispatch_target(
    resolved: &ResolvedTarget<'_>,
    ctx: &DispatchContext<'_>,
    fetcher: &dyn ArtifactFetcher,
    token: &AccessToken,
) -> Result<(), LockboxError> {
    let desc = resolved.descriptor;
    match &desc.custom.target_format {
        TargetFormat::Ostree => {
            log::info!(
                "Fetching OSTree target '{}' ({} {})",
                resolved.catalog_key,
                desc.custom.name,
                desc.custom.version
            );
            fetcher.fetch_ostree_artifact(
                &OstreeFetchRequest {
                    target: resolved.catalog_key,
                    sha256: &desc.hashes.sha256,
                    name: &desc.custom.name,
                    version: &desc.custom.version,
                    images_dir: ctx.images_dir,
                },
                token,
            )
        }
        TargetFormat::Binary => {
            let binary = BinaryFetchRequest {
                target: resolved.catalog_key,
                sha256: &desc.hashes.sha256,
                length: desc.length,
                name: &desc.custom.name,
                version: &desc.custom.version,
                images_dir: ctx.images_dir,
            };
            if desc.custom.is_compose() {
                log::info!(
                    "Fetching compose target '{}' for platforms {:?}",
                    resolved.catalog_key,
                    ctx.platforms
                );
                fetcher.fetch_compose_artifact(
                    &ComposeFetchRequest {
                        binary,
                        platforms: ctx.platforms,
                        registry_auth: ctx.registry_auth,
                        metadata_dir: ctx.docker_metadata_dir,
                    },
                    token,
                )
            } else {
                log::info!("Fetching binary target '{}'", resolved.catalog_key);
                fetcher.fetch_binary_artifact(&binary, token)
            }
        }
        TargetFormat::Unknown(tag) => Err(LockboxError::Protocol(format!(
            "Do not know how to handle target '{}' of format '{}'",
            resolved.catalog_key, tag
        ))),
    }
}

/// Resolve and fetch every target of the offline-update metadata.
///
/// Targets are processed in name order; the first failure aborts the loop
/// and propagates, leaving rollback to the caller's build context.
pub fn fetch_offline_targets(
    offline_targets: &OfflineTargetsBody,
    catalog: &ImageRepoTargetsBody,
    ctx: &DispatchContext<'_>,
    fetcher: &dyn ArtifactFetcher,
    token: &AccessToken,
) -> Result<(), LockboxError> {
    for (offline_name, offline_desc) in &offline_targets.targets {
        let resolved = resolve_target(catalog, offline_name, offline_desc)?;
        dispatch_target(&resolved, ctx, fetcher, token)?;
    }
    Ok(())
}
