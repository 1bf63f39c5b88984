//! Consistency validation of offline-update metadata
//!
//! The build receives two already signature-verified documents from the
//! director repository: the offline-update targets and the offline snapshot.
//! Before any artifact is fetched, this gate re-checks freshness and
//! cross-document agreement. Checks run fail-fast in a fixed order; the
//! first violation aborts the build, which then rolls the output tree back.
//!
//! The snapshot also records a hash for the targets file, but that hash is
//! computed over the canonical JSON form on the server side and does not
//! reliably match the raw file as transferred. The hash cross-check is
//! deliberately skipped, matching the aktualizr client; length and version
//! are checked instead.

use crate::error::LockboxError;
use crate::metadata::{
    MetadataDocument, OfflineSnapshotBody, OfflineTargetsBody, OFFLINE_SNAPSHOT_TYPE,
    OFFLINE_TARGETS_TYPE,
};
use crate::time::{parse_rfc3339, TimeSource};

fn ensure(cond: bool, message: impl FnOnce() -> String) -> Result<(), LockboxError> {
    if cond {
        Ok(())
    } else {
        Err(LockboxError::Data(message()))
    }
}

/// Validate the offline-update targets metadata against its snapshot.
///
/// Check order: snapshot type tag, snapshot expiry, targets type tag,
/// targets expiry, snapshot lists the targets file, recorded length matches
/// the raw targets file size, recorded version matches the targets version.
/// The first failed check wins; no errors are accumulated.
pub fn validate_offline_metadata(
    targets: &MetadataDocument<OfflineTargetsBody>,
    snapshot: &MetadataDocument<OfflineSnapshotBody>,
    clock: &dyn TimeSource,
) -> Result<(), LockboxError> {
    log::debug!("Validating offline-update metadata");

    let now = clock.now_unix()?;

    ensure(snapshot.signed.doc_type == OFFLINE_SNAPSHOT_TYPE, || {
        format!(
            "_type in snapshot metadata does not equal '{}'",
            OFFLINE_SNAPSHOT_TYPE
        )
    })?;
    ensure(parse_rfc3339(&snapshot.signed.expires)? > now, || {
        "Offline snapshot metadata is already expired".to_string()
    })?;

    ensure(targets.signed.doc_type == OFFLINE_TARGETS_TYPE, || {
        format!(
            "_type in targets metadata does not equal '{}'",
            OFFLINE_TARGETS_TYPE
        )
    })?;
    ensure(parse_rfc3339(&targets.signed.expires)? > now, || {
        "Offline targets metadata is already expired".to_string()
    })?;

    let targets_file = targets.file_name().to_string();
    let recorded = match snapshot.signed.meta.get(&targets_file) {
        Some(info) => info,
        None => {
            return Err(LockboxError::Data(format!(
                "{} is not described in the snapshot metadata",
                targets_file
            )))
        }
    };

    // The canonical-JSON hash in `recorded.hashes` is intentionally not
    // compared against `targets.sha256`; see the module docs.

    ensure(recorded.length == targets.size, || {
        format!("{} does not have the expected size", targets_file)
    })?;
    ensure(recorded.version == targets.signed.version, || {
        format!("{} does not have the expected version", targets_file)
    })?;

    log::info!("Offline-update metadata passed basic validation");
    Ok(())
}
