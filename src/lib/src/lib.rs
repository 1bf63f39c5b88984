//! Offline-update lockbox builder.
//!
//! A lockbox is a self-contained directory of Uptane metadata and content
//! artifacts that a disconnected device can apply without contacting an
//! update server. This crate implements the build pipeline: metadata
//! consistency validation, resolution of offline-update targets against
//! the image-repository catalog, format-based dispatch to artifact
//! retrieval, and transactional construction of the output tree.
//!
//! ```text
//! BUILD (online)                        APPLY (device - offline)
//! ──────────────                        ────────────────────────
//!
//! Update server                         Removable media
//! (director + image repo)              ┌──────────────────────────┐
//!         │ fetch, validate,           │  update/                 │
//!         │ resolve, verify            │    images/               │
//!         ▼                            │    metadata/director/    │
//! ┌─────────────────┐    copy to       │    metadata/image-repo/  │
//! │  Lockbox tree   │  ───────────►    │    metadata/docker/      │
//! └─────────────────┘    SD/USB        └────────────┬─────────────┘
//!                                                   │ verified by
//!                                                   ▼
//!                                       update client (aktualizr)
//! ```
//!
//! The build is atomic from the caller's point of view: one call to
//! [`LockboxBuilder::build`] either leaves a fully populated tree behind or
//! no tree at all. Signature-envelope verification is assumed to have
//! happened upstream; the pipeline re-validates freshness and
//! cross-document consistency before fetching anything.

#![forbid(unsafe_code)]

mod error;

/// Strongly-typed Uptane metadata documents and parsing.
pub mod metadata;

/// Time source abstraction for expiry validation.
pub mod time;

/// Consistency validation of offline-update metadata.
pub mod validate;

/// External capabilities: credentials, metadata sources, artifact fetchers.
pub mod remote;

/// HTTP-backed implementations of the external capabilities.
pub mod http;

/// Target resolution and format dispatch.
pub mod resolve;

/// Transactional build orchestration.
pub mod build;

pub use build::{
    LockboxBuildContext, LockboxBuilder, LockboxConfig, DEFAULT_OUTPUT_DIR, DEFAULT_PLATFORMS,
    DIRECTOR_DIR, DOCKER_METADATA_DIR, IMAGES_DIR, IMAGE_REPO_DIR,
};
pub use error::LockboxError;
pub use remote::{AccessToken, RegistryAuth};
