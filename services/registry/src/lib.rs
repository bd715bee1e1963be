//! # Container Registry
//!
//! A self-hosted registry speaking the Docker Registry HTTP API v2 /
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec).
//!
//! ## Features
//!
//! - Content-addressed blob store with chunked and monolithic uploads
//! - Manifests and tags per repository, with cross-repository blob mounts
//! - Reference-checked garbage collection when tags and manifests are deleted
//! - Bearer token authentication and role-based permission checks via [`auth`]
//! - Pluggable storage backend via the `storage` crate
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RegistryBuilder::new()
//!     .storage(MemoryStorage::new().into())
//!     .build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, registry).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Servers are usually built from a [`RegistryConfig`] instead, which also
//! wires up token authentication and seeds accounts.

mod access;
mod api;
mod blob;
mod config;
mod digest;
mod document;
mod error;
mod gc;
mod images;
mod manifest;
mod names;
mod route;
mod storage;
mod tokens;
mod upload;

pub use access::{AccessControl, Identity};
pub use api::RegistryBuilder;
pub use config::{ConfigError, RegistryConfig, ServerConfig};
pub use digest::{Digest, DigestWriter};
pub use document::{
    DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, Descriptor, ManifestDocument, OCI_INDEX, OCI_MANIFEST,
    detect_manifest_type, validate_manifest_type,
};
pub use error::{RegistryError, RegistryResult};
pub use gc::GarbageCollector;
pub use images::ImageRecords;
pub use names::{Reference, validate_repository, validate_tag};
pub use route::{Requirement, Route};
pub use crate::storage::RegistryStorage;
pub use upload::{Mount, UploadSessions};
