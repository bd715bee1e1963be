//! # Registry metadata
//!
//! The records the registry keeps beside its content-addressed store: who may
//! do what (users, groups, roles and permissions) and what is known about each
//! pushed image (tags, size, owner, visibility).
//!
//! Storage of these records is behind the [`MetadataStore`] trait. An
//! in-memory implementation is provided, seeded from configuration with
//! [`Bootstrap`].

mod bootstrap;
mod error;
mod image;
mod model;
mod store;

pub use bootstrap::{Bootstrap, GroupSeed, RoleSeed, UserSeed};
pub use error::MetadataError;
pub use image::ImageMetadata;
pub use model::{Action, Group, Permission, Resource, Role, UnknownVariant, User};
pub use store::{MemoryMetadataStore, MetadataStore};

/// The identity used for requests that carry no credentials.
pub const ANONYMOUS: &str = "anonymous";

/// The role consulted for anonymous requests.
pub const ANONYMOUS_ROLE: &str = "anonymous";
