//! # Registry authorization
//!
//! Signed access tokens and role-based permission checks for the registry.
//!
//! - [`TokenService`] issues RS256 tokens for a username/password or for the
//!   anonymous identity, validates and revokes them, and refreshes session tokens.
//! - [`PermissionResolver`] answers whether an identity holds a permission by
//!   walking user, group, role and permission records in a
//!   [`metadata::MetadataStore`], caching its decisions.
//! - [`parse_scopes`] reads the `type:name:action,...` grammar used by
//!   registry clients when they ask for a token.

mod claims;
mod config;
mod error;
mod keys;
mod resolver;
mod revocation;
mod scope;
mod token;

pub use claims::{Claims, TokenKind};
pub use config::AuthConfig;
pub use error::AuthError;
pub use keys::TokenKeys;
pub use resolver::PermissionResolver;
pub use revocation::RevocationList;
pub use scope::{RegistryAction, ResourceActions, parse_scopes};
pub use token::{IssuedToken, Principal, TokenRequest, TokenService};
