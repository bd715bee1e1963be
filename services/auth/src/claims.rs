use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scope::{RegistryAction, ResourceActions};

/// What a token was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// A login session. May be refreshed after it expires.
    Session,
    /// A short-lived registry token carrying scoped grants.
    Registry,
}

/// The signed payload of a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: a user name or `anonymous`.
    pub sub: String,

    /// Audience: the service the token is for.
    pub aud: String,

    /// Issuer
    pub iss: String,

    /// Issued at, seconds since the epoch.
    pub iat: i64,

    /// Expires at, seconds since the epoch.
    pub exp: i64,

    /// Not before, seconds since the epoch.
    pub nbf: i64,

    /// Unique token id.
    pub jti: String,

    /// Token kind
    pub kind: TokenKind,

    /// Registry grants, for registry tokens.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access: Vec<ResourceActions>,

    /// Whether this token may be validated after expiry, to be refreshed.
    #[serde(default)]
    pub reissue: bool,
}

impl Claims {
    /// Expiry as a timestamp.
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Issue time as a timestamp.
    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.iat, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether the token is for the anonymous identity.
    pub fn is_anonymous(&self) -> bool {
        self.sub.is_empty() || self.sub == metadata::ANONYMOUS
    }

    /// Whether the claims allow `action` on the repository `name`.
    ///
    /// Session tokens carry no grants and are checked only against the
    /// permission resolver, so they always pass here.
    pub fn covers(&self, kind: &str, name: &str, action: RegistryAction) -> bool {
        match self.kind {
            TokenKind::Session => true,
            TokenKind::Registry => self
                .access
                .iter()
                .any(|grant| grant.allows(kind, name, action)),
        }
    }
}
