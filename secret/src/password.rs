use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Secret;

const SCHEME: &str = "sha256";

/// A salted password digest, stored as `sha256$<salt>$<hex digest>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PasswordHash {
    salt: String,
    digest: Vec<u8>,
}

/// The stored password hash could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid password hash: {0}")]
pub struct InvalidPasswordHash(&'static str);

fn digest(salt: &str, password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"$");
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

impl PasswordHash {
    /// Hash a password with a fresh random salt.
    pub fn new(password: &Secret) -> Self {
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let digest = digest(&salt, password.revealed());
        Self { salt, digest }
    }

    /// Check a candidate password against this hash.
    ///
    /// The comparison takes the same time no matter where the digests differ.
    pub fn verify(&self, password: &Secret) -> bool {
        let candidate = digest(&self.salt, password.revealed());
        if candidate.len() != self.digest.len() {
            return false;
        }
        candidate
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordHash")
            .field("salt", &self.salt)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}${}${}", self.salt, hex::encode(&self.digest))
    }
}

impl FromStr for PasswordHash {
    type Err = InvalidPasswordHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '$');
        let (Some(scheme), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(InvalidPasswordHash("expected scheme$salt$digest"));
        };

        if scheme != SCHEME {
            return Err(InvalidPasswordHash("unsupported scheme"));
        }
        if salt.is_empty() {
            return Err(InvalidPasswordHash("empty salt"));
        }

        let digest = hex::decode(digest).map_err(|_| InvalidPasswordHash("digest is not hex"))?;
        if digest.len() != 32 {
            return Err(InvalidPasswordHash("digest has the wrong length"));
        }

        Ok(Self {
            salt: salt.to_owned(),
            digest,
        })
    }
}

impl TryFrom<String> for PasswordHash {
    type Error = InvalidPasswordHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PasswordHash> for String {
    fn from(value: PasswordHash) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_round_trip() {
        let hash = PasswordHash::new(&Secret::from("hunter2"));
        assert!(hash.verify(&Secret::from("hunter2")));
        assert!(!hash.verify(&Secret::from("hunter3")));
        assert!(!hash.verify(&Secret::from("")));
    }

    #[test]
    fn salts_differ() {
        let a = PasswordHash::new(&Secret::from("same"));
        let b = PasswordHash::new(&Secret::from("same"));
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn parse_stored_form() {
        let hash = PasswordHash::new(&Secret::from("pw"));
        let stored = hash.to_string();
        assert!(stored.starts_with("sha256$"));

        let parsed: PasswordHash = stored.parse().unwrap();
        assert!(parsed.verify(&Secret::from("pw")));

        let json = serde_json::to_string(&hash).unwrap();
        let back: PasswordHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn reject_malformed() {
        assert!("md5$salt$abcd".parse::<PasswordHash>().is_err());
        assert!("sha256$salt".parse::<PasswordHash>().is_err());
        assert!("sha256$$00".parse::<PasswordHash>().is_err());
        assert!("sha256$salt$zz".parse::<PasswordHash>().is_err());
    }

    #[test]
    fn debug_hides_digest() {
        let hash = PasswordHash::new(&Secret::from("pw"));
        let rendered = format!("{hash:?}");
        assert!(!rendered.contains(&hex::encode(&hash.digest)));
    }
}
