//! Repository names, tags and manifest references

use std::{fmt, sync::LazyLock};

use regex::Regex;

use crate::{digest::Digest, error::RegistryError};

static REPOSITORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .unwrap_or_else(|error| panic!("repository pattern: {error}"))
});

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$")
        .unwrap_or_else(|error| panic!("tag pattern: {error}"))
});

const MAX_REPOSITORY_LEN: usize = 255;

/// Check a repository name such as `library/alpine`.
pub fn validate_repository(name: &str) -> Result<(), RegistryError> {
    if name.len() > MAX_REPOSITORY_LEN || !REPOSITORY.is_match(name) {
        return Err(RegistryError::InvalidRepository(name.to_owned()));
    }
    Ok(())
}

/// Check a tag name.
pub fn validate_tag(tag: &str) -> Result<(), RegistryError> {
    if !TAG.is_match(tag) {
        return Err(RegistryError::InvalidTag(tag.to_owned()));
    }
    Ok(())
}

/// A manifest reference: either a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A mutable tag name
    Tag(String),
    /// An immutable content digest
    Digest(Digest),
}

impl Reference {
    /// Parse a reference. Anything containing `:` must be a digest.
    pub fn parse(reference: &str) -> Result<Self, RegistryError> {
        if reference.contains(':') {
            Ok(Reference::Digest(reference.parse()?))
        } else {
            validate_tag(reference)?;
            Ok(Reference::Tag(reference.to_owned()))
        }
    }

    /// The tag, if this is a tag reference.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_names() {
        for good in ["alpine", "library/alpine", "my-org/my_app.v2", "a/b/c", "a_b"] {
            assert!(validate_repository(good).is_ok(), "{good}");
        }
        for bad in [
            "",
            "Alpine",
            "/alpine",
            "alpine/",
            "a//b",
            "a/../b",
            "-app",
            "app-",
            "a b",
        ] {
            assert!(validate_repository(bad).is_err(), "{bad}");
        }
        assert!(validate_repository(&"a".repeat(256)).is_err());
    }

    #[test]
    fn tags() {
        for good in ["latest", "v1.0.0", "_internal", "V-1_2.3"] {
            assert!(validate_tag(good).is_ok(), "{good}");
        }
        for bad in ["", ".hidden", "-dash", "a/b", "x:y"] {
            assert!(validate_tag(bad).is_err(), "{bad}");
        }
        assert!(validate_tag(&"a".repeat(128)).is_ok());
        assert!(validate_tag(&"a".repeat(129)).is_err());
    }

    #[test]
    fn references() {
        assert_eq!(
            Reference::parse("latest").unwrap(),
            Reference::Tag("latest".into())
        );
        let digest = Digest::of(b"x");
        assert_eq!(
            Reference::parse(&digest.to_string()).unwrap(),
            Reference::Digest(digest)
        );
        assert!(matches!(
            Reference::parse("sha256:nothex"),
            Err(RegistryError::InvalidDigest(_))
        ));
        assert!(matches!(
            Reference::parse(".bad"),
            Err(RegistryError::InvalidTag(_))
        ));
    }
}
