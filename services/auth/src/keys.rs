use std::fmt;

use camino::Utf8Path;
use jsonwebtoken::{DecodingKey, EncodingKey};

use crate::AuthError;

/// An RSA key pair for signing (private key) and verifying (public key) tokens.
#[derive(Clone)]
pub struct TokenKeys {
    pub(crate) encoding: EncodingKey,
    pub(crate) decoding: DecodingKey,
}

impl fmt::Debug for TokenKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenKeys").finish_non_exhaustive()
    }
}

impl TokenKeys {
    /// Build from PEM encoded keys.
    pub fn from_pem(signing: &[u8], verifying: &[u8]) -> Result<Self, AuthError> {
        Ok(Self {
            encoding: EncodingKey::from_rsa_pem(signing)?,
            decoding: DecodingKey::from_rsa_pem(verifying)?,
        })
    }

    /// Read PEM encoded keys from two files.
    pub fn from_files(signing: &Utf8Path, verifying: &Utf8Path) -> Result<Self, AuthError> {
        let read = |path: &Utf8Path| {
            std::fs::read(path).map_err(|source| AuthError::KeyFile {
                path: path.to_owned(),
                source,
            })
        };
        Self::from_pem(&read(signing)?, &read(verifying)?)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) const SIGNING: &[u8] = include_bytes!("../test/signing.pem");
    pub(crate) const VERIFYING: &[u8] = include_bytes!("../test/verifying.pem");
    pub(crate) const OTHER_SIGNING: &[u8] = include_bytes!("../test/other-signing.pem");

    pub(crate) fn keys() -> TokenKeys {
        TokenKeys::from_pem(SIGNING, VERIFYING).unwrap()
    }

    pub(crate) fn other_keys() -> TokenKeys {
        TokenKeys::from_pem(OTHER_SIGNING, VERIFYING).unwrap()
    }

    #[test]
    fn load_from_files() {
        let base = Utf8Path::new(env!("CARGO_MANIFEST_DIR")).join("test");
        TokenKeys::from_files(&base.join("signing.pem"), &base.join("verifying.pem")).unwrap();
    }

    #[test]
    fn missing_file_names_path() {
        let err = TokenKeys::from_files(
            Utf8Path::new("/nonexistent/signing.pem"),
            Utf8Path::new("/nonexistent/verifying.pem"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/signing.pem"));
    }
}
