//! Content digests

use std::{
    fmt, io,
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
};

use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWrite;

use crate::error::RegistryError;

const ALGORITHM: &str = "sha256";

/// A `sha256:<hex>` content digest.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Digest of an in-memory byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            hex: hex::encode(Sha256::digest(bytes)),
        }
    }

    /// The hash algorithm, always `sha256`.
    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    /// Lowercase hex encoding of the hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ALGORITHM}:{}", self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((algorithm, hex)) = s.split_once(':') else {
            return Err(RegistryError::InvalidDigest(s.to_owned()));
        };

        if algorithm != ALGORITHM {
            return Err(RegistryError::InvalidDigest(format!(
                "unsupported algorithm: {algorithm}"
            )));
        }

        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(RegistryError::InvalidDigest(s.to_owned()));
        }

        Ok(Self {
            hex: hex.to_owned(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

/// An [`AsyncWrite`] sink that hashes everything written to it.
#[derive(Debug, Default)]
pub struct DigestWriter {
    hasher: Sha256,
    written: u64,
}

impl DigestWriter {
    /// A fresh hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes hashed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finish hashing.
    pub fn finish(self) -> Digest {
        Digest {
            hex: hex::encode(self.hasher.finalize()),
        }
    }
}

impl AsyncWrite for DigestWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.hasher.update(buf);
        this.written += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    const HELLO: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn parse_and_display() {
        let digest: Digest = HELLO.parse().unwrap();
        assert_eq!(digest.to_string(), HELLO);
        assert_eq!(digest, Digest::of(b"hello"));
        assert_eq!(digest.algorithm(), "sha256");
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "sha256",
            "md5:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
            "sha256:2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824",
            "sha256:abc",
            "sha256:../../../../etc/passwd",
        ] {
            assert!(bad.parse::<Digest>().is_err(), "{bad} should not parse");
        }
    }

    #[tokio::test]
    async fn writer_matches_one_shot() {
        let mut writer = DigestWriter::new();
        writer.write_all(b"hel").await.unwrap();
        writer.write_all(b"lo").await.unwrap();
        assert_eq!(writer.written(), 5);
        assert_eq!(writer.finish().to_string(), HELLO);
    }

    #[test]
    fn serde_as_string() {
        let digest: Digest = serde_json::from_value(serde_json::json!(HELLO)).unwrap();
        assert_eq!(serde_json::to_value(&digest).unwrap(), serde_json::json!(HELLO));
    }
}
