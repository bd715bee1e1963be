//! Manifest documents

use serde::Deserialize;

use crate::{digest::Digest, error::RegistryError};

/// Docker image manifest, schema 2
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// A content descriptor inside a manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    #[serde(default)]
    pub media_type: Option<String>,

    /// Digest of the referenced content
    pub digest: Digest,

    /// Size of the referenced content in bytes
    pub size: u64,
}

/// The parts of a manifest or index the registry cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDocument {
    /// Always 2
    pub schema_version: u32,

    /// Declared media type, if present in the document
    #[serde(default)]
    pub media_type: Option<String>,

    /// Image configuration blob
    #[serde(default)]
    pub config: Option<Descriptor>,

    /// Layer blobs
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Child manifests of an index
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ManifestDocument {
    /// Parse and sanity check a manifest body.
    pub fn parse(bytes: &[u8]) -> Result<Self, RegistryError> {
        let document: ManifestDocument = serde_json::from_slice(bytes)
            .map_err(|error| RegistryError::InvalidManifest(error.to_string()))?;

        if document.schema_version != 2 {
            return Err(RegistryError::InvalidManifest(format!(
                "unsupported schema version {}",
                document.schema_version
            )));
        }

        if document.config.is_none() && document.manifests.is_empty() {
            return Err(RegistryError::InvalidManifest(
                "manifest has neither a config nor child manifests".into(),
            ));
        }

        Ok(document)
    }

    /// Whether this is a manifest list or image index.
    pub fn is_index(&self) -> bool {
        self.config.is_none()
    }

    /// The declared media type, or the one implied by the document shape.
    pub fn media_type(&self) -> &str {
        match (&self.media_type, self.is_index()) {
            (Some(media_type), _) => media_type,
            (None, true) => OCI_INDEX,
            (None, false) => OCI_MANIFEST,
        }
    }

    /// Sum of the config and layer sizes. For an index, the sum of the
    /// child manifest sizes.
    pub fn total_size(&self) -> u64 {
        let referenced = self.config.iter().chain(&self.layers).chain(&self.manifests);
        referenced.map(|descriptor| descriptor.size).sum()
    }

    /// Digests of the blobs this manifest references: the config, then each
    /// layer. Child manifests of an index are not blobs and are not included.
    pub fn blob_digests(&self) -> Vec<Digest> {
        let mut digests: Vec<Digest> = Vec::with_capacity(self.layers.len() + 1);
        for descriptor in self.config.iter().chain(&self.layers) {
            if !digests.contains(&descriptor.digest) {
                digests.push(descriptor.digest.clone());
            }
        }
        digests
    }
}

/// Check a `Content-Type` sent with a manifest upload. Parameters after `;`
/// are ignored.
pub fn validate_manifest_type(content_type: &str) -> Result<&str, RegistryError> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    match essence {
        DOCKER_MANIFEST | DOCKER_MANIFEST_LIST | OCI_MANIFEST | OCI_INDEX => Ok(essence),
        _ => Err(RegistryError::UnsupportedManifestType(
            content_type.to_string(),
        )),
    }
}

/// Media type to serve a stored manifest with.
pub fn detect_manifest_type(data: &[u8]) -> String {
    match ManifestDocument::parse(data) {
        Ok(document) => document.media_type().to_owned(),
        Err(_) => OCI_MANIFEST.to_owned(),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// An image manifest referencing the given config and layers.
    pub(crate) fn image_manifest(config: (&Digest, u64), layers: &[(&Digest, u64)]) -> Vec<u8> {
        let layers: Vec<_> = layers
            .iter()
            .map(|(digest, size)| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": digest.to_string(),
                    "size": size,
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config.0.to_string(),
                "size": config.1,
            },
            "layers": layers,
        }))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_image_manifest() {
        let config = Digest::of(b"config");
        let layer = Digest::of(b"layer");
        let body = fixtures::image_manifest((&config, 6), &[(&layer, 5), (&layer, 5)]);

        let document = ManifestDocument::parse(&body).unwrap();
        assert!(!document.is_index());
        assert_eq!(document.media_type(), OCI_MANIFEST);
        assert_eq!(document.total_size(), 16);
        assert_eq!(document.blob_digests(), vec![config, layer]);
    }

    #[test]
    fn parse_index_has_no_blobs() {
        let child = Digest::of(b"child");
        let body = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{"digest": child.to_string(), "size": 300}],
        }))
        .unwrap();

        let document = ManifestDocument::parse(&body).unwrap();
        assert!(document.is_index());
        assert_eq!(document.media_type(), OCI_INDEX);
        assert_eq!(document.total_size(), 300);
        assert!(document.blob_digests().is_empty());
    }

    #[test]
    fn rejects_bad_documents() {
        for body in [
            &b"not json"[..],
            br#"{"schemaVersion": 1, "fsLayers": []}"#,
            br#"{"schemaVersion": 2}"#,
            br#"{"schemaVersion": 2, "config": {"digest": "sha256:zz", "size": 1}}"#,
        ] {
            assert!(matches!(
                ManifestDocument::parse(body),
                Err(RegistryError::InvalidManifest(_))
            ));
        }
    }

    #[test]
    fn content_types() {
        assert_eq!(
            validate_manifest_type("application/vnd.oci.image.manifest.v1+json; charset=utf-8")
                .unwrap(),
            OCI_MANIFEST
        );
        assert!(validate_manifest_type("application/json").is_err());
        assert!(
            validate_manifest_type("application/vnd.docker.distribution.manifest.v1+prettyjws")
                .is_err()
        );
    }
}
