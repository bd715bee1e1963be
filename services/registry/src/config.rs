//! Server configuration
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:5000"
//!
//! [storage.local]
//! path = "/var/lib/registry"
//!
//! [auth]
//! realm = "http://localhost:5000/auth/token"
//! signing-key = "keys/signing.pem"
//! verifying-key = "keys/verifying.pem"
//! anonymous = true
//!
//! [[bootstrap.roles]]
//! name = "anonymous"
//! permissions = [{ action = "read", resource = "registry" }]
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use auth::{AuthConfig, AuthError, PermissionResolver, TokenService};
use axum::Router;
use camino::{Utf8Path, Utf8PathBuf};
use metadata::{Bootstrap, MemoryMetadataStore, MetadataError, MetadataStore};
use serde::Deserialize;
use storage::{StorageConfig, StorageError};

use crate::access::AccessControl;
use crate::api::RegistryBuilder;

/// Errors reading the configuration or building the services it describes.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("reading {path}")]
    Read {
        /// Path to the configuration file
        path: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid TOML, or does not match the schema
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml_edit::de::Error),

    /// The storage backend could not be created
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// The signing keys could not be loaded
    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    /// Seeding the metadata store failed
    #[error("metadata: {0}")]
    Metadata(#[from] MetadataError),
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 5000))
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Everything needed to run a registry server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Where blobs and manifests are kept
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// Token authentication. Without it, every request is allowed.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Accounts and roles created at startup
    #[serde(default)]
    pub bootstrap: Bootstrap,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: default_storage(),
            auth: None,
            bootstrap: Bootstrap::default(),
        }
    }
}

impl RegistryConfig {
    /// Parse a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml_edit::de::from_str(contents)?;
        if let Some(auth) = &config.auth {
            auth.validate()?;
        }
        Ok(config)
    }

    /// Read a TOML configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Create the storage backend, metadata store and token service, and
    /// return the registry router.
    ///
    /// Must be called inside a tokio runtime, which runs the background
    /// sweeps of the token service.
    #[tracing::instrument(skip(self))]
    pub async fn build(self) -> Result<Router, ConfigError> {
        let storage = self.storage.build().await?;

        let store = Arc::new(MemoryMetadataStore::new());
        self.bootstrap.apply(store.as_ref()).await?;
        let store: Arc<dyn MetadataStore> = store;

        let mut builder = RegistryBuilder::new()
            .storage(storage)
            .metadata(store.clone());

        if let Some(auth) = &self.auth {
            auth.validate()?;
            let keys = auth.keys()?;
            let resolver = PermissionResolver::new(store).with_sweep(auth.session_lifetime());
            let tokens = TokenService::new(auth, keys, resolver);
            tracing::info!(realm = %auth.realm, service = %auth.service, "Token authentication enabled");
            builder = builder.access(AccessControl::new(Arc::new(tokens), auth.realm.clone()));
        } else {
            tracing::warn!("No [auth] configured, the registry is open to everyone");
        }

        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use secret::{PasswordHash, Secret};
    use tower::ServiceExt;

    use super::*;

    fn key(name: &str) -> String {
        format!("{}/../auth/test/{name}", env!("CARGO_MANIFEST_DIR"))
    }

    #[test]
    fn defaults() {
        let config = RegistryConfig::from_toml("").unwrap();
        assert_eq!(config.server.listen, default_listen());
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert!(config.auth.is_none());
        assert!(config.bootstrap.users.is_empty());
    }

    #[test]
    fn full_document() {
        let hash = PasswordHash::new(&Secret::from("hunter2"));
        let document = format!(
            r#"
[server]
listen = "0.0.0.0:8080"

[storage.local]
path = "/var/lib/registry"

[auth]
realm = "http://localhost:8080/auth/token"
signing-key = "keys/signing.pem"
verifying-key = "keys/verifying.pem"
session-lifetime = 600

[[bootstrap.roles]]
name = "pusher"
permissions = [{{ action = "write", resource = "registry" }}]

[[bootstrap.users]]
name = "alice"
password = "{hash}"
"#
        );

        let config = RegistryConfig::from_toml(&document).unwrap();
        assert_eq!(config.server.listen.port(), 8080);
        assert!(
            matches!(&config.storage, StorageConfig::Local { path } if path == "/var/lib/registry")
        );
        let auth = config.auth.unwrap();
        assert_eq!(auth.session_lifetime, 600);
        assert_eq!(auth.registry_token_lifetime, 300);
        assert_eq!(config.bootstrap.roles[0].permissions.len(), 1);
        assert_eq!(config.bootstrap.users[0].name, "alice");
    }

    #[test]
    fn rejects_unknown_storage() {
        let error = RegistryConfig::from_toml("storage = \"floppy\"").unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_zero_durations() {
        let error = RegistryConfig::from_toml(
            r#"
[auth]
realm = "http://localhost:5000/auth/token"
signing-key = "keys/signing.pem"
verifying-key = "keys/verifying.pem"
revocation-sweep = 0
"#,
        )
        .unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Auth(AuthError::InvalidConfig(_))
        ));
    }

    #[test]
    fn missing_file() {
        let error = RegistryConfig::load(Utf8Path::new("/nonexistent/registry.toml")).unwrap_err();
        assert!(matches!(error, ConfigError::Read { .. }));
    }

    #[tokio::test]
    async fn build_with_auth_challenges() {
        let document = format!(
            r#"
[auth]
realm = "http://localhost:5000/auth/token"
signing-key = "{}"
verifying-key = "{}"
"#,
            key("signing.pem"),
            key("verifying.pem"),
        );
        let router = RegistryConfig::from_toml(&document)
            .unwrap()
            .build()
            .await
            .unwrap();

        let response = router
            .oneshot(Request::builder().uri("/v2/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn build_without_auth_is_open() {
        let router = RegistryConfig::default().build().await.unwrap();
        let response = router
            .oneshot(Request::builder().uri("/v2/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
