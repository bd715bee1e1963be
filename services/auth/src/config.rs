use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::{AuthError, TokenKeys};

fn default_name() -> String {
    "registry".into()
}

fn default_session_lifetime() -> u64 {
    3600
}

fn default_registry_token_lifetime() -> u64 {
    300
}

fn default_revocation_sweep() -> u64 {
    60
}

fn default_clock_leeway() -> u64 {
    30
}

fn default_refresh_window() -> u64 {
    7 * 24 * 3600
}

/// Token service configuration. Durations are whole seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthConfig {
    /// `iss` claim for issued tokens.
    #[serde(default = "default_name")]
    pub issuer: String,

    /// `aud` claim for issued tokens, and the `service` in challenges.
    #[serde(default = "default_name")]
    pub service: String,

    /// URL of the token endpoint, sent as the challenge `realm`.
    pub realm: String,

    /// Lifetime of session tokens. Also the interval at which cached
    /// permission decisions are dropped.
    #[serde(default = "default_session_lifetime")]
    pub session_lifetime: u64,

    /// Lifetime of registry tokens.
    #[serde(default = "default_registry_token_lifetime")]
    pub registry_token_lifetime: u64,

    /// PEM file with the RSA private key.
    pub signing_key: Utf8PathBuf,

    /// PEM file with the RSA public key.
    pub verifying_key: Utf8PathBuf,

    /// Whether requests without credentials proceed as `anonymous`.
    #[serde(default)]
    pub anonymous: bool,

    /// How often expired revocations are purged.
    #[serde(default = "default_revocation_sweep")]
    pub revocation_sweep: u64,

    /// Allowed clock skew when checking token times.
    #[serde(default = "default_clock_leeway")]
    pub clock_leeway: u64,

    /// How long past its expiry a session token may still be refreshed.
    #[serde(default = "default_refresh_window")]
    pub refresh_window: u64,
}

impl AuthConfig {
    /// A configuration with defaults for everything but the key files.
    pub fn new(
        realm: impl Into<String>,
        signing_key: impl Into<Utf8PathBuf>,
        verifying_key: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            issuer: default_name(),
            service: default_name(),
            realm: realm.into(),
            session_lifetime: default_session_lifetime(),
            registry_token_lifetime: default_registry_token_lifetime(),
            signing_key: signing_key.into(),
            verifying_key: verifying_key.into(),
            anonymous: false,
            revocation_sweep: default_revocation_sweep(),
            clock_leeway: default_clock_leeway(),
            refresh_window: default_refresh_window(),
        }
    }

    /// Reject settings the token service cannot run with.
    pub fn validate(&self) -> Result<(), AuthError> {
        for (name, value) in [
            ("session-lifetime", self.session_lifetime),
            ("registry-token-lifetime", self.registry_token_lifetime),
            ("revocation-sweep", self.revocation_sweep),
        ] {
            if value == 0 {
                return Err(AuthError::InvalidConfig(format!("{name} must be at least one second")));
            }
        }
        Ok(())
    }

    /// Read the configured key pair.
    pub fn keys(&self) -> Result<TokenKeys, AuthError> {
        TokenKeys::from_files(&self.signing_key, &self.verifying_key)
    }

    /// Session token lifetime.
    pub fn session_lifetime(&self) -> Duration {
        Duration::from_secs(self.session_lifetime)
    }

    /// Registry token lifetime.
    pub fn registry_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.registry_token_lifetime)
    }

    /// Revocation purge interval.
    pub fn revocation_sweep(&self) -> Duration {
        Duration::from_secs(self.revocation_sweep)
    }

    /// Grace period for refreshing expired session tokens.
    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(self.refresh_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config: AuthConfig = serde_json::from_value(serde_json::json!({
            "realm": "http://localhost:5000/auth/token",
            "signing-key": "keys/signing.pem",
            "verifying-key": "keys/verifying.pem",
        }))
        .unwrap();

        assert_eq!(config.issuer, "registry");
        assert_eq!(config.session_lifetime(), Duration::from_secs(3600));
        assert_eq!(config.registry_token_lifetime(), Duration::from_secs(300));
        assert!(!config.anonymous);
        assert_eq!(config.signing_key, "keys/signing.pem");
        assert_eq!(config.refresh_window(), Duration::from_secs(7 * 24 * 3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let mut config = AuthConfig::new("http://localhost/auth/token", "a.pem", "b.pem");
        config.revocation_sweep = 0;
        assert!(matches!(config.validate(), Err(AuthError::InvalidConfig(_))));

        let mut config = AuthConfig::new("http://localhost/auth/token", "a.pem", "b.pem");
        config.session_lifetime = 0;
        assert!(matches!(config.validate(), Err(AuthError::InvalidConfig(_))));
    }
}
