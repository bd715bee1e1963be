use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use echocache::Sweeper;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use metadata::{ANONYMOUS, MetadataStore, Permission, Resource};
use secret::Secret;

use crate::{
    AuthConfig, AuthError, Claims, PermissionResolver, RevocationList, TokenKeys, TokenKind,
    scope::{RegistryAction, ResourceActions, parse_scopes},
};

/// Who is asking for a token.
#[derive(Debug, Clone)]
pub enum Principal {
    /// No credentials.
    Anonymous,

    /// A username and password.
    Password {
        /// User name
        username: String,
        /// Plain password, checked against the stored hash.
        password: Secret,
    },
}

/// What kind of token is being asked for.
#[derive(Debug, Clone)]
pub enum TokenRequest {
    /// A refreshable login session.
    Session,

    /// A registry token for one or more space-separated `type:name:actions` scopes.
    Registry {
        /// Requested scope string
        scope: String,
    },
}

/// A freshly signed token and the claims inside it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The encoded token.
    pub token: Secret,

    /// What was signed.
    pub claims: Claims,
}

impl IssuedToken {
    /// Seconds between issue and expiry.
    pub fn expires_in(&self) -> i64 {
        self.claims.exp - self.claims.iat
    }
}

/// Issues, validates, revokes and refreshes signed tokens.
#[derive(Debug)]
pub struct TokenService {
    issuer: String,
    service: String,
    session_lifetime: Duration,
    registry_lifetime: Duration,
    leeway: i64,
    refresh_window: i64,
    anonymous: bool,
    keys: TokenKeys,
    resolver: PermissionResolver,
    revoked: RevocationList,
    _sweeper: Sweeper,
}

impl TokenService {
    /// Create a token service.
    ///
    /// Spawns the revocation purge on the current tokio runtime. The
    /// resolver is used to filter the actions granted in registry tokens.
    pub fn new(config: &AuthConfig, keys: TokenKeys, resolver: PermissionResolver) -> Self {
        let revoked = RevocationList::new();
        let sweeper = revoked.sweep_every(config.revocation_sweep());
        Self {
            issuer: config.issuer.clone(),
            service: config.service.clone(),
            session_lifetime: config.session_lifetime(),
            registry_lifetime: config.registry_token_lifetime(),
            leeway: i64::try_from(config.clock_leeway).unwrap_or(i64::MAX),
            refresh_window: i64::try_from(config.refresh_window).unwrap_or(i64::MAX),
            anonymous: config.anonymous,
            keys,
            resolver,
            revoked,
            _sweeper: sweeper,
        }
    }

    /// The audience of issued tokens.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether anonymous callers may be issued tokens.
    pub fn allows_anonymous(&self) -> bool {
        self.anonymous
    }

    /// The resolver used for permission checks.
    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    /// The revocation list.
    pub fn revocations(&self) -> &RevocationList {
        &self.revoked
    }

    fn store(&self) -> &Arc<dyn MetadataStore> {
        self.resolver.store()
    }

    /// Check a principal's credentials without issuing a token, returning
    /// the subject a token would be issued to.
    pub async fn identify(&self, principal: &Principal) -> Result<String, AuthError> {
        match principal {
            Principal::Anonymous if self.anonymous => Ok(ANONYMOUS.to_owned()),
            Principal::Anonymous => Err(AuthError::Unauthorized),
            Principal::Password { username, password } => {
                let user = match self.store().user(username).await {
                    Ok(user) => user,
                    Err(error) if error.is_not_found() => {
                        tracing::debug!(%username, "Unknown user");
                        return Err(AuthError::InvalidCredentials);
                    }
                    Err(error) => return Err(error.into()),
                };
                if !user.password.verify(password) {
                    tracing::debug!(%username, "Wrong password");
                    return Err(AuthError::InvalidCredentials);
                }
                Ok(user.name)
            }
        }
    }

    /// Issue a token for a principal.
    #[tracing::instrument(skip_all)]
    pub async fn authenticate(
        &self,
        principal: Principal,
        request: TokenRequest,
    ) -> Result<IssuedToken, AuthError> {
        let subject = self.identify(&principal).await?;

        match request {
            TokenRequest::Session => {
                let claims = self.claims(subject, TokenKind::Session, Vec::new());
                self.issue(claims)
            }
            TokenRequest::Registry { scope } => {
                let requested = parse_scopes(&scope);
                if requested.is_empty() {
                    return Err(AuthError::InvalidScope(scope));
                }

                let mut access = Vec::with_capacity(requested.len());
                for grant in requested {
                    access.push(self.filter(&subject, grant).await);
                }
                let claims = self.claims(subject, TokenKind::Registry, access);
                self.issue(claims)
            }
        }
    }

    /// Keep only the actions of `grant` that `subject` is permitted.
    async fn filter(&self, subject: &str, grant: ResourceActions) -> ResourceActions {
        let mut allowed = BTreeSet::new();
        for action in &grant.actions {
            if self.permits(subject, *action).await {
                allowed.insert(*action);
            }
        }

        if allowed.len() < grant.actions.len() {
            tracing::debug!(%subject, requested = %grant, granted = allowed.len(), "Narrowed scope");
        }

        ResourceActions {
            actions: allowed,
            ..grant
        }
    }

    fn claims(&self, subject: String, kind: TokenKind, access: Vec<ResourceActions>) -> Claims {
        let now = Utc::now().timestamp();
        let lifetime = match kind {
            TokenKind::Session => self.session_lifetime,
            TokenKind::Registry => self.registry_lifetime,
        };
        Claims {
            sub: subject,
            aud: self.service.clone(),
            iss: self.issuer.clone(),
            iat: now,
            nbf: now,
            exp: now.saturating_add(i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX)),
            jti: uuid::Uuid::new_v4().to_string(),
            kind,
            access,
            reissue: kind == TokenKind::Session,
        }
    }

    fn issue(&self, claims: Claims) -> Result<IssuedToken, AuthError> {
        let token = self.sign(&claims)?;
        tracing::debug!(sub = %claims.sub, kind = ?claims.kind, exp = claims.exp, "Issued token");
        Ok(IssuedToken { token, claims })
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> Result<Secret, AuthError> {
        let token =
            jsonwebtoken::encode(&Header::new(Algorithm::RS256), claims, &self.keys.encoding)?;
        Ok(Secret::from(token))
    }

    /// Validate a token.
    ///
    /// Expired tokens whose claims allow reissue are accepted for the refresh
    /// window past their expiry, so that they may be refreshed. Use
    /// [`TokenService::verify`] to authorize requests.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        if self.revoked.contains(token) {
            return Err(AuthError::Revoked);
        }

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_audience(&[&self.service]);
        validation.set_issuer(&[&self.issuer]);

        let claims = jsonwebtoken::decode::<Claims>(token, &self.keys.decoding, &validation)
            .map_err(|error| AuthError::InvalidToken(error.to_string()))?
            .claims;

        let now = Utc::now().timestamp();
        if claims.iat > now.saturating_add(self.leeway) {
            return Err(AuthError::FutureIssued);
        }
        if claims.nbf > now.saturating_add(self.leeway) {
            return Err(AuthError::NotYetValid);
        }
        let cutoff = now.saturating_sub(self.leeway);
        if claims.exp <= cutoff
            && (!claims.reissue || claims.exp.saturating_add(self.refresh_window) <= cutoff)
        {
            return Err(AuthError::TokenExpired);
        }

        Ok(claims)
    }

    /// Validate a token presented to access a resource. Expired tokens are
    /// always rejected here.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.validate(token)?;
        if claims.exp <= Utc::now().timestamp().saturating_sub(self.leeway) {
            return Err(AuthError::TokenExpired);
        }
        Ok(claims)
    }

    /// Revoke a token until it can no longer validate: its expiry, or for
    /// reissuable tokens the end of the refresh window after it.
    ///
    /// The signature is not checked, so foreign or damaged tokens can be
    /// revoked as long as their expiry is readable.
    pub fn revoke(&self, token: &str) -> Result<DateTime<Utc>, AuthError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|error| AuthError::InvalidToken(error.to_string()))?
            .claims;

        let mut expires = claims.expires_at();
        if claims.reissue {
            expires = TimeDelta::try_seconds(self.refresh_window)
                .and_then(|window| expires.checked_add_signed(window))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
        self.revoked.insert(token, expires);
        tracing::info!(sub = %claims.sub, %expires, "Revoked token");
        Ok(expires)
    }

    /// Issue a new session token for the subject of `token`.
    ///
    /// The presented token is its own refresh credential: any session token
    /// which still validates (including expired ones within the refresh
    /// window) can be exchanged.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self, token: &str) -> Result<IssuedToken, AuthError> {
        let claims = self.validate(token)?;
        if claims.kind != TokenKind::Session {
            return Err(AuthError::InvalidToken(
                "only session tokens can be refreshed".into(),
            ));
        }

        if claims.is_anonymous() {
            if !self.anonymous {
                return Err(AuthError::Unauthorized);
            }
            return self.issue(self.claims(ANONYMOUS.to_owned(), TokenKind::Session, Vec::new()));
        }

        let user = match self.store().user(&claims.sub).await {
            Ok(user) => user,
            Err(error) if error.is_not_found() => return Err(AuthError::InvalidCredentials),
            Err(error) => return Err(error.into()),
        };

        let mut groups = 0;
        for name in &user.groups {
            match self.store().group(name).await {
                Ok(_) => groups += 1,
                Err(error) => tracing::warn!(user = %user.name, group = %name, %error, "Skipping group"),
            }
        }
        tracing::debug!(user = %user.name, groups, "Refreshing session");

        self.issue(self.claims(user.name, TokenKind::Session, Vec::new()))
    }

    /// Whether `claims` allow `action` on the repository `name`, by their own
    /// scope and by the permission resolver.
    pub async fn authorize(
        &self,
        claims: &Claims,
        kind: &str,
        name: &str,
        action: RegistryAction,
    ) -> bool {
        claims.covers(kind, name, action) && self.permits(&claims.sub, action).await
    }

    /// Whether `subject` currently holds every permission `action` requires,
    /// regardless of any token scope.
    pub async fn permits(&self, subject: &str, action: RegistryAction) -> bool {
        for required in action.required() {
            let permission = Permission::new(*required, Resource::Registry);
            if !self.resolver.has_permission(subject, &permission).await {
                return false;
            }
        }
        true
    }
}
