//! Gating registry requests on tokens and permissions

use std::sync::Arc;

use auth::{AuthError, Claims, Principal, RegistryAction, TokenService};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use metadata::ANONYMOUS;
use secret::Secret;

use crate::api::AppState;
use crate::error::RegistryError;
use crate::route::{Requirement, Route};

/// Credentials presented in an `Authorization` header.
#[derive(Debug, Clone)]
pub(crate) enum Credentials {
    Bearer(String),
    Basic { username: String, password: Secret },
}

impl Credentials {
    /// Read the `Authorization` header. A header which is present but
    /// unreadable is an error, not an anonymous request.
    pub(crate) fn from_headers(headers: &HeaderMap) -> Result<Option<Self>, AuthError> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| AuthError::InvalidToken("authorization header is not ascii".into()))?;

        let (scheme, rest) = value.split_once(' ').unwrap_or((value, ""));
        let rest = rest.trim();
        if scheme.eq_ignore_ascii_case("bearer") && !rest.is_empty() {
            return Ok(Some(Credentials::Bearer(rest.to_owned())));
        }
        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = STANDARD
                .decode(rest)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or(AuthError::InvalidCredentials)?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or(AuthError::InvalidCredentials)?;
            return Ok(Some(Credentials::Basic {
                username: username.to_owned(),
                password: Secret::from(password.to_owned()),
            }));
        }
        Err(AuthError::InvalidToken(format!(
            "unsupported authorization scheme {scheme}"
        )))
    }
}

/// Who is making a request.
#[derive(Debug, Clone)]
pub struct Identity {
    subject: String,
    claims: Option<Claims>,
}

impl Identity {
    pub(crate) fn anonymous() -> Self {
        Self {
            subject: ANONYMOUS.to_owned(),
            claims: None,
        }
    }

    /// The user name, or `anonymous`.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Claims of the presented token, if the caller used one.
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }
}

/// Token based access control for the registry API.
#[derive(Debug)]
pub struct AccessControl {
    tokens: Arc<TokenService>,
    realm: String,
}

impl AccessControl {
    /// Check requests with `tokens`, sending clients to `realm` for a token.
    pub fn new(tokens: Arc<TokenService>, realm: impl Into<String>) -> Self {
        Self {
            tokens,
            realm: realm.into(),
        }
    }

    /// The token service.
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Build a `WWW-Authenticate` challenge.
    pub(crate) fn challenge(
        &self,
        requirement: Option<&Requirement>,
        error: Option<&str>,
    ) -> Option<HeaderValue> {
        let mut challenge = format!(
            "Bearer realm=\"{}\",service=\"{}\"",
            self.realm,
            self.tokens.service()
        );
        if let Some(requirement) = requirement {
            let actions = match requirement.action {
                RegistryAction::Push => "pull,push".to_owned(),
                action => action.to_string(),
            };
            challenge.push_str(&format!(
                ",scope=\"{}:{}:{}\"",
                requirement.kind, requirement.name, actions
            ));
        }
        if let Some(error) = error {
            challenge.push_str(&format!(",error=\"{error}\""));
        }
        HeaderValue::from_str(&challenge).ok()
    }

    fn unauthorized(&self, requirement: Option<&Requirement>, error: Option<&str>) -> RegistryError {
        RegistryError::Unauthorized {
            challenge: self.challenge(requirement, error),
        }
    }

    /// Whether `identity` may perform `action` on the named resource.
    pub async fn allows(
        &self,
        identity: &Identity,
        kind: &str,
        name: &str,
        action: RegistryAction,
    ) -> bool {
        let covered = identity
            .claims
            .as_ref()
            .is_none_or(|claims| claims.covers(kind, name, action));
        covered && self.tokens.permits(&identity.subject, action).await
    }

    /// Authenticate a request and check it meets `requirement`.
    #[tracing::instrument(skip_all, fields(requirement = ?requirement))]
    pub(crate) async fn check(
        &self,
        headers: &HeaderMap,
        requirement: Option<&Requirement>,
    ) -> Result<Identity, RegistryError> {
        let credentials = Credentials::from_headers(headers).map_err(|error| {
            tracing::debug!(%error, "Unreadable credentials");
            self.unauthorized(requirement, Some("invalid_request"))
        })?;

        let presented = credentials.is_some();
        let identity = match credentials {
            None if self.tokens.allows_anonymous() => Identity::anonymous(),
            None => return Err(self.unauthorized(requirement, None)),
            Some(Credentials::Bearer(token)) => match self.tokens.verify(&token) {
                Ok(claims) => Identity {
                    subject: claims.sub.clone(),
                    claims: Some(claims),
                },
                Err(error) => {
                    tracing::debug!(%error, "Rejected bearer token");
                    return Err(self.unauthorized(requirement, Some("invalid_token")));
                }
            },
            Some(Credentials::Basic { username, password }) => {
                let principal = Principal::Password { username, password };
                match self.tokens.identify(&principal).await {
                    Ok(subject) => Identity {
                        subject,
                        claims: None,
                    },
                    Err(error) => {
                        tracing::debug!(%error, "Rejected basic credentials");
                        return Err(self.unauthorized(requirement, None));
                    }
                }
            }
        };

        if let Some(requirement) = requirement {
            if !self
                .allows(
                    &identity,
                    requirement.kind,
                    &requirement.name,
                    requirement.action,
                )
                .await
            {
                tracing::debug!(subject = %identity.subject, "Access denied");
                if !presented {
                    return Err(self.unauthorized(Some(requirement), None));
                }
                return Err(RegistryError::Forbidden {
                    challenge: self.challenge(Some(requirement), Some("insufficient_scope")),
                });
            }
        }

        Ok(identity)
    }
}

/// Parse the route, authenticate the caller and check their access before
/// handing the request on with [`Route`] and [`Identity`] extensions.
pub(crate) async fn require_access(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let route = Route::parse(request.uri().path());
    let requirement = route
        .as_ref()
        .and_then(|route| route.requirement(request.method()));

    let identity = match &state.access {
        None => Identity::anonymous(),
        Some(access) => match access.check(request.headers(), requirement.as_ref()).await {
            Ok(identity) => identity,
            Err(error) => return error.into_response(),
        },
    };

    if let Some(route) = route {
        request.extensions_mut().insert(route);
    }
    request.extensions_mut().insert(identity);
    next.run(request).await
}
