//! Token endpoints
//!
//! `/auth/token` hands out registry tokens to docker clients following a
//! `WWW-Authenticate` challenge. The `/api/v1/auth` endpoints manage session
//! tokens for API users.

use std::sync::Arc;

use auth::{AuthError, IssuedToken, Principal, TokenRequest};
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::{AccessControl, Credentials};
use crate::api::AppState;
use crate::error::{ErrorDetail, ErrorResponse};

/// Routes for the token endpoints.
pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/token", get(token).post(token))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
}

/// An [`AuthError`] on its way back to the client.
#[derive(Debug)]
struct TokenError {
    error: AuthError,
    challenge: Option<HeaderValue>,
}

impl TokenError {
    fn new(access: &AccessControl, error: AuthError) -> Self {
        Self {
            error,
            challenge: access.challenge(None, None),
        }
    }
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.error {
            AuthError::InvalidScope(_) => (StatusCode::BAD_REQUEST, "UNSUPPORTED"),
            AuthError::Forbidden(_) => (StatusCode::FORBIDDEN, "DENIED"),
            AuthError::InvalidConfig(_)
            | AuthError::KeyFile { .. }
            | AuthError::Signing(_)
            | AuthError::Metadata(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN")
            }
            _ => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self.error, "Token request failed");
        } else {
            tracing::debug!(error = %self.error, "Token request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code,
                message: self.error.to_string(),
                detail: serde_json::Value::Null,
            }],
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            if let Some(challenge) = self.challenge {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, challenge);
            }
        }
        response
    }
}

fn access(state: &AppState) -> Result<&Arc<AccessControl>, Response> {
    state
        .access
        .as_ref()
        .ok_or_else(|| StatusCode::NOT_FOUND.into_response())
}

/// Registry token response, in the shape docker clients expect.
#[derive(Serialize)]
struct TokenResponse {
    token: String,
    access_token: String,
    expires_in: i64,
    issued_at: DateTime<Utc>,
}

impl From<IssuedToken> for TokenResponse {
    fn from(issued: IssuedToken) -> Self {
        let token = issued.token.revealed().to_owned();
        Self {
            access_token: token.clone(),
            token,
            expires_in: issued.expires_in(),
            issued_at: issued.claims.issued_at(),
        }
    }
}

/// Parameters accepted by `/auth/token` from the query and form body.
#[derive(Debug, Default)]
struct TokenParams {
    service: Option<String>,
    scopes: Vec<String>,
    username: Option<String>,
    password: Option<String>,
}

impl TokenParams {
    fn extend(&mut self, encoded: &str) -> Result<(), AuthError> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(encoded)
            .map_err(|error| AuthError::InvalidScope(format!("malformed parameters: {error}")))?;
        for (key, value) in pairs {
            match key.as_str() {
                "service" => self.service = Some(value),
                "scope" => self.scopes.push(value),
                "username" => self.username = Some(value),
                "password" => self.password = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    fn scope(&self) -> String {
        self.scopes
            .iter()
            .map(|scope| scope.trim())
            .filter(|scope| !scope.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn principal(headers: &HeaderMap, params: &mut TokenParams) -> Result<Principal, AuthError> {
    match Credentials::from_headers(headers)? {
        Some(Credentials::Basic { username, password }) => {
            Ok(Principal::Password { username, password })
        }
        Some(Credentials::Bearer(_)) => Err(AuthError::InvalidCredentials),
        None => match (params.username.take(), params.password.take()) {
            (Some(username), Some(password)) => Ok(Principal::Password {
                username,
                password: password.into(),
            }),
            _ => Ok(Principal::Anonymous),
        },
    }
}

/// `GET|POST /auth/token`
#[tracing::instrument(skip_all)]
async fn token(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let access = match access(&state) {
        Ok(access) => access,
        Err(response) => return response,
    };

    let issued = async {
        let mut params = TokenParams::default();
        if let Some(query) = query.as_deref() {
            params.extend(query)?;
        }
        if !body.is_empty() {
            let form = std::str::from_utf8(&body)
                .map_err(|_| AuthError::InvalidScope("form body is not utf-8".into()))?;
            params.extend(form)?;
        }

        if let Some(service) = &params.service {
            if service != access.tokens().service() {
                return Err(AuthError::InvalidScope(format!("unknown service {service}")));
            }
        }

        let scope = params.scope();
        let principal = principal(&headers, &mut params)?;
        let request = if scope.is_empty() {
            TokenRequest::Session
        } else {
            TokenRequest::Registry { scope }
        };
        access.tokens().authenticate(principal, request).await
    }
    .await;

    match issued {
        Ok(issued) => {
            tracing::debug!(subject = %issued.claims.sub, "Issued registry token");
            Json(TokenResponse::from(issued)).into_response()
        }
        Err(error) => TokenError::new(access, error).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

/// Session token response
#[derive(Serialize)]
struct SessionResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

impl From<IssuedToken> for SessionResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            token: issued.token.revealed().to_owned(),
            expires_at: issued.claims.expires_at(),
        }
    }
}

/// `POST /api/v1/auth/login`
#[tracing::instrument(skip_all)]
async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Response {
    let access = match access(&state) {
        Ok(access) => access,
        Err(response) => return response,
    };

    let principal = Principal::Password {
        username: request.username,
        password: request.password.into(),
    };
    match access
        .tokens()
        .authenticate(principal, TokenRequest::Session)
        .await
    {
        Ok(issued) => Json(SessionResponse::from(issued)).into_response(),
        Err(error) => TokenError::new(access, error).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RefreshRequest {
    token: Option<String>,
}

fn bearer(headers: &HeaderMap) -> Result<Option<String>, AuthError> {
    match Credentials::from_headers(headers)? {
        Some(Credentials::Bearer(token)) => Ok(Some(token)),
        Some(Credentials::Basic { .. }) => Err(AuthError::InvalidToken(
            "expected a bearer token".into(),
        )),
        None => Ok(None),
    }
}

/// `POST /api/v1/auth/refresh`
#[tracing::instrument(skip_all)]
async fn refresh(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let access = match access(&state) {
        Ok(access) => access,
        Err(response) => return response,
    };

    let refreshed = async {
        let token = match bearer(&headers)? {
            Some(token) => token,
            None => {
                let request: RefreshRequest = if body.is_empty() {
                    RefreshRequest::default()
                } else {
                    serde_json::from_slice(&body)
                        .map_err(|error| AuthError::InvalidToken(error.to_string()))?
                };
                request.token.ok_or(AuthError::Unauthorized)?
            }
        };
        access.tokens().refresh(&token).await
    }
    .await;

    match refreshed {
        Ok(issued) => Json(SessionResponse::from(issued)).into_response(),
        Err(error) => TokenError::new(access, error).into_response(),
    }
}

/// `POST /api/v1/auth/logout`
#[tracing::instrument(skip_all)]
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let access = match access(&state) {
        Ok(access) => access,
        Err(response) => return response,
    };

    let revoked = bearer(&headers).and_then(|token| {
        let token = token.ok_or(AuthError::Unauthorized)?;
        access.tokens().verify(&token)?;
        access.tokens().revoke(&token)
    });

    match revoked {
        Ok(expires) => {
            tracing::debug!(%expires, "Revoked session token");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(error) => TokenError::new(access, error).into_response(),
    }
}
