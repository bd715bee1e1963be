//! Manifest operations for the registry

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::access::Identity;
use crate::api::{AppState, DOCKER_CONTENT_DIGEST};
use crate::digest::Digest;
use crate::document::{ManifestDocument, detect_manifest_type, validate_manifest_type};
use crate::error::{RegistryError, RegistryResult};
use crate::names::{Reference, validate_repository};

/// Largest manifest body accepted.
const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

async fn resolve(state: &AppState, name: &str, reference: &Reference) -> RegistryResult<Digest> {
    match reference {
        Reference::Tag(tag) => state.storage.resolve_tag(name, tag).await,
        Reference::Digest(digest) => Ok(digest.clone()),
    }
}

/// Get a manifest, or just its headers
#[tracing::instrument(skip(state))]
pub(crate) async fn get_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
    head: bool,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    let reference = Reference::parse(reference)?;
    let digest = resolve(state, name, &reference).await?;

    let data = state.storage.read_manifest(name, &digest).await?;
    let content_type = detect_manifest_type(&data);
    let length = data.len().to_string();
    let body = if head { Body::empty() } else { Body::from(data) };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_LENGTH, length),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        body,
    )
        .into_response())
}

/// Put a manifest
#[tracing::instrument(skip(state, identity, headers, body))]
pub(crate) async fn put_manifest(
    state: &AppState,
    identity: &Identity,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    let reference = Reference::parse(reference)?;

    let data = axum::body::to_bytes(body, MAX_MANIFEST_SIZE)
        .await
        .map_err(|error| RegistryError::InvalidManifest(error.to_string()))?;

    let document = ManifestDocument::parse(&data)?;
    if let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        let content_type = validate_manifest_type(content_type)?;
        if document
            .media_type
            .as_deref()
            .is_some_and(|declared| declared != content_type)
        {
            return Err(RegistryError::InvalidManifest(format!(
                "content type {content_type} does not match declared media type {}",
                document.media_type()
            )));
        }
    }

    let digest = Digest::of(&data);
    if let Reference::Digest(expected) = &reference {
        if expected != &digest {
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: digest.to_string(),
            });
        }
    }

    {
        let _references = state.storage.referencing().await;
        state.storage.write_manifest(name, &digest, &data).await?;
        state
            .images
            .manifest_pushed(name, &digest, &document, reference.tag(), identity.subject())
            .await?;
        if let Reference::Tag(tag) = &reference {
            state.storage.write_tag(name, tag, &digest).await?;
        }
    }
    tracing::info!(%digest, %reference, "Manifest stored");

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/manifests/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response())
}

/// Delete a tag, or a manifest by digest
#[tracing::instrument(skip(state))]
pub(crate) async fn delete_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    match Reference::parse(reference)? {
        Reference::Tag(tag) => state.gc.delete_tag(name, &tag).await?,
        Reference::Digest(digest) => state.gc.delete_manifest(name, &digest).await?,
    }
    Ok(StatusCode::ACCEPTED.into_response())
}

/// `n` and `last` list parameters.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Pagination {
    n: Option<usize>,
    last: Option<String>,
}

impl Pagination {
    /// Apply to a sorted list, returning the page and whether more follow.
    pub(crate) fn page(&self, items: Vec<String>) -> (Vec<String>, bool) {
        let mut items: Vec<String> = match &self.last {
            Some(last) => items.into_iter().filter(|item| item > last).collect(),
            None => items,
        };
        match self.n {
            Some(n) if items.len() > n => {
                items.truncate(n);
                (items, true)
            }
            _ => (items, false),
        }
    }

    /// `Link` header pointing at the page after `items`.
    pub(crate) fn next_link(&self, path: &str, items: &[String]) -> Option<String> {
        let n = self.n?;
        let last = items.last()?;
        let query = serde_urlencoded::to_string([("n", n.to_string()), ("last", last.clone())]).ok()?;
        Some(format!("<{path}?{query}>; rel=\"next\""))
    }
}

/// Tag list response
#[derive(Debug, Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

/// List tags for a repository
#[tracing::instrument(skip(state))]
pub(crate) async fn list_tags(
    state: &AppState,
    name: &str,
    pagination: Pagination,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    if !state.storage.repository_exists(name).await? {
        return Err(RegistryError::RepositoryNotFound(name.to_owned()));
    }

    let tags = state.storage.list_tags(name).await?;
    let (tags, more) = pagination.page(tags);
    let link = more
        .then(|| pagination.next_link(&format!("/v2/{name}/tags/list"), &tags))
        .flatten();

    let mut response = Json(TagList {
        name: name.to_owned(),
        tags,
    })
    .into_response();
    if let Some(link) = link.and_then(|link| link.parse().ok()) {
        response.headers_mut().insert(header::LINK, link);
    }
    Ok(response)
}
