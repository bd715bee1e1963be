//! Blob operations for the registry

use std::io;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt as _;
use serde::Deserialize;
use storage::ByteRange;
use tokio::io::AsyncBufRead;
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use crate::access::Identity;
use crate::api::{AppState, DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::names::validate_repository;
use crate::upload::{Mount, UploadSessions};

const STREAM_BUFFER: usize = 64 * 1024;

/// Read a request body as an async reader.
pub(crate) fn body_reader(body: Body) -> impl AsyncBufRead + Unpin + Send {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

/// Parse a single `Range: bytes=...` against a blob of `size` bytes,
/// returning the inclusive bounds.
pub(crate) fn parse_range(value: &HeaderValue, size: u64) -> RegistryResult<(u64, u64)> {
    let bounds = value
        .to_str()
        .ok()
        .and_then(|value| value.trim().strip_prefix("bytes="))
        .filter(|bounds| !bounds.contains(','))
        .ok_or(RegistryError::RangeNotSatisfiable)?;
    let (start, end) = bounds
        .split_once('-')
        .ok_or(RegistryError::RangeNotSatisfiable)?;

    let number = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| RegistryError::RangeNotSatisfiable)
    };

    let range = if start.trim().is_empty() {
        let suffix = number(end)?;
        if suffix == 0 {
            return Err(RegistryError::RangeNotSatisfiable);
        }
        ByteRange {
            start: size.saturating_sub(suffix),
            end: None,
        }
    } else {
        ByteRange {
            start: number(start)?,
            end: if end.trim().is_empty() {
                None
            } else {
                Some(number(end)?)
            },
        }
    };

    range.resolve(size).ok_or(RegistryError::RangeNotSatisfiable)
}

/// Start of a chunk from a `Content-Range: <start>-<end>` upload header.
fn chunk_start(headers: &HeaderMap) -> RegistryResult<Option<u64>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| RegistryError::RangeNotSatisfiable)?
        .trim();
    let value = value.strip_prefix("bytes ").unwrap_or(value);
    let (start, _) = value
        .split_once('-')
        .ok_or(RegistryError::RangeNotSatisfiable)?;
    start
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| RegistryError::RangeNotSatisfiable)
}

fn upload_location(name: &str, id: &Uuid) -> String {
    format!("/v2/{name}/blobs/uploads/{id}")
}

fn blob_location(name: &str, digest: &Digest) -> String {
    format!("/v2/{name}/blobs/{digest}")
}

/// `Range` header value for an upload holding `offset` bytes.
fn upload_range(offset: u64) -> String {
    format!("0-{}", offset.saturating_sub(1))
}

fn upload_progress(status: StatusCode, name: &str, id: &Uuid, offset: u64) -> Response {
    (
        status,
        [
            (header::LOCATION, upload_location(name, id)),
            (header::RANGE, upload_range(offset)),
            (DOCKER_UPLOAD_UUID, id.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response()
}

fn blob_created(name: &str, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, blob_location(name, digest)),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response()
}

/// Get or check a blob, honouring a single byte range
#[tracing::instrument(skip(state, headers))]
pub(crate) async fn get_blob(
    state: &AppState,
    name: &str,
    digest: &str,
    headers: &HeaderMap,
    head: bool,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    let digest: Digest = digest.parse()?;

    if !state.storage.layer_linked(name, &digest).await? {
        return Err(RegistryError::BlobNotFound(digest.to_string()));
    }
    let size = state.storage.blob_metadata(&digest).await?.size;

    let range = match headers.get(header::RANGE) {
        Some(value) => match parse_range(value, size) {
            Ok(range) => Some(range),
            Err(error) => {
                return Ok((
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{size}"))],
                    error,
                )
                    .into_response());
            }
        },
        None => None,
    };

    let (status, length) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, end - start + 1),
        None => (StatusCode::OK, size),
    };

    let content_digest = digest.to_string();
    let body = if head {
        Body::empty()
    } else {
        let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER);
        let storage = state.storage.clone();
        let range = range.map(|(start, end)| ByteRange {
            start,
            end: Some(end),
        });
        tokio::spawn(async move {
            if let Err(error) = storage.download_blob(&digest, range, &mut writer).await {
                tracing::warn!(%digest, %error, "Blob download failed mid-stream");
            }
        });
        Body::from_stream(ReaderStream::new(reader))
    };

    let mut response = (
        status,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, length.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_owned()),
            (DOCKER_CONTENT_DIGEST, content_digest),
        ],
        body,
    )
        .into_response();
    if let Some((start, end)) = range {
        response.headers_mut().insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{size}"))
                .map_err(|_| RegistryError::RangeNotSatisfiable)?,
        );
    }
    Ok(response)
}

/// Delete a blob
#[tracing::instrument(skip(state))]
pub(crate) async fn delete_blob(
    state: &AppState,
    name: &str,
    digest: &str,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    let digest: Digest = digest.parse()?;
    state.gc.delete_blob(name, &digest).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Query parameters accepted when starting or finishing an upload.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct UploadQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
}

/// Start an upload, mount a blob from another repository, or upload a
/// whole blob in one request.
#[tracing::instrument(skip(state, identity, body))]
pub(crate) async fn start_upload(
    state: &AppState,
    identity: &Identity,
    name: &str,
    query: UploadQuery,
    body: Body,
) -> RegistryResult<Response> {
    validate_repository(name)?;

    if let (Some(mount), Some(from)) = (&query.mount, &query.from) {
        let digest: Digest = mount.parse()?;
        validate_repository(from)?;

        let readable = match &state.access {
            Some(access) => {
                access
                    .allows(identity, "repository", from, auth::RegistryAction::Pull)
                    .await
            }
            None => true,
        };

        let id = if readable {
            match state.uploads.mount(name, &digest, from).await? {
                Mount::Mounted(digest) => return Ok(blob_created(name, &digest)),
                Mount::Started(id) => id,
            }
        } else {
            tracing::debug!(%from, "Caller may not read mount source");
            state.uploads.initiate(name).await?
        };
        return Ok(upload_progress(StatusCode::ACCEPTED, name, &id, 0));
    }

    let id = state.uploads.initiate(name).await?;

    if let Some(digest) = &query.digest {
        let digest: Digest = match digest.parse() {
            Ok(digest) => digest,
            Err(error) => {
                state.uploads.cancel(name, &id).await?;
                return Err(error);
            }
        };
        let mut reader = body_reader(body);
        state
            .uploads
            .complete(name, &id, &digest, &mut reader)
            .await?;
        return Ok(blob_created(name, &digest));
    }

    Ok(upload_progress(StatusCode::ACCEPTED, name, &id, 0))
}

/// Append a chunk to an upload
#[tracing::instrument(skip(state, headers, body))]
pub(crate) async fn patch_upload(
    state: &AppState,
    name: &str,
    id: &str,
    headers: &HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    let id = UploadSessions::parse_id(id)?;
    let start = chunk_start(headers)?;

    let mut reader = body_reader(body);
    let offset = state
        .uploads
        .append(name, &id, start, &mut reader)
        .await?;
    Ok(upload_progress(StatusCode::ACCEPTED, name, &id, offset))
}

/// Complete an upload
#[tracing::instrument(skip(state, body))]
pub(crate) async fn put_upload(
    state: &AppState,
    name: &str,
    id: &str,
    query: UploadQuery,
    body: Body,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    let id = UploadSessions::parse_id(id)?;
    let digest: Digest = query
        .digest
        .as_deref()
        .ok_or_else(|| RegistryError::InvalidDigest("missing digest parameter".into()))?
        .parse()?;

    let mut reader = body_reader(body);
    state
        .uploads
        .complete(name, &id, &digest, &mut reader)
        .await?;
    Ok(blob_created(name, &digest))
}

/// Report how much of an upload has been received
#[tracing::instrument(skip(state))]
pub(crate) async fn upload_status(
    state: &AppState,
    name: &str,
    id: &str,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    let id = UploadSessions::parse_id(id)?;
    let offset = state.uploads.offset(name, &id).await?;
    Ok(upload_progress(StatusCode::NO_CONTENT, name, &id, offset))
}

/// Cancel an upload
#[tracing::instrument(skip(state))]
pub(crate) async fn cancel_upload(
    state: &AppState,
    name: &str,
    id: &str,
) -> RegistryResult<Response> {
    validate_repository(name)?;
    let id = UploadSessions::parse_id(id)?;
    state.uploads.cancel(name, &id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
