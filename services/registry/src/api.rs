//! API server builder and router

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::any;
use axum::{Extension, Router, middleware};
use metadata::{MemoryMetadataStore, MetadataStore};
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::access::{AccessControl, Identity, require_access};
use crate::blob;
use crate::error::{RegistryError, RegistryResult};
use crate::gc::GarbageCollector;
use crate::images::ImageRecords;
use crate::manifest::{self, Pagination};
use crate::route::Route;
use crate::storage::RegistryStorage;
use crate::upload::UploadSessions;

/// `Docker-Content-Digest`
pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
/// `Docker-Upload-UUID`
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
/// `Docker-Distribution-Api-Version`
pub(crate) const API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");

/// Shared state for every handler.
#[derive(Debug, Clone)]
pub(crate) struct AppState {
    pub(crate) storage: RegistryStorage,
    pub(crate) uploads: UploadSessions,
    pub(crate) images: ImageRecords,
    pub(crate) gc: GarbageCollector,
    pub(crate) access: Option<Arc<AccessControl>>,
}

/// Registry builder for configuring and creating the registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    metadata: Option<Arc<dyn MetadataStore>>,
    access: Option<AccessControl>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            metadata: None,
            access: None,
        }
    }

    /// Set the storage backend. Defaults to in-memory storage.
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the metadata store. Defaults to an in-memory store.
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Require tokens for the registry API and serve the token endpoints.
    /// Without this, every request is allowed as `anonymous`.
    pub fn access(mut self, access: AccessControl) -> Self {
        self.access = Some(access);
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let storage = self
            .storage
            .unwrap_or_else(|| storage::MemoryStorage::new().into());
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(MemoryMetadataStore::new()));

        let storage = RegistryStorage::new(storage);
        let images = ImageRecords::new(metadata);
        let state = AppState {
            uploads: UploadSessions::new(storage.clone()),
            gc: GarbageCollector::new(storage.clone(), images.clone()),
            storage,
            images,
            access: self.access.map(Arc::new),
        };

        let v2 = Router::new()
            .route("/v2", any(dispatch))
            .route("/v2/", any(dispatch))
            .route("/v2/{*path}", any(dispatch))
            .layer(middleware::from_fn_with_state(state.clone(), require_access))
            .layer(SetResponseHeaderLayer::overriding(
                API_VERSION,
                HeaderValue::from_static("registry/2.0"),
            ));

        let mut router = Router::new().merge(v2);
        if state.access.is_some() {
            router = router.merge(crate::tokens::router());
        }
        router.with_state(state)
    }
}

fn query<T: DeserializeOwned + Default>(request: &Request) -> RegistryResult<T> {
    match request.uri().query() {
        Some(query) => serde_urlencoded::from_str(query)
            .map_err(|error| RegistryError::InvalidQuery(error.to_string())),
        None => Ok(T::default()),
    }
}

/// Route a `/v2` request to its handler.
async fn dispatch(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    request: Request,
) -> Response {
    let Some(route) = request.extensions().get::<Route>().cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let method = request.method().clone();

    let result = match (route, method) {
        (Route::Base, Method::GET | Method::HEAD) => Ok(api_version_check().into_response()),
        (Route::Catalog, Method::GET) => match query(&request) {
            Ok(pagination) => catalog(&state, pagination).await,
            Err(error) => Err(error),
        },
        (Route::Tags { name }, Method::GET) => match query(&request) {
            Ok(pagination) => manifest::list_tags(&state, &name, pagination).await,
            Err(error) => Err(error),
        },
        (Route::Manifest { name, reference }, Method::GET) => {
            manifest::get_manifest(&state, &name, &reference, false).await
        }
        (Route::Manifest { name, reference }, Method::HEAD) => {
            manifest::get_manifest(&state, &name, &reference, true).await
        }
        (Route::Manifest { name, reference }, Method::PUT) => {
            let (parts, body) = request.into_parts();
            manifest::put_manifest(&state, &identity, &name, &reference, &parts.headers, body)
                .await
        }
        (Route::Manifest { name, reference }, Method::DELETE) => {
            manifest::delete_manifest(&state, &name, &reference).await
        }
        (Route::Blob { name, digest }, Method::GET) => {
            blob::get_blob(&state, &name, &digest, request.headers(), false).await
        }
        (Route::Blob { name, digest }, Method::HEAD) => {
            blob::get_blob(&state, &name, &digest, request.headers(), true).await
        }
        (Route::Blob { name, digest }, Method::DELETE) => {
            blob::delete_blob(&state, &name, &digest).await
        }
        (Route::Uploads { name }, Method::POST) => match query(&request) {
            Ok(upload) => {
                blob::start_upload(&state, &identity, &name, upload, request.into_body()).await
            }
            Err(error) => Err(error),
        },
        (Route::Upload { name, id }, Method::PATCH) => {
            let (parts, body) = request.into_parts();
            blob::patch_upload(&state, &name, &id, &parts.headers, body).await
        }
        (Route::Upload { name, id }, Method::PUT) => match query(&request) {
            Ok(upload) => blob::put_upload(&state, &name, &id, upload, request.into_body()).await,
            Err(error) => Err(error),
        },
        (Route::Upload { name, id }, Method::GET | Method::HEAD) => {
            blob::upload_status(&state, &name, &id).await
        }
        (Route::Upload { name, id }, Method::DELETE) => {
            blob::cancel_upload(&state, &name, &id).await
        }
        (_, method) => Err(RegistryError::Unsupported(format!(
            "{method} {}",
            request.uri().path()
        ))),
    };

    result.into_response()
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available. With access
/// control, only after the caller has authenticated.
fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

#[derive(Debug, serde::Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

/// List repositories
async fn catalog(state: &AppState, pagination: Pagination) -> RegistryResult<Response> {
    let repositories = state.storage.catalog().await?;
    let (repositories, more) = pagination.page(repositories);
    let link = more
        .then(|| pagination.next_link("/v2/_catalog", &repositories))
        .flatten();

    let mut response = Json(Catalog { repositories }).into_response();
    if let Some(link) = link.and_then(|link| link.parse().ok()) {
        response.headers_mut().insert(header::LINK, link);
    }
    Ok(response)
}
