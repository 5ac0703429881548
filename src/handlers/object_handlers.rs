//! HTTP handlers for the object API.
//! Uploads and downloads stream between the connection and the blob store
//! chunk by chunk; object content is never buffered whole.

use crate::{
    errors::ApiError,
    handlers::ingest::ingest,
    models::object::ObjectMeta,
    routes::params::Params,
    services::blob_store::BlobStore,
};
use axum::{
    Json,
    body::Body,
    extract::{
        State,
        multipart::{Multipart, MultipartRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use uuid::Uuid;

/// Request header whose value is stored with new objects.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

const MULTIPART_FORM_DATA: &str = "multipart/form-data";

fn object_id(params: &Params) -> Result<Uuid, ApiError> {
    Uuid::parse_str(params.by_name("id")).map_err(|_| ApiError::bad_request("Invalid object ID"))
}

/// POST `/objects` — multipart upload of metadata and content.
pub async fn create(
    State(store): State<BlobStore>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with(MULTIPART_FORM_DATA) {
        return Err(ApiError::unsupported_media_type("Unsupported media type")
            .with_cause(format!(
                "Expecting {MULTIPART_FORM_DATA} content type but received: {content_type}"
            ))
            .with_detail("expected", MULTIPART_FORM_DATA)
            .with_detail("received", content_type));
    }

    let multipart = multipart
        .map_err(|err| ApiError::bad_request("Failed to parse data").with_cause(err.body_text()))?;

    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok());

    let meta = ingest(&store, multipart, correlation_id).await?;

    Ok((StatusCode::CREATED, Json(meta)).into_response())
}

/// PUT `/objects/{id}`
pub async fn update() -> ApiError {
    ApiError::not_implemented()
}

/// HEAD `/objects/{id}` — 302 when the object exists, 404 otherwise. No content
/// is fetched.
pub async fn check_exists(
    State(store): State<BlobStore>,
    params: Params,
) -> Result<StatusCode, ApiError> {
    let id = object_id(&params)?;

    match store.find_by_id(id).await? {
        Some(_) => Ok(StatusCode::FOUND),
        None => Ok(StatusCode::NOT_FOUND),
    }
}

/// GET `/objects/{id}` — stream the object content.
///
/// Headers are committed before the first chunk is read. A failure after
/// that point can only abort the body, leaving the client with a truncated
/// response.
pub async fn download(
    State(store): State<BlobStore>,
    params: Params,
) -> Result<Response, ApiError> {
    let id = object_id(&params)?;

    let Some(reader) = store.open_read_stream(id).await? else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    let (meta, content) = reader.into_parts();
    let content = content.inspect_err(move |err| {
        tracing::error!("download of {} aborted mid-stream: {}", id, err);
    });

    let mut response = Response::new(Body::from_stream(content));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// GET `/objects/{id}/meta` — the stored record, `extra` included as is.
pub async fn about(
    State(store): State<BlobStore>,
    params: Params,
) -> Result<Json<ObjectMeta>, ApiError> {
    let id = object_id(&params)?;

    match store.find_by_id(id).await? {
        Some(meta) => Ok(Json(meta)),
        None => Err(ApiError::not_found("Object does not exist")
            .with_cause(format!("no object {id}"))),
    }
}

/// DELETE `/objects/{id}`
pub async fn delete() -> ApiError {
    ApiError::not_implemented()
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectMeta) {
    if !meta.content_type.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&meta.content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }

    if !meta.filename.is_empty() {
        let disposition = format!("inline; filename=\"{}\"", meta.filename.replace('"', "\\\""));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size.max(0)));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.checksum)) {
        headers.insert(header::ETAG, value);
    }

    let last_modified = meta
        .created_on
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
