//! HTTP handlers for the bucket API. Buckets are derived from object metadata,
//! so every handler here is a query against the blob store.

use axum::{Json, extract::State, http::StatusCode};
use futures::TryStreamExt;
use tracing::warn;

use crate::{
    errors::ApiError,
    models::{bucket::BucketMeta, object::BUCKET_TAG},
    routes::params::Params,
    services::blob_store::{BlobStore, MetadataFilter},
};

fn bucket_name(params: &Params) -> Result<&str, ApiError> {
    match params.by_name("name") {
        "" => Err(ApiError::bad_request("Invalid bucket name")),
        name => Ok(name),
    }
}

/// HEAD `/buckets/{name}` — 302 when at least one object carries the bucket
/// tag, 404 otherwise. No body.
pub async fn check_exists(
    State(store): State<BlobStore>,
    params: Params,
) -> Result<StatusCode, ApiError> {
    let name = bucket_name(&params)?;

    if let Err(err) = store.ensure_index(BUCKET_TAG).await {
        warn!("Failed to ensure index on {}: {}", BUCKET_TAG, err);
    }

    let count = store
        .count_by_metadata(&MetadataFilter::eq(BUCKET_TAG, name))
        .await?;

    if count == 0 {
        Ok(StatusCode::NOT_FOUND)
    } else {
        Ok(StatusCode::FOUND)
    }
}

/// GET `/buckets/{name}` — the bucket and its objects. An unknown bucket is
/// simply empty.
pub async fn retrieve(
    State(store): State<BlobStore>,
    params: Params,
) -> Result<Json<BucketMeta>, ApiError> {
    let name = bucket_name(&params)?;

    let mut bucket = BucketMeta::new(name);
    let mut records = store.find_by_metadata(MetadataFilter::eq(BUCKET_TAG, name));
    while let Some(mut meta) = records.try_next().await? {
        // the tag is implied by the bucket itself
        meta.extra.remove(BUCKET_TAG);
        bucket.objects.push(meta);
    }

    Ok(Json(bucket))
}

/// DELETE `/buckets/{name}`
pub async fn delete() -> ApiError {
    ApiError::not_implemented()
}
