//! Defines the route table of the gateway.
//!
//! ## Structure
//! - **Bucket endpoints** (JSON pipeline)
//!   - `HEAD   /buckets/{name}` — does the bucket have any objects (302 / 404)
//!   - `GET    /buckets/{name}` — bucket with its objects
//!   - `DELETE /buckets/{name}` — not implemented (501)
//!
//! - **Object endpoints**
//!   - `POST   /objects`         — multipart upload (default pipeline)
//!   - `PUT    /objects/{id}`    — not implemented (501)
//!   - `HEAD   /objects/{id}`    — existence check (302 / 404)
//!   - `GET    /objects/{id}`    — streaming download (default pipeline)
//!   - `GET    /objects/{id}/meta` — object metadata
//!   - `DELETE /objects/{id}`    — not implemented (501)

use crate::{
    handlers::{bucket_handlers, object_handlers},
    middleware::Pipeline,
    routes::router::ApiRouter,
    services::blob_store::BlobStore,
};
use axum::{Router, extract::DefaultBodyLimit};

/// Build the router for every gateway endpoint.
///
/// The router carries the shared `BlobStore` to all handlers. The body size
/// limit is lifted because uploads stream straight into the store.
pub fn routes() -> Router<BlobStore> {
    // mind the order of the stages, see `Pipeline`
    let default_chain = Pipeline::default_chain();
    let json_chain = Pipeline::json_chain();

    ApiRouter::new()
        // Bucket API
        .head("/buckets/{name}", json_chain.then(bucket_handlers::check_exists))
        .get("/buckets/{name}", json_chain.then(bucket_handlers::retrieve))
        .delete("/buckets/{name}", json_chain.then(bucket_handlers::delete))
        // Object API
        .post("/objects", default_chain.then(object_handlers::create))
        .put("/objects/{id}", json_chain.then(object_handlers::update))
        .head("/objects/{id}", json_chain.then(object_handlers::check_exists))
        .get("/objects/{id}", default_chain.then(object_handlers::download))
        .get("/objects/{id}/meta", json_chain.then(object_handlers::about))
        .delete("/objects/{id}", json_chain.then(object_handlers::delete))
        .into_router()
        .layer(DefaultBodyLimit::disable())
}
