//! Object storage gateway: buckets of named, typed blobs served over HTTP on
//! top of a chunked blob store.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
