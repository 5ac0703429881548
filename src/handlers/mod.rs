//! HTTP handlers. Each reads its route parameters from [`Params`](crate::routes::params::Params)
//! and talks to the blob store directly.

pub mod bucket_handlers;
pub mod ingest;
pub mod object_handlers;
