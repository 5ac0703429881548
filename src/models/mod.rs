//! Data models exposed by the object gateway.
//!
//! Neither type is persisted as-is: `ObjectMeta` is decoded from blob-store
//! records and `BucketMeta` is assembled per request from a metadata query.

pub mod bucket;
pub mod object;
