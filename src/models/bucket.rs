//! Represents a bucket: a grouping of objects that share a metadata tag.

use serde::{Deserialize, Serialize};

use super::object::ObjectMeta;

/// A named group of objects.
///
/// Buckets are not stored entities. Every read rebuilds one by querying the
/// blob store for records whose `bucket` metadata equals `name`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BucketMeta {
    pub name: String,

    /// Member objects in store order, with the bucket tag stripped from `extra`.
    pub objects: Vec<ObjectMeta>,
}

impl BucketMeta {
    /// An empty bucket named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Vec::new(),
        }
    }
}
