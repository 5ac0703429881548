//! Represents an object (blob plus metadata record) held by the blob store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Metadata key carrying the bucket an object was uploaded into.
pub const BUCKET_TAG: &str = "bucket";

/// Metadata key carrying the `X-Correlation-Id` of the creating request.
pub const CORRELATION_TAG: &str = "cid";

/// Stored object meta information.
///
/// Every field except `extra` is assigned by the blob store when an upload is
/// finalized. Records are immutable afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectMeta {
    /// Store-assigned identifier.
    pub id: Uuid,

    pub filename: String,

    /// MIME type supplied at upload; empty when none was given.
    pub content_type: String,

    /// Total size in bytes.
    pub size: i64,

    /// Size of each stored chunk in bytes (the last chunk may be shorter).
    pub chunk_size: i64,

    /// Hex-encoded MD5 of the content.
    #[serde(rename = "md5")]
    pub checksum: String,

    pub created_on: DateTime<Utc>,

    /// User metadata (`bucket`, `cid`, ...). Omitted from JSON when empty.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}
