//! Streaming ingest of a `multipart/form-data` upload into the blob store.
//!
//! Parts are consumed in a single forward pass. Each part is classified by its
//! name and whether it carries a file name:
//!
//! | part           | file name | role                              |
//! |----------------|-----------|-----------------------------------|
//! | `filename`     | absent    | object filename                   |
//! | `content_type` | absent    | object content type               |
//! | `extra.bucket` | absent    | bucket tag                        |
//! | `object`       | present   | content, streamed into a new blob |
//! | anything else  |           | ignored                           |
//!
//! Exactly one `object` part is accepted. Whenever ingest fails after the blob
//! has been created, the blob is aborted before the error is returned.

use axum::extract::multipart::{Field, Multipart, MultipartError};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    errors::ApiError,
    models::object::{BUCKET_TAG, CORRELATION_TAG, ObjectMeta},
    services::blob_store::{BlobStore, BlobWriter, StoreError},
};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Malformed(#[from] MultipartError),
    #[error("No object has been uploaded")]
    NoObject,
    #[error("Only one object may be uploaded per request")]
    DuplicateObject,
    #[error("failed to write blob: {0}")]
    Save(#[source] StoreError),
    #[error("failed to finalize blob: {0}")]
    Finalize(#[source] StoreError),
    #[error("failed to read back object: {0}")]
    Lookup(#[source] StoreError),
    #[error("object {0} was finalized but cannot be found")]
    Vanished(Uuid),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        let api = match &err {
            IngestError::Malformed(_) => ApiError::bad_request("Failed to process multipart form"),
            IngestError::NoObject | IngestError::DuplicateObject => {
                ApiError::bad_request("Bad request")
            }
            IngestError::Save(_) => ApiError::internal("Failed to save blob"),
            IngestError::Finalize(_) => ApiError::internal("Failed to finalize blob"),
            IngestError::Lookup(_) => ApiError::internal("Operational error"),
            IngestError::Vanished(_) => ApiError::internal("Newly created could not be found"),
        };
        api.with_cause(err)
    }
}

/// Role of one multipart part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartRole {
    Filename,
    ContentType,
    Bucket,
    Object,
    Ignored,
}

impl PartRole {
    fn classify(name: Option<&str>, file_name: Option<&str>) -> Self {
        let is_file = file_name.is_some_and(|f| !f.is_empty());
        match (name.unwrap_or(""), is_file) {
            ("filename", false) => Self::Filename,
            ("content_type", false) => Self::ContentType,
            ("extra.bucket", false) => Self::Bucket,
            ("object", true) => Self::Object,
            _ => Self::Ignored,
        }
    }
}

/// Accumulated state of one upload.
struct Ingest<'s> {
    store: &'s BlobStore,
    filename: String,
    content_type: String,
    metadata: Map<String, Value>,
    blob: Option<BlobWriter>,
}

impl<'s> Ingest<'s> {
    fn new(store: &'s BlobStore, correlation_id: Option<&str>) -> Self {
        let mut metadata = Map::new();
        if let Some(cid) = correlation_id {
            metadata.insert(CORRELATION_TAG.into(), Value::from(cid));
        }
        Self {
            store,
            filename: String::new(),
            content_type: String::new(),
            metadata,
            blob: None,
        }
    }

    async fn consume(&mut self, multipart: &mut Multipart) -> Result<(), IngestError> {
        while let Some(field) = multipart.next_field().await? {
            match PartRole::classify(field.name(), field.file_name()) {
                PartRole::Filename => self.filename = field.text().await?,
                PartRole::ContentType => self.content_type = field.text().await?,
                PartRole::Bucket => {
                    let bucket = field.text().await?;
                    self.metadata.insert(BUCKET_TAG.into(), Value::from(bucket));
                }
                PartRole::Object => self.receive(field).await?,
                PartRole::Ignored => debug!("ignoring multipart part {:?}", field.name()),
            }
        }
        Ok(())
    }

    /// Stream one file part into a freshly created blob.
    async fn receive(&mut self, mut field: Field<'_>) -> Result<(), IngestError> {
        if self.blob.is_some() {
            return Err(IngestError::DuplicateObject);
        }

        let name = field.file_name().unwrap_or_default().to_string();
        if self.content_type.is_empty() {
            if let Some(declared) = field.content_type() {
                self.content_type = declared.to_string();
            }
        }

        let writer = self.blob.insert(self.store.create(&name));
        while let Some(chunk) = field.chunk().await? {
            writer.write(chunk).await.map_err(IngestError::Save)?;
        }
        debug!("received {} bytes for {}", writer.size(), writer.name());
        Ok(())
    }

    async fn finish(self) -> Result<ObjectMeta, IngestError> {
        let Some(writer) = self.blob else {
            return Err(IngestError::NoObject);
        };

        let id = self
            .store
            .finalize(writer, &self.filename, &self.content_type, self.metadata)
            .await
            .map_err(IngestError::Finalize)?;

        self.store
            .find_by_id(id)
            .await
            .map_err(IngestError::Lookup)?
            .ok_or(IngestError::Vanished(id))
    }

    async fn abandon(self) {
        if let Some(writer) = self.blob {
            let id = writer.id();
            if let Err(err) = self.store.abort(writer).await {
                warn!("Failed to abort blob {}: {}", id, err);
            }
        }
    }
}

/// Run an upload to completion and return the stored record.
pub async fn ingest(
    store: &BlobStore,
    mut multipart: Multipart,
    correlation_id: Option<&str>,
) -> Result<ObjectMeta, IngestError> {
    let mut upload = Ingest::new(store, correlation_id);

    if let Err(err) = upload.consume(&mut multipart).await {
        upload.abandon().await;
        return Err(err);
    }

    upload.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn parts_are_classified_by_name_and_file_name() {
        assert_eq!(PartRole::classify(Some("filename"), None), PartRole::Filename);
        assert_eq!(PartRole::classify(Some("content_type"), None), PartRole::ContentType);
        assert_eq!(PartRole::classify(Some("extra.bucket"), None), PartRole::Bucket);
        assert_eq!(PartRole::classify(Some("object"), Some("a.txt")), PartRole::Object);
    }

    #[test]
    fn parts_in_the_wrong_shape_are_ignored() {
        // a file sent under a value name, and a value sent under the file name
        assert_eq!(PartRole::classify(Some("filename"), Some("a.txt")), PartRole::Ignored);
        assert_eq!(PartRole::classify(Some("object"), None), PartRole::Ignored);
        assert_eq!(PartRole::classify(Some("object"), Some("")), PartRole::Ignored);
        assert_eq!(PartRole::classify(Some("extra.owner"), None), PartRole::Ignored);
        assert_eq!(PartRole::classify(None, None), PartRole::Ignored);
    }

    #[test]
    fn errors_map_onto_the_taxonomy() {
        let no_object = ApiError::from(IngestError::NoObject);
        assert_eq!(no_object.status, StatusCode::BAD_REQUEST);
        assert_eq!(no_object.message, "No object has been uploaded");

        let duplicate = ApiError::from(IngestError::DuplicateObject);
        assert_eq!(duplicate.status, StatusCode::BAD_REQUEST);

        let vanished = ApiError::from(IngestError::Vanished(Uuid::nil()));
        assert_eq!(vanished.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(vanished.title, "Newly created could not be found");
    }
}
