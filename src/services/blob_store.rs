//! src/services/blob_store.rs
//!
//! BlobStore — a chunked blob store backed by SQLite. Content is split into
//! fixed-size chunks stored in `<namespace>_chunks`; one record per object in
//! `<namespace>_files` carries the size, checksum and free-form JSON metadata.
//!
//! A files record is only written when an upload is finalized, so readers
//! never observe a partially written object.

use crate::models::object::ObjectMeta;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use md5::Context;
use serde_json::{Map, Value};
use sqlx::{Executor, FromRow, SqlitePool, sqlite::Sqlite, types::Json};
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default chunk size, matching the usual GridFS layout (255 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// Number of records fetched per round-trip by `find_by_metadata`.
const FIND_BATCH_SIZE: i64 = 128;

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const FILE_COLUMNS: &str =
    "seq, id, filename, content_type, length, chunk_size, md5, upload_date, metadata";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata field `{0}` is invalid")]
    InvalidField(String),
    #[error("namespace `{0}` is invalid: only ASCII letters, digits and `_` are allowed")]
    InvalidNamespace(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Table namespace, built from the configured database name and prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    /// Join the non-empty parts with `_`.
    pub fn new(database: &str, prefix: &str) -> StoreResult<Self> {
        let joined = [database, prefix]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");

        if joined.is_empty() || !is_identifier(&joined) {
            return Err(StoreError::InvalidNamespace(joined));
        }
        Ok(Self(joined))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn files(&self) -> String {
        format!("{}_files", self.0)
    }

    fn chunks(&self) -> String {
        format!("{}_chunks", self.0)
    }
}

/// Equality predicate on one top-level metadata key.
#[derive(Debug, Clone)]
pub struct MetadataFilter {
    pub field: String,
    pub value: String,
}

impl MetadataFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// SQL expression selecting the field out of the JSON metadata column.
    fn expression(&self) -> StoreResult<String> {
        metadata_expression(&self.field)
    }
}

#[derive(FromRow)]
struct FileRow {
    seq: i64,
    id: Uuid,
    filename: String,
    content_type: String,
    length: i64,
    chunk_size: i64,
    md5: String,
    upload_date: DateTime<Utc>,
    metadata: Json<Map<String, Value>>,
}

impl From<FileRow> for ObjectMeta {
    fn from(row: FileRow) -> Self {
        Self {
            id: row.id,
            filename: row.filename,
            content_type: row.content_type,
            size: row.length,
            chunk_size: row.chunk_size,
            checksum: row.md5,
            created_on: row.upload_date,
            extra: row.metadata.0,
        }
    }
}

/// Client for the chunked blob store. Cheap to clone and safe to share
/// between concurrent requests.
#[derive(Clone)]
pub struct BlobStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,

    namespace: Namespace,
    files: Arc<str>,
    chunks: Arc<str>,
    chunk_size: usize,
}

/// Write handle for an upload in progress.
///
/// Full chunks are persisted as soon as they fill up. Hand the writer to
/// [`BlobStore::finalize`] or [`BlobStore::abort`]. A writer dropped before
/// either completes (a cancelled request, for one) discards its chunks on a
/// background task.
pub struct BlobWriter {
    id: Uuid,
    name: String,
    db: Arc<SqlitePool>,
    chunks: Arc<str>,
    chunk_size: usize,
    buffer: BytesMut,
    next_chunk: i64,
    size: i64,
    digest: Context,
    settled: bool,
}

/// Read handle: the object's record plus its content as a chunk stream.
pub struct BlobReader {
    meta: ObjectMeta,
    content: BoxStream<'static, io::Result<Bytes>>,
}

impl BlobStore {
    /// Create a new BlobStore using `namespace` tables in the given pool.
    /// A zero `chunk_size` is replaced by [`DEFAULT_CHUNK_SIZE`].
    pub fn new(db: Arc<SqlitePool>, namespace: Namespace, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            db,
            files: namespace.files().into(),
            chunks: namespace.chunks().into(),
            namespace,
            chunk_size,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Create the files and chunks tables if they do not exist yet.
    ///
    /// Returns the number of statements executed.
    pub async fn migrate(&self) -> StoreResult<usize> {
        let sql = MIGRATION.replace("{namespace}", self.namespace.as_str());
        let statements = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    /// Start a new upload. Nothing is persisted until the first chunk fills.
    pub fn create(&self, name: &str) -> BlobWriter {
        BlobWriter {
            id: Uuid::new_v4(),
            name: name.to_string(),
            db: self.db.clone(),
            chunks: self.chunks.clone(),
            chunk_size: self.chunk_size,
            buffer: BytesMut::with_capacity(self.chunk_size),
            next_chunk: 0,
            size: 0,
            digest: Context::new(),
            settled: false,
        }
    }

    /// Persist the trailing chunk and the files record in one transaction.
    ///
    /// An empty `filename` falls back to the name the upload was created with.
    /// On failure every chunk written for this upload is discarded.
    pub async fn finalize(
        &self,
        mut writer: BlobWriter,
        filename: &str,
        content_type: &str,
        metadata: Map<String, Value>,
    ) -> StoreResult<Uuid> {
        let id = writer.id;
        let filename = if filename.is_empty() {
            writer.name.clone()
        } else {
            filename.to_string()
        };
        let digest = std::mem::replace(&mut writer.digest, Context::new());
        let record = PendingFile {
            id,
            filename,
            content_type: content_type.to_string(),
            size: writer.size,
            md5: format!("{:x}", digest.compute()),
            metadata,
        };
        let tail = writer.buffer.split().freeze();

        match self.commit(record, tail, writer.next_chunk).await {
            Ok(()) => {
                writer.settled = true;
                Ok(id)
            }
            Err(err) => {
                match self.discard_chunks(id).await {
                    Ok(()) => writer.settled = true,
                    Err(cleanup) => warn!(
                        "failed to discard chunks of {} after finalize error: {}",
                        id, cleanup
                    ),
                }
                Err(err)
            }
        }
    }

    /// Discard everything written through `writer`.
    pub async fn abort(&self, mut writer: BlobWriter) -> StoreResult<()> {
        debug!("aborting upload {} ({} bytes written)", writer.id, writer.size);
        self.discard_chunks(writer.id).await?;
        writer.settled = true;
        Ok(())
    }

    /// Look up a finalized record by identifier.
    pub async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<ObjectMeta>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM {} WHERE id = ?", self.files);
        let row = sqlx::query_as::<_, FileRow>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row.map(ObjectMeta::from))
    }

    /// Stream every record whose metadata matches `filter`, in insertion order.
    ///
    /// Records are fetched in pages, so no connection is held while the
    /// caller consumes the stream.
    pub fn find_by_metadata(
        &self,
        filter: MetadataFilter,
    ) -> BoxStream<'static, StoreResult<ObjectMeta>> {
        let db = self.db.clone();
        let files = self.files.clone();

        stream::try_unfold(Some(0_i64), move |cursor| {
            let db = db.clone();
            let files = files.clone();
            let filter = filter.clone();
            async move { next_page(&db, &files, &filter, cursor).await }
        })
        .map_ok(|rows| stream::iter(rows.into_iter().map(|row| Ok(ObjectMeta::from(row)))))
        .try_flatten()
        .boxed()
    }

    /// Count the records whose metadata matches `filter`.
    pub async fn count_by_metadata(&self, filter: &MetadataFilter) -> StoreResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?",
            self.files,
            filter.expression()?
        );
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(&filter.value)
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }

    /// Open an object for reading. Chunks are fetched lazily as the returned
    /// stream is polled; a missing chunk fails the stream with an I/O error.
    pub async fn open_read_stream(&self, id: Uuid) -> StoreResult<Option<BlobReader>> {
        let Some(meta) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        let total = chunk_count(meta.size, meta.chunk_size);
        let db = self.db.clone();
        let chunks = self.chunks.clone();
        let content = stream::try_unfold(0_i64, move |n| {
            let db = db.clone();
            let chunks = chunks.clone();
            async move { next_chunk(&db, &chunks, id, n, total).await }
        })
        .boxed();

        Ok(Some(BlobReader { meta, content }))
    }

    /// Make sure an index exists on `metadata.<field>`.
    pub async fn ensure_index(&self, field: &str) -> StoreResult<()> {
        let expression = metadata_expression(field)?;
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {files}_metadata_{field} ON {files} ({expression})",
            files = self.files,
        );
        sqlx::query(&sql).execute(&*self.db).await?;
        Ok(())
    }

    async fn commit(&self, record: PendingFile, tail: Bytes, tail_index: i64) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        if !tail.is_empty() {
            insert_chunk(&mut *tx, &self.chunks, record.id, tail_index, &tail).await?;
        }

        let sql = format!(
            "INSERT INTO {}
             (id, filename, content_type, length, chunk_size, md5, upload_date, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            self.files
        );
        sqlx::query(&sql)
            .bind(record.id)
            .bind(&record.filename)
            .bind(&record.content_type)
            .bind(record.size)
            .bind(self.chunk_size as i64)
            .bind(&record.md5)
            .bind(Utc::now())
            .bind(Json(&record.metadata))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("finalized {} ({} bytes) as {}", record.filename, record.size, record.id);
        Ok(())
    }

    async fn discard_chunks(&self, id: Uuid) -> StoreResult<()> {
        delete_chunks(&self.db, &self.chunks, id).await?;
        Ok(())
    }
}

impl BlobWriter {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes accepted so far.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Append `data`, persisting every chunk that fills up.
    pub async fn write(&mut self, data: Bytes) -> StoreResult<()> {
        self.size += data.len() as i64;
        self.digest.consume(&data);
        self.buffer.extend_from_slice(&data);

        while self.buffer.len() >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size).freeze();
            insert_chunk(&*self.db, &self.chunks, self.id, self.next_chunk, &chunk).await?;
            self.next_chunk += 1;
        }
        Ok(())
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("upload {} dropped outside a runtime, its chunks are left behind", self.id);
            return;
        };

        let db = self.db.clone();
        let chunks = self.chunks.clone();
        let id = self.id;
        runtime.spawn(async move {
            match delete_chunks(&db, &chunks, id).await {
                Ok(()) => debug!("discarded chunks of abandoned upload {}", id),
                Err(err) => warn!("failed to discard chunks of abandoned upload {}: {}", id, err),
            }
        });
    }
}

impl BlobReader {
    pub fn into_parts(self) -> (ObjectMeta, BoxStream<'static, io::Result<Bytes>>) {
        (self.meta, self.content)
    }
}

struct PendingFile {
    id: Uuid,
    filename: String,
    content_type: String,
    size: i64,
    md5: String,
    metadata: Map<String, Value>,
}

async fn insert_chunk<'e, E>(
    executor: E,
    table: &str,
    id: Uuid,
    n: i64,
    data: &[u8],
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("INSERT INTO {table} (files_id, n, data) VALUES (?, ?, ?)");
    sqlx::query(&sql)
        .bind(id)
        .bind(n)
        .bind(data)
        .execute(executor)
        .await?;
    Ok(())
}

async fn delete_chunks(db: &SqlitePool, table: &str, id: Uuid) -> Result<(), sqlx::Error> {
    let sql = format!("DELETE FROM {table} WHERE files_id = ?");
    sqlx::query(&sql).bind(id).execute(db).await?;
    Ok(())
}

/// One page of `find_by_metadata`; the cursor is `None` once exhausted.
async fn next_page(
    db: &SqlitePool,
    files: &str,
    filter: &MetadataFilter,
    cursor: Option<i64>,
) -> StoreResult<Option<(Vec<FileRow>, Option<i64>)>> {
    let Some(after) = cursor else {
        return Ok(None);
    };
    let rows = fetch_page(db, files, filter, after).await?;
    let next = if (rows.len() as i64) < FIND_BATCH_SIZE {
        None
    } else {
        rows.last().map(|row| row.seq)
    };
    Ok(Some((rows, next)))
}

async fn next_chunk(
    db: &SqlitePool,
    chunks: &str,
    id: Uuid,
    n: i64,
    total: i64,
) -> io::Result<Option<(Bytes, i64)>> {
    if n >= total {
        return Ok(None);
    }
    let data = fetch_chunk(db, chunks, id, n).await?;
    Ok(Some((data, n + 1)))
}

async fn fetch_page(
    db: &SqlitePool,
    files: &str,
    filter: &MetadataFilter,
    after: i64,
) -> StoreResult<Vec<FileRow>> {
    let sql = format!(
        "SELECT {FILE_COLUMNS} FROM {files} WHERE {} = ? AND seq > ? ORDER BY seq LIMIT ?",
        filter.expression()?
    );
    let rows = sqlx::query_as::<_, FileRow>(&sql)
        .bind(&filter.value)
        .bind(after)
        .bind(FIND_BATCH_SIZE)
        .fetch_all(db)
        .await?;
    Ok(rows)
}

async fn fetch_chunk(db: &SqlitePool, chunks: &str, id: Uuid, n: i64) -> io::Result<Bytes> {
    let sql = format!("SELECT data FROM {chunks} WHERE files_id = ? AND n = ?");
    let data = sqlx::query_scalar::<_, Vec<u8>>(&sql)
        .bind(id)
        .bind(n)
        .fetch_optional(db)
        .await
        .map_err(io::Error::other)?;

    match data {
        Some(data) => Ok(Bytes::from(data)),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("chunk {n} of object {id} is missing"),
        )),
    }
}

fn chunk_count(size: i64, chunk_size: i64) -> i64 {
    if size <= 0 {
        return 0;
    }
    let chunk_size = chunk_size.max(1);
    (size + chunk_size - 1) / chunk_size
}

/// Field names are spliced into SQL, so only identifiers are accepted.
fn metadata_expression(field: &str) -> StoreResult<String> {
    if !is_identifier(field) {
        return Err(StoreError::InvalidField(field.to_string()));
    }
    Ok(format!("json_extract(metadata, '$.{field}')"))
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}


#[cfg(test)]
mod tests {
    use super::testing::memory_store;
    use super::*;

    async fn put(store: &BlobStore, name: &str, content: &[u8], bucket: Option<&str>) -> Uuid {
        let mut writer = store.create(name);
        for piece in content.chunks(3) {
            writer.write(Bytes::copy_from_slice(piece)).await.unwrap();
        }
        let mut metadata = Map::new();
        if let Some(bucket) = bucket {
            metadata.insert("bucket".into(), Value::from(bucket));
        }
        store.finalize(writer, "", "text/plain", metadata).await.unwrap()
    }

    async fn read_all(store: &BlobStore, id: Uuid) -> Vec<u8> {
        let reader = store.open_read_stream(id).await.unwrap().unwrap();
        let (_, content) = reader.into_parts();
        let pieces: Vec<Bytes> = content.try_collect().await.unwrap();
        pieces.concat()
    }

    async fn chunk_rows(store: &BlobStore) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM fs_chunks")
            .fetch_one(&*store.db)
            .await
            .unwrap()
    }

    #[test]
    fn namespace_joins_non_empty_parts() {
        assert_eq!(Namespace::new("storage", "fs").unwrap().as_str(), "storage_fs");
        assert_eq!(Namespace::new("", "fs").unwrap().as_str(), "fs");
        assert!(Namespace::new("", "").is_err());
        assert!(Namespace::new("db; DROP", "fs").is_err());
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 4), 0);
        assert_eq!(chunk_count(4, 4), 1);
        assert_eq!(chunk_count(5, 4), 2);
    }

    #[tokio::test]
    async fn content_survives_chunk_boundaries() {
        let store = memory_store(4).await;
        let content = b"the quick brown fox jumps";
        let id = put(&store, "fox.txt", content, None).await;

        let meta = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(meta.filename, "fox.txt");
        assert_eq!(meta.size, content.len() as i64);
        assert_eq!(meta.chunk_size, 4);
        assert_eq!(meta.checksum, format!("{:x}", md5::compute(content)));
        assert_eq!(chunk_rows(&store).await, 7);

        assert_eq!(read_all(&store, id).await, content);
    }

    #[tokio::test]
    async fn empty_upload_has_no_chunks() {
        let store = memory_store(4).await;
        let id = put(&store, "empty", b"", None).await;

        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().size, 0);
        assert!(read_all(&store, id).await.is_empty());
    }

    #[tokio::test]
    async fn abort_discards_written_chunks() {
        let store = memory_store(4).await;
        let mut writer = store.create("partial");
        writer.write(Bytes::from_static(b"0123456789")).await.unwrap();
        let id = writer.id();
        assert_eq!(chunk_rows(&store).await, 2);

        store.abort(writer).await.unwrap();

        assert_eq!(chunk_rows(&store).await, 0);
        assert!(store.find_by_id(id).await.unwrap().is_none());
        assert!(store.open_read_stream(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_writer_discards_its_chunks() {
        let store = memory_store(4).await;
        let mut writer = store.create("cancelled");
        writer.write(Bytes::from_static(b"0123456789")).await.unwrap();
        assert_eq!(chunk_rows(&store).await, 2);

        drop(writer);

        // the discard runs on a spawned task
        let mut remaining = chunk_rows(&store).await;
        for _ in 0..50 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            remaining = chunk_rows(&store).await;
        }
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn finalized_writer_keeps_its_chunks() {
        let store = memory_store(4).await;
        let id = put(&store, "kept.txt", b"0123456789", None).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(chunk_rows(&store).await, 3);
        assert_eq!(read_all(&store, id).await, b"0123456789");
    }

    #[tokio::test]
    async fn metadata_queries_page_through_all_matches_in_order() {
        let store = memory_store(64).await;
        let total = FIND_BATCH_SIZE as usize + 5;
        let mut expected = Vec::new();
        for i in 0..total {
            expected.push(put(&store, &format!("f{i}"), b"x", Some("b1")).await);
        }
        put(&store, "other", b"y", Some("b2")).await;

        let found: Vec<Uuid> = store
            .find_by_metadata(MetadataFilter::eq("bucket", "b1"))
            .map_ok(|meta| meta.id)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(found, expected);
        let filter = MetadataFilter::eq("bucket", "b2");
        assert_eq!(store.count_by_metadata(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ensure_index_is_idempotent_and_rejects_bad_fields() {
        let store = memory_store(64).await;

        store.ensure_index("bucket").await.unwrap();
        store.ensure_index("bucket").await.unwrap();

        assert!(matches!(
            store.ensure_index("bucket') --").await,
            Err(StoreError::InvalidField(_))
        ));
    }
}
