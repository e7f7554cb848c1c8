//! S3-compatible object store backend using rust-s3.
//!
//! Works with MinIO, AWS S3, or any S3-compatible service. Objects are stored
//! in a single bucket under one key prefix per [`Category`]:
//!
//! ```text
//! s3://<bucket>/<prefix>basebackup/main@2024-05-01T10:00:00Z.zst
//! s3://<bucket>/<prefix>wal/000000010000000000000003.zst
//! ```
//!
//! Streams no larger than one part are uploaded with a single PUT. Larger
//! streams use a multipart upload: parts are sent sequentially in order and
//! the upload is completed with the ordered part list. Any failure aborts
//! the multipart upload so no partial object becomes visible.

use crate::backend::{
    content_type_for, validate_object_name, BackendKind, BoxedReader, Category, Location,
    ObjectInfo, ObjectStream, StorageBackend, StreamRelease,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use s3::serde_types::Part;
use s3::BucketConfiguration;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Smallest part size S3 accepts for all but the last part.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default multipart part size.
pub const DEFAULT_PART_SIZE: usize = 16 * 1024 * 1024;

/// Buffer between the HTTP body and the consumer of an opened stream.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Connection settings for [`ObjectStoreBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    /// Bucket holding both categories.
    pub bucket: String,
    /// Region name (e.g., "us-east-1").
    pub region: String,
    /// Endpoint URL for MinIO or other S3-compatible services.
    /// `None` uses the AWS endpoint for `region`.
    pub endpoint: Option<String>,
    /// Access key ID. Falls back to the environment when unset.
    pub access_key: Option<String>,
    /// Secret access key. Falls back to the environment when unset.
    pub secret_key: Option<String>,
    /// Optional key prefix shared by all objects.
    pub prefix: String,
    /// Whether to use path-style addressing (required by most MinIO setups).
    pub path_style: bool,
    /// Upper bound for individual metadata requests (exists, head, list,
    /// put, delete). Streaming GET bodies are not bounded.
    pub request_timeout: Option<Duration>,
    /// Multipart part size in bytes.
    pub part_size: usize,
}

impl ObjectStoreConfig {
    /// Creates a configuration for `bucket` with MinIO-friendly defaults.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            prefix: String::new(),
            path_style: true,
            request_timeout: None,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Sets the endpoint URL.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets static credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }

    /// Sets the shared key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the multipart part size.
    #[must_use]
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }
}

/// An S3-compatible storage backend.
///
/// Each operation talks to the service directly; the backend keeps no
/// cache of listings or object metadata.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    bucket: Box<Bucket>,
    region: Region,
    credentials: Credentials,
    config: ObjectStoreConfig,
    prefix: String,
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("bucket", &self.config.bucket)
            .field("endpoint", &self.config.endpoint)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreBackend {
    /// Creates a backend from `config`.
    ///
    /// No request is sent; the bucket is checked and created lazily on the
    /// first write.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the bucket name, region, part size
    /// or credentials are unusable.
    pub fn new(config: ObjectStoreConfig) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::Config("bucket name is empty".to_string()));
        }
        if config.part_size < MIN_PART_SIZE {
            return Err(StorageError::Config(format!(
                "part size {} is below the S3 minimum of {MIN_PART_SIZE}",
                config.part_size
            )));
        }

        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse::<Region>()
                .map_err(|err| StorageError::Config(format!("invalid region: {err}")))?,
        };

        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                Credentials::new(
                    Some(access_key.as_str()),
                    Some(secret_key.as_str()),
                    None,
                    None,
                    None,
                )?
            }
            _ => Credentials::default()?,
        };

        let mut bucket = Bucket::new(&config.bucket, region.clone(), credentials.clone())?;
        if config.path_style {
            bucket = bucket.with_path_style();
        }

        Ok(Self {
            bucket,
            region,
            credentials,
            prefix: normalize_prefix(&config.prefix),
            config,
        })
    }

    /// Returns the bucket name.
    #[must_use]
    pub fn bucket_name(&self) -> &str {
        &self.config.bucket
    }

    /// Returns the full object key for `name` under `category`.
    #[must_use]
    pub fn object_key(&self, name: &str, category: Category) -> String {
        format!("{}{}", self.category_prefix(category), name)
    }

    fn category_prefix(&self, category: Category) -> String {
        format!("{}{}/", self.prefix, category.as_str())
    }

    /// Runs `request`, bounded by the configured timeout.
    ///
    /// The outer result reports a timeout; the inner one is the service's.
    async fn timed<T, F>(&self, request: F) -> StorageResult<Result<T, S3Error>>
    where
        F: Future<Output = Result<T, S3Error>>,
    {
        match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| StorageError::Timeout(limit)),
            None => Ok(request.await),
        }
    }

    /// Creates the bucket if it does not exist yet.
    async fn ensure_bucket(&self) -> StorageResult<()> {
        if self.timed(self.bucket.exists()).await?? {
            return Ok(());
        }

        info!(bucket = %self.config.bucket, "creating bucket");
        let response = if self.config.path_style {
            self.timed(Bucket::create_with_path_style(
                &self.config.bucket,
                self.region.clone(),
                self.credentials.clone(),
                BucketConfiguration::default(),
            ))
            .await??
        } else {
            self.timed(Bucket::create(
                &self.config.bucket,
                self.region.clone(),
                self.credentials.clone(),
                BucketConfiguration::default(),
            ))
            .await??
        };
        if !response.success() {
            return Err(StorageError::ObjectStore(format!(
                "failed to create bucket {}",
                self.config.bucket
            )));
        }
        Ok(())
    }

    /// Returns the object's size and content type, or `None` if it is missing.
    async fn head(&self, key: &str) -> StorageResult<Option<(i64, Option<String>)>> {
        match self.timed(self.bucket.head_object(key)).await? {
            Ok((_, 404)) | Err(S3Error::HttpFailWithBody(404, _)) => Ok(None),
            Ok((head, status)) => {
                check_status(status, "HEAD", key)?;
                Ok(Some((head.content_length.unwrap_or(0), head.content_type)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_single(&self, key: &str, data: &[u8], content_type: &str) -> StorageResult<()> {
        let response = self
            .timed(
                self.bucket
                    .put_object_with_content_type(key, data, content_type),
            )
            .await??;
        check_status(response.status_code(), "PUT", key)
    }

    async fn put_multipart(
        &self,
        key: &str,
        first_part: Vec<u8>,
        source: &mut BoxedReader,
        content_type: &str,
    ) -> StorageResult<u64> {
        let upload = self
            .timed(self.bucket.initiate_multipart_upload(key, content_type))
            .await??;
        let upload_id = upload.upload_id;
        debug!(key, upload_id = %upload_id, "multipart upload started");

        let uploaded = match self
            .upload_parts(key, &upload_id, first_part, source, content_type)
            .await
        {
            Ok((parts, total)) => self
                .timed(self.bucket.complete_multipart_upload(key, &upload_id, parts))
                .await
                .and_then(|completed| {
                    let response = completed?;
                    check_status(response.status_code(), "complete multipart", key)
                })
                .map(|()| total),
            Err(err) => Err(err),
        };

        if uploaded.is_err() {
            match self.timed(self.bucket.abort_upload(key, &upload_id)).await {
                Ok(Ok(())) => debug!(key, "multipart upload aborted"),
                Ok(Err(err)) => warn!(key, error = %err, "failed to abort multipart upload"),
                Err(err) => warn!(key, error = %err, "failed to abort multipart upload"),
            }
        }
        uploaded
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        source: &mut BoxedReader,
        content_type: &str,
    ) -> StorageResult<(Vec<Part>, u64)> {
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut chunk = first_part;
        let mut part_number = 1u32;

        while !chunk.is_empty() {
            total += chunk.len() as u64;
            let part = self
                .timed(self.bucket.put_multipart_chunk(
                    chunk,
                    key,
                    part_number,
                    upload_id,
                    content_type,
                ))
                .await??;
            parts.push(part);
            part_number += 1;
            chunk = read_chunk(source, self.config.part_size).await?;
        }

        Ok((parts, total))
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    async fn write_stream(
        &self,
        mut source: BoxedReader,
        name: &str,
        category: Category,
    ) -> StorageResult<u64> {
        validate_object_name(name)?;
        self.ensure_bucket().await?;

        let key = self.object_key(name, category);
        let content_type = content_type_for(name);
        let first = read_chunk(&mut source, self.config.part_size).await?;

        let written = if first.len() < self.config.part_size {
            let len = first.len() as u64;
            self.put_single(&key, &first, content_type).await?;
            len
        } else {
            self.put_multipart(&key, first, &mut source, content_type)
                .await?
        };

        debug!(key = %key, bytes = written, "object written");
        Ok(written)
    }

    async fn open_stream(&self, name: &str, category: Category) -> StorageResult<ObjectStream> {
        validate_object_name(name)?;
        let key = self.object_key(name, category);
        let (size, content_type) = self
            .head(&key)
            .await?
            .ok_or_else(|| StorageError::not_found(category, name))?;
        if size <= 0 {
            return Err(StorageError::EmptyObject {
                name: name.to_string(),
                size,
            });
        }

        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let bucket = self.bucket.clone();
        let producer_key = key.clone();
        let producer = tokio::spawn(async move {
            let _ = ready_tx.send(());
            let status = bucket
                .get_object_to_writer(&producer_key, &mut writer)
                .await?;
            writer.shutdown().await?;
            check_status(status, "GET", &producer_key)
        });

        // Start barrier: the chain only begins once the producer is live.
        ready_rx
            .await
            .map_err(|_| StorageError::Producer(format!("producer for {key} never started")))?;

        Ok(ObjectStream {
            reader: Box::new(reader),
            size: size.unsigned_abs(),
            content_type: content_type.or_else(|| Some(content_type_for(name).to_string())),
            release: StreamRelease::from_task(producer),
        })
    }

    async fn list(&self, category: Category) -> StorageResult<Vec<ObjectInfo>> {
        if !self.timed(self.bucket.exists()).await?? {
            return Ok(Vec::new());
        }

        let prefix = self.category_prefix(category);
        let pages = self.timed(self.bucket.list(prefix.clone(), None)).await??;

        let mut objects = Vec::new();
        for page in pages {
            for object in page.contents {
                let Some(name) = object.key.strip_prefix(&prefix) else {
                    continue;
                };
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                objects.push(ObjectInfo {
                    name: name.to_string(),
                    size: object.size,
                    location: Location::Object {
                        bucket: self.config.bucket.clone(),
                        key: object.key.clone(),
                    },
                });
            }
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete(&self, name: &str, category: Category) -> StorageResult<()> {
        validate_object_name(name)?;
        let key = self.object_key(name, category);
        // S3 reports success for deletes of missing keys.
        if self.head(&key).await?.is_none() {
            return Err(StorageError::not_found(category, name));
        }
        let response = self.timed(self.bucket.delete_object(&key)).await??;
        check_status(response.status_code(), "DELETE", &key)
    }
}

/// Reads until `limit` bytes are buffered or the source ends.
async fn read_chunk<R>(source: &mut R, limit: usize) -> StorageResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut chunk = Vec::with_capacity(limit.min(DEFAULT_PART_SIZE));
    let mut limited = (&mut *source).take(limit as u64);
    limited.read_to_end(&mut chunk).await?;
    Ok(chunk)
}

fn check_status(status: u16, action: &str, key: &str) -> StorageResult<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(StorageError::ObjectStore(format!(
            "{action} {key} returned status {status}"
        )))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}
