//! Object store client for raw cohort files
//!
//! A narrow capability trait over bucket-style blob storage so the pipeline
//! can run against S3/MinIO in production and an in-memory store in tests.

use crate::config::ObjectStoreConfig;
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, PutMultipartOptions, WriteMultipart};
use std::sync::Arc;
use tracing::debug;

/// Streaming object body: the pipeline never buffers a whole file.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// One entry from a prefix listing.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// Reference to a successfully persisted raw file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredObject {
    pub key: String,
    pub content_type: String,
    pub bytes: u64,
}

/// Durable key/value blob storage with bucket semantics.
///
/// The bucket is bound when the adapter is constructed; keys are
/// `{cohort}/{filename}` style paths within it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create-if-absent where the backend supports creation, otherwise
    /// verify the configured bucket is reachable.
    async fn ensure_bucket(&self) -> Result<()>;

    /// Streams `data` into the object at `key`, overwriting any previous
    /// object under the same key. Returns the number of bytes written.
    async fn put(&self, key: &str, data: ByteStream, content_type: &str) -> Result<u64>;

    /// Opens the object at `key` as a byte stream.
    async fn get(&self, key: &str) -> Result<ByteStream>;

    /// Lists every key under `prefix`, across backend pagination.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;
}

/// [`BlobStore`] adapter over any [`object_store::ObjectStore`] backend.
pub struct ObjectStoreBlobs {
    store: Arc<dyn object_store::ObjectStore>,
    bucket: String,
}

impl ObjectStoreBlobs {
    pub fn new(store: Arc<dyn object_store::ObjectStore>, bucket: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
        }
    }

    /// Builds the backend selected by `config.backend`.
    ///
    /// For the `local` backend the bucket directory is created if absent; for
    /// `s3` the bucket must already exist (provisioning S3 buckets is an
    /// infrastructure concern, checked by [`BlobStore::ensure_bucket`]).
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self> {
        let store: Arc<dyn object_store::ObjectStore> = match config.backend.as_str() {
            "s3" => {
                let builder = object_store::aws::AmazonS3Builder::new()
                    .with_bucket_name(&config.bucket)
                    .with_region(&config.region)
                    .with_endpoint(&config.endpoint)
                    .with_access_key_id(&config.access_key)
                    .with_secret_access_key(&config.secret_key)
                    .with_allow_http(config.endpoint.starts_with("http://"));
                Arc::new(builder.build()?)
            }
            "local" => {
                let root = config.data_dir.join("objects").join(&config.bucket);
                std::fs::create_dir_all(&root)?;
                Arc::new(object_store::local::LocalFileSystem::new_with_prefix(root)?)
            }
            "memory" => Arc::new(object_store::memory::InMemory::new()),
            other => {
                return Err(StorageError::UnknownBackend {
                    backend: other.to_string(),
                }
                .into());
            }
        };
        Ok(Self::new(store, &config.bucket))
    }

    /// In-memory store, for tests and dry runs.
    pub fn in_memory(bucket: &str) -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), bucket)
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobs {
    async fn ensure_bucket(&self) -> Result<()> {
        // Local/memory backends were created reachable in the constructor;
        // for S3 this probes that the configured bucket answers a listing.
        let mut listing = self.store.list(None);
        match listing.next().await {
            None | Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(StorageError::BucketUnavailable {
                bucket: self.bucket.clone(),
                message: e.to_string(),
            }
            .into()),
        }
    }

    async fn put(&self, key: &str, mut data: ByteStream, content_type: &str) -> Result<u64> {
        let location = ObjectPath::from(key);
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let opts = PutMultipartOptions {
            attributes,
            ..Default::default()
        };

        let upload = self.store.put_multipart_opts(&location, opts).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut written = 0u64;
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(|e| StorageError::PutFailed {
                key: key.to_string(),
                message: e.to_string(),
            })?;
            written += chunk.len() as u64;
            writer.write(&chunk);
            // Bound buffered upload parts so large files stream.
            writer.wait_for_capacity(8).await?;
        }
        writer.finish().await?;
        debug!("Stored {} ({} bytes, {})", key, written, content_type);
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let location = ObjectPath::from(key);
        let result = self.store.get(&location).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => crate::error::IngestError::Storage(
                StorageError::ObjectNotFound {
                    key: key.to_string(),
                },
            ),
            other => other.into(),
        })?;
        let stream = result
            .into_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        Ok(stream)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let location = ObjectPath::from(prefix.trim_end_matches('/'));
        let mut listing = self.store.list(Some(&location));
        let mut entries = Vec::new();
        while let Some(meta) = listing.next().await {
            let meta = meta?;
            entries.push(ObjectEntry {
                key: meta.location.to_string(),
                last_modified: meta.last_modified,
                size: meta.size as u64,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn byte_stream(chunks: Vec<&'static [u8]>) -> ByteStream {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<std::io::Result<Bytes>>>(),
        )
        .boxed()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let blobs = ObjectStoreBlobs::in_memory("tcga");
        let written = blobs
            .put(
                "gbm/expr.tsv",
                byte_stream(vec![b"sample\tTP53\n", b"TCGA-AB-1234-01\t1.5\n"]),
                "text/tab-separated-values",
            )
            .await
            .unwrap();
        assert_eq!(written, 32);

        let mut stream = blobs.get("gbm/expr.tsv").await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"sample\tTP53\nTCGA-AB-1234-01\t1.5\n");
    }

    #[tokio::test]
    async fn missing_object_maps_to_not_found() {
        let blobs = ObjectStoreBlobs::in_memory("tcga");
        let Err(err) = blobs.get("gbm/missing.tsv").await else {
            panic!("expected a not-found error");
        };
        assert!(matches!(
            err,
            crate::error::IngestError::Storage(StorageError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_is_scoped_to_prefix() {
        let blobs = ObjectStoreBlobs::in_memory("tcga");
        blobs
            .put("gbm/a.tsv", byte_stream(vec![b"x"]), "text/plain")
            .await
            .unwrap();
        blobs
            .put("gbm/b.tsv", byte_stream(vec![b"y"]), "text/plain")
            .await
            .unwrap();
        blobs
            .put("laml/c.tsv", byte_stream(vec![b"z"]), "text/plain")
            .await
            .unwrap();

        let mut keys: Vec<String> = blobs
            .list("gbm/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["gbm/a.tsv", "gbm/b.tsv"]);
    }
}
