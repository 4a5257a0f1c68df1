use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{memory::InMemory, ObjectStore};
use url::Url;

use crate::config::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("invalid storage DSN: {0}")]
    InvalidDsn(String),

    #[error("bucket `{0}` is unavailable: {1}")]
    BucketUnavailable(String, String),

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    #[error("failed to rewrite presigned URL: {0}")]
    UrlRewrite(String),
}

/// Per-key result of a bulk delete.
#[derive(Debug)]
pub struct DeleteOutcome {
    pub key: String,
    pub result: Result<(), BlobStoreError>,
}

impl DeleteOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Object payload store.
///
/// Presigning never touches the payload path of the services: callers upload
/// and download directly against the store with the URLs minted here.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Verify the bucket exists and is reachable before handing out URLs
    /// against it.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobStoreError>;

    /// Mint a single-use upload URL valid for `expires_in`.
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, BlobStoreError>;

    /// Mint a download URL valid for `expires_in`.
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, BlobStoreError>;

    /// Delete a batch of keys in one bucket. A missing object counts as
    /// success; everything else is reported per key so callers can retain
    /// the records whose payload may still exist.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Vec<DeleteOutcome>;
}

/// In-memory store used by tests and single-process setups. Presigned URLs
/// are fabricated `memory://` tokens since there is no HTTP endpoint to
/// sign against.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    buckets: Mutex<HashMap<String, Arc<InMemory>>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_store(&self, bucket: &str) -> Arc<InMemory> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(InMemory::new()))
            .clone()
    }

    fn check_failure(&self, bucket: &str) -> Result<(), BlobStoreError> {
        if self.failing.lock().unwrap().contains(bucket) {
            return Err(BlobStoreError::BucketUnavailable(
                bucket.to_string(),
                "injected failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Make every operation against `bucket` fail until cleared.
    pub fn inject_failure(&self, bucket: &str) {
        self.failing.lock().unwrap().insert(bucket.to_string());
    }

    pub fn clear_failure(&self, bucket: &str) {
        self.failing.lock().unwrap().remove(bucket);
    }

    /// Simulate a client uploading through its presigned URL.
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        payload: Bytes,
    ) -> Result<(), BlobStoreError> {
        self.check_failure(bucket)?;
        let store = self.bucket_store(bucket);
        store.put(&Path::from(key), payload.into()).await?;
        Ok(())
    }

    pub async fn contains(&self, bucket: &str, key: &str) -> bool {
        let store = self.bucket_store(bucket);
        store.head(&Path::from(key)).await.is_ok()
    }

    fn fabricate_url(bucket: &str, key: &str, expires_in: Duration) -> String {
        format!(
            "memory://{bucket}/{key}?expires={}",
            expires_in.as_secs()
        )
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobStoreError> {
        self.check_failure(bucket)?;
        self.bucket_store(bucket);
        Ok(())
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, BlobStoreError> {
        self.check_failure(bucket)?;
        self.bucket_store(bucket);
        Ok(Self::fabricate_url(bucket, key, expires_in))
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, BlobStoreError> {
        self.check_failure(bucket)?;
        Ok(Self::fabricate_url(bucket, key, expires_in))
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Vec<DeleteOutcome> {
        if let Err(e) = self.check_failure(bucket) {
            // Whole-bucket failure: report every key as failed
            let mut outcomes: Vec<DeleteOutcome> = Vec::with_capacity(keys.len());
            for key in keys {
                outcomes.push(DeleteOutcome {
                    key: key.clone(),
                    result: Err(BlobStoreError::BucketUnavailable(
                        bucket.to_string(),
                        e.to_string(),
                    )),
                });
            }
            return outcomes;
        }

        let store = self.bucket_store(bucket);
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let result = match store.delete(&Path::from(key.as_str())).await {
                Ok(()) => Ok(()),
                // Already gone is as good as deleted
                Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(BlobStoreError::from(e)),
            };
            outcomes.push(DeleteOutcome {
                key: key.clone(),
                result,
            });
        }
        outcomes
    }
}

/// S3-compatible store addressed as `s3://[key:secret@]host[:port][?region=..]`.
///
/// One client is built per bucket and cached, since the underlying client
/// binds the bucket name at construction time.
pub struct S3BlobStore {
    dsn: Url,
    clients: Mutex<HashMap<String, Arc<AmazonS3>>>,
}

impl S3BlobStore {
    pub fn new(dsn: &str) -> Result<Self, BlobStoreError> {
        let dsn = Url::parse(dsn).map_err(|e| BlobStoreError::InvalidDsn(e.to_string()))?;
        if dsn.host_str().is_none_or(str::is_empty) {
            return Err(BlobStoreError::InvalidDsn(
                "missing host in storage DSN".to_string(),
            ));
        }
        Ok(Self {
            dsn,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client(&self, bucket: &str) -> Result<Arc<AmazonS3>, BlobStoreError> {
        if let Some(client) = self.clients.lock().unwrap().get(bucket) {
            return Ok(client.clone());
        }

        let host = self.dsn.host_str().unwrap_or_default();
        let endpoint = match self.dsn.port() {
            Some(port) => format!("http://{host}:{port}"),
            None => format!("https://{host}"),
        };
        let region = self
            .dsn
            .query_pairs()
            .find(|(k, _)| k == "region")
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| "us-east-1".to_string());

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_endpoint(endpoint)
            .with_region(region)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(true);
        if !self.dsn.username().is_empty() {
            builder = builder.with_access_key_id(self.dsn.username());
        }
        if let Some(secret) = self.dsn.password() {
            builder = builder.with_secret_access_key(secret);
        }

        let client = Arc::new(builder.build()?);
        self.clients
            .lock()
            .unwrap()
            .insert(bucket.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobStoreError> {
        let client = self.client(bucket)?;

        // A one-entry listing doubles as a reachability and existence probe
        let mut listing = client.list(None);
        match listing.next().await {
            None | Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(BlobStoreError::BucketUnavailable(
                bucket.to_string(),
                e.to_string(),
            )),
        }
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, BlobStoreError> {
        let client = self.client(bucket)?;
        let url = client
            .signed_url(http::Method::PUT, &Path::from(key), expires_in)
            .await?;
        Ok(url.to_string())
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, BlobStoreError> {
        let client = self.client(bucket)?;
        let url = client
            .signed_url(http::Method::GET, &Path::from(key), expires_in)
            .await?;
        Ok(url.to_string())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Vec<DeleteOutcome> {
        let client = match self.client(bucket) {
            Ok(client) => client,
            Err(e) => {
                let reason = e.to_string();
                return keys
                    .iter()
                    .map(|key| DeleteOutcome {
                        key: key.clone(),
                        result: Err(BlobStoreError::BucketUnavailable(
                            bucket.to_string(),
                            reason.clone(),
                        )),
                    })
                    .collect();
            }
        };

        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let result = match client.delete(&Path::from(key.as_str())).await {
                Ok(()) => Ok(()),
                Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(BlobStoreError::from(e)),
            };
            outcomes.push(DeleteOutcome {
                key: key.clone(),
                result,
            });
        }
        outcomes
    }
}

/// Rewrite the endpoint of a presigned URL to the configured public host,
/// keeping path, query and signature intact. The store signs URLs against
/// its internal address, which browsers outside the deployment cannot reach.
pub fn rewrite_endpoint(signed_url: &str, public: &str) -> Result<String, BlobStoreError> {
    let mut url =
        Url::parse(signed_url).map_err(|e| BlobStoreError::UrlRewrite(e.to_string()))?;

    let public = if public.contains("://") {
        public.to_string()
    } else {
        format!("{}://{public}", url.scheme())
    };
    let target = Url::parse(&public).map_err(|e| BlobStoreError::UrlRewrite(e.to_string()))?;

    url.set_scheme(target.scheme())
        .map_err(|_| BlobStoreError::UrlRewrite(format!("invalid scheme in `{public}`")))?;
    url.set_host(target.host_str())
        .map_err(|e| BlobStoreError::UrlRewrite(e.to_string()))?;
    url.set_port(target.port())
        .map_err(|_| BlobStoreError::UrlRewrite(format!("invalid port in `{public}`")))?;

    Ok(url.into())
}

/// Create a blob store backend from storage configuration.
pub fn create_blob_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, BlobStoreError> {
    if config.dsn.starts_with("memory://") {
        Ok(Arc::new(MemoryBlobStore::new()))
    } else if config.dsn.starts_with("s3://") {
        Ok(Arc::new(S3BlobStore::new(&config.dsn)?))
    } else {
        Err(BlobStoreError::InvalidDsn(config.dsn.clone()))
    }
}
