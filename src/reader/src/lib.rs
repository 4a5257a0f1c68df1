use std::sync::Arc;

use serde::{Deserialize, Serialize};

use common::blobstore::{rewrite_endpoint, BlobStore};
use common::cache::{cache_key, MediaCache};
use common::config::{CacheConfig, ServingConfig, StorageConfig};
use common::ledger::{Ledger, MediaRecord};
use common::Fault;

/// Rendered view of an active record, as served to consumers. The image URL
/// is presigned and therefore expires together with the cached entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub owner_id: i64,
    /// Creation time as unix epoch milliseconds.
    pub created_timestamp: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FeedRequest {
    #[serde(default)]
    pub limit: Option<i64>,
    /// 1-based page number.
    #[serde(default)]
    pub page: Option<i64>,
}

/// Cache-backed read path over the lifecycle ledger. Only active records are
/// ever visible here.
pub struct MediaReader {
    ledger: Ledger,
    store: Arc<dyn BlobStore>,
    cache: Arc<dyn MediaCache>,
    serving: ServingConfig,
    cache_ttl: std::time::Duration,
    public_endpoint: Option<String>,
}

impl MediaReader {
    pub fn new(
        ledger: Ledger,
        store: Arc<dyn BlobStore>,
        cache: Arc<dyn MediaCache>,
        serving: ServingConfig,
        cache_config: &CacheConfig,
        storage: &StorageConfig,
    ) -> Self {
        // A cached view must never outlive the presigned URL inside it
        let cache_ttl = cache_config.ttl.min(serving.url_ttl);
        Self {
            ledger,
            store,
            cache,
            serving,
            cache_ttl,
            public_endpoint: storage.public_endpoint.clone(),
        }
    }

    pub async fn get_media(&self, id: &str) -> Result<MediaView, Fault> {
        let key = cache_key(id);
        if let Some(cached) = self.cache.get(&key).await {
            match serde_json::from_value(cached) {
                Ok(view) => return Ok(view),
                // A stale shape in the cache is repaired by re-rendering
                Err(e) => tracing::warn!(id, "discarding malformed cache entry: {e}"),
            }
        }

        let record = self
            .ledger
            .get_active(id)
            .await
            .map_err(|e| Fault::unavailable(format!("ledger: {e}")))?
            .ok_or(Fault::NotFound)?;

        let view = self.render(&record).await?;
        match serde_json::to_value(&view) {
            Ok(value) => self.cache.put(&key, value, self.cache_ttl).await,
            Err(e) => tracing::warn!(id, "failed to encode view for caching: {e}"),
        }
        Ok(view)
    }

    pub async fn feed(&self, request: FeedRequest) -> Result<Vec<MediaView>, Fault> {
        let limit = request.limit.unwrap_or(self.serving.feed_limit);
        if limit < 1 || limit > self.serving.max_feed_limit {
            return Err(Fault::validation(format!(
                "limit must be between 1 and {}",
                self.serving.max_feed_limit
            )));
        }
        let page = request.page.unwrap_or(1);
        if page < 1 {
            return Err(Fault::validation("page must be at least 1"));
        }
        // Page numbers near i64::MAX would overflow the offset
        let offset = (page - 1)
            .checked_mul(limit)
            .ok_or_else(|| Fault::validation("page is out of range"))?;

        let records = self
            .ledger
            .list_active(limit, offset)
            .await
            .map_err(|e| Fault::unavailable(format!("ledger: {e}")))?;

        let mut views = Vec::with_capacity(records.len());
        for record in &records {
            views.push(self.render(record).await?);
        }
        Ok(views)
    }

    async fn render(&self, record: &MediaRecord) -> Result<MediaView, Fault> {
        let mut image_url = self
            .store
            .presign_get(&record.bucket, &record.object_key, self.serving.url_ttl)
            .await
            .map_err(|e| Fault::unavailable(e.to_string()))?;
        if let Some(public) = &self.public_endpoint {
            image_url =
                rewrite_endpoint(&image_url, public).map_err(|e| Fault::unavailable(e.to_string()))?;
        }

        Ok(MediaView {
            id: record.id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            image_url,
            owner_id: record.owner_id,
            created_timestamp: record.created_at.timestamp_millis(),
        })
    }
}
