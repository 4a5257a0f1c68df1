use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use common::blobstore::{rewrite_endpoint, BlobStore};
use common::config::{StorageConfig, UploadConfig};
use common::ledger::{ConfirmOutcome, Ledger, MediaRecord};
use common::transport::{Handler, Transport, TransportError};
use common::Fault;

/// Method name for reserving an upload slot.
pub const RESERVE_UPLOAD: &str = "reserve_upload";
/// Method name for confirming a completed upload.
pub const CONFIRM_UPLOAD: &str = "confirm_upload";

/// Content types accepted for upload, with the object key extension each
/// maps to.
const ALLOWED_CONTENT_TYPES: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
];

fn extension_for(content_type: &str) -> Option<&'static str> {
    ALLOWED_CONTENT_TYPES
        .iter()
        .find(|(ct, _)| *ct == content_type)
        .map(|(_, ext)| *ext)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReserveUploadRequest {
    pub owner_id: i64,
    pub content_type: String,
    /// Reservation lifetime in milliseconds; defaults to the configured
    /// maximum when omitted.
    #[serde(default)]
    pub ttl_ms: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReserveUploadResponse {
    /// Presigned URL the client uploads the payload to.
    pub upload_url: String,
    /// Single-use token identifying the reservation at confirm time.
    pub upload_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmUploadRequest {
    pub owner_id: i64,
    pub upload_token: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmUploadResponse {
    pub id: String,
}

/// Coordinates the upload half of the media lifecycle: reserve a slot with a
/// pending ledger row plus presigned URL, then activate the row when the
/// client confirms with its token.
pub struct UploadCoordinator {
    ledger: Ledger,
    store: Arc<dyn BlobStore>,
    upload: UploadConfig,
    public_endpoint: Option<String>,
}

impl UploadCoordinator {
    pub fn new(
        ledger: Ledger,
        store: Arc<dyn BlobStore>,
        upload: UploadConfig,
        storage: &StorageConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            upload,
            public_endpoint: storage.public_endpoint.clone(),
        }
    }

    pub async fn reserve_upload(
        &self,
        request: ReserveUploadRequest,
    ) -> Result<ReserveUploadResponse, Fault> {
        let Some(extension) = extension_for(&request.content_type) else {
            return Err(Fault::validation(format!(
                "unsupported content type `{}`",
                request.content_type
            )));
        };

        let max_ttl_ms = self.upload.max_ttl.as_millis() as i64;
        let ttl_ms = request.ttl_ms.unwrap_or(max_ttl_ms);
        if ttl_ms <= 0 || ttl_ms > max_ttl_ms {
            return Err(Fault::validation(format!(
                "ttl_ms must be between 1 and {max_ttl_ms}"
            )));
        }

        // Probe the bucket before committing anything, so a down store is
        // reported as unavailable instead of leaking dead reservations.
        self.store
            .ensure_bucket(&self.upload.bucket)
            .await
            .map_err(|e| Fault::unavailable(e.to_string()))?;

        let mut record =
            MediaRecord::new_pending(request.owner_id, &self.upload.bucket, "", ttl_ms);
        record.object_key = format!("{}.{extension}", record.id);

        self.ledger
            .create_pending(&record)
            .await
            .map_err(|e| Fault::unavailable(format!("ledger: {e}")))?;

        let mut upload_url = self
            .store
            .presign_put(
                &record.bucket,
                &record.object_key,
                Duration::from_millis(ttl_ms as u64),
            )
            .await
            .map_err(|e| Fault::unavailable(e.to_string()))?;
        if let Some(public) = &self.public_endpoint {
            upload_url = rewrite_endpoint(&upload_url, public)
                .map_err(|e| Fault::unavailable(e.to_string()))?;
        }

        tracing::info!(
            id = %record.id,
            owner_id = request.owner_id,
            ttl_ms,
            "reserved upload slot"
        );

        Ok(ReserveUploadResponse {
            upload_url,
            upload_token: record.upload_token,
        })
    }

    pub async fn confirm_upload(
        &self,
        request: ConfirmUploadRequest,
    ) -> Result<ConfirmUploadResponse, Fault> {
        if request.upload_token.is_empty() {
            return Err(Fault::validation("upload_token must not be empty"));
        }

        let outcome = self
            .ledger
            .confirm(
                &request.upload_token,
                request.owner_id,
                &request.name,
                &request.description,
            )
            .await
            .map_err(|e| Fault::unavailable(format!("ledger: {e}")))?;

        match outcome {
            ConfirmOutcome::Confirmed { id } => {
                tracing::info!(id = %id, owner_id = request.owner_id, "upload confirmed");
                Ok(ConfirmUploadResponse { id })
            }
            // Unknown, already consumed and reclaimed tokens all look alike
            ConfirmOutcome::NotFound => Err(Fault::NotFound),
            ConfirmOutcome::WrongOwner => Err(Fault::Unauthorized),
        }
    }
}

struct ReserveUploadHandler {
    coordinator: Arc<UploadCoordinator>,
}

#[async_trait]
impl Handler for ReserveUploadHandler {
    async fn handle(&self, args: Value) -> Result<Value, Fault> {
        let request = serde_json::from_value(args)
            .map_err(|e| Fault::validation(format!("malformed request: {e}")))?;
        let response = self.coordinator.reserve_upload(request).await?;
        serde_json::to_value(response).map_err(|e| Fault::unavailable(e.to_string()))
    }
}

struct ConfirmUploadHandler {
    coordinator: Arc<UploadCoordinator>,
}

#[async_trait]
impl Handler for ConfirmUploadHandler {
    async fn handle(&self, args: Value) -> Result<Value, Fault> {
        let request = serde_json::from_value(args)
            .map_err(|e| Fault::validation(format!("malformed request: {e}")))?;
        let response = self.coordinator.confirm_upload(request).await?;
        serde_json::to_value(response).map_err(|e| Fault::unavailable(e.to_string()))
    }
}

/// Join the handler pools for both upload methods.
pub async fn register_handlers(
    transport: &dyn Transport,
    coordinator: Arc<UploadCoordinator>,
) -> Result<(), TransportError> {
    transport
        .register_handler(
            RESERVE_UPLOAD,
            Arc::new(ReserveUploadHandler {
                coordinator: coordinator.clone(),
            }),
        )
        .await?;
    transport
        .register_handler(CONFIRM_UPLOAD, Arc::new(ConfirmUploadHandler { coordinator }))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::blobstore::MemoryBlobStore;
    use common::config::StorageConfig;
    use common::ledger::MediaState;

    async fn coordinator() -> (UploadCoordinator, Ledger, Arc<MemoryBlobStore>) {
        let ledger = Ledger::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let coordinator = UploadCoordinator::new(
            ledger.clone(),
            store.clone(),
            UploadConfig::default(),
            &StorageConfig::default(),
        );
        (coordinator, ledger, store)
    }

    fn reserve_request() -> ReserveUploadRequest {
        ReserveUploadRequest {
            owner_id: 1,
            content_type: "image/png".to_string(),
            ttl_ms: Some(600_000),
        }
    }

    #[tokio::test]
    async fn test_reserve_creates_pending_record_with_url_and_token() {
        let (coordinator, ledger, _) = coordinator().await;

        let response = coordinator.reserve_upload(reserve_request()).await.unwrap();
        assert!(response.upload_url.starts_with("memory://images/"));
        assert!(!response.upload_token.is_empty());

        let record = ledger
            .find_pending_by_token(&response.upload_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, MediaState::PendingUpload);
        assert_eq!(record.owner_id, 1);
        assert!(record.object_key.ends_with(".png"));
        assert_eq!(record.ttl_ms, 600_000);
    }

    #[tokio::test]
    async fn test_reserve_rejects_unsupported_content_type() {
        let (coordinator, _, _) = coordinator().await;

        let err = coordinator
            .reserve_upload(ReserveUploadRequest {
                content_type: "application/pdf".to_string(),
                ..reserve_request()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::Validation(_)));
    }

    #[tokio::test]
    async fn test_reserve_rejects_out_of_range_ttl() {
        let (coordinator, _, _) = coordinator().await;

        for ttl_ms in [0, -5, i64::MAX] {
            let err = coordinator
                .reserve_upload(ReserveUploadRequest {
                    ttl_ms: Some(ttl_ms),
                    ..reserve_request()
                })
                .await
                .unwrap_err();
            assert!(matches!(err, Fault::Validation(_)), "ttl_ms = {ttl_ms}");
        }
    }

    #[tokio::test]
    async fn test_reserve_with_unreachable_store_is_unavailable() {
        let (coordinator, ledger, store) = coordinator().await;
        store.inject_failure("images");

        let err = coordinator
            .reserve_upload(reserve_request())
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::Unavailable(_)));

        // Nothing was reserved
        let far_future = chrono::Utc::now() + chrono::Duration::days(365);
        assert!(ledger.expired_pending(far_future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_activates_reservation() {
        let (coordinator, ledger, _) = coordinator().await;
        let reserved = coordinator.reserve_upload(reserve_request()).await.unwrap();

        let confirmed = coordinator
            .confirm_upload(ConfirmUploadRequest {
                owner_id: 1,
                upload_token: reserved.upload_token,
                name: "sunset".to_string(),
                description: "over the bay".to_string(),
            })
            .await
            .unwrap();

        let record = ledger.get(&confirmed.id).await.unwrap().unwrap();
        assert_eq!(record.state, MediaState::Active);
        assert_eq!(record.name, "sunset");
        assert_eq!(record.upload_token, "");
    }

    #[tokio::test]
    async fn test_confirm_with_empty_token_is_validation_fault() {
        let (coordinator, _, _) = coordinator().await;

        let err = coordinator
            .confirm_upload(ConfirmUploadRequest {
                owner_id: 1,
                upload_token: String::new(),
                name: "x".to_string(),
                description: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::Validation(_)));
    }

    #[tokio::test]
    async fn test_confirm_with_unknown_token_is_not_found() {
        let (coordinator, _, _) = coordinator().await;

        let err = coordinator
            .confirm_upload(ConfirmUploadRequest {
                owner_id: 1,
                upload_token: "nope".to_string(),
                name: "x".to_string(),
                description: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::NotFound));
    }

    #[tokio::test]
    async fn test_confirm_by_other_owner_is_unauthorized() {
        let (coordinator, _, _) = coordinator().await;
        let reserved = coordinator.reserve_upload(reserve_request()).await.unwrap();

        let err = coordinator
            .confirm_upload(ConfirmUploadRequest {
                owner_id: 2,
                upload_token: reserved.upload_token,
                name: "x".to_string(),
                description: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::Unauthorized));
    }
}
