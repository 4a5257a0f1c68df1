use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use common::blobstore::BlobStore;
use common::cache::{cache_key, MediaCache};
use common::ledger::{Ledger, MediaState};
use common::transport::{enqueue, Handler, Transport, TransportError, Worker};
use common::Fault;

/// Method name for requesting deletion of an active record.
pub const REQUEST_DELETE: &str = "request_delete";
/// Job queue carrying deletion work to the worker pool.
pub const DELETE_QUEUE: &str = "media_delete";

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestDelete {
    pub owner_id: i64,
    pub id: String,
}

/// At-least-once deletion job. Workers must treat it as idempotent.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteJob {
    pub id: String,
}

/// Accepts deletion requests: authorizes the caller, flips the record to
/// pending_delete and hands the payload removal to the worker pool.
pub struct DeleteCoordinator {
    ledger: Ledger,
    cache: Arc<dyn MediaCache>,
    transport: Arc<dyn Transport>,
}

impl DeleteCoordinator {
    pub fn new(ledger: Ledger, cache: Arc<dyn MediaCache>, transport: Arc<dyn Transport>) -> Self {
        Self {
            ledger,
            cache,
            transport,
        }
    }

    pub async fn request_delete(&self, request: RequestDelete) -> Result<(), Fault> {
        let record = self
            .ledger
            .get(&request.id)
            .await
            .map_err(|e| Fault::unavailable(format!("ledger: {e}")))?;

        // Only active records are visible for deletion; pending states and
        // missing rows all answer the same way.
        let Some(record) = record else {
            return Err(Fault::NotFound);
        };
        if record.state != MediaState::Active {
            return Err(Fault::NotFound);
        }
        if record.owner_id != request.owner_id {
            return Err(Fault::Unauthorized);
        }

        // Invalidate before the flip: once the record leaves active, no
        // reader may be handed the stale cached view.
        self.cache.invalidate(&cache_key(&request.id)).await;

        let flipped = self
            .ledger
            .begin_delete(&request.id, request.owner_id)
            .await
            .map_err(|e| Fault::unavailable(format!("ledger: {e}")))?;
        if !flipped {
            // Lost a race with a concurrent delete
            return Err(Fault::NotFound);
        }

        // The flip is durable; if this publish is lost, the redrive sweep
        // re-enqueues the job.
        if let Err(e) = enqueue(
            self.transport.as_ref(),
            DELETE_QUEUE,
            &DeleteJob {
                id: request.id.clone(),
            },
        )
        .await
        {
            tracing::warn!(id = %request.id, "failed to enqueue delete job: {e}");
        }

        tracing::info!(id = %request.id, owner_id = request.owner_id, "deletion accepted");
        Ok(())
    }
}

struct RequestDeleteHandler {
    coordinator: Arc<DeleteCoordinator>,
}

#[async_trait]
impl Handler for RequestDeleteHandler {
    async fn handle(&self, args: Value) -> Result<Value, Fault> {
        let request = serde_json::from_value(args)
            .map_err(|e| Fault::validation(format!("malformed request: {e}")))?;
        self.coordinator.request_delete(request).await?;
        Ok(Value::Null)
    }
}

pub async fn register_delete_handler(
    transport: &dyn Transport,
    coordinator: Arc<DeleteCoordinator>,
) -> Result<(), TransportError> {
    transport
        .register_handler(REQUEST_DELETE, Arc::new(RequestDeleteHandler { coordinator }))
        .await
}

/// Removes the payload and then the ledger row for each delete job.
///
/// Order matters: the row is the only pointer to the object, so it may only
/// disappear once the payload is gone. A failure leaves the job unacked for
/// redelivery.
pub struct DeleteWorker {
    ledger: Ledger,
    store: Arc<dyn BlobStore>,
}

impl DeleteWorker {
    pub fn new(ledger: Ledger, store: Arc<dyn BlobStore>) -> Self {
        Self { ledger, store }
    }
}

#[async_trait]
impl Worker for DeleteWorker {
    async fn process(&self, payload: Value) -> anyhow::Result<()> {
        let job: DeleteJob = match serde_json::from_value(payload) {
            Ok(job) => job,
            Err(e) => {
                // Retrying cannot fix a malformed job
                tracing::error!("dropping malformed delete job: {e}");
                return Ok(());
            }
        };

        let Some(record) = self.ledger.get(&job.id).await? else {
            // Redelivery of an already completed job
            tracing::debug!(id = %job.id, "delete job for missing record, nothing to do");
            return Ok(());
        };
        if record.state != MediaState::PendingDelete {
            tracing::warn!(id = %job.id, state = record.state.as_str(), "delete job for record not pending delete, skipping");
            return Ok(());
        }

        let outcomes = self
            .store
            .delete_objects(&record.bucket, std::slice::from_ref(&record.object_key))
            .await;
        for outcome in &outcomes {
            if let Err(e) = &outcome.result {
                anyhow::bail!("failed to delete object {}/{}: {e}", record.bucket, outcome.key);
            }
        }

        self.ledger.remove(&job.id).await?;
        tracing::info!(id = %job.id, "record reclaimed after deletion");
        Ok(())
    }
}

pub async fn register_delete_worker(
    transport: &dyn Transport,
    worker: Arc<DeleteWorker>,
) -> Result<(), TransportError> {
    transport.register_worker(DELETE_QUEUE, worker).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::blobstore::MemoryBlobStore;
    use common::cache::MokaCache;
    use common::ledger::MediaRecord;
    use common::transport::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        ledger: Ledger,
        store: Arc<MemoryBlobStore>,
        cache: Arc<MokaCache>,
        transport: Arc<MemoryTransport>,
        coordinator: DeleteCoordinator,
        worker: DeleteWorker,
    }

    async fn fixture() -> Fixture {
        let ledger = Ledger::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let cache = Arc::new(MokaCache::new(16));
        let transport = Arc::new(MemoryTransport::default());

        let coordinator = DeleteCoordinator::new(
            ledger.clone(),
            cache.clone(),
            transport.clone(),
        );
        let worker = DeleteWorker::new(ledger.clone(), store.clone());

        Fixture {
            ledger,
            store,
            cache,
            transport,
            coordinator,
            worker,
        }
    }

    async fn active_record(fixture: &Fixture, owner_id: i64) -> MediaRecord {
        let record = MediaRecord::new_pending(owner_id, "images", "obj.png", 600_000);
        fixture.ledger.create_pending(&record).await.unwrap();
        fixture
            .ledger
            .confirm(&record.upload_token, owner_id, "name", "")
            .await
            .unwrap();
        fixture
            .store
            .put("images", "obj.png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        fixture.ledger.get(&record.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_request_delete_flips_state_and_clears_cache() {
        let fixture = fixture().await;
        let record = active_record(&fixture, 1).await;

        fixture
            .cache
            .put(&cache_key(&record.id), json!({"id": record.id}), Duration::from_secs(60))
            .await;

        fixture
            .coordinator
            .request_delete(RequestDelete {
                owner_id: 1,
                id: record.id.clone(),
            })
            .await
            .unwrap();

        assert!(fixture.cache.get(&cache_key(&record.id)).await.is_none());
        let loaded = fixture.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, MediaState::PendingDelete);
    }

    #[tokio::test]
    async fn test_request_delete_by_non_owner_is_unauthorized() {
        let fixture = fixture().await;
        let record = active_record(&fixture, 1).await;

        let err = fixture
            .coordinator
            .request_delete(RequestDelete {
                owner_id: 2,
                id: record.id.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::Unauthorized));

        // Record untouched
        let loaded = fixture.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, MediaState::Active);
    }

    #[tokio::test]
    async fn test_request_delete_of_missing_or_pending_record_is_not_found() {
        let fixture = fixture().await;

        let err = fixture
            .coordinator
            .request_delete(RequestDelete {
                owner_id: 1,
                id: "missing".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::NotFound));

        // Unconfirmed reservations are invisible to deletion
        let pending = MediaRecord::new_pending(1, "images", "p.png", 600_000);
        fixture.ledger.create_pending(&pending).await.unwrap();
        let err = fixture
            .coordinator
            .request_delete(RequestDelete {
                owner_id: 1,
                id: pending.id.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::NotFound));
    }

    #[tokio::test]
    async fn test_second_request_delete_is_not_found() {
        let fixture = fixture().await;
        let record = active_record(&fixture, 1).await;

        let request = || RequestDelete {
            owner_id: 1,
            id: record.id.clone(),
        };
        fixture.coordinator.request_delete(request()).await.unwrap();
        let err = fixture.coordinator.request_delete(request()).await.unwrap_err();
        assert!(matches!(err, Fault::NotFound));
    }

    #[tokio::test]
    async fn test_worker_removes_payload_then_row() {
        let fixture = fixture().await;
        let record = active_record(&fixture, 1).await;
        fixture
            .coordinator
            .request_delete(RequestDelete {
                owner_id: 1,
                id: record.id.clone(),
            })
            .await
            .unwrap();

        fixture
            .worker
            .process(json!({"id": record.id}))
            .await
            .unwrap();

        assert!(!fixture.store.contains("images", "obj.png").await);
        assert!(fixture.ledger.get(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_keeps_row_when_store_delete_fails() {
        let fixture = fixture().await;
        let record = active_record(&fixture, 1).await;
        fixture
            .coordinator
            .request_delete(RequestDelete {
                owner_id: 1,
                id: record.id.clone(),
            })
            .await
            .unwrap();

        fixture.store.inject_failure("images");
        let result = fixture.worker.process(json!({"id": record.id})).await;
        assert!(result.is_err());

        // The row survives so a redelivered job can finish the work
        assert!(fixture.ledger.get(&record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_worker_is_idempotent_for_reclaimed_records() {
        let fixture = fixture().await;
        assert!(fixture
            .worker
            .process(json!({"id": "already-gone"}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_worker_drops_malformed_jobs() {
        let fixture = fixture().await;
        assert!(fixture.worker.process(json!({"nope": true})).await.is_ok());
    }

    #[tokio::test]
    async fn test_end_to_end_through_transport() {
        let fixture = fixture().await;
        let record = active_record(&fixture, 1).await;

        register_delete_handler(
            fixture.transport.as_ref(),
            Arc::new(DeleteCoordinator::new(
                fixture.ledger.clone(),
                fixture.cache.clone(),
                fixture.transport.clone(),
            )),
        )
        .await
        .unwrap();
        register_delete_worker(
            fixture.transport.as_ref(),
            Arc::new(DeleteWorker::new(fixture.ledger.clone(), fixture.store.clone())),
        )
        .await
        .unwrap();

        common::transport::request::<_, Value>(
            fixture.transport.as_ref(),
            REQUEST_DELETE,
            &RequestDelete {
                owner_id: 1,
                id: record.id.clone(),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        // The worker runs asynchronously; poll for the reclamation
        for _ in 0..100 {
            if fixture.ledger.get(&record.id).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fixture.ledger.get(&record.id).await.unwrap().is_none());
        assert!(!fixture.store.contains("images", "obj.png").await);
    }
}
