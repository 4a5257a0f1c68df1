//! Shared fixtures for the end-to-end lifecycle tests.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use common::blobstore::MemoryBlobStore;
use common::cache::MokaCache;
use common::config::{CacheConfig, ReclaimConfig, ServingConfig, StorageConfig, UploadConfig};
use common::ledger::Ledger;
use common::transport::{request, CallError, MemoryTransport};
use deleter::{DeleteCoordinator, DeleteWorker};
use ingester::UploadCoordinator;
use reader::MediaReader;
use reclaimer::ReclamationDaemon;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// A complete single-process deployment over in-memory backends: every
/// coordinator and worker registered on one transport, sharing one ledger,
/// blob store and cache.
pub struct TestStack {
    pub ledger: Ledger,
    pub store: Arc<MemoryBlobStore>,
    pub cache: Arc<MokaCache>,
    pub transport: Arc<MemoryTransport>,
    pub reader: MediaReader,
    pub reclaimer: ReclamationDaemon,
}

impl TestStack {
    pub async fn bootstrap() -> anyhow::Result<Self> {
        let ledger = Ledger::connect("sqlite::memory:").await?;
        let store = Arc::new(MemoryBlobStore::new());
        let cache = Arc::new(MokaCache::new(1024));
        let transport = Arc::new(MemoryTransport::default());
        let storage = StorageConfig::default();

        let upload_coordinator = Arc::new(UploadCoordinator::new(
            ledger.clone(),
            store.clone(),
            UploadConfig::default(),
            &storage,
        ));
        ingester::register_handlers(transport.as_ref(), upload_coordinator).await?;

        let delete_coordinator = Arc::new(DeleteCoordinator::new(
            ledger.clone(),
            cache.clone(),
            transport.clone(),
        ));
        deleter::register_delete_handler(transport.as_ref(), delete_coordinator).await?;
        deleter::register_delete_worker(
            transport.as_ref(),
            Arc::new(DeleteWorker::new(ledger.clone(), store.clone())),
        )
        .await?;

        let reader = MediaReader::new(
            ledger.clone(),
            store.clone(),
            cache.clone(),
            ServingConfig::default(),
            &CacheConfig::default(),
            &storage,
        );

        let reclaimer = ReclamationDaemon::new(
            ledger.clone(),
            store.clone(),
            transport.clone(),
            ReclaimConfig::default(),
        );

        Ok(Self {
            ledger,
            store,
            cache,
            transport,
            reader,
            reclaimer,
        })
    }

    /// Typed request through the shared transport.
    pub async fn call<Req, Resp>(&self, method: &str, req: &Req) -> Result<Resp, CallError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        request(self.transport.as_ref(), method, req, CALL_TIMEOUT).await
    }

    /// Wait until `check` holds or a short deadline passes. Used for effects
    /// of asynchronously processed jobs.
    pub async fn eventually<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}
