use std::sync::Arc;

use anyhow::Context;

use common::blobstore::create_blob_store;
use common::cache::create_cache;
use common::config::Configuration;
use common::ledger::Ledger;
use common::transport::create_transport;
use deleter::{register_delete_handler, register_delete_worker, DeleteCoordinator, DeleteWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Configuration::load()
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    let ledger = Ledger::connect(&config.database.dsn)
        .await
        .context("failed to connect to ledger database")?;
    let store = create_blob_store(&config.storage).context("failed to create blob store")?;
    let transport = create_transport(&config.queue)
        .await
        .context("failed to create transport")?;
    let cache = create_cache(&config.cache);

    let coordinator = Arc::new(DeleteCoordinator::new(
        ledger.clone(),
        cache,
        transport.clone(),
    ));
    register_delete_handler(transport.as_ref(), coordinator)
        .await
        .context("failed to register delete handler")?;

    let worker = Arc::new(DeleteWorker::new(ledger, store));
    register_delete_worker(transport.as_ref(), worker)
        .await
        .context("failed to register delete worker")?;

    tracing::info!("deleter ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("deleter shutting down");

    Ok(())
}
