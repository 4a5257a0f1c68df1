use std::sync::Arc;

use anyhow::Context;

use common::blobstore::create_blob_store;
use common::config::Configuration;
use common::ledger::Ledger;
use common::transport::create_transport;
use ingester::{register_handlers, UploadCoordinator};

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

    let coordinator = Arc::new(UploadCoordinator::new(
        ledger,
        store,
        config.upload.clone(),
        &config.storage,
    ));
    register_handlers(transport.as_ref(), coordinator)
        .await
        .context("failed to register upload handlers")?;

    tracing::info!(bucket = %config.upload.bucket, "ingester ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("ingester shutting down");

    Ok(())
}
