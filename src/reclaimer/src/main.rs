use anyhow::Context;

use common::blobstore::create_blob_store;
use common::config::Configuration;
use common::ledger::Ledger;
use common::transport::create_transport;
use reclaimer::ReclamationDaemon;

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

    let daemon = ReclamationDaemon::new(ledger, store, transport, config.reclaim.clone());

    tokio::select! {
        _ = daemon.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("reclaimer shutting down");
        }
    }

    Ok(())
}
