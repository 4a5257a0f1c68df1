use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use common::blobstore::BlobStore;
use common::config::ReclaimConfig;
use common::ledger::{Ledger, MediaRecord};
use common::transport::{enqueue, Transport};
use deleter::{DeleteJob, DELETE_QUEUE};

/// Counters for one reclamation sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired reservations found.
    pub expired: usize,
    /// Rows removed after their payload was confirmed gone.
    pub removed: u64,
    /// Objects whose deletion failed; their rows are retained for the next
    /// sweep.
    pub failed: usize,
    /// Selected reservations that a concurrent confirm activated before the
    /// sweep reached them; their payloads are left alone.
    pub skipped: usize,
}

/// Periodic janitor for the lifecycle table.
///
/// Reclaims reservations whose upload window elapsed without a confirm, and
/// re-enqueues deletion jobs that appear to have been lost. Rows are removed
/// only after the store reports their payload deleted or absent, so a
/// failure leaves the pointer in place for a later sweep.
pub struct ReclamationDaemon {
    ledger: Ledger,
    store: Arc<dyn BlobStore>,
    transport: Arc<dyn Transport>,
    config: ReclaimConfig,
}

impl ReclamationDaemon {
    pub fn new(
        ledger: Ledger,
        store: Arc<dyn BlobStore>,
        transport: Arc<dyn Transport>,
        config: ReclaimConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            transport,
            config,
        }
    }

    /// One pass over expired reservations, as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> anyhow::Result<SweepStats> {
        let expired = self.ledger.expired_pending(now).await?;
        let mut stats = SweepStats {
            expired: expired.len(),
            ..SweepStats::default()
        };
        if expired.is_empty() {
            return Ok(stats);
        }

        let mut by_bucket: BTreeMap<String, Vec<MediaRecord>> = BTreeMap::new();
        for record in expired {
            by_bucket.entry(record.bucket.clone()).or_default().push(record);
        }

        let mut reclaimable: Vec<String> = Vec::new();
        for (bucket, records) in by_bucket {
            // Re-verify every claim right before touching the store: a
            // confirm that committed since the select owns the record now,
            // payload included. The token lookup only resolves rows still
            // pending with their original token.
            let mut claimed = Vec::with_capacity(records.len());
            for record in records {
                match self.ledger.find_pending_by_token(&record.upload_token).await? {
                    Some(current) if current.id == record.id => claimed.push(record),
                    _ => {
                        stats.skipped += 1;
                        tracing::debug!(id = %record.id, "reservation no longer pending, skipping");
                    }
                }
            }
            if claimed.is_empty() {
                continue;
            }

            let keys: Vec<String> = claimed.iter().map(|r| r.object_key.clone()).collect();
            let outcomes = self.store.delete_objects(&bucket, &keys).await;

            for (record, outcome) in claimed.into_iter().zip(outcomes) {
                match outcome.result {
                    Ok(()) => reclaimable.push(record.id),
                    Err(e) => {
                        stats.failed += 1;
                        tracing::warn!(
                            id = %record.id,
                            bucket = %bucket,
                            key = %outcome.key,
                            "failed to delete expired payload, retaining row: {e}"
                        );
                    }
                }
            }
        }

        stats.removed = self.ledger.remove_reclaimed(&reclaimable).await?;
        if stats.removed > 0 || stats.failed > 0 {
            tracing::info!(
                expired = stats.expired,
                removed = stats.removed,
                failed = stats.failed,
                "reclamation sweep finished"
            );
        }
        Ok(stats)
    }

    /// Re-enqueue deletion jobs for records stuck in pending_delete longer
    /// than the redrive threshold, as of `now`.
    pub async fn redrive_once(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let cutoff = now - chrono::Duration::from_std(self.config.redrive_after)?;
        let stale = self.ledger.stale_pending_deletes(cutoff).await?;

        let mut redriven = 0;
        for id in stale {
            match enqueue(self.transport.as_ref(), DELETE_QUEUE, &DeleteJob { id: id.clone() })
                .await
            {
                Ok(()) => {
                    redriven += 1;
                    tracing::info!(id = %id, "re-enqueued stale delete job");
                }
                Err(e) => tracing::warn!(id = %id, "failed to re-enqueue delete job: {e}"),
            }
        }
        Ok(redriven)
    }

    /// Sweep forever at the configured interval. Individual failures are
    /// logged and the next sweep proceeds.
    pub async fn run(&self) {
        tracing::info!(
            interval = ?self.config.sweep_interval,
            "reclamation daemon started"
        );

        loop {
            let now = Utc::now();
            if let Err(e) = self.sweep_once(now).await {
                tracing::error!("reclamation sweep failed: {e}");
            }
            if let Err(e) = self.redrive_once(now).await {
                tracing::error!("redrive pass failed: {e}");
            }
            tokio::time::sleep(self.config.sweep_interval).await;
        }
    }
}
