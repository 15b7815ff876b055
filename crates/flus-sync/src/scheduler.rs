use std::sync::Arc;

use anyhow::{Context, Result};
use flus_core::ItemStatus;
use flus_storage::LinkStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::pool::SyncWorkerPool;
use crate::vault::CredentialVault;
use crate::{EngineError, SyncConfig};

/// Puts every active item on the worker pool. Returns how many were accepted.
pub async fn enqueue_active(store: &dyn LinkStore, pool: &SyncWorkerPool) -> Result<usize, EngineError> {
    let active = store.linked_accounts_with_status(ItemStatus::Active).await?;
    let total = active.len();
    let queued = active
        .iter()
        .filter(|account| pool.enqueue(&account.item_id))
        .count();
    if queued < total {
        warn!(queued, total, "periodic sync could not queue every active item");
    }
    Ok(queued)
}

/// Cron jobs for the pending-removal sweep and the periodic sync. The caller
/// starts the returned scheduler.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    vault: Arc<CredentialVault>,
    store: Arc<dyn LinkStore>,
    pool: Arc<SyncWorkerPool>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let cron = &config.removal_retry_cron;
    let removal = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let vault = vault.clone();
        Box::pin(async move {
            match vault.retry_pending_removals().await {
                Ok(sweep) if sweep.attempted > 0 => {
                    info!(deleted = sweep.deleted, still_pending = sweep.still_pending, "scheduled removal sweep");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "scheduled removal sweep failed"),
            }
        })
    })
    .with_context(|| format!("creating removal retry job for cron {cron}"))?;
    sched.add(removal).await.context("adding removal retry job")?;

    let cron = &config.periodic_sync_cron;
    let periodic = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let store = store.clone();
        let pool = pool.clone();
        Box::pin(async move {
            match enqueue_active(store.as_ref(), &pool).await {
                Ok(queued) => info!(queued, "periodic sync enqueued"),
                Err(err) => warn!(error = %err, "periodic sync enqueue failed"),
            }
        })
    })
    .with_context(|| format!("creating periodic sync job for cron {cron}"))?;
    sched.add(periodic).await.context("adding periodic sync job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncEngine;
    use crate::testkit::{harness, page, provider_txn};

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let h = harness();
        let config = SyncConfig::from_lookup(|_| None);
        assert!(!config.scheduler_enabled);
        let pool = Arc::new(SyncWorkerPool::start(Arc::new(SyncEngine::new(h.ctx.clone())), 1, 4));
        let built = maybe_build_scheduler(
            &config,
            Arc::new(CredentialVault::new(&h.ctx)),
            h.ctx.store.clone(),
            pool.clone(),
        )
        .await
        .unwrap();
        assert!(built.is_none());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_enqueue_skips_inactive_items() {
        let h = harness();
        h.seed_linked("item_1", "user-1", "access-1").await;
        h.seed_linked("item_2", "user-2", "access-2").await;
        h.store.set_status("item_2", ItemStatus::Error, None).await.unwrap();
        h.provider.add_page("access-1", None, page(vec![provider_txn("t1", 1.0, "Shops")], vec![], &[], "c1", false));
        h.provider.add_page("access-2", None, page(vec![provider_txn("t2", 1.0, "Shops")], vec![], &[], "c1", false));

        let pool = SyncWorkerPool::start(Arc::new(SyncEngine::new(h.ctx.clone())), 2, 4);
        assert_eq!(enqueue_active(&h.store, &pool).await.unwrap(), 1);
        pool.drain().await;
        assert_eq!(h.store.transactions("item_1").await.unwrap().len(), 1);
        assert!(h.store.transactions("item_2").await.unwrap().is_empty());
    }
}
