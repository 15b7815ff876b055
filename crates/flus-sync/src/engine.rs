use chrono::{DateTime, Utc};
use flus_core::{AccessCredential, BankAccountRecord, ItemStatus, LinkedAccount};
use flus_provider::{with_retries, ErrorClass};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::aggregate::aggregate_new;
use crate::ingest::ingest_page;
use crate::single_flight::{Flight, SingleFlight};
use crate::vault::{CredentialVault, CREDENTIAL_UNREADABLE};
use crate::{EngineContext, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Pulled until the provider reported no more pages.
    Completed,
    /// Transient provider failures outlasted the backoff; cursor and status untouched.
    RetriesExhausted,
    /// The provider rejected the credential; an active item is now `error`.
    RequiresRelink,
    /// Stopped at a page boundary on request.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub item_id: String,
    pub outcome: SyncOutcome,
    pub pages: usize,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub budget_updates: usize,
    pub cursor: Option<String>,
    /// Set for callers that attached to a sync already running for the item.
    pub joined: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn start(item_id: &str, cursor: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            item_id: item_id.to_string(),
            outcome: SyncOutcome::Completed,
            pages: 0,
            added: 0,
            modified: 0,
            removed: 0,
            budget_updates: 0,
            cursor,
            joined: false,
            started_at: now,
            finished_at: now,
        }
    }
}

/// Drives the cursor-paginated pull loop for one linked item at a time.
pub struct SyncEngine {
    ctx: EngineContext,
    vault: CredentialVault,
    flights: SingleFlight<Result<SyncReport, String>>,
}

impl SyncEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let vault = CredentialVault::new(&ctx);
        Self {
            ctx,
            vault,
            flights: SingleFlight::new(),
        }
    }

    pub fn is_syncing(&self, item_id: &str) -> bool {
        self.flights.is_running(item_id)
    }

    pub async fn sync(&self, item_id: &str) -> Result<SyncReport, EngineError> {
        let (_keep, cancel) = watch::channel(false);
        self.sync_with_cancel(item_id, cancel).await
    }

    /// A concurrent call for the same item waits for the running sync and
    /// returns its report with `joined` set. `cancel` is checked between pages.
    pub async fn sync_with_cancel(
        &self,
        item_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<SyncReport, EngineError> {
        match self.flights.claim(item_id) {
            Flight::Follower(receiver) => match SingleFlight::wait(receiver).await {
                Some(Ok(mut report)) => {
                    report.joined = true;
                    Ok(report)
                }
                Some(Err(message)) => Err(EngineError::Joined {
                    item_id: item_id.to_string(),
                    message,
                }),
                None => Err(EngineError::Joined {
                    item_id: item_id.to_string(),
                    message: "running sync ended without a result".to_string(),
                }),
            },
            Flight::Leader(lease) => {
                let span = info_span!("sync_item", item_id);
                let result = self.run(item_id, &cancel).instrument(span).await;
                lease.complete(match &result {
                    Ok(report) => Ok(report.clone()),
                    Err(err) => Err(err.to_string()),
                });
                result
            }
        }
    }

    async fn run(&self, item_id: &str, cancel: &watch::Receiver<bool>) -> Result<SyncReport, EngineError> {
        let store = self.ctx.store.as_ref();
        let account = store
            .linked_account(item_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(item_id.to_string()))?;
        if !account.is_syncable() {
            return Err(EngineError::AccountDisabled {
                item_id: item_id.to_string(),
                status: account.status,
            });
        }

        let credential = match self.vault.reveal(&account) {
            Ok(credential) => credential,
            Err(err) => {
                error!(error = %err, "credential unreadable; item requires re-link");
                self.mark_error(item_id, Some(CREDENTIAL_UNREADABLE)).await?;
                return Err(err);
            }
        };

        self.refresh_accounts(&account, &credential).await;

        let mut report = SyncReport::start(item_id, account.cursor.clone());
        let provider = self.ctx.provider.as_ref();
        let cred = &credential;
        loop {
            if *cancel.borrow() {
                info!(pages = report.pages, "sync cancelled at page boundary");
                report.outcome = SyncOutcome::Cancelled;
                break;
            }

            let cursor = report.cursor.as_deref();
            let pulled = with_retries(&self.ctx.backoff, "pull_incremental", || {
                provider.pull_incremental(cred, cursor)
            })
            .await;
            let page = match pulled {
                Ok(page) => page,
                Err(err) if err.class() == ErrorClass::Transient => {
                    warn!(error = %err, pages = report.pages, "provider retries exhausted; cursor left in place");
                    report.outcome = SyncOutcome::RetriesExhausted;
                    break;
                }
                Err(err) => {
                    error!(error = %err, "provider rejected credential; item requires re-link");
                    self.mark_error(item_id, err.code()).await?;
                    report.outcome = SyncOutcome::RequiresRelink;
                    break;
                }
            };

            let now = Utc::now();
            let mut tx = store.begin_page(item_id).await?;
            let ingested = ingest_page(&mut *tx, item_id, &page, &self.ctx.mapper, now).await?;
            let updates = aggregate_new(
                &mut *tx,
                &account.user_id,
                &ingested.newly_inserted,
                self.ctx.alert_threshold,
                now,
            )
            .await?;
            tx.set_cursor(&page.next_cursor).await?;
            tx.commit().await?;
            drop(tx);

            report.pages += 1;
            report.added += ingested.added;
            report.modified += ingested.modified;
            report.removed += ingested.removed;
            report.budget_updates += updates.len();
            report.cursor = Some(page.next_cursor.clone());

            for update in updates.iter().filter(|u| u.alert) {
                warn!(
                    budget_id = %update.budget_id,
                    budget = %update.budget_name,
                    spent = update.spent,
                    progress = update.progress,
                    "budget alert: spending crossed threshold"
                );
            }

            if !page.has_more {
                break;
            }
        }

        report.finished_at = Utc::now();
        if report.outcome == SyncOutcome::Completed {
            store.mark_synced(item_id, report.finished_at).await?;
        }
        info!(
            outcome = ?report.outcome,
            pages = report.pages,
            added = report.added,
            modified = report.modified,
            removed = report.removed,
            budget_updates = report.budget_updates,
            "sync finished"
        );
        Ok(report)
    }

    /// Only an active item is moved to `error`. An unlink that started while
    /// this sync ran keeps its `pending_removal` so the sweep still finds it.
    async fn mark_error(&self, item_id: &str, code: Option<&str>) -> Result<(), EngineError> {
        let moved = self
            .ctx
            .store
            .transition_status(item_id, &[ItemStatus::Active], ItemStatus::Error, code)
            .await?;
        if !moved {
            info!(item_id, "item left active state during sync; status kept");
        }
        Ok(())
    }

    async fn refresh_accounts(&self, account: &LinkedAccount, credential: &AccessCredential) {
        let provider = self.ctx.provider.as_ref();
        let listed = with_retries(&self.ctx.backoff, "list_accounts", || provider.list_accounts(credential)).await;
        let accounts = match listed {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(error = %err, "account refresh failed; continuing with transaction pull");
                return;
            }
        };
        let now = Utc::now();
        let records: Vec<BankAccountRecord> = accounts
            .iter()
            .map(|a| BankAccountRecord::from_provider(&account.item_id, a, now))
            .collect();
        if let Err(err) = self.ctx.store.upsert_bank_accounts(&records).await {
            warn!(error = %err, "storing refreshed accounts failed");
        }
    }
}
