use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use flus_core::{AccessCredential, LinkSession, ProviderAccount, TransactionPage};
use serde::Deserialize;

use crate::{AggregationProvider, ExchangedItem, ProviderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    CreateLinkSession,
    Exchange,
    ListAccounts,
    PullIncremental,
    Revoke,
}

#[derive(Debug, Default)]
struct ScriptState {
    exchanges: HashMap<String, (String, String)>,
    accounts: HashMap<String, Vec<ProviderAccount>>,
    pages: HashMap<(String, String), TransactionPage>,
    failures: HashMap<ProviderOp, VecDeque<ProviderError>>,
    calls: HashMap<ProviderOp, usize>,
    revoked: Vec<String>,
    sessions_issued: usize,
    pull_delay: Option<Duration>,
}

/// Provider double driven by an in-memory script of exchanges, accounts and
/// cursor-keyed pages. Failures can be queued per operation.
///
/// A pull for a cursor with no scripted page returns an empty page that
/// echoes the cursor back, which is what a caught-up item looks like.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    state: Mutex<ScriptState>,
}

#[derive(Debug, Deserialize)]
struct FixtureExchange {
    public_token: String,
    item_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct FixturePage {
    access_token: String,
    cursor: Option<String>,
    page: TransactionPage,
}

#[derive(Debug, Deserialize)]
struct FixtureScript {
    #[serde(default)]
    exchanges: Vec<FixtureExchange>,
    #[serde(default)]
    accounts: HashMap<String, Vec<ProviderAccount>>,
    #[serde(default)]
    pages: Vec<FixturePage>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_fixture(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading provider fixture {}", path.display()))?;
        let script: FixtureScript = serde_json::from_str(&raw)
            .with_context(|| format!("parsing provider fixture {}", path.display()))?;
        let provider = Self::new();
        for exchange in script.exchanges {
            provider.add_exchange(&exchange.public_token, &exchange.item_id, &exchange.access_token);
        }
        for (access_token, accounts) in script.accounts {
            provider.set_accounts(&access_token, accounts);
        }
        for page in script.pages {
            provider.add_page(&page.access_token, page.cursor.as_deref(), page.page);
        }
        Ok(provider)
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_exchange(&self, public_token: &str, item_id: &str, access_token: &str) {
        self.state().exchanges.insert(
            public_token.to_string(),
            (item_id.to_string(), access_token.to_string()),
        );
    }

    pub fn set_accounts(&self, access_token: &str, accounts: Vec<ProviderAccount>) {
        self.state().accounts.insert(access_token.to_string(), accounts);
    }

    /// Scripts the page returned for `cursor`; `None` is the initial pull.
    pub fn add_page(&self, access_token: &str, cursor: Option<&str>, page: TransactionPage) {
        self.state().pages.insert(
            (access_token.to_string(), cursor.unwrap_or_default().to_string()),
            page,
        );
    }

    pub fn push_failure(&self, op: ProviderOp, err: ProviderError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        self.state().pull_delay = Some(delay);
    }

    pub fn calls(&self, op: ProviderOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn revoked(&self) -> Vec<String> {
        self.state().revoked.clone()
    }

    fn enter(&self, op: ProviderOp) -> Result<(), ProviderError> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ensure_not_revoked(&self, credential: &AccessCredential) -> Result<(), ProviderError> {
        if self.state().revoked.iter().any(|t| t == credential.expose()) {
            return Err(ProviderError::permanent("ITEM_NOT_FOUND"));
        }
        Ok(())
    }
}

#[async_trait]
impl AggregationProvider for ScriptedProvider {
    fn provider_id(&self) -> &'static str {
        "scripted"
    }

    async fn create_link_session(&self, user_id: &str) -> Result<LinkSession, ProviderError> {
        self.enter(ProviderOp::CreateLinkSession)?;
        let mut state = self.state();
        state.sessions_issued += 1;
        Ok(LinkSession {
            link_token: format!("link-scripted-{user_id}-{}", state.sessions_issued),
            expiration: Some(Utc::now() + ChronoDuration::hours(4)),
        })
    }

    async fn exchange(&self, session_result: &str) -> Result<ExchangedItem, ProviderError> {
        self.enter(ProviderOp::Exchange)?;
        let state = self.state();
        let (item_id, access_token) = state
            .exchanges
            .get(session_result)
            .cloned()
            .ok_or_else(|| ProviderError::link("INVALID_PUBLIC_TOKEN"))?;
        Ok(ExchangedItem {
            item_id,
            credential: AccessCredential::new(access_token),
        })
    }

    async fn list_accounts(
        &self,
        credential: &AccessCredential,
    ) -> Result<Vec<ProviderAccount>, ProviderError> {
        self.enter(ProviderOp::ListAccounts)?;
        self.ensure_not_revoked(credential)?;
        Ok(self
            .state()
            .accounts
            .get(credential.expose())
            .cloned()
            .unwrap_or_default())
    }

    async fn pull_incremental(
        &self,
        credential: &AccessCredential,
        cursor: Option<&str>,
    ) -> Result<TransactionPage, ProviderError> {
        self.enter(ProviderOp::PullIncremental)?;
        self.ensure_not_revoked(credential)?;
        let delay = self.state().pull_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let key = (
            credential.expose().to_string(),
            cursor.unwrap_or_default().to_string(),
        );
        let page = self.state().pages.get(&key).cloned();
        Ok(page.unwrap_or_else(|| TransactionPage {
            next_cursor: key.1,
            ..TransactionPage::default()
        }))
    }

    async fn revoke(&self, credential: &AccessCredential) -> Result<(), ProviderError> {
        self.enter(ProviderOp::Revoke)?;
        self.ensure_not_revoked(credential)?;
        self.state().revoked.push(credential.expose().to_string());
        Ok(())
    }
}
