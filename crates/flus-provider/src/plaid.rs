use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use flus_core::{AccessCredential, LinkSession, ProviderAccount, ProviderTransaction, TransactionPage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, Instrument};

use crate::{classify_error, AggregationProvider, ErrorClass, ExchangedItem, ProviderError};

#[derive(Clone)]
pub struct PlaidConfig {
    pub base_url: String,
    pub client_id: String,
    pub secret: String,
    pub webhook_url: Option<String>,
    pub client_name: String,
    pub timeout: Duration,
    pub page_size: u32,
}

impl fmt::Debug for PlaidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaidConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("webhook_url", &self.webhook_url)
            .field("client_name", &self.client_name)
            .field("timeout", &self.timeout)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl PlaidConfig {
    /// `sandbox`, `development` and `production` resolve to the hosted
    /// environments; anything else is taken as a base URL.
    pub fn base_url_for_env(env: &str) -> String {
        match env {
            "sandbox" => "https://sandbox.plaid.com".to_string(),
            "development" => "https://development.plaid.com".to_string(),
            "production" => "https://production.plaid.com".to_string(),
            other => other.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug)]
pub struct PlaidProvider {
    client: reqwest::Client,
    config: PlaidConfig,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Debug, Deserialize)]
struct LinkTokenResponse {
    link_token: String,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
    item_id: String,
}

#[derive(Debug, Deserialize)]
struct WireBalances {
    #[serde(default)]
    available: Option<f64>,
    #[serde(default)]
    current: Option<f64>,
    #[serde(default)]
    iso_currency_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    account_id: String,
    name: String,
    #[serde(default)]
    official_name: Option<String>,
    #[serde(rename = "type")]
    account_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    mask: Option<String>,
    balances: WireBalances,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<WireAccount>,
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    transaction_id: String,
    account_id: String,
    amount: f64,
    #[serde(default)]
    iso_currency_code: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    merchant_name: Option<String>,
    #[serde(default)]
    category: Option<Vec<String>>,
    date: NaiveDate,
    #[serde(default)]
    pending: bool,
}

#[derive(Debug, Deserialize)]
struct WireRemoved {
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    added: Vec<WireTransaction>,
    #[serde(default)]
    modified: Vec<WireTransaction>,
    #[serde(default)]
    removed: Vec<WireRemoved>,
    next_cursor: String,
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct SyncRequest<'a> {
    access_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
    count: u32,
}

impl From<WireAccount> for ProviderAccount {
    fn from(wire: WireAccount) -> Self {
        Self {
            account_id: wire.account_id,
            name: wire.name,
            official_name: wire.official_name,
            account_type: wire.account_type,
            subtype: wire.subtype,
            mask: wire.mask,
            current_balance: wire.balances.current,
            available_balance: wire.balances.available,
            iso_currency_code: wire.balances.iso_currency_code,
        }
    }
}

impl From<WireTransaction> for ProviderTransaction {
    fn from(wire: WireTransaction) -> Self {
        Self {
            transaction_id: wire.transaction_id,
            account_id: wire.account_id,
            amount: wire.amount,
            iso_currency_code: wire.iso_currency_code,
            name: wire.name.unwrap_or_default(),
            merchant_name: wire.merchant_name,
            category: wire.category.unwrap_or_default(),
            date: wire.date,
            pending: wire.pending,
        }
    }
}

impl From<SyncResponse> for TransactionPage {
    fn from(wire: SyncResponse) -> Self {
        Self {
            added: wire.added.into_iter().map(Into::into).collect(),
            modified: wire.modified.into_iter().map(Into::into).collect(),
            removed: wire.removed.into_iter().map(|r| r.transaction_id).collect(),
            next_cursor: wire.next_cursor,
            has_more: wire.has_more,
        }
    }
}

fn error_from_body(status: u16, body: &[u8]) -> ProviderError {
    let parsed: ErrorBody = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(_) => ErrorBody {
            error_type: String::new(),
            error_code: format!("HTTP_{status}"),
            error_message: String::from_utf8_lossy(body).chars().take(200).collect(),
        },
    };
    let code = parsed.error_code;
    let message = parsed.error_message;
    match classify_error(status, &parsed.error_type, &code) {
        ErrorClass::Link => ProviderError::Link { code, message },
        ErrorClass::Permanent => ProviderError::Permanent { code, message },
        ErrorClass::Transient => ProviderError::Transient { code, message },
    }
}

impl PlaidProvider {
    pub fn new(config: PlaidConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &'static str,
        mut body: JsonValue,
    ) -> Result<T, ProviderError> {
        if let JsonValue::Object(map) = &mut body {
            map.insert("client_id".into(), JsonValue::String(self.config.client_id.clone()));
            map.insert("secret".into(), JsonValue::String(self.config.secret.clone()));
        }
        let url = format!("{}{}", self.config.base_url, path);
        let span = info_span!("provider_call", provider = "plaid", path);
        async move {
            let resp = self.client.post(&url).json(&body).send().await?;
            let status = resp.status();
            let bytes = resp.bytes().await?;
            if !status.is_success() {
                let err = error_from_body(status.as_u16(), &bytes);
                debug!(status = status.as_u16(), error = %err, "provider call failed");
                return Err(err);
            }
            serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode(format!("{path}: {e}")))
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl AggregationProvider for PlaidProvider {
    fn provider_id(&self) -> &'static str {
        "plaid"
    }

    async fn create_link_session(&self, user_id: &str) -> Result<LinkSession, ProviderError> {
        let mut body = json!({
            "client_name": self.config.client_name,
            "user": { "client_user_id": user_id },
            "products": ["transactions"],
            "country_codes": ["US"],
            "language": "en",
        });
        if let (Some(webhook), JsonValue::Object(map)) = (&self.config.webhook_url, &mut body) {
            map.insert("webhook".into(), JsonValue::String(webhook.clone()));
        }
        let resp: LinkTokenResponse = self.post("/link/token/create", body).await?;
        Ok(LinkSession {
            link_token: resp.link_token,
            expiration: resp.expiration,
        })
    }

    async fn exchange(&self, session_result: &str) -> Result<ExchangedItem, ProviderError> {
        let resp: ExchangeResponse = self
            .post(
                "/item/public_token/exchange",
                json!({ "public_token": session_result }),
            )
            .await?;
        Ok(ExchangedItem {
            item_id: resp.item_id,
            credential: AccessCredential::new(resp.access_token),
        })
    }

    async fn list_accounts(
        &self,
        credential: &AccessCredential,
    ) -> Result<Vec<ProviderAccount>, ProviderError> {
        let resp: AccountsResponse = self
            .post("/accounts/get", json!({ "access_token": credential.expose() }))
            .await?;
        Ok(resp.accounts.into_iter().map(Into::into).collect())
    }

    async fn pull_incremental(
        &self,
        credential: &AccessCredential,
        cursor: Option<&str>,
    ) -> Result<TransactionPage, ProviderError> {
        let request = SyncRequest {
            access_token: credential.expose(),
            cursor,
            count: self.config.page_size,
        };
        let body = serde_json::to_value(&request).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let resp: SyncResponse = self.post("/transactions/sync", body).await?;
        Ok(resp.into())
    }

    async fn revoke(&self, credential: &AccessCredential) -> Result<(), ProviderError> {
        let _: JsonValue = self
            .post("/item/remove", json!({ "access_token": credential.expose() }))
            .await?;
        Ok(())
    }
}
