//! Core domain records for linked bank items, synced transactions and budgets.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flus-core";

/// Category used when the provider reports no category hierarchy at all.
pub const FALLBACK_RAW_CATEGORY: &str = "Other";

/// Provider taxonomy → app category. Keys are matched exactly.
pub const DEFAULT_CATEGORY_TABLE: &[(&str, &str)] = &[
    ("Food and Drink", "Food & Dining"),
    ("Food and Dining", "Food & Dining"),
    ("Travel", "Transportation"),
    ("Shops", "Shopping"),
    ("Recreation", "Entertainment"),
    ("Arts and Entertainment", "Entertainment"),
    ("Service", "Bills & Utilities"),
    ("Healthcare", "Health & Fitness"),
    ("Education", "Education"),
    ("Personal Care", "Personal Care"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Active,
    Error,
    PendingRemoval,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::PendingRemoval => "pending_removal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "pending_removal" => Some(Self::PendingRemoval),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Long-lived provider access credential in plaintext.
///
/// Only the vault produces one of these, and only for the duration of a
/// single operation. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredential(String);

impl AccessCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessCredential(<redacted>)")
    }
}

/// Encrypted credential envelope as persisted alongside a linked account.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedCredential(String);

impl SealedCredential {
    pub fn from_envelope(envelope: impl Into<String>) -> Self {
        Self(envelope.into())
    }

    pub fn envelope(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedCredential(<ciphertext>)")
    }
}

/// One provider item (institution connection) owned by a user.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedAccount {
    pub item_id: String,
    pub user_id: String,
    pub institution_id: String,
    pub institution_name: String,
    pub credential: SealedCredential,
    pub status: ItemStatus,
    pub error_code: Option<String>,
    pub cursor: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LinkedAccount {
    pub fn is_syncable(&self) -> bool {
        self.status == ItemStatus::Active
    }
}

/// A bank account exposed by a linked item, keyed by (item_id, account_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankAccountRecord {
    pub item_id: String,
    pub account_id: String,
    pub name: String,
    pub official_name: Option<String>,
    pub account_type: String,
    pub subtype: Option<String>,
    pub mask: Option<String>,
    pub current_balance: Option<f64>,
    pub available_balance: Option<f64>,
    pub iso_currency_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BankAccountRecord {
    pub fn from_provider(item_id: &str, account: &ProviderAccount, now: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.to_string(),
            account_id: account.account_id.clone(),
            name: account.name.clone(),
            official_name: account.official_name.clone(),
            account_type: account.account_type.clone(),
            subtype: account.subtype.clone(),
            mask: account.mask.clone(),
            current_balance: account.current_balance,
            available_balance: account.available_balance,
            iso_currency_code: account.iso_currency_code.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Expense,
    Income,
}

impl TransactionKind {
    /// Positive provider amounts are money leaving the account.
    pub fn from_amount(amount: f64) -> Self {
        if amount > 0.0 {
            Self::Expense
        } else {
            Self::Income
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "expense",
            Self::Income => "income",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "expense" => Some(Self::Expense),
            "income" => Some(Self::Income),
            _ => None,
        }
    }
}

/// Locally persisted provider transaction. `provider_transaction_id` is the dedup key;
/// `id` is only a surrogate row id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedTransaction {
    pub id: Uuid,
    pub item_id: String,
    pub account_id: String,
    pub provider_transaction_id: String,
    pub amount: f64,
    pub iso_currency_code: Option<String>,
    pub name: String,
    pub merchant_name: Option<String>,
    pub raw_category: String,
    pub category: String,
    pub kind: TransactionKind,
    pub date: NaiveDate,
    pub pending: bool,
    pub budget_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncedTransaction {
    pub fn absolute_amount(&self) -> f64 {
        self.amount.abs()
    }
}

/// Budget row owned by the CRUD layer. The sync engine only ever touches
/// `spent` and `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub category: String,
    pub amount: f64,
    pub spent: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    /// Fraction of the budget consumed, `0.0` for a zero-amount budget.
    pub fn progress(&self) -> f64 {
        if self.amount <= 0.0 {
            0.0
        } else {
            self.spent / self.amount
        }
    }
}

/// Account listing as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub official_name: Option<String>,
    #[serde(rename = "type")]
    pub account_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default)]
    pub current_balance: Option<f64>,
    #[serde(default)]
    pub available_balance: Option<f64>,
    #[serde(default)]
    pub iso_currency_code: Option<String>,
}

/// Transaction entry as carried in an incremental pull page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTransaction {
    pub transaction_id: String,
    pub account_id: String,
    pub amount: f64,
    #[serde(default)]
    pub iso_currency_code: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub category: Vec<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub pending: bool,
}

impl ProviderTransaction {
    /// First element of the category hierarchy, or [`FALLBACK_RAW_CATEGORY`].
    pub fn primary_category(&self) -> &str {
        self.category
            .first()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .unwrap_or(FALLBACK_RAW_CATEGORY)
    }
}

/// One page of an incremental pull.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionPage {
    #[serde(default)]
    pub added: Vec<ProviderTransaction>,
    #[serde(default)]
    pub modified: Vec<ProviderTransaction>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub next_cursor: String,
    #[serde(default)]
    pub has_more: bool,
}

impl TransactionPage {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Every provider transaction id the page touches, in page order.
    pub fn touched_ids(&self) -> Vec<String> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .map(|t| t.transaction_id.clone())
            .chain(self.removed.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSession {
    pub link_token: String,
    pub expiration: Option<DateTime<Utc>>,
}

/// Client-facing view of a linked item; never carries the credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedAccountSummary {
    pub item_id: String,
    pub institution_id: String,
    pub institution_name: String,
    pub status: ItemStatus,
    pub error_code: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub accounts: Vec<BankAccountRecord>,
}

impl LinkedAccountSummary {
    pub fn new(account: &LinkedAccount, accounts: Vec<BankAccountRecord>) -> Self {
        Self {
            item_id: account.item_id.clone(),
            institution_id: account.institution_id.clone(),
            institution_name: account.institution_name.clone(),
            status: account.status,
            error_code: account.error_code.clone(),
            last_synced_at: account.last_synced_at,
            accounts,
        }
    }
}

/// Read-only provider → app category table, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMapper {
    table: HashMap<String, String>,
}

impl Default for CategoryMapper {
    fn default() -> Self {
        Self {
            table: DEFAULT_CATEGORY_TABLE
                .iter()
                .map(|(raw, app)| (raw.to_string(), app.to_string()))
                .collect(),
        }
    }
}

impl CategoryMapper {
    /// Default table extended (and overridden) by `entries`.
    pub fn with_overrides<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut mapper = Self::default();
        for (raw, app) in entries {
            mapper.table.insert(raw.into(), app.into());
        }
        mapper
    }

    /// Unmapped categories pass through unchanged.
    pub fn map(&self, raw_category: &str) -> String {
        self.table
            .get(raw_category)
            .cloned()
            .unwrap_or_else(|| raw_category.to_string())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Maps with the built-in table only.
pub fn map_category(raw_category: &str) -> String {
    DEFAULT_CATEGORY_TABLE
        .iter()
        .find(|(raw, _)| *raw == raw_category)
        .map(|(_, app)| app.to_string())
        .unwrap_or_else(|| raw_category.to_string())
}
