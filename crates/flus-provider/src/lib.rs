//! Account-aggregation provider boundary: the `AggregationProvider` contract,
//! the Plaid-compatible HTTP client, and a scripted fixture provider.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use flus_core::{AccessCredential, LinkSession, ProviderAccount, TransactionPage};
use thiserror::Error;
use tracing::warn;

mod plaid;
mod scripted;

pub use plaid::{PlaidConfig, PlaidProvider};
pub use scripted::{ProviderOp, ScriptedProvider};

pub const CRATE_NAME: &str = "flus-provider";

/// Error codes meaning the credential no longer grants access.
pub const PERMANENT_CODES: &[&str] = &[
    "ITEM_LOGIN_REQUIRED",
    "INVALID_ACCESS_TOKEN",
    "ITEM_NOT_FOUND",
    "ACCESS_NOT_GRANTED",
    "USER_PERMISSION_REVOKED",
];

/// Error codes for a bad or expired link session result.
pub const LINK_CODES: &[&str] = &["INVALID_PUBLIC_TOKEN", "INVALID_LINK_TOKEN"];

pub const TRANSIENT_CODES: &[&str] = &[
    "RATE_LIMIT_EXCEEDED",
    "PRODUCT_NOT_READY",
    "INTERNAL_SERVER_ERROR",
    "INSTITUTION_DOWN",
    "INSTITUTION_NOT_RESPONDING",
    "TRANSACTIONS_SYNC_MUTATION_DURING_PAGINATION",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Link,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("link session rejected ({code}): {message}")]
    Link { code: String, message: String },
    #[error("provider temporarily unavailable ({code}): {message}")]
    Transient { code: String, message: String },
    #[error("provider rejected credential ({code}): {message}")]
    Permanent { code: String, message: String },
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn transient(code: impl Into<String>) -> Self {
        Self::Transient {
            code: code.into(),
            message: "transient failure".to_string(),
        }
    }

    pub fn permanent(code: impl Into<String>) -> Self {
        Self::Permanent {
            code: code.into(),
            message: "credential no longer valid".to_string(),
        }
    }

    pub fn link(code: impl Into<String>) -> Self {
        Self::Link {
            code: code.into(),
            message: "link session invalid or expired".to_string(),
        }
    }

    /// Transport failures and undecodable bodies are retried like rate limits;
    /// only an explicit provider verdict moves an item out of `active`.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Link { .. } => ErrorClass::Link,
            Self::Permanent { .. } => ErrorClass::Permanent,
            Self::Transient { .. } | Self::Http(_) | Self::Decode(_) => ErrorClass::Transient,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Link { code, .. } | Self::Transient { code, .. } | Self::Permanent { code, .. } => {
                Some(code)
            }
            Self::Http(_) | Self::Decode(_) => None,
        }
    }

    /// The provider no longer knows the grant, so there is nothing left to revoke.
    pub fn is_grant_gone(&self) -> bool {
        matches!(self.code(), Some("ITEM_NOT_FOUND" | "INVALID_ACCESS_TOKEN"))
    }
}

/// Maps a provider error response onto the retry taxonomy.
pub fn classify_error(status: u16, error_type: &str, error_code: &str) -> ErrorClass {
    if LINK_CODES.contains(&error_code) {
        ErrorClass::Link
    } else if PERMANENT_CODES.contains(&error_code) {
        ErrorClass::Permanent
    } else if TRANSIENT_CODES.contains(&error_code)
        || matches!(error_type, "RATE_LIMIT_EXCEEDED" | "API_ERROR" | "INSTITUTION_ERROR")
        || status == 429
        || status >= 500
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Debug, Clone)]
pub struct ExchangedItem {
    pub item_id: String,
    pub credential: AccessCredential,
}

#[async_trait]
pub trait AggregationProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn create_link_session(&self, user_id: &str) -> Result<LinkSession, ProviderError>;

    async fn exchange(&self, session_result: &str) -> Result<ExchangedItem, ProviderError>;

    async fn list_accounts(
        &self,
        credential: &AccessCredential,
    ) -> Result<Vec<ProviderAccount>, ProviderError>;

    /// One page of changes after `cursor`; `None` starts from the beginning of history.
    async fn pull_incremental(
        &self,
        credential: &AccessCredential,
        cursor: Option<&str>,
    ) -> Result<TransactionPage, ProviderError>;

    async fn revoke(&self, credential: &AccessCredential) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Runs `call` until it succeeds, fails with a non-transient error, or the
/// policy's retries are spent. The last error is returned as-is.
pub async fn with_retries<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0usize;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.class() == ErrorClass::Transient && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient provider error; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn error_codes_classify_into_retry_taxonomy() {
        assert_eq!(classify_error(400, "ITEM_ERROR", "ITEM_LOGIN_REQUIRED"), ErrorClass::Permanent);
        assert_eq!(classify_error(400, "INVALID_INPUT", "INVALID_PUBLIC_TOKEN"), ErrorClass::Link);
        assert_eq!(
            classify_error(429, "RATE_LIMIT_EXCEEDED", "TRANSACTIONS_LIMIT"),
            ErrorClass::Transient
        );
        assert_eq!(classify_error(500, "API_ERROR", "INTERNAL_SERVER_ERROR"), ErrorClass::Transient);
        assert_eq!(classify_error(502, "", ""), ErrorClass::Transient);
        assert_eq!(classify_error(400, "INVALID_REQUEST", "MISSING_FIELDS"), ErrorClass::Permanent);
    }

    #[test]
    fn grant_gone_only_for_missing_item_codes() {
        assert!(ProviderError::permanent("ITEM_NOT_FOUND").is_grant_gone());
        assert!(ProviderError::permanent("INVALID_ACCESS_TOKEN").is_grant_gone());
        assert!(!ProviderError::permanent("ITEM_LOGIN_REQUIRED").is_grant_gone());
        assert!(!ProviderError::transient("RATE_LIMIT_EXCEEDED").is_grant_gone());
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicUsize::new(0);
        let result = with_retries(&fast_policy(3), "pull", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::transient("RATE_LIMIT_EXCEEDED"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_retry_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retries(&fast_policy(2), "pull", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::transient("INSTITUTION_DOWN")) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retries(&fast_policy(5), "pull", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::permanent("ITEM_LOGIN_REQUIRED")) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
