use std::sync::Arc;

use flus_core::ItemStatus;
use flus_storage::LinkStore;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use crate::pool::SyncWorkerPool;
use crate::EngineError;

const SYNC_CODES: &[&str] = &[
    "SYNC_UPDATES_AVAILABLE",
    "DEFAULT_UPDATE",
    "INITIAL_UPDATE",
    "HISTORICAL_UPDATE",
];
const ITEM_ERROR_CODES: &[&str] = &["ERROR", "USER_PERMISSION_REVOKED"];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookPayload {
    #[serde(alias = "type")]
    pub webhook_type: String,
    #[serde(alias = "code")]
    pub webhook_code: String,
    #[serde(default, alias = "itemId")]
    pub item_id: Option<String>,
    #[serde(default)]
    pub error: Option<JsonValue>,
}

impl WebhookPayload {
    /// Provider error code, whether sent as a bare string or as `{error_code: ..}`.
    pub fn error_code(&self) -> Option<&str> {
        match self.error.as_ref()? {
            JsonValue::String(code) => Some(code.as_str()),
            JsonValue::Object(fields) => fields.get("error_code").and_then(JsonValue::as_str),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WebhookAck {
    SyncQueued { item_id: String },
    /// The queue was full or closed; the next webhook or periodic run catches up.
    SyncDropped { item_id: String },
    MarkedError { item_id: String },
    UnknownItem { item_id: String },
    Ignored { reason: String },
}

/// Acknowledges provider notifications without waiting on any sync: new-data
/// notices go onto the worker pool, item errors flip the account status.
pub struct WebhookDispatcher {
    store: Arc<dyn LinkStore>,
    pool: Arc<SyncWorkerPool>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn LinkStore>, pool: Arc<SyncWorkerPool>) -> Self {
        Self { store, pool }
    }

    pub async fn handle(&self, body: JsonValue) -> Result<WebhookAck, EngineError> {
        let payload: WebhookPayload = match serde_json::from_value(body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "unrecognized webhook body acknowledged");
                return Ok(WebhookAck::Ignored {
                    reason: format!("unrecognized payload: {err}"),
                });
            }
        };
        self.dispatch(&payload).await
    }

    pub async fn dispatch(&self, payload: &WebhookPayload) -> Result<WebhookAck, EngineError> {
        let kind = payload.webhook_type.as_str();
        let code = payload.webhook_code.as_str();
        let is_sync = kind == "TRANSACTIONS" && SYNC_CODES.contains(&code);
        let is_item_error = kind == "ITEM" && ITEM_ERROR_CODES.contains(&code);
        if !is_sync && !is_item_error {
            info!(webhook_type = kind, webhook_code = code, "webhook ignored");
            return Ok(WebhookAck::Ignored {
                reason: format!("unhandled webhook {kind}/{code}"),
            });
        }
        let Some(item_id) = payload.item_id.clone() else {
            warn!(webhook_type = kind, webhook_code = code, "webhook without item id");
            return Ok(WebhookAck::Ignored {
                reason: "missing item id".to_string(),
            });
        };

        let Some(account) = self.store.linked_account(&item_id).await? else {
            warn!(item_id = %item_id, webhook_code = code, "webhook for unknown item");
            return Ok(WebhookAck::UnknownItem { item_id });
        };

        if is_sync {
            if !account.is_syncable() {
                info!(item_id = %item_id, status = %account.status, "sync webhook for inactive item ignored");
                return Ok(WebhookAck::Ignored {
                    reason: format!("item is {}", account.status),
                });
            }
            return Ok(if self.pool.enqueue(&item_id) {
                WebhookAck::SyncQueued { item_id }
            } else {
                WebhookAck::SyncDropped { item_id }
            });
        }

        let error_code = payload.error_code().unwrap_or(code);
        let marked = self
            .store
            .transition_status(
                &item_id,
                &[ItemStatus::Active, ItemStatus::Error],
                ItemStatus::Error,
                Some(error_code),
            )
            .await?;
        if !marked {
            info!(item_id = %item_id, "item error webhook for item being removed");
            return Ok(WebhookAck::Ignored {
                reason: "item is being removed".to_string(),
            });
        }
        error!(item_id = %item_id, error_code, "provider reported item error; re-link required");
        Ok(WebhookAck::MarkedError { item_id })
    }
}
