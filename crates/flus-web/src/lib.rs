//! Axum HTTP surface for linking banks, triggering syncs, unlinking, and
//! receiving provider webhooks.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use flus_core::LinkedAccountSummary;
use flus_sync::{
    context_from_config, maybe_build_scheduler, BankLinkService, EngineError, RemovalOutcome, SyncConfig,
    SyncReport,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "flus-web";

/// Authentication happens upstream; the gateway forwards the caller here.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BankLinkService>,
}

impl AppState {
    pub fn new(service: Arc<BankLinkService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    data: T,
    success: bool,
    timestamp: DateTime<Utc>,
}

fn respond<T: Serialize>(status: StatusCode, data: T) -> Response {
    let body = Envelope {
        data,
        success: true,
        timestamp: Utc::now(),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Link(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Credential { .. }
        | EngineError::AccountDisabled { .. }
        | EngineError::AlreadyRemoving(_) => StatusCode::CONFLICT,
        EngineError::ProviderTransient(_) | EngineError::Joined { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::ProviderPermanent(_) => StatusCode::BAD_GATEWAY,
        EngineError::Persistence(_) | EngineError::RemovalStranded { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_code(err: &EngineError) -> &'static str {
    match err {
        EngineError::Link(_) => "link_error",
        EngineError::Credential { .. } => "credential_error",
        EngineError::ProviderTransient(_) => "provider_unavailable",
        EngineError::ProviderPermanent(_) => "provider_rejected",
        EngineError::Persistence(_) => "persistence_error",
        EngineError::NotFound(_) => "not_found",
        EngineError::AccountDisabled { .. } => "relink_required",
        EngineError::AlreadyRemoving(_) => "removal_pending",
        EngineError::Joined { .. } => "sync_in_progress_failed",
        EngineError::RemovalStranded { .. } => "removal_incomplete",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                format!("missing {USER_HEADER} header"),
            ),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message.clone()),
            ApiError::Engine(err) => {
                let status = status_for(err);
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                }
                // Storage detail stays in the log.
                let message = match err {
                    EngineError::Persistence(_) => "internal storage error".to_string(),
                    EngineError::RemovalStranded { item_id, .. } => {
                        format!("linked account {item_id} was revoked but not removed")
                    }
                    other => other.to_string(),
                };
                (status, error_code(err), message)
            }
        };
        let body = json!({
            "success": false,
            "error": { "code": code, "message": message },
            "timestamp": Utc::now(),
        });
        (status, Json(body)).into_response()
    }
}

/// The caller identity forwarded by the gateway.
pub struct UserId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeTokenBody {
    public_token: String,
    institution_id: String,
    institution_name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SyncQuery {
    account_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncTotals {
    added: usize,
    modified: usize,
    removed: usize,
    reports: Vec<SyncReport>,
}

impl SyncTotals {
    fn from_reports(reports: Vec<SyncReport>) -> Self {
        Self {
            added: reports.iter().map(|r| r.added).sum(),
            modified: reports.iter().map(|r| r.modified).sum(),
            removed: reports.iter().map(|r| r.removed).sum(),
            reports,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/plaid/webhooks", post(webhook_handler))
        .route("/plaid/link-token", post(link_token_handler))
        .route("/plaid/exchange-token", post(exchange_token_handler))
        .route("/plaid/accounts", get(accounts_handler))
        .route("/plaid/accounts/{id}", delete(unlink_handler))
        .route("/plaid/sync", post(sync_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let ctx = context_from_config(&config).await?;
    let service = Arc::new(BankLinkService::start(ctx, config.sync_workers, config.sync_queue_depth));

    let scheduler = maybe_build_scheduler(&config, service.vault(), service.store(), service.pool()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(
            removal_retry_cron = %config.removal_retry_cron,
            periodic_sync_cron = %config.periodic_sync_cron,
            "scheduler started"
        );
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(AppState::new(service.clone())))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable");
            }
        })
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await?;
    }
    service.shutdown().await;
    Ok(())
}

async fn link_token_handler(State(state): State<AppState>, UserId(user_id): UserId) -> Result<Response, ApiError> {
    let session = state.service.create_link_session(&user_id).await?;
    Ok(respond(StatusCode::OK, session))
}

async fn exchange_token_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(body): Json<ExchangeTokenBody>,
) -> Result<Response, ApiError> {
    if body.public_token.trim().is_empty() {
        return Err(ApiError::BadRequest("publicToken is required".to_string()));
    }
    let summary = state
        .service
        .complete_link(&user_id, &body.public_token, &body.institution_id, &body.institution_name)
        .await?;
    Ok(respond(StatusCode::CREATED, summary))
}

async fn accounts_handler(State(state): State<AppState>, UserId(user_id): UserId) -> Result<Response, ApiError> {
    let accounts: Vec<LinkedAccountSummary> = state.service.list_linked_accounts(&user_id).await?;
    Ok(respond(StatusCode::OK, accounts))
}

async fn sync_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<SyncQuery>,
) -> Result<Response, ApiError> {
    let reports = state
        .service
        .trigger_sync(&user_id, query.account_id.as_deref())
        .await?;
    Ok(respond(StatusCode::OK, SyncTotals::from_reports(reports)))
}

async fn unlink_handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.service.unlink_account(&user_id, &id).await? {
        RemovalOutcome::Deleted => Ok(respond(StatusCode::OK, json!({ "deleted": true }))),
        RemovalOutcome::PendingRemoval => Ok(respond(
            StatusCode::ACCEPTED,
            json!({ "deleted": false, "pendingRemoval": true }),
        )),
    }
}

/// Always acknowledged quickly; syncs run on the worker pool.
async fn webhook_handler(State(state): State<AppState>, Json(body): Json<JsonValue>) -> Result<Response, ApiError> {
    let ack = state.service.handle_webhook(body).await?;
    Ok(respond(StatusCode::OK, json!({ "received": true, "ack": ack })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use flus_core::ItemStatus;
    use flus_provider::{ProviderError, ProviderOp, ScriptedProvider};
    use flus_storage::{LinkStore, MemoryLinkStore, VaultCipher};
    use flus_sync::EngineContext;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: MemoryLinkStore,
        provider: Arc<ScriptedProvider>,
    }

    fn test_app() -> TestApp {
        let store = MemoryLinkStore::new();
        let provider = Arc::new(ScriptedProvider::new());
        let cipher = VaultCipher::new([7u8; 32], None).unwrap();
        let ctx = EngineContext::new(Arc::new(store.clone()), provider.clone(), cipher).with_backoff(
            flus_provider::BackoffPolicy {
                max_retries: 1,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(1),
            },
        );
        let service = Arc::new(BankLinkService::start(ctx, 2, 8));
        TestApp {
            router: app(AppState::new(service)),
            store,
            provider,
        }
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: Option<JsonValue>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn link(t: &TestApp) {
        t.provider.add_exchange("public-sandbox", "item_1", "access-1");
        let resp = t
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/plaid/exchange-token",
                Some("user-1"),
                Some(json!({"publicToken": "public-sandbox", "institutionId": "ins_1", "institutionName": "Chase"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn link_token_requires_user_header() {
        let t = test_app();
        let resp = t
            .router
            .clone()
            .oneshot(request("POST", "/plaid/link-token", None, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = t
            .router
            .oneshot(request("POST", "/plaid/link-token", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert!(body["data"]["link_token"].as_str().unwrap().contains("user-1"));
    }

    #[tokio::test]
    async fn exchange_lists_and_never_returns_credentials() {
        let t = test_app();
        link(&t).await;
        let resp = t
            .router
            .oneshot(request("GET", "/plaid/accounts", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["data"][0]["item_id"], "item_1");
        assert_eq!(body["data"][0]["status"], "active");
        assert!(!body.to_string().contains("access-1"));
    }

    #[tokio::test]
    async fn invalid_public_token_is_bad_request() {
        let t = test_app();
        let resp = t
            .router
            .oneshot(request(
                "POST",
                "/plaid/exchange-token",
                Some("user-1"),
                Some(json!({"publicToken": "nope", "institutionId": "ins_1", "institutionName": "Chase"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"]["code"], "link_error");
        assert!(t.store.linked_accounts_for_user("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_item_error_then_sync_is_rejected() {
        let t = test_app();
        link(&t).await;
        let resp = t
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/plaid/webhooks",
                None,
                Some(json!({"type": "ITEM", "code": "ERROR", "itemId": "item_1"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["data"]["received"], true);
        let account = t.store.linked_account("item_1").await.unwrap().unwrap();
        assert_eq!(account.status, ItemStatus::Error);

        let resp = t
            .router
            .oneshot(request("POST", "/plaid/sync?accountId=item_1", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["error"]["code"], "relink_required");
    }

    #[tokio::test]
    async fn unknown_webhook_is_acknowledged() {
        let t = test_app();
        let resp = t
            .router
            .oneshot(request("POST", "/plaid/webhooks", None, Some(json!({"something": "else"}))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn manual_sync_reports_totals() {
        let t = test_app();
        link(&t).await;
        let resp = t
            .router
            .oneshot(request("POST", "/plaid/sync", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["data"]["added"], 0);
        assert_eq!(body["data"]["reports"][0]["outcome"], "completed");
    }

    #[tokio::test]
    async fn unlink_pending_when_revoke_fails() {
        let t = test_app();
        link(&t).await;
        for _ in 0..2 {
            t.provider
                .push_failure(ProviderOp::Revoke, ProviderError::transient("INTERNAL_SERVER_ERROR"));
        }
        let resp = t
            .router
            .clone()
            .oneshot(request("DELETE", "/plaid/accounts/item_1", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = t
            .router
            .clone()
            .oneshot(request("DELETE", "/plaid/accounts/item_1", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = t
            .router
            .oneshot(request("DELETE", "/plaid/accounts/item_9", Some("user-1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
