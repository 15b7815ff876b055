// End-to-end run of the sandbox provider fixture through the public service API.

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use flus_core::{Budget, ItemStatus};
use flus_provider::ScriptedProvider;
use flus_storage::{LinkStore, MemoryLinkStore, VaultCipher};
use flus_sync::{BankLinkService, EngineContext, RemovalOutcome, SyncOutcome};
use serde_json::json;
use uuid::Uuid;

fn sandbox_provider() -> ScriptedProvider {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../flus-provider/fixtures/sandbox.json");
    ScriptedProvider::load_fixture(&path).unwrap()
}

fn budget(name: &str, category: &str, amount: f64) -> Budget {
    let created_at = Utc::now() - Duration::minutes(5);
    Budget {
        id: Uuid::new_v4(),
        user_id: "user-1".into(),
        name: name.into(),
        category: category.into(),
        amount,
        spent: 0.0,
        created_at,
        updated_at: created_at,
    }
}

#[tokio::test]
async fn sandbox_link_sync_webhook_unlink() {
    let store = MemoryLinkStore::new();
    let provider = Arc::new(sandbox_provider());
    let cipher = VaultCipher::new([9u8; 32], Some("sandbox".into())).unwrap();
    let ctx = EngineContext::new(Arc::new(store.clone()), provider.clone(), cipher);
    let service = BankLinkService::start(ctx, 2, 16);

    let dining = budget("Eating out", "Food & Dining", 100.0);
    let transit = budget("Transportation", "Transportation", 40.0);
    store.insert_budget(dining.clone()).await;
    store.insert_budget(transit.clone()).await;

    let summary = service
        .complete_link("user-1", "public-sandbox-chase", "ins_1", "Chase Checking")
        .await
        .unwrap();
    assert_eq!(summary.item_id, "item_sandbox_chase");
    assert_eq!(summary.accounts.len(), 1);
    let linked = store.linked_account("item_sandbox_chase").await.unwrap().unwrap();
    assert_eq!(linked.status, ItemStatus::Active);
    assert_eq!(linked.cursor, None);

    let reports = service.trigger_sync("user-1", None).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, SyncOutcome::Completed);
    assert_eq!(reports[0].pages, 2);
    assert_eq!(reports[0].added, 3);
    assert_eq!(reports[0].cursor.as_deref(), Some("c2"));

    let rows = store.transactions("item_sandbox_chase").await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(store.budget(dining.id).await.unwrap().unwrap().spent, 12.5);
    assert_eq!(store.budget(transit.id).await.unwrap().unwrap().spent, 42.0);

    // Caught up: a second run changes nothing.
    service.trigger_sync("user-1", None).await.unwrap();
    assert_eq!(store.transaction_count().await, 3);
    assert_eq!(store.budget(dining.id).await.unwrap().unwrap().spent, 12.5);

    let ack = service
        .handle_webhook(json!({"type": "ITEM", "code": "ERROR", "itemId": "item_sandbox_chase"}))
        .await
        .unwrap();
    assert!(matches!(ack, flus_sync::WebhookAck::MarkedError { .. }));
    assert!(service.trigger_sync("user-1", Some("acc_checking")).await.is_err());

    let outcome = service.unlink_account("user-1", "acc_checking").await.unwrap();
    assert_eq!(outcome, RemovalOutcome::Deleted);
    assert_eq!(provider.revoked(), vec!["access-sandbox-chase".to_string()]);
    assert_eq!(store.transaction_count().await, 0);
    assert!(service.list_linked_accounts("user-1").await.unwrap().is_empty());
    service.shutdown().await;
}
