//! PostgreSQL driver integration tests.
//!
//! Run with `BROKER_TEST_DATABASE_URL` (or `DATABASE_URL`) pointing at a
//! disposable database and `cargo test -- --ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use broker::error::StorageError;
use broker::storage::{OperationRepository, OperationStorage, PgOperationStorage, RetryPolicy};
use broker::types::{
    CampaignId, InstanceId, Operation, OperationFilter, OperationId, OperationState,
    OperationType,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures_util::future::join_all;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

fn test_db_url() -> String {
    std::env::var("BROKER_TEST_DATABASE_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| {
            panic!("Set BROKER_TEST_DATABASE_URL or DATABASE_URL for DB integration tests")
        })
}

async fn test_storage() -> PgOperationStorage {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&test_db_url())
        .await
        .unwrap_or_else(|e| panic!("Failed to connect test database: {e}"));
    let storage = PgOperationStorage::new_with_pool(pool);
    storage
        .initialize_schema()
        .await
        .expect("Schema init failed");
    storage
}

/// Unique per test so tests can share one table.
fn scope(name: &str) -> String {
    format!("{name}-{}", uuid::Uuid::new_v4())
}

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
}

fn given_operation(scope: &str, n: usize, instance: &str, minute: i64) -> Operation {
    Operation::new(
        OperationId::new(format!("{scope}-op-{n}")),
        OperationType::UpgradeKyma,
        InstanceId::new(format!("{scope}-{instance}")),
        at(minute),
    )
}

#[tokio::test]
#[ignore = "requires BROKER_TEST_DATABASE_URL"]
async fn when_operation_is_inserted_then_it_reads_back_with_all_fields() {
    let storage = test_storage().await;
    let scope = scope("roundtrip");
    let mut op = given_operation(&scope, 1, "i1", 0)
        .with_campaign(CampaignId::new(&scope))
        .with_payload(json!({"plan": "aws", "nodes": 3}))
        .with_description("queued");
    op.finished_stages.mark("prepare");

    storage.insert(&op).await.expect("insert");
    let stored = storage.get_by_id(&op.id).await.expect("read");

    assert_eq!(stored.operation_type, OperationType::UpgradeKyma);
    assert_eq!(stored.state, OperationState::Pending);
    assert_eq!(stored.version, 0);
    assert_eq!(stored.finished_stages.as_slice(), ["prepare".to_string()]);
    assert_eq!(stored.payload, json!({"plan": "aws", "nodes": 3}));
    assert_eq!(stored.description, "queued");
    assert_eq!(stored.campaign_id, Some(CampaignId::new(&scope)));
    assert_eq!(stored.created_at, at(0));
}

#[tokio::test]
#[ignore = "requires BROKER_TEST_DATABASE_URL"]
async fn when_id_is_inserted_twice_then_second_insert_already_exists() {
    let storage = test_storage().await;
    let op = given_operation(&scope("dup"), 1, "i1", 0);

    storage.insert(&op).await.expect("first insert");
    let err = storage.insert(&op).await.unwrap_err();

    assert!(matches!(err, StorageError::AlreadyExists(_)), "{err:?}");
}

#[tokio::test]
#[ignore = "requires BROKER_TEST_DATABASE_URL"]
async fn when_update_matches_version_then_version_is_incremented() {
    let storage = test_storage().await;
    let op = given_operation(&scope("cas"), 1, "i1", 0);
    storage.insert(&op).await.expect("insert");

    let mut changed = op.clone();
    changed.state = OperationState::InProgress;
    let stored = storage.update(&changed).await.expect("update");

    assert_eq!(stored.version, 1);
    assert_eq!(stored.state, OperationState::InProgress);
    assert_eq!(storage.get_by_id(&op.id).await.unwrap().version, 1);
}

#[tokio::test]
#[ignore = "requires BROKER_TEST_DATABASE_URL"]
async fn when_update_carries_stale_version_then_conflict_and_record_is_untouched() {
    let storage = test_storage().await;
    let op = given_operation(&scope("stale"), 1, "i1", 0);
    storage.insert(&op).await.expect("insert");
    storage.update(&op).await.expect("first update");

    let mut stale = op.clone();
    stale.description = "late writer".to_string();
    let err = storage.update(&stale).await.unwrap_err();

    assert!(matches!(err, StorageError::Conflict(_)), "{err:?}");
    let stored = storage.get_by_id(&op.id).await.unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.description, "");
}

#[tokio::test]
#[ignore = "requires BROKER_TEST_DATABASE_URL"]
async fn when_updated_record_does_not_exist_then_not_found() {
    let storage = test_storage().await;
    let op = given_operation(&scope("ghost"), 1, "i1", 0);

    let err = storage.update(&op).await.unwrap_err();

    assert!(matches!(err, StorageError::NotFound(_)), "{err:?}");
}

#[tokio::test]
#[ignore = "requires BROKER_TEST_DATABASE_URL"]
async fn when_writers_race_on_one_version_then_exactly_one_wins() {
    let storage = test_storage().await;
    let op = given_operation(&scope("race"), 1, "i1", 0);
    storage.insert(&op).await.expect("insert");

    let attempts = (0..8).map(|n| {
        let storage = storage.clone();
        let mut candidate = op.clone();
        candidate.description = format!("writer {n}");
        async move { storage.update(&candidate).await }
    });
    let results = join_all(attempts).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(StorageError::Conflict(_))))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(storage.get_by_id(&op.id).await.unwrap().version, 1);
}

#[tokio::test]
#[ignore = "requires BROKER_TEST_DATABASE_URL"]
async fn when_reading_instance_history_then_latest_and_last_started_are_distinguished() {
    let storage = test_storage().await;
    let scope = scope("history");
    let mut first = given_operation(&scope, 1, "i1", 0);
    first.state = OperationState::Succeeded;
    let second = given_operation(&scope, 2, "i1", 10);
    storage.insert(&first).await.unwrap();
    storage.insert(&second).await.unwrap();
    let instance = InstanceId::new(format!("{scope}-i1"));

    let history = storage.list_by_instance_id(&instance).await.unwrap();
    let latest = storage.get_by_instance_id(&instance).await.unwrap();
    let last = storage.get_last_operation(&instance).await.unwrap();

    let ids: Vec<&OperationId> = history.iter().map(|op| &op.id).collect();
    assert_eq!(ids, vec![&first.id, &second.id]);
    assert_eq!(latest.id, second.id);
    assert_eq!(last.id, first.id);
}

#[tokio::test]
#[ignore = "requires BROKER_TEST_DATABASE_URL"]
async fn when_listing_with_filter_then_page_and_total_reflect_matches() {
    let storage = test_storage().await;
    let scope = scope("list");
    let campaign = CampaignId::new(&scope);
    for n in 0..5 {
        let minute = i64::try_from(n).unwrap();
        let mut op = given_operation(&scope, n, &format!("i{n}"), minute)
            .with_campaign(campaign.clone());
        if n % 2 == 0 {
            op.state = OperationState::Failed;
        }
        storage.insert(&op).await.unwrap();
    }

    let filter = OperationFilter::default()
        .with_campaign(campaign.clone())
        .with_states([OperationState::Failed])
        .with_page(2, 2);
    let page = storage.list(&filter).await.unwrap();

    assert_eq!(page.total_count, 3);
    assert_eq!(page.count, 1);
    assert_eq!(page.data[0].id.value(), format!("{scope}-op-4"));
    assert_eq!(storage.list_by_campaign(&campaign).await.unwrap().len(), 5);
}

#[tokio::test]
#[ignore = "requires BROKER_TEST_DATABASE_URL"]
async fn when_reading_through_repository_then_driver_results_pass_through() {
    let storage = test_storage().await;
    let repository = OperationRepository::new(storage, RetryPolicy::default());
    let op = given_operation(&scope("repo"), 1, "i1", 0);

    repository.insert(&op).await.unwrap();
    let fetched = repository.get_for_ids(&[op.id.clone()]).await.unwrap();
    let missing = repository
        .get_by_id(&OperationId::new(scope("missing")))
        .await
        .unwrap_err();

    assert_eq!(fetched.len(), 1);
    assert!(missing.is_not_found());
}
