//! Runs only when `SLUICE_TEST_DATABASE_URL` points at a disposable database.

use chrono::{NaiveDate, SubsecRound, Utc};
use sluice_core::{
    BatchUnit, DocumentKey, DocumentType, IngestMode, IngestStatus, NewChildRecord, ProgressKey,
    UpsertOutcome, WorkUnit,
};
use sluice_storage::{IngestStore, JobQueue, PgJobQueue, PgStore};
use uuid::Uuid;

async fn connect() -> Option<PgStore> {
    let url = std::env::var("SLUICE_TEST_DATABASE_URL").ok()?;
    let store = PgStore::connect(&url).await.expect("connect");
    store.migrate().await.expect("migrate");
    Some(store)
}

fn unique_tenant() -> String {
    format!("test-{}", Uuid::new_v4().simple())
}

fn page(remote_id: &str, ordinal: i64, text: &str) -> NewChildRecord {
    NewChildRecord {
        remote_id: remote_id.to_string(),
        ordinal,
        text: text.to_string(),
        media_ref: None,
    }
}

#[tokio::test]
async fn progress_compare_and_save_round_trips() {
    let Some(store) = connect().await else { return };
    let key = ProgressKey::new(unique_tenant(), DocumentType::Minutes);

    let mut record = store.get_or_create_progress(&key).await.unwrap();
    assert_eq!(record.status, IngestStatus::Pending);
    let loaded_at = record.updated_at;

    let now = Utc::now().trunc_subsecs(6);
    record.begin_run(IngestMode::Full, None, now);
    assert!(store.compare_and_save_progress(&record, loaded_at).await.unwrap());
    assert!(!store.compare_and_save_progress(&record, loaded_at).await.unwrap());

    let stored = store.load_progress(&key).await.unwrap().unwrap();
    assert_eq!(stored.status, IngestStatus::InProgress);
    assert_eq!(stored.run_id, record.run_id);
    assert_eq!(stored.updated_at, now);
}

#[tokio::test]
async fn group_write_replays_as_updates() {
    let Some(store) = connect().await else { return };
    let tenant = unique_tenant();
    let key = DocumentKey {
        tenant_id: tenant.clone(),
        document_type: DocumentType::Agendas,
        name: "City Council".to_string(),
        date: NaiveDate::from_ymd_opt(2026, 10, 13).unwrap(),
    };
    let pages = vec![page("a-1", 1, "call to order"), page("a-2", 2, "adjourn")];

    let first = store.write_document_group(&key, &pages).await.unwrap();
    assert_eq!(first.document.id, key.deterministic_id());
    assert!(first.outcomes.iter().all(|o| matches!(o, Ok(UpsertOutcome::Created))));

    let again = store.write_document_group(&key, &pages).await.unwrap();
    assert!(again.outcomes.iter().all(|o| matches!(o, Ok(UpsertOutcome::Updated))));
    assert_eq!(store.count_documents(&tenant, DocumentType::Agendas).await.unwrap(), 1);
    assert_eq!(store.count_children(&tenant, DocumentType::Agendas).await.unwrap(), 2);
}

#[tokio::test]
async fn nul_byte_rejects_only_its_page() {
    let Some(store) = connect().await else { return };
    let tenant = unique_tenant();
    let key = DocumentKey {
        tenant_id: tenant.clone(),
        document_type: DocumentType::Minutes,
        name: "Parks Board".to_string(),
        date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
    };
    let pages = vec![page("m-1", 1, "ok"), page("m-2", 2, "bad\0text"), page("m-3", 3, "ok")];

    let write = store.write_document_group(&key, &pages).await.unwrap();
    assert!(write.outcomes[0].is_ok());
    assert!(write.outcomes[1].is_err());
    assert!(write.outcomes[2].is_ok());
    assert_eq!(store.count_children(&tenant, DocumentType::Minutes).await.unwrap(), 2);
}

#[tokio::test]
async fn queue_claims_and_completes_a_unit() {
    let Some(store) = connect().await else { return };
    let queue = PgJobQueue::new(store.pool().clone());
    let key = ProgressKey::new(unique_tenant(), DocumentType::Minutes);
    queue
        .enqueue(WorkUnit::Batch(BatchUnit::first(key, Uuid::new_v4(), None, Some(10))))
        .await
        .unwrap();

    let job = queue.claim().await.unwrap().expect("a queued job");
    assert_eq!(job.attempts, 1);
    queue.complete(&job).await.unwrap();
}

#[tokio::test]
async fn queue_skips_undecodable_payloads() {
    let Some(store) = connect().await else { return };
    let queue = PgJobQueue::new(store.pool().clone());
    let bad_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO ingest_jobs (id, kind, tenant_id, payload, status, enqueued_at)
        VALUES ($1, 'batch', $2, $3, 'queued', 'epoch')
        "#,
    )
    .bind(bad_id)
    .bind(unique_tenant())
    .bind(serde_json::json!({"kind": "reindex"}))
    .execute(store.pool())
    .await
    .unwrap();
    let key = ProgressKey::new(unique_tenant(), DocumentType::Minutes);
    queue
        .enqueue(WorkUnit::Batch(BatchUnit::first(key, Uuid::new_v4(), None, Some(10))))
        .await
        .unwrap();

    let job = queue.claim().await.unwrap().expect("the decodable job");
    assert_ne!(job.job_id, bad_id);
    queue.complete(&job).await.unwrap();

    let (status, last_error): (String, Option<String>) =
        sqlx::query_as("SELECT status, last_error FROM ingest_jobs WHERE id = $1")
            .bind(bad_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert!(last_error.is_some());
}
