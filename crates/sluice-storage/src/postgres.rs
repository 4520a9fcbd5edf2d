use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::{
    ChildRecord, DocumentKey, DocumentType, NewChildRecord, ParentDocument, ProgressKey,
    ProgressRecord, UpsertOutcome, WorkUnit,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::{ClaimedJob, JobQueue, QueueError};
use crate::{GroupWrite, IngestStore, StoreError};

const PROGRESS_COLUMNS: &str = r#"
    tenant_id, document_type, run_id, mode, status, cursor, window_start, window_end,
    records_fetched, records_created, records_updated, errors_encountered, units_executed,
    expected_count, actual_count, verified_at, force_full_refresh, last_error, retry_count,
    started_at, completed_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn count_to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn progress_from_row(row: &PgRow) -> Result<ProgressRecord, StoreError> {
    let document_type: String = row.try_get("document_type")?;
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    let expected_count: Option<i64> = row.try_get("expected_count")?;
    let actual_count: Option<i64> = row.try_get("actual_count")?;
    let retry_count: i32 = row.try_get("retry_count")?;

    Ok(ProgressRecord {
        tenant_id: row.try_get("tenant_id")?,
        document_type: document_type.parse().map_err(corrupt)?,
        run_id: row.try_get("run_id")?,
        mode: mode.parse().map_err(corrupt)?,
        status: status.parse().map_err(corrupt)?,
        cursor: row.try_get("cursor")?,
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        records_fetched: count_from_db(row.try_get("records_fetched")?),
        records_created: count_from_db(row.try_get("records_created")?),
        records_updated: count_from_db(row.try_get("records_updated")?),
        errors_encountered: count_from_db(row.try_get("errors_encountered")?),
        units_executed: count_from_db(row.try_get("units_executed")?),
        expected_count: expected_count.map(count_from_db),
        actual_count: actual_count.map(count_from_db),
        verified_at: row.try_get("verified_at")?,
        force_full_refresh: row.try_get("force_full_refresh")?,
        last_error: row.try_get("last_error")?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn child_from_row(row: &PgRow) -> Result<ChildRecord, StoreError> {
    let document_type: String = row.try_get("document_type")?;
    Ok(ChildRecord {
        remote_id: row.try_get("remote_id")?,
        document_id: row.try_get("document_id")?,
        tenant_id: row.try_get("tenant_id")?,
        document_type: document_type.parse().map_err(corrupt)?,
        ordinal: row.try_get("ordinal")?,
        text: row.try_get("text")?,
        media_ref: row.try_get("media_ref")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn upsert_page(
    conn: &mut PgConnection,
    key: &DocumentKey,
    document_id: Uuid,
    child: &NewChildRecord,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO meeting_pages
            (tenant_id, document_type, remote_id, document_id, ordinal, text, media_ref,
             created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
        ON CONFLICT (tenant_id, document_type, remote_id) DO UPDATE
           SET document_id = EXCLUDED.document_id,
               ordinal = EXCLUDED.ordinal,
               text = EXCLUDED.text,
               media_ref = EXCLUDED.media_ref,
               updated_at = EXCLUDED.updated_at
        RETURNING (xmax = 0) AS inserted
        "#,
    )
    .bind(&key.tenant_id)
    .bind(key.document_type.as_str())
    .bind(&child.remote_id)
    .bind(document_id)
    .bind(child.ordinal)
    .bind(&child.text)
    .bind(&child.media_ref)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    let inserted: bool = row.try_get("inserted")?;
    Ok(if inserted {
        UpsertOutcome::Created
    } else {
        UpsertOutcome::Updated
    })
}

#[async_trait]
impl IngestStore for PgStore {
    async fn get_or_create_progress(
        &self,
        key: &ProgressKey,
    ) -> Result<ProgressRecord, StoreError> {
        let fresh = ProgressRecord::new(key, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO ingest_progress (tenant_id, document_type, mode, status, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, document_type) DO NOTHING
            "#,
        )
        .bind(&fresh.tenant_id)
        .bind(fresh.document_type.as_str())
        .bind(fresh.mode.as_str())
        .bind(fresh.status.as_str())
        .bind(fresh.updated_at)
        .execute(&self.pool)
        .await?;

        self.load_progress(key)
            .await?
            .ok_or_else(|| {
                StoreError::Corrupt(format!("progress row for {key} vanished after insert"))
            })
    }

    async fn load_progress(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StoreError> {
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM ingest_progress \
             WHERE tenant_id = $1 AND document_type = $2"
        );
        let row = sqlx::query(&sql)
            .bind(&key.tenant_id)
            .bind(key.document_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(progress_from_row).transpose()
    }

    async fn save_progress(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO ingest_progress ({PROGRESS_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                    $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (tenant_id, document_type) DO UPDATE SET
                run_id = EXCLUDED.run_id,
                mode = EXCLUDED.mode,
                status = EXCLUDED.status,
                cursor = EXCLUDED.cursor,
                window_start = EXCLUDED.window_start,
                window_end = EXCLUDED.window_end,
                records_fetched = EXCLUDED.records_fetched,
                records_created = EXCLUDED.records_created,
                records_updated = EXCLUDED.records_updated,
                errors_encountered = EXCLUDED.errors_encountered,
                units_executed = EXCLUDED.units_executed,
                expected_count = EXCLUDED.expected_count,
                actual_count = EXCLUDED.actual_count,
                verified_at = EXCLUDED.verified_at,
                force_full_refresh = EXCLUDED.force_full_refresh,
                last_error = EXCLUDED.last_error,
                retry_count = EXCLUDED.retry_count,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                updated_at = EXCLUDED.updated_at
            "#
        );
        bind_progress(sqlx::query(&sql), record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn compare_and_save_progress(
        &self,
        record: &ProgressRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = bind_progress(
            sqlx::query(
                r#"
                UPDATE ingest_progress SET
                    run_id = $3, mode = $4, status = $5, cursor = $6,
                    window_start = $7, window_end = $8,
                    records_fetched = $9, records_created = $10, records_updated = $11,
                    errors_encountered = $12, units_executed = $13, expected_count = $14,
                    actual_count = $15, verified_at = $16, force_full_refresh = $17,
                    last_error = $18,
                    retry_count = $19, started_at = $20, completed_at = $21, updated_at = $22
                WHERE tenant_id = $1 AND document_type = $2 AND updated_at = $23
                "#,
            ),
            record,
        )
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_progress(&self, tenant_id: &str) -> Result<Vec<ProgressRecord>, StoreError> {
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM ingest_progress \
             WHERE tenant_id = $1 ORDER BY document_type"
        );
        let rows = sqlx::query(&sql).bind(tenant_id).fetch_all(&self.pool).await?;
        rows.iter().map(progress_from_row).collect()
    }

    async fn count_documents(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM meeting_documents WHERE tenant_id = $1 AND document_type = $2",
        )
        .bind(tenant_id)
        .bind(document_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count_from_db(count))
    }

    async fn count_children(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM meeting_pages WHERE tenant_id = $1 AND document_type = $2",
        )
        .bind(tenant_id)
        .bind(document_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count_from_db(count))
    }

    async fn write_document_group(
        &self,
        key: &DocumentKey,
        children: &[NewChildRecord],
    ) -> Result<GroupWrite, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO meeting_documents
                (id, tenant_id, document_type, name, meeting_date, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, document_type, name, meeting_date) DO UPDATE
               SET name = EXCLUDED.name
            RETURNING id, created_at
            "#,
        )
        .bind(key.deterministic_id())
        .bind(&key.tenant_id)
        .bind(key.document_type.as_str())
        .bind(&key.name)
        .bind(key.date)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let document = ParentDocument {
            id: row.try_get("id")?,
            tenant_id: key.tenant_id.clone(),
            document_type: key.document_type,
            name: key.name.clone(),
            date: key.date,
            created_at: row.try_get("created_at")?,
        };

        let mut outcomes = Vec::with_capacity(children.len());
        for child in children {
            sqlx::query("SAVEPOINT page_upsert").execute(&mut *tx).await?;
            match upsert_page(&mut tx, key, document.id, child, now).await {
                Ok(outcome) => {
                    sqlx::query("RELEASE SAVEPOINT page_upsert").execute(&mut *tx).await?;
                    outcomes.push(Ok(outcome));
                }
                Err(err) => {
                    sqlx::query("ROLLBACK TO SAVEPOINT page_upsert").execute(&mut *tx).await?;
                    outcomes.push(Err(StoreError::Rejected {
                        remote_id: child.remote_id.clone(),
                        reason: err.to_string(),
                    }));
                }
            }
        }

        tx.commit().await?;
        Ok(GroupWrite { document, outcomes })
    }

    async fn list_children(
        &self,
        tenant_id: &str,
        document_type: DocumentType,
    ) -> Result<Vec<ChildRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, document_type, remote_id, document_id, ordinal, text, media_ref,
                   created_at, updated_at
              FROM meeting_pages
             WHERE tenant_id = $1 AND document_type = $2
             ORDER BY remote_id
            "#,
        )
        .bind(tenant_id)
        .bind(document_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(child_from_row).collect()
    }
}

fn bind_progress<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    record: &'q ProgressRecord,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&record.tenant_id)
        .bind(record.document_type.as_str())
        .bind(record.run_id)
        .bind(record.mode.as_str())
        .bind(record.status.as_str())
        .bind(&record.cursor)
        .bind(record.window_start)
        .bind(record.window_end)
        .bind(count_to_db(record.records_fetched))
        .bind(count_to_db(record.records_created))
        .bind(count_to_db(record.records_updated))
        .bind(count_to_db(record.errors_encountered))
        .bind(count_to_db(record.units_executed))
        .bind(record.expected_count.map(count_to_db))
        .bind(record.actual_count.map(count_to_db))
        .bind(record.verified_at)
        .bind(record.force_full_refresh)
        .bind(&record.last_error)
        .bind(i32::try_from(record.retry_count).unwrap_or(i32::MAX))
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.updated_at)
}

/// Durable queue on the `ingest_jobs` table; concurrent workers claim with
/// `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError> {
        let kind = match &unit {
            WorkUnit::Batch(_) => "batch",
            WorkUnit::Verify(_) => "verify",
        };
        let payload = serde_json::to_value(&unit)?;
        sqlx::query(
            r#"
            INSERT INTO ingest_jobs (id, kind, tenant_id, payload, status, enqueued_at)
            VALUES ($1, $2, $3, $4, 'queued', $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(unit.unit_id())
        .bind(kind)
        .bind(&unit.key().tenant_id)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        debug!(job_id = %unit.unit_id(), kind, "enqueued job");
        Ok(())
    }

    /// Rows whose payload no longer decodes are marked failed and skipped.
    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        loop {
            let row = sqlx::query(
                r#"
                UPDATE ingest_jobs
                   SET status = 'running', locked_at = $1, attempts = attempts + 1
                 WHERE id = (
                        SELECT id FROM ingest_jobs
                         WHERE status = 'queued'
                         ORDER BY enqueued_at
                         LIMIT 1
                         FOR UPDATE SKIP LOCKED
                       )
                RETURNING id, payload, attempts
                "#,
            )
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let job_id: Uuid = row.try_get("id")?;
            let payload: serde_json::Value = row.try_get("payload")?;
            let attempts: i32 = row.try_get("attempts")?;
            match serde_json::from_value::<WorkUnit>(payload) {
                Ok(unit) => {
                    return Ok(Some(ClaimedJob {
                        job_id,
                        unit,
                        attempts: u32::try_from(attempts).unwrap_or(0),
                    }))
                }
                Err(err) => {
                    warn!(%job_id, error = %err, "discarding undecodable job payload");
                    sqlx::query(
                        r#"
                        UPDATE ingest_jobs
                           SET status = 'failed', last_error = $2, finished_at = $3
                         WHERE id = $1
                        "#,
                    )
                    .bind(job_id)
                    .bind(err.to_string())
                    .bind(Utc::now())
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
    }

    async fn complete(&self, job: &ClaimedJob) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
               SET status = 'completed', finished_at = $2
             WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job.job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotClaimed(job.job_id));
        }
        Ok(())
    }

    async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
               SET status = 'failed', last_error = $2, finished_at = $3
             WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job.job_id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotClaimed(job.job_id));
        }
        Ok(())
    }
}
