//! Core domain model for sluice: ingestion checkpoints, meeting documents and work units.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sluice-core";

/// Namespace for deterministic parent document ids.
const DOCUMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6c1b_52f4_8a0e_4d37_9f4e_2b9d_0c6a_11e7);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// The two document families a tenant publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Minutes,
    Agendas,
}

impl DocumentType {
    pub const ALL: [DocumentType; 2] = [DocumentType::Minutes, DocumentType::Agendas];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Minutes => "minutes",
            DocumentType::Agendas => "agendas",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minutes" => Ok(DocumentType::Minutes),
            "agendas" => Ok(DocumentType::Agendas),
            other => Err(ParseEnumError {
                kind: "document type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    Full,
    Incremental,
}

impl IngestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestMode::Full => "full",
            IngestMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(IngestMode::Full),
            "incremental" => Ok(IngestMode::Incremental),
            other => Err(ParseEnumError {
                kind: "ingest mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::InProgress => "in_progress",
            IngestStatus::Completed => "completed",
            IngestStatus::Failed => "failed",
            IngestStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IngestStatus::Pending),
            "in_progress" => Ok(IngestStatus::InProgress),
            "completed" => Ok(IngestStatus::Completed),
            "failed" => Ok(IngestStatus::Failed),
            "paused" => Ok(IngestStatus::Paused),
            other => Err(ParseEnumError {
                kind: "ingest status",
                value: other.to_string(),
            }),
        }
    }
}

/// Identity of a progress record: exactly one exists per tenant and document type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProgressKey {
    pub tenant_id: String,
    pub document_type: DocumentType,
}

impl ProgressKey {
    pub fn new(tenant_id: impl Into<String>, document_type: DocumentType) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            document_type,
        }
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.document_type)
    }
}

/// Inclusive date range used to scope incremental runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// `today` plus and minus `months` calendar months.
    pub fn around(today: NaiveDate, months: u32) -> Self {
        let span = Months::new(months);
        Self {
            start: today.checked_sub_months(span).unwrap_or(NaiveDate::MIN),
            end: today.checked_add_months(span).unwrap_or(NaiveDate::MAX),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Counts produced by one unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub errors: u64,
}

impl BatchCounts {
    pub fn merge(&mut self, other: BatchCounts) {
        self.fetched += other.fetched;
        self.created += other.created;
        self.updated += other.updated;
        self.errors += other.errors;
    }
}

/// Durable checkpoint and run state for one (tenant, document type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub tenant_id: String,
    pub document_type: DocumentType,
    pub run_id: Option<Uuid>,
    pub mode: IngestMode,
    pub status: IngestStatus,
    pub cursor: Option<String>,
    pub window_start: Option<NaiveDate>,
    pub window_end: Option<NaiveDate>,
    pub records_fetched: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub errors_encountered: u64,
    pub units_executed: u64,
    pub expected_count: Option<u64>,
    pub actual_count: Option<u64>,
    pub verified_at: Option<DateTime<Utc>>,
    pub force_full_refresh: bool,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(key: &ProgressKey, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: key.tenant_id.clone(),
            document_type: key.document_type,
            run_id: None,
            mode: IngestMode::Full,
            status: IngestStatus::Pending,
            cursor: None,
            window_start: None,
            window_end: None,
            records_fetched: 0,
            records_created: 0,
            records_updated: 0,
            errors_encountered: 0,
            units_executed: 0,
            expected_count: None,
            actual_count: None,
            verified_at: None,
            force_full_refresh: false,
            last_error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(self.tenant_id.clone(), self.document_type)
    }

    pub fn window(&self) -> Option<DateWindow> {
        match (self.window_start, self.window_end) {
            (Some(start), Some(end)) => Some(DateWindow { start, end }),
            _ => None,
        }
    }

    /// Starts a fresh run from the beginning of the listing and returns its id.
    pub fn begin_run(
        &mut self,
        mode: IngestMode,
        window: Option<DateWindow>,
        now: DateTime<Utc>,
    ) -> Uuid {
        let run_id = Uuid::new_v4();
        self.run_id = Some(run_id);
        self.mode = mode;
        self.status = IngestStatus::InProgress;
        self.cursor = None;
        self.window_start = window.map(|w| w.start);
        self.window_end = window.map(|w| w.end);
        self.records_fetched = 0;
        self.records_created = 0;
        self.records_updated = 0;
        self.errors_encountered = 0;
        self.units_executed = 0;
        self.expected_count = None;
        self.actual_count = None;
        self.verified_at = None;
        self.last_error = None;
        self.retry_count = 0;
        self.started_at = Some(now);
        self.completed_at = None;
        self.updated_at = now;
        run_id
    }

    /// Re-enters `in_progress` keeping cursor and counters.
    ///
    /// The run id is rotated so units still queued from the interrupted chain
    /// are dropped when they surface.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Uuid {
        let run_id = Uuid::new_v4();
        self.run_id = Some(run_id);
        self.status = IngestStatus::InProgress;
        self.last_error = None;
        self.updated_at = now;
        run_id
    }

    /// Persists the outcome of one successful unit as the new checkpoint.
    pub fn record_batch(
        &mut self,
        counts: BatchCounts,
        next_cursor: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.records_fetched += counts.fetched;
        self.records_created += counts.created;
        self.records_updated += counts.updated;
        self.errors_encountered += counts.errors;
        self.units_executed += 1;
        self.cursor = next_cursor.filter(|c| !c.is_empty());
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = IngestStatus::Completed;
        self.cursor = None;
        if self.mode == IngestMode::Full {
            self.force_full_refresh = false;
        }
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Cursor and counters are left untouched so a later resume continues from them.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = IngestStatus::Failed;
        self.last_error = Some(error.into());
        self.retry_count = self.retry_count.saturating_add(1);
        self.updated_at = now;
    }

    pub fn mark_paused(&mut self, now: DateTime<Utc>) {
        self.status = IngestStatus::Paused;
        self.updated_at = now;
    }

    pub fn record_verification(&mut self, expected: Option<u64>, actual: u64, now: DateTime<Utc>) {
        self.expected_count = expected;
        self.actual_count = Some(actual);
        self.verified_at = Some(now);
        self.updated_at = now;
    }

    /// An `in_progress` record that has not checkpointed within `stale_after`
    /// has lost its chain.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == IngestStatus::InProgress && now - self.updated_at > stale_after
    }
}

/// Natural key of a meeting document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub tenant_id: String,
    pub document_type: DocumentType,
    pub name: String,
    pub date: NaiveDate,
}

impl DocumentKey {
    pub fn deterministic_id(&self) -> Uuid {
        let source = format!(
            "{}:{}:{}:{}",
            self.tenant_id,
            self.document_type,
            self.name,
            self.date.format("%Y-%m-%d")
        );
        Uuid::new_v5(&DOCUMENT_NAMESPACE, source.as_bytes())
    }
}

/// One meeting: the container for its pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentDocument {
    pub id: Uuid,
    pub tenant_id: String,
    pub document_type: DocumentType,
    pub name: String,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl ParentDocument {
    pub fn from_key(key: &DocumentKey, now: DateTime<Utc>) -> Self {
        Self {
            id: key.deterministic_id(),
            tenant_id: key.tenant_id.clone(),
            document_type: key.document_type,
            name: key.name.clone(),
            date: key.date,
            created_at: now,
        }
    }
}

/// A validated page row ready to be upserted under its document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChildRecord {
    pub remote_id: String,
    pub ordinal: i64,
    pub text: String,
    pub media_ref: Option<String>,
}

/// A stored page, unique on (tenant, document type, remote id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub remote_id: String,
    pub document_id: Uuid,
    pub tenant_id: String,
    pub document_type: DocumentType,
    pub ordinal: i64,
    pub text: String,
    pub media_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// One fetch+process+checkpoint step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUnit {
    pub unit_id: Uuid,
    pub key: ProgressKey,
    pub run_id: Uuid,
    /// Checkpoint this unit was enqueued against; `None` is the start of the listing.
    pub cursor: Option<String>,
    pub max_pages: Option<u32>,
    pub sequence: u32,
}

impl BatchUnit {
    pub fn first(
        key: ProgressKey,
        run_id: Uuid,
        cursor: Option<String>,
        max_pages: Option<u32>,
    ) -> Self {
        Self {
            unit_id: Uuid::new_v4(),
            key,
            run_id,
            cursor,
            max_pages,
            sequence: 1,
        }
    }

    pub fn successor(&self, cursor: String) -> Self {
        Self {
            unit_id: Uuid::new_v4(),
            key: self.key.clone(),
            run_id: self.run_id,
            cursor: Some(cursor),
            max_pages: self.max_pages,
            sequence: self.sequence + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyUnit {
    pub unit_id: Uuid,
    pub key: ProgressKey,
    pub run_id: Uuid,
}

/// Payload carried by the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkUnit {
    Batch(BatchUnit),
    Verify(VerifyUnit),
}

impl WorkUnit {
    pub fn unit_id(&self) -> Uuid {
        match self {
            WorkUnit::Batch(unit) => unit.unit_id,
            WorkUnit::Verify(unit) => unit.unit_id,
        }
    }

    pub fn key(&self) -> &ProgressKey {
        match self {
            WorkUnit::Batch(unit) => &unit.key,
            WorkUnit::Verify(unit) => &unit.key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().expect("ts")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[test]
    fn window_spans_months_on_both_sides() {
        let window = DateWindow::around(date(2026, 8, 31), 6);
        assert_eq!(window.start, date(2026, 2, 28));
        assert_eq!(window.end, date(2027, 2, 28));
        assert!(window.contains(date(2026, 8, 31)));
        assert!(!window.contains(date(2027, 3, 1)));
    }

    #[test]
    fn begin_run_resets_counters_and_cursor() {
        let key = ProgressKey::new("springfield", DocumentType::Minutes);
        let mut record = ProgressRecord::new(&key, ts(0));
        record.begin_run(IngestMode::Full, None, ts(1));
        record.record_batch(
            BatchCounts {
                fetched: 10,
                created: 9,
                updated: 0,
                errors: 1,
            },
            Some("p3".into()),
            ts(2),
        );
        record.mark_failed("boom", ts(3));

        let first_run = record.run_id;
        let second_run = record.begin_run(IngestMode::Incremental, None, ts(4));

        assert_ne!(first_run, Some(second_run));
        assert_eq!(record.status, IngestStatus::InProgress);
        assert_eq!(record.cursor, None);
        assert_eq!(record.records_fetched, 0);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.last_error, None);
    }

    #[test]
    fn failure_keeps_checkpoint() {
        let key = ProgressKey::new("springfield", DocumentType::Agendas);
        let mut record = ProgressRecord::new(&key, ts(0));
        record.begin_run(IngestMode::Full, None, ts(1));
        record.record_batch(
            BatchCounts {
                fetched: 5,
                created: 5,
                updated: 0,
                errors: 0,
            },
            Some("p2".into()),
            ts(2),
        );
        record.mark_failed("read timeout", ts(3));

        assert_eq!(record.status, IngestStatus::Failed);
        assert_eq!(record.cursor.as_deref(), Some("p2"));
        assert_eq!(record.records_created, 5);
        assert_eq!(record.retry_count, 1);

        let before = record.run_id;
        let resumed = record.resume(ts(4));
        assert_ne!(before, Some(resumed));
        assert_eq!(record.status, IngestStatus::InProgress);
        assert_eq!(record.cursor.as_deref(), Some("p2"));
        assert_eq!(record.last_error, None);
    }

    #[test]
    fn completing_full_run_clears_force_flag() {
        let key = ProgressKey::new("springfield", DocumentType::Minutes);
        let mut record = ProgressRecord::new(&key, ts(0));
        record.force_full_refresh = true;
        record.begin_run(IngestMode::Incremental, None, ts(1));
        record.mark_completed(ts(2));
        assert!(record.force_full_refresh);

        record.begin_run(IngestMode::Full, None, ts(3));
        record.mark_completed(ts(4));
        assert!(!record.force_full_refresh);
        assert_eq!(record.completed_at, Some(ts(4)));
    }

    #[test]
    fn empty_next_cursor_is_no_cursor() {
        let key = ProgressKey::new("springfield", DocumentType::Minutes);
        let mut record = ProgressRecord::new(&key, ts(0));
        record.record_batch(BatchCounts::default(), Some(String::new()), ts(1));
        assert_eq!(record.cursor, None);
    }

    #[test]
    fn staleness_only_applies_to_in_progress() {
        let key = ProgressKey::new("springfield", DocumentType::Minutes);
        let mut record = ProgressRecord::new(&key, ts(0));
        assert!(!record.is_stale(ts(5), chrono::Duration::hours(1)));
        record.begin_run(IngestMode::Full, None, ts(1));
        assert!(!record.is_stale(ts(2), chrono::Duration::hours(1)));
        assert!(record.is_stale(ts(5), chrono::Duration::hours(1)));
    }

    #[test]
    fn document_ids_are_deterministic() {
        let key = DocumentKey {
            tenant_id: "springfield".into(),
            document_type: DocumentType::Minutes,
            name: "City Council".into(),
            date: date(2025, 1, 14),
        };
        assert_eq!(key.deterministic_id(), key.clone().deterministic_id());
        let other = DocumentKey {
            document_type: DocumentType::Agendas,
            ..key.clone()
        };
        assert_ne!(key.deterministic_id(), other.deterministic_id());
    }

    #[test]
    fn work_units_serialize_with_kind_tag() {
        let unit = WorkUnit::Batch(BatchUnit::first(
            ProgressKey::new("springfield", DocumentType::Minutes),
            Uuid::nil(),
            None,
            Some(10),
        ));
        let value = serde_json::to_value(&unit).expect("serialize");
        assert_eq!(value["kind"], "batch");
        assert_eq!(value["key"]["document_type"], "minutes");
        let back: WorkUnit = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, unit);
    }

    #[test]
    fn enums_parse_from_storage_strings() {
        assert_eq!("in_progress".parse::<IngestStatus>(), Ok(IngestStatus::InProgress));
        assert_eq!("agendas".parse::<DocumentType>(), Ok(DocumentType::Agendas));
        assert!("weekly".parse::<IngestMode>().is_err());
    }
}
