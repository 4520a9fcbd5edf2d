//! Record grouping and per-record upserts.
//!
//! Rows are validated one by one and grouped into meetings keyed by
//! (name, date). Each group is written in one store call; a bad row costs one
//! error, a failed page upsert costs one error, and a failed group costs one
//! error. None of these abort the batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use sluice_core::{BatchCounts, DocumentKey, NewChildRecord, ProgressKey, UpsertOutcome};
use sluice_storage::IngestStore;
use tracing::{debug, warn};

use crate::RowError;

/// A row that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRow {
    pub document: DocumentKey,
    pub child: NewChildRecord,
}

fn remote_id(row: &JsonValue) -> Result<String, RowError> {
    match row.get("id") {
        None | Some(JsonValue::Null) => Err(RowError::Missing("id")),
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(JsonValue::String(_)) => Err(RowError::Missing("id")),
        Some(JsonValue::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Some(other) => Err(RowError::Invalid {
            field: "id",
            reason: format!("expected string or integer, got {other}"),
        }),
    }
}

fn required_str<'a>(row: &'a JsonValue, field: &'static str) -> Result<&'a str, RowError> {
    match row.get(field).and_then(JsonValue::as_str).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(RowError::Missing(field)),
    }
}

/// Accepts `YYYY-MM-DD` or any longer ISO timestamp by its date prefix.
pub fn parse_row_date(raw: &str) -> Result<NaiveDate, RowError> {
    let candidate = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(candidate, "%Y-%m-%d").map_err(|e| RowError::Invalid {
        field: "date",
        reason: format!("`{raw}`: {e}"),
    })
}

fn ordinal(row: &JsonValue) -> Result<i64, RowError> {
    match row.get("ordinal") {
        None | Some(JsonValue::Null) => Ok(0),
        Some(JsonValue::Number(n)) => n.as_i64().ok_or_else(|| RowError::Invalid {
            field: "ordinal",
            reason: format!("`{n}` is not an integer"),
        }),
        Some(JsonValue::String(s)) => s.trim().parse().map_err(|_| RowError::Invalid {
            field: "ordinal",
            reason: format!("`{s}` is not an integer"),
        }),
        Some(other) => Err(RowError::Invalid {
            field: "ordinal",
            reason: format!("unexpected {other}"),
        }),
    }
}

fn optional_str(row: &JsonValue, field: &'static str) -> Result<Option<String>, RowError> {
    match row.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(RowError::Invalid {
            field,
            reason: format!("expected string, got {other}"),
        }),
    }
}

pub fn validate_row(key: &ProgressKey, row: &JsonValue) -> Result<ValidatedRow, RowError> {
    if !row.is_object() {
        return Err(RowError::NotAnObject);
    }
    let remote_id = remote_id(row)?;
    let name = required_str(row, "name")?;
    let date = parse_row_date(required_str(row, "date")?)?;

    Ok(ValidatedRow {
        document: DocumentKey {
            tenant_id: key.tenant_id.clone(),
            document_type: key.document_type,
            name: name.to_string(),
            date,
        },
        child: NewChildRecord {
            remote_id,
            ordinal: ordinal(row)?,
            text: optional_str(row, "text")?.unwrap_or_default(),
            media_ref: optional_str(row, "media_ref")?.filter(|m| !m.is_empty()),
        },
    })
}

/// Rows grouped by meeting, plus the rows that failed validation.
#[derive(Debug, Default)]
pub struct GroupedRows {
    pub groups: BTreeMap<DocumentKey, Vec<NewChildRecord>>,
    pub rejected: Vec<(usize, RowError)>,
}

pub fn group_rows(key: &ProgressKey, rows: &[JsonValue]) -> GroupedRows {
    let mut grouped = GroupedRows::default();
    for (index, row) in rows.iter().enumerate() {
        match validate_row(key, row) {
            Ok(valid) => grouped.groups.entry(valid.document).or_default().push(valid.child),
            Err(err) => grouped.rejected.push((index, err)),
        }
    }
    grouped
}

pub struct RecordUpserter {
    store: Arc<dyn IngestStore>,
}

impl RecordUpserter {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    /// Validates, groups and writes `rows`; never fails as a whole.
    pub async fn process(&self, key: &ProgressKey, rows: &[JsonValue]) -> BatchCounts {
        let mut counts = BatchCounts {
            fetched: rows.len() as u64,
            ..BatchCounts::default()
        };

        let grouped = group_rows(key, rows);
        for (index, err) in &grouped.rejected {
            warn!(
                %key,
                row = index,
                remote_id = ?rows[*index].get("id"),
                error = %err,
                "skipping malformed row"
            );
            counts.errors += 1;
        }

        for (document, children) in &grouped.groups {
            let write = match self.store.write_document_group(document, children).await {
                Ok(write) => write,
                Err(err) => {
                    warn!(
                        %key,
                        name = %document.name,
                        date = %document.date,
                        pages = children.len(),
                        error = %err,
                        "skipping document group"
                    );
                    counts.errors += 1;
                    continue;
                }
            };

            for (child, outcome) in children.iter().zip(write.outcomes) {
                match outcome {
                    Ok(UpsertOutcome::Created) => counts.created += 1,
                    Ok(UpsertOutcome::Updated) => counts.updated += 1,
                    Err(err) => {
                        warn!(
                            %key,
                            remote_id = %child.remote_id,
                            document_id = %write.document.id,
                            error = %err,
                            "page upsert failed"
                        );
                        counts.errors += 1;
                    }
                }
            }
        }

        debug!(%key, ?counts, groups = grouped.groups.len(), "processed rows");
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::DocumentType;
    use sluice_storage::MemoryStore;

    fn key() -> ProgressKey {
        ProgressKey::new("springfield", DocumentType::Minutes)
    }

    #[test]
    fn validation_accepts_lenient_shapes() {
        let row = json!({
            "id": 42,
            "name": " City Council ",
            "date": "2025-01-14T19:00:00",
            "ordinal": "3",
            "text": "Call to order",
        });
        let valid = validate_row(&key(), &row).expect("valid");
        assert_eq!(valid.child.remote_id, "42");
        assert_eq!(valid.child.ordinal, 3);
        assert_eq!(valid.child.media_ref, None);
        assert_eq!(valid.document.name, "City Council");
        assert_eq!(valid.document.date, NaiveDate::from_ymd_opt(2025, 1, 14).unwrap());
    }

    #[test]
    fn validation_rejects_missing_name_date_and_id() {
        let cases = [
            (json!({"id": "a", "date": "2025-01-14"}), RowError::Missing("name")),
            (json!({"id": "a", "name": "Council"}), RowError::Missing("date")),
            (json!({"name": "Council", "date": "2025-01-14"}), RowError::Missing("id")),
            (json!({"id": "", "name": "Council", "date": "2025-01-14"}), RowError::Missing("id")),
        ];
        for (row, expected) in cases {
            assert_eq!(validate_row(&key(), &row).unwrap_err(), expected);
        }
        assert!(matches!(
            validate_row(&key(), &json!({"id": "a", "name": "Council", "date": "14/01/2025"})),
            Err(RowError::Invalid { field: "date", .. })
        ));
        assert_eq!(validate_row(&key(), &json!("row")).unwrap_err(), RowError::NotAnObject);
    }

    #[test]
    fn rows_group_by_name_and_date() {
        let rows = vec![
            json!({"id": "1", "name": "Council", "date": "2025-01-14", "ordinal": 1}),
            json!({"id": "2", "name": "Council", "date": "2025-01-14", "ordinal": 2}),
            json!({"id": "3", "name": "Planning", "date": "2025-01-14", "ordinal": 1}),
            json!({"id": "4", "date": "2025-01-14"}),
        ];
        let grouped = group_rows(&key(), &rows);
        assert_eq!(grouped.groups.len(), 2);
        assert_eq!(grouped.rejected.len(), 1);
        assert_eq!(grouped.rejected[0].0, 3);
    }

    #[tokio::test]
    async fn one_malformed_row_costs_exactly_one_error() {
        let store = Arc::new(MemoryStore::new());
        let upserter = RecordUpserter::new(store.clone());
        let mut rows: Vec<JsonValue> = (1..=4)
            .map(|i| {
                json!({
                    "id": format!("p-{i}"),
                    "name": "Council",
                    "date": "2025-01-14",
                    "ordinal": i,
                })
            })
            .collect();
        rows.insert(2, json!({"id": "broken", "name": "", "date": "2025-01-14"}));

        let counts = upserter.process(&key(), &rows).await;
        assert_eq!(
            counts,
            BatchCounts {
                fetched: 5,
                created: 4,
                updated: 0,
                errors: 1,
            }
        );
        assert_eq!(store.count_children("springfield", DocumentType::Minutes).await.unwrap(), 4);
        assert_eq!(store.count_documents("springfield", DocumentType::Minutes).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reprocessing_reports_updates_not_creates() {
        let store = Arc::new(MemoryStore::new());
        let upserter = RecordUpserter::new(store.clone());
        let rows = vec![
            json!({"id": "p-1", "name": "Council", "date": "2025-01-14", "text": "v1"}),
            json!({"id": "p-2", "name": "Council", "date": "2025-01-14", "text": "v1"}),
        ];
        upserter.process(&key(), &rows).await;
        let again = upserter.process(&key(), &rows).await;
        assert_eq!(again.created, 0);
        assert_eq!(again.updated, 2);
        assert_eq!(store.count_children("springfield", DocumentType::Minutes).await.unwrap(), 2);
    }
}
