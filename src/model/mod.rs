//! Data model shared by the store, the chunker and the sync channel.
//!
//! Wire and storage formats are JSON with camelCase keys. Descriptive record
//! fields are kept as an open map so that records written by newer clients
//! survive a round trip through older ones.

pub mod thread;

pub use thread::{Comment, ProposalTally, Thread, VoteKind, Votes, MIN_PROPOSAL_VOTES};

use chrono::{DateTime, NaiveDate};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

/// Comment cooldown applied when a record does not configure one
pub const DEFAULT_COMMENT_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// A single report. Immutable once created except through field proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty", deserialize_with = "null_as_default")]
    pub editable_fields: BTreeSet<String>,
    /// Per-record comment cooldown in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_cooldown: Option<u64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, created_at: u64) -> Self {
        Self {
            id: id.into(),
            created_at,
            creator_id: None,
            editable_fields: BTreeSet::new(),
            comment_cooldown: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Field rendered as comparable text; missing and null become empty
    pub fn field_text(&self, name: &str) -> String {
        match self.fields.get(name) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    pub fn is_editable(&self, field: &str) -> bool {
        self.editable_fields.contains(field)
    }

    pub fn comment_cooldown(&self) -> Duration {
        self.comment_cooldown
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_COMMENT_COOLDOWN)
    }
}

/// All records and threads for one country
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    #[serde(default, deserialize_with = "lenient_records")]
    pub records: Vec<Record>,
    #[serde(default, deserialize_with = "lenient_threads")]
    pub threads: BTreeMap<String, Thread>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_update: u64,
}

impl Dataset {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a stored or received payload, treating garbage as an empty dataset
    pub fn from_json_lenient(bytes: &[u8]) -> Self {
        let parsed = serde_json::from_slice::<Value>(bytes).and_then(|value| match value {
            Value::Object(_) => serde_json::from_value(value),
            other => Err(serde_json::Error::custom(format!("expected an object, got {}", other))),
        });
        match parsed {
            Ok(dataset) => dataset,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed dataset payload, using empty dataset");
                Self::default()
            }
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.threads.is_empty()
    }

    pub fn record_ids(&self) -> HashSet<&str> {
        self.records.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn contains_record(&self, id: &str) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn record(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Append the record unless its id is already present. Returns true when inserted.
    pub fn insert_record_if_absent(&mut self, record: Record) -> bool {
        if self.contains_record(&record.id) {
            return false;
        }
        self.threads.entry(record.id.clone()).or_default();
        self.records.push(record);
        true
    }

    /// Thread for a record, created empty on first access
    pub fn thread_mut(&mut self, record_id: &str) -> &mut Thread {
        self.threads.entry(record_id.to_string()).or_default()
    }

    /// Bump `last_update` without moving it backwards
    pub fn touch(&mut self, now_ms: u64) {
        self.last_update = self.last_update.max(now_ms);
    }
}

/// Lightweight projection persisted alongside chunks in chunked mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordIndexEntry {
    pub id: String,
    #[serde(default)]
    pub nombres: Value,
    #[serde(default)]
    pub apellidos: Value,
    #[serde(default)]
    pub edad: Value,
    #[serde(default)]
    pub departamento: Value,
    #[serde(default)]
    pub created_at: u64,
}

impl From<&Record> for RecordIndexEntry {
    fn from(record: &Record) -> Self {
        let get = |name: &str| record.field(name).cloned().unwrap_or(Value::Null);
        Self {
            id: record.id.clone(),
            nombres: get("nombres"),
            apellidos: get("apellidos"),
            edad: get("edad"),
            departamento: get("departamento"),
            created_at: record.created_at,
        }
    }
}

/// Deserialize `null` the same as a missing field
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Millisecond timestamp from an integer, a float, a numeric string or a date
/// string. Anything else, including negative values, reads as 0.
pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(timestamp_from_value(&Value::deserialize(deserializer)?))
}

fn timestamp_from_value(value: &Value) -> u64 {
    let from_float = |f: f64| (f.is_finite() && f >= 0.0).then(|| f as u64);
    let millis = match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(from_float)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(from_float))
                .or_else(|| {
                    DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|dt| dt.timestamp_millis())
                        .or_else(|| {
                            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                                .ok()
                                .and_then(|d| d.and_hms_opt(0, 0, 0))
                                .map(|dt| dt.and_utc().timestamp_millis())
                        })
                        .and_then(|ms| u64::try_from(ms).ok())
                })
        }
        _ => None,
    };
    millis.unwrap_or(0)
}

/// Record ids arrive as strings, but older writers sent bare numbers
fn lenient_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("record id must be a string or number, got {}", other))),
    }
}

/// Decode records one by one, dropping those that fail instead of the whole list
fn lenient_records<'de, D>(deserializer: D) -> Result<Vec<Record>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        Value::Null => return Ok(Vec::new()),
        other => {
            tracing::warn!(found = %other, "Records payload is not a list, ignoring it");
            return Ok(Vec::new());
        }
    };

    Ok(items
        .into_iter()
        .enumerate()
        .filter_map(|(position, item)| match serde_json::from_value::<Record>(item) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(position = position, error = %e, "Skipping malformed record");
                None
            }
        })
        .collect())
}

fn lenient_threads<'de, D>(deserializer: D) -> Result<BTreeMap<String, Thread>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = match Value::deserialize(deserializer)? {
        Value::Object(entries) => entries,
        Value::Null => return Ok(BTreeMap::new()),
        other => {
            tracing::warn!(found = %other, "Threads payload is not a map, ignoring it");
            return Ok(BTreeMap::new());
        }
    };

    Ok(entries
        .into_iter()
        .filter_map(|(record_id, item)| match serde_json::from_value::<Thread>(item) {
            Ok(thread) => Some((record_id, thread)),
            Err(e) => {
                tracing::warn!(record_id = %record_id, error = %e, "Skipping malformed thread");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_collections_normalize_to_empty() {
        let dataset: Dataset = serde_json::from_value(json!({ "lastUpdate": 10 })).unwrap();
        assert!(dataset.records.is_empty());
        assert!(dataset.threads.is_empty());
        assert_eq!(dataset.last_update, 10);

        let dataset: Dataset =
            serde_json::from_value(json!({ "records": null, "threads": null })).unwrap();
        assert_eq!(dataset, Dataset::empty());
    }

    #[test]
    fn garbage_payload_is_empty() {
        assert_eq!(Dataset::from_json_lenient(b"not json"), Dataset::empty());
        assert_eq!(Dataset::from_json_lenient(b"[1,2,3]"), Dataset::empty());
    }

    #[test]
    fn one_bad_record_does_not_sink_the_rest() {
        let raw = json!({
            "records": [
                { "id": "a", "createdAt": 1 },
                { "id": "b", "createdAt": 2 },
                { "id": "c", "createdAt": "2024-01-01" },
                { "id": 42, "createdAt": 17.9 },
                { "id": { "nested": true }, "createdAt": 3 },
                "not a record"
            ],
            "threads": { "a": { "votes": { "approve": 1 } }, "b": "garbage" },
            "lastUpdate": "1700000000000"
        });
        let dataset = Dataset::from_json_lenient(raw.to_string().as_bytes());

        let ids: Vec<&str> = dataset.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "42"]);
        assert_eq!(dataset.records[2].created_at, 1_704_067_200_000);
        assert_eq!(dataset.records[3].created_at, 17);
        assert_eq!(dataset.threads.len(), 1);
        assert_eq!(dataset.threads["a"].votes.approve, 1);
        assert_eq!(dataset.last_update, 1_700_000_000_000);
    }

    #[test]
    fn odd_timestamps_read_as_zero() {
        for raw in [json!(-5), json!("yesterday"), json!({ "at": 1 }), json!(null), json!(true)] {
            assert_eq!(timestamp_from_value(&raw), 0, "{raw}");
        }
        assert_eq!(timestamp_from_value(&json!("2024-01-01T00:00:01Z")), 1_704_067_201_000);
    }

    #[test]
    fn record_keeps_unknown_fields() {
        let raw = json!({
            "id": "r1",
            "createdAt": 1700000000000u64,
            "nombres": "Ana",
            "edad": 30,
            "pruebas": ["a.png"],
            "editableFields": ["ocupacion"],
            "commentCooldown": 120000
        });
        let record: Record = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.field_text("nombres"), "Ana");
        assert_eq!(record.field_text("edad"), "30");
        assert_eq!(record.field_text("distrito"), "");
        assert!(record.is_editable("ocupacion"));
        assert_eq!(record.comment_cooldown(), Duration::from_secs(120));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn default_cooldown_is_one_hour() {
        let record = Record::new("r1", 0);
        assert_eq!(record.comment_cooldown(), DEFAULT_COMMENT_COOLDOWN);
    }

    #[test]
    fn insert_if_absent_creates_thread() {
        let mut dataset = Dataset::empty();
        assert!(dataset.insert_record_if_absent(Record::new("a", 1)));
        assert!(!dataset.insert_record_if_absent(Record::new("a", 2)));
        assert_eq!(dataset.record_count(), 1);
        assert!(dataset.threads.contains_key("a"));
    }

    #[test]
    fn index_entry_projects_fields() {
        let record = Record::new("r9", 5)
            .with_field("nombres", "Luis")
            .with_field("edad", 41)
            .with_field("ocupacion", "chef");
        let entry = RecordIndexEntry::from(&record);
        assert_eq!(entry.id, "r9");
        assert_eq!(entry.nombres, json!("Luis"));
        assert_eq!(entry.edad, json!(41));
        assert_eq!(entry.departamento, Value::Null);
        assert_eq!(entry.created_at, 5);
    }
}
