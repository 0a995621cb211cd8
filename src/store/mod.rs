//! Document store access.
//!
//! The jobs only need to list documents in a named collection, optionally
//! narrowed by a field range, a field equality or a document-id prefix.
//! Stores are constructed explicitly and passed in, so the Firestore
//! backend and the in-memory store are interchangeable.

pub mod auth;
pub mod firestore;
pub mod memory;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use firestore::FirestoreStore;
pub use memory::MemoryStore;

/// A failed read against the document store. These are always recoverable
/// at the metric level.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to document store failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("document store returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("collection unavailable: {0}")]
    Unavailable(String),
}

/// A stored document: its id plus its plain-JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Build a document from a JSON object. Non-object values yield no fields.
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            fields,
        }
    }

    /// A non-empty string field.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn timestamp_field(&self, name: &str) -> Option<DateTime<Utc>> {
        self.fields.get(name).and_then(parse_timestamp)
    }
}

/// Parse the timestamp shapes the store and its exports produce: RFC 3339
/// strings, `{_seconds, _nanoseconds}` / `{seconds, nanos}` objects, and
/// integer epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(map) => {
            let seconds = map
                .get("_seconds")
                .or_else(|| map.get("seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("_nanoseconds")
                .or_else(|| map.get("nanos"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, nanos as u32).single()
        }
        _ => None,
    }
}

/// A single restriction on a collection query.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field >= since`.
    TimestampAtLeast { field: String, since: DateTime<Utc> },
    /// `field == value` for string fields.
    Equals { field: String, value: String },
    /// Document ids starting with the prefix.
    IdPrefix(String),
}

impl Filter {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::TimestampAtLeast { field, since } => doc
                .timestamp_field(field)
                .is_some_and(|ts| ts >= *since),
            Filter::Equals { field, value } => doc.str_field(field) == Some(value.as_str()),
            Filter::IdPrefix(prefix) => doc.id.starts_with(prefix.as_str()),
        }
    }
}

/// A collection-scoped query. Collection paths may address
/// sub-collections, e.g. `events/2025-11/entries`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn since(self, field: &str, since: DateTime<Utc>) -> Self {
        self.filter(Filter::TimestampAtLeast {
            field: field.to_string(),
            since,
        })
    }

    pub fn equals(self, field: &str, value: &str) -> Self {
        self.filter(Filter::Equals {
            field: field.to_string(),
            value: value.to_string(),
        })
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }
}

/// Read access to a document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short name for logs.
    fn backend_tag(&self) -> &'static str;

    /// Return every document in the query's collection that passes its filters.
    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_shapes() {
        let expected = Utc.with_ymd_and_hms(2025, 11, 22, 10, 30, 0).unwrap();

        assert_eq!(
            parse_timestamp(&json!("2025-11-22T10:30:00Z")),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp(&json!({"_seconds": expected.timestamp(), "_nanoseconds": 0})),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp(&json!({"seconds": expected.timestamp()})),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp(&json!(expected.timestamp_millis())),
            Some(expected)
        );
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }

    #[test]
    fn test_str_field_ignores_empty_and_non_strings() {
        let doc = Document::new("a", json!({"userId": "", "status": "success", "n": 3}));
        assert_eq!(doc.str_field("userId"), None);
        assert_eq!(doc.str_field("status"), Some("success"));
        assert_eq!(doc.str_field("n"), None);
        assert_eq!(doc.str_field("missing"), None);
    }

    #[test]
    fn test_query_filters_combine() {
        let since = Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap();
        let query = Query::collection("protocol_uploads")
            .equals("status", "success")
            .since("timestamp", since);

        let recent_ok = Document::new(
            "1",
            json!({"status": "success", "timestamp": "2025-11-05T00:00:00Z"}),
        );
        let recent_failed = Document::new(
            "2",
            json!({"status": "failure", "timestamp": "2025-11-05T00:00:00Z"}),
        );
        let old_ok = Document::new(
            "3",
            json!({"status": "success", "timestamp": "2025-10-05T00:00:00Z"}),
        );

        assert!(query.matches(&recent_ok));
        assert!(!query.matches(&recent_failed));
        assert!(!query.matches(&old_ok));
    }

    #[test]
    fn test_id_prefix_filter() {
        let filter = Filter::IdPrefix("2025-11_".to_string());
        assert!(filter.matches(&Document::new("2025-11_abc", json!({}))));
        assert!(!filter.matches(&Document::new("2025-10_abc", json!({}))));
    }
}
