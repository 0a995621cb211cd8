//! In-memory document store.
//!
//! Backs offline runs from a JSON export (`--dump`) and the tests. A dump
//! maps collection paths to arrays of documents; each document's `id` key
//! becomes the document id and the remaining keys its fields.

use super::{Document, DocumentStore, Query, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: HashMap<String, Vec<Document>>,
    failing: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection: &str, doc: Document) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(doc);
    }

    pub fn with_documents(
        mut self,
        collection: &str,
        docs: impl IntoIterator<Item = Document>,
    ) -> Self {
        for doc in docs {
            self.insert(collection, doc);
        }
        self
    }

    /// Make every query against `collection` fail.
    #[cfg(test)]
    pub fn fail_collection(mut self, collection: &str) -> Self {
        self.failing.insert(collection.to_string());
        self
    }

    /// Load a JSON export from disk.
    pub fn from_dump(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dump file: {}", path.display()))?;
        Self::from_dump_str(&content)
            .with_context(|| format!("Failed to parse dump file: {}", path.display()))
    }

    pub fn from_dump_str(content: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(content)?;
        let Value::Object(collections) = root else {
            anyhow::bail!("dump must be a JSON object keyed by collection path");
        };

        let mut store = Self::new();
        for (collection, docs) in collections {
            let Value::Array(docs) = docs else {
                anyhow::bail!("collection '{}' must be an array of documents", collection);
            };

            for (index, doc) in docs.into_iter().enumerate() {
                let Value::Object(mut fields) = doc else {
                    anyhow::bail!("document {} in '{}' is not an object", index, collection);
                };
                let id = match fields.remove("id") {
                    Some(Value::String(id)) => id,
                    _ => format!("{}-{}", collection.replace('/', "_"), index),
                };
                store.insert(&collection, Document::new(id, Value::Object(fields)));
            }
        }

        debug!("Loaded {} collections from dump", store.collections.len());
        Ok(store)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        if self.failing.contains(&query.collection) {
            return Err(StoreError::Unavailable(query.collection.clone()));
        }

        // Missing collections read as empty, as they do in Firestore.
        Ok(self
            .collections
            .get(&query.collection)
            .map(|docs| docs.iter().filter(|d| query.matches(d)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_query_applies_filters() {
        let store = MemoryStore::new().with_documents(
            "protocol_uploads",
            vec![
                Document::new("a", json!({"status": "success"})),
                Document::new("b", json!({"status": "failure"})),
            ],
        );

        let docs = tokio_test::block_on(
            store.query(&Query::collection("protocol_uploads").equals("status", "success")),
        )
        .unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "a");
    }

    #[test]
    fn test_missing_collection_is_empty() {
        let store = MemoryStore::new();
        let docs = tokio_test::block_on(store.query(&Query::collection("events"))).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn test_failing_collection_errors() {
        let store = MemoryStore::new().fail_collection("users");
        let result = tokio_test::block_on(store.query(&Query::collection("users")));
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_from_dump_str() {
        let dump = r#"{
            "events": [
                {"id": "2025-11_a", "category": "quiz", "action": "quiz_completed"},
                {"category": "scenario", "action": "completed"}
            ],
            "events/2025-11/entries": [
                {"id": "x", "category": "quiz", "action": "quiz_started"}
            ]
        }"#;

        let store = MemoryStore::from_dump_str(dump).unwrap();
        let events = tokio_test::block_on(store.query(&Query::collection("events"))).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "2025-11_a");
        assert_eq!(events[1].id, "events-1");
        assert!(!events[0].fields.contains_key("id"));

        let shard = tokio_test::block_on(
            store.query(&Query::collection("events/2025-11/entries")),
        )
        .unwrap();
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_from_dump_rejects_bad_shapes() {
        assert!(MemoryStore::from_dump_str("[]").is_err());
        assert!(MemoryStore::from_dump_str(r#"{"events": {}}"#).is_err());
        assert!(MemoryStore::from_dump_str(r#"{"events": [1]}"#).is_err());
    }

    #[test]
    fn test_from_dump_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"users": [{{"id": "u1"}}]}}"#).unwrap();

        let store = MemoryStore::from_dump(file.path()).unwrap();
        let users = tokio_test::block_on(store.query(&Query::collection("users"))).unwrap();
        assert_eq!(users[0].id, "u1");
    }
}
