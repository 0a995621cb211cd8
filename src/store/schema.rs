//! Normalization adapters for the stored event schemas.
//!
//! Event data has been written in three shapes over the app's lifetime:
//! a flat `events` collection, per-month sharded sub-collections, and
//! separate collections that only hold successful outcomes. Each shape has
//! one adapter that knows which collections to query and how to extract a
//! normalized [`EventRecord`]; the aggregator never sees the difference.

use super::{Document, DocumentStore, Filter, Query, StoreError};
use crate::config::SourceConfig;
use crate::models::{Category, EventRecord, MonthKey, UploadRecord, UploadStatus, UserRecord};
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use tracing::debug;

/// One historical event schema.
pub trait EventSchema: Send + Sync {
    fn name(&self) -> &'static str;

    /// Queries covering this schema's data up to `today`.
    fn queries(&self, today: NaiveDate) -> Vec<Query>;

    /// Extract a record from a document read from `collection`.
    /// Documents that cannot be interpreted are skipped.
    /// Documents without a category or action still become records so their
    /// user id is counted; they match no counting rule.
    fn normalize(&self, collection: &str, doc: &Document) -> Option<EventRecord>;
}

fn category_of(doc: &Document) -> Category {
    doc.str_field("category")
        .map(Category::from)
        .unwrap_or_else(|| Category::Other(String::new()))
}

fn action_of(doc: &Document) -> String {
    doc.str_field("action").unwrap_or_default().to_string()
}

/// The original flat `events` collection. Document ids look like
/// `2025-11_<suffix>`.
#[derive(Debug, Clone)]
pub struct FlatEvents {
    pub collection: String,
    /// Restrict to one partition through an id-prefix range.
    pub month: Option<MonthKey>,
}

impl EventSchema for FlatEvents {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn queries(&self, _today: NaiveDate) -> Vec<Query> {
        let query = Query::collection(self.collection.clone());
        match self.month {
            Some(month) => vec![query.filter(Filter::IdPrefix(format!("{}_", month)))],
            None => vec![query],
        }
    }

    fn normalize(&self, _collection: &str, doc: &Document) -> Option<EventRecord> {
        Some(EventRecord {
            category: category_of(doc),
            action: action_of(doc),
            user_id: doc.str_field("userId").map(String::from),
            timestamp: doc.timestamp_field("timestamp"),
            partition: partition_from_id(&doc.id),
        })
    }
}

/// Per-month shards at `<collection>/<YYYY-MM>/<subcollection>`.
#[derive(Debug, Clone)]
pub struct MonthlyShards {
    pub collection: String,
    pub subcollection: String,
    pub since: MonthKey,
}

impl MonthlyShards {
    fn shard_path(&self, month: MonthKey) -> String {
        format!("{}/{}/{}", self.collection, month, self.subcollection)
    }

    fn shard_month(&self, path: &str) -> Option<MonthKey> {
        path.strip_prefix(self.collection.as_str())?
            .strip_prefix('/')?
            .strip_suffix(self.subcollection.as_str())?
            .strip_suffix('/')?
            .parse::<MonthKey>()
            .ok()
    }
}

impl EventSchema for MonthlyShards {
    fn name(&self) -> &'static str {
        "monthly"
    }

    fn queries(&self, today: NaiveDate) -> Vec<Query> {
        self.since
            .through(MonthKey::of(today))
            .into_iter()
            .map(|month| Query::collection(self.shard_path(month)))
            .collect()
    }

    fn normalize(&self, collection: &str, doc: &Document) -> Option<EventRecord> {
        let partition = self.shard_month(collection);
        let timestamp = doc
            .timestamp_field("timestamp")
            .or_else(|| doc.timestamp_field("createdAt"))
            .or_else(|| partition.and_then(MonthKey::first_instant));

        Some(EventRecord {
            category: category_of(doc),
            action: action_of(doc),
            user_id: doc
                .str_field("userId")
                .or_else(|| doc.str_field("uid"))
                .map(String::from),
            timestamp,
            partition,
        })
    }
}

/// A collection holding only successful outcomes of one milestone.
#[derive(Debug, Clone)]
pub struct SuccessCollection {
    pub collection: String,
    pub category: Category,
    pub action: String,
}

impl EventSchema for SuccessCollection {
    fn name(&self) -> &'static str {
        "success"
    }

    fn queries(&self, _today: NaiveDate) -> Vec<Query> {
        vec![Query::collection(self.collection.clone())]
    }

    fn normalize(&self, _collection: &str, doc: &Document) -> Option<EventRecord> {
        let timestamp = doc.timestamp_field("timestamp");
        Some(EventRecord {
            category: self.category.clone(),
            action: self.action.clone(),
            user_id: doc.str_field("userId").map(String::from),
            timestamp,
            partition: timestamp.map(|ts| MonthKey::of(ts.date_naive())),
        })
    }
}

fn partition_from_id(id: &str) -> Option<MonthKey> {
    id.split_once('_').and_then(|(prefix, _)| prefix.parse().ok())
}

/// Build the adapters named in the configuration. Bad month keys are
/// configuration errors.
pub fn build_schemas(sources: &[SourceConfig]) -> Result<Vec<Box<dyn EventSchema>>> {
    sources
        .iter()
        .map(|source| -> Result<Box<dyn EventSchema>> {
            Ok(match source {
                SourceConfig::Flat { collection, month } => Box::new(FlatEvents {
                    collection: collection.clone(),
                    month: month
                        .as_deref()
                        .map(str::parse::<MonthKey>)
                        .transpose()
                        .map_err(|e| anyhow!("events source '{}': {}", collection, e))?,
                }),
                SourceConfig::Monthly {
                    collection,
                    subcollection,
                    since,
                } => Box::new(MonthlyShards {
                    collection: collection.clone(),
                    subcollection: subcollection.clone(),
                    since: since
                        .parse::<MonthKey>()
                        .map_err(|e| anyhow!("events source '{}': {}", collection, e))?,
                }),
                SourceConfig::Success {
                    collection,
                    category,
                    action,
                } => Box::new(SuccessCollection {
                    collection: collection.clone(),
                    category: Category::from(category.as_str()),
                    action: action.clone(),
                }),
            })
        })
        .collect()
}

/// Read and normalize every configured event source. Any failed read fails
/// the whole set, so partial event counts are never reported.
pub async fn read_events(
    store: &dyn DocumentStore,
    schemas: &[Box<dyn EventSchema>],
    today: NaiveDate,
) -> Result<Vec<EventRecord>, StoreError> {
    let mut records = Vec::new();

    for schema in schemas {
        for query in schema.queries(today) {
            let docs = store.query(&query).await?;
            let before = records.len();
            records.extend(
                docs.iter()
                    .filter_map(|doc| schema.normalize(&query.collection, doc)),
            );
            let kept = records.len() - before;
            if kept < docs.len() {
                debug!(
                    "{} schema skipped {} uninterpretable documents in {}",
                    schema.name(),
                    docs.len() - kept,
                    query.collection
                );
            }
        }
    }

    Ok(records)
}

impl UploadRecord {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            user_id: doc.str_field("userId").map(String::from),
            status: doc
                .str_field("status")
                .map(UploadStatus::from)
                .unwrap_or(UploadStatus::Unknown),
            protocol_name: doc.str_field("protocolName").map(String::from),
            timestamp: doc.timestamp_field("timestamp"),
        }
    }
}

impl UserRecord {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            last_active: doc.timestamp_field("lastActive"),
        }
    }
}
