//! Firestore backend over the REST `:runQuery` endpoint.

use super::auth::AccessTokenSource;
use super::{Document, DocumentStore, Filter, Query, StoreError};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

/// Connection settings for one Firestore database.
#[derive(Debug, Clone)]
pub struct FirestoreSettings {
    pub project_id: String,
    pub database: String,
    pub base_url: String,
}

pub struct FirestoreStore {
    settings: FirestoreSettings,
    tokens: AccessTokenSource,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    #[serde(default)]
    document: Option<RawDocument>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl FirestoreStore {
    pub fn new(settings: FirestoreSettings, tokens: AccessTokenSource, http: reqwest::Client) -> Self {
        Self {
            settings,
            tokens,
            http,
        }
    }

    fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.settings.project_id, self.settings.database
        )
    }

    fn run_query_url(&self, parent: &str) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        if parent.is_empty() {
            format!("{}/{}:runQuery", base, self.documents_root())
        } else {
            format!("{}/{}/{}:runQuery", base, self.documents_root(), parent)
        }
    }

    /// Structured query body for a collection query.
    fn encode_query(&self, query: &Query) -> Value {
        let (_, collection_id) = split_collection_path(&query.collection);

        let mut filters: Vec<Value> = Vec::new();
        for filter in &query.filters {
            match filter {
                Filter::TimestampAtLeast { field, since } => filters.push(field_filter(
                    field,
                    "GREATER_THAN_OR_EQUAL",
                    json!({ "timestampValue": since.to_rfc3339_opts(SecondsFormat::Micros, true) }),
                )),
                Filter::Equals { field, value } => {
                    filters.push(field_filter(field, "EQUAL", json!({ "stringValue": value })))
                }
                Filter::IdPrefix(prefix) => {
                    let base = format!("{}/{}", self.documents_root(), query.collection);
                    filters.push(field_filter(
                        "__name__",
                        "GREATER_THAN_OR_EQUAL",
                        json!({ "referenceValue": format!("{}/{}", base, prefix) }),
                    ));
                    filters.push(field_filter(
                        "__name__",
                        "LESS_THAN",
                        json!({ "referenceValue": format!("{}/{}\u{f8ff}", base, prefix) }),
                    ));
                }
            }
        }

        let mut structured = json!({ "from": [{ "collectionId": collection_id }] });
        match filters.len() {
            0 => {}
            1 => structured["where"] = filters.remove(0),
            _ => {
                structured["where"] = json!({
                    "compositeFilter": { "op": "AND", "filters": filters }
                })
            }
        }

        json!({ "structuredQuery": structured })
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    fn backend_tag(&self) -> &'static str {
        "firestore"
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let (parent, _) = split_collection_path(&query.collection);
        let url = self.run_query_url(parent);
        let body = self.encode_query(query);
        let token = self.tokens.token().await?;

        debug!("runQuery {} ({} filters)", query.collection, query.filters.len());

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api { status, body });
        }

        let text = response.text().await?;
        parse_run_query_response(&text)
    }
}

/// Split `a/b/c` into the parent document path `a/b` and collection id `c`.
fn split_collection_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, id)) => (parent, id),
        None => ("", path),
    }
}

fn field_filter(field: &str, op: &str, value: Value) -> Value {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": field },
            "op": op,
            "value": value
        }
    })
}

fn parse_run_query_response(text: &str) -> Result<Vec<Document>, StoreError> {
    let items: Vec<RunQueryItem> =
        serde_json::from_str(text).map_err(|e| StoreError::Malformed(e.to_string()))?;

    Ok(items
        .into_iter()
        .filter_map(|item| item.document)
        .map(|raw| {
            let id = raw.name.rsplit('/').next().unwrap_or_default().to_string();
            let fields = raw
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), decode_value(v)))
                .collect();
            Document { id, fields }
        })
        .collect())
}

/// Convert a typed Firestore value into plain JSON.
fn decode_value(value: &Value) -> Value {
    let Some((kind, inner)) = value.as_object().and_then(|m| m.iter().next()) else {
        return Value::Null;
    };

    match kind.as_str() {
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "booleanValue" | "doubleValue" | "geoPointValue" => inner.clone(),
        "integerValue" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::from)
            .unwrap_or_else(|| inner.clone()),
        "mapValue" => {
            let fields = inner
                .get("fields")
                .and_then(Value::as_object)
                .map(|f| f.iter().map(|(k, v)| (k.clone(), decode_value(v))).collect())
                .unwrap_or_default();
            Value::Object(fields)
        }
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|vals| vals.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        _ => Value::Null,
    }
}
