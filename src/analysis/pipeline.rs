//! The stats run: read once, aggregate, fold into a snapshot.
//!
//! Each read is independent. A failed read only affects the metrics that
//! depend on it: those become `null` (or `[]`) and are listed in the
//! snapshot's `degraded` field, while everything else is still reported.

use super::aggregator::{
    count_active_users, count_by_category_action, count_distinct_users, count_retained,
    protocol_label, success_rate, top_n, CounterRules, ExclusionRule,
};
use crate::config::{Config, StatsConfig};
use crate::models::{metric, RawStats, StatsSnapshot, UploadRecord, UploadStatus, UserRecord, Window};
use crate::report::build_display;
use crate::store::schema::{build_schemas, read_events, EventSchema};
use crate::store::{Document, DocumentStore, Query, StoreError};
use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct StatsPipeline<'a> {
    store: &'a dyn DocumentStore,
    schemas: Vec<Box<dyn EventSchema>>,
    rules: CounterRules,
    exclusion: ExclusionRule,
    settings: StatsConfig,
    floors: BTreeMap<String, u64>,
    show_progress: bool,
}

impl<'a> StatsPipeline<'a> {
    pub fn new(store: &'a dyn DocumentStore, config: &Config) -> Result<Self> {
        Ok(Self {
            store,
            schemas: build_schemas(&config.events.sources)?,
            rules: CounterRules::from_config(&config.events.rules),
            exclusion: ExclusionRule::new(config.stats.test_prefix.clone()),
            settings: config.stats.clone(),
            floors: config.display.floors.clone(),
            show_progress: false,
        })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Run every read and build the snapshot stamped with `now`.
    pub async fn run(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let window = Window::trailing_days(now, self.settings.window_days);
        let mut degraded: Vec<String> = Vec::new();
        let mut raw = RawStats::default();

        let users = self
            .read(
                "active users",
                Query::collection(self.settings.users_collection.clone())
                    .since("lastActive", window.start),
                UserRecord::from_document,
            )
            .await;
        let all_uploads = self
            .read(
                "protocol uploads",
                Query::collection(self.settings.uploads_collection.clone()),
                UploadRecord::from_document,
            )
            .await;
        let events = self.read_events(now).await;
        let window_uploads = self
            .read(
                "recent uploads",
                Query::collection(self.settings.uploads_collection.clone())
                    .since("timestamp", window.start),
                UploadRecord::from_document,
            )
            .await;
        let successful_uploads = self
            .read(
                "successful uploads",
                Query::collection(self.settings.uploads_collection.clone())
                    .equals("status", "success")
                    .since("timestamp", window.start),
                UploadRecord::from_document,
            )
            .await;

        match (&events, &all_uploads) {
            (Ok(events), Ok(uploads)) => {
                let total = count_distinct_users(&[events, uploads], &self.exclusion) as u64;
                raw.total_users = Some(total);
                raw.app_store_downloads = Some(total + self.settings.download_offset);
            }
            _ => mark(&mut degraded, &[metric::TOTAL_USERS, metric::APP_STORE_DOWNLOADS]),
        }

        match &users {
            Ok(users) => {
                raw.active_users =
                    Some(count_active_users(users, &window, &self.exclusion) as u64);
            }
            Err(_) => mark(&mut degraded, &[metric::ACTIVE_USERS]),
        }

        match &all_uploads {
            Ok(uploads) => raw.protocols_uploaded = Some(count_retained(uploads, &self.exclusion) as u64),
            Err(_) => mark(&mut degraded, &[metric::PROTOCOLS_UPLOADED]),
        }

        match &events {
            Ok(events) => {
                raw.counters = count_by_category_action(events, &self.rules, &self.exclusion)
                    .into_iter()
                    .map(|(name, count)| (name, Some(count)))
                    .collect();
            }
            Err(_) => {
                let names: Vec<&str> = self.rules.counter_names().collect();
                raw.counters = names.iter().map(|n| (n.to_string(), None)).collect();
                mark(&mut degraded, &names);
            }
        }

        match &window_uploads {
            // An empty window is "no data", not a failure.
            Ok(uploads) => raw.upload_success_rate = success_rate(uploads, &window, &self.exclusion),
            Err(_) => mark(&mut degraded, &[metric::UPLOAD_SUCCESS_RATE]),
        }

        let top_protocols = match &successful_uploads {
            Ok(uploads) => top_n(uploads, protocol_label, self.settings.top_protocols, |u| {
                u.status == UploadStatus::Success
                    && window.contains(u.timestamp)
                    && !self.exclusion.excludes(u)
            }),
            Err(_) => {
                mark(&mut degraded, &[metric::TOP_PROTOCOLS]);
                Vec::new()
            }
        };

        if degraded.is_empty() {
            info!("All metrics computed");
        } else {
            warn!("Degraded metrics: {}", degraded.join(", "));
        }

        StatsSnapshot {
            generated_at: now,
            display: build_display(&raw, &self.floors),
            raw,
            top_protocols,
            degraded,
        }
    }

    async fn read<T>(
        &self,
        label: &str,
        query: Query,
        convert: fn(&Document) -> T,
    ) -> Result<Vec<T>, StoreError> {
        let spinner = self.spinner(label);
        let result = self.store.query(&query).await;
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }

        match result {
            Ok(docs) => {
                debug!(
                    "Read {} documents for {} from {} ({})",
                    docs.len(),
                    label,
                    query.collection,
                    self.store.backend_tag()
                );
                Ok(docs.iter().map(convert).collect())
            }
            Err(e) => {
                warn!("Failed to read {}: {}", label, e);
                Err(e)
            }
        }
    }

    async fn read_events(&self, now: DateTime<Utc>) -> Result<Vec<crate::models::EventRecord>, StoreError> {
        let spinner = self.spinner("events");
        let result = read_events(self.store, &self.schemas, now.date_naive()).await;
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }

        match result {
            Ok(records) => {
                debug!(
                    "Normalized {} events from {} sources",
                    records.len(),
                    self.schemas.len()
                );
                Ok(records)
            }
            Err(e) => {
                warn!("Failed to read events: {}", e);
                Err(e)
            }
        }
    }

    fn spinner(&self, label: &str) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Reading {}...", label));
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    }
}

fn mark(degraded: &mut Vec<String>, names: &[&str]) {
    degraded.extend(names.iter().map(|n| n.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 30, 6, 0, 0).unwrap()
    }

    fn seeded_store() -> MemoryStore {
        MemoryStore::new()
            .with_documents(
                "users",
                vec![
                    Document::new("A", json!({"lastActive": "2025-11-28T10:00:00Z"})),
                    Document::new("B", json!({"lastActive": "2025-09-01T10:00:00Z"})),
                    Document::new("UQLMSLQZ-qa", json!({"lastActive": "2025-11-29T10:00:00Z"})),
                ],
            )
            .with_documents(
                "protocol_uploads",
                vec![
                    Document::new("u1", json!({"userId": "A", "status": "success", "protocolName": "Stroke", "timestamp": "2025-11-20T00:00:00Z"})),
                    Document::new("u2", json!({"userId": "C", "status": "failure", "protocolName": "Sepsis", "timestamp": "2025-11-21T00:00:00Z"})),
                    Document::new("u3", json!({"userId": "C", "status": "success", "protocolName": "Sepsis", "timestamp": "2025-11-22T00:00:00Z"})),
                    Document::new("u4", json!({"userId": "D", "status": "success", "protocolName": "Sepsis", "timestamp": "2025-08-01T00:00:00Z"})),
                    Document::new("u5", json!({"userId": "UQLMSLQZ1", "status": "success", "protocolName": "Burns", "timestamp": "2025-11-25T00:00:00Z"})),
                ],
            )
            .with_documents(
                "events",
                vec![
                    Document::new("2025-11_a", json!({"category": "quiz", "action": "quiz_completed", "userId": "A"})),
                    Document::new("2025-11_b", json!({"category": "quiz", "action": "quiz_started", "userId": "E"})),
                    Document::new("2025-11_c", json!({"category": "scenario", "action": "completed", "userId": "E"})),
                    Document::new("2025-11_d", json!({"category": "quiz", "action": "quiz_completed", "userId": "UQLMSLQZ2"})),
                ],
            )
    }

    #[tokio::test]
    async fn test_full_run() {
        let store = seeded_store();
        let config = Config::default();
        let pipeline = StatsPipeline::new(&store, &config).unwrap();

        let snapshot = pipeline.run(now()).await;

        // A, C, D from uploads and A, E from events.
        assert_eq!(snapshot.raw.total_users, Some(4));
        assert_eq!(snapshot.raw.app_store_downloads, Some(126));
        assert_eq!(snapshot.raw.active_users, Some(1));
        assert_eq!(snapshot.raw.protocols_uploaded, Some(4));
        assert_eq!(snapshot.raw.count(metric::QUIZZES_GENERATED), Some(2));
        assert_eq!(snapshot.raw.count(metric::SCENARIOS_COMPLETED), Some(1));
        assert_eq!(snapshot.raw.count(metric::ALGORITHM_QUIZZES), Some(0));
        // Window uploads: u1 success, u2 failure, u3 success.
        assert_eq!(snapshot.raw.upload_success_rate, Some(67));
        assert_eq!(snapshot.top_protocols, vec!["Stroke", "Sepsis"]);
        assert!(snapshot.degraded.is_empty());

        assert_eq!(snapshot.display[metric::QUIZZES_GENERATED], "2,500+");
        assert_eq!(snapshot.display[metric::UPLOAD_SUCCESS_RATE], "67%");
    }

    #[tokio::test]
    async fn test_failed_event_read_degrades_dependent_metrics() {
        let store = seeded_store().fail_collection("events");
        let config = Config::default();
        let pipeline = StatsPipeline::new(&store, &config).unwrap();

        let snapshot = pipeline.run(now()).await;

        assert_eq!(snapshot.raw.total_users, None);
        assert_eq!(snapshot.raw.app_store_downloads, None);
        assert_eq!(snapshot.raw.count(metric::QUIZZES_GENERATED), None);
        assert!(snapshot.raw.counters.contains_key(metric::QUIZZES_GENERATED));
        assert!(snapshot.is_degraded(metric::TOTAL_USERS));
        assert!(snapshot.is_degraded(metric::QUIZZES_GENERATED));
        assert!(snapshot.is_degraded(metric::SCENARIOS_COMPLETED));

        // Unrelated metrics still report.
        assert_eq!(snapshot.raw.active_users, Some(1));
        assert_eq!(snapshot.raw.protocols_uploaded, Some(4));
        assert!(!snapshot.is_degraded(metric::ACTIVE_USERS));

        assert_eq!(snapshot.display[metric::TOTAL_USERS], "N/A");
        assert_eq!(snapshot.display[metric::QUIZZES_GENERATED], "N/A");
    }

    #[tokio::test]
    async fn test_failed_upload_reads_yield_sentinels() {
        let store = seeded_store().fail_collection("protocol_uploads");
        let config = Config::default();
        let pipeline = StatsPipeline::new(&store, &config).unwrap();

        let snapshot = pipeline.run(now()).await;

        assert_eq!(snapshot.raw.protocols_uploaded, None);
        assert_eq!(snapshot.raw.upload_success_rate, None);
        assert!(snapshot.top_protocols.is_empty());
        assert!(snapshot.is_degraded(metric::PROTOCOLS_UPLOADED));
        assert!(snapshot.is_degraded(metric::UPLOAD_SUCCESS_RATE));
        assert!(snapshot.is_degraded(metric::TOP_PROTOCOLS));
        assert_eq!(snapshot.raw.count(metric::QUIZZES_GENERATED), Some(2));
    }

    #[tokio::test]
    async fn test_empty_store_reports_zeroes_not_failures() {
        let store = MemoryStore::new();
        let config = Config::default();
        let pipeline = StatsPipeline::new(&store, &config).unwrap();

        let snapshot = pipeline.run(now()).await;

        assert_eq!(snapshot.raw.total_users, Some(0));
        assert_eq!(snapshot.raw.app_store_downloads, Some(122));
        assert_eq!(snapshot.raw.upload_success_rate, None);
        assert!(snapshot.top_protocols.is_empty());
        assert!(snapshot.degraded.is_empty());
    }

    #[tokio::test]
    async fn test_untyped_events_still_count_users() {
        let store = MemoryStore::new().with_documents(
            "events",
            vec![
                Document::new("2025-11_a", json!({"category": "quiz", "action": "quiz_started", "userId": "A"})),
                Document::new("2025-11_b", json!({"userId": "B", "type": "app_open"})),
            ],
        );
        let config = Config::default();
        let pipeline = StatsPipeline::new(&store, &config).unwrap();

        let snapshot = pipeline.run(now()).await;

        assert_eq!(snapshot.raw.total_users, Some(2));
        assert_eq!(snapshot.raw.count(metric::QUIZZES_GENERATED), Some(1));
        assert!(snapshot.degraded.is_empty());
    }

    #[tokio::test]
    async fn test_configured_rules_and_prefix() {
        let store = seeded_store();
        let mut config = Config::default();
        config.stats.test_prefix = String::new();
        config.events.rules = vec![crate::config::RuleConfig {
            category: "quiz".to_string(),
            action: "quiz_completed".to_string(),
            counter: "completions".to_string(),
        }];
        let pipeline = StatsPipeline::new(&store, &config).unwrap();

        let snapshot = pipeline.run(now()).await;

        assert_eq!(snapshot.raw.count("completions"), Some(2));
        assert_eq!(snapshot.raw.count(metric::QUIZZES_GENERATED), None);
        assert_eq!(snapshot.raw.total_users, Some(6));
    }
}
