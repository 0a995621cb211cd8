//! User-id diagnostics.
//!
//! Explains where the public user count comes from: how many records carry
//! a user id, how many distinct ids each source contributes, and how many of
//! those belong to test accounts.

use crate::analysis::{count_active_users, ExclusionRule, UserSource};
use crate::config::Config;
use crate::models::{EventRecord, UploadRecord, UserRecord, UserScoped, Window};
use crate::store::schema::{build_schemas, read_events};
use crate::store::{DocumentStore, Query};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceBreakdown {
    pub records: usize,
    pub with_user_id: usize,
    pub distinct_users: usize,
}

impl SourceBreakdown {
    fn of<R: UserScoped>(records: &[R]) -> Self {
        Self {
            records: records.len(),
            with_user_id: records.iter().filter(|r| r.user_id().is_some()).count(),
            distinct_users: records.user_ids().collect::<BTreeSet<_>>().len(),
        }
    }

    pub fn without_user_id(&self) -> usize {
        self.records - self.with_user_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserAudit {
    pub events: SourceBreakdown,
    pub uploads: SourceBreakdown,
    /// Event counts per `YYYY-MM` partition; unpartitioned events are not listed.
    pub events_by_month: BTreeMap<String, usize>,
    pub combined_users: usize,
    pub dev_users: usize,
    pub real_users: usize,
    pub profiles: usize,
    pub dev_profiles: usize,
    pub profiles_with_last_active: usize,
    pub active_users: usize,
}

impl UserAudit {
    pub fn compute(
        events: &[EventRecord],
        uploads: &[UploadRecord],
        users: &[UserRecord],
        window: &Window,
        rule: &ExclusionRule,
    ) -> Self {
        let combined: BTreeSet<&str> = events.user_ids().chain(uploads.user_ids()).collect();
        let dev_users = combined.iter().filter(|id| rule.is_test_id(id)).count();

        let mut events_by_month: BTreeMap<String, usize> = BTreeMap::new();
        for month in events.iter().filter_map(|e| e.partition) {
            *events_by_month.entry(month.to_string()).or_default() += 1;
        }

        Self {
            events: SourceBreakdown::of(events),
            uploads: SourceBreakdown::of(uploads),
            events_by_month,
            combined_users: combined.len(),
            dev_users,
            real_users: combined.len() - dev_users,
            profiles: users.len(),
            dev_profiles: users.iter().filter(|u| rule.is_test_id(&u.id)).count(),
            profiles_with_last_active: users.iter().filter(|u| u.last_active.is_some()).count(),
            active_users: count_active_users(users, window, rule),
        }
    }

    pub fn render(&self, rule: &ExclusionRule, window_days: i64) -> Vec<String> {
        let mut lines = vec![
            "🔍 User Audit:".to_string(),
            format!(
                "   Events: {} ({} with userId, {} without)",
                self.events.records,
                self.events.with_user_id,
                self.events.without_user_id()
            ),
            format!(
                "   Uploads: {} ({} with userId, {} without)",
                self.uploads.records,
                self.uploads.with_user_id,
                self.uploads.without_user_id()
            ),
        ];

        for (month, count) in &self.events_by_month {
            lines.push(format!("   - Events in {}: {}", month, count));
        }

        lines.extend([
            format!("   Distinct users in events: {}", self.events.distinct_users),
            format!("   Distinct users in uploads: {}", self.uploads.distinct_users),
            format!("   Distinct users combined: {}", self.combined_users),
            format!(
                "   - Dev users ({}*): {} | Real users: {}",
                rule.prefix(),
                self.dev_users,
                self.real_users
            ),
            String::new(),
            format!("   Users collection: {} documents", self.profiles),
            format!(
                "   - Dev: {} | Real: {}",
                self.dev_profiles,
                self.profiles - self.dev_profiles
            ),
            format!("   - With lastActive: {}", self.profiles_with_last_active),
            format!(
                "   - Active ({}d, excluding dev): {}",
                window_days, self.active_users
            ),
        ]);

        lines
    }
}

/// Read every source in full. Read failures are fatal here: a partial audit
/// would be misleading.
pub async fn run_audit(store: &dyn DocumentStore, config: &Config, now: DateTime<Utc>) -> Result<UserAudit> {
    let schemas = build_schemas(&config.events.sources)?;
    let events = read_events(store, &schemas, now.date_naive())
        .await
        .context("Failed to read events")?;

    let uploads: Vec<UploadRecord> = store
        .query(&Query::collection(config.stats.uploads_collection.clone()))
        .await
        .context("Failed to read protocol uploads")?
        .iter()
        .map(UploadRecord::from_document)
        .collect();

    let users: Vec<UserRecord> = store
        .query(&Query::collection(config.stats.users_collection.clone()))
        .await
        .context("Failed to read users")?
        .iter()
        .map(UserRecord::from_document)
        .collect();

    let window = Window::trailing_days(now, config.stats.window_days);
    let rule = ExclusionRule::new(config.stats.test_prefix.clone());

    Ok(UserAudit::compute(&events, &uploads, &users, &window, &rule))
}
