//! Counting and ranking over normalized records.
//!
//! Every function here is pure: the pipeline reads the store once and hands
//! the records in. Test accounts are removed through an [`ExclusionRule`]
//! before anything is counted.

use crate::config::RuleConfig;
use crate::models::{metric, Category, EventRecord, UploadRecord, UploadStatus, UserRecord, UserScoped, Window};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// User-id prefix of the development and QA accounts.
pub const DEFAULT_TEST_PREFIX: &str = "UQLMSLQZ";

/// Excludes test accounts by user-id prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionRule {
    prefix: String,
}

impl Default for ExclusionRule {
    fn default() -> Self {
        Self::new(DEFAULT_TEST_PREFIX)
    }
}

impl ExclusionRule {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// An empty prefix excludes nothing.
    pub fn is_test_id(&self, id: &str) -> bool {
        !self.prefix.is_empty() && id.starts_with(self.prefix.as_str())
    }

    /// Records without a user id are never excluded.
    pub fn excludes<R: UserScoped + ?Sized>(&self, record: &R) -> bool {
        record.user_id().is_some_and(|id| self.is_test_id(id))
    }
}

/// A collection of records that contributes user ids.
pub trait UserSource {
    fn user_ids(&self) -> Box<dyn Iterator<Item = &str> + '_>;
}

impl<R: UserScoped> UserSource for [R] {
    fn user_ids(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(self.iter().filter_map(UserScoped::user_id))
    }
}

impl<R: UserScoped> UserSource for Vec<R> {
    fn user_ids(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        self.as_slice().user_ids()
    }
}

/// Union of user ids across sources, test ids included.
pub fn distinct_user_ids<'a>(sources: &[&'a dyn UserSource]) -> BTreeSet<&'a str> {
    sources.iter().copied().flat_map(|source| source.user_ids()).collect()
}

/// Distinct non-test user ids across every source.
pub fn count_distinct_users(sources: &[&dyn UserSource], rule: &ExclusionRule) -> usize {
    distinct_user_ids(sources)
        .into_iter()
        .filter(|id| !rule.is_test_id(id))
        .count()
}

/// Maps `(category, action)` pairs onto named counters.
#[derive(Debug, Clone)]
pub struct CounterRules {
    rules: HashMap<(Category, String), String>,
    names: BTreeSet<String>,
}

impl CounterRules {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            names: BTreeSet::new(),
        }
    }

    /// Builder form of [`CounterRules::insert`].
    pub fn add(mut self, category: Category, action: &str, counter: &str) -> Self {
        self.insert(category, action, counter);
        self
    }

    /// A later rule for the same pair replaces the earlier one.
    pub fn insert(&mut self, category: Category, action: &str, counter: &str) {
        self.names.insert(counter.to_string());
        self.rules
            .insert((category, action.to_string()), counter.to_string());
    }

    pub fn counter_for(&self, category: &Category, action: &str) -> Option<&str> {
        self.rules
            .get(&(category.clone(), action.to_string()))
            .map(String::as_str)
    }

    pub fn counter_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// The rules the app's dashboards have always reported.
    fn standard() -> Self {
        Self::new()
            .add(Category::Quiz, "quiz_completed", metric::QUIZZES_GENERATED)
            .add(Category::Quiz, "quiz_started", metric::QUIZZES_GENERATED)
            .add(Category::Scenario, "generation_completed", metric::SCENARIOS_COMPLETED)
            .add(Category::Scenario, "completed", metric::SCENARIOS_COMPLETED)
            .add(Category::Quiz, "algorithm_completed", metric::ALGORITHM_QUIZZES)
    }

    pub fn from_config(rules: &[RuleConfig]) -> Self {
        let mut counters = Self::new();
        for rule in rules {
            counters.insert(Category::from(rule.category.as_str()), &rule.action, &rule.counter);
        }
        counters
    }
}

impl Default for CounterRules {
    fn default() -> Self {
        Self::standard()
    }
}

/// Single pass over events. Every counter the rules name is present in the
/// result, zero when nothing matched.
pub fn count_by_category_action(
    records: &[EventRecord],
    rules: &CounterRules,
    exclusion: &ExclusionRule,
) -> BTreeMap<String, u64> {
    let mut counts: BTreeMap<String, u64> = rules
        .counter_names()
        .map(|name| (name.to_string(), 0))
        .collect();

    for record in records.iter().filter(|r| !exclusion.excludes(*r)) {
        if let Some(counter) = rules.counter_for(&record.category, &record.action) {
            *counts.entry(counter.to_string()).or_default() += 1;
        }
    }

    counts
}

/// The `n` most frequent keys among records passing `filter`, ties broken by
/// first appearance.
pub fn top_n<'a, R, K, F>(records: &'a [R], key: K, n: usize, filter: F) -> Vec<String>
where
    K: Fn(&'a R) -> &'a str,
    F: Fn(&R) -> bool,
{
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();

    for record in records.iter().filter(|r| filter(*r)) {
        let label = key(record);
        let count = counts.entry(label).or_insert_with(|| {
            order.push(label);
            0
        });
        *count += 1;
    }

    // Stable sort keeps first-seen order among equal counts.
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));
    order.truncate(n);
    order.into_iter().map(String::from).collect()
}

/// Label for ranking uploads by protocol.
pub fn protocol_label(upload: &UploadRecord) -> &str {
    upload.protocol_name.as_deref().unwrap_or("Unknown")
}

/// Percentage of successful uploads in the window, rounded to the nearest
/// integer. `None` when the window holds no countable uploads.
pub fn success_rate(records: &[UploadRecord], window: &Window, rule: &ExclusionRule) -> Option<u8> {
    let (total, successes) = records
        .iter()
        .filter(|r| !rule.excludes(*r) && window.contains(r.timestamp))
        .fold((0u64, 0u64), |(total, ok), r| {
            (total + 1, ok + u64::from(r.status == UploadStatus::Success))
        });

    if total == 0 {
        return None;
    }

    let percent = (successes as f64 / total as f64 * 100.0).round();
    Some(percent.clamp(0.0, 100.0) as u8)
}

/// Users whose last activity falls in the window.
pub fn count_active_users(users: &[UserRecord], window: &Window, rule: &ExclusionRule) -> usize {
    users
        .iter()
        .filter(|u| !rule.excludes(*u) && window.contains(u.last_active))
        .count()
}

/// Records that survive exclusion. Records without a user id are kept.
pub fn count_retained<R: UserScoped>(records: &[R], rule: &ExclusionRule) -> usize {
    records.iter().filter(|r| !rule.excludes(*r)).count()
}
