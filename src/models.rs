//! Data models for the stats jobs.
//!
//! This module contains the normalized records every schema adapter
//! produces, the time window used for "recent" metrics, and the stats
//! snapshot written at the end of a run.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Snapshot metric names, shared by the raw and display maps.
pub mod metric {
    pub const TOTAL_USERS: &str = "totalUsers";
    pub const ACTIVE_USERS: &str = "activeUsers";
    pub const APP_STORE_DOWNLOADS: &str = "appStoreDownloads";
    pub const PROTOCOLS_UPLOADED: &str = "protocolsUploaded";
    pub const UPLOAD_SUCCESS_RATE: &str = "uploadSuccessRate";
    pub const TOP_PROTOCOLS: &str = "topProtocols";
    pub const QUIZZES_GENERATED: &str = "quizzesGenerated";
    pub const SCENARIOS_COMPLETED: &str = "scenariosCompleted";
    pub const ALGORITHM_QUIZZES: &str = "algorithmQuizzes";

    /// Metrics with their own snapshot field. Event counters may not reuse
    /// these names.
    pub const FIXED: &[&str] = &[
        TOTAL_USERS,
        ACTIVE_USERS,
        APP_STORE_DOWNLOADS,
        PROTOCOLS_UPLOADED,
        UPLOAD_SUCCESS_RATE,
    ];
}

/// Event category as tracked by the mobile app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Protocol,
    Quiz,
    Scenario,
    Other(String),
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Protocol => write!(f, "protocol"),
            Category::Quiz => write!(f, "quiz"),
            Category::Scenario => write!(f, "scenario"),
            Category::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Category names match exactly; `"Quiz"` is not `quiz`.
impl From<&str> for Category {
    fn from(s: &str) -> Self {
        match s {
            "protocol" => Category::Protocol,
            "quiz" => Category::Quiz,
            "scenario" => Category::Scenario,
            other => Category::Other(other.to_string()),
        }
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        Category::from(s.as_str())
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.to_string()
    }
}

/// Outcome of a protocol upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStatus {
    Success,
    Failure,
    Pending,
    Unknown,
}

impl From<&str> for UploadStatus {
    fn from(s: &str) -> Self {
        match s {
            "success" => UploadStatus::Success,
            "failure" | "failed" => UploadStatus::Failure,
            "pending" => UploadStatus::Pending,
            _ => UploadStatus::Unknown,
        }
    }
}

/// Anything that may carry the id of the user who produced it.
pub trait UserScoped {
    fn user_id(&self) -> Option<&str>;
}

/// A tracked app event, normalized from any of the stored schemas.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub category: Category,
    /// Lifecycle milestone, e.g. `quiz_completed`.
    pub action: String,
    pub user_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Year-month partition when the document id or shard path encodes one.
    pub partition: Option<MonthKey>,
}

impl UserScoped for EventRecord {
    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// A protocol upload attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRecord {
    pub user_id: Option<String>,
    pub status: UploadStatus,
    pub protocol_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl UserScoped for UploadRecord {
    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// A user profile document. The document id is the user id.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub last_active: Option<DateTime<Utc>>,
}

impl UserScoped for UserRecord {
    fn user_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

/// The lower bound used to scope "recent" metrics. Timestamps after the
/// run time (device clock skew) still count as recent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
}

impl Window {
    /// The `days` days leading up to `now`.
    pub fn trailing_days(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: now - Duration::days(days.max(1)),
        }
    }

    /// Records without a timestamp are never inside a window.
    pub fn contains(&self, timestamp: Option<DateTime<Utc>>) -> bool {
        timestamp.is_some_and(|ts| ts >= self.start)
    }
}

/// A `YYYY-MM` partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The following month.
    pub fn succ(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Midnight UTC on the first day of the month.
    pub fn first_instant(self) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
    }

    /// All months from `self` through `last`, inclusive.
    pub fn through(self, last: MonthKey) -> Vec<MonthKey> {
        let mut months = Vec::new();
        let mut current = self;
        while current <= last {
            months.push(current);
            current = current.succ();
        }
        months
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got '{}'", s))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(format!("expected YYYY-MM, got '{}'", s));
        }
        let year: i32 = year
            .parse()
            .map_err(|_| format!("invalid year in '{}'", s))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in '{}'", s))?;
        if !(1..=12).contains(&month) {
            return Err(format!("month out of range in '{}'", s));
        }
        Ok(Self { year, month })
    }
}

/// Raw measured values. `None` means "no data", never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStats {
    pub total_users: Option<u64>,
    pub active_users: Option<u64>,
    pub app_store_downloads: Option<u64>,
    pub protocols_uploaded: Option<u64>,
    pub upload_success_rate: Option<u8>,
    /// Rule-driven event counters, keyed by counter name.
    #[serde(flatten)]
    pub counters: BTreeMap<String, Option<u64>>,
}

impl RawStats {
    /// Look up any count metric by its snapshot name.
    pub fn count(&self, name: &str) -> Option<u64> {
        match name {
            metric::TOTAL_USERS => self.total_users,
            metric::ACTIVE_USERS => self.active_users,
            metric::APP_STORE_DOWNLOADS => self.app_store_downloads,
            metric::PROTOCOLS_UPLOADED => self.protocols_uploaded,
            other => self.counters.get(other).copied().flatten(),
        }
    }
}

/// The JSON document one stats run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub raw: RawStats,
    /// Human-rounded values for templating.
    pub display: BTreeMap<String, String>,
    pub top_protocols: Vec<String>,
    /// Metrics whose reads failed and hold a fallback value.
    #[serde(default)]
    pub degraded: Vec<String>,
}

impl StatsSnapshot {
    pub fn is_degraded(&self, name: &str) -> bool {
        self.degraded.iter().any(|d| d == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_str() {
        assert_eq!(Category::from("quiz"), Category::Quiz);
        assert_eq!(Category::from("protocol"), Category::Protocol);
        assert_eq!(Category::from("scenario"), Category::Scenario);
        assert_eq!(Category::from("Quiz"), Category::Other("Quiz".to_string()));
        assert_eq!(
            Category::from("flashcard"),
            Category::Other("flashcard".to_string())
        );
    }

    #[test]
    fn test_upload_status_from_str() {
        assert_eq!(UploadStatus::from("success"), UploadStatus::Success);
        assert_eq!(UploadStatus::from("failure"), UploadStatus::Failure);
        assert_eq!(UploadStatus::from("pending"), UploadStatus::Pending);
        assert_eq!(UploadStatus::from("weird"), UploadStatus::Unknown);
    }

    #[test]
    fn test_window_contains() {
        let now = Utc.with_ymd_and_hms(2025, 11, 30, 12, 0, 0).unwrap();
        let window = Window::trailing_days(now, 30);

        assert!(window.contains(Some(now - Duration::days(29))));
        assert!(window.contains(Some(now)));
        assert!(window.contains(Some(now + Duration::minutes(5))));
        assert!(!window.contains(Some(now - Duration::days(31))));
        assert!(!window.contains(None));
    }

    #[test]
    fn test_month_key_parse_and_display() {
        let key: MonthKey = "2025-11".parse().unwrap();
        assert_eq!(key, MonthKey { year: 2025, month: 11 });
        assert_eq!(key.to_string(), "2025-11");

        assert!("2025-13".parse::<MonthKey>().is_err());
        assert!("2025/11".parse::<MonthKey>().is_err());
        assert!("25-11".parse::<MonthKey>().is_err());
    }

    #[test]
    fn test_month_key_through_crosses_year() {
        let start: MonthKey = "2025-11".parse().unwrap();
        let end: MonthKey = "2026-02".parse().unwrap();
        let months: Vec<String> = start.through(end).iter().map(|m| m.to_string()).collect();
        assert_eq!(months, vec!["2025-11", "2025-12", "2026-01", "2026-02"]);

        assert!(end.through(start).is_empty());
    }

    #[test]
    fn test_snapshot_serializes_nulls_and_flattened_counters() {
        let mut raw = RawStats {
            total_users: Some(276),
            ..Default::default()
        };
        raw.counters
            .insert(metric::QUIZZES_GENERATED.to_string(), Some(12));
        raw.counters.insert(metric::ALGORITHM_QUIZZES.to_string(), None);

        let snapshot = StatsSnapshot {
            generated_at: Utc.with_ymd_and_hms(2025, 11, 30, 0, 0, 0).unwrap(),
            raw,
            display: BTreeMap::new(),
            top_protocols: vec![],
            degraded: vec![metric::ALGORITHM_QUIZZES.to_string()],
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["raw"]["totalUsers"], 276);
        assert!(json["raw"]["activeUsers"].is_null());
        assert_eq!(json["raw"]["quizzesGenerated"], 12);
        assert!(json["raw"]["algorithmQuizzes"].is_null());
        assert!(json["generatedAt"].is_string());
        assert!(snapshot.is_degraded(metric::ALGORITHM_QUIZZES));
        assert_eq!(snapshot.raw.count(metric::QUIZZES_GENERATED), Some(12));
    }
}
