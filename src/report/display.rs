//! Human-facing rounding of raw stats.
//!
//! Marketing pages show conservative round numbers: a configured floor lifts
//! small values, large values are rounded down to the nearest hundred, and
//! either adjustment is marked with a trailing `+`.

use crate::models::{metric, RawStats};
use std::collections::BTreeMap;

const NOT_AVAILABLE: &str = "N/A";

/// Display strings for every raw metric.
pub fn build_display(raw: &RawStats, floors: &BTreeMap<String, u64>) -> BTreeMap<String, String> {
    let mut display = BTreeMap::new();

    let counts = [
        metric::TOTAL_USERS,
        metric::ACTIVE_USERS,
        metric::APP_STORE_DOWNLOADS,
        metric::PROTOCOLS_UPLOADED,
    ]
    .into_iter()
    .chain(raw.counters.keys().map(String::as_str));

    for name in counts {
        let floor = floors.get(name).copied();
        display.insert(name.to_string(), human_count(raw.count(name), floor));
    }

    display.insert(
        metric::UPLOAD_SUCCESS_RATE.to_string(),
        percent(raw.upload_success_rate),
    );

    display
}

/// Round a count for display. Missing values stay missing; a floor never
/// invents a number for them.
pub fn human_count(value: Option<u64>, floor: Option<u64>) -> String {
    let Some(value) = value else {
        return NOT_AVAILABLE.to_string();
    };

    let mut plus = false;
    let mut shown = value;

    if let Some(floor) = floor {
        if shown < floor {
            shown = floor;
            plus = true;
        }
    }

    if shown >= 1000 {
        let rounded = shown / 100 * 100;
        plus |= rounded != shown;
        shown = rounded;
    }

    format!("{}{}", group_thousands(shown), if plus { "+" } else { "" })
}

pub fn percent(value: Option<u8>) -> String {
    match value {
        Some(v) => format!("{}%", v),
        None => NOT_AVAILABLE.to_string(),
    }
}

/// `1234567` -> `1,234,567`.
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }

    #[test]
    fn test_human_count_small_values_exact() {
        assert_eq!(human_count(Some(276), None), "276");
        assert_eq!(human_count(Some(0), None), "0");
    }

    #[test]
    fn test_human_count_rounds_down_large_values() {
        assert_eq!(human_count(Some(1200), None), "1,200");
        assert_eq!(human_count(Some(1287), None), "1,200+");
        assert_eq!(human_count(Some(15_050), None), "15,000+");
    }

    #[test]
    fn test_human_count_applies_floor() {
        assert_eq!(human_count(Some(37), Some(2500)), "2,500+");
        assert_eq!(human_count(Some(640), Some(600)), "640");
        assert_eq!(human_count(Some(2731), Some(2500)), "2,700+");
    }

    #[test]
    fn test_missing_values_not_floored() {
        assert_eq!(human_count(None, Some(2500)), "N/A");
        assert_eq!(percent(None), "N/A");
        assert_eq!(percent(Some(67)), "67%");
    }

    #[test]
    fn test_build_display() {
        let mut raw = RawStats {
            total_users: Some(276),
            active_users: None,
            app_store_downloads: Some(398),
            protocols_uploaded: Some(41),
            upload_success_rate: Some(93),
            ..Default::default()
        };
        raw.counters
            .insert(metric::QUIZZES_GENERATED.to_string(), Some(812));
        raw.counters
            .insert(metric::SCENARIOS_COMPLETED.to_string(), None);

        let floors = BTreeMap::from([
            (metric::QUIZZES_GENERATED.to_string(), 2500),
            (metric::SCENARIOS_COMPLETED.to_string(), 600),
        ]);
        let display = build_display(&raw, &floors);

        assert_eq!(display[metric::TOTAL_USERS], "276");
        assert_eq!(display[metric::ACTIVE_USERS], "N/A");
        assert_eq!(display[metric::QUIZZES_GENERATED], "2,500+");
        assert_eq!(display[metric::SCENARIOS_COMPLETED], "N/A");
        assert_eq!(display[metric::UPLOAD_SUCCESS_RATE], "93%");
        assert_eq!(display.len(), 7);
    }
}
