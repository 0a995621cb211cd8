//! Blog view statistics.

use anyhow::{Context, Result};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

const INDEX_SLUG: &str = "blog-index";

#[derive(Debug, Default, Deserialize)]
pub struct ViewsResponse {
    /// `(slug, count)` in the order the endpoint sent them.
    #[serde(default, deserialize_with = "ordered_counts")]
    pub views: Vec<(String, u64)>,
}

fn ordered_counts<'de, D>(deserializer: D) -> Result<Vec<(String, u64)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedCounts;

    impl<'de> Visitor<'de> for OrderedCounts {
        type Value = Vec<(String, u64)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of slug to view count")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut counts = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, u64>()? {
                counts.push(entry);
            }
            Ok(counts)
        }
    }

    deserializer.deserialize_map(OrderedCounts)
}

/// Fetch per-post view counts. Any failure is fatal for this job.
pub async fn fetch_views(http: &reqwest::Client, url: &str) -> Result<ViewsResponse> {
    debug!("GET {}", url);
    let response = http
        .get(url)
        .query(&[("summary", "true")])
        .send()
        .await
        .with_context(|| format!("Failed to fetch blog views from {}", url))?
        .error_for_status()
        .context("Blog views endpoint returned an error")?;

    response
        .json::<ViewsResponse>()
        .await
        .context("Blog views response was not valid JSON")
}

/// `(slug, count)` pairs, most viewed first. Equal counts keep response order.
pub fn sorted_views(views: &[(String, u64)]) -> Vec<(&str, u64)> {
    let mut sorted: Vec<(&str, u64)> = views.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    sorted
}

/// Human label for a post slug: the index page is named, dated slugs lose
/// their `YYYY-MM-DD-` prefix.
pub fn display_slug(slug: &str) -> String {
    if slug == INDEX_SLUG {
        return "📄 Blog Index Page".to_string();
    }
    format!("📝 {}", strip_date_prefix(slug))
}

fn strip_date_prefix(slug: &str) -> &str {
    let bytes = slug.as_bytes();
    let is_dated = bytes.len() > 11
        && bytes[..10].iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
        && bytes[10] == b'-';

    if is_dated {
        &slug[11..]
    } else {
        slug
    }
}

/// Report lines for the console.
pub fn render(views: &[(String, u64)]) -> Vec<String> {
    if views.is_empty() {
        return vec!["No views tracked yet.".to_string()];
    }

    let rule = "─".repeat(60);
    let mut lines = vec!["Blog Post Views:".to_string(), String::new(), rule.clone()];

    let sorted = sorted_views(views);
    for (slug, count) in &sorted {
        lines.push(format!("{:<45} {:>6} views", display_slug(slug), count));
    }

    lines.push(rule);
    let total: u64 = sorted.iter().map(|(_, c)| c).sum();
    lines.push(String::new());
    lines.push(format!("Total Views: {}", total));

    lines
}
