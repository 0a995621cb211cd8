//! App Store Connect job.
//!
//! Verifies the API key works and reports the app's basic metadata. Total
//! download counts are not available from this API.

pub mod client;

pub use client::{AppInfo, AppStoreClient, AppStoreCredentials, AppStoreError};

use serde::Serialize;
use tracing::warn;

/// What the job prints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStoreSummary {
    #[serde(flatten)]
    pub app: AppInfo,
    /// `None` when the versions listing failed.
    pub versions: Option<usize>,
}

/// App metadata is required; the version count is best effort.
pub async fn fetch_summary(client: &AppStoreClient) -> Result<AppStoreSummary, AppStoreError> {
    let app = client.fetch_app().await?;

    let versions = match client.count_versions().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!("Could not list App Store versions for {}: {}", client.app_id(), e);
            None
        }
    };

    Ok(AppStoreSummary { app, versions })
}
