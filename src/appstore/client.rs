//! App Store Connect API client.

use crate::config::AppStoreConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

const AUDIENCE: &str = "appstoreconnect-v1";
const TOKEN_LIFETIME_MINUTES: i64 = 20;
const PAGE_LIMIT: u32 = 200;
const MAX_PAGES: usize = 50;

#[derive(Debug, Error)]
pub enum AppStoreError {
    #[error("request to App Store Connect failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("App Store API error: {status} {body}")]
    Api { status: u16, body: String },

    #[error("unexpected App Store response: {0}")]
    Malformed(String),

    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    iat: i64,
    exp: i64,
    aud: String,
}

/// API key material for one App Store Connect team.
pub struct AppStoreCredentials {
    pub issuer_id: String,
    pub key_id: String,
    signing_key: EncodingKey,
}

impl AppStoreCredentials {
    /// Read the `.p8` key named by the config. A missing or unreadable key
    /// file is fatal for the job.
    pub fn load(config: &AppStoreConfig, home: Option<&str>) -> Result<Self> {
        let path = config.resolved_key_path(home);
        let pem = std::fs::read(Path::new(&path)).with_context(|| {
            format!(
                "Failed to read App Store private key: {} (set APP_STORE_PRIVATE_KEY_PATH)",
                path
            )
        })?;
        Self::from_pem(&config.issuer_id, &config.key_id, &pem)
            .with_context(|| format!("Invalid App Store private key: {}", path))
    }

    pub fn from_pem(issuer_id: &str, key_id: &str, pem: &[u8]) -> Result<Self> {
        let signing_key = EncodingKey::from_ec_pem(pem)?;
        Ok(Self {
            issuer_id: issuer_id.to_string(),
            key_id: key_id.to_string(),
            signing_key,
        })
    }

    /// ES256 bearer token valid for twenty minutes from `now`.
    pub fn bearer_token(&self, now: DateTime<Utc>) -> Result<String, AppStoreError> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());

        let claims = Claims {
            iss: self.issuer_id.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::minutes(TOKEN_LIFETIME_MINUTES)).timestamp(),
            aud: AUDIENCE.to_string(),
        };

        Ok(jsonwebtoken::encode(&header, &claims, &self.signing_key)?)
    }
}

/// App metadata from `GET /v1/apps/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub app_name: String,
    pub bundle_id: String,
}

#[derive(Debug, Deserialize)]
struct AppResponse {
    data: AppData,
}

#[derive(Debug, Deserialize)]
struct AppData {
    attributes: AppAttributes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppAttributes {
    name: String,
    bundle_id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<serde_json::Value>,
    #[serde(default)]
    links: Option<ListLinks>,
}

#[derive(Debug, Deserialize)]
struct ListLinks {
    next: Option<String>,
}

/// One page of a list endpoint: its item count and the next page's URL.
#[derive(Debug, PartialEq)]
struct ListPage {
    len: usize,
    next: Option<String>,
}

pub struct AppStoreClient {
    base_url: String,
    app_id: String,
    credentials: AppStoreCredentials,
    http: reqwest::Client,
}

impl AppStoreClient {
    pub fn new(config: &AppStoreConfig, credentials: AppStoreCredentials, http: reqwest::Client) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            credentials,
            http,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub async fn fetch_app(&self) -> Result<AppInfo, AppStoreError> {
        let url = format!("{}/v1/apps/{}", self.base_url, self.app_id);
        let body = self.get(&url).await?;
        parse_app_response(&body)
    }

    /// Number of App Store versions the app has shipped, across every page.
    pub async fn count_versions(&self) -> Result<usize, AppStoreError> {
        let mut url = format!(
            "{}/v1/apps/{}/appStoreVersions?limit={}",
            self.base_url, self.app_id, PAGE_LIMIT
        );
        let mut total = 0;

        for _ in 0..MAX_PAGES {
            let page = parse_list_page(&self.get(&url).await?)?;
            total += page.len;
            match page.next {
                Some(next) => url = next,
                None => return Ok(total),
            }
        }

        Err(AppStoreError::Malformed(format!(
            "versions listing did not end after {} pages",
            MAX_PAGES
        )))
    }

    async fn get(&self, url: &str) -> Result<String, AppStoreError> {
        let token = self.credentials.bearer_token(Utc::now())?;
        debug!("GET {}", url);

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppStoreError::Api { status, body });
        }

        Ok(response.text().await?)
    }
}

fn parse_app_response(body: &str) -> Result<AppInfo, AppStoreError> {
    let parsed: AppResponse =
        serde_json::from_str(body).map_err(|e| AppStoreError::Malformed(e.to_string()))?;
    Ok(AppInfo {
        app_name: parsed.data.attributes.name,
        bundle_id: parsed.data.attributes.bundle_id,
    })
}

fn parse_list_page(body: &str) -> Result<ListPage, AppStoreError> {
    let parsed: ListResponse =
        serde_json::from_str(body).map_err(|e| AppStoreError::Malformed(e.to_string()))?;
    Ok(ListPage {
        len: parsed.data.len(),
        next: parsed.links.and_then(|l| l.next),
    })
}
