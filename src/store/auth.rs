//! Service-account authentication for the Firestore REST API.
//!
//! A service account key signs a short-lived RS256 assertion, which the
//! token endpoint exchanges for an OAuth access token. The token is cached
//! until shortly before it expires.

use super::StoreError;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 60;

/// The fields of a service account key file this crate uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    /// Load a key file. A missing or malformed file is fatal for the run.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read service account key: {} (set GOOGLE_APPLICATION_CREDENTIALS)",
                path.display()
            )
        })?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse service account key: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(content)?;
        Ok(key)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Produces bearer tokens for Firestore requests.
pub struct AccessTokenSource {
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl AccessTokenSource {
    /// The private key is parsed up front so a bad key fails the run early.
    pub fn new(key: ServiceAccountKey, http: reqwest::Client) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("Service account private_key is not a valid RSA PEM key")?;

        Ok(Self {
            key,
            signing_key,
            http,
            cached: Mutex::new(None),
        })
    }

    /// Signed assertion for the token exchange.
    pub fn assertion(&self, now: DateTime<Utc>) -> Result<String, StoreError> {
        let claims = AssertionClaims {
            iss: self.key.client_email.clone(),
            scope: DATASTORE_SCOPE.to_string(),
            aud: self.key.token_uri.clone(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| StoreError::Auth(format!("failed to sign assertion: {}", e)))
    }

    /// Current access token, exchanging a fresh assertion when needed.
    pub async fn token(&self) -> Result<String, StoreError> {
        let now = Utc::now();

        if let Some(token) = self.cached_token(now) {
            return Ok(token);
        }

        debug!("Exchanging assertion for access token at {}", self.key.token_uri);
        let assertion = self.assertion(now)?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!("token endpoint returned {}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Auth(format!("unreadable token response: {}", e)))?;

        let cached = CachedToken {
            value: token.access_token.clone(),
            expires_at: now + Duration::seconds(token.expires_in - REFRESH_MARGIN_SECS),
        };
        if let Ok(mut slot) = self.cached.lock() {
            *slot = Some(cached);
        }

        Ok(token.access_token)
    }

    fn cached_token(&self, now: DateTime<Utc>) -> Option<String> {
        let slot = self.cached.lock().ok()?;
        slot.as_ref()
            .filter(|t| t.expires_at > now)
            .map(|t| t.value.clone())
    }
}
