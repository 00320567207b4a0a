//! Bearer-token acquisition for the upstream API.
//!
//! Tokens come from a client-credentials-style endpoint and expire; we
//! treat them as stale 60 seconds before their stated lifetime so a
//! request never goes out with a token about to lapse mid-flight.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Slack subtracted from the token's stated lifetime.
const EXPIRY_MARGIN_SECS: u64 = 60;

/// Bound on the token request. A hung auth endpoint would otherwise hold
/// the token mutex, and through it any refresh pass waiting on a token.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// TokenProvider trait
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait TokenProvider: Send + Sync {
    /// Return a bearer token that is currently valid, refreshing if needed.
    async fn bearer_token(&self) -> Result<String>;

    /// Discard the cached token so the next call fetches a fresh one.
    async fn invalidate(&self);
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub auth_url: String,
    pub email: String,
    pub name: String,
    pub roll_no: String,
    pub access_code: String,
    pub client_id: String,
    pub client_secret: String,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self> {
        fn required(key: &str) -> Result<String> {
            env::var(key).with_context(|| format!("{} environment variable must be set", key))
        }

        Ok(Self {
            auth_url: required("AUTH_API_URL")?,
            email: required("AUTH_EMAIL")?,
            name: required("AUTH_NAME")?,
            roll_no: required("AUTH_ROLLNO")?,
            access_code: required("AUTH_ACCESS_CODE")?,
            client_id: required("AUTH_CLIENT_ID")?,
            client_secret: required("AUTH_CLIENT_SECRET")?,
        })
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct AuthRequest<'a> {
    email: &'a str,
    name: &'a str,
    #[serde(rename = "rollNo")]
    roll_no: &'a str,
    #[serde(rename = "accessCode")]
    access_code: &'a str,
    #[serde(rename = "clientID")]
    client_id: &'a str,
    #[serde(rename = "clientSecret")]
    client_secret: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    access_token: String,
    expires_in: u64,
}

// ============================================================================
// Cached token state
// ============================================================================

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn from_response(resp: AuthResponse, now: Instant) -> Self {
        let lifetime = Duration::from_secs(resp.expires_in.saturating_sub(EXPIRY_MARGIN_SECS));
        Self {
            value: resp.access_token,
            expires_at: now + lifetime,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

// ============================================================================
// AuthTokenProvider — token-endpoint implementation
// ============================================================================

/// Fetches and caches a bearer token.
///
/// The cached slot lives behind an async mutex that is held across the
/// refresh request, so concurrent callers that all find the token stale
/// collapse onto a single in-flight fetch: the first holder refreshes,
/// the rest observe the fresh token when the lock is released.
pub struct AuthTokenProvider {
    http: reqwest::Client,
    config: AuthConfig,
    token: Mutex<Option<CachedToken>>,
}

impl AuthTokenProvider {
    pub fn new(config: AuthConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            config,
            token: Mutex::new(None),
        }
    }

    async fn fetch_new_token(&self) -> Result<CachedToken> {
        let payload = AuthRequest {
            email: &self.config.email,
            name: &self.config.name,
            roll_no: &self.config.roll_no,
            access_code: &self.config.access_code,
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
        };

        let resp: AuthResponse = self
            .http
            .post(&self.config.auth_url)
            .json(&payload)
            .send()
            .await
            .context("auth endpoint unreachable")?
            .error_for_status()
            .context("auth endpoint rejected credentials")?
            .json()
            .await
            .context("invalid token response format")?;

        info!(expires_in = resp.expires_in, "fetched new access token");
        Ok(CachedToken::from_response(resp, Instant::now()))
    }
}

impl TokenProvider for AuthTokenProvider {
    async fn bearer_token(&self) -> Result<String> {
        let mut slot = self.token.lock().await;

        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh(Instant::now()) {
                return Ok(cached.value.clone());
            }
        }

        match self.fetch_new_token().await {
            Ok(token) => {
                let value = token.value.clone();
                *slot = Some(token);
                Ok(value)
            }
            Err(e) => {
                // A stale token is worse than none: clear before propagating.
                *slot = None;
                warn!(error = %e, "token refresh failed");
                Err(e)
            }
        }
    }

    async fn invalidate(&self) {
        *self.token.lock().await = None;
    }
}

// ============================================================================
// Test utilities
// ============================================================================
