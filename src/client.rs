//! Token-guarded brokerage API client
//!
//! The client owns a single access token. Every request goes through
//! [`TokenGuardedClient::ensure_token`], which holds the client's lock for the
//! whole check-and-refresh, so concurrent callers that find no usable token
//! trigger exactly one authentication call between them.

use crate::{
    config::{Credentials, UpstreamConfig},
    constants::{
        DIAGNOSTIC_SNIPPET_LEN, TOKEN_DEFAULT_TTL_SECS, TOKEN_MIN_LIFETIME_SECS,
        TOKEN_REFRESH_ATTEMPTS, TOKEN_RETRY_DELAY_MS, TOKEN_SAFETY_MARGIN_SECS, USER_AGENT,
    },
    error::GatewayError,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Authenticated access to the brokerage data endpoints
///
/// `tr_id` is the provider's operation identifier for `path`.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn authenticated_request(
        &self,
        path: &str,
        tr_id: &str,
        query: &[(&str, String)],
    ) -> Result<Value, GatewayError>;
}

/// Bearer token issued by the auth endpoint
///
/// Replaced whole on every refresh, never patched.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, acquired_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            acquired_at,
            expires_at,
        }
    }

    /// Builds a token from a provider-reported TTL
    ///
    /// The TTL is stretched to at least `safety_margin + min_lifetime`, so a
    /// very short provider TTL still yields `min_lifetime` of use before the
    /// next refresh.
    pub fn from_ttl(
        value: impl Into<String>,
        acquired_at: DateTime<Utc>,
        ttl: Duration,
        policy: &TokenPolicy,
    ) -> Self {
        let effective = ttl.max(policy.safety_margin + policy.min_lifetime);
        Self::new(value, acquired_at, acquired_at + effective)
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True once `now` is within `safety_margin` of expiry
    pub fn needs_refresh(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        now + safety_margin >= self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token refresh parameters
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    pub safety_margin: Duration,
    pub min_lifetime: Duration,
    pub default_ttl: Duration,
    pub attempts: u32,
    pub retry_delay: std::time::Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            safety_margin: Duration::seconds(TOKEN_SAFETY_MARGIN_SECS),
            min_lifetime: Duration::seconds(TOKEN_MIN_LIFETIME_SECS),
            default_ttl: Duration::seconds(TOKEN_DEFAULT_TTL_SECS),
            attempts: TOKEN_REFRESH_ATTEMPTS,
            retry_delay: std::time::Duration::from_millis(TOKEN_RETRY_DELAY_MS),
        }
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    appkey: &'a str,
    appsecret: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default, alias = "ttl_seconds")]
    expires_in: Option<i64>,
}

/// Brokerage API client with a lock-guarded, self-refreshing access token
pub struct TokenGuardedClient {
    http: Client,
    base_url: String,
    oauth_path: String,
    credentials: Credentials,
    policy: TokenPolicy,
    token: Mutex<Option<AccessToken>>,
    closed: AtomicBool,
}

impl TokenGuardedClient {
    /// Creates a client with the default token policy
    pub fn new(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        Self::with_policy(config, TokenPolicy::default())
    }

    pub fn with_policy(config: &UpstreamConfig, policy: TokenPolicy) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| GatewayError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            oauth_path: config.oauth_path.clone(),
            credentials: config.credentials.clone(),
            policy,
            token: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Returns a usable token value, refreshing under the lock if needed
    pub async fn ensure_token(&self) -> Result<String, GatewayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::config("upstream client is closed"));
        }

        let mut held = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = held.as_ref() {
            if !token.needs_refresh(now, self.policy.safety_margin) {
                return Ok(token.value().to_string());
            }
        }

        match self.request_token().await {
            Ok(token) => {
                tracing::info!(expires_at = %token.expires_at(), "Acquired upstream access token");
                let value = token.value().to_string();
                *held = Some(token);
                Ok(value)
            }
            Err(e) => match held.as_ref() {
                // Never discard a token that is still valid
                Some(token) if !token.is_expired(Utc::now()) => {
                    tracing::warn!(
                        error = %e,
                        expires_at = %token.expires_at(),
                        "Token refresh failed, continuing with current token"
                    );
                    Ok(token.value().to_string())
                }
                _ => Err(e),
            },
        }
    }

    /// Requests a new token, at most `policy.attempts` times
    async fn request_token(&self) -> Result<AccessToken, GatewayError> {
        let url = format!("{}{}", self.base_url, self.oauth_path);
        let body = TokenRequest {
            grant_type: "client_credentials",
            appkey: self.credentials.app_key(),
            appsecret: self.credentials.app_secret(),
        };

        let attempts = self.policy.attempts.max(1);
        let mut last_failure = (0u16, String::new());

        for attempt in 1..=attempts {
            match self.http.post(&url).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if status.is_success() {
                        match serde_json::from_str::<TokenResponse>(&text) {
                            Ok(parsed) => {
                                let ttl = parsed
                                    .expires_in
                                    .map(Duration::seconds)
                                    .unwrap_or(self.policy.default_ttl);
                                return Ok(AccessToken::from_ttl(
                                    parsed.access_token,
                                    Utc::now(),
                                    ttl,
                                    &self.policy,
                                ));
                            }
                            Err(e) => {
                                last_failure = (
                                    status.as_u16(),
                                    format!("unreadable token response ({e}): {}", self.snippet(&text)),
                                );
                            }
                        }
                    } else {
                        last_failure = (status.as_u16(), self.snippet(&text));
                    }
                }
                Err(e) => {
                    last_failure = (0, e.without_url().to_string());
                }
            }

            tracing::warn!(
                attempt = attempt,
                max_attempts = attempts,
                status = last_failure.0,
                "Upstream token request failed"
            );
            if attempt < attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        let (status, hint) = last_failure;
        Err(GatewayError::AuthFailure { status, hint })
    }

    /// Drops the held token if it is still the one that was rejected
    async fn invalidate(&self, rejected: &str) {
        let mut held = self.token.lock().await;
        if held.as_ref().is_some_and(|t| t.value() == rejected) {
            *held = None;
        }
    }

    fn snippet(&self, text: &str) -> String {
        diagnostic_snippet(&self.credentials.redact(text), DIAGNOSTIC_SNIPPET_LEN)
    }

    /// Releases the token; later requests fail with a configuration error
    ///
    /// Pooled connections are released once the last reference to the
    /// client is dropped.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.token.lock().await.take();
        tracing::debug!("Upstream client closed");
    }

    async fn send(
        &self,
        token: &str,
        path: &str,
        tr_id: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .bearer_auth(token)
            .header("appkey", self.credentials.app_key())
            .header("appsecret", self.credentials.app_secret())
            .header("tr_id", tr_id)
            .header("custtype", "P")
            .send()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl UpstreamApi for TokenGuardedClient {
    async fn authenticated_request(
        &self,
        path: &str,
        tr_id: &str,
        query: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let mut token = self.ensure_token().await?;
        let mut response = self.send(&token, path, tr_id, query).await?;

        // A token the upstream no longer honours gets one refresh-and-retry
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            tracing::warn!(
                status = response.status().as_u16(),
                tr_id = tr_id,
                "Upstream refused token, refreshing"
            );
            self.invalidate(&token).await;
            token = self.ensure_token().await?;
            response = self.send(&token, path, tr_id, query).await?;
        }

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::RateLimited);
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::unreachable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                self.snippet(&text)
            )));
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            GatewayError::invalid_response(format!("{e}: {}", self.snippet(&text)))
        })?;

        if body.get("rt_cd").and_then(Value::as_str) != Some("0") {
            let code = body
                .get("msg_cd")
                .or_else(|| body.get("rt_cd"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let message = body
                .get("msg1")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .trim()
                .to_string();
            return Err(GatewayError::UpstreamRejected { code, message });
        }

        Ok(body)
    }
}

/// Truncates `text` to `limit` characters and flattens it onto one line
pub fn diagnostic_snippet(text: &str, limit: usize) -> String {
    text.chars()
        .take(limit)
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}
