//! Startup configuration
//!
//! Resolved once when the service starts and never re-read per call.
//! Unset values fall back to the defaults in `constants`.

use crate::constants::{
    ALPHAVANTAGE_DEMO_KEY, DEFAULT_CACHE_DIR, DEFAULT_CRYPTO_IDS, KIS_BASE_URL, KIS_OAUTH_PATH,
    POLL_BACKOFF_CEILING_MS, POLL_BACKOFF_FLOOR_MS, POLL_JITTER_MS, REQUEST_TIMEOUT_SECS,
};
use crate::error::GatewayError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Whether publishes are mirrored through an external relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Enabled,
    Disabled,
}

impl FromStr for RelayMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            other => Err(GatewayError::config(format!(
                "unknown relay mode {other:?} (expected enabled|disabled)"
            ))),
        }
    }
}

/// Streaming transport offered to the request-handling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Sse,
    Socket,
    None,
}

impl FromStr for Transport {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sse" => Ok(Self::Sse),
            "socket" => Ok(Self::Socket),
            "none" => Ok(Self::None),
            other => Err(GatewayError::config(format!(
                "unknown transport {other:?} (expected sse|socket|none)"
            ))),
        }
    }
}

/// Brokerage API client credentials
///
/// `Debug` redacts the secret.
#[derive(Clone)]
pub struct Credentials {
    app_key: String,
    app_secret: String,
}

impl Credentials {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let app_key = app_key.into();
        let app_secret = app_secret.into();
        if app_key.is_empty() {
            return Err(GatewayError::config("app key cannot be empty"));
        }
        if app_secret.is_empty() {
            return Err(GatewayError::config("app secret cannot be empty"));
        }
        Ok(Self {
            app_key,
            app_secret,
        })
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }

    /// Replaces any credential value occurring in `text`
    pub fn redact(&self, text: &str) -> String {
        text.replace(&self.app_secret, "[REDACTED]")
            .replace(&self.app_key, "[REDACTED]")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("app_key", &"[REDACTED]")
            .field("app_secret", &"[REDACTED]")
            .finish()
    }
}

/// Connection settings for the token-guarded brokerage API
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub oauth_path: String,
    pub credentials: Credentials,
    pub timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            oauth_path: KIS_OAUTH_PATH.to_string(),
            credentials,
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Polling backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    pub floor: Duration,
    pub ceiling: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(POLL_BACKOFF_FLOOR_MS),
            ceiling: Duration::from_millis(POLL_BACKOFF_CEILING_MS),
            max_jitter: Duration::from_millis(POLL_JITTER_MS),
        }
    }
}

/// Everything the gateway needs at startup
#[derive(Clone)]
pub struct GatewayConfig {
    /// Brokerage API; `None` disables the pull-model fetch functions
    pub upstream: Option<UpstreamConfig>,
    /// Disclosure system key; `None` disables the statement and corp-code lookups
    pub dart_api_key: Option<String>,
    pub cache_dir: PathBuf,
    pub relay: RelayMode,
    pub relay_url: Option<String>,
    pub transport: Transport,
    pub alphavantage_api_key: String,
    pub crypto_ids: Vec<String>,
    pub equity_symbols: Vec<String>,
    pub backoff: BackoffSettings,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("upstream", &self.upstream)
            .field("dart_api_key", &self.dart_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("cache_dir", &self.cache_dir)
            .field("relay", &self.relay)
            .field("relay_url", &self.relay_url.as_ref().map(|_| "[REDACTED]"))
            .field("transport", &self.transport)
            .field("alphavantage_api_key", &"[REDACTED]")
            .field("crypto_ids", &self.crypto_ids)
            .field("equity_symbols", &self.equity_symbols)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            dart_api_key: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            relay: RelayMode::Disabled,
            relay_url: None,
            transport: Transport::Sse,
            alphavantage_api_key: ALPHAVANTAGE_DEMO_KEY.to_string(),
            crypto_ids: DEFAULT_CRYPTO_IDS.iter().map(|s| s.to_string()).collect(),
            equity_symbols: Vec::new(),
            backoff: BackoffSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Reads configuration from the process environment
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration from an arbitrary key-value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GatewayError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let (Some(key), Some(secret)) = (get("KIS_APP_KEY"), get("KIS_APP_SECRET")) {
            let base_url = get("KIS_BASE_URL").unwrap_or_else(|| KIS_BASE_URL.to_string());
            config.upstream = Some(UpstreamConfig::new(base_url, Credentials::new(key, secret)?));
        }

        config.dart_api_key = get("DART_API_KEY");

        if let Some(dir) = get("CORE_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }

        config.relay_url = get("REDIS_URL");
        config.relay = match get("GATEWAY_RELAY") {
            Some(mode) => mode.parse()?,
            None if config.relay_url.is_some() => RelayMode::Enabled,
            None => RelayMode::Disabled,
        };
        if config.relay == RelayMode::Enabled && config.relay_url.is_none() {
            return Err(GatewayError::config("relay enabled but REDIS_URL is not set"));
        }

        if let Some(transport) = get("GATEWAY_TRANSPORT") {
            config.transport = transport.parse()?;
        }

        if let Some(key) = get("ALPHAVANTAGE_API_KEY") {
            config.alphavantage_api_key = key;
        }

        if let Some(ids) = get("GATEWAY_CRYPTO_IDS") {
            config.crypto_ids = split_list(&ids);
        }
        if let Some(symbols) = get("GATEWAY_EQUITY_SYMBOLS") {
            config.equity_symbols = split_list(&symbols);
        }

        Ok(config)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
