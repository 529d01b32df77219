//! Constants for the market-data gateway
//!
//! Defaults used when the environment does not override them. Everything
//! that can be tuned at runtime is resolved once by `GatewayConfig`.

/// Safety margin before token expiry at which a refresh is forced (in seconds)
pub const TOKEN_SAFETY_MARGIN_SECS: i64 = 300;

/// Minimum usable token lifetime after the safety margin (in seconds)
pub const TOKEN_MIN_LIFETIME_SECS: i64 = 600;

/// Token TTL assumed when the auth endpoint does not report one (in seconds)
pub const TOKEN_DEFAULT_TTL_SECS: i64 = 86_400;

/// Maximum number of token requests per refresh
pub const TOKEN_REFRESH_ATTEMPTS: u32 = 2;

/// Fixed delay between token request attempts (in milliseconds)
pub const TOKEN_RETRY_DELAY_MS: u64 = 200;

/// Maximum length of an upstream response excerpt embedded in errors
pub const DIAGNOSTIC_SNIPPET_LEN: usize = 200;

/// HTTP request timeout for upstream calls (in seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Brokerage API base URL
pub const KIS_BASE_URL: &str = "https://openapi.koreainvestment.com:9443";

/// Brokerage OAuth endpoint
pub const KIS_OAUTH_PATH: &str = "/oauth2/tokenP";

/// Disclosure system (DART) API root
pub const DART_API_URL: &str = "https://opendart.fss.or.kr/api";

/// Timeout for the corp-code archive download (in seconds)
pub const DART_ARCHIVE_TIMEOUT_SECS: u64 = 25;

/// Default root of the durable cache
pub const DEFAULT_CACHE_DIR: &str = "data/cache";

/// Polling backoff floor (in milliseconds)
pub const POLL_BACKOFF_FLOOR_MS: u64 = 1_000;

/// Polling backoff ceiling (in milliseconds)
pub const POLL_BACKOFF_CEILING_MS: u64 = 60_000;

/// Upper bound of the random jitter added to every polling delay (in milliseconds)
pub const POLL_JITTER_MS: u64 = 1_000;

/// CoinGecko API base URL
pub const COINGECKO_API_URL: &str = "https://api.coingecko.com/api/v3";

/// Quote currency for CoinGecko requests
pub const COINGECKO_VS_CURRENCY: &str = "usd";

/// Alpha Vantage query endpoint
pub const ALPHAVANTAGE_API_URL: &str = "https://www.alphavantage.co/query";

/// Alpha Vantage key used when none is configured
pub const ALPHAVANTAGE_DEMO_KEY: &str = "demo";

/// Intraday bar interval requested from Alpha Vantage
pub const ALPHAVANTAGE_INTERVAL: &str = "1min";

/// Exchange time zone assumed when Alpha Vantage metadata omits it
pub const ALPHAVANTAGE_DEFAULT_TZ: &str = "US/Eastern";

/// Crypto assets polled when none are configured
pub const DEFAULT_CRYPTO_IDS: &[&str] = &["bitcoin", "ethereum"];

/// Channel carrying crypto OHLC snapshots
pub const CRYPTO_CHANNEL: &str = "crypto";

/// Channel carrying intraday equity bars
pub const EQUITY_CHANNEL: &str = "equity";

/// Channel carrying multi-asset spot quotes
pub const QUOTES_CHANNEL: &str = "quotes";

/// Key prefix used on the external relay
pub const RELAY_PREFIX: &str = "gateway";

/// Delay before the relay listener reconnects (in seconds)
pub const RELAY_RECONNECT_SECS: u64 = 5;

/// Bound on a single relay connect or publish (in seconds)
pub const RELAY_IO_TIMEOUT_SECS: u64 = 3;

/// User agent for HTTP requests
pub const USER_AGENT: &str = "market-data-gateway/0.1.0";
