//! # Market-Data Gateway
//!
//! Aggregates quotes and fundamentals from third-party market-data providers,
//! shields callers from their instability, and fans freshly observed data out
//! to any number of live subscribers.
//!
//! ## Components
//!
//! - [`FreshnessCache`]: durable read-through cache with per-write freshness windows
//! - [`TokenGuardedClient`]: brokerage API client owning one single-flight access token
//! - [`BroadcastHub`]: named-channel pub/sub with an optional cross-process relay
//! - [`PollingAdapter`]: background poller with exponential backoff and jitter
//! - [`Gateway`]: cached pull-model fetch functions over the brokerage and disclosure APIs
//!
//! ## Usage
//!
//! ```no_run
//! use market_data_gateway::{GatewayConfig, GatewayService};
//! use chrono::NaiveDate;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = GatewayService::start(GatewayConfig::from_env()?).await?;
//!
//! // Push model: live quotes
//! let mut crypto = service.subscribe("crypto");
//! if let Some(quote) = crypto.recv().await {
//!     println!("{}: {:.2}", quote.symbol, quote.close);
//! }
//!
//! // Pull model: cached price history
//! if let Some(gateway) = service.gateway() {
//!     let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
//!     let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
//!     let series = gateway.get_series("005930", start, end).await?;
//!     println!("{} bars", series.bars.len());
//! }
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod metrics;
pub mod poller;
pub mod provider;
pub mod providers;
pub mod relay;
pub mod service;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheKey, FreshnessCache};
pub use client::{AccessToken, TokenGuardedClient, TokenPolicy, UpstreamApi};
pub use config::{Credentials, GatewayConfig, RelayMode, Transport, UpstreamConfig};
pub use error::{CacheError, ErrorKind, GatewayError, PollError, RelayError};
pub use gateway::{DataKind, FetchMode, Gateway, StalePolicy};
pub use hub::{BroadcastHub, Subscription};
pub use metrics::AdapterMetrics;
pub use poller::{BackoffPolicy, CycleOutcome, PollPhase, PollingAdapter, PollingState};
pub use provider::PollSource;
pub use providers::{
    AlphaVantageIntradaySource, CoinGeckoChartSource, CoinGeckoSpotSource, DartClient,
};
pub use relay::{InMemoryRelay, Relay, RelayEnvelope};
#[cfg(feature = "redis-relay")]
pub use relay::RedisRelay;
pub use service::GatewayService;
pub use types::{
    CompanyProfile, CorpCode, FinancialRatio, FinancialStatement, InvestmentOpinion, PriceBar,
    PriceSeries, QuoteRecord, ReturnsPanel, StatementRow,
};
