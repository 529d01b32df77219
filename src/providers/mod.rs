//! Upstream provider implementations

pub mod alphavantage;
pub mod coingecko;
pub mod dart;
pub mod kis;

pub use alphavantage::AlphaVantageIntradaySource;
pub use coingecko::{CoinGeckoChartSource, CoinGeckoSpotSource};
pub use dart::DartClient;
