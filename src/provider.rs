//! Polling source abstraction
//!
//! A source knows how to ask one upstream endpoint for a snapshot and how to
//! turn the answer into [`QuoteRecord`]s. Transport concerns (conditional
//! requests, status classification, backoff) live in the polling adapter.

use crate::{error::PollError, types::QuoteRecord};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;

/// Upstream endpoint polled by a [`crate::poller::PollingAdapter`]
pub trait PollSource: Send + Sync + 'static {
    /// Returns the name of this source, stamped on every record
    fn source_name(&self) -> &'static str;

    /// Hub channel the records are published on
    fn channel(&self) -> &str;

    /// Human-readable target used in logs (symbol, coin id list, ...)
    fn target(&self) -> String;

    /// Checks configuration before the first cycle
    ///
    /// An error here is fatal to the adapter.
    fn validate(&self) -> Result<(), PollError> {
        Ok(())
    }

    /// Builds the unconditional request for one cycle
    fn build_request(&self, http: &Client) -> RequestBuilder;

    /// Converts a decoded 200 body into records
    ///
    /// An empty vector means the upstream had nothing new. Bodies that carry
    /// an in-band rate limit or a configuration error map to the matching
    /// [`PollError`] variant.
    fn normalize(&self, body: &Value) -> Result<Vec<QuoteRecord>, PollError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use chrono::Utc;

    /// Mock source for testing
    ///
    /// Polls `{base_url}/quote` and expects `{"symbol": .., "price": ..}` or a
    /// list of such objects.
    pub struct MockSource {
        pub base_url: String,
        pub channel: String,
        pub symbol: String,
    }

    impl MockSource {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                base_url: base_url.into(),
                channel: "mock".to_string(),
                symbol: "MOCK".to_string(),
            }
        }

        fn record(item: &Value) -> Option<QuoteRecord> {
            let symbol = item.get("symbol")?.as_str()?;
            let price = item.get("price")?.as_f64()?;
            Some(QuoteRecord::spot(symbol, Utc::now(), price, 0.0, "mock"))
        }
    }

    impl PollSource for MockSource {
        fn source_name(&self) -> &'static str {
            "mock"
        }

        fn channel(&self) -> &str {
            &self.channel
        }

        fn target(&self) -> String {
            self.symbol.clone()
        }

        fn validate(&self) -> Result<(), PollError> {
            if self.symbol.is_empty() {
                return Err(PollError::Fatal("symbol cannot be empty".to_string()));
            }
            Ok(())
        }

        fn build_request(&self, http: &Client) -> RequestBuilder {
            http.get(format!("{}/quote", self.base_url))
                .query(&[("symbol", self.symbol.as_str())])
        }

        fn normalize(&self, body: &Value) -> Result<Vec<QuoteRecord>, PollError> {
            match body {
                Value::Array(items) => Ok(items.iter().filter_map(Self::record).collect()),
                Value::Object(_) => Ok(Self::record(body).into_iter().collect()),
                _ => Err(PollError::Transient("unexpected body".to_string())),
            }
        }
    }
}
