//! CoinGecko polling sources

use crate::{
    constants::{COINGECKO_API_URL, COINGECKO_VS_CURRENCY, CRYPTO_CHANNEL, QUOTES_CHANNEL},
    error::PollError,
    provider::PollSource,
    types::QuoteRecord,
};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;

/// CoinGecko `market_chart` response
///
/// Points are `[epoch_ms, value]` pairs.
#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
    #[serde(default)]
    total_volumes: Vec<(f64, f64)>,
}

/// In-band error CoinGecko sends on throttled 200 responses
fn in_band_rate_limit(body: &Value) -> Option<PollError> {
    let status = body.get("status")?;
    if status.get("error_code").and_then(Value::as_i64) == Some(429) {
        let message = status
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("throttled");
        return Some(PollError::RateLimited(message.to_string()));
    }
    None
}

/// Coin ids are embedded in URL paths and comma-joined lists
fn check_coin_id(coin_id: &str) -> Result<(), PollError> {
    if coin_id.is_empty() {
        return Err(PollError::Fatal("coin id cannot be empty".to_string()));
    }
    if coin_id
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | ',' | '?' | '#'))
    {
        return Err(PollError::Fatal(format!("invalid coin id: {coin_id:?}")));
    }
    Ok(())
}

/// Rolling one-day OHLC snapshot for a single coin
pub struct CoinGeckoChartSource {
    coin_id: String,
    vs_currency: String,
    base_url: String,
}

impl CoinGeckoChartSource {
    pub fn new(coin_id: impl Into<String>) -> Self {
        Self {
            coin_id: coin_id.into(),
            vs_currency: COINGECKO_VS_CURRENCY.to_string(),
            base_url: COINGECKO_API_URL.to_string(),
        }
    }

    /// Points the source at a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_vs_currency(mut self, vs_currency: impl Into<String>) -> Self {
        self.vs_currency = vs_currency.into();
        self
    }
}

impl PollSource for CoinGeckoChartSource {
    fn source_name(&self) -> &'static str {
        "coingecko"
    }

    fn channel(&self) -> &str {
        CRYPTO_CHANNEL
    }

    fn target(&self) -> String {
        self.coin_id.clone()
    }

    fn validate(&self) -> Result<(), PollError> {
        check_coin_id(&self.coin_id)
    }

    fn build_request(&self, http: &Client) -> RequestBuilder {
        http.get(format!(
            "{}/coins/{}/market_chart",
            self.base_url, self.coin_id
        ))
        .query(&[("vs_currency", self.vs_currency.as_str()), ("days", "1")])
    }

    fn normalize(&self, body: &Value) -> Result<Vec<QuoteRecord>, PollError> {
        if let Some(err) = in_band_rate_limit(body) {
            return Err(err);
        }

        let chart = MarketChartResponse::deserialize(body).map_err(|e| {
            PollError::Transient(format!("Failed to parse CoinGecko market chart: {e}"))
        })?;

        let (Some(first), Some(last)) = (chart.prices.first(), chart.prices.last()) else {
            return Ok(Vec::new());
        };

        let high = chart
            .prices
            .iter()
            .map(|(_, price)| *price)
            .fold(f64::MIN, f64::max);
        let low = chart
            .prices
            .iter()
            .map(|(_, price)| *price)
            .fold(f64::MAX, f64::min);
        let volume = chart.total_volumes.last().map(|(_, v)| *v).unwrap_or(0.0);
        let timestamp = DateTime::<Utc>::from_timestamp_millis(last.0 as i64).ok_or_else(|| {
            PollError::Transient(format!("CoinGecko timestamp out of range: {}", last.0))
        })?;

        Ok(vec![QuoteRecord {
            symbol: self.coin_id.clone(),
            timestamp,
            open: first.1,
            high,
            low,
            close: last.1,
            volume,
            source: self.source_name().to_string(),
        }])
    }
}

/// Spot prices for several coins in one request
pub struct CoinGeckoSpotSource {
    coin_ids: Vec<String>,
    vs_currency: String,
    base_url: String,
}

impl CoinGeckoSpotSource {
    pub fn new(coin_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            coin_ids: coin_ids.into_iter().map(Into::into).collect(),
            vs_currency: COINGECKO_VS_CURRENCY.to_string(),
            base_url: COINGECKO_API_URL.to_string(),
        }
    }

    /// Points the source at a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn record(&self, coin_id: &str, entry: &Value) -> Option<QuoteRecord> {
        let price = entry.get(&self.vs_currency)?.as_f64()?;
        let volume = entry
            .get(format!("{}_24h_vol", self.vs_currency))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let timestamp = entry
            .get("last_updated_at")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        Some(QuoteRecord::spot(
            coin_id,
            timestamp,
            price,
            volume,
            self.source_name(),
        ))
    }
}

impl PollSource for CoinGeckoSpotSource {
    fn source_name(&self) -> &'static str {
        "coingecko"
    }

    fn channel(&self) -> &str {
        QUOTES_CHANNEL
    }

    fn target(&self) -> String {
        self.coin_ids.join(",")
    }

    fn validate(&self) -> Result<(), PollError> {
        if self.coin_ids.is_empty() {
            return Err(PollError::Fatal("coin id list cannot be empty".to_string()));
        }
        self.coin_ids.iter().try_for_each(|id| check_coin_id(id))
    }

    fn build_request(&self, http: &Client) -> RequestBuilder {
        http.get(format!("{}/simple/price", self.base_url)).query(&[
            ("ids", self.coin_ids.join(",").as_str()),
            ("vs_currencies", self.vs_currency.as_str()),
            ("include_24hr_vol", "true"),
            ("include_last_updated_at", "true"),
        ])
    }

    fn normalize(&self, body: &Value) -> Result<Vec<QuoteRecord>, PollError> {
        if let Some(err) = in_band_rate_limit(body) {
            return Err(err);
        }
        let Some(prices) = body.as_object() else {
            return Err(PollError::Transient(
                "CoinGecko simple price body is not an object".to_string(),
            ));
        };

        let mut records = Vec::with_capacity(self.coin_ids.len());
        for coin_id in &self.coin_ids {
            match prices.get(coin_id).and_then(|entry| self.record(coin_id, entry)) {
                Some(record) => records.push(record),
                None => tracing::debug!(coin_id = %coin_id, "No usable CoinGecko price, skipping"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chart_normalizes_to_ohlc() {
        let source = CoinGeckoChartSource::new("bitcoin");
        let body = json!({
            "prices": [[1704067200000.0, 100.0], [1704070800000.0, 120.0], [1704074400000.0, 90.0], [1704078000000.0, 110.0]],
            "total_volumes": [[1704067200000.0, 5.0], [1704078000000.0, 7.5]]
        });

        let records = source.normalize(&body).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.symbol, "bitcoin");
        assert_eq!(record.open, 100.0);
        assert_eq!(record.high, 120.0);
        assert_eq!(record.low, 90.0);
        assert_eq!(record.close, 110.0);
        assert_eq!(record.volume, 7.5);
        assert_eq!(record.timestamp.timestamp(), 1_704_078_000);
        assert_eq!(record.source, "coingecko");
    }

    #[test]
    fn test_chart_without_prices_is_no_new_data() {
        let source = CoinGeckoChartSource::new("bitcoin");
        assert!(source.normalize(&json!({"prices": []})).unwrap().is_empty());
        assert!(source.normalize(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_chart_malformed_points_are_transient() {
        let source = CoinGeckoChartSource::new("bitcoin");
        let err = source.normalize(&json!({"prices": "nope"})).unwrap_err();
        assert!(matches!(err, PollError::Transient(_)));
    }

    #[test]
    fn test_in_band_throttle_is_rate_limited() {
        let source = CoinGeckoChartSource::new("bitcoin");
        let body = json!({"status": {"error_code": 429, "error_message": "You've exceeded the Rate Limit"}});
        assert!(matches!(
            source.normalize(&body),
            Err(PollError::RateLimited(_))
        ));
    }

    #[test]
    fn test_spot_skips_missing_ids() {
        let source = CoinGeckoSpotSource::new(["bitcoin", "ethereum", "dogecoin"]);
        let body = json!({
            "bitcoin": {"usd": 42000.5, "usd_24h_vol": 1.5e10, "last_updated_at": 1704067200},
            "ethereum": {"usd": null}
        });

        let records = source.normalize(&body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].symbol, "bitcoin");
        assert_eq!(records[0].close, 42000.5);
        assert_eq!(records[0].open, records[0].close);
        assert_eq!(records[0].volume, 1.5e10);
        assert_eq!(records[0].timestamp.timestamp(), 1_704_067_200);
    }

    #[test]
    fn test_validate_rejects_blank_ids() {
        assert!(CoinGeckoChartSource::new(" ").validate().is_err());
        assert!(CoinGeckoSpotSource::new(Vec::<String>::new()).validate().is_err());
        assert!(CoinGeckoSpotSource::new(["bitcoin", ""]).validate().is_err());
        assert!(CoinGeckoSpotSource::new(["bitcoin"]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_ids_that_break_the_url() {
        assert!(CoinGeckoChartSource::new("bitcoin/../ping").validate().is_err());
        assert!(CoinGeckoChartSource::new("bit coin").validate().is_err());
        assert!(CoinGeckoChartSource::new("bitcoin\n").validate().is_err());
        assert!(CoinGeckoSpotSource::new(["bitcoin,ethereum"]).validate().is_err());
        assert!(CoinGeckoChartSource::new("usd-coin").validate().is_ok());
    }

    #[test]
    fn test_chart_and_spot_share_symbol_spelling() {
        let chart = CoinGeckoChartSource::new("ethereum")
            .normalize(&json!({"prices": [[1704067200000.0, 2500.0]]}))
            .unwrap();
        let spot = CoinGeckoSpotSource::new(["ethereum"])
            .normalize(&json!({"ethereum": {"usd": 2501.0}}))
            .unwrap();
        assert_eq!(chart[0].symbol, spot[0].symbol);
        assert_eq!(spot[0].symbol, "ethereum");
    }

    #[test]
    fn test_spot_request_targets_simple_price() {
        let source = CoinGeckoSpotSource::new(["bitcoin", "ethereum"])
            .with_base_url("http://localhost:1234/");
        let request = source.build_request(&Client::new()).build().unwrap();
        assert_eq!(request.url().path(), "/simple/price");
        assert!(request
            .url()
            .query()
            .unwrap()
            .contains("ids=bitcoin%2Cethereum"));
    }
}
