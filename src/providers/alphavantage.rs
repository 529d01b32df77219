//! Alpha Vantage intraday equity source

use crate::{
    constants::{
        ALPHAVANTAGE_API_URL, ALPHAVANTAGE_DEFAULT_TZ, ALPHAVANTAGE_INTERVAL, EQUITY_CHANNEL,
    },
    error::PollError,
    provider::PollSource,
    types::QuoteRecord,
};
use chrono::{NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Latest intraday bar for one equity symbol
pub struct AlphaVantageIntradaySource {
    symbol: String,
    api_key: String,
    interval: String,
    base_url: String,
}

impl AlphaVantageIntradaySource {
    pub fn new(symbol: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            api_key: api_key.into(),
            interval: ALPHAVANTAGE_INTERVAL.to_string(),
            base_url: ALPHAVANTAGE_API_URL.to_string(),
        }
    }

    /// Points the source at a different query endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = interval.into();
        self
    }

    fn time_zone(body: &Value) -> Tz {
        let name = body
            .get("Meta Data")
            .and_then(Value::as_object)
            .and_then(|meta| {
                meta.iter()
                    .find(|(k, _)| k.contains("Time Zone"))
                    .and_then(|(_, v)| v.as_str())
            })
            .unwrap_or(ALPHAVANTAGE_DEFAULT_TZ);
        name.parse::<Tz>().unwrap_or(chrono_tz::US::Eastern)
    }
}

/// Reads a numeric field that Alpha Vantage encodes as a string
fn field(bar: &Value, name: &str) -> Result<f64, PollError> {
    bar.get(name)
        .and_then(|v| match v {
            Value::String(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        })
        .ok_or_else(|| PollError::Transient(format!("Alpha Vantage bar missing {name:?}")))
}

impl PollSource for AlphaVantageIntradaySource {
    fn source_name(&self) -> &'static str {
        "alphavantage"
    }

    fn channel(&self) -> &str {
        EQUITY_CHANNEL
    }

    fn target(&self) -> String {
        self.symbol.clone()
    }

    fn validate(&self) -> Result<(), PollError> {
        if self.symbol.trim().is_empty() {
            return Err(PollError::Fatal("equity symbol cannot be empty".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(PollError::Fatal("Alpha Vantage API key cannot be empty".to_string()));
        }
        Ok(())
    }

    fn build_request(&self, http: &Client) -> RequestBuilder {
        http.get(&self.base_url).query(&[
            ("function", "TIME_SERIES_INTRADAY"),
            ("symbol", self.symbol.as_str()),
            ("interval", self.interval.as_str()),
            ("apikey", self.api_key.as_str()),
        ])
    }

    fn normalize(&self, body: &Value) -> Result<Vec<QuoteRecord>, PollError> {
        // Alpha Vantage reports throttling and bad requests with HTTP 200
        if let Some(note) = body
            .get("Note")
            .or_else(|| body.get("Information"))
            .and_then(Value::as_str)
        {
            return Err(PollError::RateLimited(note.to_string()));
        }
        if let Some(message) = body.get("Error Message").and_then(Value::as_str) {
            return Err(PollError::Fatal(message.to_string()));
        }

        let Some(series) = body
            .as_object()
            .and_then(|obj| obj.iter().find(|(k, _)| k.starts_with("Time Series")))
            .and_then(|(_, v)| v.as_object())
        else {
            return Ok(Vec::new());
        };

        // Keys are "YYYY-MM-DD HH:MM:SS", so the lexicographic max is the latest
        let Some((stamp, bar)) = series.iter().max_by(|a, b| a.0.cmp(b.0)) else {
            return Ok(Vec::new());
        };

        let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).map_err(|e| {
            PollError::Transient(format!("Alpha Vantage timestamp {stamp:?}: {e}"))
        })?;
        let tz = Self::time_zone(body);
        let timestamp = tz
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| {
                PollError::Transient(format!("Alpha Vantage timestamp {stamp:?} does not exist in {tz}"))
            })?
            .with_timezone(&Utc);

        Ok(vec![QuoteRecord {
            symbol: self.symbol.clone(),
            timestamp,
            open: field(bar, "1. open")?,
            high: field(bar, "2. high")?,
            low: field(bar, "3. low")?,
            close: field(bar, "4. close")?,
            volume: field(bar, "5. volume")?,
            source: self.source_name().to_string(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> AlphaVantageIntradaySource {
        AlphaVantageIntradaySource::new("IBM", "demo")
    }

    #[test]
    fn test_latest_bar_is_normalized() {
        let body = json!({
            "Meta Data": {
                "2. Symbol": "IBM",
                "6. Time Zone": "US/Eastern"
            },
            "Time Series (1min)": {
                "2024-01-10 15:58:00": {"1. open": "160.00", "2. high": "160.50", "3. low": "159.90", "4. close": "160.10", "5. volume": "1200"},
                "2024-01-10 15:59:00": {"1. open": "160.10", "2. high": "160.80", "3. low": "160.00", "4. close": "160.70", "5. volume": "3400"}
            }
        });

        let records = source().normalize(&body).unwrap();
        assert_eq!(records.len(), 1);
        let bar = &records[0];
        assert_eq!(bar.symbol, "IBM");
        assert_eq!(bar.open, 160.10);
        assert_eq!(bar.close, 160.70);
        assert_eq!(bar.volume, 3400.0);
        // 15:59 EST is 20:59 UTC in January
        assert_eq!(bar.timestamp.to_rfc3339(), "2024-01-10T20:59:00+00:00");
    }

    #[test]
    fn test_missing_time_zone_defaults_to_eastern() {
        let body = json!({
            "Time Series (5min)": {
                "2024-07-01 09:30:00": {"1. open": "1", "2. high": "2", "3. low": "0.5", "4. close": "1.5", "5. volume": "10"}
            }
        });
        let records = source().normalize(&body).unwrap();
        // EDT in July is UTC-4
        assert_eq!(records[0].timestamp.to_rfc3339(), "2024-07-01T13:30:00+00:00");
    }

    #[test]
    fn test_note_is_rate_limited() {
        let body = json!({"Note": "Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute."});
        assert!(matches!(
            source().normalize(&body),
            Err(PollError::RateLimited(_))
        ));

        let body = json!({"Information": "Please subscribe to a premium plan"});
        assert!(matches!(
            source().normalize(&body),
            Err(PollError::RateLimited(_))
        ));
    }

    #[test]
    fn test_error_message_is_fatal() {
        let body = json!({"Error Message": "Invalid API call."});
        assert!(matches!(source().normalize(&body), Err(PollError::Fatal(_))));
    }

    #[test]
    fn test_body_without_series_has_no_data() {
        assert!(source().normalize(&json!({"Meta Data": {}})).unwrap().is_empty());
    }

    #[test]
    fn test_validate_requires_symbol_and_key() {
        assert!(AlphaVantageIntradaySource::new("", "k").validate().is_err());
        assert!(AlphaVantageIntradaySource::new("IBM", "").validate().is_err());
        assert!(source().validate().is_ok());
    }
}
