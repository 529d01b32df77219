//! Types for the market-data gateway

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Canonical quote produced by a polling source
///
/// Value type: every subscriber receives its own clone, so nothing downstream
/// can observe another consumer's copy changing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    /// Upstream symbol or coin id
    pub symbol: String,

    /// Observation time of the snapshot
    pub timestamp: DateTime<Utc>,

    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,

    /// Data source
    pub source: String,
}

impl QuoteRecord {
    /// Creates a record where open, high, low and close are all `price`
    pub fn spot(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        price: f64,
        volume: f64,
        source: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            source: source.into(),
        }
    }
}

/// One daily bar of a price history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Traded value, when the upstream reports it
    pub transaction_amount: Option<f64>,
    /// Change against the previous close
    pub change: Option<f64>,
}

/// Daily price history for one symbol, sorted by date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub symbol: String,
    pub source: String,
    pub bars: Vec<PriceBar>,
}

impl PriceSeries {
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Closing prices keyed by date
    pub fn closes(&self) -> BTreeMap<NaiveDate, f64> {
        self.bars.iter().map(|bar| (bar.date, bar.close)).collect()
    }
}

/// Financial ratios for one reporting period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialRatio {
    /// Settlement year-month, e.g. `202312`
    pub period: String,
    pub gross_margin: Option<f64>,
    pub operating_margin: Option<f64>,
    pub net_margin: Option<f64>,
    pub roe: Option<f64>,
    pub eps: Option<f64>,
    pub bps: Option<f64>,
    pub pbr: Option<f64>,
    pub dividend_yield: Option<f64>,
}

/// Analyst consensus for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestmentOpinion {
    pub opinion: Option<String>,
    pub target_price: f64,
    pub analyst_count: u32,
}

/// Company identity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub stock_code: String,
    pub name: String,
    pub short_name: Option<String>,
    pub english_name: Option<String>,
}

/// One account line of a disclosed financial statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRow {
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    /// Amount for the reported period
    pub current_amount: Option<f64>,
    /// Amount for the comparative prior period
    pub prior_amount: Option<f64>,
}

/// A company's financial statement for one business year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatement {
    pub corp_code: String,
    pub year: i32,
    /// Report type code, e.g. `11011` for the annual report
    pub report_code: String,
    /// `CFS` (consolidated) or `OFS` (separate)
    pub fs_div: String,
    pub report_name: String,
    pub rows: Vec<StatementRow>,
}

/// Disclosure-system identity of a listed company
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpCode {
    pub corp_code: String,
    pub corp_name: String,
    /// Six-digit exchange code
    pub stock_code: String,
}

/// Simple returns for several symbols aligned on date
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReturnsPanel {
    pub dates: Vec<NaiveDate>,

    /// Per-symbol returns, one slot per entry of `dates`
    pub returns: BTreeMap<String, Vec<Option<f64>>>,

    /// Symbols whose fetch failed, with the error text
    pub failures: BTreeMap<String, String>,
}

impl ReturnsPanel {
    /// Builds a panel from price histories
    ///
    /// Closes are outer-joined on date. Each return is computed against the
    /// symbol's previous available close; rows where no symbol has a return
    /// are dropped.
    pub fn from_series<'a>(series: impl IntoIterator<Item = &'a PriceSeries>) -> Self {
        let closes: BTreeMap<String, BTreeMap<NaiveDate, f64>> = series
            .into_iter()
            .map(|s| (s.symbol.clone(), s.closes()))
            .collect();

        let all_dates: Vec<NaiveDate> = closes
            .values()
            .flat_map(|by_date| by_date.keys().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut returns: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
        for (symbol, by_date) in &closes {
            let mut previous: Option<f64> = None;
            let column = all_dates
                .iter()
                .map(|date| match by_date.get(date) {
                    Some(&close) => {
                        let ret = previous
                            .filter(|prev| *prev != 0.0)
                            .map(|prev| close / prev - 1.0);
                        previous = Some(close);
                        ret
                    }
                    None => None,
                })
                .collect();
            returns.insert(symbol.clone(), column);
        }

        let keep: Vec<usize> = (0..all_dates.len())
            .filter(|&i| returns.values().any(|column| column[i].is_some()))
            .collect();

        Self {
            dates: keep.iter().map(|&i| all_dates[i]).collect(),
            returns: returns
                .into_iter()
                .map(|(symbol, column)| (symbol, keep.iter().map(|&i| column[i]).collect()))
                .collect(),
            failures: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(date: &str, close: f64) -> PriceBar {
        PriceBar {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
            transaction_amount: None,
            change: None,
        }
    }

    fn series(symbol: &str, bars: Vec<PriceBar>) -> PriceSeries {
        PriceSeries {
            symbol: symbol.to_string(),
            source: "test".to_string(),
            bars,
        }
    }

    #[test]
    fn test_returns_panel_outer_join() {
        let a = series(
            "A",
            vec![bar("2024-01-02", 100.0), bar("2024-01-03", 110.0), bar("2024-01-04", 99.0)],
        );
        let b = series("B", vec![bar("2024-01-02", 50.0), bar("2024-01-04", 55.0)]);

        let panel = ReturnsPanel::from_series([&a, &b]);

        // First date has no previous close for anyone and is dropped
        assert_eq!(panel.dates.len(), 2);
        let ra = &panel.returns["A"];
        assert!((ra[0].unwrap() - 0.10).abs() < 1e-9);
        assert!((ra[1].unwrap() + 0.10).abs() < 1e-9);

        let rb = &panel.returns["B"];
        assert_eq!(rb[0], None);
        assert!((rb[1].unwrap() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_returns_panel_empty() {
        let panel = ReturnsPanel::from_series(std::iter::empty::<&PriceSeries>());
        assert!(panel.dates.is_empty());
        assert!(panel.returns.is_empty());
    }
}
