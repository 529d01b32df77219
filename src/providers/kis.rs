//! Korea Investment & Securities (KIS) brokerage endpoints
//!
//! Operation identifiers, query builders and response normalizers for the
//! token-guarded data endpoints used by the gateway fetch functions. Numeric
//! fields arrive as strings; anything that does not parse becomes `None`.

use crate::{
    error::GatewayError,
    types::{CompanyProfile, FinancialRatio, InvestmentOpinion, PriceBar},
};
use chrono::{Datelike, NaiveDate};
use serde_json::Value;

/// A data endpoint and its operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub path: &'static str,
    pub tr_id: &'static str,
}

/// Daily OHLCV history
pub const DAILY_PRICE: Endpoint = Endpoint {
    path: "/uapi/domestic-stock/v1/quotations/inquire-daily-price",
    tr_id: "FHKST01010400",
};

/// Per-period financial ratios
pub const FINANCIAL_RATIO: Endpoint = Endpoint {
    path: "/uapi/domestic-stock/v1/finance/financial-ratio",
    tr_id: "FHKST66430300",
};

/// Analyst consensus
pub const INVEST_OPINION: Endpoint = Endpoint {
    path: "/uapi/domestic-stock/v1/quotations/invest-opinion",
    tr_id: "FHKST663300C0",
};

/// Company identity
pub const STOCK_INFO: Endpoint = Endpoint {
    path: "/uapi/domestic-stock/v1/quotations/search-stock-info",
    tr_id: "CTPF1002R",
};

const DATE_FORMAT: &str = "%Y%m%d";

pub fn daily_price_query(
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<(&'static str, String)> {
    vec![
        ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
        ("FID_INPUT_ISCD", symbol.to_string()),
        ("FID_INPUT_DATE_1", start.format(DATE_FORMAT).to_string()),
        ("FID_INPUT_DATE_2", end.format(DATE_FORMAT).to_string()),
        ("FID_PERIOD_DIV_CODE", "D".to_string()),
        ("FID_ORG_ADJ_PRC", "1".to_string()),
    ]
}

pub fn financial_ratio_query(symbol: &str) -> Vec<(&'static str, String)> {
    vec![
        ("fid_div_cls_code", "0".to_string()),
        ("fid_cond_mrkt_div_code", "J".to_string()),
        ("fid_input_iscd", symbol.to_string()),
    ]
}

/// Consensus from January 1st of `today`'s year up to `today`
pub fn invest_opinion_query(symbol: &str, today: NaiveDate) -> Vec<(&'static str, String)> {
    let year_start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
    vec![
        ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
        ("FID_COND_SCR_DIV_CODE", "16633".to_string()),
        ("FID_INPUT_ISCD", symbol.to_string()),
        ("FID_INPUT_DATE_1", year_start.format(DATE_FORMAT).to_string()),
        ("FID_INPUT_DATE_2", today.format(DATE_FORMAT).to_string()),
    ]
}

pub fn stock_info_query(symbol: &str) -> Vec<(&'static str, String)> {
    vec![
        ("PRDT_TYPE_CD", "300".to_string()),
        ("PDNO", symbol.to_string()),
    ]
}

/// Parses a KIS numeric string such as `"71,500"` or `"-1.25"`
fn number(row: &Value, field: &str) -> Option<f64> {
    match row.get(field)? {
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        other => other.as_f64(),
    }
}

fn text(row: &Value, field: &str) -> Option<String> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Rows of `output`, accepting either an array or a single object
fn output_rows(body: &Value) -> Result<Vec<&Value>, GatewayError> {
    match body.get("output") {
        Some(Value::Array(rows)) => Ok(rows.iter().collect()),
        Some(row @ Value::Object(_)) => Ok(vec![row]),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(GatewayError::invalid_response(format!(
            "unexpected output shape: {}",
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Daily bars sorted by date; rows without a date or close are dropped
pub fn parse_price_bars(body: &Value) -> Result<Vec<PriceBar>, GatewayError> {
    let mut bars: Vec<PriceBar> = output_rows(body)?
        .into_iter()
        .filter_map(|row| {
            let date = text(row, "stck_bsop_date")
                .and_then(|d| NaiveDate::parse_from_str(&d, DATE_FORMAT).ok())?;
            let close = number(row, "stck_clpr")?;
            Some(PriceBar {
                date,
                open: number(row, "stck_oprc").unwrap_or(close),
                high: number(row, "stck_hgpr").unwrap_or(close),
                low: number(row, "stck_lwpr").unwrap_or(close),
                close,
                volume: number(row, "acml_vol").unwrap_or(0.0),
                transaction_amount: number(row, "acml_tr_pbmn"),
                change: number(row, "prdy_vrss"),
            })
        })
        .collect();
    bars.sort_by_key(|bar| bar.date);
    bars.dedup_by_key(|bar| bar.date);
    Ok(bars)
}

pub fn parse_financial_ratios(body: &Value) -> Result<Vec<FinancialRatio>, GatewayError> {
    Ok(output_rows(body)?
        .into_iter()
        .filter_map(|row| {
            Some(FinancialRatio {
                period: text(row, "stac_yymm")?,
                gross_margin: number(row, "grs_rt"),
                operating_margin: number(row, "bsop_prfi_inrt"),
                net_margin: number(row, "thtr_ntin_inrt"),
                roe: number(row, "roe_val"),
                eps: number(row, "eps"),
                bps: number(row, "bps"),
                pbr: number(row, "pbr"),
                dividend_yield: number(row, "dvd_yd_rt"),
            })
        })
        .collect())
}

/// Consensus from the first output row; an empty answer means no coverage
pub fn parse_investment_opinion(body: &Value) -> Result<InvestmentOpinion, GatewayError> {
    let rows = output_rows(body)?;
    let Some(row) = rows.first() else {
        return Ok(InvestmentOpinion {
            opinion: None,
            target_price: 0.0,
            analyst_count: 0,
        });
    };
    Ok(InvestmentOpinion {
        opinion: text(row, "invt_opnn"),
        target_price: number(row, "hts_goal_prc").unwrap_or(0.0),
        analyst_count: number(row, "nm_of_analyst")
            .filter(|n| *n >= 0.0)
            .map(|n| n as u32)
            .unwrap_or(0),
    })
}

pub fn parse_company_profile(symbol: &str, body: &Value) -> Result<CompanyProfile, GatewayError> {
    let rows = output_rows(body)?;
    let row = rows.first().ok_or_else(|| {
        GatewayError::invalid_response(format!("no stock info returned for {symbol}"))
    })?;
    let name = text(row, "prdt_name")
        .ok_or_else(|| GatewayError::invalid_response(format!("stock info for {symbol} has no name")))?;
    Ok(CompanyProfile {
        stock_code: symbol.to_string(),
        name,
        short_name: text(row, "prdt_abrv_name"),
        english_name: text(row, "prdt_eng_name"),
    })
}
