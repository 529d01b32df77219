//! Pull-model fetch functions
//!
//! Each call consults the [`FreshnessCache`] first and only goes to the
//! token-guarded upstream on a miss. What happens when the upstream fails and
//! only a stale entry is available is decided per [`DataKind`].
//!
//! Brokerage data (prices, ratios, opinions, profiles) comes from the
//! token-guarded client. Disclosure data (financial statements, the
//! corp-code table) comes from an optional [`DartClient`].

use crate::{
    cache::{CacheKey, FreshnessCache},
    client::UpstreamApi,
    error::GatewayError,
    providers::{
        dart::{self, DartClient},
        kis,
    },
    types::{
        CompanyProfile, CorpCode, FinancialRatio, FinancialStatement, InvestmentOpinion,
        PriceSeries, ReturnsPanel,
    },
};
use chrono::{Duration, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;

/// What to do with a stale entry when the refresh fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicy {
    /// Return the stale payload and log the failure
    ServeStale,
    /// Surface the upstream failure
    FailHard,
}

/// Kinds of upstream data the gateway serves, each with its cache policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    PriceHistory,
    InvestmentOpinion,
    FinancialRatios,
    CompanyProfile,
    FinancialStatements,
    CorpCodes,
}

impl DataKind {
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::PriceHistory => "prices",
            Self::InvestmentOpinion => "opinions",
            Self::FinancialRatios => "ratios",
            Self::CompanyProfile => "companies",
            Self::FinancialStatements => "financials",
            Self::CorpCodes => "corp_codes",
        }
    }

    pub fn freshness_window(&self) -> Duration {
        match self {
            Self::PriceHistory | Self::InvestmentOpinion | Self::CorpCodes => Duration::days(1),
            Self::FinancialRatios | Self::CompanyProfile | Self::FinancialStatements => {
                Duration::days(7)
            }
        }
    }

    /// Point-in-time data fails hard; slow-moving reference data may be stale
    pub fn stale_policy(&self) -> StalePolicy {
        match self {
            Self::PriceHistory | Self::InvestmentOpinion => StalePolicy::FailHard,
            Self::FinancialRatios
            | Self::CompanyProfile
            | Self::FinancialStatements
            | Self::CorpCodes => StalePolicy::ServeStale,
        }
    }
}

/// Cache behaviour requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Serve a fresh cache hit; apply the kind's stale policy on failure
    #[default]
    PreferCache,
    /// Always ask the upstream and never fall back to stale data
    RequireFresh,
}

/// Cached access to the brokerage and disclosure data endpoints
#[derive(Clone)]
pub struct Gateway {
    upstream: Arc<dyn UpstreamApi>,
    dart: Option<Arc<DartClient>>,
    cache: FreshnessCache,
}

impl Gateway {
    pub fn new(upstream: Arc<dyn UpstreamApi>, cache: FreshnessCache) -> Self {
        Self {
            upstream,
            dart: None,
            cache,
        }
    }

    /// Enables the disclosure fetch functions
    pub fn with_dart(mut self, dart: Arc<DartClient>) -> Self {
        self.dart = Some(dart);
        self
    }

    pub fn has_dart(&self) -> bool {
        self.dart.is_some()
    }

    fn dart(&self) -> Result<&DartClient, GatewayError> {
        self.dart
            .as_deref()
            .ok_or_else(|| GatewayError::config("DART API key is not configured"))
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    fn key(kind: DataKind, symbol: &str, fingerprint: String) -> Result<CacheKey, GatewayError> {
        CacheKey::new(kind.namespace(), symbol, fingerprint)
            .map_err(|e| GatewayError::invalid_request(e.to_string()))
    }

    /// Read-through lookup shared by every fetch function
    ///
    /// Payloads rejected by `cacheable` are returned but not stored.
    async fn fetch_cached<T, Fut>(
        &self,
        kind: DataKind,
        key: CacheKey,
        mode: FetchMode,
        fetch: Fut,
        cacheable: fn(&T) -> bool,
    ) -> Result<T, GatewayError>
    where
        T: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let window = kind.freshness_window();
        let stale = match self.cache.lookup::<T>(&key).await {
            Some(entry)
                if mode == FetchMode::PreferCache && FreshnessCache::is_fresh(&entry, window) =>
            {
                tracing::debug!(key = %key, "Cache hit");
                return Ok(entry.payload);
            }
            other => other,
        };

        match fetch.await {
            Ok(value) => {
                if cacheable(&value) {
                    if let Err(e) = self.cache.store(&key, &value, window).await {
                        tracing::warn!(key = %key, error = %e, "Failed to store cache entry");
                    }
                }
                Ok(value)
            }
            Err(err) => match (stale, kind.stale_policy(), mode) {
                (Some(entry), StalePolicy::ServeStale, FetchMode::PreferCache) => {
                    tracing::warn!(
                        key = %key,
                        written_at = %entry.written_at,
                        error = %err,
                        "Upstream failed, serving stale entry"
                    );
                    Ok(entry.payload)
                }
                _ => Err(err),
            },
        }
    }

    /// Daily price history for `symbol` between `start` and `end` inclusive
    pub async fn get_series(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceSeries, GatewayError> {
        self.get_series_with(symbol, start, end, FetchMode::PreferCache)
            .await
    }

    pub async fn get_series_with(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        mode: FetchMode,
    ) -> Result<PriceSeries, GatewayError> {
        if start > end {
            return Err(GatewayError::invalid_request(format!(
                "start {start} is after end {end}"
            )));
        }
        let key = Self::key(
            DataKind::PriceHistory,
            symbol,
            format!("kis-{}-{}", start.format("%Y%m%d"), end.format("%Y%m%d")),
        )?;

        let fetch = async {
            let body = self
                .upstream
                .authenticated_request(
                    kis::DAILY_PRICE.path,
                    kis::DAILY_PRICE.tr_id,
                    &kis::daily_price_query(symbol, start, end),
                )
                .await?;
            Ok::<_, GatewayError>(PriceSeries {
                symbol: symbol.to_string(),
                source: "kis".to_string(),
                bars: kis::parse_price_bars(&body)?,
            })
        };

        // Empty series are returned but never cached
        self.fetch_cached(DataKind::PriceHistory, key, mode, fetch, |series: &PriceSeries| {
            !series.is_empty()
        })
        .await
    }

    pub async fn get_financial_ratios(
        &self,
        symbol: &str,
    ) -> Result<Vec<FinancialRatio>, GatewayError> {
        self.get_financial_ratios_with(symbol, FetchMode::PreferCache)
            .await
    }

    pub async fn get_financial_ratios_with(
        &self,
        symbol: &str,
        mode: FetchMode,
    ) -> Result<Vec<FinancialRatio>, GatewayError> {
        let key = Self::key(DataKind::FinancialRatios, symbol, "kis-annual".to_string())?;
        let fetch = async {
            let body = self
                .upstream
                .authenticated_request(
                    kis::FINANCIAL_RATIO.path,
                    kis::FINANCIAL_RATIO.tr_id,
                    &kis::financial_ratio_query(symbol),
                )
                .await?;
            kis::parse_financial_ratios(&body)
        };
        self.fetch_cached(DataKind::FinancialRatios, key, mode, fetch, |ratios: &Vec<FinancialRatio>| {
            !ratios.is_empty()
        })
        .await
    }

    /// Analyst consensus from the start of the current year
    pub async fn get_investment_opinion(
        &self,
        symbol: &str,
    ) -> Result<InvestmentOpinion, GatewayError> {
        self.get_investment_opinion_with(symbol, FetchMode::PreferCache)
            .await
    }

    pub async fn get_investment_opinion_with(
        &self,
        symbol: &str,
        mode: FetchMode,
    ) -> Result<InvestmentOpinion, GatewayError> {
        let today = Utc::now().with_timezone(&chrono_tz::Asia::Seoul).date_naive();
        let key = Self::key(
            DataKind::InvestmentOpinion,
            symbol,
            format!("kis-ytd-{}", today.format("%Y%m%d")),
        )?;
        let fetch = async {
            let body = self
                .upstream
                .authenticated_request(
                    kis::INVEST_OPINION.path,
                    kis::INVEST_OPINION.tr_id,
                    &kis::invest_opinion_query(symbol, today),
                )
                .await?;
            kis::parse_investment_opinion(&body)
        };
        self.fetch_cached(DataKind::InvestmentOpinion, key, mode, fetch, |_: &InvestmentOpinion| true)
            .await
    }

    /// Company identity; stale entries are served when the upstream is down
    pub async fn get_company_profile(&self, symbol: &str) -> Result<CompanyProfile, GatewayError> {
        self.get_company_profile_with(symbol, FetchMode::PreferCache)
            .await
    }

    pub async fn get_company_profile_with(
        &self,
        symbol: &str,
        mode: FetchMode,
    ) -> Result<CompanyProfile, GatewayError> {
        let key = Self::key(DataKind::CompanyProfile, symbol, "kis-profile".to_string())?;
        let fetch = async {
            let body = self
                .upstream
                .authenticated_request(
                    kis::STOCK_INFO.path,
                    kis::STOCK_INFO.tr_id,
                    &kis::stock_info_query(symbol),
                )
                .await?;
            kis::parse_company_profile(symbol, &body)
        };
        self.fetch_cached(DataKind::CompanyProfile, key, mode, fetch, |_: &CompanyProfile| true)
            .await
    }

    /// First available financial statement of `corp_code` for `year`
    ///
    /// Reports are tried from annual down to first-quarter, consolidated
    /// before separate. Each combination is cached on its own; `None` means
    /// no report exists yet.
    pub async fn get_financial_statement(
        &self,
        corp_code: &str,
        year: i32,
    ) -> Result<Option<FinancialStatement>, GatewayError> {
        self.get_financial_statement_with(corp_code, year, FetchMode::PreferCache)
            .await
    }

    pub async fn get_financial_statement_with(
        &self,
        corp_code: &str,
        year: i32,
        mode: FetchMode,
    ) -> Result<Option<FinancialStatement>, GatewayError> {
        let client = self.dart()?;

        for &(report_code, report_name) in dart::REPORTS {
            for &(fs_div, fs_name) in dart::FS_DIVISIONS {
                let key = Self::key(
                    DataKind::FinancialStatements,
                    corp_code,
                    format!("dart-{year}-{report_code}-{fs_div}"),
                )?;
                let fetch = async {
                    let rows = client.single_fs(corp_code, year, report_code, fs_div).await?;
                    Ok::<_, GatewayError>((!rows.is_empty()).then(|| FinancialStatement {
                        corp_code: corp_code.to_string(),
                        year,
                        report_code: report_code.to_string(),
                        fs_div: fs_div.to_string(),
                        report_name: format!("{report_name} - {fs_name}"),
                        rows,
                    }))
                };

                let found = self
                    .fetch_cached(
                        DataKind::FinancialStatements,
                        key,
                        mode,
                        fetch,
                        |statement: &Option<FinancialStatement>| statement.is_some(),
                    )
                    .await?;
                if found.is_some() {
                    return Ok(found);
                }
                tracing::debug!(
                    corp_code = corp_code,
                    year = year,
                    report_code = report_code,
                    fs_div = fs_div,
                    "No statement, trying next report"
                );
            }
        }
        Ok(None)
    }

    /// Every listed company with its disclosure-system code
    ///
    /// A malformed download falls back to the cached table, however old.
    pub async fn get_corp_codes(&self) -> Result<Vec<CorpCode>, GatewayError> {
        self.get_corp_codes_with(FetchMode::PreferCache).await
    }

    pub async fn get_corp_codes_with(&self, mode: FetchMode) -> Result<Vec<CorpCode>, GatewayError> {
        let client = self.dart()?;
        let key = Self::key(DataKind::CorpCodes, "dart", "corp-code-list".to_string())?;
        self.fetch_cached(DataKind::CorpCodes, key, mode, client.corp_codes(), |codes: &Vec<CorpCode>| {
            !codes.is_empty()
        })
        .await
    }

    /// Disclosure identity of the company listed under `stock_code`
    pub async fn company_info_by_stock(
        &self,
        stock_code: &str,
    ) -> Result<Option<CorpCode>, GatewayError> {
        let codes = self.get_corp_codes().await?;
        Ok(codes.into_iter().find(|c| c.stock_code == stock_code))
    }

    /// Aligned daily returns for several symbols
    ///
    /// Series are fetched concurrently. A symbol that fails is listed in
    /// `failures` and the rest of the panel is still returned.
    pub async fn get_returns_panel(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ReturnsPanel, GatewayError> {
        if start > end {
            return Err(GatewayError::invalid_request(format!(
                "start {start} is after end {end}"
            )));
        }

        let results = futures::future::join_all(
            symbols
                .iter()
                .map(|symbol| async move { (symbol, self.get_series(symbol, start, end).await) }),
        )
        .await;

        let mut series = Vec::with_capacity(results.len());
        let mut failures = std::collections::BTreeMap::new();
        for (symbol, result) in results {
            match result {
                Ok(s) => series.push(s),
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "Price history unavailable");
                    failures.insert(symbol.clone(), e.to_string());
                }
            }
        }

        let mut panel = ReturnsPanel::from_series(&series);
        panel.failures = failures;
        Ok(panel)
    }
}
