//! Background polling adapter
//!
//! One adapter drives one [`PollSource`]. Each cycle moves through
//! `Idle -> Fetching -> Normalizing -> Publishing -> Idle`, or drops into
//! `Backoff` when the upstream has nothing new, throttles us or fails. Only a
//! fatal error ends the loop.

use crate::{
    config::BackoffSettings,
    constants::{REQUEST_TIMEOUT_SECS, USER_AGENT},
    error::PollError,
    hub::BroadcastHub,
    metrics::MetricsCollector,
    provider::PollSource,
    types::QuoteRecord,
};
use rand::Rng;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Exponential backoff with a floor, a ceiling and additive jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    floor: Duration,
    ceiling: Duration,
    max_jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(floor: Duration, ceiling: Duration, max_jitter: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
            max_jitter,
        }
    }

    /// Delay for `level` before jitter: `min(floor * 2^level, ceiling)`
    pub fn base_delay(&self, level: u32) -> Duration {
        let factor = 1u32.checked_shl(level).unwrap_or(u32::MAX);
        self.floor.saturating_mul(factor).min(self.ceiling)
    }

    /// Next level, or the same level once the ceiling is reached
    pub fn escalate(&self, level: u32) -> u32 {
        if self.base_delay(level) < self.ceiling {
            level + 1
        } else {
            level
        }
    }

    /// Uniform random jitter in `[0, max_jitter]`
    pub fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffSettings::default().into()
    }
}

impl From<BackoffSettings> for BackoffPolicy {
    fn from(settings: BackoffSettings) -> Self {
        Self::new(settings.floor, settings.ceiling, settings.max_jitter)
    }
}

/// Where an adapter is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Fetching,
    Normalizing,
    Publishing,
    Backoff,
    Stopped,
}

/// Mutable state owned by one adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingState {
    /// 0 is the floor; each unproductive cycle doubles the delay
    pub backoff_level: u32,
    /// Validator sent as `If-None-Match` on the next request
    pub last_etag: Option<String>,
    pub phase: PollPhase,
}

impl Default for PollingState {
    fn default() -> Self {
        Self {
            backoff_level: 0,
            last_etag: None,
            phase: PollPhase::Idle,
        }
    }
}

/// Result of one non-fatal cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Records were normalized and published
    Published(usize),
    /// Upstream answered "unchanged" or had nothing to normalize
    NoNewData,
    RateLimited(String),
    TransientError(String),
}

impl CycleOutcome {
    fn is_success(&self) -> bool {
        matches!(self, Self::Published(_) | Self::NoNewData)
    }
}

/// Periodically polls one upstream source and publishes what it finds
///
/// # Example
/// ```no_run
/// use market_data_gateway::{BroadcastHub, CoinGeckoChartSource, PollingAdapter};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let hub = Arc::new(BroadcastHub::new());
/// let adapter = PollingAdapter::new(CoinGeckoChartSource::new("bitcoin"), hub.clone())?;
/// let shutdown = CancellationToken::new();
/// let handle = adapter.spawn(shutdown.clone());
///
/// let mut quotes = hub.subscribe("crypto");
/// if let Some(quote) = quotes.recv().await {
///     println!("{} close={}", quote.symbol, quote.close);
/// }
/// shutdown.cancel();
/// handle.await??;
/// # Ok(())
/// # }
/// ```
pub struct PollingAdapter<S: PollSource> {
    source: S,
    http: Client,
    hub: Arc<BroadcastHub<QuoteRecord>>,
    backoff: BackoffPolicy,
    state: PollingState,
    metrics: Arc<MetricsCollector>,
}

impl<S: PollSource> PollingAdapter<S> {
    pub fn new(source: S, hub: Arc<BroadcastHub<QuoteRecord>>) -> Result<Self, PollError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PollError::Fatal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(source, hub, http))
    }

    /// Creates an adapter sharing an existing HTTP client
    pub fn with_http_client(source: S, hub: Arc<BroadcastHub<QuoteRecord>>, http: Client) -> Self {
        let metrics = Arc::new(MetricsCollector::new(&format!(
            "{}:{}",
            source.source_name(),
            source.target()
        )));
        Self {
            source,
            http,
            hub,
            backoff: BackoffPolicy::default(),
            state: PollingState::default(),
            metrics,
        }
    }

    pub fn with_backoff(mut self, backoff: impl Into<BackoffPolicy>) -> Self {
        self.backoff = backoff.into();
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn state(&self) -> &PollingState {
        &self.state
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// Delay before the next cycle, without jitter
    pub fn current_delay(&self) -> Duration {
        self.backoff.base_delay(self.state.backoff_level)
    }

    /// Runs a single cycle
    ///
    /// Rate limits and transient failures are reported as outcomes and raise
    /// the backoff level; only a fatal error is returned as `Err`.
    pub async fn poll_once(&mut self) -> Result<CycleOutcome, PollError> {
        let started = Instant::now();
        self.state.phase = PollPhase::Fetching;

        let outcome = match self.cycle().await {
            Ok(outcome) => outcome,
            Err(PollError::RateLimited(reason)) => CycleOutcome::RateLimited(reason),
            Err(PollError::Transient(reason)) => CycleOutcome::TransientError(reason),
            Err(fatal) => {
                self.metrics.record_cycle(started.elapsed(), false).await;
                self.state.phase = PollPhase::Stopped;
                return Err(fatal);
            }
        };

        match &outcome {
            CycleOutcome::Published(_) => {
                self.state.backoff_level = 0;
                self.state.phase = PollPhase::Idle;
            }
            CycleOutcome::NoNewData => {
                self.escalate();
                tracing::debug!(
                    source = self.source.source_name(),
                    target = %self.source.target(),
                    "No new data"
                );
            }
            CycleOutcome::RateLimited(reason) => {
                self.escalate();
                tracing::info!(
                    source = self.source.source_name(),
                    target = %self.source.target(),
                    reason = %reason,
                    delay_ms = self.current_delay().as_millis() as u64,
                    "Rate limited, backing off"
                );
            }
            CycleOutcome::TransientError(reason) => {
                self.escalate();
                tracing::warn!(
                    source = self.source.source_name(),
                    target = %self.source.target(),
                    error = %reason,
                    delay_ms = self.current_delay().as_millis() as u64,
                    "Polling cycle failed, backing off"
                );
            }
        }

        self.metrics
            .record_cycle(started.elapsed(), outcome.is_success())
            .await;
        Ok(outcome)
    }

    fn escalate(&mut self) {
        self.state.backoff_level = self.backoff.escalate(self.state.backoff_level);
        self.state.phase = PollPhase::Backoff;
    }

    async fn cycle(&mut self) -> Result<CycleOutcome, PollError> {
        let Some((body, etag)) = self.fetch().await? else {
            return Ok(CycleOutcome::NoNewData);
        };

        self.state.phase = PollPhase::Normalizing;
        let records = self.source.normalize(&body)?;
        // Only a fully processed body may be skipped next time
        if etag.is_some() {
            self.state.last_etag = etag;
        }
        if records.is_empty() {
            return Ok(CycleOutcome::NoNewData);
        }

        self.state.phase = PollPhase::Publishing;
        let channel = self.source.channel().to_string();
        let count = records.len();
        for record in records {
            self.hub.publish(&channel, record).await;
        }

        tracing::debug!(
            source = self.source.source_name(),
            channel = %channel,
            count = count,
            "Published records"
        );
        Ok(CycleOutcome::Published(count))
    }

    /// Issues the (possibly conditional) request; `None` means "unchanged"
    async fn fetch(&self) -> Result<Option<(Value, Option<String>)>, PollError> {
        let mut request = self.source.build_request(&self.http);
        if let Some(etag) = &self.state.last_etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PollError::Transient(e.without_url().to_string()))?;

        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => return Ok(None),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => {
                return Err(PollError::RateLimited(format!("HTTP {}", status.as_u16())));
            }
            StatusCode::UNAUTHORIZED => {
                return Err(PollError::Fatal(
                    "HTTP 401: upstream rejected the configured credentials".to_string(),
                ));
            }
            s if !s.is_success() => {
                return Err(PollError::Transient(format!("HTTP {}", s.as_u16())));
            }
            _ => {}
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| PollError::Transient(format!("Undecodable body: {}", e.without_url())))?;

        Ok(Some((body, etag)))
    }

    /// Polls until `shutdown` fires or a fatal error occurs
    ///
    /// A cycle in progress always completes before the loop observes the
    /// shutdown signal; only the backoff sleep is interruptible.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PollError> {
        if let Err(e) = self.source.validate() {
            self.state.phase = PollPhase::Stopped;
            tracing::error!(
                source = self.source.source_name(),
                target = %self.source.target(),
                error = %e,
                "Invalid polling configuration"
            );
            return Err(match e {
                PollError::Fatal(_) => e,
                other => PollError::Fatal(other.to_string()),
            });
        }

        tracing::info!(
            source = self.source.source_name(),
            target = %self.source.target(),
            channel = self.source.channel(),
            "Starting polling adapter"
        );

        while !shutdown.is_cancelled() {
            if let Err(e) = self.poll_once().await {
                tracing::error!(
                    source = self.source.source_name(),
                    target = %self.source.target(),
                    error = %e,
                    "Polling adapter stopped on fatal error"
                );
                return Err(e);
            }

            let delay = self.current_delay() + self.backoff.jitter();
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = sleep(delay) => {}
            }
        }

        self.state.phase = PollPhase::Stopped;
        tracing::info!(
            source = self.source.source_name(),
            target = %self.source.target(),
            "Polling adapter stopped"
        );
        Ok(())
    }

    /// Runs the adapter on its own task
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<(), PollError>> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockSource;
    use serde_json::json;
    use tokio::time::timeout;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn policy(floor_ms: u64, ceiling_ms: u64) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(floor_ms),
            Duration::from_millis(ceiling_ms),
            Duration::ZERO,
        )
    }

    fn adapter(
        server: &MockServer,
        hub: Arc<BroadcastHub<QuoteRecord>>,
    ) -> PollingAdapter<MockSource> {
        PollingAdapter::new(MockSource::new(server.uri()), hub)
            .unwrap()
            .with_backoff(policy(1_000, 60_000))
    }

    fn quote_response() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"symbol": "MOCK", "price": 1.5}))
    }

    #[test]
    fn test_backoff_policy_caps_at_ceiling() {
        let policy = policy(1_000, 5_000);
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(3), Duration::from_secs(5));
        assert_eq!(policy.base_delay(40), Duration::from_secs(5));
        assert_eq!(policy.escalate(3), 3);
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_millis(250),
        );
        for _ in 0..100 {
            assert!(policy.jitter() <= Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_rate_limits_increase_delay_and_success_resets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let hub = Arc::new(BroadcastHub::new());
        let mut adapter = adapter(&server, hub.clone());

        let mut delays = Vec::new();
        for _ in 0..3 {
            let outcome = adapter.poll_once().await.unwrap();
            assert!(matches!(outcome, CycleOutcome::RateLimited(_)));
            delays.push(adapter.current_delay());
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        assert_eq!(adapter.state().phase, PollPhase::Backoff);

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(quote_response())
            .mount(&server)
            .await;

        let mut sub = hub.subscribe("mock");
        assert_eq!(adapter.poll_once().await.unwrap(), CycleOutcome::Published(1));
        assert_eq!(adapter.current_delay(), Duration::from_secs(1));
        assert_eq!(adapter.state().phase, PollPhase::Idle);
        assert_eq!(sub.recv().await.unwrap().close, 1.5);

        let metrics = adapter.metrics().snapshot().await;
        assert_eq!(metrics.total_cycles, 4);
        assert_eq!(metrics.failed_cycles, 3);
    }

    #[tokio::test]
    async fn test_forbidden_is_rate_limited_and_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let hub = Arc::new(BroadcastHub::new());
        let mut adapter = PollingAdapter::new(MockSource::new(server.uri()), hub)
            .unwrap()
            .with_backoff(policy(1_000, 5_000));

        for _ in 0..6 {
            assert!(matches!(
                adapter.poll_once().await.unwrap(),
                CycleOutcome::RateLimited(_)
            ));
        }
        assert_eq!(adapter.current_delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_etag_turns_unchanged_into_no_new_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(quote_response().insert_header("ETag", "\"v1\""))
            .expect(1)
            .mount(&server)
            .await;

        let hub = Arc::new(BroadcastHub::new());
        let mut sub = hub.subscribe("mock");
        let mut adapter = adapter(&server, hub.clone());

        assert_eq!(adapter.poll_once().await.unwrap(), CycleOutcome::Published(1));
        assert_eq!(adapter.state().last_etag.as_deref(), Some("\"v1\""));

        assert_eq!(adapter.poll_once().await.unwrap(), CycleOutcome::NoNewData);
        assert_eq!(adapter.state().backoff_level, 1);

        assert!(sub.recv().await.is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_empty_normalization_publishes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let hub = Arc::new(BroadcastHub::new());
        let mut sub = hub.subscribe("mock");
        let mut adapter = adapter(&server, hub.clone());

        assert_eq!(adapter.poll_once().await.unwrap(), CycleOutcome::NoNewData);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let hub = Arc::new(BroadcastHub::new());
        let mut adapter = adapter(&server, hub);

        assert!(matches!(
            adapter.poll_once().await.unwrap(),
            CycleOutcome::TransientError(_)
        ));
        assert_eq!(adapter.state().backoff_level, 1);
    }

    #[tokio::test]
    async fn test_unauthorized_stops_the_loop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let hub = Arc::new(BroadcastHub::new());
        let adapter = adapter(&server, hub);

        let result = timeout(Duration::from_secs(2), adapter.run(CancellationToken::new()))
            .await
            .unwrap();
        assert!(matches!(result, Err(PollError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_invalid_source_never_polls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(quote_response())
            .expect(0)
            .mount(&server)
            .await;

        let mut source = MockSource::new(server.uri());
        source.symbol.clear();
        let adapter = PollingAdapter::new(source, Arc::new(BroadcastHub::new())).unwrap();

        let result = adapter.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(PollError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_after_current_cycle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(quote_response())
            .mount(&server)
            .await;

        let hub = Arc::new(BroadcastHub::new());
        let mut sub = hub.subscribe("mock");
        let shutdown = CancellationToken::new();
        let handle = PollingAdapter::new(MockSource::new(server.uri()), hub.clone())
            .unwrap()
            .with_backoff(policy(20, 100))
            .spawn(shutdown.clone());

        let first = timeout(Duration::from_secs(2), sub.recv()).await.unwrap();
        assert_eq!(first.unwrap().symbol, "MOCK");

        shutdown.cancel();
        let result = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
