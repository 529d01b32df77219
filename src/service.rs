//! Gateway service assembly
//!
//! Wires the configured components together once at startup: the broadcast
//! hub (optionally relayed), the token-guarded client with its cached fetch
//! functions, and one polling adapter per configured upstream target.

use crate::{
    cache::FreshnessCache,
    client::{TokenGuardedClient, UpstreamApi},
    config::{GatewayConfig, RelayMode},
    constants::{REQUEST_TIMEOUT_SECS, USER_AGENT},
    error::{GatewayError, PollError},
    gateway::Gateway,
    hub::{BroadcastHub, Subscription},
    metrics::{AdapterMetrics, MetricsCollector},
    poller::PollingAdapter,
    provider::PollSource,
    providers::{
        AlphaVantageIntradaySource, CoinGeckoChartSource, CoinGeckoSpotSource, DartClient,
    },
    stream,
    types::QuoteRecord,
};
use futures::stream::BoxStream;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct RunningAdapter {
    metrics: Arc<MetricsCollector>,
    handle: JoinHandle<Result<(), PollError>>,
}

/// A running gateway
///
/// # Example
/// ```no_run
/// use market_data_gateway::{GatewayConfig, GatewayService};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let service = GatewayService::start(GatewayConfig::from_env()?).await?;
/// let mut quotes = service.subscribe("crypto");
/// while let Some(quote) = quotes.recv().await {
///     println!("{} {:.2}", quote.symbol, quote.close);
/// }
/// service.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct GatewayService {
    config: GatewayConfig,
    hub: Arc<BroadcastHub<QuoteRecord>>,
    client: Option<Arc<TokenGuardedClient>>,
    gateway: Option<Gateway>,
    shutdown: CancellationToken,
    adapters: Vec<RunningAdapter>,
}

impl GatewayService {
    /// Builds every component from `config` and starts the polling adapters
    pub async fn start(config: GatewayConfig) -> Result<Self, GatewayError> {
        let hub = Arc::new(Self::build_hub(&config).await?);

        let (client, gateway) = match &config.upstream {
            Some(upstream) => {
                let client = Arc::new(TokenGuardedClient::new(upstream)?);
                let api: Arc<dyn UpstreamApi> = client.clone();
                let mut gateway = Gateway::new(api, FreshnessCache::new(&config.cache_dir));
                if let Some(key) = &config.dart_api_key {
                    gateway = gateway.with_dart(Arc::new(DartClient::new(key.as_str())?));
                }
                (Some(client), Some(gateway))
            }
            None => {
                tracing::info!("No brokerage credentials configured, fetch functions disabled");
                if config.dart_api_key.is_some() {
                    tracing::warn!("DART_API_KEY is set but unused without brokerage credentials");
                }
                (None, None)
            }
        };

        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build HTTP client: {e}")))?;

        let mut service = Self {
            config,
            hub,
            client,
            gateway,
            shutdown: CancellationToken::new(),
            adapters: Vec::new(),
        };

        let crypto_ids = service.config.crypto_ids.clone();
        for coin_id in &crypto_ids {
            service.launch(CoinGeckoChartSource::new(coin_id.as_str()), &http);
        }
        if !crypto_ids.is_empty() {
            service.launch(CoinGeckoSpotSource::new(crypto_ids.iter().cloned()), &http);
        }
        let equity_symbols = service.config.equity_symbols.clone();
        for symbol in &equity_symbols {
            let source = AlphaVantageIntradaySource::new(
                symbol.as_str(),
                service.config.alphavantage_api_key.as_str(),
            );
            service.launch(source, &http);
        }

        tracing::info!(
            adapters = service.adapters.len(),
            relay = service.hub.has_relay(),
            transport = ?service.config.transport,
            "Gateway service started"
        );
        Ok(service)
    }

    async fn build_hub(config: &GatewayConfig) -> Result<BroadcastHub<QuoteRecord>, GatewayError> {
        if config.relay == RelayMode::Disabled {
            return Ok(BroadcastHub::new());
        }

        #[cfg(feature = "redis-relay")]
        {
            let url = config
                .relay_url
                .as_deref()
                .ok_or_else(|| GatewayError::config("relay enabled but no relay URL configured"))?;
            let relay = crate::relay::RedisRelay::new(url, crate::constants::RELAY_PREFIX)
                .map_err(|e| GatewayError::config(e.to_string()))?;
            Ok(BroadcastHub::with_relay(Arc::new(relay)).await)
        }

        #[cfg(not(feature = "redis-relay"))]
        {
            Err(GatewayError::config(
                "relay enabled but this build lacks the redis-relay feature",
            ))
        }
    }

    fn launch<S: PollSource>(&mut self, source: S, http: &Client) {
        let adapter = PollingAdapter::with_http_client(source, Arc::clone(&self.hub), http.clone())
            .with_backoff(self.config.backoff);
        let metrics = adapter.metrics();
        let handle = adapter.spawn(self.shutdown.clone());
        self.adapters.push(RunningAdapter { metrics, handle });
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn hub(&self) -> Arc<BroadcastHub<QuoteRecord>> {
        Arc::clone(&self.hub)
    }

    /// Cached fetch functions; `None` without brokerage credentials
    pub fn gateway(&self) -> Option<&Gateway> {
        self.gateway.as_ref()
    }

    pub fn subscribe(&self, channel: &str) -> Subscription<QuoteRecord> {
        self.hub.subscribe(channel)
    }

    /// Frames for `channel` in the configured transport
    pub fn stream(&self, channel: &str) -> Option<BoxStream<'static, String>> {
        stream::frames(self.config.transport, self.hub.subscribe(channel))
    }

    /// Current metrics of every polling adapter
    pub async fn adapter_metrics(&self) -> Vec<AdapterMetrics> {
        let mut all = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            all.push(adapter.metrics.snapshot().await);
        }
        all
    }

    /// Stops all adapters after their current cycle and closes the client
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        for adapter in self.adapters {
            let name = adapter.metrics.adapter().to_string();
            match adapter.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(adapter = %name, error = %e, "Adapter had stopped on error"),
                Err(e) => tracing::error!(adapter = %name, error = %e, "Adapter task panicked"),
            }
        }

        if let Some(client) = &self.client {
            client.close().await;
        }
        tracing::info!("Gateway service stopped");
    }
}
