use market_data_gateway::{GatewayConfig, GatewayService};
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("Market-Data Gateway Quote Stream");
    println!("================================");

    let service = GatewayService::start(GatewayConfig::from_env()?).await?;
    let mut crypto = service.subscribe("crypto");
    let mut quotes = service.subscribe("quotes");

    println!("Waiting for quotes (Ctrl-C to stop)...");

    for _ in 0..10 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(quote) = crypto.recv() => {
                println!(
                    "{:<10} O {:<12.4} H {:<12.4} L {:<12.4} C {:<12.4} ({})",
                    quote.symbol, quote.open, quote.high, quote.low, quote.close, quote.timestamp
                );
            }
            Some(quote) = quotes.recv() => {
                println!("{:<10} ${:<12.4} ({})", quote.symbol, quote.close, quote.timestamp);
            }
        }
    }

    if let Some(gateway) = service.gateway() {
        let end = chrono::Utc::now().date_naive();
        let start = end - chrono::Duration::days(30);
        match timeout(Duration::from_secs(15), gateway.get_series("005930", start, end)).await {
            Ok(Ok(series)) => println!("\n005930: {} daily bars", series.bars.len()),
            Ok(Err(e)) => println!("\n005930 history unavailable ({}): {e}", e.http_status()),
            Err(_) => println!("\n005930 history timed out"),
        }

        if gateway.has_dart() {
            match gateway.company_info_by_stock("005930").await {
                Ok(Some(corp)) => println!("005930: {} (corp code {})", corp.corp_name, corp.corp_code),
                Ok(None) => println!("005930: not in the disclosure corp-code table"),
                Err(e) => println!("005930 identity unavailable: {e}"),
            }
        }
    }

    for metrics in service.adapter_metrics().await {
        println!(
            "{:<30} cycles={:<4} failed={:<4} p50={:.0}ms success={:.1}%",
            metrics.adapter,
            metrics.total_cycles,
            metrics.failed_cycles,
            metrics.latency_p50_ms,
            metrics.success_rate * 100.0
        );
    }

    service.shutdown().await;
    Ok(())
}
