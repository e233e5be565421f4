use candlefeed::{Collector, Config};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;

    let config = Config::from_env()?;
    log::info!(
        "starting collector: {} series, sink {} bucket {}",
        config.series.len(),
        config.influx_url,
        config.influx_bucket
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    Collector::new(config).run(shutdown_rx).await;
    log::info!("collector stopped");
    Ok(())
}
