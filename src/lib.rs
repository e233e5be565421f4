#![deny(unused_must_use)]
#![deny(unsafe_code)]
#![allow(clippy::new_without_default)]

mod candle;
mod config;
mod cycle;
mod name;
mod registry;
mod retry;
mod scheduler;
pub mod sink;
pub mod sources;

pub use candle::*;
pub use config::*;
pub use cycle::*;
pub use name::*;
pub use registry::*;
pub use retry::*;
pub use scheduler::*;

use sink::{InfluxSink, Writer};
use sources::Coinbase;
use std::sync::Arc;
use tokio::sync::watch;

/// The assembled collector: Coinbase source, InfluxDB sink, one scheduled
/// collection task per configured series.
pub struct Collector {
    config: Config,
}

impl Collector {
    pub fn new(config: Config) -> Self {
        Collector { config }
    }

    /// Collect until the shutdown signal fires.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let registry = Arc::new(SeriesRegistry::new());
        let sink = InfluxSink::new(
            self.config.influx_url.clone(),
            self.config.influx_token.clone(),
            self.config.influx_org.clone(),
            self.config.influx_bucket.clone(),
        );
        let writer = Writer::new(
            sink,
            registry.clone(),
            self.config.batch_size,
            self.config.backoff,
        );
        let source = Coinbase::new(self.config.coinbase_url.clone(), self.config.backoff);
        let pipeline = Arc::new(Pipeline::new(
            source,
            writer,
            registry,
            self.config.backfill_start,
            self.config.gap_escalation_after,
        ));
        let scheduler = Scheduler::new(
            pipeline,
            self.config.poll_interval,
            self.config.shutdown_grace,
        );

        scheduler.run(self.config.series, shutdown).await;
    }
}
