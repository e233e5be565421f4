mod coinbase;

pub use self::coinbase::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::{Candle, FetchWindow, SeriesKey};

#[derive(Error, Debug)]
pub enum SourceError {
    /// Upstream rate limit hit. The cycle should end and retry on a later
    /// tick, never inside the current cycle.
    #[error("upstream rate limit hit")]
    RateLimited,
    /// Transient upstream failure, already retried inside the adapter.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// The series is misconfigured for this source. Fatal for the key.
    #[error("invalid series: {0}")]
    InvalidSeries(String),
}

/// One upstream market-data provider.
///
/// Implementations normalize the provider's responses into canonical candles:
/// ascending by bucket-start time, deduplicated by timestamp, pagination
/// flattened. A partial window (provider has less data than requested) is
/// returned as-is; the cycle detects the remaining gap itself.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, key: SeriesKey, window: FetchWindow)
        -> Result<Vec<Candle>, SourceError>;
}
