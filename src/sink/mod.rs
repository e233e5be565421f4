mod influx;
mod writer;

pub use self::influx::*;
pub use self::writer::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::{Candle, SeriesKey};

#[derive(Error, Debug)]
pub enum SinkError {
    /// Transient sink failure. Retryable with backoff.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// The sink refused the batch as malformed. Not retryable; the batch is
    /// surfaced for operator inspection.
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

/// External time-series store. One call persists one batch atomically:
/// a `2xx` ack covers the whole batch, a failure covers the whole batch.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write_batch(&self, key: SeriesKey, candles: &[Candle]) -> Result<(), SinkError>;
}
