use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use super::{Sink, SinkError};
use crate::{Backoff, Candle, RegressionRejected, SeriesKey, SeriesRegistry};

#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Regression(#[from] RegressionRejected),
}

/// Batching persistence layer over a [`Sink`].
///
/// Splits a candle run into batches of at most `batch_size`, retries
/// transient sink failures with bounded backoff, and advances the series
/// cursor to a batch's maximum timestamp only once that batch is acked.
/// A failed batch leaves the cursor at the last acked batch, so later
/// candles are refetched rather than skipped.
pub struct Writer<S: Sink> {
    sink: S,
    registry: Arc<SeriesRegistry>,
    batch_size: usize,
    backoff: Backoff,
}

impl<S: Sink> Writer<S> {
    pub fn new(sink: S, registry: Arc<SeriesRegistry>, batch_size: usize, backoff: Backoff) -> Self {
        Writer {
            sink,
            registry,
            batch_size,
            backoff,
        }
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }

    /// Persist `candles` (strictly ascending within the series) and return
    /// the last persisted timestamp, if any.
    pub async fn write(
        &self,
        key: SeriesKey,
        candles: &[Candle],
    ) -> Result<Option<DateTime<Utc>>, WriteError> {
        let mut last_persisted = None;
        for batch in candles.chunks(self.batch_size) {
            self.write_batch_with_retry(key, batch).await?;
            if let Some(max) = batch.last().map(|candle| candle.time) {
                self.registry.advance(key, max)?;
                last_persisted = Some(max);
            }
        }
        if let Some(time) = last_persisted {
            log::debug!("persisted {} candles for {}, cursor now {}", candles.len(), key, time);
        }
        Ok(last_persisted)
    }

    async fn write_batch_with_retry(
        &self,
        key: SeriesKey,
        batch: &[Candle],
    ) -> Result<(), SinkError> {
        let mut attempt = 0;
        loop {
            match self.sink.write_batch(key, batch).await {
                Ok(()) => return Ok(()),
                Err(SinkError::Unavailable(reason)) => {
                    attempt += 1;
                    if attempt >= self.backoff.max_attempts {
                        return Err(SinkError::Unavailable(reason));
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    log::warn!(
                        "sink write for {} failed ({}), retrying in {:?}",
                        key,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                // Malformed batch: retrying cannot help, surface it.
                Err(err @ SinkError::Rejected(_)) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Exchange, Pair};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    fn key() -> SeriesKey {
        SeriesKey::new(
            Exchange::new("coinbase"),
            Pair::new("BTC-USD"),
            Duration::hours(1),
        )
    }

    fn candle(hour: u32) -> Candle {
        Candle::new(
            key(),
            Utc.ymd(2024, 1, 1).and_hms(hour, 0, 0),
            dec!(100),
            dec!(110),
            dec!(90),
            dec!(105),
            dec!(1),
        )
        .unwrap()
    }

    /// Scripted sink: fails with the queued errors first, then acks,
    /// recording the size of every batch it sees.
    struct ScriptedSink {
        failures: Mutex<Vec<SinkError>>,
        batches: Mutex<Vec<usize>>,
    }

    impl ScriptedSink {
        fn new(failures: Vec<SinkError>) -> Self {
            ScriptedSink {
                failures: Mutex::new(failures),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<usize> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        async fn write_batch(&self, _key: SeriesKey, candles: &[Candle]) -> Result<(), SinkError> {
            self.batches.lock().unwrap().push(candles.len());
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.remove(0))
            }
        }
    }

    fn writer(sink: ScriptedSink, batch_size: usize) -> (Writer<ScriptedSink>, Arc<SeriesRegistry>) {
        let registry = Arc::new(SeriesRegistry::new());
        let backoff = Backoff {
            max_attempts: 3,
            base: std::time::Duration::from_millis(10),
            cap: std::time::Duration::from_millis(100),
        };
        (
            Writer::new(sink, registry.clone(), batch_size, backoff),
            registry,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn advances_cursor_to_batch_max() {
        let (writer, registry) = writer(ScriptedSink::new(Vec::new()), 500);
        let candles = [candle(0), candle(1), candle(2)];

        let ack = writer.write(key(), &candles).await.unwrap();
        assert_eq!(ack, Some(candles[2].time));
        assert_eq!(registry.get(key()), Some(candles[2].time));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_unavailable_then_succeeds() {
        let sink = ScriptedSink::new(vec![
            SinkError::Unavailable("down".into()),
            SinkError::Unavailable("down".into()),
        ]);
        let (writer, registry) = writer(sink, 500);
        let candles = [candle(0), candle(1)];

        let ack = writer.write(key(), &candles).await.unwrap();
        assert_eq!(ack, Some(candles[1].time));
        assert_eq!(registry.get(key()), Some(candles[1].time));
        assert_eq!(writer.sink.seen(), vec![2, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_capped_attempts() {
        let sink = ScriptedSink::new(vec![
            SinkError::Unavailable("down".into()),
            SinkError::Unavailable("down".into()),
            SinkError::Unavailable("down".into()),
        ]);
        let (writer, registry) = writer(sink, 500);

        let err = writer.write(key(), &[candle(0)]).await.unwrap_err();
        assert!(matches!(err, WriteError::Sink(SinkError::Unavailable(_))));
        assert_eq!(registry.get(key()), None);
        assert_eq!(writer.sink.seen(), vec![1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batch_is_not_retried() {
        let sink = ScriptedSink::new(vec![SinkError::Rejected("bad line".into())]);
        let (writer, registry) = writer(sink, 500);

        let err = writer.write(key(), &[candle(0)]).await.unwrap_err();
        assert!(matches!(err, WriteError::Sink(SinkError::Rejected(_))));
        assert_eq!(registry.get(key()), None);
        assert_eq!(writer.sink.seen(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn splits_into_batches_and_advances_per_batch() {
        let (writer, registry) = writer(ScriptedSink::new(Vec::new()), 2);
        let candles = [candle(0), candle(1), candle(2), candle(3), candle(4)];

        let ack = writer.write(key(), &candles).await.unwrap();
        assert_eq!(ack, Some(candles[4].time));
        assert_eq!(writer.sink.seen(), vec![2, 2, 1]);
        assert_eq!(registry.get(key()), Some(candles[4].time));
    }
}
