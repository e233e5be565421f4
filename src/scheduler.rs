use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::cycle::{CycleError, CycleOutcome, Pipeline};
use crate::sink::{Sink, SinkError, WriteError};
use crate::sources::{Source, SourceError};
use crate::SeriesKey;

/// Drives one collection task per series.
///
/// Each series ticks on its own timer and runs its cycles guarded by a
/// per-series busy flag: a tick that arrives while the previous cycle is
/// still in flight is dropped and reported, never queued. Series are fully
/// independent; a slow upstream on one pair never delays another. Shutdown
/// lets in-flight cycles drain within a bounded grace period.
pub struct Scheduler<A: Source + 'static, S: Sink + 'static> {
    pipeline: Arc<Pipeline<A, S>>,
    poll_override: Option<StdDuration>,
    shutdown_grace: StdDuration,
}

impl<A: Source + 'static, S: Sink + 'static> Scheduler<A, S> {
    pub fn new(
        pipeline: Arc<Pipeline<A, S>>,
        poll_override: Option<StdDuration>,
        shutdown_grace: StdDuration,
    ) -> Self {
        Scheduler {
            pipeline,
            poll_override,
            shutdown_grace,
        }
    }

    /// Run until the shutdown signal fires, then drain.
    pub async fn run(&self, series: Vec<SeriesKey>, shutdown: watch::Receiver<bool>) {
        let mut busy_flags = Vec::new();
        let mut handles = Vec::new();
        for key in series {
            let busy = Arc::new(AtomicBool::new(false));
            busy_flags.push(busy.clone());
            let poll = self.poll_override.unwrap_or_else(|| {
                key.interval
                    .to_std()
                    .unwrap_or(StdDuration::from_secs(300))
            });
            handles.push(tokio::spawn(series_loop(
                self.pipeline.clone(),
                key,
                poll,
                busy,
                shutdown.clone(),
            )));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while busy_flags.iter().any(|busy| busy.load(Ordering::Acquire)) {
            if tokio::time::Instant::now() >= deadline {
                log::warn!("shutdown grace period expired with cycles still in flight");
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        log::info!("scheduler stopped");
    }
}

async fn series_loop<A: Source + 'static, S: Sink + 'static>(
    pipeline: Arc<Pipeline<A, S>>,
    key: SeriesKey,
    poll: StdDuration,
    busy: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    // The first tick fires immediately, so a freshly started collector does
    // not wait a full poll period before its first data.
    let mut timer = tokio::time::interval(poll);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let dead = Arc::new(AtomicBool::new(false));

    log::info!("collecting {} every {:?}", key, poll);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                if dead.load(Ordering::Acquire) {
                    break;
                }
                if busy
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let pipeline = pipeline.clone();
                    let busy = busy.clone();
                    let dead = dead.clone();
                    tokio::spawn(async move {
                        let fatal = report(key, pipeline.run_cycle(key).await);
                        if fatal {
                            dead.store(true, Ordering::Release);
                        }
                        busy.store(false, Ordering::Release);
                    });
                } else {
                    log::warn!("cycle skipped for {}: previous cycle still running", key);
                }
            }
        }
    }
    log::debug!("series task for {} stopped", key);
}

/// Log a cycle's outcome. Returns true if the series must stop polling.
fn report(key: SeriesKey, result: Result<CycleOutcome, CycleError>) -> bool {
    match result {
        Ok(CycleOutcome::CaughtUp) => {
            log::trace!("{} caught up", key);
            false
        }
        Ok(CycleOutcome::Empty) => {
            log::debug!("cycle for {} produced nothing new", key);
            false
        }
        Ok(CycleOutcome::Persisted { count, cursor }) => {
            log::info!("persisted {} candles for {}, cursor {}", count, key, cursor);
            false
        }
        Err(CycleError::Source(SourceError::RateLimited)) => {
            log::warn!("{} rate limited, waiting for the next tick", key);
            false
        }
        Err(CycleError::Source(SourceError::UpstreamUnavailable(reason))) => {
            log::warn!("upstream unavailable for {}: {}", key, reason);
            false
        }
        Err(CycleError::Source(SourceError::InvalidSeries(reason))) => {
            log::error!("abandoning misconfigured series {}: {}", key, reason);
            true
        }
        Err(CycleError::Write(WriteError::Sink(SinkError::Unavailable(reason)))) => {
            log::warn!("sink unavailable for {}: {}", key, reason);
            false
        }
        Err(CycleError::Write(WriteError::Sink(SinkError::Rejected(reason)))) => {
            log::error!("sink rejected batch for {}: {}", key, reason);
            false
        }
        Err(CycleError::Write(WriteError::Regression(err))) => {
            log::error!("cursor regression blocked for {}: {}", key, err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Writer;
    use crate::{Backoff, Candle, Exchange, FetchWindow, Pair, SeriesRegistry};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use fxhash::FxHashMap;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn key(pair: &str) -> SeriesKey {
        SeriesKey::new(Exchange::new("test"), Pair::new(pair), Duration::hours(1))
    }

    /// Source that counts fetches per pair and can hold selected pairs on a
    /// gate until the test releases them.
    struct GatedSource {
        gate: Arc<Notify>,
        blocked_pair: Option<&'static str>,
        calls: Mutex<FxHashMap<&'static str, usize>>,
    }

    impl GatedSource {
        fn new(blocked_pair: Option<&'static str>) -> Self {
            GatedSource {
                gate: Arc::new(Notify::new()),
                blocked_pair,
                calls: Mutex::new(FxHashMap::default()),
            }
        }

        fn calls(&self, pair: &str) -> usize {
            self.calls.lock().unwrap().get(pair).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Source for GatedSource {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn fetch(
            &self,
            key: SeriesKey,
            _window: FetchWindow,
        ) -> Result<Vec<Candle>, SourceError> {
            *self.calls.lock().unwrap().entry(key.pair.as_str()).or_insert(0) += 1;
            if self.blocked_pair == Some(key.pair.as_str()) {
                self.gate.notified().await;
            }
            Ok(Vec::new())
        }
    }

    struct NullSink;

    #[async_trait]
    impl Sink for NullSink {
        async fn write_batch(
            &self,
            _key: SeriesKey,
            _candles: &[Candle],
        ) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn pipeline(source: GatedSource) -> Arc<Pipeline<GatedSource, NullSink>> {
        let registry = Arc::new(SeriesRegistry::new());
        let writer = Writer::new(NullSink, registry.clone(), 500, Backoff::default());
        Arc::new(Pipeline::new(
            source,
            writer,
            registry,
            Utc.ymd(2024, 1, 1).and_hms(0, 0, 0),
            3,
        ))
    }

    fn spawn_scheduler(
        pipeline: Arc<Pipeline<GatedSource, NullSink>>,
        series: Vec<SeriesKey>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            Scheduler::new(
                pipeline,
                Some(StdDuration::from_secs(1)),
                StdDuration::from_secs(5),
            )
            .run(series, shutdown)
            .await;
        })
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_are_dropped_not_queued() {
        let pipeline = pipeline(GatedSource::new(Some("BTC-USD")));
        let gate = pipeline.source().gate.clone();
        let (tx, rx) = watch::channel(false);
        let run = spawn_scheduler(pipeline.clone(), vec![key("BTC-USD")], rx);

        // Several poll periods elapse while the first cycle is stuck on the
        // gate; every one of those ticks must be dropped, not queued.
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        assert_eq!(pipeline.source().calls("BTC-USD"), 1);

        tx.send(true).unwrap();
        gate.notify_one();
        run.await.unwrap();

        // Exactly one cycle ran: the immediate startup tick.
        assert_eq!(pipeline.source().calls("BTC-USD"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_series_does_not_delay_others() {
        let pipeline = pipeline(GatedSource::new(Some("SLOW-USD")));
        let gate = pipeline.source().gate.clone();
        let (tx, rx) = watch::channel(false);
        let run = spawn_scheduler(
            pipeline.clone(),
            vec![key("SLOW-USD"), key("FAST-USD")],
            rx,
        );

        tokio::time::sleep(StdDuration::from_secs(4)).await;
        assert_eq!(pipeline.source().calls("SLOW-USD"), 1);
        assert!(pipeline.source().calls("FAST-USD") >= 3);

        tx.send(true).unwrap();
        gate.notify_one();
        run.await.unwrap();
    }
}
