use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::sink::{Sink, WriteError, Writer};
use crate::sources::{Source, SourceError};
use crate::{truncate, Candle, FetchWindow, SeriesKey, SeriesRegistry};

#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cursor already covers every complete bucket.
    CaughtUp,
    /// A window was fetched but nothing new could be persisted.
    Empty,
    Persisted {
        count: usize,
        cursor: DateTime<Utc>,
    },
}

/// One fetch-dedup-persist pipeline shared by all series tasks.
///
/// A cycle computes the fetch window from the series cursor, pulls candles
/// from the source, discards anything at or below the cursor, walks the
/// result bucket by bucket issuing backfill sub-requests for internal gaps,
/// and forwards a strictly ascending run to the writer. The cursor never
/// advances past a bucket that has not been confirmed persisted, and never
/// silently past missing data.
pub struct Pipeline<A: Source, S: Sink> {
    source: A,
    writer: Writer<S>,
    registry: Arc<SeriesRegistry>,
    backfill_start: DateTime<Utc>,
    gap_escalation_after: u32,
    gap_failures: Mutex<FxHashMap<SeriesKey, (DateTime<Utc>, u32)>>,
}

impl<A: Source, S: Sink> Pipeline<A, S> {
    pub fn new(
        source: A,
        writer: Writer<S>,
        registry: Arc<SeriesRegistry>,
        backfill_start: DateTime<Utc>,
        gap_escalation_after: u32,
    ) -> Self {
        Pipeline {
            source,
            writer,
            registry,
            backfill_start,
            gap_escalation_after,
            gap_failures: Mutex::new(FxHashMap::default()),
        }
    }

    /// Window still owed for this series: from just past the cursor (or the
    /// backfill start for a never-persisted series) up to the start of the
    /// current, still incomplete bucket.
    fn window(&self, key: SeriesKey, cursor: Option<DateTime<Utc>>) -> FetchWindow {
        let start = match cursor {
            Some(cursor) => cursor + key.interval,
            None => truncate(self.backfill_start, key.interval),
        };
        FetchWindow::new(start, truncate(Utc::now(), key.interval))
    }

    pub async fn run_cycle(&self, key: SeriesKey) -> Result<CycleOutcome, CycleError> {
        let cursor = self.registry.get(key);
        let window = self.window(key, cursor);
        if window.is_empty() {
            log::trace!("{} caught up, no window to fetch", key);
            return Ok(CycleOutcome::CaughtUp);
        }

        log::debug!("fetching {} for {}", window, key);
        let fetched = self.source.fetch(key, window).await?;

        // Defense against upstream overlap: anything at or below the cursor
        // is already persisted.
        let pending: Vec<Candle> = fetched
            .into_iter()
            .filter(|candle| cursor.map_or(true, |cursor| candle.time > cursor))
            .collect();

        let forward = self.assemble(key, cursor, pending).await?;
        if forward.is_empty() {
            return Ok(CycleOutcome::Empty);
        }

        match self.writer.write(key, &forward).await? {
            Some(cursor) => Ok(CycleOutcome::Persisted {
                count: forward.len(),
                cursor,
            }),
            None => Ok(CycleOutcome::Empty),
        }
    }

    /// Walk `pending` bucket by bucket from the cursor, backfilling internal
    /// gaps, and return the longest strictly ascending gap-free prefix that
    /// is safe to persist.
    async fn assemble(
        &self,
        key: SeriesKey,
        cursor: Option<DateTime<Utc>>,
        pending: Vec<Candle>,
    ) -> Result<Vec<Candle>, CycleError> {
        let interval = key.interval;
        // With no cursor there is no expectation before the first observed
        // bucket; the series simply starts where upstream data starts.
        let mut expected = match cursor {
            Some(cursor) => cursor + interval,
            None => match pending.first() {
                Some(first) => first.time,
                None => return Ok(Vec::new()),
            },
        };

        let mut forward = Vec::with_capacity(pending.len());
        for candle in pending {
            if candle.time < expected {
                log::trace!("dropping duplicate candle at {} for {}", candle.time, key);
                continue;
            }

            if candle.time > expected {
                let gap = FetchWindow::new(expected, candle.time);
                log::debug!("detected gap {} in {}, requesting backfill", gap, key);
                match self.backfill(key, cursor, gap).await? {
                    Some(filled) => {
                        for fill in filled {
                            if fill.time == expected {
                                forward.push(fill);
                                expected = expected + interval;
                            } else if fill.time > expected {
                                break;
                            }
                        }
                    }
                    // Transient upstream trouble: hold before the gap and
                    // try again on the next tick.
                    None => return Ok(forward),
                }

                if expected < candle.time {
                    if self.record_gap_failure(key, expected) {
                        log::error!(
                            "data loss risk: giving up on gap [{}, {}) for {} after repeated backfill failures",
                            expected,
                            candle.time,
                            key
                        );
                        expected = candle.time;
                    } else {
                        log::warn!(
                            "gap [{}, {}) in {} could not be backfilled, holding cursor before it",
                            expected,
                            candle.time,
                            key
                        );
                        return Ok(forward);
                    }
                } else {
                    self.clear_gap_failure(key);
                }
            }

            forward.push(candle);
            expected = expected + interval;
        }

        self.clear_gap_failure(key);
        Ok(forward)
    }

    /// Sub-fetch one missing range. `Ok(None)` means the upstream was
    /// transiently unavailable; the gap stays unconfirmed.
    async fn backfill(
        &self,
        key: SeriesKey,
        cursor: Option<DateTime<Utc>>,
        gap: FetchWindow,
    ) -> Result<Option<Vec<Candle>>, CycleError> {
        match self.source.fetch(key, gap).await {
            Ok(mut filled) => {
                filled.retain(|candle| {
                    gap.contains(candle.time)
                        && cursor.map_or(true, |cursor| candle.time > cursor)
                });
                Ok(Some(filled))
            }
            Err(SourceError::InvalidSeries(reason)) => {
                Err(CycleError::Source(SourceError::InvalidSeries(reason)))
            }
            Err(err) => {
                log::warn!("backfill of {} for {} failed: {}", gap, key, err);
                Ok(None)
            }
        }
    }

    /// Count consecutive cycles in which the same gap stayed unfillable.
    /// Returns true once the count reaches the escalation threshold.
    fn record_gap_failure(&self, key: SeriesKey, gap_start: DateTime<Utc>) -> bool {
        let mut failures = self.gap_failures.lock().unwrap();
        let entry = failures.entry(key).or_insert((gap_start, 0));
        if entry.0 != gap_start {
            *entry = (gap_start, 0);
        }
        entry.1 += 1;
        if entry.1 >= self.gap_escalation_after {
            failures.remove(&key);
            true
        } else {
            false
        }
    }

    fn clear_gap_failure(&self, key: SeriesKey) {
        self.gap_failures.lock().unwrap().remove(&key);
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &A {
        &self.source
    }
}
