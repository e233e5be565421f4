use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::SeriesKey;

/// Attempted to move a series cursor backwards. This always indicates a
/// caller bug; it must surface rather than silently succeed.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("cursor for {key} would regress from {current} to {proposed}")]
pub struct RegressionRejected {
    pub key: SeriesKey,
    pub current: DateTime<Utc>,
    pub proposed: DateTime<Utc>,
}

/// Single source of truth for how much of each series is durably persisted.
///
/// Holds one cursor per series key: the bucket-start timestamp of the last
/// candle confirmed written to the sink. Only the writer advances cursors,
/// and only forwards. An absent cursor means the series has never been
/// persisted and collection starts from the configured backfill start.
pub struct SeriesRegistry {
    cursors: Mutex<FxHashMap<SeriesKey, DateTime<Utc>>>,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        SeriesRegistry {
            cursors: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: SeriesKey) -> Option<DateTime<Utc>> {
        self.cursors.lock().unwrap().get(&key).copied()
    }

    /// Advance the cursor for `key` to `timestamp`. Re-acknowledging the
    /// current cursor is a no-op; moving backwards is rejected.
    pub fn advance(&self, key: SeriesKey, timestamp: DateTime<Utc>) -> Result<(), RegressionRejected> {
        let mut cursors = self.cursors.lock().unwrap();
        match cursors.get(&key) {
            Some(&current) if timestamp < current => Err(RegressionRejected {
                key,
                current,
                proposed: timestamp,
            }),
            _ => {
                cursors.insert(key, timestamp);
                Ok(())
            }
        }
    }
}
