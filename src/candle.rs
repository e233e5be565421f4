use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;

use crate::{Exchange, Pair};

/// The supported candle intervals and their short spellings.
const INTERVALS: &[(&str, i64)] = &[
    ("1m", 60),
    ("5m", 300),
    ("15m", 900),
    ("30m", 1800),
    ("1h", 3600),
    ("2h", 7200),
    ("6h", 21600),
    ("1d", 86400),
];

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unsupported interval: {0}")]
pub struct UnsupportedInterval(pub String);

pub fn parse_interval(s: &str) -> Result<Duration, UnsupportedInterval> {
    INTERVALS
        .iter()
        .find(|(name, _)| *name == s)
        .map(|(_, secs)| Duration::seconds(*secs))
        .ok_or_else(|| UnsupportedInterval(s.to_owned()))
}

pub fn format_interval(interval: Duration) -> String {
    INTERVALS
        .iter()
        .find(|(_, secs)| *secs == interval.num_seconds())
        .map(|(name, _)| (*name).to_owned())
        .unwrap_or_else(|| format!("{}s", interval.num_seconds()))
}

/// Round a timestamp down to the nearest interval boundary from the Unix epoch.
pub fn truncate(time: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let secs = interval.num_seconds();
    Utc.timestamp(time.timestamp() - time.timestamp().rem_euclid(secs), 0)
}

/// Uniquely identifies one time-ordered candle stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub exchange: Exchange,
    pub pair: Pair,
    pub interval: Duration,
}

impl SeriesKey {
    pub fn new(exchange: Exchange, pair: Pair, interval: Duration) -> Self {
        SeriesKey {
            exchange,
            pair,
            interval,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.exchange,
            self.pair,
            format_interval(self.interval)
        )
    }
}

/// A half-open timestamp range `[start, end)` requested from a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        FetchWindow { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.start && time < self.end
    }

    /// Number of interval buckets covered by this window.
    pub fn buckets(&self, interval: Duration) -> i64 {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start).num_seconds() / interval.num_seconds()
        }
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CandleError {
    #[error("candle at {0} is not aligned to its interval")]
    Misaligned(DateTime<Utc>),
    #[error("candle at {0} has a negative price or volume")]
    Negative(DateTime<Utc>),
    #[error("candle at {0} violates high/low bounds")]
    Bounds(DateTime<Utc>),
}

/// One OHLC observation for a fixed time bucket of one series.
///
/// Immutable once constructed; `Candle::new` enforces interval alignment
/// and the `high >= max(open, close) >= min(open, close) >= low` invariant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub ingested_at: DateTime<Utc>,
}

impl Candle {
    pub fn new(
        key: SeriesKey,
        time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Result<Self, CandleError> {
        if time != truncate(time, key.interval) {
            return Err(CandleError::Misaligned(time));
        }
        if open < Decimal::ZERO
            || high < Decimal::ZERO
            || low < Decimal::ZERO
            || close < Decimal::ZERO
            || volume < Decimal::ZERO
        {
            return Err(CandleError::Negative(time));
        }
        if high < open.max(close) || low > open.min(close) {
            return Err(CandleError::Bounds(time));
        }

        Ok(Candle {
            time,
            open,
            high,
            low,
            close,
            volume,
            ingested_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn key() -> SeriesKey {
        SeriesKey::new(
            Exchange::new("coinbase"),
            Pair::new("BTC-USD"),
            Duration::minutes(5),
        )
    }

    #[test]
    fn interval_roundtrip() {
        for name in ["1m", "5m", "15m", "30m", "1h", "2h", "6h", "1d"] {
            let interval = parse_interval(name).unwrap();
            assert_eq!(format_interval(interval), name);
        }
        assert!(parse_interval("7m").is_err());
    }

    #[test]
    fn truncation() {
        let time = Utc.ymd(2024, 1, 1).and_hms(0, 7, 31);
        assert_eq!(
            truncate(time, Duration::minutes(5)),
            Utc.ymd(2024, 1, 1).and_hms(0, 5, 0)
        );
        assert_eq!(
            truncate(time, Duration::hours(1)),
            Utc.ymd(2024, 1, 1).and_hms(0, 0, 0)
        );
    }

    #[test]
    fn rejects_misaligned_time() {
        let time = Utc.ymd(2024, 1, 1).and_hms(0, 7, 0);
        let result = Candle::new(
            key(),
            time,
            dec!(100),
            dec!(110),
            dec!(90),
            dec!(105),
            dec!(1),
        );
        assert_eq!(result.unwrap_err(), CandleError::Misaligned(time));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let time = Utc.ymd(2024, 1, 1).and_hms(0, 5, 0);
        let result = Candle::new(
            key(),
            time,
            dec!(100),
            dec!(99),
            dec!(90),
            dec!(95),
            dec!(1),
        );
        assert_eq!(result.unwrap_err(), CandleError::Bounds(time));
    }

    #[test]
    fn rejects_negative_volume() {
        let time = Utc.ymd(2024, 1, 1).and_hms(0, 5, 0);
        let result = Candle::new(
            key(),
            time,
            dec!(100),
            dec!(110),
            dec!(90),
            dec!(105),
            dec!(-1),
        );
        assert_eq!(result.unwrap_err(), CandleError::Negative(time));
    }

    #[test]
    fn window_buckets() {
        let window = FetchWindow::new(
            Utc.ymd(2024, 1, 1).and_hms(0, 0, 0),
            Utc.ymd(2024, 1, 1).and_hms(3, 0, 0),
        );
        assert_eq!(window.buckets(Duration::hours(1)), 3);
        assert!(!window.is_empty());

        let empty = FetchWindow::new(window.end, window.end);
        assert!(empty.is_empty());
        assert_eq!(empty.buckets(Duration::hours(1)), 0);
    }
}
