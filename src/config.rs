use chrono::{DateTime, Duration, Utc};
use std::env;
use std::time::Duration as StdDuration;
use thiserror::Error;

use crate::{parse_interval, Backoff, Exchange, Pair, SeriesKey};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Runtime configuration, environment-driven: the collector runs as a
/// supervised background process and exposes no CLI.
#[derive(Clone, Debug)]
pub struct Config {
    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub coinbase_url: String,
    pub series: Vec<SeriesKey>,
    /// Overrides the per-series candle interval as poll cadence when set.
    pub poll_interval: Option<StdDuration>,
    pub batch_size: usize,
    pub backoff: Backoff,
    pub backfill_start: DateTime<Utc>,
    pub gap_escalation_after: u32,
    pub shutdown_grace: StdDuration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let influx_url = lookup("INFLUXDB_URL").ok_or(ConfigError::Missing("INFLUXDB_URL"))?;
        let influx_token =
            lookup("INFLUXDB_TOKEN").ok_or(ConfigError::Missing("INFLUXDB_TOKEN"))?;
        let influx_org = lookup("INFLUXDB_ORG").unwrap_or_else(|| "home".to_owned());
        let influx_bucket =
            lookup("INFLUXDB_BUCKET").unwrap_or_else(|| "spot_crypto_candles".to_owned());
        let coinbase_url =
            lookup("COINBASE_URL").unwrap_or_else(|| "https://api.coinbase.com".to_owned());

        let series = parse_series(
            &lookup("SERIES").ok_or(ConfigError::Missing("SERIES"))?,
        )?;

        let poll_interval = match lookup("POLL_INTERVAL_SECS") {
            Some(raw) => Some(StdDuration::from_secs(parse_num("POLL_INTERVAL_SECS", &raw)?)),
            None => None,
        };

        let batch_size = match lookup("BATCH_SIZE") {
            Some(raw) => parse_num::<usize>("BATCH_SIZE", &raw)?,
            None => 500,
        };
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "BATCH_SIZE",
                reason: "must be at least 1".to_owned(),
            });
        }

        let backoff = Backoff {
            max_attempts: match lookup("MAX_RETRIES") {
                Some(raw) => parse_num("MAX_RETRIES", &raw)?,
                None => Backoff::default().max_attempts,
            },
            base: match lookup("BACKOFF_BASE_MS") {
                Some(raw) => StdDuration::from_millis(parse_num("BACKOFF_BASE_MS", &raw)?),
                None => Backoff::default().base,
            },
            cap: match lookup("BACKOFF_CAP_SECS") {
                Some(raw) => StdDuration::from_secs(parse_num("BACKOFF_CAP_SECS", &raw)?),
                None => Backoff::default().cap,
            },
        };

        // The reference deployment retains 30 days; a never-persisted series
        // backfills that far by default.
        let backfill_start = match lookup("BACKFILL_START") {
            Some(raw) => raw
                .parse::<DateTime<Utc>>()
                .map_err(|err| ConfigError::Invalid {
                    var: "BACKFILL_START",
                    reason: err.to_string(),
                })?,
            None => Utc::now() - Duration::days(30),
        };

        let gap_escalation_after = match lookup("GAP_ESCALATION_AFTER") {
            Some(raw) => parse_num("GAP_ESCALATION_AFTER", &raw)?,
            None => 3,
        };

        let shutdown_grace = match lookup("SHUTDOWN_GRACE_SECS") {
            Some(raw) => StdDuration::from_secs(parse_num("SHUTDOWN_GRACE_SECS", &raw)?),
            None => StdDuration::from_secs(10),
        };

        Ok(Config {
            influx_url,
            influx_token,
            influx_org,
            influx_bucket,
            coinbase_url,
            series,
            poll_interval,
            batch_size,
            backoff,
            backfill_start,
            gap_escalation_after,
            shutdown_grace,
        })
    }
}

/// Parse a comma-separated series list, e.g. `coinbase:BTC-USD:5m,coinbase:ETH-USD:1h`.
fn parse_series(raw: &str) -> Result<Vec<SeriesKey>, ConfigError> {
    let mut series = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(exchange), Some(pair), Some(interval)) if !exchange.is_empty() && !pair.is_empty() => {
                let interval = parse_interval(interval).map_err(|err| ConfigError::Invalid {
                    var: "SERIES",
                    reason: err.to_string(),
                })?;
                series.push(SeriesKey::new(
                    Exchange::new(exchange),
                    Pair::new(pair),
                    interval,
                ));
            }
            _ => {
                return Err(ConfigError::Invalid {
                    var: "SERIES",
                    reason: format!("expected exchange:pair:interval, got {:?}", entry),
                })
            }
        }
    }
    if series.is_empty() {
        return Err(ConfigError::Invalid {
            var: "SERIES",
            reason: "no series configured".to_owned(),
        });
    }
    Ok(series)
}

fn parse_num<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
        var,
        reason: err.to_string(),
    })
}
