use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use rust_decimal::prelude::*;
use serde::Deserialize;
use std::str::FromStr;

use super::{Source, SourceError};
use crate::{Backoff, Candle, FetchWindow, SeriesKey};

/// Coinbase caps candle responses at 350 rows; stay under it per page.
const MAX_BUCKETS_PER_PAGE: i64 = 300;

/// Coinbase Advanced Trade public market data.
pub struct Coinbase {
    http: reqwest::Client,
    base_url: String,
    backoff: Backoff,
}

impl Coinbase {
    pub fn new(base_url: String, backoff: Backoff) -> Self {
        Coinbase {
            http: reqwest::Client::new(),
            base_url,
            backoff,
        }
    }

    async fn request_page(
        &self,
        key: SeriesKey,
        window: FetchWindow,
        granularity: &'static str,
    ) -> Result<Vec<RawCandle>, SourceError> {
        let url = format!(
            "{}/api/v3/brokerage/market/products/{}/candles",
            self.base_url, key.pair
        );
        // Coinbase treats start/end as inclusive bucket-start seconds.
        let last_bucket = window.end - key.interval;
        let response = self
            .http
            .get(&url)
            .query(&[
                ("start", window.start.timestamp().to_string()),
                ("end", last_bucket.timestamp().to_string()),
                ("granularity", granularity.to_string()),
            ])
            .send()
            .await
            .map_err(|err| SourceError::UpstreamUnavailable(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: CandlesResponse = response
                .json()
                .await
                .map_err(|err| SourceError::UpstreamUnavailable(err.to_string()))?;
            Ok(body.candles)
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Err(SourceError::RateLimited)
        } else if status == StatusCode::BAD_REQUEST
            || status == StatusCode::NOT_FOUND
            || status == StatusCode::UNPROCESSABLE_ENTITY
        {
            let body = response.text().await.unwrap_or_default();
            Err(SourceError::InvalidSeries(format!("{}: {}", key.pair, body)))
        } else {
            Err(SourceError::UpstreamUnavailable(format!(
                "unexpected status {}",
                status
            )))
        }
    }

    /// One page with bounded in-adapter retry of transient failures.
    /// Rate limits and misconfiguration propagate immediately.
    async fn request_page_with_retry(
        &self,
        key: SeriesKey,
        window: FetchWindow,
        granularity: &'static str,
    ) -> Result<Vec<RawCandle>, SourceError> {
        let mut attempt = 0;
        loop {
            match self.request_page(key, window, granularity).await {
                Ok(rows) => return Ok(rows),
                Err(SourceError::UpstreamUnavailable(reason)) => {
                    attempt += 1;
                    if attempt >= self.backoff.max_attempts {
                        return Err(SourceError::UpstreamUnavailable(reason));
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    log::warn!(
                        "coinbase request for {} failed ({}), retrying in {:?}",
                        key,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Source for Coinbase {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    async fn fetch(
        &self,
        key: SeriesKey,
        window: FetchWindow,
    ) -> Result<Vec<Candle>, SourceError> {
        if key.exchange.as_str() != self.name() {
            return Err(SourceError::InvalidSeries(format!(
                "exchange {} is not served by this source",
                key.exchange
            )));
        }
        let granularity = granularity(key).ok_or_else(|| {
            SourceError::InvalidSeries(format!(
                "granularity {}s is not offered by coinbase",
                key.interval.num_seconds()
            ))
        })?;

        if window.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows = Vec::new();
        let mut page_start = window.start;
        while page_start < window.end {
            let page_end = (page_start + key.interval * MAX_BUCKETS_PER_PAGE as i32).min(window.end);
            let page = FetchWindow::new(page_start, page_end);
            rows.extend(self.request_page_with_retry(key, page, granularity).await?);
            page_start = page_end;
        }

        Ok(normalize(key, window, rows))
    }
}

/// Coinbase granularity label for a series' interval.
fn granularity(key: SeriesKey) -> Option<&'static str> {
    match key.interval.num_seconds() {
        60 => Some("ONE_MINUTE"),
        300 => Some("FIVE_MINUTE"),
        900 => Some("FIFTEEN_MINUTE"),
        1800 => Some("THIRTY_MINUTE"),
        3600 => Some("ONE_HOUR"),
        7200 => Some("TWO_HOUR"),
        21600 => Some("SIX_HOUR"),
        86400 => Some("ONE_DAY"),
        _ => None,
    }
}

#[derive(Deserialize)]
struct CandlesResponse {
    #[serde(default)]
    candles: Vec<RawCandle>,
}

/// Coinbase encodes all candle values as decimal strings.
#[derive(Deserialize)]
struct RawCandle {
    start: String,
    low: String,
    high: String,
    open: String,
    close: String,
    volume: String,
}

/// Flatten raw pages into the canonical form: ascending, deduplicated by
/// timestamp, clipped to the window. Rows the exchange serves malformed are
/// dropped with a logged warning rather than failing the whole window.
fn normalize(key: SeriesKey, window: FetchWindow, rows: Vec<RawCandle>) -> Vec<Candle> {
    let mut candles: Vec<Candle> = rows
        .into_iter()
        .filter_map(|row| match parse_row(key, &row) {
            Ok(candle) => Some(candle),
            Err(reason) => {
                log::warn!("dropping malformed coinbase candle for {}: {}", key, reason);
                None
            }
        })
        .filter(|candle| window.contains(candle.time))
        .collect();

    candles.sort_by_key(|candle| candle.time);
    candles.dedup_by_key(|candle| candle.time);
    candles
}

fn parse_row(key: SeriesKey, row: &RawCandle) -> Result<Candle, String> {
    let secs: i64 = row.start.parse().map_err(|_| format!("bad start {:?}", row.start))?;
    let time = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| format!("bad timestamp {}", secs))?;
    let field = |name: &str, raw: &str| {
        Decimal::from_str(raw).map_err(|_| format!("bad {} {:?}", name, raw))
    };
    Candle::new(
        key,
        time,
        field("open", &row.open)?,
        field("high", &row.high)?,
        field("low", &row.low)?,
        field("close", &row.close)?,
        field("volume", &row.volume)?,
    )
    .map_err(|err| err.to_string())
}
