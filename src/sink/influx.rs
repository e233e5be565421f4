use async_trait::async_trait;
use reqwest::StatusCode;

use super::{Sink, SinkError};
use crate::{format_interval, Candle, SeriesKey};

/// InfluxDB 2.x over its line-protocol write API.
///
/// All series share one bucket; the series key is carried as the `exchange`,
/// `pair` and `interval` tags on the `candles` measurement.
pub struct InfluxSink {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxSink {
    pub fn new(url: String, token: String, org: String, bucket: String) -> Self {
        InfluxSink {
            http: reqwest::Client::new(),
            url,
            token,
            org,
            bucket,
        }
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write_batch(&self, key: SeriesKey, candles: &[Candle]) -> Result<(), SinkError> {
        if candles.is_empty() {
            return Ok(());
        }

        let body = candles
            .iter()
            .map(|candle| line(key, candle))
            .collect::<Vec<_>>()
            .join("\n");

        let response = self
            .http
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|err| SinkError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(SinkError::Unavailable(format!("status {}", status)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SinkError::Rejected(format!("status {}: {}", status, body)))
        }
    }
}

/// One candle as a line-protocol point, second precision.
fn line(key: SeriesKey, candle: &Candle) -> String {
    format!(
        "candles,exchange={},pair={},interval={} open={},high={},low={},close={},volume={} {}",
        escape_tag(key.exchange.as_str()),
        escape_tag(key.pair.as_str()),
        format_interval(key.interval),
        candle.open,
        candle.high,
        candle.low,
        candle.close,
        candle.volume,
        candle.time.timestamp()
    )
}

/// Line protocol requires commas, equals signs and spaces in tag values to
/// be backslash-escaped.
fn escape_tag(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Exchange, Pair};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn line_protocol_point() {
        let key = SeriesKey::new(
            Exchange::new("coinbase"),
            Pair::new("BTC-USD"),
            Duration::minutes(5),
        );
        let candle = Candle::new(
            key,
            Utc.ymd(2024, 1, 1).and_hms(0, 5, 0),
            dec!(42100),
            dec!(42500),
            dec!(42000.01),
            dec!(42400),
            dec!(12.5),
        )
        .unwrap();

        assert_eq!(
            line(key, &candle),
            "candles,exchange=coinbase,pair=BTC-USD,interval=5m \
             open=42100,high=42500,low=42000.01,close=42400,volume=12.5 1704067500"
        );
    }

    #[test]
    fn tag_escaping() {
        assert_eq!(escape_tag("BTC-USD"), "BTC-USD");
        assert_eq!(escape_tag("a b,c=d"), "a\\ b\\,c\\=d");
    }
}
