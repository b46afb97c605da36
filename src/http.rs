use crate::config::BarInterval;
use crate::data::{normalize_bars, parse_naive_timestamp, HistoricalDataProvider};
use crate::models::PriceBar;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::warn;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::thread;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Fetches bars from a remote JSON endpoint of the form
/// `GET {base_url}/bars?symbol=...&start=...&end=...&interval=...`
/// returning `{"bars": [{"t": ..., "o": ..., "h": ..., "l": ..., "c": ...,
/// "v": ...}, ...]}`.
///
/// This is the only retrying boundary in the crate: transient transport and
/// rate-limit failures back off exponentially with jitter for a capped
/// number of attempts, after which the symbol surfaces as unavailable and
/// portfolio runs exclude it instead of stalling.
pub struct HttpBarProvider {
    http: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct BarsResponse {
    bars: Vec<RawBar>,
}

#[derive(Deserialize)]
struct RawBar {
    t: String,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

impl HttpBarProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client for bar provider")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn fetch_once(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: BarInterval,
    ) -> Result<FetchOutcome> {
        let url = format!("{}/bars", self.base_url);
        let start_param = start.format("%Y-%m-%d").to_string();
        let end_param = end.format("%Y-%m-%d").to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("start", start_param.as_str()),
                ("end", end_param.as_str()),
                ("interval", interval.as_str()),
            ])
            .send()
            .with_context(|| format!("Bar request for {} failed to send", symbol))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(FetchOutcome::Unknown),
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(anyhow!("Rate limited fetching bars for {}", symbol))
            }
            status if status.is_server_error() => {
                return Err(anyhow!(
                    "Bar endpoint returned {} for {}",
                    status,
                    symbol
                ))
            }
            status if !status.is_success() => {
                return Err(anyhow!(
                    "Unexpected status {} fetching bars for {}",
                    status,
                    symbol
                ))
            }
            _ => {}
        }

        let payload: BarsResponse = response
            .json()
            .with_context(|| format!("Invalid bar payload for {}", symbol))?;
        Ok(FetchOutcome::Bars(payload.bars))
    }
}

enum FetchOutcome {
    Bars(Vec<RawBar>),
    Unknown,
}

impl HistoricalDataProvider for HttpBarProvider {
    fn load(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: BarInterval,
    ) -> Result<Vec<PriceBar>> {
        let symbol_upper = symbol.trim().to_uppercase();
        let mut attempt = 1u32;

        let raw = loop {
            match self.fetch_once(&symbol_upper, start, end, interval) {
                Ok(FetchOutcome::Unknown) => return Ok(Vec::new()),
                Ok(FetchOutcome::Bars(raw)) => break raw,
                Err(err) if attempt >= MAX_ATTEMPTS => {
                    warn!(
                        "Giving up on bars for {} after {} attempts: {}",
                        symbol_upper, attempt, err
                    );
                    return Err(err);
                }
                Err(err) => {
                    let backoff = BASE_BACKOFF_MS * 2u64.pow(attempt - 1)
                        + fastrand::u64(0..BASE_BACKOFF_MS);
                    warn!(
                        "Attempt {}/{} fetching bars for {} failed: {}. Retrying in {}ms.",
                        attempt, MAX_ATTEMPTS, symbol_upper, err, backoff
                    );
                    thread::sleep(Duration::from_millis(backoff));
                    attempt += 1;
                }
            }
        };

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let timestamp = match parse_naive_timestamp(&entry.t) {
                Ok(value) => value,
                Err(err) => {
                    warn!("Skipping bar for {}: {}", symbol_upper, err);
                    continue;
                }
            };
            bars.push(PriceBar {
                symbol: symbol_upper.clone(),
                timestamp,
                open: entry.o,
                high: entry.h,
                low: entry.l,
                close: entry.c,
                volume: entry.v,
            });
        }

        Ok(normalize_bars(bars, start, end))
    }
}
