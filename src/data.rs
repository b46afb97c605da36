use crate::config::BarInterval;
use crate::models::PriceBar;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Weekday};
use log::warn;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Source of historical bars. Implementations must return an empty series
/// (not an error) for unknown or delisted symbols so multi-symbol runs can
/// exclude them gracefully, and must pass everything through
/// [`normalize_bars`] before returning.
pub trait HistoricalDataProvider: Send + Sync {
    fn load(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: BarInterval,
    ) -> Result<Vec<PriceBar>>;
}

/// Normalizes a freshly ingested series: drops rows with non-finite or
/// non-positive prices, restricts to the requested window, sorts by
/// timestamp and removes duplicate timestamps (first occurrence wins).
///
/// Timezone stripping happens before this point, when raw rows are parsed
/// into `NaiveDateTime`; by the time bars exist they cannot carry an offset.
pub fn normalize_bars(
    mut bars: Vec<PriceBar>,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<PriceBar> {
    let window_start = start.and_hms_opt(0, 0, 0).expect("valid midnight");
    let window_end = end.and_hms_opt(23, 59, 59).expect("valid end of day");

    bars.retain(|bar| {
        let finite = [bar.open, bar.high, bar.low, bar.close]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
            && bar.volume.is_finite()
            && bar.volume >= 0.0;
        finite && bar.timestamp >= window_start && bar.timestamp <= window_end
    });
    bars.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    bars.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);
    bars
}

/// Parses a raw timestamp cell, accepting RFC 3339 (offset is stripped),
/// `YYYY-MM-DD HH:MM:SS` and bare `YYYY-MM-DD` forms.
pub fn parse_naive_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let trimmed = raw.trim();

    if let Ok(with_offset) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(with_offset.naive_utc());
    }
    if let Ok(datetime) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Ok(datetime);
    }
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .with_context(|| format!("Unparseable bar timestamp '{}'", trimmed))?;
    Ok(date.and_hms_opt(0, 0, 0).expect("valid midnight"))
}

/// Number of Monday-to-Friday days in the window, used as the denominator of
/// cache completeness checks. Ignores exchange holidays on purpose; the
/// completeness threshold leaves room for them.
pub fn business_days_between(start: NaiveDate, end: NaiveDate) -> usize {
    let mut count = 0usize;
    let mut day = start;
    while day <= end {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            count += 1;
        }
        day = day.succ_opt().expect("date overflow");
    }
    count
}

/// Reads per-symbol CSV files (`<SYMBOL>.csv`) from a data directory. Header
/// row and column order follow the usual export shape:
/// `timestamp,open,high,low,close,volume`.
pub struct CsvDataProvider {
    root: PathBuf,
}

impl CsvDataProvider {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn file_for(&self, symbol: &str) -> PathBuf {
        self.root.join(format!("{}.csv", symbol.trim().to_uppercase()))
    }
}

impl HistoricalDataProvider for CsvDataProvider {
    fn load(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        _interval: BarInterval,
    ) -> Result<Vec<PriceBar>> {
        let path = self.file_for(symbol);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .with_context(|| format!("Failed to open bar file {}", path.display()))?;
        let reader = BufReader::new(file);
        let symbol_upper = symbol.trim().to_uppercase();

        let mut bars = Vec::new();
        for (line_number, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || (line_number == 0 && trimmed.to_lowercase().contains("open")) {
                continue;
            }

            let fields: Vec<&str> = trimmed.split(',').collect();
            if fields.len() < 6 {
                warn!(
                    "Skipping malformed row {} in {} ({} columns)",
                    line_number + 1,
                    path.display(),
                    fields.len()
                );
                continue;
            }

            let timestamp = match parse_naive_timestamp(fields[0]) {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        "Skipping row {} in {}: {}",
                        line_number + 1,
                        path.display(),
                        err
                    );
                    continue;
                }
            };

            let mut numbers = [0.0f64; 5];
            let mut parsed = true;
            for (slot, raw) in numbers.iter_mut().zip(fields[1..6].iter()) {
                match raw.trim().parse::<f64>() {
                    Ok(value) => *slot = value,
                    Err(_) => {
                        parsed = false;
                        break;
                    }
                }
            }
            if !parsed {
                warn!(
                    "Skipping row {} in {}: non-numeric price fields",
                    line_number + 1,
                    path.display()
                );
                continue;
            }

            bars.push(PriceBar {
                symbol: symbol_upper.clone(),
                timestamp,
                open: numbers[0],
                high: numbers[1],
                low: numbers[2],
                close: numbers[3],
                volume: numbers[4],
            });
        }

        Ok(normalize_bars(bars, start, end))
    }
}

/// Fixed in-memory series, used by tests and the sweep runner to avoid any
/// I/O inside worker threads.
pub struct InMemoryDataProvider {
    series: HashMap<String, Vec<PriceBar>>,
}

impl InMemoryDataProvider {
    pub fn new(series: HashMap<String, Vec<PriceBar>>) -> Self {
        Self { series }
    }
}

impl HistoricalDataProvider for InMemoryDataProvider {
    fn load(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        _interval: BarInterval,
    ) -> Result<Vec<PriceBar>> {
        let bars = self
            .series
            .get(&symbol.trim().to_uppercase())
            .cloned()
            .unwrap_or_default();
        Ok(normalize_bars(bars, start, end))
    }
}
