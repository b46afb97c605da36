use crate::config::BarInterval;
use crate::data::{business_days_between, HistoricalDataProvider};
use crate::models::PriceBar;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CACHE_FILE_VERSION: u32 = 1;

/// Fraction of the requested business days a cached series must cover
/// before it is trusted. Below this the entry is treated as a miss and the
/// window is refetched.
pub const CACHE_COMPLETENESS_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub interval: BarInterval,
}

impl CacheKey {
    pub fn new(symbol: &str, start: NaiveDate, end: NaiveDate, interval: BarInterval) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            start,
            end,
            interval,
        }
    }

    fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.symbol,
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d"),
            self.interval.as_str()
        )
    }
}

/// Narrow side-cache contract: a `None` from `get` means miss, and `put`
/// failures are logged by callers rather than failing the run.
pub trait BarCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Vec<PriceBar>>;
    fn put(&self, key: &CacheKey, bars: &[PriceBar]) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct CachedSeries {
    version: u32,
    bars: Vec<PriceBar>,
}

/// One bincode file per (symbol, window, interval) under a cache directory.
pub struct FileBarCache {
    root: PathBuf,
}

impl FileBarCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.bin", key.file_stem()))
    }
}

impl BarCache for FileBarCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<PriceBar>> {
        let path = self.path_for(key);
        if !path.exists() {
            return None;
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!("Failed to open cache file {}: {}", path.display(), err);
                return None;
            }
        };

        match bincode::deserialize_from::<_, CachedSeries>(BufReader::new(file)) {
            Ok(series) if series.version == CACHE_FILE_VERSION => Some(series.bars),
            Ok(series) => {
                warn!(
                    "Ignoring cache file {} with stale version {}",
                    path.display(),
                    series.version
                );
                None
            }
            Err(err) => {
                warn!("Discarding unreadable cache file {}: {}", path.display(), err);
                None
            }
        }
    }

    fn put(&self, key: &CacheKey, bars: &[PriceBar]) -> Result<()> {
        let path = self.path_for(key);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create cache file {}", path.display()))?;
        let series = CachedSeries {
            version: CACHE_FILE_VERSION,
            bars: bars.to_vec(),
        };
        bincode::serialize_into(BufWriter::new(file), &series)
            .with_context(|| format!("Failed to write cache file {}", path.display()))
    }
}

/// Process-local cache used by tests and sweeps.
#[derive(Default)]
pub struct MemoryBarCache {
    entries: Mutex<std::collections::HashMap<CacheKey, Vec<PriceBar>>>,
}

impl BarCache for MemoryBarCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<PriceBar>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    fn put(&self, key: &CacheKey, bars: &[PriceBar]) -> Result<()> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.clone(), bars.to_vec());
        }
        Ok(())
    }
}

/// Decorates any provider with the side-cache. The cache never changes what
/// a load returns, only whether the inner provider is consulted; caching
/// stays out of the provider's core logic so the core remains testable
/// without persistence.
pub struct CachedProvider<P: HistoricalDataProvider, C: BarCache> {
    inner: P,
    cache: C,
}

impl<P: HistoricalDataProvider, C: BarCache> CachedProvider<P, C> {
    pub fn new(inner: P, cache: C) -> Self {
        Self { inner, cache }
    }

    fn expected_bars(key: &CacheKey) -> usize {
        let business_days = business_days_between(key.start, key.end);
        match key.interval {
            BarInterval::Daily => business_days,
            // One bar per trading week.
            BarInterval::Weekly => (business_days + 4) / 5,
        }
    }

    fn hit_is_complete(key: &CacheKey, bars: &[PriceBar]) -> bool {
        let expected = Self::expected_bars(key);
        if expected == 0 {
            return true;
        }
        let coverage = bars.len() as f64 / expected as f64;
        coverage >= CACHE_COMPLETENESS_THRESHOLD
    }
}

impl<P: HistoricalDataProvider, C: BarCache> HistoricalDataProvider for CachedProvider<P, C> {
    fn load(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: BarInterval,
    ) -> Result<Vec<PriceBar>> {
        let key = CacheKey::new(symbol, start, end, interval);

        if let Some(bars) = self.cache.get(&key) {
            if Self::hit_is_complete(&key, &bars) {
                return Ok(bars);
            }
            info!(
                "Cache entry for {} covers only {} bars; refetching",
                key.symbol,
                bars.len()
            );
        }

        let bars = self.inner.load(symbol, start, end, interval)?;
        if !bars.is_empty() {
            if let Err(err) = self.cache.put(&key, &bars) {
                warn!("Failed to cache bars for {}: {}", key.symbol, err);
            }
        }
        Ok(bars)
    }
}
