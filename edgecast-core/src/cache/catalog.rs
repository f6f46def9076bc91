//! TTL cache for catalog listings (radio, TV and app directories)
//!
//! Listings are expensive to build upstream and read constantly, so each
//! catalog type holds one serialized payload with an expiry and an ETag.
//! Expired entries are treated as misses and dropped on the read that finds them.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::singleflight::{SingleFlight, SingleFlightError};
use crate::{Error, Result};

/// Catalogs served from cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogType {
    Radio,
    Tv,
    Apps,
}

impl CatalogType {
    pub const ALL: [Self; 3] = [Self::Radio, Self::Tv, Self::Apps];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Radio => "radio",
            Self::Tv => "tv",
            Self::Apps => "apps",
        }
    }

    const fn slot(self) -> usize {
        match self {
            Self::Radio => 0,
            Self::Tv => 1,
            Self::Apps => 2,
        }
    }
}

impl fmt::Display for CatalogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "radio" => Ok(Self::Radio),
            "tv" => Ok(Self::Tv),
            "apps" => Ok(Self::Apps),
            other => Err(Error::Validation(format!("unknown catalog type '{other}'"))),
        }
    }
}

/// A cached value with its freshness metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub etag: String,
    pub size_bytes: u64,
}

impl<T> CacheEntry<T> {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn age_seconds(&self, now: DateTime<Utc>) -> u64 {
        (now - self.cached_at).num_seconds().max(0).unsigned_abs()
    }

    #[must_use]
    pub fn remaining_ttl_seconds(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0).unsigned_abs()
    }
}

/// Snapshot of the continuously maintained counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
    pub entries: usize,
}

pub struct CatalogCache {
    entries: RwLock<HashMap<CatalogType, CacheEntry<Bytes>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    etag_seq: AtomicU64,
    /// Bumped on every invalidation, under the entries write lock
    generations: [AtomicU64; 3],
}

impl CatalogCache {
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            etag_seq: AtomicU64::new(0),
            generations: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    pub fn get(&self, kind: CatalogType) -> Option<CacheEntry<Bytes>> {
        self.get_at(kind, Utc::now())
    }

    pub fn get_at(&self, kind: CatalogType, now: DateTime<Utc>) -> Option<CacheEntry<Bytes>> {
        let found = {
            let entries = self.entries.read();
            entries.get(&kind).map(|entry| {
                if entry.is_expired_at(now) {
                    None
                } else {
                    Some(entry.clone())
                }
            })
        };

        match found {
            Some(Some(entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::cache::CACHE_HITS
                    .with_label_values(&["catalog"])
                    .inc();
                Some(entry)
            }
            Some(None) => {
                // Expired: evict lazily, unless a fresh set raced in meanwhile
                let mut entries = self.entries.write();
                if entries.get(&kind).is_some_and(|e| e.is_expired_at(now)) {
                    entries.remove(&kind);
                    debug!(catalog = %kind, "Evicted expired catalog entry");
                }
                self.record_miss();
                None
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::cache::CACHE_MISSES
            .with_label_values(&["catalog"])
            .inc();
    }

    /// Serialize and store a catalog payload. `ttl` falls back to the default.
    pub fn set<T: Serialize>(
        &self,
        kind: CatalogType,
        data: &T,
        ttl: Option<Duration>,
    ) -> Result<CacheEntry<Bytes>> {
        let body = Bytes::from(serde_json::to_vec(data)?);
        Ok(self.set_bytes_at(kind, body, ttl, Utc::now()))
    }

    /// Store an already serialized payload
    pub fn set_bytes_at(
        &self,
        kind: CatalogType,
        body: Bytes,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> CacheEntry<Bytes> {
        let entry = self.build_entry(body, ttl, now);
        self.entries.write().insert(kind, entry.clone());
        debug!(catalog = %kind, size = entry.size_bytes, etag = %entry.etag, "Catalog cached");
        entry
    }

    /// Current invalidation generation of `kind`
    #[must_use]
    pub fn generation(&self, kind: CatalogType) -> u64 {
        self.generations[kind.slot()].load(Ordering::Acquire)
    }

    /// Store a payload built while `kind` was at `generation`.
    ///
    /// If `kind` was invalidated since, the entry is returned but not stored.
    pub fn set_if_current<T: Serialize>(
        &self,
        kind: CatalogType,
        data: &T,
        generation: u64,
    ) -> Result<CacheEntry<Bytes>> {
        let body = Bytes::from(serde_json::to_vec(data)?);
        let entry = self.build_entry(body, None, Utc::now());

        let mut entries = self.entries.write();
        if self.generation(kind) != generation {
            drop(entries);
            debug!(catalog = %kind, "Catalog invalidated during rebuild, not caching");
            return Ok(entry);
        }
        entries.insert(kind, entry.clone());
        drop(entries);

        debug!(catalog = %kind, size = entry.size_bytes, etag = %entry.etag, "Catalog cached");
        Ok(entry)
    }

    fn build_entry(
        &self,
        body: Bytes,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> CacheEntry<Bytes> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        CacheEntry {
            etag: self.compute_etag(&body, now),
            size_bytes: body.len() as u64,
            data: body,
            cached_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// ETag over the payload salted with the store time, so every set yields a new tag
    fn compute_etag(&self, body: &[u8], now: DateTime<Utc>) -> String {
        let seq = self.etag_seq.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(body);
        hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
        hasher.update(seq.to_be_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("\"{}\"", &digest[..32])
    }

    pub fn invalidate(&self, kind: CatalogType) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            self.generations[kind.slot()].fetch_add(1, Ordering::AcqRel);
            entries.remove(&kind).is_some()
        };
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            info!(catalog = %kind, "Catalog invalidated");
        }
        removed
    }

    pub fn invalidate_all(&self) -> usize {
        let count = {
            let mut entries = self.entries.write();
            for generation in &self.generations {
                generation.fetch_add(1, Ordering::AcqRel);
            }
            let count = entries.len();
            entries.clear();
            count
        };
        self.invalidations
            .fetch_add(count as u64, Ordering::Relaxed);
        info!(count, "All catalogs invalidated");
        count
    }

    #[must_use]
    pub fn stats(&self) -> CatalogCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CatalogCacheStats {
            hits,
            misses,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entries: self.entries.read().len(),
        }
    }
}

/// Whether an `If-None-Match` header value matches `etag`
#[must_use]
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let bare = |tag: &str| tag.trim().trim_start_matches("W/").to_string();
    let etag = bare(etag);
    if_none_match
        .split(',')
        .map(bare)
        .any(|candidate| candidate == "*" || candidate == etag)
}

/// Builds a catalog payload from its upstream directory
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn build(&self, kind: CatalogType) -> Result<serde_json::Value>;
}

/// Whether a response was served from cache or rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

/// Read-through access to the catalog cache
pub struct CatalogLoader {
    cache: Arc<CatalogCache>,
    source: Arc<dyn CatalogSource>,
    flights: SingleFlight<CatalogType, CacheEntry<Bytes>, Arc<Error>>,
}

impl CatalogLoader {
    pub fn new(cache: Arc<CatalogCache>, source: Arc<dyn CatalogSource>) -> Self {
        Self {
            cache,
            source,
            flights: SingleFlight::new(),
        }
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<CatalogCache> {
        &self.cache
    }

    /// Return the cached catalog, rebuilding it once on a miss
    pub async fn load(&self, kind: CatalogType) -> Result<(CacheEntry<Bytes>, CacheStatus)> {
        if let Some(entry) = self.cache.get(kind) {
            return Ok((entry, CacheStatus::Hit));
        }

        let cache = Arc::clone(&self.cache);
        let source = Arc::clone(&self.source);
        let entry = self
            .flights
            .do_work(kind, async move {
                let generation = cache.generation(kind);
                let data = source.build(kind).await.map_err(Arc::new)?;
                cache.set_if_current(kind, &data, generation).map_err(Arc::new)
            })
            .await
            .map_err(|e| match e {
                SingleFlightError::Inner(err) => Arc::try_unwrap(err)
                    .unwrap_or_else(|shared| Error::UpstreamUnavailable(shared.to_string())),
                SingleFlightError::WorkerFailed => {
                    Error::Internal(format!("catalog rebuild for {kind} was abandoned"))
                }
            })?;

        Ok((entry, CacheStatus::Miss))
    }
}
