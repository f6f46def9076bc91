//! Content-addressed cache for binary assets (SDKs, bundles, games, media)
//!
//! Assets live in memory under a fixed byte budget. Each one carries the
//! SHA-256 of its payload taken at insertion; verified reads recompute it and
//! refuse to serve bytes that no longer match. Eviction removes the
//! least-recently-touched assets first, where both insertion and every read
//! count as a touch.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Sdk,
    Bundle,
    Game,
    Media,
}

impl AssetType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sdk => "sdk",
            Self::Bundle => "bundle",
            Self::Game => "game",
            Self::Media => "media",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sdk" => Ok(Self::Sdk),
            "bundle" => Ok(Self::Bundle),
            "game" => Ok(Self::Game),
            "media" => Ok(Self::Media),
            other => Err(Error::Validation(format!("unknown asset type '{other}'"))),
        }
    }
}

/// Asset metadata as exposed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticAsset {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub size_bytes: u64,
    pub sha256: String,
    pub mime_type: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Input to [`AssetCache::add`]
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub id: String,
    pub name: String,
    pub asset_type: AssetType,
    pub bytes: Bytes,
    pub mime_type: String,
    pub version: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Result of recomputing an asset checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumReport {
    pub valid: bool,
    pub expected: String,
    pub actual: String,
}

/// A requested byte range, before it is checked against the asset size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-end`, inclusive
    Bounded { start: u64, end: u64 },
    /// `bytes=start-`
    From { start: u64 },
    /// `bytes=-len`, the last `len` bytes
    Suffix { len: u64 },
}

impl ByteRange {
    /// Parse a single-range `Range` header value
    pub fn parse(header: &str) -> Result<Self> {
        let ranges = header
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| Error::Validation(format!("unsupported range unit in '{header}'")))?;
        if ranges.contains(',') {
            return Err(Error::Validation("multiple ranges are not supported".to_string()));
        }
        let (start, end) = ranges
            .split_once('-')
            .ok_or_else(|| Error::Validation(format!("malformed range '{header}'")))?;

        let number = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| Error::Validation(format!("malformed range '{header}'")))
        };

        match (start.trim().is_empty(), end.trim().is_empty()) {
            (false, false) => Ok(Self::Bounded {
                start: number(start)?,
                end: number(end)?,
            }),
            (false, true) => Ok(Self::From {
                start: number(start)?,
            }),
            (true, false) => Ok(Self::Suffix { len: number(end)? }),
            (true, true) => Err(Error::Validation(format!("malformed range '{header}'"))),
        }
    }

    /// Inclusive `(start, end)` offsets within an object of `size` bytes.
    ///
    /// Out-of-bounds and inverted ranges are rejected, never clamped.
    pub fn resolve(self, size: u64) -> Result<(u64, u64)> {
        let (start, end) = match self {
            Self::Bounded { start, end } => (start, end),
            Self::From { start } => (start, size.saturating_sub(1)),
            Self::Suffix { len } => {
                if len == 0 || len > size {
                    return Err(Error::InvalidRange {
                        start: size.saturating_sub(len),
                        end: size.saturating_sub(1),
                        size,
                    });
                }
                (size - len, size - 1)
            }
        };

        if size == 0 || start > end || end >= size {
            return Err(Error::InvalidRange { start, end, size });
        }
        Ok((start, end))
    }
}

/// Bytes served by a verified read
#[derive(Debug, Clone)]
pub struct AssetRead {
    pub asset: StaticAsset,
    pub data: Bytes,
    /// Inclusive offsets when only part of the asset was requested
    pub range: Option<(u64, u64)>,
    pub total_size: u64,
}

impl AssetRead {
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.range.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCacheStats {
    pub asset_count: usize,
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub checksum_failures: u64,
}

struct StoredAsset {
    asset: StaticAsset,
    bytes: Bytes,
    /// Monotonic recency stamp, bumped together with `updated_at`
    touched: u64,
}

#[derive(Default)]
struct AssetStore {
    assets: HashMap<String, StoredAsset>,
    used_bytes: u64,
    next_touch: u64,
}

impl AssetStore {
    fn touch(&mut self) -> u64 {
        self.next_touch += 1;
        self.next_touch
    }

    fn remove(&mut self, id: &str) -> Option<StoredAsset> {
        let stored = self.assets.remove(id)?;
        self.used_bytes = self.used_bytes.saturating_sub(stored.asset.size_bytes);
        Some(stored)
    }

    fn least_recently_touched(&self) -> Option<String> {
        self.assets
            .iter()
            .min_by_key(|(_, stored)| stored.touched)
            .map(|(id, _)| id.clone())
    }
}

pub struct AssetCache {
    store: Mutex<AssetStore>,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    checksum_failures: AtomicU64,
}

/// Hex SHA-256 of a payload
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl AssetCache {
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            store: Mutex::new(AssetStore::default()),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
        }
    }

    /// Store an asset, evicting least-recently-touched assets until it fits.
    ///
    /// An asset larger than the whole budget fails with
    /// [`Error::InsufficientCacheSpace`] and leaves the cache untouched.
    /// Re-adding an existing id replaces it.
    pub fn add(&self, new: NewAsset) -> Result<StaticAsset> {
        if new.id.is_empty() {
            return Err(Error::Validation("asset id must not be empty".to_string()));
        }

        let size = new.bytes.len() as u64;
        if size > self.max_bytes {
            return Err(Error::InsufficientCacheSpace {
                required: size,
                capacity: self.max_bytes,
            });
        }

        let sha256 = sha256_hex(&new.bytes);
        let now = Utc::now();

        let mut store = self.store.lock();

        let created_at = store
            .remove(&new.id)
            .map_or(now, |previous| previous.asset.created_at);

        while store.used_bytes + size > self.max_bytes {
            let Some(victim) = store.least_recently_touched() else {
                break;
            };
            if let Some(evicted) = store.remove(&victim) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                crate::metrics::cache::CACHE_EVICTIONS
                    .with_label_values(&["asset"])
                    .inc();
                debug!(
                    asset_id = %victim,
                    freed = evicted.asset.size_bytes,
                    "Evicted asset to make room"
                );
            }
        }

        // Unreachable while size <= max_bytes, kept so the budget can never be exceeded
        if store.used_bytes + size > self.max_bytes {
            return Err(Error::InsufficientCacheSpace {
                required: size,
                capacity: self.max_bytes - store.used_bytes,
            });
        }

        let asset = StaticAsset {
            id: new.id.clone(),
            name: new.name,
            asset_type: new.asset_type,
            size_bytes: size,
            sha256,
            mime_type: new.mime_type,
            version: new.version,
            created_at,
            updated_at: now,
            metadata: new.metadata,
        };

        let touched = store.touch();
        store.used_bytes += size;
        store.assets.insert(
            new.id,
            StoredAsset {
                asset: asset.clone(),
                bytes: new.bytes,
                touched,
            },
        );

        info!(
            asset_id = %asset.id,
            size,
            used_bytes = store.used_bytes,
            "Asset cached"
        );
        Ok(asset)
    }

    /// Fetch an asset and mark it recently used
    pub fn get(&self, id: &str) -> Option<(StaticAsset, Bytes)> {
        let mut store = self.store.lock();
        let touched = store.touch();
        let Some(stored) = store.assets.get_mut(id) else {
            drop(store);
            self.misses.fetch_add(1, Ordering::Relaxed);
            crate::metrics::cache::CACHE_MISSES
                .with_label_values(&["asset"])
                .inc();
            return None;
        };

        stored.touched = touched;
        stored.asset.updated_at = Utc::now();
        let found = (stored.asset.clone(), stored.bytes.clone());
        drop(store);

        self.hits.fetch_add(1, Ordering::Relaxed);
        crate::metrics::cache::CACHE_HITS
            .with_label_values(&["asset"])
            .inc();
        Some(found)
    }

    /// Verified read, optionally restricted to a byte range.
    ///
    /// The checksum is recomputed before any byte is returned.
    pub fn read(&self, id: &str, range: Option<ByteRange>) -> Result<AssetRead> {
        let (asset, bytes) = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("asset '{id}'")))?;

        let actual = sha256_hex(&bytes);
        if actual != asset.sha256 {
            self.record_checksum_failure(id, &asset.sha256, &actual);
            return Err(Error::ChecksumMismatch {
                asset_id: id.to_string(),
                expected: asset.sha256,
                actual,
            });
        }

        let total_size = bytes.len() as u64;
        match range {
            None => Ok(AssetRead {
                asset,
                data: bytes,
                range: None,
                total_size,
            }),
            Some(range) => {
                let (start, end) = range.resolve(total_size)?;
                let data = bytes.slice(
                    usize::try_from(start).unwrap_or(usize::MAX)
                        ..=usize::try_from(end).unwrap_or(usize::MAX),
                );
                Ok(AssetRead {
                    asset,
                    data,
                    range: Some((start, end)),
                    total_size,
                })
            }
        }
    }

    /// Metadata only; does not count as a touch
    pub fn info(&self, id: &str) -> Option<StaticAsset> {
        self.store.lock().assets.get(id).map(|s| s.asset.clone())
    }

    /// Recompute the checksum of a cached asset. `None` if the id is unknown.
    pub fn verify_checksum(&self, id: &str) -> Option<ChecksumReport> {
        let (expected, bytes) = {
            let store = self.store.lock();
            let stored = store.assets.get(id)?;
            (stored.asset.sha256.clone(), stored.bytes.clone())
        };

        let actual = sha256_hex(&bytes);
        let valid = actual == expected;
        if !valid {
            self.record_checksum_failure(id, &expected, &actual);
        }
        Some(ChecksumReport {
            valid,
            expected,
            actual,
        })
    }

    fn record_checksum_failure(&self, id: &str, expected: &str, actual: &str) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
        crate::metrics::cache::CHECKSUM_FAILURES.inc();
        error!(asset_id = %id, expected, actual, "Asset checksum mismatch");
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.store.lock().remove(id).is_some();
        if removed {
            info!(asset_id = %id, "Asset removed");
        }
        removed
    }

    /// All assets, optionally of one type, ordered by id
    pub fn list(&self, asset_type: Option<AssetType>) -> Vec<StaticAsset> {
        let mut assets: Vec<StaticAsset> = self
            .store
            .lock()
            .assets
            .values()
            .filter(|s| asset_type.is_none_or(|t| s.asset.asset_type == t))
            .map(|s| s.asset.clone())
            .collect();
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        assets
    }

    #[must_use]
    pub fn stats(&self) -> AssetCacheStats {
        let (asset_count, used_bytes) = {
            let store = self.store.lock();
            (store.assets.len(), store.used_bytes)
        };
        AssetCacheStats {
            asset_count,
            used_bytes,
            max_bytes: self.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn corrupt(&self, id: &str) {
        let mut store = self.store.lock();
        if let Some(stored) = store.assets.get_mut(id) {
            let mut tampered = stored.bytes.to_vec();
            if let Some(first) = tampered.first_mut() {
                *first ^= 0xff;
            }
            stored.bytes = Bytes::from(tampered);
        }
    }
}
