pub mod asset;
pub mod catalog;
pub mod singleflight;

pub use asset::{
    AssetCache, AssetCacheStats, AssetRead, AssetType, ByteRange, ChecksumReport, NewAsset,
    StaticAsset,
};
pub use catalog::{
    etag_matches, CacheEntry, CacheStatus, CatalogCache, CatalogCacheStats, CatalogLoader,
    CatalogSource, CatalogType,
};
pub use singleflight::{SingleFlight, SingleFlightError};
