//! Prometheus metrics for the edge node
//!
//! Every metric registers against [`REGISTRY`], which `GET /metrics` renders.

use prometheus::{
    register_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, CounterVec, Encoder, IntCounter, IntGauge, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Admission control
pub mod admission {
    use super::{register_counter_vec_with_registry, CounterVec, REGISTRY};

    /// Requests rejected by the admission controller, by route class
    pub static REJECTED: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "admission_rejected_total",
            "Requests rejected by the rate limiter",
            &["class"],
            REGISTRY.clone()
        )
        .expect("Failed to register admission REJECTED")
    });
}

/// Catalog and asset caches
pub mod cache {
    use super::{
        register_counter_vec_with_registry, register_int_counter_with_registry, CounterVec,
        IntCounter, REGISTRY,
    };

    /// Cache hit counter
    pub static CACHE_HITS: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "cache_hits_total",
            "Total number of cache hits",
            &["cache_type"],
            REGISTRY.clone()
        )
        .expect("Failed to register CACHE_HITS")
    });

    /// Cache miss counter
    pub static CACHE_MISSES: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "cache_misses_total",
            "Total number of cache misses",
            &["cache_type"],
            REGISTRY.clone()
        )
        .expect("Failed to register CACHE_MISSES")
    });

    /// Cache evictions counter
    pub static CACHE_EVICTIONS: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "cache_evictions_total",
            "Total number of cache evictions",
            &["cache_type"],
            REGISTRY.clone()
        )
        .expect("Failed to register CACHE_EVICTIONS")
    });

    /// Asset reads whose recomputed checksum did not match
    pub static CHECKSUM_FAILURES: std::sync::LazyLock<IntCounter> =
        std::sync::LazyLock::new(|| {
            register_int_counter_with_registry!(
                "asset_checksum_failures_total",
                "Asset checksum verification failures",
                REGISTRY.clone()
            )
            .expect("Failed to register CHECKSUM_FAILURES")
        });
}

/// Stream proxy accounting
pub mod streams {
    use super::{
        register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter,
        IntGauge, REGISTRY,
    };

    pub static ACTIVE_STREAMS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "active_streams",
            "Streams currently relayed by this node",
            REGISTRY.clone()
        )
        .expect("Failed to register ACTIVE_STREAMS")
    });

    pub static BYTES_RELAYED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "stream_bytes_relayed_total",
            "Bytes relayed from upstream sources to clients",
            REGISTRY.clone()
        )
        .expect("Failed to register BYTES_RELAYED")
    });

    pub static STALE_PRUNED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "streams_stale_pruned_total",
            "Streams removed by the staleness sweep",
            REGISTRY.clone()
        )
        .expect("Failed to register STALE_PRUNED")
    });
}

/// Media relay registry
pub mod relay {
    use super::{register_counter_vec_with_registry, CounterVec, REGISTRY};

    /// Allocation outcomes ("allocated", "exhausted")
    pub static ALLOCATIONS: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "relay_allocations_total",
            "Relay allocation attempts by outcome",
            &["outcome"],
            REGISTRY.clone()
        )
        .expect("Failed to register relay ALLOCATIONS")
    });
}

/// Analytics ingestion
pub mod analytics {
    use super::{register_int_counter_with_registry, IntCounter, REGISTRY};

    pub static EVENTS_INGESTED: std::sync::LazyLock<IntCounter> =
        std::sync::LazyLock::new(|| {
            register_int_counter_with_registry!(
                "analytics_events_ingested_total",
                "Analytics events accepted into the buffer",
                REGISTRY.clone()
            )
            .expect("Failed to register EVENTS_INGESTED")
        });

    pub static EVENTS_FLUSHED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "analytics_events_flushed_total",
            "Analytics events handed to the sink",
            REGISTRY.clone()
        )
        .expect("Failed to register EVENTS_FLUSHED")
    });
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
