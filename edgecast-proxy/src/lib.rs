//! Outbound HTTP for the edge node: upstream stream relay, catalog sources
//! and the analytics collector sink.

pub mod catalog;
pub mod sink;
pub mod stream;

pub use catalog::HttpCatalogSource;
pub use sink::HttpAnalyticsSink;
pub use stream::{RelayBody, RelayedStream, UpstreamClient};
