//! HTTP surface of the edgecast edge node

pub mod http;

pub use http::{create_router, AppState};
