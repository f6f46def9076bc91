//! Media relay registry for the edgecast edge node
//!
//! Tracks a fleet of TURN relays grouped by region, picks the best relay for a
//! new peer session and mints stateless, time-limited TURN credentials.

pub mod credentials;
pub mod node;
pub mod probe;
pub mod registry;
pub mod types;

pub use credentials::{verify_credentials, TurnCredentialService, TurnCredentials};
pub use node::{RelayNode, RelayNodeInfo};
pub use probe::{NodeProbe, TcpProbe};
pub use registry::{
    Allocation, CredentialTarget, IceServer, RegionMetrics, RelayAggregateMetrics,
    RelayConnection, RelayRegistry,
};
pub use types::{ConnectionId, NodeId};
