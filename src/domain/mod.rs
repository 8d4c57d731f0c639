//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - The registry of reachable endpoints
//! - Destination resolution for routed requests

pub mod registry;
pub mod routing;

pub use registry::{InMemoryRegistry, Registry};
pub use routing::DestinationResolver;
