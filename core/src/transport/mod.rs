// Pluggable transport layer — one logical connection to a relay

pub mod abstraction;
pub mod circuit;
pub mod memory;
pub mod ws;

pub use abstraction::{Connector, Link, LinkCounters, LinkState, LinkStats, TransportError};
pub use circuit::{CircuitBreaker, CircuitState};
pub use memory::{MemoryConnector, MemoryRelay};
pub use ws::WsConnector;
