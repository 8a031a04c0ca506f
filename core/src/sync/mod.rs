// Per-session causal synchronization

pub mod engine;
pub mod ordering;
pub mod resolver;

pub use engine::{SyncEngine, SyncError, SyncPhase, SyncStats};
pub use ordering::CausalBuffer;
pub use resolver::{ConflictResolver, ConflictWinner, ResolutionStrategy};
