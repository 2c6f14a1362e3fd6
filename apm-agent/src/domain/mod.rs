//! Domain model for the agent
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{name_hash, ConnectionId, EndpointHash, FunctionKey, MessageId, Pid};

pub use errors::{Bailout, ConfigError, CoordinatorError, HookError, ProtocolError, TransportError};
