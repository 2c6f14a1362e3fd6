//! Coordinator process and the worker ↔ coordinator protocol
//!
//! Workers hand telemetry to a single forked coordinator that owns the real
//! connections. Messages are encoded as [`CoordinatorCommand`] envelopes, split
//! into fixed-size frames by [`ChunkedMessageProcessor`] and carried by a
//! [`MessageChannel`].

pub mod channel;
pub mod chunked;
pub mod command;
pub mod dispatcher;
pub mod process;
pub mod sender;

pub use channel::{DatagramChannel, InProcessChannel, MessageChannel};
pub use chunked::ChunkedMessageProcessor;
pub use command::{CoordinatorCommand, EstablishConnection, SendEndpointPayload};
pub use dispatcher::MessageDispatcher;
pub use process::{ConfigurationFetcher, CoordinatorProcess, CoordinatorRole, NoopConfigurationFetcher};
pub use sender::CoordinatorTelemetrySender;
