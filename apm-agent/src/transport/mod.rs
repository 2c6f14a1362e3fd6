//! Telemetry delivery to collector endpoints
//!
//! [`AsyncHttpTransport`] owns the queue, the sender thread and the pooled
//! connections. Worker processes that delegate delivery to the coordinator
//! use `coordinator::CoordinatorTelemetrySender` instead; both implement
//! [`TelemetryTransport`] so producers do not care which one they hold.

pub mod async_transport;
pub mod connection;
pub mod endpoint;
pub mod pool;
pub mod tls;

use crate::domain::{EndpointHash, TransportError};
use std::time::Duration;

pub use async_transport::AsyncHttpTransport;
pub use connection::{Connection, ConnectionFactory, HttpRequest, HttpResponse, ReqwestConnector};
pub use endpoint::{ConnectionOptions, EndpointSpec, HttpEndpoint, TlsOptions};
pub use pool::HttpEndpoints;

/// Called with the status code and body of the final response
pub type ResponseCallback = Box<dyn FnOnce(u16, &[u8]) + Send>;

pub trait TelemetryTransport: Send + Sync {
    /// Register or update the endpoint `spec.endpoint_hash`
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint cannot be registered.
    fn initialize_connection(&self, spec: &EndpointSpec) -> Result<(), TransportError>;

    /// Queue a payload for delivery; never blocks, returns `false` when dropped
    fn enqueue(&self, endpoint_hash: EndpointHash, payload: &[u8], callback: Option<ResponseCallback>) -> bool;

    fn update_retry_delay(&self, endpoint_hash: EndpointHash, delay: Duration);
}
