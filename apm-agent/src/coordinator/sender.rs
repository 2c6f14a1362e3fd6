//! Worker-side transport that forwards everything to the coordinator

use super::chunked::ChunkedMessageProcessor;
use super::command::{CoordinatorCommand, EstablishConnection, SendEndpointPayload};
use crate::domain::{EndpointHash, TransportError};
use crate::transport::{EndpointSpec, HttpEndpoint, ResponseCallback, TelemetryTransport};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct CoordinatorTelemetrySender {
    processor: Arc<ChunkedMessageProcessor>,
}

impl CoordinatorTelemetrySender {
    #[must_use]
    pub fn new(processor: Arc<ChunkedMessageProcessor>) -> Self {
        Self { processor }
    }

    fn forward(&self, command: &CoordinatorCommand) -> bool {
        match command.encode() {
            Ok(bytes) => self.processor.send_payload(&bytes),
            Err(err) => {
                error!("[coordinator] Unable to encode command {}: {err}", command.command_type());
                false
            }
        }
    }
}

impl TelemetryTransport for CoordinatorTelemetrySender {
    /// The URL is validated here so a bad endpoint fails in the worker
    fn initialize_connection(&self, spec: &EndpointSpec) -> Result<(), TransportError> {
        HttpEndpoint::new(spec)?;

        let command = CoordinatorCommand::EstablishConnection(EstablishConnection::from(spec));
        if self.forward(&command) {
            Ok(())
        } else {
            warn!("[coordinator] Failed to send EstablishConnection for {}", spec.endpoint_hash);
            Err(TransportError::Forward("EstablishConnection"))
        }
    }

    fn enqueue(&self, endpoint_hash: EndpointHash, payload: &[u8], callback: Option<ResponseCallback>) -> bool {
        if callback.is_some() {
            debug!("[coordinator] Response callbacks are not forwarded, ignoring callback for {endpoint_hash}");
        }

        let command = CoordinatorCommand::SendEndpointPayload(SendEndpointPayload {
            endpoint_hash,
            payload: payload.to_vec(),
        });
        let sent = self.forward(&command);
        if !sent {
            warn!("[coordinator] Dropping payload for {endpoint_hash}, {} bytes", payload.len());
        }
        sent
    }

    fn update_retry_delay(&self, endpoint_hash: EndpointHash, _delay: Duration) {
        trace!("[coordinator] Retry delay of {endpoint_hash} is managed by the coordinator");
    }
}
