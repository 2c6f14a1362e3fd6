//! Executes reassembled worker commands against the coordinator's transport

use super::command::CoordinatorCommand;
use crate::domain::ProtocolError;
use crate::transport::{EndpointSpec, TelemetryTransport};
use log::{debug, error, warn};
use std::sync::Arc;

pub struct MessageDispatcher {
    transport: Arc<dyn TelemetryTransport>,
}

impl MessageDispatcher {
    #[must_use]
    pub fn new(transport: Arc<dyn TelemetryTransport>) -> Self {
        Self { transport }
    }

    /// Decode one message and apply it; failures are logged, never returned
    pub fn process_received_message(&self, message: &[u8]) {
        match CoordinatorCommand::decode(message) {
            Ok(CoordinatorCommand::EstablishConnection(command)) => {
                debug!(
                    "[coordinator] EstablishConnection {} {} content type '{}' {} headers timeout {}ms retries {} retry delay {}ms tls {:?}",
                    command.endpoint_url,
                    command.endpoint_hash,
                    command.content_type,
                    command.headers.len(),
                    command.timeout_ms,
                    command.max_retries,
                    command.retry_delay_ms,
                    command.tls
                );
                let spec = EndpointSpec::from(command);
                if let Err(err) = self.transport.initialize_connection(&spec) {
                    error!("[coordinator] Unable to establish connection for {}: {err}", spec.endpoint_hash);
                }
            }
            Ok(CoordinatorCommand::SendEndpointPayload(command)) => {
                debug!("[coordinator] SendEndpointPayload {} {} bytes", command.endpoint_hash, command.payload.len());
                self.transport.enqueue(command.endpoint_hash, &command.payload, None);
            }
            Err(ProtocolError::UnknownCommand(command_type)) => {
                warn!("[coordinator] Ignoring unknown command type {command_type}");
            }
            Err(err) => error!("[coordinator] {err}"),
        }
    }
}
