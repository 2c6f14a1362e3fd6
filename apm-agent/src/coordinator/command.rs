//! Commands sent from workers to the coordinator
//!
//! A command travels as a `bincode` envelope `{ command_type, body }`; the
//! body is decoded according to the tag, so a coordinator can skip commands
//! from newer workers that it does not know.

use crate::domain::{EndpointHash, ProtocolError};
use crate::transport::{EndpointSpec, TlsOptions};
use apm_agent_common::{COMMAND_ESTABLISH_CONNECTION, COMMAND_SEND_ENDPOINT_PAYLOAD};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstablishConnection {
    pub endpoint_url: String,
    pub endpoint_hash: EndpointHash,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub timeout_ms: u64,
    pub max_retries: u64,
    pub retry_delay_ms: u64,
    pub tls: TlsOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEndpointPayload {
    pub endpoint_hash: EndpointHash,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorCommand {
    EstablishConnection(EstablishConnection),
    SendEndpointPayload(SendEndpointPayload),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    command_type: u32,
    body: Vec<u8>,
}

impl CoordinatorCommand {
    #[must_use]
    pub fn command_type(&self) -> u32 {
        match self {
            CoordinatorCommand::EstablishConnection(_) => COMMAND_ESTABLISH_CONNECTION,
            CoordinatorCommand::SendEndpointPayload(_) => COMMAND_SEND_ENDPOINT_PAYLOAD,
        }
    }

    /// # Errors
    ///
    /// Returns `ProtocolError::Decode` when serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            CoordinatorCommand::EstablishConnection(command) => bincode::serialize(command)?,
            CoordinatorCommand::SendEndpointPayload(command) => bincode::serialize(command)?,
        };
        Ok(bincode::serialize(&Envelope { command_type: self.command_type(), body })?)
    }

    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownCommand` for a tag this build does not
    /// know, and `ProtocolError::MalformedEnvelope` when the envelope or the
    /// body cannot be decoded.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            bincode::deserialize(bytes).map_err(|e| ProtocolError::MalformedEnvelope(format!("envelope: {e}")))?;

        let malformed = |e: bincode::Error| ProtocolError::MalformedEnvelope(format!("command {}: {e}", envelope.command_type));
        match envelope.command_type {
            COMMAND_ESTABLISH_CONNECTION => {
                Ok(CoordinatorCommand::EstablishConnection(bincode::deserialize(&envelope.body).map_err(malformed)?))
            }
            COMMAND_SEND_ENDPOINT_PAYLOAD => {
                Ok(CoordinatorCommand::SendEndpointPayload(bincode::deserialize(&envelope.body).map_err(malformed)?))
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl From<&EndpointSpec> for EstablishConnection {
    fn from(spec: &EndpointSpec) -> Self {
        Self {
            endpoint_url: spec.url.clone(),
            endpoint_hash: spec.endpoint_hash,
            content_type: spec.content_type.clone(),
            headers: spec.headers.clone(),
            timeout_ms: millis(spec.timeout),
            max_retries: spec.max_retries as u64,
            retry_delay_ms: millis(spec.retry_delay),
            tls: spec.tls.clone(),
        }
    }
}

impl From<EstablishConnection> for EndpointSpec {
    fn from(command: EstablishConnection) -> Self {
        Self {
            url: command.endpoint_url,
            endpoint_hash: command.endpoint_hash,
            content_type: command.content_type,
            headers: command.headers,
            timeout: Duration::from_millis(command.timeout_ms),
            max_retries: usize::try_from(command.max_retries).unwrap_or(usize::MAX),
            retry_delay: Duration::from_millis(command.retry_delay_ms),
            tls: command.tls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn establish() -> EstablishConnection {
        let mut spec = EndpointSpec::new("https://collector:8200/v1/traces", EndpointHash(0xfeed));
        spec.content_type = "application/x-protobuf".into();
        spec.headers = vec![("Authorization".into(), "ApiKey k".into())];
        spec.max_retries = 3;
        spec.retry_delay = Duration::from_millis(250);
        spec.tls.cert_key_password = "secret".into();
        EstablishConnection::from(&spec)
    }

    #[test]
    fn test_establish_connection_survives_encoding() {
        let command = CoordinatorCommand::EstablishConnection(establish());
        let decoded = CoordinatorCommand::decode(&command.encode().unwrap()).unwrap();
        assert_eq!(decoded, command);

        let CoordinatorCommand::EstablishConnection(establish) = decoded else { panic!("wrong variant") };
        let spec = EndpointSpec::from(establish);
        assert_eq!(spec.retry_delay, Duration::from_millis(250));
        assert_eq!(spec.max_retries, 3);
        assert_eq!(spec.tls.cert_key_password, "secret");
    }

    #[test]
    fn test_unknown_command_type() {
        let bytes = bincode::serialize(&Envelope { command_type: 77, body: vec![1, 2, 3] }).unwrap();
        assert!(matches!(CoordinatorCommand::decode(&bytes), Err(ProtocolError::UnknownCommand(77))));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(CoordinatorCommand::decode(&[1, 2]), Err(ProtocolError::MalformedEnvelope(_))));

        let bytes =
            bincode::serialize(&Envelope { command_type: COMMAND_SEND_ENDPOINT_PAYLOAD, body: vec![9] }).unwrap();
        assert!(matches!(CoordinatorCommand::decode(&bytes), Err(ProtocolError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_command_type_tags() {
        let payload = CoordinatorCommand::SendEndpointPayload(SendEndpointPayload {
            endpoint_hash: EndpointHash(1),
            payload: vec![0; 8],
        });
        assert_eq!(payload.command_type(), COMMAND_SEND_ENDPOINT_PAYLOAD);
        assert_eq!(CoordinatorCommand::EstablishConnection(establish()).command_type(), COMMAND_ESTABLISH_CONNECTION);
    }
}
