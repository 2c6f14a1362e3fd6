//! Endpoint registry and connection pool
//!
//! Endpoints are keyed by their [`EndpointHash`]; endpoints sharing scheme,
//! host and port share one pooled connection. Connections are created lazily
//! on first use and dropped before a fork.

use super::connection::ConnectionFactory;
use super::endpoint::{ConnectionOptions, EndpointSpec, HttpEndpoint};
use crate::domain::{ConnectionId, EndpointHash, TransportError};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct PooledConnection<C> {
    options: ConnectionOptions,
    connection: Option<Arc<C>>,
}

/// What the sender needs to deliver one payload
pub struct SendTarget<C> {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub connection_id: ConnectionId,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub connection: Arc<C>,
}

pub struct HttpEndpoints<C> {
    endpoints: HashMap<EndpointHash, HttpEndpoint>,
    connections: HashMap<ConnectionId, PooledConnection<C>>,
}

impl<C> Default for HttpEndpoints<C> {
    fn default() -> Self {
        Self { endpoints: HashMap::new(), connections: HashMap::new() }
    }
}

impl<C> HttpEndpoints<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the endpoint described by `spec`
    ///
    /// The first endpoint registered on an origin decides that connection's
    /// timeout and TLS options.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidUrl` for an unusable URL; nothing is
    /// registered in that case.
    pub fn add(&mut self, spec: &EndpointSpec) -> Result<ConnectionId, TransportError> {
        let endpoint = HttpEndpoint::new(spec)?;
        let connection_id = endpoint.connection_id();

        self.connections.entry(connection_id).or_insert_with(|| {
            trace!("[transport] New connection {connection_id} for {}", endpoint.origin());
            PooledConnection {
                options: ConnectionOptions {
                    origin: endpoint.origin().to_string(),
                    timeout: spec.timeout,
                    tls: spec.tls.clone(),
                },
                connection: None,
            }
        });
        self.endpoints.insert(spec.endpoint_hash, endpoint);
        Ok(connection_id)
    }

    #[must_use]
    pub fn get(&self, endpoint_hash: EndpointHash) -> Option<&HttpEndpoint> {
        self.endpoints.get(&endpoint_hash)
    }

    /// Returns `false` when the endpoint is unknown
    pub fn update_retry_delay(&mut self, endpoint_hash: EndpointHash, delay: Duration) -> bool {
        match self.endpoints.get_mut(&endpoint_hash) {
            Some(endpoint) => {
                endpoint.set_retry_delay(delay);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop every live connection; they are recreated on next use
    pub fn disconnect_all(&mut self) {
        for pooled in self.connections.values_mut() {
            pooled.connection = None;
        }
    }

    /// Resolve an endpoint to a ready connection, connecting if needed
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownEndpoint` for an unregistered hash, or
    /// the factory's error when the connection cannot be created.
    pub fn target<F>(&mut self, endpoint_hash: EndpointHash, factory: &F) -> Result<SendTarget<C>, TransportError>
    where
        F: ConnectionFactory<Connection = C>,
    {
        let endpoint = self.endpoints.get(&endpoint_hash).ok_or(TransportError::UnknownEndpoint(endpoint_hash))?;
        let connection_id = endpoint.connection_id();
        let pooled = self
            .connections
            .get_mut(&connection_id)
            .ok_or(TransportError::UnknownEndpoint(endpoint_hash))?;

        let connection = match &pooled.connection {
            Some(connection) => Arc::clone(connection),
            None => {
                debug!("[transport] Connecting {connection_id} to {}", pooled.options.origin);
                let connection = Arc::new(factory.connect(&pooled.options)?);
                pooled.connection = Some(Arc::clone(&connection));
                connection
            }
        };

        Ok(SendTarget {
            url: endpoint.url().to_string(),
            headers: endpoint.headers().to_vec(),
            connection_id,
            max_retries: endpoint.max_retries(),
            retry_delay: endpoint.retry_delay(),
            connection,
        })
    }
}
