//! Endpoint descriptors and their connection parameters

use crate::domain::{ConnectionId, EndpointHash, TransportError};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// TLS settings of a connection
///
/// Paths are empty when unset.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub insecure_skip_verify: bool,
    /// PEM bundle with additional trusted CA certificates
    pub ca_info: String,
    /// PEM client certificate
    pub cert: String,
    /// PEM private key of the client certificate
    pub cert_key: String,
    pub cert_key_password: String,
}

// The key password never reaches the logs
impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("ca_info", &self.ca_info)
            .field("cert", &self.cert)
            .field("cert_key", &self.cert_key)
            .field("cert_key_password", &if self.cert_key_password.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

/// Everything `initialize_connection` needs to register an endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSpec {
    pub url: String,
    pub endpoint_hash: EndpointHash,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub tls: TlsOptions,
}

impl EndpointSpec {
    #[must_use]
    pub fn new(url: impl Into<String>, endpoint_hash: EndpointHash) -> Self {
        Self {
            url: url.into(),
            endpoint_hash,
            content_type: String::new(),
            headers: Vec::new(),
            timeout: Duration::from_secs(10),
            max_retries: 1,
            retry_delay: Duration::ZERO,
            tls: TlsOptions::default(),
        }
    }
}

/// Parameters of one pooled connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// `scheme://host:port`
    pub origin: String,
    pub timeout: Duration,
    pub tls: TlsOptions,
}

/// A registered endpoint
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    url: String,
    connection_id: ConnectionId,
    origin: String,
    headers: Vec<(String, String)>,
    max_retries: usize,
    retry_delay: Duration,
}

impl HttpEndpoint {
    /// # Errors
    ///
    /// Returns `TransportError::InvalidUrl` when the URL cannot be parsed or
    /// has no host.
    pub fn new(spec: &EndpointSpec) -> Result<Self, TransportError> {
        let origin = origin_of(&spec.url)?;

        let mut headers = Vec::with_capacity(spec.headers.len() + 1);
        if !spec.content_type.is_empty() {
            headers.push(("Content-Type".to_string(), spec.content_type.clone()));
        }
        headers.extend(spec.headers.iter().cloned());

        Ok(Self {
            url: spec.url.clone(),
            connection_id: connection_id_for(&origin),
            origin,
            headers,
            max_retries: spec.max_retries,
            retry_delay: spec.retry_delay,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Request headers, `Content-Type` first when set
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    #[must_use]
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = delay;
    }
}

/// `scheme://host:port` of `url`, with the scheme's default port filled in
fn origin_of(url: &str) -> Result<String, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl { url: url.to_string(), reason: reason.to_string() };

    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = parsed.port_or_known_default().ok_or_else(|| invalid("missing port"))?;

    Ok(format!("{}://{}:{}", parsed.scheme(), host, port))
}

fn connection_id_for(origin: &str) -> ConnectionId {
    let mut hasher = DefaultHasher::new();
    origin.hash(&mut hasher);
    ConnectionId(hasher.finish())
}
