//! Outbound HTTP connections
//!
//! The transport talks to the network only through [`Connection`], created by
//! a [`ConnectionFactory`]. Production uses [`ReqwestConnector`]; tests plug
//! in scripted connections.

use super::endpoint::ConnectionOptions;
use super::tls;
use crate::domain::TransportError;
use log::debug;
use reqwest::header::RETRY_AFTER;
use std::time::Duration;

/// One POST request
#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    pub url: &'a str,
    pub headers: &'a [(String, String)],
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Delta-seconds `Retry-After` header, when the server sent one
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self { status, ..Self::default() }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Client and server errors other than 408 and 429 are not retried
    #[must_use]
    pub fn is_terminal_failure(&self) -> bool {
        (400..600).contains(&self.status) && self.status != 408 && self.status != 429
    }
}

pub trait Connection: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when no HTTP response was received.
    fn post(&self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError>;
}

pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection + 'static;

    /// # Errors
    ///
    /// Returns an error when the connection cannot be configured.
    fn connect(&self, options: &ConnectionOptions) -> Result<Self::Connection, TransportError>;
}

/// Creates one blocking `reqwest` client per pooled connection
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestConnector;

pub struct ReqwestConnection {
    client: reqwest::blocking::Client,
}

impl ConnectionFactory for ReqwestConnector {
    type Connection = ReqwestConnection;

    fn connect(&self, options: &ConnectionOptions) -> Result<ReqwestConnection, TransportError> {
        let builder = reqwest::blocking::Client::builder().timeout(options.timeout);
        let builder = tls::configure(builder, &options.tls)?;
        let client = builder.build().map_err(|e| TransportError::ClientBuild(e.to_string()))?;
        debug!("[transport] Created connection to {}", options.origin);
        Ok(ReqwestConnection { client })
    }
}

impl Connection for ReqwestConnection {
    fn post(&self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.post(request.url);
        for (name, value) in request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body.to_vec()).send()?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.bytes()?.to_vec();

        Ok(HttpResponse { status, retry_after, body })
    }
}

/// Delta-seconds form only; HTTP dates are ignored
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(HttpResponse::new(204).is_success());
        assert!(HttpResponse::new(400).is_terminal_failure());
        assert!(HttpResponse::new(503).is_terminal_failure());
        assert!(!HttpResponse::new(408).is_terminal_failure());
        assert!(!HttpResponse::new(429).is_terminal_failure());
        assert!(!HttpResponse::new(302).is_terminal_failure());
        assert!(!HttpResponse::new(302).is_success());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
