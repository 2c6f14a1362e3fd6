//! TLS configuration of `reqwest` clients

use super::endpoint::TlsOptions;
use crate::domain::TransportError;
use log::warn;
use reqwest::blocking::ClientBuilder;
use reqwest::{Certificate, Identity};
use std::fs;

/// Apply `options` to a client builder
///
/// # Errors
///
/// Returns `TransportError::TlsMaterial` when a configured file cannot be
/// read and `TransportError::ClientBuild` when its content is not valid PEM.
pub fn configure(mut builder: ClientBuilder, options: &TlsOptions) -> Result<ClientBuilder, TransportError> {
    if options.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if !options.ca_info.is_empty() {
        let pem = read(&options.ca_info)?;
        for certificate in Certificate::from_pem_bundle(&pem).map_err(|e| TransportError::ClientBuild(e.to_string()))? {
            builder = builder.add_root_certificate(certificate);
        }
    }

    if !options.cert.is_empty() && !options.cert_key.is_empty() {
        if options.cert_key_password.is_empty() {
            let mut pem = read(&options.cert)?;
            pem.push(b'\n');
            pem.extend(read(&options.cert_key)?);
            let identity = Identity::from_pem(&pem).map_err(|e| TransportError::ClientBuild(e.to_string()))?;
            builder = builder.identity(identity);
        } else {
            warn!("[transport] Encrypted client keys are not supported, connecting without client certificate {}", options.cert);
        }
    }

    Ok(builder)
}

fn read(path: &str) -> Result<Vec<u8>, TransportError> {
    fs::read(path).map_err(|source| TransportError::TlsMaterial { path: path.to_string(), source })
}
