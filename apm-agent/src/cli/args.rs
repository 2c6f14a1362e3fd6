//! CLI argument definitions

use crate::domain::{name_hash, EndpointHash};
use crate::transport::{EndpointSpec, TlsOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "apm-agent",
    version,
    about = "Ship telemetry payloads the way the in-process agent does",
    after_help = "\
EXAMPLES:
    apm-agent send --url http://localhost:8200/intake span.json
    apm-agent send --via-coordinator --url https://apm:8200/intake -H 'Authorization: ApiKey k' a.json b.json
    apm-agent config --config agent.json"
)]
pub struct Args {
    /// JSON configuration file (APM_AGENT_* variables override it)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// POST each file as one payload to a collector endpoint
    Send(SendArgs),
    /// Print the effective configuration as JSON
    Config,
}

#[derive(clap::Args)]
pub struct SendArgs {
    /// Collector endpoint URL
    #[arg(short, long)]
    pub url: String,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    #[arg(long, default_value = "application/json")]
    pub content_type: String,

    /// Attempts per payload (0 behaves as 1)
    #[arg(long, default_value = "3")]
    pub max_retries: usize,

    /// Pause between attempts
    #[arg(long, default_value = "1000", value_name = "MS")]
    pub retry_delay_ms: u64,

    /// Per-request timeout
    #[arg(long, default_value = "10000", value_name = "MS")]
    pub timeout_ms: u64,

    /// Skip TLS certificate and hostname verification
    #[arg(long)]
    pub insecure: bool,

    /// CA bundle (PEM) used to verify the collector
    #[arg(long, value_name = "FILE")]
    pub ca_info: Option<String>,

    /// Client certificate (PEM)
    #[arg(long, value_name = "FILE", requires = "cert_key")]
    pub cert: Option<String>,

    /// Private key for --cert (PEM)
    #[arg(long, value_name = "FILE", requires = "cert")]
    pub cert_key: Option<String>,

    /// Fork a coordinator and send through it instead of directly
    #[arg(long)]
    pub via_coordinator: bool,

    /// Payload files
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,
}

impl SendArgs {
    /// Endpoints are keyed by the hash of their URL
    #[must_use]
    pub fn endpoint_hash(&self) -> EndpointHash {
        EndpointHash(name_hash(&self.url))
    }

    #[must_use]
    pub fn endpoint_spec(&self) -> EndpointSpec {
        let mut spec = EndpointSpec::new(self.url.clone(), self.endpoint_hash());
        spec.content_type.clone_from(&self.content_type);
        spec.headers.clone_from(&self.headers);
        spec.timeout = Duration::from_millis(self.timeout_ms);
        spec.max_retries = self.max_retries;
        spec.retry_delay = Duration::from_millis(self.retry_delay_ms);
        spec.tls = TlsOptions {
            insecure_skip_verify: self.insecure,
            ca_info: self.ca_info.clone().unwrap_or_default(),
            cert: self.cert.clone().unwrap_or_default(),
            cert_key: self.cert_key.clone().unwrap_or_default(),
            ..TlsOptions::default()
        };
        spec
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw.split_once(':').ok_or_else(|| format!("expected `Name: value`, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in `{raw}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
