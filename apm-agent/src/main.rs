//! # apm-agent - Main Entry Point
//!
//! Two subcommands:
//! - **send** (`apm-agent send --url <URL> FILE...`): POST payloads through the
//!   background transport, directly or via a forked coordinator
//! - **config** (`apm-agent config`): print the effective configuration

use anyhow::{Context, Result};
use apm_agent::cli::{Args, Command, SendArgs};
use apm_agent::config::AgentConfig;
use apm_agent::coordinator::{
    CoordinatorProcess, CoordinatorRole, DatagramChannel, MessageDispatcher, NoopConfigurationFetcher,
};
use apm_agent::domain::ConfigError;
use apm_agent::fork::ForkRegistry;
use apm_agent::transport::{AsyncHttpTransport, ResponseCallback, TelemetryTransport};
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    let args = Args::parse();
    std::process::exit(match run(args) {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run(args: Args) -> Result<i32> {
    let config = AgentConfig::load(args.config.as_deref())?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();

    match args.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(EXIT_SUCCESS)
        }
        Command::Send(send) if send.via_coordinator => send_via_coordinator(&config, &send),
        Command::Send(send) => send_direct(&config, &send),
    }
}

fn read_payloads(files: &[PathBuf]) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    files
        .iter()
        .map(|path| {
            let body = std::fs::read(path).with_context(|| format!("Failed to read payload {}", path.display()))?;
            Ok((path.clone(), body))
        })
        .collect()
}

/// Send from this process; dropping the transport drains the queue
fn send_direct(config: &AgentConfig, send: &SendArgs) -> Result<i32> {
    let payloads = read_payloads(&send.files)?;
    let spec = send.endpoint_spec();
    let transport = AsyncHttpTransport::new(&config.transport);
    transport.initialize_connection(&spec).with_context(|| format!("Failed to set up endpoint {}", spec.url))?;

    let failed = Arc::new(AtomicUsize::new(0));
    let mut rejected = 0usize;
    for (path, body) in &payloads {
        let name = path.display().to_string();
        let failures = Arc::clone(&failed);
        let callback: ResponseCallback = Box::new(move |status: u16, _: &[u8]| {
            if (200..300).contains(&status) {
                info!("{name}: {status}");
            } else {
                warn!("{name}: collector answered {status}");
                failures.fetch_add(1, Ordering::Relaxed);
            }
        });

        if !transport.enqueue(spec.endpoint_hash, body, Some(callback)) {
            warn!("{}: dropped, send queue is full", path.display());
            rejected += 1;
        }
    }

    debug!("Waiting for {} queued payloads", transport.queued_payloads());
    drop(transport);

    let failed = failed.load(Ordering::Relaxed) + rejected;
    println!("sent: {}/{}", payloads.len() - failed, payloads.len());
    Ok(if failed == 0 { EXIT_SUCCESS } else { EXIT_ERROR })
}

/// Fork a coordinator that owns the connection and forward payloads to it
///
/// The coordinator keeps running until this process exits, then drains its
/// transport and exits on its own.
fn send_via_coordinator(config: &AgentConfig, send: &SendArgs) -> Result<i32> {
    let payloads = read_payloads(&send.files)?;
    let spec = send.endpoint_spec();

    let forks = ForkRegistry::new();
    let channel = Arc::new(
        DatagramChannel::new(config.coordinator.queue_capacity).context("Failed to create coordinator channel")?,
    );
    let transport = Arc::new(AsyncHttpTransport::new(&config.transport));
    forks.register(transport.clone());

    let dispatcher = Arc::new(MessageDispatcher::new(transport.clone()));
    let coordinator =
        CoordinatorProcess::new(config.coordinator.clone(), channel, dispatcher, Arc::new(NoopConfigurationFetcher));

    match coordinator.start(&forks).context("Failed to start coordinator")? {
        CoordinatorRole::Coordinator => {
            drop(coordinator);
            drop(forks);
            // last reference: waits for queued payloads
            drop(transport);
            Ok(EXIT_SUCCESS)
        }
        CoordinatorRole::Worker { coordinator: pid } => {
            info!("Coordinator running as {pid}");
            let sender = coordinator.sender();
            sender.initialize_connection(&spec).with_context(|| format!("Failed to set up endpoint {}", spec.url))?;

            let forwarded = payloads
                .iter()
                .filter(|(path, body)| {
                    let accepted = sender.enqueue(spec.endpoint_hash, body, None);
                    if !accepted {
                        warn!("{}: coordinator channel refused the payload", path.display());
                    }
                    accepted
                })
                .count();

            println!("forwarded: {forwarded}/{}", payloads.len());
            Ok(if forwarded == payloads.len() { EXIT_SUCCESS } else { EXIT_ERROR })
        }
    }
}
