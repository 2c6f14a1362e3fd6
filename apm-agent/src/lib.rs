//! # apm-agent - Native Core of an APM Agent
//!
//! The in-process part of an application performance monitoring agent. It
//! intercepts host-runtime functions, ships telemetry to collectors over
//! HTTP, and can move all outbound connections into a forked coordinator so
//! that worker processes never talk to the network themselves.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── worker process ────────────────────────┐
//! │                                                                │
//! │  host runtime ──▶ hooks::dispatcher ──▶ pre/post handlers      │
//! │   (FunctionTable)       │                                      │
//! │                         ▼                                      │
//! │                 TelemetryTransport ◀── periodic tasks          │
//! │                   │            │                               │
//! │   AsyncHttpTransport   CoordinatorTelemetrySender              │
//! │   (sender thread)              │ chunked frames                │
//! └───────│────────────────────────│───────────────────────────────┘
//!         │                        ▼
//!         │           ┌──── coordinator process ────┐
//!         │           │ MessageChannel ─▶ reassembly │
//!         │           │ ─▶ MessageDispatcher         │
//!         │           │ ─▶ AsyncHttpTransport        │
//!         │           └──────────────│──────────────┘
//!         ▼                          ▼
//!     collector                  collector
//! ```
//!
//! ## Subsystems
//!
//! ### 1. Instrumentation ([`hooks`])
//! - Pre and post handlers keyed by `(class, function)` hashes
//! - Handlers observe arguments and may replace return values
//! - Host-runtime exceptions raised inside handlers are swallowed and logged
//!
//! ### 2. Transport ([`transport`])
//! - Bounded byte-budget queue drained by one background thread
//! - One pooled connection per origin; the first endpoint on an origin sets its TLS options and timeout
//! - Retries on transient failures, honoring `Retry-After`
//! - Fork-safe: paused before `fork()`, restarted afterwards
//!
//! ### 3. Coordinator ([`coordinator`])
//! - Worker commands encoded into fixed-size frames
//! - Frames reassembled per sender and message id in the coordinator
//! - Coordinator exits when its parent process goes away
//!
//! ## Typical Usage
//!
//! ```bash
//! # Post a payload to a collector
//! apm-agent send --url http://localhost:8200/intake payload.json
//!
//! # Same, through a forked coordinator process
//! RUST_LOG=debug apm-agent send --via-coordinator --url http://localhost:8200/intake payload.json
//! ```

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod fork;
pub mod hooks;
pub mod periodic;
pub mod request;
pub mod transport;
