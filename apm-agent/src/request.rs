//! Unit-of-work (request) lifecycle
//!
//! Hooks are registered per request: instrumentation code running at the
//! start of a request registers them, and everything is forgotten when the
//! request ends. Errors raised by the host outside instrumented functions are
//! captured here as well.

use crate::hooks::registry::HookRegistry;
use log::{debug, warn};
use std::cell::Cell;

thread_local! {
    static HANDLING_ERROR: Cell<bool> = const { Cell::new(false) };
}

/// An error reported by the host engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorData {
    /// Engine error level bitmask (`E_WARNING`, `E_ERROR`, ...)
    pub error_type: i32,
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl ErrorData {
    #[must_use]
    pub fn new(error_type: i32, file: &str, line: u32, message: &str) -> Self {
        Self { error_type, file: file.to_string(), line, message: message.to_string() }
    }
}

type ErrorListener = Box<dyn FnMut(&ErrorData)>;

/// Hooks and error capture for the request in progress
#[derive(Default)]
pub struct RequestScope {
    hooks: HookRegistry,
    functional: bool,
    last_error: Option<ErrorData>,
    error_listener: Option<ErrorListener>,
}

impl RequestScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request_start(&mut self) {
        self.hooks.clear();
        self.last_error = None;
        self.functional = true;
        debug!("Request started");
    }

    pub fn on_request_end(&mut self) {
        self.hooks.clear();
        self.functional = false;
        debug!("Request finished");
    }

    /// Whether interception should run hooks at all
    #[must_use]
    pub fn is_functional(&self) -> bool {
        self.functional
    }

    #[must_use]
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Called with every captured error, after it is recorded
    pub fn set_error_listener(&mut self, listener: impl FnMut(&ErrorData) + 'static) {
        self.error_listener = Some(Box::new(listener));
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&ErrorData> {
        self.last_error.as_ref()
    }

    /// Capture an error raised by the host
    ///
    /// An error raised while a previous one is still being handled on this
    /// thread (for instance by the listener) is skipped.
    pub fn handle_error(&mut self, error: ErrorData) {
        if HANDLING_ERROR.with(Cell::get) {
            warn!("Error handler loop detected, skipping error '{}' at {}:{}", error.message, error.file, error.line);
            return;
        }

        HANDLING_ERROR.with(|flag| flag.set(true));
        let _reset = HandlingErrorReset;

        debug!("Captured error type: {} at {}:{}: {}", error.error_type, error.file, error.line, error.message);
        if let Some(listener) = self.error_listener.as_mut() {
            listener(&error);
        }
        self.last_error = Some(error);
    }
}

/// Clears the per-thread reentrancy flag, also when a listener panics
struct HandlingErrorReset;

impl Drop for HandlingErrorReset {
    fn drop(&mut self) {
        HANDLING_ERROR.with(|flag| flag.set(false));
    }
}
