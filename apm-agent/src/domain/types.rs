//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the many `u64` identifiers of the agent apart:
//! a function hook key, an endpoint hash and a pooled connection id are all
//! 64-bit hashes, but mixing them up is always a bug.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID
///
/// Used for the coordinator's parent-liveness check and as the sender key of
/// chunked IPC messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub i32);

impl Pid {
    /// PID of the calling process
    #[must_use]
    #[allow(unsafe_code)]
    pub fn current() -> Self {
        // SAFETY: getpid() has no preconditions and cannot fail.
        Pid(unsafe { libc::getpid() })
    }

    /// PID of the calling process's parent
    #[must_use]
    #[allow(unsafe_code)]
    pub fn parent() -> Self {
        // SAFETY: getppid() has no preconditions and cannot fail.
        Pid(unsafe { libc::getppid() })
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    fn from(pid: i32) -> Self {
        Pid(pid)
    }
}

/// Hook registry key for a (class, function) pair
///
/// Computed as `class_hash ^ (function_hash << 1)` over lower-cased names, so
/// lookups are case-insensitive. A free function has class hash 0. Zero as a
/// whole means "no function" (e.g. the top-level script scope).
///
/// Distinct pairs can collide; collisions are not detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKey(pub u64);

impl FunctionKey {
    /// Key of a method (`class_name` non-empty) or of a free function
    #[must_use]
    pub fn new(class_name: &str, function_name: &str) -> Self {
        let class_hash = if class_name.is_empty() { 0 } else { name_hash(class_name) };
        let function_hash = if function_name.is_empty() { 0 } else { name_hash(function_name) };
        FunctionKey(class_hash ^ (function_hash << 1))
    }

    /// Key of a free function
    #[must_use]
    pub fn for_function(function_name: &str) -> Self {
        Self::new("", function_name)
    }

    /// True for the "no function" key
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Case-folded engine string hash (DJB "times 33")
///
/// The top bit is forced on, the way the host engine marks computed hashes,
/// so a non-empty name never hashes to zero.
#[must_use]
pub fn name_hash(name: &str) -> u64 {
    let hash = name
        .bytes()
        .map(|b| b.to_ascii_lowercase())
        .fold(5381u64, |hash, b| hash.wrapping_mul(33).wrapping_add(u64::from(b)));
    hash | 0x8000_0000_0000_0000
}

/// Opaque identifier of a telemetry endpoint (traces, logs, metrics, ...)
///
/// Chosen by the producer; the transport only uses it as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointHash(pub u64);

impl fmt::Display for EndpointHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint:{:#x}", self.0)
    }
}

/// Identifier of a pooled connection, derived from scheme + host + port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{:#x}", self.0)
    }
}

/// Per-sender message counter used by the chunked IPC protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}
