//! Process fork as a lifecycle event
//!
//! Every component that owns a thread or native library state implements
//! [`Forkable`]. Threads are stopped before `fork()` and restarted afterwards
//! in both processes, so the child never inherits a thread that vanished
//! while holding a lock.

use crate::domain::Pid;
use log::{debug, warn};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

pub trait Forkable: Send + Sync {
    /// Stop background threads and release state that must not cross a fork
    fn prefork(&self);

    /// Restore what `prefork` stopped; `is_child` tells which side this is
    fn postfork(&self, is_child: bool);
}

/// Which side of a fork the caller is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRole {
    Parent { child: Pid },
    Child,
}

/// Forkable components, notified in a fixed order around `fork()`
///
/// `prefork` runs in reverse registration order and `postfork` in
/// registration order, the same ordering `pthread_atfork` uses for its
/// prepare and parent/child handlers.
#[derive(Default)]
pub struct ForkRegistry {
    components: Mutex<Vec<Arc<dyn Forkable>>>,
}

impl ForkRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: Arc<dyn Forkable>) {
        self.lock().push(component);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Forkable>>> {
        self.components.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Forkable>> {
        self.lock().clone()
    }

    pub fn prefork(&self) {
        for component in self.snapshot().iter().rev() {
            component.prefork();
        }
    }

    pub fn postfork(&self, is_child: bool) {
        for component in &self.snapshot() {
            component.postfork(is_child);
        }
    }

    /// `fork()` the process, notifying every registered component
    ///
    /// # Errors
    ///
    /// Returns the OS error when `fork()` fails; components are restarted as
    /// the parent in that case.
    #[allow(unsafe_code)]
    pub fn fork(&self) -> io::Result<ForkRole> {
        self.prefork();

        // SAFETY: every registered component has stopped its threads, so the
        // child starts with only the calling thread and no foreign lock held.
        let pid = unsafe { libc::fork() };

        match pid {
            -1 => {
                let err = io::Error::last_os_error();
                self.postfork(false);
                Err(err)
            }
            0 => {
                self.postfork(true);
                debug!("Forked child {}", Pid::current());
                Ok(ForkRole::Child)
            }
            child => {
                self.postfork(false);
                debug!("Forked child {} from {}", Pid(child), Pid::current());
                Ok(ForkRole::Parent { child: Pid(child) })
            }
        }
    }
}

/// Signals the host server uses to control its workers
const HOST_SIGNALS: [libc::c_int; 6] = [libc::SIGTERM, libc::SIGINT, libc::SIGHUP, libc::SIGQUIT, libc::SIGUSR1, libc::SIGUSR2];

/// Block host control signals on the calling thread
///
/// Background threads call this first so the host's signal handlers always
/// run on one of its own threads.
#[allow(unsafe_code)]
pub fn block_host_signals() {
    // SAFETY: the set is initialized by sigemptyset before use and
    // pthread_sigmask only changes the calling thread's mask.
    let result = unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for signal in HOST_SIGNALS {
            libc::sigaddset(&mut set, signal);
        }
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut())
    };
    if result != 0 {
        warn!("Unable to block host signals: {}", io::Error::from_raw_os_error(result));
    }
}

impl Forkable for ForkRegistry {
    fn prefork(&self) {
        ForkRegistry::prefork(self);
    }

    fn postfork(&self, is_child: bool) {
        ForkRegistry::postfork(self, is_child);
    }
}
