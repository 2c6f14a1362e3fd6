//! Background thread running periodic maintenance tasks
//!
//! States:
//!
//! ```text
//!            resume()              stop (prefork / drop)
//!  paused ────────────▶ running ───────────────────────▶ stopped
//!     ▲                    │                                │
//!     └──── suspend() ─────┘          postfork() ───────────┘ (back to paused or running)
//! ```
//!
//! The thread is started paused. While running it sleeps for the interval,
//! then calls every task once with the current time.

use crate::fork::Forkable;
use log::{debug, error};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default sleep between two task rounds
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(20);

pub type PeriodicTask = Arc<dyn Fn(Instant) + Send + Sync>;
type WorkerInit = Arc<dyn Fn() + Send + Sync>;

struct State {
    working: bool,
    resumed: bool,
    interval: Duration,
    tasks: Vec<PeriodicTask>,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PeriodicTaskExecutor {
    shared: Arc<Shared>,
    worker_init: Option<WorkerInit>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTaskExecutor {
    /// Start the worker thread (paused) with an initial set of tasks
    ///
    /// `worker_init` runs on the worker thread each time it starts, including
    /// restarts after a fork.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker thread cannot be spawned.
    pub fn new(tasks: Vec<PeriodicTask>, worker_init: Option<Arc<dyn Fn() + Send + Sync>>) -> io::Result<Self> {
        let executor = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State { working: true, resumed: false, interval: DEFAULT_INTERVAL, tasks }),
                condvar: Condvar::new(),
            }),
            worker_init,
            thread: Mutex::new(None),
        };
        let handle = executor.spawn_worker()?;
        *executor.thread_slot() = Some(handle);
        Ok(executor)
    }

    pub fn add_task(&self, task: PeriodicTask) {
        self.shared.lock().tasks.push(task);
    }

    pub fn resume_periodic_tasks(&self) {
        self.shared.lock().resumed = true;
        self.shared.condvar.notify_all();
    }

    pub fn suspend_periodic_tasks(&self) {
        self.shared.lock().resumed = false;
        self.shared.condvar.notify_all();
    }

    /// Takes effect on the next sleep
    pub fn set_interval(&self, interval: Duration) {
        self.shared.lock().interval = interval;
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.shared.lock().interval
    }

    /// Whether the worker thread is alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_slot().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn thread_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self) -> io::Result<JoinHandle<()>> {
        let shared = Arc::clone(&self.shared);
        let worker_init = self.worker_init.clone();
        thread::Builder::new().name("apm-periodic".to_string()).spawn(move || {
            if let Some(init) = worker_init {
                init();
            }
            work(&shared);
        })
    }

    fn stop_and_join(&self) {
        self.shared.lock().working = false;
        self.shared.condvar.notify_all();

        if let Some(handle) = self.thread_slot().take() {
            if handle.join().is_err() {
                error!("Periodic task thread panicked");
            }
        }
    }
}

fn work(shared: &Shared) {
    debug!("Periodic task thread started");
    let mut state = shared.lock();
    loop {
        state = shared
            .condvar
            .wait_while(state, |s| s.working && !s.resumed)
            .unwrap_or_else(PoisonError::into_inner);
        if !state.working {
            break;
        }

        // only a stop request cuts the sleep short
        let interval = state.interval;
        let (guard, _) = shared
            .condvar
            .wait_timeout_while(state, interval, |s| s.working)
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
        if !state.working {
            break;
        }

        let tasks = state.tasks.clone();
        drop(state);

        let now = Instant::now();
        for task in &tasks {
            task(now);
        }

        state = shared.lock();
    }
    debug!("Periodic task thread exiting");
}

impl Forkable for PeriodicTaskExecutor {
    fn prefork(&self) {
        self.stop_and_join();
    }

    fn postfork(&self, _is_child: bool) {
        self.shared.lock().working = true;
        match self.spawn_worker() {
            Ok(handle) => *self.thread_slot() = Some(handle),
            Err(err) => error!("Unable to restart periodic task thread after fork: {err}"),
        }
        self.shared.condvar.notify_all();
    }
}

impl Drop for PeriodicTaskExecutor {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
