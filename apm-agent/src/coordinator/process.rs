//! The coordinator: a forked helper that owns the outbound connections
//!
//! ```text
//!   worker ──▶ CoordinatorTelemetrySender ──▶ ChunkedMessageProcessor::send_payload
//!                                                    │ frames
//!                                                    ▼
//!                                             MessageChannel
//!                                                    │
//!   coordinator loop ◀── timed_receive ◀─────────────┘
//!        │
//!        ▼
//!   process_received_chunk ──▶ MessageDispatcher ──▶ AsyncHttpTransport
//! ```
//!
//! A maintenance task on a [`PeriodicTaskExecutor`] stops the loop once the
//! parent process is gone and sweeps abandoned partial messages.

use super::channel::MessageChannel;
use super::chunked::ChunkedMessageProcessor;
use super::dispatcher::MessageDispatcher;
use super::sender::CoordinatorTelemetrySender;
use crate::config::CoordinatorConfig;
use crate::domain::{CoordinatorError, Pid};
use crate::fork::{block_host_signals, ForkRegistry, ForkRole, Forkable};
use crate::periodic::{PeriodicTask, PeriodicTaskExecutor};
use apm_agent_common::FRAME_SIZE;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Remote configuration source polled by the coordinator
pub trait ConfigurationFetcher: Send + Sync {
    /// Called once when the coordinator loop starts
    fn begin_fetching(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConfigurationFetcher;

impl ConfigurationFetcher for NoopConfigurationFetcher {
    fn begin_fetching(&self) {
        debug!("[coordinator] Remote configuration is disabled");
    }
}

/// Which process returned from [`CoordinatorProcess::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorRole {
    /// The caller's process; the coordinator runs as `coordinator`
    Worker { coordinator: Pid },
    /// The forked coordinator after its loop ended; the caller must exit
    Coordinator,
}

pub struct CoordinatorProcess {
    config: CoordinatorConfig,
    channel: Arc<dyn MessageChannel>,
    processor: Arc<ChunkedMessageProcessor>,
    fetcher: Arc<dyn ConfigurationFetcher>,
    working: Arc<AtomicBool>,
    executor: Mutex<Option<PeriodicTaskExecutor>>,
}

impl CoordinatorProcess {
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        channel: Arc<dyn MessageChannel>,
        dispatcher: Arc<MessageDispatcher>,
        fetcher: Arc<dyn ConfigurationFetcher>,
    ) -> Self {
        let frames = Arc::clone(&channel);
        let processor = Arc::new(ChunkedMessageProcessor::new(
            move |frame: &[u8]| frames.try_send(frame),
            move |message| dispatcher.process_received_message(&message),
        ));

        Self {
            config,
            channel,
            processor,
            fetcher,
            working: Arc::new(AtomicBool::new(true)),
            executor: Mutex::new(None),
        }
    }

    /// Transport for worker code; frames go through this coordinator's channel
    #[must_use]
    pub fn sender(&self) -> CoordinatorTelemetrySender {
        CoordinatorTelemetrySender::new(Arc::clone(&self.processor))
    }

    /// Fork the coordinator
    ///
    /// The parent gets `Worker` back immediately. In the child the coordinator
    /// loop runs until the parent exits or [`stop`](Self::stop) is called, then
    /// `Coordinator` is returned and the caller must terminate the process
    /// instead of continuing worker initialization.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::ForkFailed` when `fork()` fails.
    pub fn start(&self, forks: &ForkRegistry) -> Result<CoordinatorRole, CoordinatorError> {
        let parent = Pid::current();
        match forks.fork().map_err(CoordinatorError::ForkFailed)? {
            ForkRole::Parent { child } => {
                debug!("[coordinator] Coordinator {child} started, parent continues initialization");
                Ok(CoordinatorRole::Worker { coordinator: child })
            }
            ForkRole::Child => {
                info!("[coordinator] Coordinator {} starting for parent {parent}", Pid::current());
                self.run(Some(parent))?;
                debug!("[coordinator] Coordinator {} finishing", Pid::current());
                Ok(CoordinatorRole::Coordinator)
            }
        }
    }

    /// Receive and dispatch frames on the calling thread until stopped
    ///
    /// With `parent` set the loop also ends when the process's parent is no
    /// longer `parent`. Embeddings that run the coordinator on a thread pass
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the maintenance thread cannot be started.
    pub fn run(&self, parent: Option<Pid>) -> Result<(), CoordinatorError> {
        self.working.store(true, Ordering::SeqCst);
        self.fetcher.begin_fetching();

        let worker_init: Arc<dyn Fn() + Send + Sync> = Arc::new(block_host_signals);
        let executor = PeriodicTaskExecutor::new(vec![self.maintenance_task(parent)], Some(worker_init))
            .map_err(CoordinatorError::MaintenanceThread)?;
        executor.set_interval(self.config.maintenance_interval());
        executor.resume_periodic_tasks();
        *self.executor() = Some(executor);

        self.coordinator_loop();

        // joins the maintenance thread
        self.executor().take();
        Ok(())
    }

    /// Ask the loop to exit at its next wake-up
    pub fn stop(&self) {
        self.working.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    fn executor(&self) -> MutexGuard<'_, Option<PeriodicTaskExecutor>> {
        self.executor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn coordinator_loop(&self) {
        let timeout = self.config.receive_timeout();
        let mut buffer = vec![0u8; FRAME_SIZE];

        while self.working.load(Ordering::SeqCst) {
            match self.channel.timed_receive(&mut buffer, timeout) {
                Ok(Some(len)) => {
                    if let Err(err) = self.processor.process_received_chunk(&buffer[..len]) {
                        error!("[coordinator] Rejected frame: {err}");
                    }
                }
                Ok(None) => {}
                Err(err) => debug!("[coordinator] Receive failed: {err}"),
            }
        }
        debug!("[coordinator] Coordinator loop exiting");
    }

    fn maintenance_task(&self, parent: Option<Pid>) -> PeriodicTask {
        let working = Arc::clone(&self.working);
        let processor = Arc::clone(&self.processor);
        let cleanup_interval = self.config.cleanup_interval();
        let max_age = self.config.abandoned_message_max_age();
        let last_cleanup = Mutex::new(Instant::now());

        Arc::new(move |now: Instant| {
            if let Some(parent) = parent {
                let current = Pid::parent();
                if current != parent {
                    info!("[coordinator] Parent {parent} is gone (parent is now {current}), shutting down");
                    working.store(false, Ordering::SeqCst);
                }
            }

            let mut last = last_cleanup.lock().unwrap_or_else(PoisonError::into_inner);
            if now.saturating_duration_since(*last) >= cleanup_interval {
                let removed = processor.cleanup_abandoned_messages(now, max_age);
                if removed > 0 {
                    debug!("[coordinator] Dropped {removed} abandoned messages");
                }
                *last = now;
            }
        })
    }
}

impl Forkable for CoordinatorProcess {
    fn prefork(&self) {
        if let Some(executor) = self.executor().as_ref() {
            executor.prefork();
        }
    }

    fn postfork(&self, is_child: bool) {
        if let Some(executor) = self.executor().as_ref() {
            executor.postfork(is_child);
        }
    }
}
