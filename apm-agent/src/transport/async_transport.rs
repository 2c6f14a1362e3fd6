//! Queued HTTP sender running on its own thread
//!
//! Producers call [`AsyncHttpTransport::enqueue`], which copies the payload
//! into a byte-bounded FIFO and never blocks on the network. A single sender
//! thread pops payloads in order and posts them to their endpoint, retrying
//! retryable statuses up to the endpoint's retry budget.
//!
//! ```text
//!  enqueue() ──▶ [ VecDeque<QueuedPayload> ] ──▶ sender thread ──▶ Connection::post
//!                   byte usage ≤ cap               │
//!                                                  ├─ 2xx          → callback, done
//!                                                  ├─ 4xx/5xx      → callback, dropped
//!                                                  └─ 408/429/other → sleep, retry
//! ```

use super::connection::{Connection, ConnectionFactory, HttpRequest, ReqwestConnector};
use super::endpoint::EndpointSpec;
use super::pool::HttpEndpoints;
use super::{ResponseCallback, TelemetryTransport};
use crate::config::TransportConfig;
use crate::domain::{EndpointHash, TransportError};
use crate::fork::{block_host_signals, Forkable};
use log::{debug, error, trace, warn};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct QueuedPayload {
    endpoint_hash: EndpointHash,
    payload: Vec<u8>,
    callback: Option<ResponseCallback>,
}

#[derive(Default)]
struct Queue {
    payloads: VecDeque<QueuedPayload>,
    byte_usage: usize,
    working: bool,
    force_flush: bool,
    shutdown_started: Option<Instant>,
}

struct Shared<F: ConnectionFactory> {
    queue: Mutex<Queue>,
    condvar: Condvar,
    endpoints: Mutex<HttpEndpoints<F::Connection>>,
    factory: F,
    max_send_queue_size: usize,
    drain_timeout: Duration,
}

pub struct AsyncHttpTransport<F: ConnectionFactory = ReqwestConnector> {
    shared: Arc<Shared<F>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncHttpTransport {
    #[must_use]
    pub fn new(config: &TransportConfig) -> Self {
        Self::with_factory(config, ReqwestConnector)
    }
}

impl<F: ConnectionFactory> AsyncHttpTransport<F> {
    #[must_use]
    pub fn with_factory(config: &TransportConfig, factory: F) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                condvar: Condvar::new(),
                endpoints: Mutex::new(HttpEndpoints::new()),
                factory,
                max_send_queue_size: config.max_send_queue_size,
                drain_timeout: config.shutdown_drain_timeout(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Register or update an endpoint and make sure the sender thread runs
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidUrl` when the endpoint URL is unusable.
    pub fn initialize_connection(&self, spec: &EndpointSpec) -> Result<(), TransportError> {
        trace!(
            "[transport] initialize_connection {} {} timeout {:?} retries {} retry delay {:?}",
            spec.url,
            spec.endpoint_hash,
            spec.timeout,
            spec.max_retries,
            spec.retry_delay
        );
        let connection_id = self.shared.endpoints().add(spec)?;
        trace!("[transport] {} uses {connection_id}", spec.endpoint_hash);
        self.start_thread();
        Ok(())
    }

    /// Queue a copy of `payload`; returns `false` when it was dropped
    pub fn enqueue(&self, endpoint_hash: EndpointHash, payload: &[u8], callback: Option<ResponseCallback>) -> bool {
        {
            let mut queue = self.shared.queue();
            if queue.byte_usage + payload.len() > self.shared.max_send_queue_size {
                debug!(
                    "[transport] Queue limit of {} bytes reached, dropping {} byte payload for {endpoint_hash} ({} queued, {} bytes in use)",
                    self.shared.max_send_queue_size,
                    payload.len(),
                    queue.payloads.len(),
                    queue.byte_usage
                );
                return false;
            }
            queue.byte_usage += payload.len();
            queue.payloads.push_back(QueuedPayload { endpoint_hash, payload: payload.to_vec(), callback });
        }
        self.shared.condvar.notify_all();
        true
    }

    /// Change the delay between retries for future sends to `endpoint_hash`
    pub fn update_retry_delay(&self, endpoint_hash: EndpointHash, delay: Duration) {
        self.shared.update_retry_delay(endpoint_hash, delay);
    }

    #[must_use]
    pub fn retry_delay(&self, endpoint_hash: EndpointHash) -> Option<Duration> {
        self.shared.endpoints().get(endpoint_hash).map(super::endpoint::HttpEndpoint::retry_delay)
    }

    #[must_use]
    pub fn queued_payloads(&self) -> usize {
        self.shared.queue().payloads.len()
    }

    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.shared.queue().byte_usage
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_slot().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn thread_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_thread(&self) {
        let mut slot = self.thread_slot();
        if slot.is_some() {
            return;
        }

        self.shared.queue().working = true;
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new().name("apm-transport".to_string()).spawn(move || {
            block_host_signals();
            send_loop(&shared);
        });
        match spawned {
            Ok(handle) => {
                trace!("[transport] Sender thread started");
                *slot = Some(handle);
            }
            Err(err) => error!("[transport] Unable to start sender thread: {err}"),
        }
    }

    fn shutdown_thread(&self) {
        self.shared.queue().working = false;
        self.shared.condvar.notify_all();

        if let Some(handle) = self.thread_slot().take() {
            trace!("[transport] Joining sender thread");
            if handle.join().is_err() {
                error!("[transport] Sender thread panicked");
            }
        }
    }
}

impl<F: ConnectionFactory> Shared<F> {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoints(&self) -> MutexGuard<'_, HttpEndpoints<F::Connection>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_retry_delay(&self, endpoint_hash: EndpointHash, delay: Duration) {
        if self.endpoints().update_retry_delay(endpoint_hash, delay) {
            debug!("[transport] {endpoint_hash} retry delay set to {delay:?}");
        } else {
            debug!("[transport] Cannot update retry delay of unknown {endpoint_hash}");
        }
    }

    /// Block until a payload is available; `None` tells the thread to exit
    fn next_payload(&self) -> Option<QueuedPayload> {
        let mut queue = self
            .condvar
            .wait_while(self.queue(), |q| q.working && q.payloads.is_empty())
            .unwrap_or_else(PoisonError::into_inner);

        if !queue.working {
            if !queue.force_flush {
                return None;
            }
            let expired = !self.drain_timeout.is_zero()
                && queue.shutdown_started.is_some_and(|started| started.elapsed() > self.drain_timeout);
            if expired {
                if !queue.payloads.is_empty() {
                    warn!(
                        "[transport] Shutdown drain timeout of {:?} expired, dropping {} queued payloads",
                        self.drain_timeout,
                        queue.payloads.len()
                    );
                }
                queue.payloads.clear();
                queue.byte_usage = 0;
                return None;
            }
        }

        let item = queue.payloads.pop_front()?;
        queue.byte_usage -= item.payload.len();
        Some(item)
    }

    fn deliver(&self, item: QueuedPayload) {
        let QueuedPayload { endpoint_hash, payload, mut callback } = item;

        let target = match self.endpoints().target(endpoint_hash, &self.factory) {
            Ok(target) => target,
            Err(err) => {
                warn!("[transport] Dropping {} byte payload: {err}", payload.len());
                return;
            }
        };

        let request = HttpRequest { url: &target.url, headers: &target.headers, body: &payload };
        let max_retries = target.max_retries.max(1);

        for attempt in 1..=max_retries {
            match target.connection.post(&request) {
                Ok(response) => {
                    debug!(
                        "[transport] {endpoint_hash} {} sent {} bytes, status {}",
                        target.connection_id,
                        payload.len(),
                        response.status
                    );
                    if response.is_success() || response.is_terminal_failure() {
                        if !response.is_success() {
                            warn!(
                                "[transport] {endpoint_hash} server returned {}, dropping {} byte payload",
                                response.status,
                                payload.len()
                            );
                        }
                        if let Some(callback) = callback.take() {
                            run_callback(endpoint_hash, callback, response.status, &response.body);
                        }
                        return;
                    }
                    if let Some(delay) = response.retry_after {
                        self.update_retry_delay(endpoint_hash, delay);
                    }
                }
                Err(err) => debug!("[transport] {endpoint_hash} attempt {attempt}/{max_retries} failed: {err}"),
            }

            if attempt < max_retries {
                debug!(
                    "[transport] {endpoint_hash} retry {attempt}/{max_retries} in {:?}",
                    target.retry_delay
                );
                thread::sleep(target.retry_delay);
            }
        }

        warn!(
            "[transport] {endpoint_hash} dropping {} byte payload after {max_retries} attempts",
            payload.len()
        );
    }
}

fn run_callback(endpoint_hash: EndpointHash, callback: ResponseCallback, status: u16, body: &[u8]) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(status, body))).is_err() {
        error!("[transport] {endpoint_hash} response callback panicked");
    }
}

fn send_loop<F: ConnectionFactory>(shared: &Shared<F>) {
    while let Some(item) = shared.next_payload() {
        shared.deliver(item);
    }
    trace!("[transport] Sender thread exiting");
}

impl<F: ConnectionFactory> TelemetryTransport for AsyncHttpTransport<F> {
    fn initialize_connection(&self, spec: &EndpointSpec) -> Result<(), TransportError> {
        Self::initialize_connection(self, spec)
    }

    fn enqueue(&self, endpoint_hash: EndpointHash, payload: &[u8], callback: Option<ResponseCallback>) -> bool {
        Self::enqueue(self, endpoint_hash, payload, callback)
    }

    fn update_retry_delay(&self, endpoint_hash: EndpointHash, delay: Duration) {
        Self::update_retry_delay(self, endpoint_hash, delay);
    }
}

impl<F: ConnectionFactory> Forkable for AsyncHttpTransport<F> {
    fn prefork(&self) {
        self.shutdown_thread();
        trace!("[transport] prefork with {} queued payloads", self.queued_payloads());
        self.shared.endpoints().disconnect_all();
    }

    fn postfork(&self, is_child: bool) {
        if is_child {
            let mut queue = self.shared.queue();
            if !queue.payloads.is_empty() {
                trace!("[transport] Child discards {} payloads left to the parent", queue.payloads.len());
            }
            queue.payloads.clear();
            queue.byte_usage = 0;
        }
        self.start_thread();
        self.shared.condvar.notify_all();
    }
}

impl<F: ConnectionFactory> Drop for AsyncHttpTransport<F> {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue();
            queue.force_flush = true;
            queue.shutdown_started = Some(Instant::now());
        }
        self.shutdown_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connection::HttpResponse;
    use crate::transport::endpoint::ConnectionOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connection answering with scripted responses, 200 once the script runs out
    #[derive(Clone, Default)]
    struct Scripted {
        responses: Arc<Mutex<VecDeque<HttpResponse>>>,
        attempts: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
        latency: Duration,
    }

    impl Scripted {
        fn answering(statuses: &[u16]) -> Self {
            let script = Self::default();
            script.responses.lock().unwrap().extend(statuses.iter().map(|s| HttpResponse::new(*s)));
            script
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Connection for Scripted {
        fn post(&self, _: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.latency);
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or_else(|| HttpResponse::new(200)))
        }
    }

    impl ConnectionFactory for Scripted {
        type Connection = Scripted;

        fn connect(&self, _: &ConnectionOptions) -> Result<Scripted, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.clone())
        }
    }

    fn endpoint(max_retries: usize) -> EndpointSpec {
        let mut spec = EndpointSpec::new("http://collector.local:8200/intake", EndpointHash(1));
        spec.max_retries = max_retries;
        spec
    }

    fn config(max_send_queue_size: usize, drain_ms: u64) -> TransportConfig {
        TransportConfig { max_send_queue_size, shutdown_drain_timeout_ms: drain_ms }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_retryable_status_is_retried() {
        let script = Scripted::answering(&[429, 200]);
        let transport = AsyncHttpTransport::with_factory(&config(1024, 0), script.clone());
        transport.initialize_connection(&endpoint(3)).unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);
        transport.enqueue(EndpointHash(1), b"span", Some(Box::new(move |status: u16, _: &[u8]| seen.lock().unwrap().push(status))));

        wait_for(|| !statuses.lock().unwrap().is_empty());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(script.attempts(), 2);
        assert_eq!(*statuses.lock().unwrap(), vec![200]);
        assert_eq!(transport.queued_payloads(), 0);
    }

    #[test]
    fn test_terminal_status_is_not_retried() {
        let script = Scripted::answering(&[400]);
        let transport = AsyncHttpTransport::with_factory(&config(1024, 0), script.clone());
        transport.initialize_connection(&endpoint(3)).unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);
        transport.enqueue(EndpointHash(1), b"span", Some(Box::new(move |status: u16, _: &[u8]| seen.lock().unwrap().push(status))));

        wait_for(|| !statuses.lock().unwrap().is_empty());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(script.attempts(), 1);
        assert_eq!(*statuses.lock().unwrap(), vec![400]);
        assert_eq!(transport.queued_payloads(), 0);
    }

    #[test]
    fn test_payload_dropped_after_retries_exhausted() {
        let script = Scripted::answering(&[408, 408, 408]);
        let transport = AsyncHttpTransport::with_factory(&config(1024, 0), script.clone());
        transport.initialize_connection(&endpoint(2)).unwrap();

        let called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&called);
        transport.enqueue(
            EndpointHash(1),
            b"span",
            Some(Box::new(move |_: u16, _: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        wait_for(|| script.attempts() == 2);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(script.attempts(), 2);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_after_updates_endpoint_delay() {
        let script = Scripted::default();
        let mut busy = HttpResponse::new(429);
        busy.retry_after = Some(Duration::from_secs(7));
        script.responses.lock().unwrap().push_back(busy);

        let transport = AsyncHttpTransport::with_factory(&config(1024, 0), script.clone());
        transport.initialize_connection(&endpoint(2)).unwrap();
        transport.enqueue(EndpointHash(1), b"span", None);

        wait_for(|| script.attempts() == 2);
        assert_eq!(transport.retry_delay(EndpointHash(1)), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_enqueue_over_limit_is_dropped_whole() {
        let transport = AsyncHttpTransport::with_factory(&config(1024, 0), Scripted::default());

        assert!(transport.enqueue(EndpointHash(1), &[0; 1000], None));
        assert!(!transport.enqueue(EndpointHash(1), &[0; 100], None));
        assert_eq!(transport.queued_payloads(), 1);
        assert_eq!(transport.queued_bytes(), 1000);
        assert!(transport.enqueue(EndpointHash(1), &[0; 24], None));
    }

    #[test]
    fn test_drain_timeout_bounds_shutdown() {
        let script = Scripted { latency: Duration::from_millis(10), ..Scripted::default() };
        let transport = AsyncHttpTransport::with_factory(&config(1 << 20, 5), script.clone());
        transport.initialize_connection(&endpoint(1)).unwrap();
        for _ in 0..3 {
            transport.enqueue(EndpointHash(1), &[0; 1024], None);
        }

        drop(transport);
        assert_eq!(script.attempts(), 1);
    }

    #[test]
    fn test_unbounded_drain_sends_everything() {
        let script = Scripted { latency: Duration::from_millis(2), ..Scripted::default() };
        let transport = AsyncHttpTransport::with_factory(&config(1 << 20, 0), script.clone());
        transport.initialize_connection(&endpoint(1)).unwrap();
        for _ in 0..3 {
            transport.enqueue(EndpointHash(1), &[0; 16], None);
        }

        drop(transport);
        assert_eq!(script.attempts(), 3);
    }

    #[test]
    fn test_child_discards_parent_queue() {
        let script = Scripted::default();
        let transport = AsyncHttpTransport::with_factory(&config(1024, 0), script.clone());
        transport.initialize_connection(&endpoint(1)).unwrap();

        transport.prefork();
        assert!(!transport.is_running());
        transport.enqueue(EndpointHash(1), b"a", None);
        transport.enqueue(EndpointHash(1), b"b", None);
        transport.postfork(true);

        assert_eq!(transport.queued_payloads(), 0);
        assert!(transport.is_running());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(script.attempts(), 0);
    }

    #[test]
    fn test_parent_keeps_queue_and_reconnects() {
        let script = Scripted::default();
        let transport = AsyncHttpTransport::with_factory(&config(1024, 0), script.clone());
        transport.initialize_connection(&endpoint(1)).unwrap();
        transport.enqueue(EndpointHash(1), b"before", None);
        wait_for(|| script.attempts() == 1);

        transport.prefork();
        transport.enqueue(EndpointHash(1), b"a", None);
        transport.enqueue(EndpointHash(1), b"b", None);
        transport.postfork(false);

        wait_for(|| script.attempts() == 3);
        assert_eq!(script.attempts(), 3);
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_endpoint_payload_is_dropped() {
        let script = Scripted::default();
        let transport = AsyncHttpTransport::with_factory(&config(1024, 0), script.clone());
        transport.initialize_connection(&endpoint(1)).unwrap();
        transport.enqueue(EndpointHash(99), b"lost", None);

        wait_for(|| transport.queued_payloads() == 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(script.attempts(), 0);
    }
}
