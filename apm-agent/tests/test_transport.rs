use apm_agent::config::TransportConfig;
use apm_agent::domain::{EndpointHash, TransportError};
use apm_agent::fork::{ForkRegistry, Forkable};
use apm_agent::transport::{
    AsyncHttpTransport, Connection, ConnectionFactory, ConnectionOptions, EndpointSpec, HttpRequest, HttpResponse,
};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A request as seen by the local collector
#[derive(Debug, Clone)]
struct Received {
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Received {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// Minimal HTTP/1.1 collector on localhost answering with scripted raw responses
struct Collector {
    url: String,
    received: Arc<Mutex<Vec<Received>>>,
}

impl Collector {
    fn start(responses: Vec<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/intake/v2/events", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&received);

        thread::spawn(move || {
            let mut responses = responses.into_iter();
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let request = read_request(&mut BufReader::new(stream.try_clone().unwrap()));
                log.lock().unwrap().push(request);

                let response = responses.next().unwrap_or("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
                let _ = stream.write_all(response.as_bytes());
            }
        });

        Self { url, received }
    }

    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

fn read_request(reader: &mut impl BufRead) -> Received {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let path = line.split_whitespace().nth(1).unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        reader.read_line(&mut line).unwrap();
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).unwrap();

    Received { path, headers, body }
}

fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

fn config() -> TransportConfig {
    TransportConfig { max_send_queue_size: 1024 * 1024, shutdown_drain_timeout_ms: 5_000 }
}

#[test]
fn test_payload_reaches_collector_with_headers() {
    let collector = Collector::start(vec![]);
    let transport = AsyncHttpTransport::new(&config());

    let mut spec = EndpointSpec::new(collector.url.clone(), EndpointHash(1));
    spec.content_type = "application/x-ndjson".to_string();
    spec.headers = vec![("Authorization".to_string(), "ApiKey secret".to_string())];
    transport.initialize_connection(&spec).unwrap();

    let answers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&answers);
    assert!(transport.enqueue(
        EndpointHash(1),
        b"{\"metadata\":{}}\n",
        Some(Box::new(move |status: u16, body: &[u8]| sink.lock().unwrap().push((status, body.to_vec())))),
    ));

    wait_for(|| !answers.lock().unwrap().is_empty());
    assert_eq!(*answers.lock().unwrap(), vec![(200, b"ok".to_vec())]);

    let received = collector.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].path, "/intake/v2/events");
    assert_eq!(received[0].header("content-type"), Some("application/x-ndjson"));
    assert_eq!(received[0].header("authorization"), Some("ApiKey secret"));
    assert_eq!(received[0].body, b"{\"metadata\":{}}\n");
}

#[test]
fn test_retry_after_from_collector_updates_endpoint_delay() {
    let collector = Collector::start(vec![
        "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 0\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        "HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    ]);
    let transport = AsyncHttpTransport::new(&config());

    let mut spec = EndpointSpec::new(collector.url.clone(), EndpointHash(2));
    spec.max_retries = 3;
    spec.retry_delay = Duration::from_millis(20);
    transport.initialize_connection(&spec).unwrap();

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    transport.enqueue(EndpointHash(2), b"span", Some(Box::new(move |status: u16, _: &[u8]| sink.lock().unwrap().push(status))));

    wait_for(|| !statuses.lock().unwrap().is_empty());
    assert_eq!(*statuses.lock().unwrap(), vec![202]);
    assert_eq!(collector.received().len(), 2);
    assert_eq!(transport.retry_delay(EndpointHash(2)), Some(Duration::ZERO));
}

#[test]
fn test_drop_drains_queue_before_returning() {
    let collector = Collector::start(vec![]);
    let transport = AsyncHttpTransport::new(&config());
    transport.initialize_connection(&EndpointSpec::new(collector.url.clone(), EndpointHash(3))).unwrap();

    for i in 0..5u8 {
        assert!(transport.enqueue(EndpointHash(3), &[i; 64], None));
    }
    drop(transport);

    let bodies: Vec<Vec<u8>> = collector.received().into_iter().map(|r| r.body).collect();
    assert_eq!(bodies, (0..5u8).map(|i| vec![i; 64]).collect::<Vec<_>>());
}

/// Records requests instead of sending them
#[derive(Clone, Default)]
struct Recording {
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl Connection for Recording {
    fn post(&self, request: &HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        self.sent.lock().unwrap().push((request.url.to_string(), request.body.to_vec()));
        Ok(HttpResponse::new(200))
    }
}

impl ConnectionFactory for Recording {
    type Connection = Recording;

    fn connect(&self, _: &ConnectionOptions) -> Result<Recording, TransportError> {
        Ok(self.clone())
    }
}

#[test]
fn test_payloads_for_several_endpoints_keep_fifo_order() {
    let recording = Recording::default();
    let transport = AsyncHttpTransport::with_factory(&config(), recording.clone());
    transport.initialize_connection(&EndpointSpec::new("http://collector:4318/v1/traces", EndpointHash(10))).unwrap();
    transport.initialize_connection(&EndpointSpec::new("http://collector:4318/v1/logs", EndpointHash(11))).unwrap();

    transport.enqueue(EndpointHash(10), b"t1", None);
    transport.enqueue(EndpointHash(11), b"l1", None);
    transport.enqueue(EndpointHash(10), b"t2", None);
    drop(transport);

    let sent = recording.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![
            ("http://collector:4318/v1/traces".to_string(), b"t1".to_vec()),
            ("http://collector:4318/v1/logs".to_string(), b"l1".to_vec()),
            ("http://collector:4318/v1/traces".to_string(), b"t2".to_vec()),
        ]
    );
}

#[test]
fn test_paused_transport_resumes_after_fork_in_parent() {
    let recording = Recording::default();
    let transport = Arc::new(AsyncHttpTransport::with_factory(&config(), recording.clone()));
    let forks = ForkRegistry::new();
    forks.register(transport.clone());
    transport.initialize_connection(&EndpointSpec::new("http://collector/intake", EndpointHash(1))).unwrap();

    forks.prefork();
    assert!(!transport.is_running());
    assert!(transport.enqueue(EndpointHash(1), b"queued while forking", None));
    thread::sleep(Duration::from_millis(20));
    assert!(recording.sent.lock().unwrap().is_empty());

    transport.postfork(false);
    wait_for(|| !recording.sent.lock().unwrap().is_empty());
    assert_eq!(recording.sent.lock().unwrap()[0].1, b"queued while forking");
    assert!(transport.is_running());
}
