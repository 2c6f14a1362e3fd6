use apm_agent::config::PeriodicConfig;
use apm_agent::fork::{ForkRegistry, Forkable};
use apm_agent::periodic::{PeriodicTask, PeriodicTaskExecutor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Records the fork notifications it receives
struct Journal {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl Forkable for Journal {
    fn prefork(&self) {
        self.events.lock().unwrap().push(format!("{} prefork", self.name));
    }

    fn postfork(&self, is_child: bool) {
        self.events.lock().unwrap().push(format!("{} postfork child={is_child}", self.name));
    }
}

fn counting(counter: &Arc<AtomicUsize>) -> PeriodicTask {
    let counter = Arc::clone(counter);
    Arc::new(move |_: Instant| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}

#[test]
fn test_registry_orders_fork_notifications() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let forks = ForkRegistry::new();
    for name in ["transport", "executor"] {
        forks.register(Arc::new(Journal { name, events: Arc::clone(&events) }));
    }

    forks.prefork();
    forks.postfork(false);

    assert_eq!(
        *events.lock().unwrap(),
        vec!["executor prefork", "transport prefork", "transport postfork child=false", "executor postfork child=false"]
    );
}

#[test]
fn test_executor_survives_fork_cycle_through_registry() {
    let config = PeriodicConfig { interval_ms: 5 };
    let counter = Arc::new(AtomicUsize::new(0));
    let executor = Arc::new(PeriodicTaskExecutor::new(vec![counting(&counter)], None).unwrap());
    executor.set_interval(config.interval());
    executor.resume_periodic_tasks();

    let forks = ForkRegistry::new();
    forks.register(executor.clone());
    assert!(wait_until(|| counter.load(Ordering::SeqCst) > 0));

    forks.prefork();
    assert!(!executor.is_running());
    let frozen = counter.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(25));
    assert_eq!(counter.load(Ordering::SeqCst), frozen);

    forks.postfork(true);
    assert!(executor.is_running());
    assert!(wait_until(|| counter.load(Ordering::SeqCst) > frozen));
    // interval and tasks are kept across the restart
    assert_eq!(executor.interval(), Duration::from_millis(5));
}

#[test]
fn test_tasks_receive_the_round_start_time() {
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&stamps);
    let task: PeriodicTask = Arc::new(move |now: Instant| sink.lock().unwrap().push(now));

    let started = Instant::now();
    let executor = PeriodicTaskExecutor::new(vec![task], None).unwrap();
    executor.set_interval(Duration::from_millis(5));
    executor.resume_periodic_tasks();
    assert!(wait_until(|| stamps.lock().unwrap().len() >= 3));
    executor.suspend_periodic_tasks();

    let stamps = stamps.lock().unwrap().clone();
    assert!(stamps[0] >= started);
    assert!(stamps.windows(2).all(|pair| pair[1] >= pair[0] + Duration::from_millis(5)));
}

#[test]
fn test_five_and_a_half_intervals_give_five_runs() {
    let config = PeriodicConfig { interval_ms: 30 };
    let counter = Arc::new(AtomicUsize::new(0));
    let executor = PeriodicTaskExecutor::new(vec![counting(&counter)], None).unwrap();
    executor.set_interval(config.interval());
    executor.resume_periodic_tasks();

    thread::sleep(config.interval() * 11 / 2);
    let runs = counter.load(Ordering::SeqCst);
    executor.suspend_periodic_tasks();

    assert!(runs >= 5, "got {runs} runs");
    assert!(runs <= 6, "got {runs} runs");
}
