mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use callx::prelude::*;
use common::{MockNetwork, Reply, client_builder, get, lock, wait_until};

const WAIT: Duration = Duration::from_secs(5);

/// Holds every gated request until opened.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    condvar: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = lock(&self.open);
        while !*open {
            open = match self.condvar.wait(open) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn open(&self) {
        *lock(&self.open) = true;
        self.condvar.notify_all();
    }
}

fn gated_network(gate: &Arc<Gate>, gated_host: Option<&'static str>) -> Arc<MockNetwork> {
    let gate = Arc::clone(gate);
    MockNetwork::new(move |request| {
        let host = request.url().host_str().unwrap_or_default().to_owned();
        if gated_host.is_none_or(|gated| gated == host) {
            gate.wait();
        }
        Reply::text(200, &host)
    })
}

fn client_with(network: &Arc<MockNetwork>, dispatcher: &Dispatcher) -> Client {
    client_builder(network)
        .dispatcher(dispatcher.clone())
        .build()
        .expect("client should build")
}

fn enqueue(client: &Client, url: &str, done: &mpsc::Sender<String>) {
    let done = done.clone();
    client
        .new_call(get(url))
        .enqueue(move |_call, result| {
            let body = match result {
                Ok(response) => response.text_lossy(),
                Err(error) => format!("error: {error}"),
            };
            let _ = done.send(body);
        })
        .expect("enqueue should be accepted");
}

#[test]
fn per_host_limit_queues_only_the_saturated_host() {
    let gate = Arc::new(Gate::default());
    let network = gated_network(&gate, Some("a.test"));
    let dispatcher = Dispatcher::new();
    dispatcher
        .set_max_requests_per_host(2)
        .expect("limit should be accepted");
    let client = client_with(&network, &dispatcher);
    let (done, finished) = mpsc::channel();

    for _ in 0..3 {
        enqueue(&client, "http://a.test/slow", &done);
    }
    enqueue(&client, "http://b.test/fast", &done);

    assert_eq!(
        finished.recv_timeout(WAIT).expect("b.test should not wait on a.test"),
        "b.test"
    );
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 2));
    assert_eq!(dispatcher.queued_calls_count(), 1);
    let queued = dispatcher.queued_calls();
    assert_eq!(queued[0].request().url().host_str(), Some("a.test"));

    gate.open();
    for _ in 0..3 {
        assert_eq!(
            finished.recv_timeout(WAIT).expect("a.test calls should complete"),
            "a.test"
        );
    }
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 0));
    assert_eq!(dispatcher.queued_calls_count(), 0);
}

#[test]
fn global_limit_runs_calls_in_enqueue_order() {
    let gate = Arc::new(Gate::default());
    let network = gated_network(&gate, None);
    let dispatcher = Dispatcher::new();
    dispatcher.set_max_requests(1).expect("limit should be accepted");
    let client = client_with(&network, &dispatcher);
    let (done, finished) = mpsc::channel();

    for host in ["one.test", "two.test", "three.test"] {
        enqueue(&client, &format!("http://{host}/"), &done);
    }
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 1));
    assert_eq!(dispatcher.queued_calls_count(), 2);

    gate.open();
    let order: Vec<String> = (0..3)
        .map(|_| finished.recv_timeout(WAIT).expect("call should complete"))
        .collect();
    assert_eq!(order, ["one.test", "two.test", "three.test"]);
}

#[test]
fn raising_the_limit_starts_waiting_calls() {
    let gate = Arc::new(Gate::default());
    let network = gated_network(&gate, None);
    let dispatcher = Dispatcher::new();
    dispatcher.set_max_requests(1).expect("limit should be accepted");
    let client = client_with(&network, &dispatcher);
    let (done, finished) = mpsc::channel();

    enqueue(&client, "http://one.test/", &done);
    enqueue(&client, "http://two.test/", &done);
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 1));

    dispatcher.set_max_requests(2).expect("limit should be accepted");
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 2));
    assert_eq!(dispatcher.queued_calls_count(), 0);

    gate.open();
    for _ in 0..2 {
        finished.recv_timeout(WAIT).expect("call should complete");
    }
}

#[test]
fn idle_callback_fires_once_the_last_call_finishes() {
    let gate = Arc::new(Gate::default());
    let network = gated_network(&gate, None);
    let dispatcher = Dispatcher::new();
    let idle = Arc::new(AtomicUsize::new(0));
    let idle_count = Arc::clone(&idle);
    dispatcher.set_idle_callback(move || {
        idle_count.fetch_add(1, Ordering::AcqRel);
    });
    let client = client_with(&network, &dispatcher);
    let (done, finished) = mpsc::channel();

    enqueue(&client, "http://one.test/", &done);
    enqueue(&client, "http://two.test/", &done);
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 2));
    assert_eq!(idle.load(Ordering::Acquire), 0);

    gate.open();
    for _ in 0..2 {
        finished.recv_timeout(WAIT).expect("call should complete");
    }
    assert!(wait_until(WAIT, || idle.load(Ordering::Acquire) >= 1));
    assert_eq!(dispatcher.running_calls_count(), 0);
}

#[test]
fn synchronous_calls_count_as_running_but_are_not_limited() {
    let gate = Arc::new(Gate::default());
    let network = gated_network(&gate, Some("sync.test"));
    let dispatcher = Dispatcher::new();
    dispatcher.set_max_requests(1).expect("limit should be accepted");
    let client = client_with(&network, &dispatcher);

    let blocking = {
        let client = client.clone();
        std::thread::spawn(move || client.new_call(get("http://sync.test/")).execute())
    };
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 1));

    // The async limit of one still admits a call while the sync call runs.
    let (done, finished) = mpsc::channel();
    enqueue(&client, "http://async.test/", &done);
    assert_eq!(
        finished.recv_timeout(WAIT).expect("async call should run"),
        "async.test"
    );

    gate.open();
    let response = blocking
        .join()
        .expect("sync thread should not panic")
        .expect("sync call should succeed");
    assert_eq!(response.text_lossy(), "sync.test");
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 0));
}

#[test]
fn cancel_all_reaches_queued_and_running_calls() {
    let gate = Arc::new(Gate::default());
    let network = gated_network(&gate, None);
    let dispatcher = Dispatcher::new();
    dispatcher.set_max_requests(1).expect("limit should be accepted");
    let client = client_with(&network, &dispatcher);
    let (done, finished) = mpsc::channel();

    enqueue(&client, "http://one.test/", &done);
    enqueue(&client, "http://two.test/", &done);
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 1));

    dispatcher.cancel_all();
    gate.open();
    for _ in 0..2 {
        let outcome = finished.recv_timeout(WAIT).expect("call should finish");
        assert!(outcome.starts_with("error: call canceled"), "{outcome}");
    }
    assert!(wait_until(WAIT, || dispatcher.running_calls_count() == 0));
}

#[test]
fn host_capped_at_one_does_not_hold_back_another_host() {
    let gate = Arc::new(Gate::default());
    let network = gated_network(&gate, Some("a.test"));
    let dispatcher = Dispatcher::new();
    dispatcher
        .set_max_requests_per_host(1)
        .expect("limit should be accepted");
    let client = client_with(&network, &dispatcher);
    let (done, finished) = mpsc::channel();

    enqueue(&client, "http://a.test/first", &done);
    enqueue(&client, "http://a.test/second", &done);
    enqueue(&client, "http://b.test/", &done);

    assert_eq!(
        finished.recv_timeout(WAIT).expect("b.test should be admitted"),
        "b.test"
    );
    assert_eq!(dispatcher.queued_calls_count(), 1);

    gate.open();
    for _ in 0..2 {
        assert_eq!(
            finished.recv_timeout(WAIT).expect("a.test calls should complete"),
            "a.test"
        );
    }
    let paths: Vec<String> = network
        .requests()
        .iter()
        .filter(|request| request.url().host_str() == Some("a.test"))
        .map(|request| request.url().path().to_owned())
        .collect();
    assert_eq!(paths, ["/first", "/second"]);
}
