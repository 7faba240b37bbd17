use std::hint::black_box;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use callx::prelude::*;
use callx::{ConnectionPool, Dns, Executor, Job, RejectedExecution, Shutdown};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use http::StatusCode;

/// Answers every request with an empty `200` from memory.
struct EchoTransport {
    closed: Arc<AtomicBool>,
    pending: bool,
}

impl Transport for EchoTransport {
    fn write_request(&mut self, _request: &Request) -> io::Result<()> {
        self.pending = true;
        Ok(())
    }

    fn read_response(&mut self) -> io::Result<ResponseParts> {
        if !std::mem::take(&mut self.pending) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no request written"));
        }
        Ok(ResponseParts::new(StatusCode::OK))
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn shutdown_handle(&self) -> Arc<dyn Shutdown> {
        let closed = Arc::clone(&self.closed);
        Arc::new(move || closed.store(true, Ordering::Release))
    }
}

fn echo_connector() -> Arc<dyn Connector> {
    Arc::new(
        |_route: &Route, _options: &ConnectOptions| -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(EchoTransport {
                closed: Arc::new(AtomicBool::new(false)),
                pending: false,
            }))
        },
    )
}

/// Runs jobs on the submitting thread.
struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) -> Result<(), RejectedExecution> {
        job();
        Ok(())
    }
}

fn benchmark_client(pool: ConnectionPool, dispatcher: Dispatcher) -> Client {
    let dns: Arc<dyn Dns> = Arc::new(|_host: &str| -> io::Result<Vec<IpAddr>> {
        Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
    });
    Client::builder()
        .connector(echo_connector())
        .dns(dns)
        .connection_pool(pool)
        .dispatcher(dispatcher)
        .connect_timeout(Duration::from_secs(2))
        .read_timeout(Duration::from_secs(2))
        .write_timeout(Duration::from_secs(2))
        .build()
        .expect("build benchmark client")
}

fn benchmark_request(path: &str) -> Request {
    Request::get(&format!("http://bench.test{path}")).expect("build benchmark request")
}

fn bench_execute(c: &mut Criterion) {
    let pooled = benchmark_client(ConnectionPool::default(), Dispatcher::new());
    let unpooled = benchmark_client(
        ConnectionPool::new(0, Duration::from_secs(60)),
        Dispatcher::new(),
    );
    let request = benchmark_request("/v1/ping");

    let mut group = c.benchmark_group("execute");
    group.sample_size(80);
    group.bench_function("pooled_connection", |b| {
        b.iter(|| {
            let response = pooled
                .new_call(request.clone())
                .execute()
                .expect("execute pooled call");
            black_box(response.status());
        });
    });
    group.bench_function("fresh_connection", |b| {
        b.iter(|| {
            let response = unpooled
                .new_call(request.clone())
                .execute()
                .expect("execute unpooled call");
            black_box(response.status());
        });
    });
    group.finish();
}

fn bench_enqueue(c: &mut Criterion) {
    let client = benchmark_client(
        ConnectionPool::default(),
        Dispatcher::with_executor(Arc::new(InlineExecutor)),
    );
    let request = benchmark_request("/v1/jobs");

    let mut group = c.benchmark_group("enqueue_inline");
    group.sample_size(40);
    for batch in [1_usize, 16, 64] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let completed = Arc::new(AtomicUsize::new(0));
            b.iter(|| {
                for _ in 0..batch {
                    let completed = Arc::clone(&completed);
                    client
                        .new_call(request.clone())
                        .enqueue(move |_call, result| {
                            if result.is_ok() {
                                completed.fetch_add(1, Ordering::Relaxed);
                            }
                        })
                        .expect("enqueue benchmark call");
                }
            });
            black_box(completed.load(Ordering::Relaxed));
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(1))
        .measurement_time(Duration::from_secs(4));
    targets = bench_execute, bench_enqueue
);
criterion_main!(benches);
