//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use tunnel_balancer::config::BalancerConfig;
use tunnel_balancer::health::{HealthFlag, HealthSnapshot};
use tunnel_balancer::lifecycle::Shutdown;
use tunnel_balancer::load_balancer::{Request, Scheduler, SchedulerHandle, SchedulerSettings, SchedulerStats};
use tunnel_balancer::net::{BoxedIo, ConnectionTracker};
use tunnel_balancer::tunnel::{Dialer, Multiplexer, Tunnel, TunnelError};

/// A mock backend that greets every connection with `tag\n`, then echoes.
pub struct TaggedBackend {
    pub addr: String,
    pub accepted: Arc<AtomicUsize>,
}

pub async fn start_tagged_backend(tag: &'static str) -> TaggedBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if socket.write_all(format!("{}\n", tag).as_bytes()).await.is_err() {
                    return;
                }
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    TaggedBackend { addr, accepted }
}

/// A mock backend that greets with `tag\n`, holds the connection for
/// `hold`, then hangs up. Stands in for a server with that latency.
pub async fn start_delayed_backend(tag: &'static str, hold: Duration) -> TaggedBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if socket.write_all(format!("{}\n", tag).as_bytes()).await.is_err() {
                    return;
                }
                tokio::time::sleep(hold).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    TaggedBackend { addr, accepted }
}

/// An address nothing listens on.
pub async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// A scheduler running on its own task.
pub struct TestScheduler {
    pub handle: SchedulerHandle,
    pub shutdown: Shutdown,
    pub tracker: ConnectionTracker,
    pub task: JoinHandle<()>,
}

impl TestScheduler {
    pub fn start(config: &BalancerConfig, dialer: Arc<dyn Dialer>) -> Self {
        let shutdown = Shutdown::new();
        let tracker = ConnectionTracker::new();
        let (scheduler, handle) = Scheduler::new(
            SchedulerSettings::from_config(config),
            dialer,
            tracker.clone(),
            shutdown.clone(),
        );
        let task = tokio::spawn(scheduler.run());
        Self {
            handle,
            shutdown,
            tracker,
            task,
        }
    }

    pub async fn report_healthy(&self, addrs: &[&str]) {
        let snapshot: HealthSnapshot = addrs
            .iter()
            .map(|a| (a.to_string(), HealthFlag::Up))
            .collect();
        self.handle.status().send(snapshot).await.unwrap();
    }

    /// Submit a client connection; returns the client's end.
    pub async fn connect(&self) -> Client {
        let (client, server) = tokio::io::duplex(4096);
        self.handle
            .jobs()
            .send(Request::new(Box::new(server), "test-client"))
            .await
            .unwrap();
        Client::new(client)
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.handle.stats().await.unwrap()
    }

    /// Poll stats until `cond` holds (panics after 5 s).
    pub async fn wait_for(&self, what: &str, cond: impl Fn(&SchedulerStats) -> bool) -> SchedulerStats {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = self.stats().await;
            if cond(&stats) {
                return stats;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}: {:?}", what, stats);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        self.task.await.unwrap();
    }
}

/// Client side of a forwarded connection.
pub struct Client {
    reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: tokio::io::WriteHalf<DuplexStream>,
}

impl Client {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// First line sent by the backend, or `None` if closed without data.
    pub async fn greeting(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = within(self.reader.read_line(&mut line)).await.unwrap();
        (n > 0).then(|| line.trim_end().to_string())
    }

    pub async fn echo(&mut self, payload: &[u8]) -> Vec<u8> {
        self.writer.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        within(self.reader.read_exact(&mut buf)).await.unwrap();
        buf
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        let mut rest = Vec::new();
        let _ = within(self.reader.read_to_end(&mut rest)).await;
    }
}

/// Await `fut`, failing the test after 5 s.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation timed out")
}

/// Tunnel that opens plain TCP connections to the backend as its streams.
pub struct DirectTunnel {
    target: String,
    next_id: AtomicU32,
    closes: Arc<AtomicUsize>,
}

impl Multiplexer for DirectTunnel {
    fn open_stream(&self) -> BoxFuture<'_, Result<BoxedIo, TunnelError>> {
        Box::pin(async move {
            self.next_id.fetch_add(2, Ordering::SeqCst);
            let stream = TcpStream::connect(self.target.as_str())
                .await
                .map_err(TunnelError::Dial)?;
            Ok(Box::new(stream) as BoxedIo)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<Duration, TunnelError>> {
        Box::pin(async { Ok(Duration::ZERO) })
    }

    fn next_stream_id(&self) -> u32 {
        self.next_id.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Dialer handing out [`DirectTunnel`]s to a fixed backend.
///
/// Dials after the first one take `slow_after_first` to complete.
pub struct DirectDialer {
    pub target: String,
    pub dials: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub slow_after_first: Duration,
}

impl DirectDialer {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            dials: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            slow_after_first: Duration::ZERO,
        }
    }
}

impl Dialer for DirectDialer {
    fn dial(&self, _agent: String) -> BoxFuture<'static, Result<Tunnel, TunnelError>> {
        let previous = self.dials.fetch_add(1, Ordering::SeqCst);
        let delay = if previous == 0 {
            Duration::ZERO
        } else {
            self.slow_after_first
        };
        let tunnel = DirectTunnel {
            target: self.target.clone(),
            next_id: AtomicU32::new(1),
            closes: self.closes.clone(),
        };
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(Tunnel::new(Box::new(tunnel), None))
        })
    }
}

/// Dialer that never connects.
pub struct UnreachableDialer;

impl Dialer for UnreachableDialer {
    fn dial(&self, agent: String) -> BoxFuture<'static, Result<Tunnel, TunnelError>> {
        Box::pin(async move {
            Err(TunnelError::Dial(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} unreachable", agent),
            )))
        })
    }
}
