//! In-memory tunnels for unit tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::net::connection::BoxedIo;
use crate::tunnel::{Multiplexer, Tunnel, TunnelError};

#[derive(Debug, Default)]
struct Counters {
    closes: AtomicUsize,
    opened: AtomicUsize,
    next_id: AtomicU32,
}

/// Observer handle for a [`FakeTunnel`].
#[derive(Debug, Clone)]
pub struct FakeTunnelState(Arc<Counters>);

impl FakeTunnelState {
    pub fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.0.opened.load(Ordering::SeqCst)
    }

    pub fn set_next_stream_id(&self, id: u32) {
        self.0.next_id.store(id, Ordering::SeqCst);
    }
}

/// A tunnel whose streams are in-memory pipes, or that always fails.
pub struct FakeTunnel {
    state: FakeTunnelState,
    fail: Option<fn() -> TunnelError>,
}

impl FakeTunnel {
    pub fn healthy() -> (Tunnel, FakeTunnelState) {
        Self::build(None)
    }

    pub fn failing(fail: fn() -> TunnelError) -> (Tunnel, FakeTunnelState) {
        Self::build(Some(fail))
    }

    fn build(fail: Option<fn() -> TunnelError>) -> (Tunnel, FakeTunnelState) {
        let counters = Counters::default();
        counters.next_id.store(1, Ordering::SeqCst);
        let state = FakeTunnelState(Arc::new(counters));
        let fake = FakeTunnel {
            state: state.clone(),
            fail,
        };
        (Tunnel::new(Box::new(fake), None), state)
    }
}

impl Multiplexer for FakeTunnel {
    fn open_stream(&self) -> BoxFuture<'_, Result<BoxedIo, TunnelError>> {
        Box::pin(async move {
            if let Some(fail) = self.fail {
                return Err(fail());
            }
            self.state.0.opened.fetch_add(1, Ordering::SeqCst);
            self.state.0.next_id.fetch_add(2, Ordering::SeqCst);
            let (near, _far) = tokio::io::duplex(64);
            Ok(Box::new(near) as BoxedIo)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<Duration, TunnelError>> {
        Box::pin(async { Ok(Duration::ZERO) })
    }

    fn next_stream_id(&self) -> u32 {
        self.state.0.next_id.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.state.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}
