//! Node-ID lease pools.
//!
//! A [`NodeIdPool`] keeps a node-ID lease alive against a coordination
//! backend — a shared file on one host, or the lease server over gRPC —
//! and hands the current value to ID generators through a blocking
//! [`get`](NodeIdPool::get).
//!
//! The pool runs a background worker on its own OS thread, so a blocking
//! backend can never stall the caller. Worker and foreground communicate
//! through a shared node-ID word and two flags; pools constructed with the
//! same backend parameters share one worker process-wide.

mod file;
mod rpc;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, error};

use crate::{Error, Result};

pub use file::LIFESPAN;

/// Sentinel published while no lease is held; distinguishes "worker gave
/// up" from any real node ID.
pub const INVALID_NODE_ID: i64 = -255;

/// Default wait for a lease value in [`NodeIdPool::get`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One observation pulled from a lease backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEvent {
    /// The backend currently holds this node ID for us.
    Assigned(u64),
    /// No lease is available yet; try again after the refresh delay.
    Pending,
    /// The backend finished cleanly; the worker should stop.
    Closed,
}

/// Pull-based producer of lease observations.
///
/// The worker calls [`next_lease`](Self::next_lease) in a loop, sleeping a
/// randomised refresh interval between calls. An `Err` is fatal and makes
/// the pool surface [`Error::Connection`] to callers.
pub trait LeaseListener: Send {
    /// Pull the next observation, blocking as long as the backend needs.
    fn next_lease(&mut self) -> Result<LeaseEvent>;
}

/// A lease backend; creates one [`LeaseListener`] per worker run.
pub trait LeaseSource: Send + Sync {
    /// Open a fresh listener against the backend.
    ///
    /// # Errors
    ///
    /// Any error fails the worker before its first iteration.
    fn listener(&self) -> Result<Box<dyn LeaseListener>>;
}

/// State shared between the pool foreground and its worker thread.
#[derive(Debug)]
struct Shared {
    node_id: AtomicI64,
    running: AtomicBool,
    ready: Mutex<bool>,
    ready_cv: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            node_id: AtomicI64::new(INVALID_NODE_ID),
            running: AtomicBool::new(false),
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn publish(&self, value: u64) {
        self.node_id.store(value as i64, Ordering::Release);
        let mut ready = self.ready.lock();
        *ready = true;
        self.ready_cv.notify_all();
    }

    /// Publish the sentinel so waiters wake into an error, then stop.
    fn fail(&self) {
        self.node_id.store(INVALID_NODE_ID, Ordering::Release);
        {
            let mut ready = self.ready.lock();
            *ready = true;
            self.ready_cv.notify_all();
        }
        self.running.store(false, Ordering::Release);
    }

    fn stop(&self) {
        *self.ready.lock() = false;
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    kind: &'static str,
    endpoint: String,
    bits: u32,
}

struct PoolInner {
    key: PoolKey,
    timeout: Duration,
    source: Box<dyn LeaseSource>,
    shared: Arc<Shared>,
    start_lock: Mutex<()>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

/// Pools are shared process-wide per `(kind, endpoint, bits)`, so callers
/// constructing the same backend twice reuse one worker and one lease.
static REGISTRY: Lazy<Mutex<HashMap<PoolKey, Weak<PoolInner>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Asynchronously acquired node-ID lease.
///
/// Cloning is cheap and clones observe the same worker.
///
/// # Example
///
/// ```no_run
/// use easyflake::NodeIdPool;
///
/// let pool = NodeIdPool::rpc("localhost:50051", 8);
/// let node_id = pool.get()?;
/// # Ok::<(), easyflake::Error>(())
/// ```
#[derive(Clone)]
pub struct NodeIdPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for NodeIdPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdPool")
            .field("kind", &self.inner.key.kind)
            .field("endpoint", &self.inner.key.endpoint)
            .field("bits", &self.inner.key.bits)
            .finish_non_exhaustive()
    }
}

impl NodeIdPool {
    /// Pool coordinating `bits`-wide node IDs through a shared file.
    pub fn file(path: impl AsRef<Path>, bits: u32) -> Self {
        Self::file_with_timeout(path, bits, DEFAULT_TIMEOUT)
    }

    /// Like [`file`](Self::file) with an explicit [`get`](Self::get)
    /// timeout. The worker cadence is derived from the timeout and kept
    /// below half the lease lifespan so live leases never expire.
    pub fn file_with_timeout(path: impl AsRef<Path>, bits: u32, timeout: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        let key = PoolKey {
            kind: "file",
            endpoint: path.display().to_string(),
            bits,
        };
        let timeout = timeout.min(LIFESPAN);
        Self::obtain(key, timeout, move || {
            Box::new(file::FileLeaseSource::new(path, bits))
        })
    }

    /// Pool leasing `bits`-wide node IDs from the gRPC lease server.
    pub fn rpc(endpoint: impl Into<String>, bits: u32) -> Self {
        Self::rpc_with_timeout(endpoint, bits, DEFAULT_TIMEOUT)
    }

    /// Like [`rpc`](Self::rpc) with an explicit [`get`](Self::get) timeout.
    pub fn rpc_with_timeout(endpoint: impl Into<String>, bits: u32, timeout: Duration) -> Self {
        let endpoint = endpoint.into();
        let key = PoolKey {
            kind: "rpc",
            endpoint: endpoint.clone(),
            bits,
        };
        Self::obtain(key, timeout, move || {
            Box::new(rpc::RpcLeaseSource::new(endpoint, bits))
        })
    }

    /// Pool backed by a caller-supplied [`LeaseSource`].
    ///
    /// `name` takes the place of an endpoint when deduplicating pools:
    /// pools with equal `name` and `bits` share one worker.
    pub fn with_source(
        name: impl Into<String>,
        bits: u32,
        timeout: Duration,
        source: Box<dyn LeaseSource>,
    ) -> Self {
        let key = PoolKey {
            kind: "custom",
            endpoint: name.into(),
            bits,
        };
        Self::obtain(key, timeout, move || source)
    }

    fn obtain(
        key: PoolKey,
        timeout: Duration,
        make_source: impl FnOnce() -> Box<dyn LeaseSource>,
    ) -> Self {
        let mut registry = REGISTRY.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        if let Some(inner) = registry.get(&key).and_then(Weak::upgrade) {
            return Self { inner };
        }
        let inner = Arc::new(PoolInner {
            key: key.clone(),
            timeout,
            source: make_source(),
            shared: Arc::new(Shared::new()),
            start_lock: Mutex::new(()),
        });
        registry.insert(key, Arc::downgrade(&inner));
        Self { inner }
    }

    /// Bit-width of the leased node IDs.
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.inner.key.bits
    }

    /// Endpoint (or file path, or custom name) this pool coordinates on.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.key.endpoint
    }

    /// Launch the background worker. Idempotent while the worker runs;
    /// after a failure or stop the next call launches a fresh worker.
    pub fn start(&self) {
        let inner = &self.inner;
        let _guard = inner.start_lock.lock();
        if inner.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let listener = match inner.source.listener() {
            Ok(listener) => listener,
            Err(err) => {
                error!(endpoint = %inner.key.endpoint, "failed to open lease backend: {err}");
                inner.shared.fail();
                return;
            }
        };

        let shared = Arc::clone(&inner.shared);
        let timeout = inner.timeout;
        let spawned = thread::Builder::new()
            .name(format!("easyflake-lease-{}", inner.key.bits))
            .spawn(move || worker_loop(&shared, listener, timeout));
        if let Err(err) = spawned {
            error!("failed to spawn lease worker: {err}");
            inner.shared.fail();
        }
    }

    /// Current node ID, starting the worker if necessary.
    ///
    /// Blocks until the worker publishes a value, up to the pool timeout.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if no value arrived in time, or
    /// [`Error::Connection`] if the worker gave up on the backend.
    pub fn get(&self) -> Result<u64> {
        self.start();

        let shared = &self.inner.shared;
        let deadline = Instant::now() + self.inner.timeout;
        {
            let mut ready = shared.ready.lock();
            while !*ready {
                if shared.ready_cv.wait_until(&mut ready, deadline).timed_out() {
                    break;
                }
            }
            if !*ready {
                return Err(Error::Timeout(self.inner.timeout));
            }
        }

        let value = shared.node_id.load(Ordering::Acquire);
        if value == INVALID_NODE_ID {
            return Err(Error::Connection(format!(
                "no lease from {}",
                self.inner.key.endpoint
            )));
        }
        #[allow(clippy::cast_sign_loss)]
        Ok(value as u64)
    }

    /// Stop the background worker. Idempotent and safe to call from
    /// destructor paths; dropping the last clone of a pool stops it too.
    pub fn stop(&self) {
        self.inner.shared.stop();
    }
}

fn worker_loop(shared: &Shared, mut listener: Box<dyn LeaseListener>, timeout: Duration) {
    loop {
        if !shared.running() {
            return;
        }

        match listener.next_lease() {
            Ok(LeaseEvent::Assigned(value)) => {
                if !shared.running() {
                    return;
                }
                shared.publish(value);
            }
            Ok(LeaseEvent::Pending) => {}
            Ok(LeaseEvent::Closed) => {
                debug!("lease backend closed");
                shared.stop();
                return;
            }
            Err(err) => {
                error!("lease listener failed: {err}");
                shared.fail();
                return;
            }
        }

        thread::sleep(refresh_rate(timeout));
    }
}

/// Per-iteration worker sleep, sampled from `[0, timeout / 2)`; the jitter
/// decorrelates clients that started together.
fn refresh_rate(timeout: Duration) -> Duration {
    timeout.mul_f64(rand::thread_rng().gen::<f64>() / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays the scripted events, then the error if any; otherwise the
    /// last event repeats forever so worker timing cannot race the test.
    struct ScriptedListener {
        events: Vec<LeaseEvent>,
        error: Option<fn() -> Error>,
        index: usize,
    }

    impl LeaseListener for ScriptedListener {
        fn next_lease(&mut self) -> Result<LeaseEvent> {
            if self.index < self.events.len() {
                let event = self.events[self.index];
                self.index += 1;
                return Ok(event);
            }
            if let Some(error) = self.error {
                return Err(error());
            }
            Ok(self.events.last().copied().unwrap_or(LeaseEvent::Closed))
        }
    }

    struct ScriptedSource {
        events: Vec<LeaseEvent>,
        error: Option<fn() -> Error>,
    }

    impl LeaseSource for ScriptedSource {
        fn listener(&self) -> Result<Box<dyn LeaseListener>> {
            Ok(Box::new(ScriptedListener {
                events: self.events.clone(),
                error: self.error,
                index: 0,
            }))
        }
    }

    fn pool(name: &str, events: Vec<LeaseEvent>, error: Option<fn() -> Error>) -> NodeIdPool {
        NodeIdPool::with_source(
            name,
            8,
            Duration::from_millis(200),
            Box::new(ScriptedSource { events, error }),
        )
    }

    #[test]
    fn get_returns_the_published_lease() {
        let pool = pool("get-ok", vec![LeaseEvent::Assigned(42)], None);
        assert_eq!(pool.get().unwrap(), 42);
        pool.stop();
    }

    #[test]
    fn get_times_out_without_a_lease() {
        let pool = pool("get-timeout", vec![], None);
        // Closed on first pull clears the ready flag; nothing to wait for.
        assert!(matches!(pool.get(), Err(Error::Timeout(_))));
    }

    #[test]
    fn listener_error_surfaces_as_connection_error() {
        let pool = pool("get-fail", vec![], Some(|| Error::Connection("down".into())));
        assert!(matches!(pool.get(), Err(Error::Connection(_))));
    }

    #[test]
    fn equal_parameters_share_one_pool() {
        let a = pool("shared", vec![LeaseEvent::Assigned(7)], None);
        let b = pool("shared", vec![LeaseEvent::Assigned(9)], None);
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(a.get().unwrap(), b.get().unwrap());
        a.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let pool = pool("stop-twice", vec![LeaseEvent::Assigned(1)], None);
        pool.get().unwrap();
        pool.stop();
        pool.stop();
    }

    #[test]
    fn refresh_rate_stays_below_half_the_timeout() {
        let timeout = Duration::from_secs(4);
        for _ in 0..100 {
            assert!(refresh_rate(timeout) < timeout / 2);
        }
    }
}
