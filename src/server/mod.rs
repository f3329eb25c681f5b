//! The gRPC lease server.
//!
//! Serves `easyflake.Sequence/LiveStream`: every live client stream holds
//! one sequence value of its requested bit-width, taken from a shared
//! [`SequencePool`]. The lease is returned the moment the stream ends, on
//! any path — client disconnect, cancellation, or server shutdown. A
//! standard gRPC health service is exposed alongside.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::proto::sequence_server::{Sequence, SequenceServer};
use crate::proto::{SequenceReply, SequenceRequest};
use crate::sequence::SequencePool;
use crate::{Error, Result};

/// Base interval between heartbeat replies on a held stream. The actual
/// pause is jittered to half–thrice this value so streams opened together
/// do not burst together.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// Lease servicer behind the `Sequence` RPC service.
///
/// Cheap to clone; clones share the pool and the shutdown token.
#[derive(Clone)]
pub struct SequenceService {
    pool: Arc<Mutex<SequencePool>>,
    heartbeat: Duration,
    shutdown: CancellationToken,
}

impl Default for SequenceService {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceService {
    /// Create a servicer with empty pools and the default heartbeat.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: Arc::new(Mutex::new(SequencePool::new())),
            heartbeat: DEFAULT_HEARTBEAT,
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the heartbeat base interval.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Returns the lease when the stream task finishes, whatever made it
/// finish.
struct LeaseGuard {
    pool: Arc<Mutex<SequencePool>>,
    bits: u32,
    sequence: u64,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(err) = self.pool.lock().push(self.bits, self.sequence) {
            debug!("failed to return lease {}: {err}", self.sequence);
        } else {
            debug!(sequence = self.sequence, "lease released");
        }
    }
}

#[tonic::async_trait]
impl Sequence for SequenceService {
    type LiveStreamStream = ReceiverStream<std::result::Result<SequenceReply, Status>>;

    async fn live_stream(
        &self,
        request: Request<SequenceRequest>,
    ) -> std::result::Result<Response<Self::LiveStreamStream>, Status> {
        let bits = request.get_ref().bits;

        let sequence = {
            let mut pool = self.pool.lock();
            match pool.pop(bits) {
                Ok(sequence) => sequence,
                Err(err @ Error::SequenceOverflow { .. }) => {
                    return Err(Status::out_of_range(err.to_string()));
                }
                Err(err) => return Err(Status::invalid_argument(err.to_string())),
            }
        };
        debug!(sequence, bits, "lease acquired");

        let lease = LeaseGuard {
            pool: Arc::clone(&self.pool),
            bits,
            sequence,
        };
        let heartbeat = self.heartbeat;
        let shutdown = self.shutdown.clone();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            // Dropped on every exit below, returning the lease.
            let _lease = lease;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    sent = tx.send(Ok(SequenceReply { sequence })) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                let pause = heartbeat.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(pause) => {}
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Serve `service` on an already-bound listener until `signal` resolves.
///
/// When `signal` fires, every live stream is cancelled — returning its
/// lease — and the server drains before returning.
///
/// # Errors
///
/// Propagates transport failures from the underlying server.
pub async fn serve_with_incoming(
    service: SequenceService,
    listener: TcpListener,
    signal: impl Future<Output = ()> + Send,
) -> Result<()> {
    let drain = service.shutdown.clone();

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<SequenceServer<SequenceService>>()
        .await;

    Server::builder()
        .add_service(health_service)
        .add_service(SequenceServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            signal.await;
            info!("stopping server");
            drain.cancel();
        })
        .await?;
    Ok(())
}

/// Bind `addr` and serve the lease service until `signal` resolves.
///
/// # Errors
///
/// Returns [`Error::Io`] when the address cannot be bound (typically the
/// port is taken) and transport errors from the running server.
pub async fn serve(addr: SocketAddr, signal: impl Future<Output = ()> + Send) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("lease server listening on {}", listener.local_addr()?);
    serve_with_incoming(SequenceService::new(), listener, signal).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flake::EasyFlake;
    use crate::proto::sequence_client::SequenceClient;
    use crate::NodeIdPool;
    use std::collections::HashSet;
    use tokio::sync::oneshot;
    use tonic::transport::Endpoint;
    use tonic::Code;

    async fn spawn_server(heartbeat: Duration) -> (SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let service = SequenceService::new().with_heartbeat(heartbeat);
        tokio::spawn(async move {
            serve_with_incoming(service, listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });
        (addr, tx)
    }

    async fn connect(addr: SocketAddr) -> SequenceClient<tonic::transport::Channel> {
        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        SequenceClient::new(channel)
    }

    #[tokio::test]
    async fn streams_hold_distinct_leases_and_reclaim_on_close() {
        let (addr, shutdown) = spawn_server(Duration::from_millis(20)).await;
        let mut client = connect(addr).await;

        let mut streams = Vec::new();
        let mut values = HashSet::new();
        for _ in 0..4 {
            let mut stream = client
                .live_stream(SequenceRequest { bits: 2 })
                .await
                .unwrap()
                .into_inner();
            values.insert(stream.message().await.unwrap().unwrap().sequence);
            streams.push(stream);
        }
        assert_eq!(values, (0..4).collect());

        // The width is exhausted: a fifth stream is turned away.
        let status = match client.live_stream(SequenceRequest { bits: 2 }).await {
            Err(status) => status,
            Ok(response) => response.into_inner().message().await.unwrap_err(),
        };
        assert_eq!(status.code(), Code::OutOfRange);

        // Closing one stream frees exactly its value for the next caller.
        drop(streams.remove(1));
        let mut freed = None;
        for _ in 0..200 {
            if let Ok(response) = client.live_stream(SequenceRequest { bits: 2 }).await {
                if let Ok(Some(reply)) = response.into_inner().message().await {
                    freed = Some(reply.sequence);
                    break;
                }
            }
            // Still exhausted; the server has not noticed the close yet.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(freed, Some(1));

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn oversized_widths_are_rejected() {
        let (addr, shutdown) = spawn_server(Duration::from_millis(20)).await;
        let mut client = connect(addr).await;

        let status = match client.live_stream(SequenceRequest { bits: 64 }).await {
            Err(status) => status,
            Ok(response) => response.into_inner().message().await.unwrap_err(),
        };
        assert_eq!(status.code(), Code::InvalidArgument);

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn heartbeats_keep_restating_the_lease() {
        let (addr, shutdown) = spawn_server(Duration::from_millis(10)).await;
        let mut client = connect(addr).await;

        let mut stream = client
            .live_stream(SequenceRequest { bits: 4 })
            .await
            .unwrap()
            .into_inner();
        let first = stream.message().await.unwrap().unwrap().sequence;
        for _ in 0..3 {
            assert_eq!(stream.message().await.unwrap().unwrap().sequence, first);
        }

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn shutdown_ends_live_streams() {
        let (addr, shutdown) = spawn_server(Duration::from_millis(10)).await;
        let mut client = connect(addr).await;

        let mut stream = client
            .live_stream(SequenceRequest { bits: 4 })
            .await
            .unwrap()
            .into_inner();
        stream.message().await.unwrap().unwrap();

        let _ = shutdown.send(());
        // The stream terminates: either a clean end or a cancellation
        // status, but never an endless hang.
        loop {
            match stream.message().await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn node_id_pool_leases_through_a_live_server() {
        let (addr, shutdown) = spawn_server(Duration::from_millis(10)).await;

        let pool = NodeIdPool::rpc_with_timeout(addr.to_string(), 10, Duration::from_secs(5));
        let node_id = tokio::task::spawn_blocking(move || pool.get()).await.unwrap().unwrap();
        assert_eq!(node_id, 0);

        let _ = shutdown.send(());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn easyflake_generates_ids_with_a_leased_node_id() {
        let (addr, shutdown) = spawn_server(Duration::from_millis(10)).await;

        let pool = NodeIdPool::rpc_with_timeout(addr.to_string(), 8, Duration::from_secs(5));
        let flake = tokio::task::spawn_blocking(move || EasyFlake::new(pool))
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<u64> = tokio::task::spawn_blocking(move || {
            (0..64).map(|_| flake.next_id().unwrap()).collect()
        })
        .await
        .unwrap();

        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

        let _ = shutdown.send(());
    }
}
