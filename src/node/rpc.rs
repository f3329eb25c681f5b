//! Node-ID leasing over the gRPC lease server.
//!
//! The listener holds one `LiveStream` call open for as long as the lease
//! lives; every reply restates the leased sequence. Status codes steer the
//! worker: `CANCELLED` ends it, `OUT_OF_RANGE` means the server ran out of
//! values and is worth retrying, anything else is fatal.

use tokio::runtime::{Builder, Runtime};
use tonic::codec::Streaming;
use tonic::transport::Endpoint;
use tonic::{Code, Status};
use tracing::{debug, error};

use super::{LeaseEvent, LeaseListener, LeaseSource};
use crate::proto::sequence_client::SequenceClient;
use crate::proto::{SequenceReply, SequenceRequest};
use crate::{Error, Result};

pub(super) struct RpcLeaseSource {
    endpoint: String,
    bits: u32,
}

impl RpcLeaseSource {
    pub(super) fn new(endpoint: String, bits: u32) -> Self {
        Self { endpoint, bits }
    }
}

impl LeaseSource for RpcLeaseSource {
    fn listener(&self) -> Result<Box<dyn LeaseListener>> {
        // The worker thread is synchronous; the stream runs on its own
        // single-threaded runtime.
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Box::new(RpcLeaseListener {
            endpoint: normalize_endpoint(&self.endpoint),
            bits: self.bits,
            runtime,
            stream: None,
        }))
    }
}

/// Channels need a scheme; bare `host:port` endpoints get plaintext HTTP.
fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_owned()
    } else {
        format!("http://{endpoint}")
    }
}

struct RpcLeaseListener {
    endpoint: String,
    bits: u32,
    runtime: Runtime,
    stream: Option<Streaming<SequenceReply>>,
}

impl RpcLeaseListener {
    async fn open_stream(endpoint: String, bits: u32) -> Result<Streaming<SequenceReply>> {
        let channel = Endpoint::from_shared(endpoint)?.connect().await?;
        let mut client = SequenceClient::new(channel);
        let reply = client.live_stream(SequenceRequest { bits }).await?;
        Ok(reply.into_inner())
    }

    fn map_status(&self, status: Status) -> Result<LeaseEvent> {
        match status.code() {
            Code::Cancelled => Ok(LeaseEvent::Closed),
            Code::OutOfRange => {
                debug!(bits = self.bits, "lease server is out of sequences");
                Ok(LeaseEvent::Pending)
            }
            Code::Unavailable => {
                error!("connection to the lease server is closed");
                Err(Error::Connection(status.to_string()))
            }
            _ => Err(Error::Rpc(status)),
        }
    }
}

impl LeaseListener for RpcLeaseListener {
    fn next_lease(&mut self) -> Result<LeaseEvent> {
        if self.stream.is_none() {
            let opened = self
                .runtime
                .block_on(Self::open_stream(self.endpoint.clone(), self.bits));
            match opened {
                Ok(stream) => self.stream = Some(stream),
                Err(Error::Rpc(status)) => return self.map_status(status),
                Err(err) => return Err(err),
            }
        }

        let runtime = &self.runtime;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(LeaseEvent::Pending);
        };
        match runtime.block_on(stream.message()) {
            Ok(Some(reply)) => Ok(LeaseEvent::Assigned(reply.sequence)),
            Ok(None) => {
                self.stream = None;
                Ok(LeaseEvent::Closed)
            }
            Err(status) => {
                self.stream = None;
                self.map_status(status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeIdPool;
    use std::time::Duration;

    #[test]
    fn bare_endpoints_get_a_scheme() {
        assert_eq!(normalize_endpoint("localhost:50051"), "http://localhost:50051");
        assert_eq!(normalize_endpoint("http://a:1"), "http://a:1");
        assert_eq!(normalize_endpoint("https://a:1"), "https://a:1");
    }

    #[test]
    fn status_codes_steer_the_worker() {
        let listener = RpcLeaseListener {
            endpoint: "http://localhost:1".into(),
            bits: 4,
            runtime: Builder::new_current_thread().enable_all().build().unwrap(),
            stream: None,
        };
        assert!(matches!(
            listener.map_status(Status::cancelled("bye")),
            Ok(LeaseEvent::Closed)
        ));
        assert!(matches!(
            listener.map_status(Status::out_of_range("exhausted")),
            Ok(LeaseEvent::Pending)
        ));
        assert!(matches!(
            listener.map_status(Status::unavailable("gone")),
            Err(Error::Connection(_))
        ));
        assert!(matches!(
            listener.map_status(Status::internal("boom")),
            Err(Error::Rpc(_))
        ));
    }

    #[test]
    fn pool_surfaces_connection_error_when_no_server_listens() {
        // Bind and drop to find a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = NodeIdPool::rpc_with_timeout(
            format!("127.0.0.1:{port}"),
            8,
            Duration::from_secs(2),
        );
        assert!(matches!(pool.get(), Err(Error::Connection(_))));
    }
}
