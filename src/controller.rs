//! Controller: worker-pool RPC host
//!
//! Owns N paired UDP+TCP endpoints on consecutive ports (worker `i` at
//! `base + 2i` / `base + 2i + 1`) and presents them as one logical
//! endpoint. Handlers and client stubs are installed by explicit
//! registration; every paired endpoint shares the same handler table.
//!
//! Client dispatch pops an endpoint out of the per-remote queue, maps
//! the remote to the matching worker offset, sends, and returns the
//! endpoint to the queue, so at most one call is in flight per endpoint
//! per remote. That is what keeps the event-FIFO waiter discipline
//! sound over TCP.

use crate::codec::{decode_payload, encode_payload, EnvelopeCodec};
use crate::config::SimurghConfig;
use crate::models::{ErrorPayload, NodeAddr};
use crate::snowflake::SnowflakeGenerator;
use crate::transport::tcp::TcpTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{HandlerFn, HandlerTable, StreamHandlerFn, TransportError};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Queue of available endpoint indices for one remote.
#[derive(Clone)]
struct EndpointQueue {
    tx: mpsc::UnboundedSender<usize>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<usize>>>,
}

impl EndpointQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    async fn pop(&self) -> Result<SlotGuard, TransportError> {
        let idx = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ChannelClosed)?;

        Ok(SlotGuard {
            queue: self.clone(),
            idx,
        })
    }

    fn push(&self, idx: usize) {
        let _ = self.tx.send(idx);
    }
}

/// Holds a popped endpoint slot and returns it on drop, so callers
/// cancelled mid-call (bounded probes) never shrink the pool.
struct SlotGuard {
    queue: EndpointQueue,
    idx: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.queue.push(self.idx);
    }
}

pub struct Controller {
    host: String,
    port: u16,
    workers: usize,
    codec: Arc<EnvelopeCodec>,
    handlers: Arc<HandlerTable>,
    semaphore: Arc<Semaphore>,
    udp_endpoints: Vec<Arc<UdpTransport>>,
    tcp_endpoints: Vec<Arc<TcpTransport>>,
    udp_queues: tokio::sync::Mutex<HashMap<NodeAddr, EndpointQueue>>,
    tcp_queues: tokio::sync::Mutex<HashMap<NodeAddr, EndpointQueue>>,
}

impl Controller {
    pub fn new(host: &str, port: u16, workers: usize, config: &SimurghConfig) -> Self {
        let workers = workers.max(1);
        let codec = Arc::new(EnvelopeCodec::new(&config.auth_secret));
        let handlers = Arc::new(HandlerTable::new());
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));

        let instance_base = u64::from(rand::random::<u16>() & 0x3ff);

        let mut udp_endpoints = Vec::with_capacity(workers);
        let mut tcp_endpoints = Vec::with_capacity(workers);

        for idx in 0..workers {
            let instance = (instance_base + idx as u64) & 0x3ff;
            let offset = (idx * 2) as u16;

            udp_endpoints.push(Arc::new(UdpTransport::new(
                host,
                port + offset,
                Arc::new(SnowflakeGenerator::new(instance)),
                Arc::clone(&codec),
                Arc::clone(&handlers),
                Arc::clone(&semaphore),
            )));

            tcp_endpoints.push(Arc::new(TcpTransport::new(
                host,
                port + offset + 1,
                Arc::new(SnowflakeGenerator::new(instance)),
                Arc::clone(&codec),
                Arc::clone(&handlers),
                Arc::clone(&semaphore),
                config.tcp_connect_retries,
            )));
        }

        Self {
            host: host.to_string(),
            port,
            workers,
            codec,
            handlers,
            semaphore,
            udp_endpoints,
            tcp_endpoints,
            udp_queues: tokio::sync::Mutex::new(HashMap::new()),
            tcp_queues: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn addr(&self) -> NodeAddr {
        (self.host.clone(), self.port)
    }

    pub fn codec(&self) -> Arc<EnvelopeCodec> {
        Arc::clone(&self.codec)
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    /// Install a typed request handler on every paired endpoint.
    pub fn register_handler<Req, Res, F, Fut>(&self, event: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(u64, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: HandlerFn = Arc::new(move |shard_id, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request: Req = decode_payload(&payload).map_err(|err| err.to_string())?;
                let response = handler(shard_id, request).await?;
                encode_payload(&response).map_err(|err| err.to_string())
            })
        });

        self.handlers.register(event, wrapped);
    }

    /// Install a typed stream handler: it produces response records
    /// through the channel until it returns.
    pub fn register_stream_handler<Req, Res, F, Fut>(&self, event: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(u64, Req, mpsc::UnboundedSender<Res>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: StreamHandlerFn = Arc::new(move |shard_id, payload, raw_tx| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request: Req = decode_payload(&payload).map_err(|err| err.to_string())?;

                let (typed_tx, mut typed_rx) = mpsc::unbounded_channel::<Res>();
                let forwarder = tokio::spawn(async move {
                    while let Some(item) = typed_rx.recv().await {
                        match encode_payload(&item) {
                            Ok(bytes) => {
                                if raw_tx.send(bytes).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!("stream record encoding failed: {err}");
                                break;
                            }
                        }
                    }
                });

                let result = handler(shard_id, request, typed_tx).await;
                let _ = forwarder.await;
                result
            })
        });

        self.handlers.register_stream(event, wrapped);
    }

    /// Bind and serve every paired endpoint.
    pub async fn start_server(&self) -> Result<(), TransportError> {
        for endpoint in &self.udp_endpoints {
            endpoint.connect().await?;
        }
        for endpoint in &self.tcp_endpoints {
            endpoint.connect().await?;
        }

        info!(
            "controller serving {} worker pair(s) from {}:{}",
            self.workers, self.host, self.port
        );
        Ok(())
    }

    /// Install the connection pool for a remote: queue every endpoint
    /// and pre-dial the TCP side.
    pub async fn start_client(&self, remote: &NodeAddr) -> Result<(), TransportError> {
        {
            let mut queues = self.udp_queues.lock().await;
            if queues.contains_key(remote) {
                return Ok(());
            }

            let queue = EndpointQueue::new();
            for idx in 0..self.workers {
                queue.push(idx);
            }
            queues.insert(remote.clone(), queue);
        }

        {
            let mut queues = self.tcp_queues.lock().await;
            let queue = EndpointQueue::new();
            for idx in 0..self.workers {
                queue.push(idx);
            }
            queues.insert(remote.clone(), queue);
        }

        for (idx, endpoint) in self.tcp_endpoints.iter().enumerate() {
            let mapped = self.mapped_tcp(remote, idx);
            endpoint.open_pool((mapped.0.as_str(), mapped.1)).await?;
        }

        debug!("client pool installed for {}:{}", remote.0, remote.1);
        Ok(())
    }

    /// Idempotent pool installation, used when gossip introduces an
    /// unseen peer.
    pub async fn extend_client(&self, remote: &NodeAddr) -> Result<(), TransportError> {
        self.start_client(remote).await
    }

    /// Tear down and re-dial the pools for a remote (peer revived).
    pub async fn refresh_clients(&self, remote: &NodeAddr) -> Result<(), TransportError> {
        self.remove_clients(remote).await;
        self.start_client(remote).await
    }

    /// Drop the pools for a remote (peer reaped).
    pub async fn remove_clients(&self, remote: &NodeAddr) {
        self.udp_queues.lock().await.remove(remote);
        self.tcp_queues.lock().await.remove(remote);

        for (idx, endpoint) in self.tcp_endpoints.iter().enumerate() {
            let mapped = self.mapped_tcp(remote, idx);
            endpoint.remove_pool((mapped.0.as_str(), mapped.1)).await;
        }

        debug!("client pool removed for {}:{}", remote.0, remote.1);
    }

    fn mapped_udp(&self, remote: &NodeAddr, idx: usize) -> NodeAddr {
        (remote.0.clone(), remote.1 + (idx * 2) as u16)
    }

    fn mapped_tcp(&self, remote: &NodeAddr, idx: usize) -> NodeAddr {
        (remote.0.clone(), remote.1 + (idx * 2) as u16 + 1)
    }

    async fn queue_for(
        queues: &tokio::sync::Mutex<HashMap<NodeAddr, EndpointQueue>>,
        remote: &NodeAddr,
    ) -> Result<EndpointQueue, TransportError> {
        queues
            .lock()
            .await
            .get(remote)
            .cloned()
            .ok_or(TransportError::NotConnected)
    }

    /// Send a typed request over UDP and parse the typed response.
    pub async fn send<Req, Res>(
        &self,
        event: &str,
        remote: &NodeAddr,
        message: &Req,
    ) -> Result<(u64, Res), TransportError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let queue = Self::queue_for(&self.udp_queues, remote).await?;
        let slot = queue.pop().await?;

        let mapped = self.mapped_udp(remote, slot.idx);
        let payload = encode_payload(message)?;
        let (shard_id, bytes) = self.udp_endpoints[slot.idx]
            .send(event, payload, (mapped.0.as_str(), mapped.1))
            .await?;

        Ok((shard_id, parse_reply(&bytes)?))
    }

    /// Send a typed request over TCP and parse the typed response.
    pub async fn send_tcp<Req, Res>(
        &self,
        event: &str,
        remote: &NodeAddr,
        message: &Req,
    ) -> Result<(u64, Res), TransportError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let queue = Self::queue_for(&self.tcp_queues, remote).await?;
        let slot = queue.pop().await?;

        let mapped = self.mapped_tcp(remote, slot.idx);
        let payload = encode_payload(message)?;
        let (shard_id, bytes) = self.tcp_endpoints[slot.idx]
            .send(event, payload, (mapped.0.as_str(), mapped.1))
            .await?;

        Ok((shard_id, parse_reply(&bytes)?))
    }

    /// Open a typed UDP stream; malformed frames end the sequence.
    pub async fn stream<Req, Res>(
        &self,
        event: &str,
        remote: &NodeAddr,
        message: &Req,
    ) -> Result<mpsc::UnboundedReceiver<(u64, Res)>, TransportError>
    where
        Req: Serialize,
        Res: DeserializeOwned + Send + 'static,
    {
        let queue = Self::queue_for(&self.udp_queues, remote).await?;
        let slot = queue.pop().await?;

        let mapped = self.mapped_udp(remote, slot.idx);
        let payload = encode_payload(message)?;
        let raw = self.udp_endpoints[slot.idx]
            .stream(event, payload, (mapped.0.as_str(), mapped.1))
            .await?;

        Ok(parse_stream(raw))
    }

    /// Open a typed TCP stream; malformed frames end the sequence.
    pub async fn stream_tcp<Req, Res>(
        &self,
        event: &str,
        remote: &NodeAddr,
        message: &Req,
    ) -> Result<mpsc::UnboundedReceiver<(u64, Res)>, TransportError>
    where
        Req: Serialize,
        Res: DeserializeOwned + Send + 'static,
    {
        let queue = Self::queue_for(&self.tcp_queues, remote).await?;
        let slot = queue.pop().await?;

        let mapped = self.mapped_tcp(remote, slot.idx);
        let payload = encode_payload(message)?;
        let raw = self.tcp_endpoints[slot.idx]
            .stream(event, payload, (mapped.0.as_str(), mapped.1))
            .await?;

        Ok(parse_stream(raw))
    }

    /// Tear everything down in reverse creation order.
    pub async fn close(&self) {
        for endpoint in &self.tcp_endpoints {
            endpoint.close().await;
        }
        for endpoint in &self.udp_endpoints {
            endpoint.close().await;
        }

        self.udp_queues.lock().await.clear();
        self.tcp_queues.lock().await.clear();
    }
}

/// Parse a response body, surfacing error records as handler failures.
fn parse_reply<Res: DeserializeOwned>(bytes: &[u8]) -> Result<Res, TransportError> {
    match decode_payload::<Res>(bytes) {
        Ok(parsed) => Ok(parsed),
        Err(parse_err) => match decode_payload::<ErrorPayload>(bytes) {
            Ok(error) => Err(TransportError::Handler(error.error)),
            Err(_) => Err(TransportError::Codec(parse_err.to_string())),
        },
    }
}

fn parse_stream<Res: DeserializeOwned + Send + 'static>(
    mut raw: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
) -> mpsc::UnboundedReceiver<(u64, Res)> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some((shard_id, bytes)) = raw.recv().await {
            match decode_payload::<Res>(&bytes) {
                Ok(item) => {
                    if tx.send((shard_id, item)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("stream frame parse failed: {err}");
                    break;
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HealthCheck, HealthStatus};

    fn test_config() -> SimurghConfig {
        SimurghConfig::with_secret("controller-test-secret")
    }

    #[tokio::test]
    async fn test_paired_ports() {
        let config = test_config();
        let controller = Controller::new("127.0.0.1", 17300, 2, &config);

        assert_eq!(controller.udp_endpoints[0].port(), 17300);
        assert_eq!(controller.tcp_endpoints[0].port(), 17301);
        assert_eq!(controller.udp_endpoints[1].port(), 17302);
        assert_eq!(controller.tcp_endpoints[1].port(), 17303);
    }

    #[tokio::test]
    async fn test_typed_round_trip_between_controllers() {
        let config = test_config();

        let server = Controller::new("127.0.0.1", 17310, 1, &config);
        server.register_handler(
            "register_health_update",
            |_shard, check: HealthCheck| async move {
                Ok(HealthCheck::new(&check.source(), HealthStatus::Healthy))
            },
        );
        server.start_server().await.unwrap();

        let client = Controller::new("127.0.0.1", 17320, 1, &config);
        client.start_server().await.unwrap();

        let remote = ("127.0.0.1".to_string(), 17310);
        client.start_client(&remote).await.unwrap();

        let request = HealthCheck::new(&client.addr(), HealthStatus::Healthy);
        let (shard_id, reply): (u64, HealthCheck) = client
            .send("register_health_update", &remote, &request)
            .await
            .unwrap();

        assert!(shard_id > 0);
        assert_eq!(reply.status, HealthStatus::Healthy);

        let (_, tcp_reply): (u64, HealthCheck) = client
            .send_tcp("register_health_update", &remote, &request)
            .await
            .unwrap();
        assert_eq!(tcp_reply.status, HealthStatus::Healthy);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_stream_yields_frames_until_closed() {
        let config = test_config();

        let server = Controller::new("127.0.0.1", 17350, 1, &config);
        server.register_stream_handler(
            "node_feed",
            |_shard, seed: HealthCheck, tx: mpsc::UnboundedSender<HealthCheck>| async move {
                for _ in 0..3 {
                    let frame = HealthCheck::new(&seed.source(), HealthStatus::Healthy);
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(())
            },
        );
        server.start_server().await.unwrap();

        let client = Controller::new("127.0.0.1", 17360, 1, &config);
        client.start_server().await.unwrap();

        let remote = ("127.0.0.1".to_string(), 17350);
        client.start_client(&remote).await.unwrap();

        let request = HealthCheck::new(&client.addr(), HealthStatus::Healthy);
        let mut feed = client
            .stream::<HealthCheck, HealthCheck>("node_feed", &remote, &request)
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some((shard_id, frame)) = feed.recv().await {
            assert!(shard_id > 0);
            received.push(frame);
        }

        assert_eq!(received.len(), 3);
        assert!(received
            .iter()
            .all(|frame| frame.status == HealthStatus::Healthy));

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_handler_failure_is_an_error_not_a_teardown() {
        let config = test_config();

        let server = Controller::new("127.0.0.1", 17330, 1, &config);
        server.register_handler("always_fails", |_shard, _check: HealthCheck| async move {
            Err::<HealthCheck, String>("boom".to_string())
        });
        server.register_handler("ping", |_shard, check: HealthCheck| async move {
            Ok::<_, String>(check)
        });
        server.start_server().await.unwrap();

        let client = Controller::new("127.0.0.1", 17340, 1, &config);
        client.start_server().await.unwrap();

        let remote = ("127.0.0.1".to_string(), 17330);
        client.start_client(&remote).await.unwrap();

        let request = HealthCheck::new(&client.addr(), HealthStatus::Healthy);

        let failure: Result<(u64, HealthCheck), _> =
            client.send("always_fails", &remote, &request).await;
        assert!(matches!(failure, Err(TransportError::Handler(_))));

        // The endpoint is still serviceable after a handler failure.
        let (_, reply): (u64, HealthCheck) = client.send("ping", &remote, &request).await.unwrap();
        assert_eq!(reply.source(), client.addr());

        client.close().await;
        server.close().await;
    }
}
