//! TCP transport
//!
//! Symmetric to the UDP transport, with two differences: frames are
//! u32-length-prefixed on the stream, and a fixed-size pool of
//! persistent connections is kept per remote peer. A connection is
//! checked out for the full request/response exchange, so one
//! connection never multiplexes different events concurrently; on any
//! error the connection is discarded and a replacement is dialed before
//! the pool slot is reused.

use crate::codec::{EnvelopeCodec, FrameKind};
use crate::models::ErrorPayload;
use crate::snowflake::SnowflakeGenerator;
use crate::transport::{
    dispatch, read_frame, write_frame, EndpointShared, HandlerTable, ReplySink, StreamMap,
    TransportError, WaiterMap,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// Connections kept per remote peer.
const POOL_SIZE: usize = 1;

/// Backoff between connection attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

pub struct TcpTransport {
    shared: Arc<EndpointShared>,
    semaphore: Arc<Semaphore>,
    connect_retries: u32,
    listener: Mutex<Option<JoinHandle<()>>>,
    pools: tokio::sync::Mutex<HashMap<(String, u16), Pool>>,
}

/// One pooled client connection with its own waiter discipline.
struct ClientConn {
    addr: (String, u16),
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    waiters: Arc<WaiterMap>,
    streams: Arc<StreamMap>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl ClientConn {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn discard(self) {
        self.alive.store(false, Ordering::Release);
        self.reader.abort();
        self.waiters.fail_all(TransportError::ChannelClosed);
    }
}

#[derive(Clone)]
struct Pool {
    tx: mpsc::UnboundedSender<ClientConn>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientConn>>>,
    created: Arc<AtomicUsize>,
    size: usize,
}

impl Pool {
    fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            created: Arc::new(AtomicUsize::new(0)),
            size,
        }
    }

    /// Return a connection to the pool, or retire it if it died. A
    /// retired slot is re-dialed lazily by the next checkout.
    fn restore(&self, conn: ClientConn) {
        if conn.is_alive() {
            if let Err(returned) = self.tx.send(conn) {
                debug!("pool removed while connection was checked out");
                returned.0.discard();
            }
        } else {
            self.created.fetch_sub(1, Ordering::AcqRel);
            conn.discard();
        }
    }
}

/// Holds a checked-out connection and restores it on drop, so a
/// caller cancelled mid-exchange (probe timeouts do this constantly)
/// never leaks a pool slot.
struct ConnGuard {
    conn: Option<ClientConn>,
    pool: Pool,
}

impl ConnGuard {
    fn conn(&self) -> &ClientConn {
        self.conn.as_ref().expect("connection taken")
    }

    fn into_inner(mut self) -> ClientConn {
        self.conn.take().expect("connection taken")
    }

    fn mark_dead(&self) {
        self.conn().alive.store(false, Ordering::Release);
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.restore(conn);
        }
    }
}

impl TcpTransport {
    pub fn new(
        host: &str,
        port: u16,
        id_gen: Arc<SnowflakeGenerator>,
        codec: Arc<EnvelopeCodec>,
        handlers: Arc<HandlerTable>,
        semaphore: Arc<Semaphore>,
        connect_retries: u32,
    ) -> Self {
        Self {
            shared: Arc::new(EndpointShared {
                host: host.to_string(),
                port,
                id_gen,
                codec,
                handlers,
                waiters: Arc::new(WaiterMap::new()),
                streams: Arc::new(StreamMap::new()),
            }),
            semaphore,
            connect_retries,
            listener: Mutex::new(None),
            pools: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Bind the listener and start accepting peer connections.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.listener.lock().unwrap().is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind((self.shared.host.as_str(), self.shared.port))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;

        info!(
            "tcp endpoint listening on {}:{}",
            self.shared.host, self.shared.port
        );

        let shared = Arc::clone(&self.shared);
        let acceptor = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("tcp accept failed: {err}");
                        continue;
                    }
                };

                debug!("tcp connection accepted from {peer}");
                serve_connection(Arc::clone(&shared), stream);
            }
        });

        *self.listener.lock().unwrap() = Some(acceptor);
        Ok(())
    }

    /// Pre-dial the pool for a remote so the first send does not pay
    /// connection latency.
    pub async fn open_pool(&self, addr: (&str, u16)) -> Result<(), TransportError> {
        let pool = self.pool_handle(addr).await;

        if pool.created.load(Ordering::Acquire) >= pool.size {
            return Ok(());
        }

        pool.created.fetch_add(1, Ordering::AcqRel);
        match self.dial(addr).await {
            Ok(conn) => {
                let _ = pool.tx.send(conn);
                Ok(())
            }
            Err(err) => {
                pool.created.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Drop every pooled connection for a remote.
    pub async fn remove_pool(&self, addr: (&str, u16)) {
        let removed = self
            .pools
            .lock()
            .await
            .remove(&(addr.0.to_string(), addr.1));

        if let Some(pool) = removed {
            let mut guard = pool.rx.lock().await;
            while let Ok(conn) = guard.try_recv() {
                conn.discard();
            }
        }
    }

    /// Replace every pooled connection for a remote with a fresh dial.
    pub async fn refresh_pool(&self, addr: (&str, u16)) -> Result<(), TransportError> {
        self.remove_pool(addr).await;
        self.open_pool(addr).await
    }

    async fn pool_handle(&self, addr: (&str, u16)) -> Pool {
        self.pools
            .lock()
            .await
            .entry((addr.0.to_string(), addr.1))
            .or_insert_with(|| Pool::new(POOL_SIZE))
            .clone()
    }

    async fn dial(&self, addr: (&str, u16)) -> Result<ClientConn, TransportError> {
        let mut attempt = 0u32;

        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                    if attempt >= self.connect_retries {
                        return Err(TransportError::ConnectionRefused(format!(
                            "{}:{}",
                            addr.0, addr.1
                        )));
                    }
                    attempt += 1;
                    debug!(
                        "connection to {}:{} refused, retry {attempt}/{}",
                        addr.0, addr.1, self.connect_retries
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(TransportError::Io(err.to_string())),
            }
        };

        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        let waiters = Arc::new(WaiterMap::new());
        let streams = Arc::new(StreamMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let shared = Arc::clone(&self.shared);
        let reader = {
            let writer = Arc::clone(&writer);
            let waiters = Arc::clone(&waiters);
            let streams = Arc::clone(&streams);
            let alive = Arc::clone(&alive);

            tokio::spawn(async move {
                loop {
                    match read_frame(&mut read_half).await {
                        Ok(Some(frame)) => {
                            dispatch(
                                Arc::clone(&shared),
                                Arc::clone(&waiters),
                                Arc::clone(&streams),
                                frame,
                                writer_sink(Arc::clone(&writer)),
                            )
                            .await;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!("tcp client read failed: {err}");
                            break;
                        }
                    }
                }

                alive.store(false, Ordering::Release);
                waiters.fail_all(TransportError::Io("connection closed".to_string()));
            })
        };

        Ok(ClientConn {
            addr: (addr.0.to_string(), addr.1),
            writer,
            waiters,
            streams,
            alive,
            reader,
        })
    }

    /// Check a connection out of the pool, dialing (or replacing a dead
    /// connection) so the pool never hands back a closed transport.
    async fn checkout(&self, addr: (&str, u16)) -> Result<ConnGuard, TransportError> {
        let pool = self.pool_handle(addr).await;

        let conn = {
            let mut guard = pool.rx.lock().await;
            match guard.try_recv() {
                Ok(conn) => Some(conn),
                Err(TryRecvError::Empty) => {
                    if pool.created.load(Ordering::Acquire) < pool.size {
                        None
                    } else {
                        match guard.recv().await {
                            Some(conn) => Some(conn),
                            None => return Err(TransportError::ChannelClosed),
                        }
                    }
                }
                Err(TryRecvError::Disconnected) => return Err(TransportError::ChannelClosed),
            }
        };

        let conn = match conn {
            Some(conn) if conn.is_alive() => conn,
            Some(dead) => {
                dead.discard();
                match self.dial(addr).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        pool.created.fetch_sub(1, Ordering::AcqRel);
                        return Err(err);
                    }
                }
            }
            None => {
                pool.created.fetch_add(1, Ordering::AcqRel);
                match self.dial(addr).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        pool.created.fetch_sub(1, Ordering::AcqRel);
                        return Err(err);
                    }
                }
            }
        };

        Ok(ConnGuard {
            conn: Some(conn),
            pool,
        })
    }

    /// Send a request over a pooled connection and await the response.
    pub async fn send(
        &self,
        event: &str,
        payload: Vec<u8>,
        addr: (&str, u16),
    ) -> Result<(u64, Vec<u8>), TransportError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        let guard = self.checkout(addr).await?;

        let envelope = self.shared.envelope(FrameKind::Request, event, payload);
        let encoded = self.shared.codec.encode(&envelope)?;

        let rx = guard.conn().waiters.push(event);

        {
            let mut writer = guard.conn().writer.lock().await;
            if let Err(err) = write_frame(&mut *writer, &encoded).await {
                drop(writer);
                guard.mark_dead();
                guard
                    .conn()
                    .waiters
                    .resolve_newest(event, Err(TransportError::Io(err.to_string())));
                return Err(TransportError::Io(err.to_string()));
            }
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::ChannelClosed),
        }
    }

    /// Open a stream over a pooled connection. The connection stays
    /// checked out until the server's close sentinel arrives.
    pub async fn stream(
        &self,
        event: &str,
        payload: Vec<u8>,
        addr: (&str, u16),
    ) -> Result<mpsc::UnboundedReceiver<(u64, Vec<u8>)>, TransportError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        let guard = self.checkout(addr).await?;

        let connect = self
            .shared
            .envelope(FrameKind::StreamConnect, event, Vec::new());
        let encoded = self.shared.codec.encode(&connect)?;

        let rx = guard.conn().waiters.push(event);
        {
            let mut writer = guard.conn().writer.lock().await;
            if let Err(err) = write_frame(&mut *writer, &encoded).await {
                drop(writer);
                guard.mark_dead();
                guard
                    .conn()
                    .waiters
                    .resolve_newest(event, Err(TransportError::Io(err.to_string())));
                return Err(TransportError::Io(err.to_string()));
            }
        }

        let (_, ack) = match rx.await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(TransportError::ChannelClosed),
        };

        if !ack.is_empty() {
            if let Ok(error) = crate::codec::decode_payload::<ErrorPayload>(&ack) {
                return Err(TransportError::Handler(error.error));
            }
        }

        let mut inner_rx = guard.conn().streams.open(event);

        let frame = self.shared.envelope(FrameKind::Stream, event, payload);
        let encoded = self.shared.codec.encode(&frame)?;
        {
            let mut writer = guard.conn().writer.lock().await;
            if let Err(err) = write_frame(&mut *writer, &encoded).await {
                drop(writer);
                guard.conn().streams.close(event);
                guard.mark_dead();
                return Err(TransportError::Io(err.to_string()));
            }
        }

        let (outer_tx, outer_rx) = mpsc::unbounded_channel();
        let pool = self.pool_handle(addr).await;
        let conn = guard.into_inner();

        tokio::spawn(async move {
            while let Some(item) = inner_rx.recv().await {
                if outer_tx.send(item).is_err() {
                    break;
                }
            }

            pool.restore(conn);
        });

        Ok(outer_rx)
    }

    /// Stop the listener and drop every pool.
    pub async fn close(&self) {
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.abort();
        }

        let pools: Vec<Pool> = self.pools.lock().await.drain().map(|(_, p)| p).collect();
        for pool in pools {
            let mut guard = pool.rx.lock().await;
            while let Ok(conn) = guard.try_recv() {
                conn.discard();
            }
        }

        self.shared.waiters.fail_all(TransportError::ChannelClosed);
        debug!(
            "tcp endpoint {}:{} closed",
            self.shared.host, self.shared.port
        );
    }
}

/// Serve one accepted peer connection with the endpoint's own waiter
/// and stream state.
fn serve_connection(shared: Arc<EndpointShared>, stream: TcpStream) {
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(frame)) => {
                    dispatch(
                        Arc::clone(&shared),
                        Arc::clone(&shared.waiters),
                        Arc::clone(&shared.streams),
                        frame,
                        writer_sink(Arc::clone(&writer)),
                    )
                    .await;
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("tcp server read failed: {err}");
                    break;
                }
            }
        }
    });
}

fn writer_sink(writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>) -> ReplySink {
    Arc::new(move |bytes: Vec<u8>| {
        let writer = Arc::clone(&writer);
        Box::pin(async move {
            let mut guard = writer.lock().await;
            if let Err(err) = write_frame(&mut *guard, &bytes).await {
                warn!("tcp reply failed: {err}");
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_payload, encode_payload};
    use crate::models::{HealthCheck, HealthStatus};

    fn endpoint(port: u16, handlers: Arc<HandlerTable>) -> TcpTransport {
        TcpTransport::new(
            "127.0.0.1",
            port,
            Arc::new(SnowflakeGenerator::new(u64::from(port))),
            Arc::new(EnvelopeCodec::new("test-secret")),
            handlers,
            Arc::new(Semaphore::new(16)),
            0,
        )
    }

    #[tokio::test]
    async fn test_framed_request_round_trip() {
        let handlers = Arc::new(HandlerTable::new());
        handlers.register(
            "register_new_node",
            Arc::new(|_shard, payload| {
                Box::pin(async move {
                    let check: HealthCheck =
                        decode_payload(&payload).map_err(|err| err.to_string())?;
                    let reply = HealthCheck::new(&check.source(), HealthStatus::Healthy);
                    encode_payload(&reply).map_err(|err| err.to_string())
                })
            }),
        );

        let server = endpoint(17201, handlers);
        server.connect().await.unwrap();

        let client = endpoint(17202, Arc::new(HandlerTable::new()));

        let check = HealthCheck::new(&("127.0.0.1".to_string(), 17202), HealthStatus::Initializing);
        let (_, payload) = client
            .send(
                "register_new_node",
                encode_payload(&check).unwrap(),
                ("127.0.0.1", 17201),
            )
            .await
            .unwrap();

        let reply: HealthCheck = decode_payload(&payload).unwrap();
        assert_eq!(reply.status, HealthStatus::Healthy);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let handlers = Arc::new(HandlerTable::new());
        handlers.register(
            "ping",
            Arc::new(|_shard, payload| Box::pin(async move { Ok(payload) })),
        );

        let server = endpoint(17203, handlers);
        server.connect().await.unwrap();

        let client = endpoint(17204, Arc::new(HandlerTable::new()));

        for round in 0u8..4 {
            let (_, payload) = client
                .send("ping", vec![round], ("127.0.0.1", 17203))
                .await
                .unwrap();
            assert_eq!(payload, vec![round]);
        }

        let pool = client.pool_handle(("127.0.0.1", 17203)).await;
        assert_eq!(pool.created.load(Ordering::Acquire), 1);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_refused_connection_surfaces() {
        let client = endpoint(17205, Arc::new(HandlerTable::new()));

        let result = client.send("ping", Vec::new(), ("127.0.0.1", 1)).await;

        assert!(matches!(
            result,
            Err(TransportError::ConnectionRefused(_)) | Err(TransportError::Io(_))
        ));
    }
}
