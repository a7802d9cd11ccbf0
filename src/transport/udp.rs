//! UDP transport
//!
//! Datagram request/response and streaming to peers. One socket per
//! endpoint; every datagram is a complete envelope. Ingress spawns a
//! dispatch task per datagram so a slow handler never blocks the read
//! loop.

use crate::codec::{EnvelopeCodec, FrameKind};
use crate::models::ErrorPayload;
use crate::snowflake::SnowflakeGenerator;
use crate::transport::{
    dispatch, EndpointShared, HandlerTable, ReplySink, StreamMap, TransportError, WaiterMap,
};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// Receive buffer size; also the effective datagram ceiling.
const RECV_BUFFER_LEN: usize = 65536;

pub struct UdpTransport {
    shared: Arc<EndpointShared>,
    semaphore: Arc<Semaphore>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(
        host: &str,
        port: u16,
        id_gen: Arc<SnowflakeGenerator>,
        codec: Arc<EnvelopeCodec>,
        handlers: Arc<HandlerTable>,
        semaphore: Arc<Semaphore>,
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
            socket: RwLock::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Bind the datagram endpoint and start the ingress loop.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.socket.read().unwrap().is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind((self.shared.host.as_str(), self.shared.port))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        let socket = Arc::new(socket);

        info!(
            "udp endpoint listening on {}:{}",
            self.shared.host, self.shared.port
        );

        *self.socket.write().unwrap() = Some(Arc::clone(&socket));

        let shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_LEN];

            loop {
                let (len, addr) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("udp receive failed: {err}");
                        continue;
                    }
                };

                let data = buf[..len].to_vec();
                let reply = reply_sink(Arc::clone(&socket), addr);
                tokio::spawn(dispatch(
                    Arc::clone(&shared),
                    Arc::clone(&shared.waiters),
                    Arc::clone(&shared.streams),
                    data,
                    reply,
                ));
            }
        });

        *self.reader.lock().unwrap() = Some(reader);
        Ok(())
    }

    fn socket_handle(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.socket
            .read()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    /// Send a request and block until the matching response resolves
    /// this call's waiter. Returns the responder's shard id alongside
    /// the raw payload.
    pub async fn send(
        &self,
        event: &str,
        payload: Vec<u8>,
        addr: (&str, u16),
    ) -> Result<(u64, Vec<u8>), TransportError> {
        let socket = self.socket_handle()?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        let envelope = self.shared.envelope(FrameKind::Request, event, payload);
        let encoded = self.shared.codec.encode(&envelope)?;

        let rx = self.shared.waiters.push(event);

        if let Err(err) = socket.send_to(&encoded, addr).await {
            self.shared
                .waiters
                .resolve_newest(event, Err(TransportError::Io(err.to_string())));
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::ChannelClosed),
        }
    }

    /// Open a stream: `stream_connect`, await the ack, emit the first
    /// stream frame, and hand back the response channel. The channel
    /// closes when the server sends its close sentinel.
    pub async fn stream(
        &self,
        event: &str,
        payload: Vec<u8>,
        addr: (&str, u16),
    ) -> Result<mpsc::UnboundedReceiver<(u64, Vec<u8>)>, TransportError> {
        let socket = self.socket_handle()?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        let connect = self
            .shared
            .envelope(FrameKind::StreamConnect, event, Vec::new());
        let encoded = self.shared.codec.encode(&connect)?;

        let rx = self.shared.waiters.push(event);
        if let Err(err) = socket.send_to(&encoded, addr).await {
            self.shared
                .waiters
                .resolve_newest(event, Err(TransportError::Io(err.to_string())));
        }

        let (_, ack) = rx.await.map_err(|_| TransportError::ChannelClosed)??;
        if !ack.is_empty() {
            if let Ok(error) = crate::codec::decode_payload::<ErrorPayload>(&ack) {
                return Err(TransportError::Handler(error.error));
            }
        }

        let stream_rx = self.shared.streams.open(event);

        let frame = self.shared.envelope(FrameKind::Stream, event, payload);
        let encoded = self.shared.codec.encode(&frame)?;
        socket
            .send_to(&encoded, addr)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;

        Ok(stream_rx)
    }

    /// Stop the ingress loop and release the socket.
    pub async fn close(&self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }

        self.socket.write().unwrap().take();
        self.shared.waiters.fail_all(TransportError::ChannelClosed);
        debug!(
            "udp endpoint {}:{} closed",
            self.shared.host, self.shared.port
        );
    }
}

fn reply_sink(socket: Arc<UdpSocket>, addr: std::net::SocketAddr) -> ReplySink {
    Arc::new(move |bytes: Vec<u8>| {
        let socket = Arc::clone(&socket);
        Box::pin(async move {
            if let Err(err) = socket.send_to(&bytes, addr).await {
                warn!("udp reply to {addr} failed: {err}");
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_payload, encode_payload};
    use crate::models::HealthCheck;
    use crate::models::HealthStatus;

    fn endpoint(port: u16, handlers: Arc<HandlerTable>) -> UdpTransport {
        UdpTransport::new(
            "127.0.0.1",
            port,
            Arc::new(SnowflakeGenerator::new(u64::from(port))),
            Arc::new(EnvelopeCodec::new("test-secret")),
            handlers,
            Arc::new(Semaphore::new(16)),
        )
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let handlers = Arc::new(HandlerTable::new());
        handlers.register(
            "echo_status",
            Arc::new(|_shard, payload| {
                Box::pin(async move {
                    let check: HealthCheck =
                        decode_payload(&payload).map_err(|err| err.to_string())?;
                    let reply = HealthCheck::new(&check.source(), HealthStatus::Healthy);
                    encode_payload(&reply).map_err(|err| err.to_string())
                })
            }),
        );

        let server = endpoint(17101, handlers);
        server.connect().await.unwrap();

        let client = endpoint(17102, Arc::new(HandlerTable::new()));
        client.connect().await.unwrap();

        let check = HealthCheck::new(&("127.0.0.1".to_string(), 17102), HealthStatus::Healthy);
        let (shard_id, payload) = client
            .send(
                "echo_status",
                encode_payload(&check).unwrap(),
                ("127.0.0.1", 17101),
            )
            .await
            .unwrap();

        assert!(shard_id > 0);
        let reply: HealthCheck = decode_payload(&payload).unwrap();
        assert_eq!(reply.status, HealthStatus::Healthy);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_missing_handler_returns_error_payload() {
        let server = endpoint(17103, Arc::new(HandlerTable::new()));
        server.connect().await.unwrap();

        let client = endpoint(17104, Arc::new(HandlerTable::new()));
        client.connect().await.unwrap();

        let (_, payload) = client
            .send("unknown_event", Vec::new(), ("127.0.0.1", 17103))
            .await
            .unwrap();

        let error: ErrorPayload = decode_payload(&payload).unwrap();
        assert!(error.error.contains("unknown_event"));

        client.close().await;
        server.close().await;
    }
}
