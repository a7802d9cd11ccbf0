//! Transport substrate shared by the UDP and TCP endpoints
//!
//! Both transports speak the same envelope protocol and share the same
//! dispatch rules:
//!
//! - `request` frames run the registered handler on a spawned task and
//!   answer with a `response` frame; a failing handler yields an error
//!   record and the connection stays up.
//! - `response` frames resolve the oldest waiter for their event (FIFO
//!   per event; callers needing strict correlation use the shard id).
//! - `stream_connect` is acked, `stream` frames feed the registered
//!   stream handler, and a `stream` frame with an empty payload closes
//!   the client-side channel.
//! - Undecodable input earns the sender an error envelope on the
//!   reserved `decode_error` event; receiving one resolves the most
//!   recent outstanding waiter, since the failed request cannot be
//!   identified.

pub mod tcp;
pub mod udp;

use crate::codec::{encode_payload, CodecError, Envelope, EnvelopeCodec, FrameKind};
use crate::models::ErrorPayload;
use crate::snowflake::SnowflakeGenerator;
use futures::future::BoxFuture;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

/// Reserved event name for envelopes that could not be decoded.
pub const DECODE_ERROR_EVENT: &str = "decode_error";

/// Upper bound on a single TCP frame.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Transport-level failure kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer rejected envelope: {0}")]
    Decode(String),

    #[error("envelope codec failed: {0}")]
    Codec(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("transport io failed: {0}")]
    Io(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("waiter dropped before resolution")]
    ChannelClosed,

    #[error("transport is not connected")]
    NotConnected,
}

/// A resolved request: the responder's shard id and the raw payload.
pub type WaiterReply = Result<(u64, Vec<u8>), TransportError>;

pub type HandlerResult = Result<Vec<u8>, String>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// A registered request handler: `(shard_id, payload) -> payload`.
pub type HandlerFn = Arc<dyn Fn(u64, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// A registered stream handler: produces response payloads through the
/// channel until it returns.
pub type StreamHandlerFn = Arc<
    dyn Fn(u64, Vec<u8>, mpsc::UnboundedSender<Vec<u8>>) -> BoxFuture<'static, Result<(), String>>
        + Send
        + Sync,
>;

/// Event-name keyed handler registry shared by all endpoints.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, HandlerFn>>,
    stream_handlers: RwLock<HashMap<String, StreamHandlerFn>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: &str, handler: HandlerFn) {
        self.handlers
            .write()
            .unwrap()
            .insert(event.to_string(), handler);
    }

    pub fn register_stream(&self, event: &str, handler: StreamHandlerFn) {
        self.stream_handlers
            .write()
            .unwrap()
            .insert(event.to_string(), handler);
    }

    pub fn get(&self, event: &str) -> Option<HandlerFn> {
        self.handlers.read().unwrap().get(event).cloned()
    }

    pub fn get_stream(&self, event: &str) -> Option<StreamHandlerFn> {
        self.stream_handlers.read().unwrap().get(event).cloned()
    }
}

struct WaiterInner {
    queues: HashMap<String, VecDeque<(u64, oneshot::Sender<WaiterReply>)>>,
    next_seq: u64,
}

/// Per-event FIFO queues of pending request futures.
///
/// Each outgoing request enqueues exactly one waiter; a waiter is
/// resolved exactly once, by a response, an error envelope, or the
/// caller's own timeout dropping the receiver.
pub struct WaiterMap {
    inner: Mutex<WaiterInner>,
}

impl Default for WaiterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl WaiterMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WaiterInner {
                queues: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn push(&self, event: &str) -> oneshot::Receiver<WaiterReply> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .queues
            .entry(event.to_string())
            .or_default()
            .push_back((seq, tx));
        rx
    }

    /// Resolve the oldest live waiter for `event`. Waiters whose
    /// caller already gave up (receiver dropped by a timeout) are
    /// discarded on the way, so a stale slot never swallows a response
    /// meant for a live one. Returns false when none is pending.
    pub fn resolve_oldest(&self, event: &str, reply: WaiterReply) -> bool {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            let queue = inner.queues.get_mut(event);
            queue.and_then(|queue| loop {
                match queue.pop_front() {
                    Some((_, tx)) if tx.is_closed() => continue,
                    Some((_, tx)) => break Some(tx),
                    None => break None,
                }
            })
        };

        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Resolve the newest live waiter for `event`: the send-error
    /// path, where the caller unwinds the waiter it just enqueued.
    pub fn resolve_newest(&self, event: &str, reply: WaiterReply) -> bool {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            let queue = inner.queues.get_mut(event);
            queue.and_then(|queue| loop {
                match queue.pop_back() {
                    Some((_, tx)) if tx.is_closed() => continue,
                    Some((_, tx)) => break Some(tx),
                    None => break None,
                }
            })
        };

        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Resolve the most recently enqueued live waiter across all
    /// events: the error-envelope path, where the failed request
    /// cannot be identified by event.
    pub fn resolve_most_recent(&self, reply: WaiterReply) -> bool {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();

            for queue in inner.queues.values_mut() {
                queue.retain(|(_, tx)| !tx.is_closed());
            }

            let newest = inner
                .queues
                .iter()
                .filter_map(|(event, queue)| queue.back().map(|(seq, _)| (*seq, event.clone())))
                .max_by_key(|(seq, _)| *seq);

            newest
                .and_then(|(_, event)| inner.queues.get_mut(&event).and_then(VecDeque::pop_back))
        };

        match waiter {
            Some((_, tx)) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Fail every pending waiter. Used on connection teardown.
    pub fn fail_all(&self, error: TransportError) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .queues
                .drain()
                .flat_map(|(_, queue)| queue.into_iter())
                .collect()
        };

        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

/// Client-side open streams, one active stream per event.
#[derive(Default)]
pub struct StreamMap {
    inner: Mutex<HashMap<String, mpsc::UnboundedSender<(u64, Vec<u8>)>>>,
}

impl StreamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, event: &str) -> mpsc::UnboundedReceiver<(u64, Vec<u8>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().insert(event.to_string(), tx);
        rx
    }

    pub fn close(&self, event: &str) {
        self.inner.lock().unwrap().remove(event);
    }

    pub fn is_open(&self, event: &str) -> bool {
        self.inner.lock().unwrap().contains_key(event)
    }

    /// Route a response frame into the open stream. Returns false when
    /// no stream is open for the event.
    pub fn send(&self, event: &str, item: (u64, Vec<u8>)) -> bool {
        let sender = self.inner.lock().unwrap().get(event).cloned();
        match sender {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

/// Outgoing bytes sink for dispatch replies; each transport supplies
/// its own (datagram send or framed connection write).
pub type ReplySink = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// State shared between an endpoint and its ingress tasks.
pub struct EndpointShared {
    pub host: String,
    pub port: u16,
    pub id_gen: Arc<SnowflakeGenerator>,
    pub codec: Arc<EnvelopeCodec>,
    pub handlers: Arc<HandlerTable>,
    pub waiters: Arc<WaiterMap>,
    pub streams: Arc<StreamMap>,
}

impl EndpointShared {
    pub fn envelope(&self, kind: FrameKind, event: &str, payload: Vec<u8>) -> Envelope {
        Envelope {
            kind,
            shard_id: self.id_gen.next_id(),
            event: event.to_string(),
            payload,
            source_host: self.host.clone(),
            source_port: self.port,
        }
    }

    fn error_envelope(&self, event: &str, message: &str) -> Envelope {
        let payload = encode_payload(&ErrorPayload {
            error: message.to_string(),
        })
        .unwrap_or_default();

        self.envelope(FrameKind::Response, event, payload)
    }
}

/// Decode one incoming envelope and dispatch it.
///
/// `waiters`/`streams` are passed separately because TCP client
/// connections carry their own queues while UDP and the TCP server side
/// use the endpoint's.
pub async fn dispatch(
    shared: Arc<EndpointShared>,
    waiters: Arc<WaiterMap>,
    streams: Arc<StreamMap>,
    data: Vec<u8>,
    reply: ReplySink,
) {
    let envelope = match shared.codec.decode(&data) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("dropping undecodable envelope: {err}");
            let error = shared.error_envelope(DECODE_ERROR_EVENT, &err.to_string());
            if let Ok(bytes) = shared.codec.encode(&error) {
                reply(bytes).await;
            }
            return;
        }
    };

    match envelope.kind {
        FrameKind::Request => {
            handle_request(shared, envelope, reply).await;
        }

        FrameKind::StreamConnect => {
            let ack = if shared.handlers.get_stream(&envelope.event).is_some() {
                shared.envelope(FrameKind::Response, &envelope.event, Vec::new())
            } else {
                shared.error_envelope(
                    &envelope.event,
                    &format!("no stream handler for {}", envelope.event),
                )
            };

            if let Ok(bytes) = shared.codec.encode(&ack) {
                reply(bytes).await;
            }
        }

        FrameKind::Stream => {
            // An empty stream frame is the server's close sentinel for
            // a stream we opened; anything else is client data for a
            // local stream handler.
            if streams.is_open(&envelope.event) && envelope.payload.is_empty() {
                streams.close(&envelope.event);
            } else {
                handle_stream_frame(shared, envelope, reply).await;
            }
        }

        FrameKind::Response => {
            if envelope.event == DECODE_ERROR_EVENT {
                let message = crate::codec::decode_payload::<ErrorPayload>(&envelope.payload)
                    .map(|p| p.error)
                    .unwrap_or_else(|_| "peer reported decode failure".to_string());

                if !waiters.resolve_most_recent(Err(TransportError::Decode(message))) {
                    debug!("decode error envelope with no outstanding waiter");
                }
                return;
            }

            if streams.send(&envelope.event, (envelope.shard_id, envelope.payload.clone())) {
                return;
            }

            if !waiters.resolve_oldest(
                &envelope.event,
                Ok((envelope.shard_id, envelope.payload)),
            ) {
                debug!("unmatched response for event {}", envelope.event);
            }
        }
    }
}

async fn handle_request(shared: Arc<EndpointShared>, envelope: Envelope, reply: ReplySink) {
    let handler = shared.handlers.get(&envelope.event);

    tokio::spawn(async move {
        let response = match handler {
            Some(handler) => match handler(envelope.shard_id, envelope.payload).await {
                Ok(payload) => shared.envelope(FrameKind::Response, &envelope.event, payload),
                Err(message) => {
                    warn!("handler {} failed: {message}", envelope.event);
                    shared.error_envelope(&envelope.event, &message)
                }
            },
            None => shared.error_envelope(
                &envelope.event,
                &format!("no handler for {}", envelope.event),
            ),
        };

        match shared.codec.encode(&response) {
            Ok(bytes) => reply(bytes).await,
            Err(err) => warn!("failed to encode response: {err}"),
        }
    });
}

async fn handle_stream_frame(shared: Arc<EndpointShared>, envelope: Envelope, reply: ReplySink) {
    let Some(handler) = shared.handlers.get_stream(&envelope.event) else {
        let error = shared.error_envelope(
            &envelope.event,
            &format!("no stream handler for {}", envelope.event),
        );
        if let Ok(bytes) = shared.codec.encode(&error) {
            reply(bytes).await;
        }
        return;
    };

    let event = envelope.event.clone();

    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let producer = tokio::spawn(handler(envelope.shard_id, envelope.payload, tx));

        while let Some(payload) = rx.recv().await {
            let frame = shared.envelope(FrameKind::Response, &event, payload);
            match shared.codec.encode(&frame) {
                Ok(bytes) => reply(bytes).await,
                Err(err) => {
                    warn!("failed to encode stream frame: {err}");
                    break;
                }
            }
        }

        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                warn!("stream handler {event} failed: {message}");
                let error = shared.error_envelope(&event, &message);
                if let Ok(bytes) = shared.codec.encode(&error) {
                    reply(bytes).await;
                }
            }
            Err(err) => warn!("stream handler {event} aborted: {err}"),
        }

        // Close sentinel: an empty stream frame.
        let sentinel = shared.envelope(FrameKind::Stream, &event, Vec::new());
        if let Ok(bytes) = shared.codec.encode(&sentinel) {
            reply(bytes).await;
        }
    });
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// Write one length-prefixed frame (u32 big-endian length).
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read one length-prefixed frame. `Ok(None)` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_waiters_resolve_fifo() {
        let waiters = WaiterMap::new();

        let first = waiters.push("probe");
        let second = waiters.push("probe");

        assert!(waiters.resolve_oldest("probe", Ok((1, vec![1]))));
        assert!(waiters.resolve_oldest("probe", Ok((2, vec![2]))));

        assert_eq!(first.await.unwrap().unwrap().0, 1);
        assert_eq!(second.await.unwrap().unwrap().0, 2);
    }

    #[tokio::test]
    async fn test_most_recent_waiter_takes_error() {
        let waiters = WaiterMap::new();

        let older = waiters.push("a");
        let newer = waiters.push("b");

        assert!(waiters.resolve_most_recent(Err(TransportError::Decode("bad".into()))));
        assert!(newer.await.unwrap().is_err());

        assert!(waiters.resolve_oldest("a", Ok((3, vec![]))));
        assert!(older.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_waiters_are_pruned() {
        let waiters = WaiterMap::new();

        // A caller that timed out drops its receiver; the next
        // response must reach the live waiter behind it.
        let abandoned = waiters.push("probe");
        drop(abandoned);

        let live = waiters.push("probe");
        assert!(waiters.resolve_oldest("probe", Ok((9, vec![9]))));
        assert_eq!(live.await.unwrap().unwrap().0, 9);
    }

    #[tokio::test]
    async fn test_resolve_without_waiter_is_noop() {
        let waiters = WaiterMap::new();
        assert!(!waiters.resolve_oldest("missing", Ok((1, vec![]))));
        assert!(!waiters.resolve_most_recent(Ok((1, vec![]))));
    }

    #[tokio::test]
    async fn test_stream_map_routes_until_closed() {
        let streams = StreamMap::new();
        let mut rx = streams.open("feed");

        assert!(streams.send("feed", (1, vec![0xaa])));
        streams.close("feed");
        assert!(!streams.send("feed", (2, vec![0xbb])));

        assert_eq!(rx.recv().await.unwrap().0, 1);
        assert!(rx.recv().await.is_none());
    }
}
