//! DNS servers (UDP + TCP)
//!
//! Intra-cluster DNS rides the same encrypted, compressed envelope
//! framing as the RPC substrate: a datagram (or a u16-length-prefixed
//! TCP frame) carries one envelope whose payload is a standard RFC
//! 1035 message. Each question is answered through the resolver; UDP
//! answers are size-limited to 512 bytes with the truncation bit set.

use crate::codec::{Envelope, EnvelopeCodec, FrameKind};
use crate::dns::cache::CacheNode;
use crate::dns::entry::DnsEntry;
use crate::dns::message::{DnsMessage, RCODE_SERVFAIL, UDP_SIZE_LIMIT};
use crate::dns::resolver::Resolve;
use crate::dns::{DnsError, DNS_QUERY_EVENT};
use crate::snowflake::SnowflakeGenerator;
use crate::transport::TransportError;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

pub struct DnsServer {
    host: String,
    udp_port: u16,
    codec: Arc<EnvelopeCodec>,
    id_gen: Arc<SnowflakeGenerator>,
    resolver: Arc<dyn Resolve>,
    cache: Arc<tokio::sync::Mutex<CacheNode>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DnsServer {
    pub fn new(
        host: &str,
        udp_port: u16,
        codec: Arc<EnvelopeCodec>,
        id_gen: Arc<SnowflakeGenerator>,
        resolver: Arc<dyn Resolve>,
        cache: Arc<tokio::sync::Mutex<CacheNode>>,
    ) -> Self {
        Self {
            host: host.to_string(),
            udp_port,
            codec,
            id_gen,
            resolver,
            cache,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn tcp_port(&self) -> u16 {
        self.udp_port + 1
    }

    /// Insert service entries into the served cache.
    pub async fn add_entries(&self, entries: &[DnsEntry]) {
        let mut cache = self.cache.lock().await;
        for entry in entries {
            for record in entry.to_records() {
                cache.add(record);
            }
        }
    }

    /// Bind the UDP and TCP listeners and start serving.
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let udp = UdpSocket::bind((self.host.as_str(), self.udp_port))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        let udp = Arc::new(udp);

        let tcp = TcpListener::bind((self.host.as_str(), self.tcp_port()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;

        info!(
            "dns server on {}:{} (udp) and {}:{} (tcp)",
            self.host,
            self.udp_port,
            self.host,
            self.tcp_port()
        );

        let me = Arc::clone(self);
        let socket = Arc::clone(&udp);
        let udp_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("dns udp receive failed: {err}");
                        continue;
                    }
                };

                let data = buf[..len].to_vec();
                let me = Arc::clone(&me);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Some(reply) = me.handle_frame(&data, Some(UDP_SIZE_LIMIT)).await {
                        if let Err(err) = socket.send_to(&reply, peer).await {
                            warn!("dns udp reply to {peer} failed: {err}");
                        }
                    }
                });
            }
        });

        let me = Arc::clone(self);
        let tcp_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match tcp.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("dns tcp accept failed: {err}");
                        continue;
                    }
                };

                debug!("dns tcp connection from {peer}");
                let me = Arc::clone(&me);
                tokio::spawn(async move { me.serve_tcp(stream).await });
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(udp_task);
        tasks.push(tcp_task);
        Ok(())
    }

    async fn serve_tcp(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let mut header = [0u8; 2];
            match stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(_) => break,
            }

            let len = u16::from_be_bytes(header) as usize;
            let mut frame = vec![0u8; len];
            if stream.read_exact(&mut frame).await.is_err() {
                break;
            }

            let Some(reply) = self.handle_frame(&frame, None).await else {
                continue;
            };

            let mut framed = Vec::with_capacity(2 + reply.len());
            framed.extend((reply.len() as u16).to_be_bytes());
            framed.extend(&reply);

            if stream.write_all(&framed).await.is_err() {
                break;
            }
        }
    }

    /// Decode one envelope, answer the DNS message inside it, and
    /// re-encode the reply envelope.
    async fn handle_frame(&self, data: &[u8], size_limit: Option<usize>) -> Option<Vec<u8>> {
        let envelope = match self.codec.decode(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dns frame failed to decode: {err}");
                return None;
            }
        };

        let answer = match self.answer(&envelope.payload, size_limit).await {
            Ok(packet) => packet,
            Err(err) => {
                warn!("dns question failed: {err}");
                return None;
            }
        };

        let reply = Envelope {
            kind: FrameKind::Response,
            shard_id: self.id_gen.next_id(),
            event: DNS_QUERY_EVENT.to_string(),
            payload: answer,
            source_host: self.host.clone(),
            source_port: self.udp_port,
        };

        match self.codec.encode(&reply) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!("dns reply failed to encode: {err}");
                None
            }
        }
    }

    /// Answer every question of one DNS message out of the resolver.
    async fn answer(
        &self,
        packet: &[u8],
        size_limit: Option<usize>,
    ) -> Result<Vec<u8>, DnsError> {
        let query = DnsMessage::parse(packet)?;

        let mut response = DnsMessage::response();
        response.qid = query.qid;
        response.questions = query.questions.clone();

        for question in &query.questions {
            match self.resolver.query(&question.name, question.qtype, false).await {
                Ok((answer, from_cache)) => {
                    debug!(
                        "answered {} {} ({} record(s), cached={from_cache})",
                        question.name,
                        question.qtype.name(),
                        answer.answers.len()
                    );

                    response.answers.extend(answer.answers);
                    response.authorities.extend(answer.authorities);
                    response.additionals.extend(answer.additionals);
                    response.aa |= answer.aa;
                    if answer.rcode != 0 {
                        response.rcode = answer.rcode;
                    }
                }
                Err(err) => {
                    debug!(
                        "resolver failed for {} {}: {err}",
                        question.name,
                        question.qtype.name()
                    );
                    response.rcode = RCODE_SERVFAIL;
                }
            }
        }

        response.pack(size_limit)
    }

    /// Stop serving.
    pub fn close(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::client::{DnsClient, OverlayContext};
    use crate::dns::nameservers::NsAddr;
    use crate::dns::record::{RecordData, RecordType};
    use crate::dns::resolver::{ProxyResolver, ResolverCore};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    async fn overlay_server(port: u16) -> Arc<DnsServer> {
        let codec = Arc::new(EnvelopeCodec::new("dns-test-secret"));
        let cache = Arc::new(tokio::sync::Mutex::new(CacheNode::new()));

        {
            let mut guard = cache.lock().await;
            guard.add_parts(
                "node-1.cluster.local",
                RecordData::A(Ipv4Addr::new(10, 0, 0, 1)),
                300,
            );
        }

        let core = Arc::new(ResolverCore::new(
            Arc::clone(&cache),
            DnsClient::new(Duration::from_secs(2)),
            Duration::from_secs(2),
        ));
        core.set_zone_domains(vec!["cluster.local".to_string()]);

        let resolver = Arc::new(ProxyResolver::new(core, &[]).unwrap());

        let server = Arc::new(DnsServer::new(
            "127.0.0.1",
            port,
            codec,
            Arc::new(SnowflakeGenerator::new(1)),
            resolver,
            cache,
        ));
        server.start().await.unwrap();
        server
    }

    fn overlay_client() -> DnsClient {
        DnsClient::new(Duration::from_secs(2)).with_overlay(OverlayContext {
            codec: Arc::new(EnvelopeCodec::new("dns-test-secret")),
            id_gen: Arc::new(SnowflakeGenerator::new(2)),
            host: "127.0.0.1".to_string(),
            port: 0,
        })
    }

    #[tokio::test]
    async fn test_udp_query_through_envelope() {
        let server = overlay_server(17500).await;
        let client = overlay_client();

        let addr = NsAddr::parse("udp://127.0.0.1:17500").unwrap();
        let response = client
            .query("node-1.cluster.local", RecordType::A, &addr)
            .await
            .unwrap();

        assert_eq!(response.answers.len(), 1);
        assert_eq!(
            response.answers[0].data,
            RecordData::A(Ipv4Addr::new(10, 0, 0, 1))
        );

        server.close();
    }

    #[tokio::test]
    async fn test_tcp_query_through_envelope() {
        let server = overlay_server(17510).await;
        let client = overlay_client();

        let addr = NsAddr::parse("tcp://127.0.0.1:17511").unwrap();
        let response = client
            .query("node-1.cluster.local", RecordType::A, &addr)
            .await
            .unwrap();

        assert_eq!(response.answers.len(), 1);
        server.close();
    }

    #[tokio::test]
    async fn test_zone_miss_returns_nxdomain() {
        let server = overlay_server(17520).await;
        let client = overlay_client();

        let addr = NsAddr::parse("udp://127.0.0.1:17520").unwrap();
        let response = client
            .query("ghost.cluster.local", RecordType::A, &addr)
            .await
            .unwrap();

        assert_eq!(response.rcode, crate::dns::message::RCODE_NXDOMAIN);
        assert!(response.answers.is_empty());

        server.close();
    }
}
