//! Outbound DNS requests
//!
//! One client covers both worlds: plain RFC 1035 exchanges with
//! external upstreams (UDP, TCP with the u16 length prefix, DoH POST
//! with `application/dns-message`), and overlay exchanges with other
//! cluster nodes, where the same packets ride inside the encrypted
//! envelope framing.

use crate::codec::{Envelope, EnvelopeCodec, FrameKind};
use crate::dns::message::{DnsMessage, RCODE_SERVFAIL};
use crate::dns::nameservers::{NsAddr, NsScheme};
use crate::dns::record::{Question, RecordType};
use crate::dns::{DnsError, DNS_QUERY_EVENT};
use crate::snowflake::SnowflakeGenerator;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// Identity used when wrapping queries in overlay envelopes.
pub struct OverlayContext {
    pub codec: Arc<EnvelopeCodec>,
    pub id_gen: Arc<SnowflakeGenerator>,
    pub host: String,
    pub port: u16,
}

pub struct DnsClient {
    request_timeout: Duration,
    overlay: Option<OverlayContext>,
    http: reqwest::Client,
}

impl DnsClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            overlay: None,
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Wrap every UDP/TCP exchange in the cluster's envelope framing.
    pub fn with_overlay(mut self, overlay: OverlayContext) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Issue one query to one nameserver, transport chosen by the
    /// nameserver URL's scheme.
    pub async fn query(
        &self,
        fqdn: &str,
        qtype: RecordType,
        addr: &NsAddr,
    ) -> Result<DnsMessage, DnsError> {
        let qid = rand::random::<u16>();
        let mut request = DnsMessage::request(qid, Question::new(fqdn, qtype));
        let packet = request.pack(None)?;

        debug!(
            "dns query {fqdn} {} via {}",
            qtype.name(),
            addr.url()
        );

        let exchange = async {
            match addr.scheme {
                NsScheme::Udp => self.exchange_udp(&packet, addr).await,
                NsScheme::Tcp => self.exchange_tcp(&packet, addr).await,
                NsScheme::Https => self.exchange_https(&packet, addr).await,
            }
        };

        let response_bytes = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| DnsError::Timeout)??;

        let response = DnsMessage::parse(&response_bytes)?;

        if response.qid != qid {
            return Err(DnsError::TransactionMismatch);
        }
        if response.rcode == RCODE_SERVFAIL {
            return Err(DnsError::ServerFail);
        }

        Ok(response)
    }

    fn wrap(&self, packet: &[u8]) -> Result<Vec<u8>, DnsError> {
        match &self.overlay {
            Some(overlay) => {
                let envelope = Envelope {
                    kind: FrameKind::Request,
                    shard_id: overlay.id_gen.next_id(),
                    event: DNS_QUERY_EVENT.to_string(),
                    payload: packet.to_vec(),
                    source_host: overlay.host.clone(),
                    source_port: overlay.port,
                };
                overlay
                    .codec
                    .encode(&envelope)
                    .map_err(|err| DnsError::Upstream(err.to_string()))
            }
            None => Ok(packet.to_vec()),
        }
    }

    fn unwrap(&self, bytes: &[u8]) -> Result<Vec<u8>, DnsError> {
        match &self.overlay {
            Some(overlay) => {
                let envelope = overlay
                    .codec
                    .decode(bytes)
                    .map_err(|err| DnsError::Upstream(err.to_string()))?;
                Ok(envelope.payload)
            }
            None => Ok(bytes.to_vec()),
        }
    }

    async fn exchange_udp(&self, packet: &[u8], addr: &NsAddr) -> Result<Vec<u8>, DnsError> {
        let bind_addr = if addr.host.contains(':') {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;

        let payload = self.wrap(packet)?;
        socket
            .send_to(&payload, (addr.host.as_str(), addr.port))
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;

        let mut buf = vec![0u8; 65536];
        let (len, _) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;

        self.unwrap(&buf[..len])
    }

    async fn exchange_tcp(&self, packet: &[u8], addr: &NsAddr) -> Result<Vec<u8>, DnsError> {
        let mut stream = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;

        let payload = self.wrap(packet)?;
        let mut framed = Vec::with_capacity(2 + payload.len());
        framed.extend((payload.len() as u16).to_be_bytes());
        framed.extend(&payload);

        stream
            .write_all(&framed)
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;

        let mut header = [0u8; 2];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;

        let len = u16::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;

        self.unwrap(&body)
    }

    async fn exchange_https(&self, packet: &[u8], addr: &NsAddr) -> Result<Vec<u8>, DnsError> {
        let url = format!("https://{}:{}{}", addr.host, addr.port, addr.path);

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(packet.to_vec())
            .send()
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;

        if !response.status().is_success() {
            return Err(DnsError::Upstream(format!(
                "doh status {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;

        Ok(body.to_vec())
    }
}
