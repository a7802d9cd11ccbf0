//! Registrar: membership events as DNS records
//!
//! Wraps a controller with DNS bindings. A registering peer lands in
//! the local record cache as SRV/A (plus TXT) projections and receives
//! back the nameserver addresses known for the service domain; peers
//! then discover each other by querying any registrar's DNS overlay.
//! The registrar's DNS ports sit right above its RPC pair:
//! `controller_port + 2` (UDP) and `controller_port + 3` (TCP).

use crate::config::SimurghConfig;
use crate::controller::Controller;
use crate::dns::cache::CacheNode;
use crate::dns::client::{DnsClient, OverlayContext};
use crate::dns::entry::{DnsEntry, DomainProtocol};
use crate::dns::record::RecordType;
use crate::dns::resolver::{ProxyResolver, Resolve, ResolverCore};
use crate::dns::server::DnsServer;
use crate::dns::DnsError;
use crate::models::{NameserverList, NodeAddr, Registration};
use crate::snowflake::SnowflakeGenerator;
use crate::transport::TransportError;
use log::{debug, info};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::timeout;

/// Join/advertise handshake for the discovery overlay.
pub const EVENT_REGISTER_SERVICE: &str = "register_service";

/// Record TTL for registered service entries.
const SERVICE_TTL: i64 = 300;

struct RegistrarInner {
    controller: Arc<Controller>,
    config: SimurghConfig,
    service_name: String,
    zone: String,
    resolver: Arc<ProxyResolver>,
    dns_server: Arc<DnsServer>,
    known_nameservers: Mutex<BTreeSet<NodeAddr>>,
}

pub struct Registrar {
    inner: Arc<RegistrarInner>,
}

impl Registrar {
    /// `zone` is the service domain suffix the registrar is
    /// authoritative for (e.g. `cluster.local`).
    pub fn new(
        host: &str,
        port: u16,
        service_name: &str,
        zone: &str,
        config: &SimurghConfig,
    ) -> Result<Self, DnsError> {
        let controller = Arc::new(Controller::new(host, port, 1, config));
        let cache = Arc::new(tokio::sync::Mutex::new(CacheNode::new()));

        let overlay_client = DnsClient::new(config.dns.request_timeout).with_overlay(
            OverlayContext {
                codec: controller.codec(),
                id_gen: Arc::new(SnowflakeGenerator::new(u64::from(port) & 0x3ff)),
                host: host.to_string(),
                port,
            },
        );

        let core = Arc::new(ResolverCore::new(
            Arc::clone(&cache),
            overlay_client,
            config.dns.query_timeout,
        ));
        core.set_zone_domains(vec![zone.to_string()]);

        let resolver = Arc::new(ProxyResolver::new(
            Arc::clone(&core),
            &config.dns.nameservers,
        )?);

        let dns_server = Arc::new(DnsServer::new(
            host,
            port + 2,
            controller.codec(),
            Arc::new(SnowflakeGenerator::new(u64::from(port.wrapping_add(1)) & 0x3ff)),
            Arc::clone(&resolver) as Arc<dyn Resolve>,
            cache,
        ));

        let inner = Arc::new(RegistrarInner {
            controller,
            config: config.clone(),
            service_name: service_name.to_string(),
            zone: zone.to_string(),
            resolver,
            dns_server,
            known_nameservers: Mutex::new(BTreeSet::new()),
        });

        RegistrarInner::register_handlers(&inner);
        Ok(Self { inner })
    }

    pub fn controller(&self) -> Arc<Controller> {
        Arc::clone(&self.inner.controller)
    }

    pub fn resolver(&self) -> Arc<ProxyResolver> {
        Arc::clone(&self.inner.resolver)
    }

    pub fn dns_ports(&self) -> (u16, u16) {
        (
            self.inner.dns_server.udp_port(),
            self.inner.dns_server.tcp_port(),
        )
    }

    /// The `_service._proto.zone` name registered entries live under.
    pub fn service_domain(&self) -> String {
        self.inner.probe_entry().service_domain()
    }

    /// Bind the RPC endpoints and the DNS servers, and advertise this
    /// node's own entry.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.inner.controller.start_server().await?;
        self.inner.dns_server.start().await?;

        let own = self.inner.entry_for(
            self.inner.controller.host(),
            self.inner.controller.port(),
        );
        self.inner.resolver.core().add_entries(&[own]).await;

        let own_ns = (
            self.inner.controller.host().to_string(),
            self.inner.dns_server.udp_port(),
        );
        self.inner.known_nameservers.lock().unwrap().insert(own_ns);

        info!(
            "registrar for {} serving zone {}",
            self.inner.service_name, self.inner.zone
        );
        Ok(())
    }

    /// Register this node with a peer registrar. Returns the
    /// nameserver addresses the peer knows for the domain, which are
    /// installed as resolver rules for the zone.
    pub async fn register_with(&self, seed: &NodeAddr) -> Result<Vec<NodeAddr>, TransportError> {
        let inner = Arc::clone(&self.inner);

        let handshake = async {
            inner.controller.start_client(seed).await?;

            let registration = Registration {
                host: inner.controller.host().to_string(),
                port: inner.controller.port(),
                service_name: inner.service_name.clone(),
            };

            let (_, reply): (u64, NameserverList) = inner
                .controller
                .send_tcp(EVENT_REGISTER_SERVICE, seed, &registration)
                .await?;
            Ok::<NameserverList, TransportError>(reply)
        };

        let reply = timeout(self.inner.config.registration_timeout, handshake)
            .await
            .map_err(|_| TransportError::Io("registration timed out".to_string()))??;

        let urls: Vec<String> = reply
            .nameservers
            .iter()
            .map(|(host, port)| format!("udp://{host}:{port}"))
            .collect();

        if !urls.is_empty() {
            self.inner
                .resolver
                .add_rule(Some(&self.inner.zone), &urls)
                .map_err(|err| TransportError::Io(err.to_string()))?;
        }

        {
            let mut known = self.inner.known_nameservers.lock().unwrap();
            known.extend(reply.nameservers.iter().cloned());
        }

        debug!(
            "registered with {}:{}, {} nameserver(s) known",
            seed.0,
            seed.1,
            reply.nameservers.len()
        );

        Ok(reply.nameservers)
    }

    /// Poll the overlay until the expected number of service instances
    /// is visible or the registration window closes.
    pub async fn discover(&self) -> Result<Vec<DnsEntry>, DnsError> {
        let service_domain = self.service_domain();
        let started = Instant::now();

        let mut discovered: BTreeMap<String, DnsEntry> = BTreeMap::new();

        loop {
            match self
                .inner
                .resolver
                .query(&service_domain, RecordType::Srv, false)
                .await
            {
                Ok((msg, _)) => {
                    for record in &msg.answers {
                        if record.rtype != RecordType::Srv {
                            continue;
                        }
                        if let Some(entry) =
                            DnsEntry::from_record(record, &self.inner.service_name)
                        {
                            discovered.insert(entry.domain_targets.join(","), entry);
                        }
                    }
                }
                Err(err) => {
                    debug!("discovery query failed: {err}");
                }
            }

            if discovered.len() >= self.inner.config.expected_nodes
                || started.elapsed() >= self.inner.config.registration_timeout
            {
                break;
            }

            tokio::time::sleep(self.inner.config.discovery_poll_interval).await;
        }

        Ok(discovered.into_values().collect())
    }

    /// Every service entry currently cached locally.
    pub async fn gather_registered(&self) -> Vec<DnsEntry> {
        let cache = self.inner.resolver.core().cache();
        let mut guard = cache.lock().await;

        guard
            .query(&self.service_domain(), RecordType::Srv)
            .iter()
            .filter_map(|record| DnsEntry::from_record(record, &self.inner.service_name))
            .collect()
    }

    pub async fn close(&self) {
        self.inner.dns_server.close();
        self.inner.controller.close().await;
    }
}

impl RegistrarInner {
    fn register_handlers(inner: &Arc<Self>) {
        let me = Arc::clone(inner);
        inner.controller.register_handler(
            EVENT_REGISTER_SERVICE,
            move |_shard, registration: Registration| {
                let me = Arc::clone(&me);
                async move {
                    info!(
                        "service {} registered from {}:{}",
                        registration.service_name, registration.host, registration.port
                    );

                    let entry = me.entry_for(&registration.host, registration.port);
                    me.resolver.core().add_entries(&[entry]).await;

                    let nameservers: Vec<NodeAddr> = {
                        let mut known = me.known_nameservers.lock().unwrap();
                        known.insert((registration.host.clone(), registration.port + 2));
                        known.iter().cloned().collect()
                    };

                    Ok::<_, String>(NameserverList { nameservers })
                }
            },
        );
    }

    /// Instance label for a peer: its address with separators flattened.
    fn instance_name(host: &str, port: u16) -> String {
        format!("{}-{}", host.replace(['.', ':'], "-"), port)
    }

    fn entry_for(&self, host: &str, port: u16) -> DnsEntry {
        let mut values = BTreeMap::new();
        values.insert("rpc_port".to_string(), port.to_string());
        values.insert("dns_port".to_string(), (port + 2).to_string());

        DnsEntry {
            instance_name: Self::instance_name(host, port),
            service_name: self.service_name.clone(),
            domain_protocol: DomainProtocol::Udp,
            domain_name: self.zone.clone(),
            priority: 10,
            weight: 10,
            service_port: port,
            values,
            domain_targets: vec![host.to_string()],
            record_types: vec![RecordType::A, RecordType::Srv, RecordType::Txt],
            ttl: SERVICE_TTL,
        }
    }

    fn probe_entry(&self) -> DnsEntry {
        self.entry_for("0.0.0.0", 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::record::RecordData;

    #[tokio::test]
    async fn test_registration_inserts_projections() {
        let config = SimurghConfig::with_secret("registrar-test");
        let registrar =
            Registrar::new("127.0.0.1", 17600, "gateway", "cluster.local", &config).unwrap();
        registrar.start().await.unwrap();

        let entries = registrar.gather_registered().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].service_port, 17600);

        // The A projection for the instance is resolvable locally.
        let (msg, from_cache) = registrar
            .resolver()
            .query("127-0-0-1-17600.cluster.local", RecordType::A, false)
            .await
            .unwrap();
        assert!(from_cache);
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(
            msg.answers[0].data,
            RecordData::A("127.0.0.1".parse().unwrap())
        );

        registrar.close().await;
    }

    #[tokio::test]
    async fn test_register_with_peer_exchanges_nameservers() {
        let config = SimurghConfig::with_secret("registrar-test");

        let seed =
            Registrar::new("127.0.0.1", 17610, "gateway", "cluster.local", &config).unwrap();
        seed.start().await.unwrap();

        let joiner =
            Registrar::new("127.0.0.1", 17620, "gateway", "cluster.local", &config).unwrap();
        joiner.start().await.unwrap();

        let nameservers = joiner
            .register_with(&("127.0.0.1".to_string(), 17610))
            .await
            .unwrap();

        // The seed reports itself and the joiner as nameservers.
        assert!(nameservers.contains(&("127.0.0.1".to_string(), 17612)));
        assert!(nameservers.contains(&("127.0.0.1".to_string(), 17622)));

        // The seed now caches the joiner's SRV entry.
        let entries = seed.gather_registered().await;
        assert_eq!(entries.len(), 2);

        joiner.close().await;
        seed.close().await;
    }

    #[tokio::test]
    async fn test_discovery_sees_registered_peer() {
        let mut config = SimurghConfig::with_secret("registrar-test");
        config.expected_nodes = 2;
        config.discovery_poll_interval = std::time::Duration::from_millis(50);

        let seed =
            Registrar::new("127.0.0.1", 17630, "gateway", "cluster.local", &config).unwrap();
        seed.start().await.unwrap();

        let joiner =
            Registrar::new("127.0.0.1", 17640, "gateway", "cluster.local", &config).unwrap();
        joiner.start().await.unwrap();
        joiner
            .register_with(&("127.0.0.1".to_string(), 17630))
            .await
            .unwrap();

        // The seed sees both instances in its own cache.
        let discovered = seed.discover().await.unwrap();
        assert_eq!(discovered.len(), 2);

        joiner.close().await;
        seed.close().await;
    }
}
