//! Resolvers
//!
//! Two variants over a shared core. The proxy resolver forwards cache
//! misses to configured upstreams, picking the rule whose suffix
//! matches the most labels. The recursive resolver walks down from the
//! root-server cache, following referrals with a bounded tick budget.
//!
//! Shared behavior: IP questions rewrite to PTR, cache hits chase
//! CNAME chains with cycle detection, configured zone domains answer
//! NXDOMAIN authoritatively on miss, and identical in-flight queries
//! coalesce onto one upstream request.

use crate::dns::cache::CacheNode;
use crate::dns::client::DnsClient;
use crate::dns::entry::DnsEntry;
use crate::dns::message::{DnsMessage, RCODE_NXDOMAIN, RCODE_SERVFAIL};
use crate::dns::nameservers::{NameServers, NsAddr, NsScheme};
use crate::dns::record::{Question, Record, RecordData, RecordType};
use crate::dns::DnsError;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Well-known root servers, used when no root hints file is loaded.
const DEFAULT_ROOT_SERVERS: &[(&str, &str)] = &[
    ("a.root-servers.net", "198.41.0.4"),
    ("b.root-servers.net", "170.247.170.2"),
    ("c.root-servers.net", "192.33.4.12"),
    ("d.root-servers.net", "199.7.91.13"),
    ("e.root-servers.net", "192.203.230.10"),
    ("f.root-servers.net", "192.5.5.241"),
    ("g.root-servers.net", "192.112.36.4"),
    ("h.root-servers.net", "198.97.190.53"),
    ("i.root-servers.net", "192.36.148.17"),
    ("j.root-servers.net", "192.58.128.30"),
    ("k.root-servers.net", "193.0.14.129"),
    ("l.root-servers.net", "199.7.83.42"),
    ("m.root-servers.net", "202.12.27.33"),
];

pub type QueryResult = Result<(DnsMessage, bool), DnsError>;

#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve `fqdn`/`qtype`, returning the answer message and
    /// whether it was served entirely from cache.
    async fn query(
        &self,
        fqdn: &str,
        qtype: RecordType,
        skip_cache: bool,
    ) -> QueryResult;
}

/// Coalesces identical in-flight `(fqdn, qtype)` queries.
#[derive(Default)]
struct Memoizer {
    inflight: Mutex<HashMap<(String, u16), Vec<oneshot::Sender<QueryResult>>>>,
}

enum MemoSlot {
    Leader,
    Follower(oneshot::Receiver<QueryResult>),
}

impl Memoizer {
    fn begin(&self, key: &(String, u16)) -> MemoSlot {
        let mut inflight = self.inflight.lock().unwrap();
        match inflight.get_mut(key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                MemoSlot::Follower(rx)
            }
            None => {
                inflight.insert(key.clone(), Vec::new());
                MemoSlot::Leader
            }
        }
    }

    fn complete(&self, key: &(String, u16), result: &QueryResult) {
        let waiters = self.inflight.lock().unwrap().remove(key);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(result.clone());
        }
    }
}

/// State and behavior shared by both resolver variants.
pub struct ResolverCore {
    cache: Arc<tokio::sync::Mutex<CacheNode>>,
    client: DnsClient,
    zone_domains: Mutex<Vec<String>>,
    query_timeout: Duration,
    memo: Memoizer,
}

impl ResolverCore {
    pub fn new(
        cache: Arc<tokio::sync::Mutex<CacheNode>>,
        client: DnsClient,
        query_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            client,
            zone_domains: Mutex::new(Vec::new()),
            query_timeout,
            memo: Memoizer::default(),
        }
    }

    pub fn cache(&self) -> Arc<tokio::sync::Mutex<CacheNode>> {
        Arc::clone(&self.cache)
    }

    /// Suffixes this resolver is authoritative for.
    pub fn set_zone_domains(&self, domains: Vec<String>) {
        *self.zone_domains.lock().unwrap() = domains
            .into_iter()
            .map(|domain| domain.trim_start_matches('.').to_string())
            .collect();
    }

    pub async fn add_entries(&self, entries: &[DnsEntry]) {
        let mut cache = self.cache.lock().await;
        for entry in entries {
            for record in entry.to_records() {
                cache.add(record);
            }
        }
    }

    /// Cache every non-SOA record of a response.
    async fn cache_message(&self, msg: &DnsMessage) {
        let mut cache = self.cache.lock().await;
        for record in msg
            .answers
            .iter()
            .chain(&msg.authorities)
            .chain(&msg.additionals)
        {
            if record.ttl > 0 && record.rtype != RecordType::Soa {
                cache.add(record.clone());
            }
        }
    }

    /// One upstream exchange with the resolver-level sanity checks.
    async fn request(
        &self,
        fqdn: &str,
        qtype: RecordType,
        addr: &NsAddr,
    ) -> Result<DnsMessage, DnsError> {
        let response = self.client.query(fqdn, qtype, addr).await?;

        match response.questions.first() {
            Some(question) if question.name.eq_ignore_ascii_case(fqdn) => {}
            _ => return Err(DnsError::QuestionMismatch),
        }

        if response.rcode == RCODE_SERVFAIL {
            return Err(DnsError::ServerFail);
        }

        self.cache_message(&response).await;
        Ok(response)
    }

    /// Resolve as far as the cache allows: chase CNAME hops (cycle
    /// safe), add records of the requested type, and answer NXDOMAIN
    /// for misses inside our own zones. Returns whether an answer was
    /// produced and the final name after CNAME chasing.
    async fn query_cache(
        &self,
        msg: &mut DnsMessage,
        fqdn: &str,
        qtype: RecordType,
    ) -> (bool, String) {
        let mut cache = self.cache.lock().await;

        let mut name = fqdn.to_string();
        let mut chased: HashSet<String> = HashSet::new();
        let mut followed_cname = false;

        loop {
            let cnames = cache.query(&name, RecordType::Cname);
            let Some(first) = cnames.into_iter().next() else {
                break;
            };

            msg.answers.push(first.with_name(&name));
            followed_cname = true;

            let RecordData::Cname(next) = &first.data else {
                break;
            };

            if !chased.insert(next.clone()) {
                // CNAME cycle: stop with the partial chain.
                debug!("cname cycle at {next}");
                break;
            }

            // RFC 1034: a CNAME node holds no other data, so move on.
            name = next.clone();
        }

        let mut has_result =
            followed_cname && matches!(qtype, RecordType::Cname | RecordType::Any);

        if qtype != RecordType::Cname {
            for record in cache.query(&name, qtype) {
                if let RecordData::Ns(ns_host) = &record.data {
                    let mut glue = cache.query(ns_host, RecordType::A);
                    glue.extend(cache.query(ns_host, RecordType::Aaaa));

                    if !glue.is_empty() {
                        msg.additionals.extend(glue);
                        msg.authorities.push(record);
                        has_result = true;
                    }
                } else {
                    msg.answers.push(record.with_name(&name));
                    has_result = true;
                }
            }
        }

        let in_zone = {
            let zones = self.zone_domains.lock().unwrap();
            let dotted = format!(".{name}");
            zones
                .iter()
                .any(|zone| dotted.ends_with(&format!(".{zone}")))
        };

        if in_zone {
            if !has_result {
                msg.rcode = RCODE_NXDOMAIN;
                has_result = true;
            }
            msg.aa = 1;
        }

        (has_result, name)
    }
}

/// Rewrite `ANY` questions about literal IPs into PTR questions.
fn rewrite_ip_query(fqdn: &str, qtype: RecordType) -> (String, RecordType) {
    if qtype != RecordType::Any {
        return (fqdn.to_string(), qtype);
    }

    match fqdn.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => {
            let octets = addr.octets();
            (
                format!(
                    "{}.{}.{}.{}.in-addr.arpa",
                    octets[3], octets[2], octets[1], octets[0]
                ),
                RecordType::Ptr,
            )
        }
        Ok(IpAddr::V6(addr)) => {
            let nibbles: Vec<String> = addr
                .octets()
                .iter()
                .rev()
                .flat_map(|byte| [format!("{:x}", byte & 0x0f), format!("{:x}", byte >> 4)])
                .collect();
            (format!("{}.ip6.arpa", nibbles.join(".")), RecordType::Ptr)
        }
        Err(_) => (fqdn.to_string(), qtype),
    }
}

/// One proxy rule: queries matching `suffix` go to `servers`; a rule
/// without a suffix is the fallback.
struct ProxyRule {
    suffix: Option<String>,
    servers: Arc<Mutex<NameServers>>,
}

/// Proxy resolver: resolve through configured upstream recursors.
pub struct ProxyResolver {
    core: Arc<ResolverCore>,
    rules: Mutex<Vec<ProxyRule>>,
}

impl ProxyResolver {
    pub fn new(core: Arc<ResolverCore>, default_nameservers: &[String]) -> Result<Self, DnsError> {
        let resolver = Self {
            core,
            rules: Mutex::new(Vec::new()),
        };

        if !default_nameservers.is_empty() {
            resolver.add_rule(None, default_nameservers)?;
        }

        Ok(resolver)
    }

    pub fn core(&self) -> &ResolverCore {
        &self.core
    }

    /// Add a per-suffix upstream rule (None = fallback).
    pub fn add_rule(&self, suffix: Option<&str>, urls: &[String]) -> Result<(), DnsError> {
        let servers = NameServers::from_urls(urls)?;
        self.rules.lock().unwrap().push(ProxyRule {
            suffix: suffix.map(|s| s.trim_start_matches('.').to_string()),
            servers: Arc::new(Mutex::new(servers)),
        });
        Ok(())
    }

    /// Longest matching suffix wins; the fallback rule catches the
    /// rest.
    fn nameservers_for(&self, fqdn: &str) -> Option<Arc<Mutex<NameServers>>> {
        let rules = self.rules.lock().unwrap();
        let dotted = format!(".{fqdn}");

        let mut best: Option<(&ProxyRule, usize)> = None;
        let mut fallback: Option<&ProxyRule> = None;

        for rule in rules.iter() {
            match &rule.suffix {
                Some(suffix) => {
                    if dotted.ends_with(&format!(".{suffix}"))
                        && best.map_or(true, |(_, len)| suffix.len() > len)
                    {
                        best = Some((rule, suffix.len()));
                    }
                }
                None => fallback = Some(rule),
            }
        }

        best.map(|(rule, _)| Arc::clone(&rule.servers))
            .or_else(|| fallback.map(|rule| Arc::clone(&rule.servers)))
    }

    async fn fetch(&self, fqdn: &str, qtype: RecordType, skip_cache: bool) -> QueryResult {
        let mut msg = DnsMessage::response();
        msg.questions.push(Question::new(fqdn, qtype));

        let mut has_result = false;
        let mut from_cache = false;
        let mut name = fqdn.to_string();

        if !skip_cache {
            let (hit, chased) = self.core.query_cache(&mut msg, fqdn, qtype).await;
            has_result = hit;
            from_cache = hit;
            name = chased;
        }

        if !has_result {
            let servers = self
                .nameservers_for(&name)
                .ok_or(DnsError::NoNameServer)?;
            let addrs = servers.lock().unwrap().iter()?;

            let mut last_err = DnsError::NoNameServer;

            for addr in addrs {
                match self.core.request(&name, qtype, &addr).await {
                    Ok(response) => {
                        if response.ra == 0 {
                            servers.lock().unwrap().fail(&addr);
                            last_err =
                                DnsError::Upstream("upstream is not recursive".to_string());
                            continue;
                        }

                        servers.lock().unwrap().success(&addr);
                        msg.answers.extend(response.answers);
                        msg.rcode = response.rcode;
                        has_result = true;
                        break;
                    }
                    Err(err) => {
                        servers.lock().unwrap().fail(&addr);
                        debug!("upstream {} failed: {err}", addr.url());
                        last_err = err;
                    }
                }
            }

            if !has_result {
                return Err(last_err);
            }
        }

        Ok((msg, from_cache))
    }
}

#[async_trait]
impl Resolve for ProxyResolver {
    async fn query(&self, fqdn: &str, qtype: RecordType, skip_cache: bool) -> QueryResult {
        let (fqdn, qtype) = rewrite_ip_query(fqdn.trim_end_matches('.'), qtype);
        let key = (fqdn.clone(), qtype.code());

        match self.core.memo.begin(&key) {
            MemoSlot::Follower(rx) => rx.await.unwrap_or(Err(DnsError::Timeout)),
            MemoSlot::Leader => {
                let result = timeout(
                    self.core.query_timeout,
                    self.fetch(&fqdn, qtype, skip_cache),
                )
                .await
                .unwrap_or(Err(DnsError::Timeout));

                self.core.memo.complete(&key, &result);
                result
            }
        }
    }
}

/// Recursive resolver: walk from the root servers down.
pub struct RecursiveResolver {
    core: Arc<ResolverCore>,
    max_ticks: usize,
}

impl RecursiveResolver {
    pub fn new(core: Arc<ResolverCore>, max_ticks: usize) -> Self {
        Self { core, max_ticks }
    }

    pub fn core(&self) -> &ResolverCore {
        &self.core
    }

    /// Seed the cache with the built-in root servers.
    pub async fn load_default_roots(&self) {
        let mut cache = self.core.cache.lock().await;
        for (host, ip) in DEFAULT_ROOT_SERVERS {
            cache.add(Record::new("", RecordData::Ns(host.to_string()), -1));
            if let Ok(IpAddr::V4(addr)) = ip.parse::<IpAddr>() {
                cache.add(Record::new(host, RecordData::A(addr), -1));
            }
        }
    }

    /// Seed the cache from a root hints file in named.cache format.
    pub async fn load_root_hints(&self, contents: &str) {
        let mut cache = self.core.cache.lock().await;

        for line in contents.lines() {
            if line.starts_with(';') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                continue;
            }

            let name = parts[0].trim_end_matches('.').to_ascii_lowercase();
            let data = parts[3].trim_end_matches('.').to_ascii_lowercase();

            let record = match RecordType::from_name(parts[2]) {
                Some(RecordType::Ns) => Record::new(&name, RecordData::Ns(data), -1),
                Some(RecordType::A) => match data.parse::<IpAddr>() {
                    Ok(IpAddr::V4(addr)) => Record::new(&name, RecordData::A(addr), -1),
                    _ => continue,
                },
                Some(RecordType::Aaaa) => match data.parse::<IpAddr>() {
                    Ok(IpAddr::V6(addr)) => Record::new(&name, RecordData::Aaaa(addr), -1),
                    _ => continue,
                },
                _ => continue,
            };

            cache.add(record);
        }
    }

    /// Find nameservers for a name by walking up its parent domains in
    /// the cache.
    async fn nameservers_for(&self, name: &str) -> NameServers {
        let mut cache = self.core.cache.lock().await;

        let mut fqdn = name.to_string();
        let mut hosts: Vec<NsAddr> = Vec::new();

        loop {
            if fqdn == "in-addr.arpa" {
                break;
            }

            fqdn = match fqdn.split_once('.') {
                Some((_, rest)) => rest.to_string(),
                None => String::new(),
            };

            for record in cache.query(&fqdn, RecordType::Ns) {
                let RecordData::Ns(ns_host) = &record.data else {
                    continue;
                };

                if ns_host.parse::<IpAddr>().is_ok() {
                    hosts.push(NsAddr {
                        scheme: NsScheme::Udp,
                        host: ns_host.clone(),
                        port: 53,
                        path: String::new(),
                    });
                    continue;
                }

                let mut glue = cache.query(ns_host, RecordType::A);
                glue.extend(cache.query(ns_host, RecordType::Aaaa));

                for record in glue {
                    let ip = match &record.data {
                        RecordData::A(addr) => addr.to_string(),
                        RecordData::Aaaa(addr) => addr.to_string(),
                        _ => continue,
                    };
                    hosts.push(NsAddr {
                        scheme: NsScheme::Udp,
                        host: ip,
                        port: 53,
                        path: String::new(),
                    });
                }
            }

            if !hosts.is_empty() || fqdn.is_empty() {
                break;
            }
        }

        NameServers::new(hosts)
    }

    fn fetch<'a>(
        &'a self,
        fqdn: &'a str,
        qtype: RecordType,
        skip_cache: bool,
    ) -> futures::future::BoxFuture<'a, QueryResult> {
        Box::pin(async move {
            let mut msg = DnsMessage::response();
            msg.questions.push(Question::new(fqdn, qtype));

            let mut has_result = false;
            let mut from_cache = false;
            let mut name = fqdn.to_string();

            if !skip_cache {
                let (hit, chased) = self.core.query_cache(&mut msg, fqdn, qtype).await;
                has_result = hit;
                from_cache = hit;
                name = chased;
            }

            if has_result {
                return Ok((msg, from_cache));
            }

            let mut nameservers = self.nameservers_for(&name).await;
            let mut tick = self.max_ticks;
            let mut last_err = DnsError::NoNameServer;

            while !has_result && tick > 0 {
                tick -= 1;

                let addrs = nameservers.iter()?;
                let mut progressed = false;

                for addr in addrs {
                    match self.query_remote(&mut msg, &mut name, qtype, &addr, tick).await {
                        Ok((done, referrals)) => {
                            has_result = done;
                            if !referrals.is_empty() {
                                nameservers = NameServers::new(referrals);
                            }
                            progressed = true;
                            break;
                        }
                        Err(err) => {
                            warn!("recursive step via {} failed: {err}", addr.url());
                            last_err = err;
                        }
                    }
                }

                if !progressed {
                    return Err(last_err);
                }
            }

            if !has_result {
                return Err(DnsError::MaxTicks);
            }

            Ok((msg, from_cache))
        })
    }

    /// One step of the walk: either the answer, a negative SOA, or a
    /// referral to a deeper set of nameservers.
    async fn query_remote(
        &self,
        msg: &mut DnsMessage,
        name: &mut String,
        qtype: RecordType,
        addr: &NsAddr,
        tick: usize,
    ) -> Result<(bool, Vec<NsAddr>), DnsError> {
        let response = self.core.request(name, qtype, addr).await?;

        let mut has_cname = false;
        let mut has_result = false;
        let mut has_referral = false;

        for record in &response.answers {
            msg.answers.push(record.clone());

            if let RecordData::Cname(target) = &record.data {
                *name = target.clone();
                has_cname = true;
            }

            if record.rtype != RecordType::Cname
                || matches!(qtype, RecordType::Any | RecordType::Cname)
            {
                has_result = true;
            }
        }

        for record in &response.authorities {
            match record.rtype {
                RecordType::Soa => {
                    // Negative answer from the authority.
                    msg.authorities.push(record.clone());
                    has_result = true;
                }
                RecordType::Ns => has_referral = true,
                _ => {}
            }
        }

        if !has_cname && !has_referral && !has_result {
            msg.rcode = RCODE_SERVFAIL;
            return Ok((true, Vec::new()));
        }

        if has_result {
            return Ok((true, Vec::new()));
        }

        // Build the next hop from glue records, or resolve the
        // nameserver names ourselves when the glue is missing.
        let mut glue: HashMap<&str, String> = HashMap::new();
        for record in &response.additionals {
            match &record.data {
                RecordData::A(ip) => {
                    glue.insert(record.name.as_str(), ip.to_string());
                }
                RecordData::Aaaa(ip) => {
                    glue.insert(record.name.as_str(), ip.to_string());
                }
                _ => {}
            }
        }

        let ns_hosts: Vec<String> = response
            .authorities
            .iter()
            .filter_map(|record| match &record.data {
                RecordData::Ns(host) => Some(host.clone()),
                RecordData::Soa { mname, .. } => Some(mname.clone()),
                _ => None,
            })
            .collect();

        let mut referrals: Vec<NsAddr> = ns_hosts
            .iter()
            .filter_map(|host| glue.get(host.as_str()))
            .map(|ip| NsAddr {
                scheme: NsScheme::Udp,
                host: ip.clone(),
                port: 53,
                path: String::new(),
            })
            .collect();

        if referrals.is_empty() && !ns_hosts.is_empty() && tick > 0 {
            for host in &ns_hosts {
                let lookup: futures::future::BoxFuture<'_, QueryResult> =
                    self.fetch(host, RecordType::A, false);
                match lookup.await {
                    Ok((ns_msg, _)) => {
                        for record in &ns_msg.answers {
                            if let RecordData::A(ip) = &record.data {
                                referrals.push(NsAddr {
                                    scheme: NsScheme::Udp,
                                    host: ip.to_string(),
                                    port: 53,
                                    path: String::new(),
                                });
                            }
                        }
                    }
                    Err(err) => {
                        debug!("nameserver lookup for {host} failed: {err}");
                    }
                }

                if !referrals.is_empty() {
                    break;
                }
            }
        }

        if referrals.is_empty() {
            return Err(DnsError::NoNameServer);
        }

        Ok((false, referrals))
    }
}

#[async_trait]
impl Resolve for RecursiveResolver {
    async fn query(&self, fqdn: &str, qtype: RecordType, skip_cache: bool) -> QueryResult {
        let (fqdn, qtype) = rewrite_ip_query(fqdn.trim_end_matches('.'), qtype);
        let key = (fqdn.clone(), qtype.code());

        match self.core.memo.begin(&key) {
            MemoSlot::Follower(rx) => rx.await.unwrap_or(Err(DnsError::Timeout)),
            MemoSlot::Leader => {
                let result = timeout(
                    self.core.query_timeout,
                    self.fetch(&fqdn, qtype, skip_cache),
                )
                .await
                .unwrap_or(Err(DnsError::Timeout));

                self.core.memo.complete(&key, &result);
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn core_with_cache() -> (Arc<ResolverCore>, Arc<tokio::sync::Mutex<CacheNode>>) {
        let cache = Arc::new(tokio::sync::Mutex::new(CacheNode::new()));
        let core = Arc::new(ResolverCore::new(
            Arc::clone(&cache),
            DnsClient::new(Duration::from_secs(5)),
            Duration::from_secs(3),
        ));
        (core, cache)
    }

    #[tokio::test]
    async fn test_cname_chain_resolves_in_order() {
        let (core, cache) = core_with_cache();

        {
            let mut cache = cache.lock().await;
            cache.add_parts("a.local", RecordData::Cname("b.local".to_string()), 300);
            cache.add_parts("b.local", RecordData::Cname("c.local".to_string()), 300);
            cache.add_parts("c.local", RecordData::A(Ipv4Addr::new(10, 0, 0, 1)), 300);
        }

        let resolver = ProxyResolver::new(Arc::clone(&core), &[]).unwrap();

        let (msg, from_cache) = resolver.query("a.local", RecordType::A, false).await.unwrap();

        assert!(from_cache);
        assert_eq!(msg.answers.len(), 3);
        assert_eq!(msg.answers[0].name, "a.local");
        assert_eq!(msg.answers[1].name, "b.local");
        assert_eq!(msg.answers[2].data, RecordData::A(Ipv4Addr::new(10, 0, 0, 1)));

        // Second identical query: still served from cache.
        let (_, from_cache) = resolver.query("a.local", RecordType::A, false).await.unwrap();
        assert!(from_cache);
    }

    #[tokio::test]
    async fn test_cname_cycle_terminates() {
        let (core, cache) = core_with_cache();

        {
            let mut cache = cache.lock().await;
            cache.add_parts("a.local", RecordData::Cname("b.local".to_string()), 300);
            cache.add_parts("b.local", RecordData::Cname("a.local".to_string()), 300);
        }

        core.set_zone_domains(vec!["local".to_string()]);
        let resolver = ProxyResolver::new(Arc::clone(&core), &[]).unwrap();

        let (msg, _) = resolver.query("a.local", RecordType::A, false).await.unwrap();

        // Partial chain, no loop, no upstream escape.
        assert!(!msg.answers.is_empty());
        assert!(msg.answers.len() <= 3);
    }

    #[tokio::test]
    async fn test_zone_miss_is_nxdomain() {
        let (core, _cache) = core_with_cache();
        core.set_zone_domains(vec!["cluster.local".to_string()]);

        let resolver = ProxyResolver::new(Arc::clone(&core), &[]).unwrap();

        let (msg, from_cache) = resolver
            .query("missing.cluster.local", RecordType::A, false)
            .await
            .unwrap();

        assert!(from_cache);
        assert_eq!(msg.rcode, RCODE_NXDOMAIN);
        assert_eq!(msg.aa, 1);
        assert!(msg.answers.is_empty());
    }

    #[tokio::test]
    async fn test_miss_without_nameservers_errors() {
        let (core, _cache) = core_with_cache();
        let resolver = ProxyResolver::new(Arc::clone(&core), &[]).unwrap();

        let result = resolver.query("nowhere.example", RecordType::A, false).await;
        assert!(matches!(result, Err(DnsError::NoNameServer)));
    }

    #[tokio::test]
    async fn test_ip_any_query_rewrites_to_ptr() {
        let (core, cache) = core_with_cache();

        {
            let mut cache = cache.lock().await;
            cache.add_parts(
                "1.0.0.10.in-addr.arpa",
                RecordData::Ptr("node-1.cluster.local".to_string()),
                300,
            );
        }

        let resolver = ProxyResolver::new(Arc::clone(&core), &[]).unwrap();

        let (msg, from_cache) = resolver.query("10.0.0.1", RecordType::Any, false).await.unwrap();
        assert!(from_cache);
        assert_eq!(
            msg.answers[0].data,
            RecordData::Ptr("node-1.cluster.local".to_string())
        );
    }

    #[tokio::test]
    async fn test_default_roots_seed_the_cache() {
        let (core, cache) = core_with_cache();
        let resolver = RecursiveResolver::new(core, 5);
        resolver.load_default_roots().await;

        let mut guard = cache.lock().await;
        assert_eq!(guard.query("", RecordType::Ns).len(), 13);
        assert_eq!(guard.query("a.root-servers.net", RecordType::A).len(), 1);
    }

    #[tokio::test]
    async fn test_recursive_ns_walk_finds_parent_servers() {
        let (core, cache) = core_with_cache();

        {
            let mut cache = cache.lock().await;
            cache.add_parts(
                "cluster.local",
                RecordData::Ns("ns1.cluster.local".to_string()),
                -1,
            );
            cache.add_parts(
                "ns1.cluster.local",
                RecordData::A(Ipv4Addr::new(10, 0, 0, 53)),
                -1,
            );
        }

        let resolver = RecursiveResolver::new(core, 5);

        let mut servers = resolver.nameservers_for("node-1.cluster.local").await;
        let addrs = servers.iter().unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].host, "10.0.0.53");

        // Hints file loading feeds the same walk.
        let hints = ".                        3600000      NS    x.root-servers.net.\n\
                     x.root-servers.net.      3600000      A     198.41.0.4\n\
                     ; comment line\n";
        resolver.load_root_hints(hints).await;

        let mut roots = resolver.nameservers_for("example.com").await;
        let addrs = roots.iter().unwrap();
        assert_eq!(addrs[0].host, "198.41.0.4");
    }

    #[test]
    fn test_longest_suffix_rule_wins() {
        let (core, _cache) = core_with_cache();
        let resolver = ProxyResolver::new(core, &["10.0.0.1:53".to_string()]).unwrap();

        resolver
            .add_rule(Some("cluster.local"), &["10.0.0.2:53".to_string()])
            .unwrap();
        resolver
            .add_rule(Some("local"), &["10.0.0.3:53".to_string()])
            .unwrap();

        let servers = resolver.nameservers_for("node-1.cluster.local").unwrap();
        let addrs = servers.lock().unwrap().iter().unwrap();
        assert_eq!(addrs[0].host, "10.0.0.2");

        let fallback = resolver.nameservers_for("example.com").unwrap();
        let addrs = fallback.lock().unwrap().iter().unwrap();
        assert_eq!(addrs[0].host, "10.0.0.1");
    }
}
