//! Upstream nameserver selection
//!
//! Nameservers are tried in order of fewest recent failures; the
//! failure counters decay on a fixed window so one bad minute does not
//! blacklist a server forever.

use crate::dns::DnsError;
use std::time::{Duration, Instant};

/// Failure counters reset after this long.
const DECAY_WINDOW: Duration = Duration::from_secs(60);

/// How a nameserver is spoken to, from its URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsScheme {
    Udp,
    Tcp,
    Https,
}

impl NsScheme {
    fn default_port(self) -> u16 {
        match self {
            NsScheme::Udp | NsScheme::Tcp => 53,
            NsScheme::Https => 443,
        }
    }
}

/// One upstream nameserver address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsAddr {
    pub scheme: NsScheme,
    pub host: String,
    pub port: u16,
    /// Path component for DoH endpoints.
    pub path: String,
}

impl NsAddr {
    /// Parse `scheme://host:port/path`; a bare `host` or `host:port`
    /// defaults to UDP on 53.
    pub fn parse(value: &str) -> Result<Self, DnsError> {
        let (scheme, rest) = match value.split_once("://") {
            Some(("udp", rest)) => (NsScheme::Udp, rest),
            Some(("tcp", rest)) => (NsScheme::Tcp, rest),
            Some(("https", rest)) => (NsScheme::Https, rest),
            Some((other, _)) => {
                return Err(DnsError::Malformed(format!(
                    "unsupported nameserver scheme: {other}"
                )))
            }
            None => (NsScheme::Udp, value),
        };

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, format!("/{path}")),
            None => (rest, String::from("/dns-query")),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| DnsError::Malformed(format!("bad port in {value}")))?;
                (host.to_string(), port)
            }
            _ => (authority.to_string(), scheme.default_port()),
        };

        if host.is_empty() {
            return Err(DnsError::Malformed(format!("empty nameserver host: {value}")));
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    pub fn url(&self) -> String {
        let scheme = match self.scheme {
            NsScheme::Udp => "udp",
            NsScheme::Tcp => "tcp",
            NsScheme::Https => "https",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// A rotation of nameservers sorted by recent failure count.
pub struct NameServers {
    data: Vec<NsAddr>,
    failures: Vec<u32>,
    sorted: Vec<usize>,
    stamped: Instant,
}

impl NameServers {
    pub fn new(addrs: Vec<NsAddr>) -> Self {
        let len = addrs.len();
        Self {
            data: addrs,
            failures: vec![0; len],
            sorted: (0..len).collect(),
            stamped: Instant::now(),
        }
    }

    pub fn from_urls(urls: &[String]) -> Result<Self, DnsError> {
        let addrs = urls
            .iter()
            .map(|url| NsAddr::parse(url))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(addrs))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn decay(&mut self) {
        if self.stamped.elapsed() > DECAY_WINDOW {
            self.stamped = Instant::now();

            let failures = &self.failures;
            let mut order: Vec<usize> = (0..self.data.len()).collect();
            order.sort_by_key(|idx| failures[*idx]);
            self.sorted = order;

            self.failures = vec![0; self.data.len()];
        }
    }

    pub fn success(&mut self, _addr: &NsAddr) {
        self.decay();
    }

    pub fn fail(&mut self, addr: &NsAddr) {
        self.decay();
        if let Some(idx) = self.data.iter().position(|each| each == addr) {
            self.failures[idx] += 1;
        }
    }

    /// Iterate addresses, best first. Errors when the list is empty.
    pub fn iter(&mut self) -> Result<Vec<NsAddr>, DnsError> {
        if self.data.is_empty() {
            return Err(DnsError::NoNameServer);
        }

        self.decay();
        Ok(self
            .sorted
            .iter()
            .map(|idx| self.data[*idx].clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schemes_and_defaults() {
        let udp = NsAddr::parse("10.0.0.53").unwrap();
        assert_eq!(udp.scheme, NsScheme::Udp);
        assert_eq!(udp.port, 53);

        let tcp = NsAddr::parse("tcp://10.0.0.53:5353").unwrap();
        assert_eq!(tcp.scheme, NsScheme::Tcp);
        assert_eq!(tcp.port, 5353);

        let doh = NsAddr::parse("https://dns.example.com/resolve").unwrap();
        assert_eq!(doh.scheme, NsScheme::Https);
        assert_eq!(doh.port, 443);
        assert_eq!(doh.path, "/resolve");

        assert!(NsAddr::parse("ftp://10.0.0.1").is_err());
    }

    #[test]
    fn test_empty_rotation_errors() {
        let mut rotation = NameServers::new(Vec::new());
        assert_eq!(rotation.iter().unwrap_err(), DnsError::NoNameServer);
    }

    #[test]
    fn test_rotation_preserves_all_entries() {
        let mut rotation = NameServers::from_urls(&[
            "10.0.0.1".to_string(),
            "10.0.0.2".to_string(),
        ])
        .unwrap();

        let addrs = rotation.iter().unwrap();
        assert_eq!(addrs.len(), 2);

        let first = addrs[0].clone();
        rotation.fail(&first);
        assert_eq!(rotation.iter().unwrap().len(), 2);
    }
}
