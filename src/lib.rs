//! Simurgh: cluster membership and service discovery runtime
//!
//! Simurgh nodes find each other, watch each other, and advertise each
//! other. Every node exposes a typed request/response and streaming
//! RPC surface over paired UDP and TCP transports, runs a SWIM-style
//! failure detector on top of it, and participates in a small DNS
//! overlay so peers can be located by service name.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   probes / gossip    ┌───────────┐
//! │  Monitor  │◄────────────────────►│  Monitor  │
//! ├───────────┤                      ├───────────┤
//! │ Controller│  UDP :P   TCP :P+1   │ Controller│
//! ├───────────┤                      ├───────────┤
//! │ Registrar │  DNS :P+2 / :P+3     │ Registrar │
//! └───────────┘                      └───────────┘
//!       │        encrypted envelopes       │
//!       └──── zstd(AES-GCM(msgpack)) ──────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use simurgh::{Monitor, SimurghConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), simurgh::SimurghError> {
//!     let config = SimurghConfig::with_secret("cluster-secret");
//!
//!     let monitor = Monitor::new("127.0.0.1", 7000, 1, &config);
//!     monitor.start().await?;
//!
//!     // Join an existing cluster through a seed node.
//!     monitor.register(&("127.0.0.1".to_string(), 7010)).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod controller;
pub mod dns;
pub mod models;
pub mod monitor;
pub mod registrar;
pub mod snowflake;
pub mod transport;

// Re-export core types
pub use codec::{CodecError, Envelope, EnvelopeCodec, FrameKind};
pub use config::{DnsConfig, SimurghConfig};
pub use controller::Controller;
pub use dns::cache::CacheNode;
pub use dns::entry::{DnsEntry, DomainProtocol};
pub use dns::message::DnsMessage;
pub use dns::record::{Record, RecordData, RecordType};
pub use dns::resolver::{ProxyResolver, RecursiveResolver, Resolve, ResolverCore};
pub use dns::server::DnsServer;
pub use dns::DnsError;
pub use models::{HealthCheck, HealthStatus, NodeAddr, Registration};
pub use monitor::Monitor;
pub use registrar::Registrar;
pub use snowflake::SnowflakeGenerator;
pub use transport::TransportError;

/// Simurgh error types
#[derive(Debug, thiserror::Error)]
pub enum SimurghError {
    /// Envelope codec failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// DNS-layer failure
    #[error("dns error: {0}")]
    Dns(#[from] DnsError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_tags() {
        let tag = serde_json::to_string(&HealthStatus::Suspect).unwrap();
        assert_eq!(tag, "\"suspect\"");
    }

    #[test]
    fn test_errors_convert() {
        let transport = TransportError::NotConnected;
        let err: SimurghError = transport.into();
        assert!(matches!(err, SimurghError::Transport(_)));

        let dns = DnsError::NoNameServer;
        let err: SimurghError = dns.into();
        assert!(matches!(err, SimurghError::Dns(_)));
    }
}
