//! DNS overlay: records, cache, resolvers, and servers
//!
//! The discovery half of the runtime. Peers are advertised as SRV/A
//! entries in a trie-backed record cache, served over UDP and TCP
//! using the same encrypted envelope framing as the RPC substrate, and
//! resolved through either a proxying or a fully recursive resolver.

pub mod cache;
pub mod client;
pub mod entry;
pub mod message;
pub mod nameservers;
pub mod record;
pub mod resolver;
pub mod server;

/// Event name DNS packets travel under inside overlay envelopes.
pub const DNS_QUERY_EVENT: &str = "dns_query";

/// DNS-layer failure kinds. Cloneable so coalesced queries can fan the
/// same failure out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    #[error("malformed dns packet: {0}")]
    Malformed(String),

    #[error("question section mismatch")]
    QuestionMismatch,

    #[error("transaction id mismatch")]
    TransactionMismatch,

    #[error("remote server failed")]
    ServerFail,

    #[error("cname cycle detected")]
    CnameCycle,

    #[error("no nameserver available")]
    NoNameServer,

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("query timed out")]
    Timeout,

    #[error("maximum recursion depth exceeded")]
    MaxTicks,
}
