//! Typed payload records carried inside envelopes
//!
//! These are the structured bodies the RPC surface exchanges: health
//! checks for the failure detector, registrations for the discovery
//! overlay, and the error record used when a handler fails.

use serde::{Deserialize, Serialize};

/// A peer address as the membership layer keys it.
pub type NodeAddr = (String, u16);

/// Node liveness states.
///
/// `Initializing` is only ever a node's own status before it joins;
/// peers in the status table move between the other four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Initializing,
    Healthy,
    Suspect,
    Degraded,
    Failed,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthStatus::Initializing => "initializing",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Suspect => "suspect",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// The primary membership payload.
///
/// `target_host`/`target_port` name the subject of an indirect probe or
/// a state update about a third node; plain probes leave them unset.
/// `shard_ids` carries the verdict ids that justified a suspicion when
/// one is being propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub source_host: String,
    pub source_port: u16,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub status: HealthStatus,
    pub target_status: Option<HealthStatus>,
    pub error: Option<String>,
    pub shard_ids: Option<Vec<u64>>,
}

impl HealthCheck {
    pub fn new(source: &NodeAddr, status: HealthStatus) -> Self {
        Self {
            source_host: source.0.clone(),
            source_port: source.1,
            target_host: None,
            target_port: None,
            status,
            target_status: None,
            error: None,
            shard_ids: None,
        }
    }

    pub fn with_target(mut self, target: &NodeAddr) -> Self {
        self.target_host = Some(target.0.clone());
        self.target_port = Some(target.1);
        self
    }

    pub fn with_target_status(mut self, status: HealthStatus) -> Self {
        self.target_status = Some(status);
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn with_shard_ids(mut self, shard_ids: Vec<u64>) -> Self {
        self.shard_ids = Some(shard_ids);
        self
    }

    pub fn source(&self) -> NodeAddr {
        (self.source_host.clone(), self.source_port)
    }

    pub fn target(&self) -> Option<NodeAddr> {
        match (&self.target_host, self.target_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }
}

/// Join-handshake payload for the discovery overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub host: String,
    pub port: u16,
    pub service_name: String,
}

/// Registrar response: the nameserver addresses known for a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameserverList {
    pub nameservers: Vec<NodeAddr>,
}

/// Error record returned in place of a normal response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_payload, encode_payload};

    #[test]
    fn test_healthcheck_round_trip() {
        let check = HealthCheck::new(&("127.0.0.1".to_string(), 7000), HealthStatus::Healthy)
            .with_target(&("127.0.0.1".to_string(), 7010))
            .with_target_status(HealthStatus::Suspect)
            .with_shard_ids(vec![10, 11]);

        let bytes = encode_payload(&check).unwrap();
        let parsed: HealthCheck = decode_payload(&bytes).unwrap();
        assert_eq!(parsed, check);
    }

    #[test]
    fn test_error_payload_is_not_a_healthcheck() {
        let error = ErrorPayload {
            error: "handler failed".to_string(),
        };

        let bytes = encode_payload(&error).unwrap();
        assert!(decode_payload::<HealthCheck>(&bytes).is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(HealthStatus::Suspect.to_string(), "suspect");
        assert_eq!(HealthStatus::Failed.to_string(), "failed");
    }
}
