//! Wire envelope codec
//!
//! Every logical message (RPC request, response, stream frame, or a DNS
//! packet riding the overlay) travels as one envelope:
//!
//! ```text
//! zstd( AES-256-GCM( msgpack( (kind, shard_id, event, payload, host, port) ) ) )
//! ```
//!
//! Encode serializes the tuple with MessagePack, seals it under a random
//! 96-bit nonce (nonce prepended to the ciphertext), then compresses.
//! Decode runs the inverse pipeline and rejects truncated or tampered
//! input at the authentication step. Each stage fails with its own error
//! variant so ingress can tell a bad peer from a bad key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// AES-256-GCM nonce size in bytes.
const NONCE_LEN: usize = 12;

/// Symmetric key length the configured secret is fitted to.
const KEY_LEN: usize = 32;

/// zstd compression level for envelopes.
const COMPRESSION_LEVEL: i32 = 3;

/// The four wire frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Request,
    Response,
    StreamConnect,
    Stream,
}

/// One decoded message envelope.
///
/// `payload` is itself MessagePack for the typed record selected by
/// `event`; the transports never look inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: FrameKind,
    pub shard_id: u64,
    pub event: String,
    pub payload: Vec<u8>,
    pub source_host: String,
    pub source_port: u16,
}

/// Codec failure kinds, one per pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),

    #[error("envelope deserialization failed: {0}")]
    Deserialize(#[from] rmp_serde::decode::Error),

    #[error("envelope compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("envelope authentication failed")]
    Authentication,

    #[error("envelope truncated: {0} bytes")]
    Truncated(usize),
}

/// Shared envelope codec, one per process.
///
/// The configured secret is padded with zero bytes (or truncated) to the
/// 32 bytes AES-256-GCM wants.
pub struct EnvelopeCodec {
    cipher: Aes256Gcm,
}

impl EnvelopeCodec {
    pub fn new(secret: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        let raw = secret.as_bytes();
        let take = raw.len().min(KEY_LEN);
        key[..take].copy_from_slice(&raw[..take]);

        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let serialized = rmp_serde::to_vec(envelope)?;

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, serialized.as_slice())
            .map_err(|_| CodecError::Authentication)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        let compressed = zstd::encode_all(sealed.as_slice(), COMPRESSION_LEVEL)?;
        Ok(compressed)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Envelope, CodecError> {
        let sealed = zstd::decode_all(data)?;

        if sealed.len() <= NONCE_LEN {
            return Err(CodecError::Truncated(sealed.len()));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        let serialized = self
            .cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| CodecError::Authentication)?;

        let envelope = rmp_serde::from_slice(&serialized)?;
        Ok(envelope)
    }
}

/// Serialize a typed payload record for an envelope.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Parse a typed payload record out of an envelope.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: Vec<u8>) -> Envelope {
        Envelope {
            kind: FrameKind::Request,
            shard_id: 7,
            event: "register_health_update".to_string(),
            payload,
            source_host: "127.0.0.1".to_string(),
            source_port: 7000,
        }
    }

    #[test]
    fn test_round_trip() {
        let codec = EnvelopeCodec::new("cluster-secret");

        for size in [0usize, 1, 1024, 65536] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let envelope = sample(payload);

            let encoded = codec.encode(&envelope).unwrap();
            let decoded = codec.decode(&encoded).unwrap();

            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn test_bit_flip_is_rejected() {
        let codec = EnvelopeCodec::new("cluster-secret");
        let encoded = codec.encode(&sample(vec![1, 2, 3, 4])).unwrap();

        // Bytes 4-5 are the zstd frame-header descriptor; some of those
        // bits (window size hints) can change without altering the
        // inflated stream, so the authentication tag cannot see them.
        for position in (0..encoded.len()).filter(|p| *p != 4 && *p != 5) {
            let mut tampered = encoded.clone();
            tampered[position] ^= 0x01;
            assert!(codec.decode(&tampered).is_err(), "flip at {position}");
        }
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let codec = EnvelopeCodec::new("cluster-secret");
        let other = EnvelopeCodec::new("different-secret");

        let encoded = codec.encode(&sample(vec![9, 9, 9])).unwrap();
        assert!(matches!(
            other.decode(&encoded),
            Err(CodecError::Authentication)
        ));
    }

    #[test]
    fn test_long_secret_is_truncated() {
        let long = "x".repeat(100);
        let codec = EnvelopeCodec::new(&long);
        let truncated = EnvelopeCodec::new(&long[..32]);

        let encoded = codec.encode(&sample(vec![5])).unwrap();
        assert!(truncated.decode(&encoded).is_ok());
    }
}
