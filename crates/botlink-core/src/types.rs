//! Core types for the botlink data model
//!
//! Newtypes for the device identity, the opaque session credential, conversation
//! references, outbound replies, and pairing artifacts.

use core::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

// ----------------------------------------------------------------------------
// Device Identity
// ----------------------------------------------------------------------------

/// Identifier assigned by the Transport once pairing completes
///
/// Absent (`None` at the use site) before the device has been paired. Never mutated
/// after assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Device Credential
// ----------------------------------------------------------------------------

/// Serialized session material required to reconnect without re-pairing
///
/// The runtime never inspects these bytes. `Debug` prints only the length and a short
/// fingerprint so credentials do not leak into logs.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredential(Vec<u8>);

impl DeviceCredential {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short tag for log lines: the first 4 bytes of the SHA-256 digest, hex-encoded
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0);
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("len", &self.0.len())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl Serialize for DeviceCredential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for DeviceCredential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Conversations and Replies
// ----------------------------------------------------------------------------

/// Recipient reference: a chat or conversation identifier understood by the Transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reply body submitted to the Transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ReplyPayload {
    /// Plain conversation text
    Text(String),
    /// Structured payload passed through to the Transport untouched
    Structured(serde_json::Value),
}

impl ReplyPayload {
    /// Text form used for console surfaces and logs
    pub fn preview(&self) -> String {
        match self {
            ReplyPayload::Text(text) => text.clone(),
            ReplyPayload::Structured(value) => value.to_string(),
        }
    }
}

/// A reply produced by a handler, addressed to one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub recipient: ChatId,
    pub payload: ReplyPayload,
}

impl OutboundReply {
    pub fn new(recipient: ChatId, payload: ReplyPayload) -> Self {
        Self { recipient, payload }
    }

    pub fn text(recipient: ChatId, text: impl Into<String>) -> Self {
        Self::new(recipient, ReplyPayload::Text(text.into()))
    }
}

// ----------------------------------------------------------------------------
// Pairing Artifact
// ----------------------------------------------------------------------------

/// A rotating pairing code issued by the Transport
///
/// `sequence` increases with every re-issue; an artifact with a lower sequence than one
/// already seen is stale and must not be rendered or acted upon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingArtifact {
    /// Content to present to the operator (rendered as text and QR code)
    pub code: String,
    /// Monotonic issue counter
    pub sequence: u64,
    /// Issue time in milliseconds since UNIX epoch
    pub issued_at_ms: u64,
    /// Validity window
    pub valid_for: Duration,
}

impl PairingArtifact {
    pub fn new(code: impl Into<String>, sequence: u64, valid_for: Duration) -> Self {
        Self {
            code: code.into(),
            sequence,
            issued_at_ms: now_millis(),
            valid_for,
        }
    }

    /// Whether `self` replaces `other` as the meaningful artifact
    pub fn supersedes(&self, other: &PairingArtifact) -> bool {
        self.sequence > other.sequence
    }

    /// Whether the validity window has passed at `now_ms`
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.issued_at_ms.saturating_add(self.valid_for.as_millis() as u64)
    }
}

/// Milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_does_not_leak_bytes() {
        let credential = DeviceCredential::new(b"super-secret-session-keys".to_vec());
        let rendered = format!("{:?}", credential);

        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("len: 25"));
        assert_eq!(credential.fingerprint().len(), 8);
    }

    #[test]
    fn test_fingerprint_is_sha256_prefix() {
        assert_eq!(DeviceCredential::new(b"abc".to_vec()).fingerprint(), "ba7816bf");
        assert_eq!(DeviceCredential::new(Vec::new()).fingerprint(), "e3b0c442");
    }

    #[test]
    fn test_credential_serializes_as_base64() {
        let credential = DeviceCredential::new(vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&credential).unwrap();
        assert_eq!(json, "\"3q2+7w==\"");

        let decoded: DeviceCredential = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, credential);
    }

    #[test]
    fn test_artifact_supersession_and_expiry() {
        let first = PairingArtifact::new("AAAA", 1, Duration::from_secs(20));
        let second = PairingArtifact::new("BBBB", 2, Duration::from_secs(20));

        assert!(second.supersedes(&first));
        assert!(!first.supersedes(&second));
        assert!(!first.supersedes(&first));

        assert!(!first.is_expired_at(first.issued_at_ms + 19_999));
        assert!(first.is_expired_at(first.issued_at_ms + 20_000));
    }

    #[test]
    fn test_text_reply() {
        let reply = OutboundReply::text(ChatId::new("C"), "Received: hello");
        assert_eq!(reply.recipient.as_str(), "C");
        assert_eq!(reply.payload, ReplyPayload::Text("Received: hello".to_string()));
        assert_eq!(reply.payload.preview(), "Received: hello");
    }
}
