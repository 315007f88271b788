//! Completed media artifacts and their metadata.

use bytes::Bytes;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata travelling with an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMeta {
    /// Unique per artifact, stable across retries. At least 8 characters
    /// of high entropy - the wire format identifies chunks by the first
    /// 8 bytes of this string, so short or low-entropy ids collide.
    pub id: String,
    pub mime_type: String,
    pub sender: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub caption: Option<String>,
    /// Total payload length in bytes.
    pub size: u64,
}

/// A completed binary media object plus its metadata. Owned by the
/// application layer after hand-off; the protocol layer never retains it.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub meta: ArtifactMeta,
    pub bytes: Bytes,
}

impl Artifact {
    /// Build an artifact from raw bytes, generating a fresh id and
    /// timestamp.
    pub fn new(bytes: Bytes, mime_type: &str, sender: &str, caption: Option<String>) -> Self {
        let size = bytes.len() as u64;
        Self {
            meta: ArtifactMeta {
                id: generate_artifact_id(),
                mime_type: mime_type.to_string(),
                sender: sender.to_string(),
                timestamp: unix_timestamp_ms(),
                caption,
                size,
            },
            bytes,
        }
    }
}

/// Generate a 16-hex-character artifact id.
///
/// 64 bits of entropy; the first 8 characters alone carry 32 bits, which
/// keeps the truncated wire id collision-free for realistic session sizes.
pub fn generate_artifact_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.gen::<u64>())
}

/// Current time in milliseconds since the Unix epoch.
pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_id_length_and_charset() {
        let id = generate_artifact_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_artifact_records_size() {
        let artifact = Artifact::new(Bytes::from_static(b"abc"), "image/png", "alice", None);
        assert_eq!(artifact.meta.size, 3);
        assert_eq!(artifact.meta.mime_type, "image/png");
    }
}
