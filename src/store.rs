//! Persistence and captioning collaborators.
//!
//! The session core hands completed artifacts off and never touches
//! disk or any inference service itself; applications plug in whatever
//! backend they have through these traits. The filesystem store here is
//! the default used by the CLI.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::artifact::{Artifact, ArtifactMeta};

/// Durable storage for received artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist one artifact. Called once per completed transfer.
    async fn save(&self, artifact: &Artifact) -> anyhow::Result<()>;

    /// Load every previously saved artifact, oldest first.
    async fn load_all(&self) -> anyhow::Result<Vec<Artifact>>;
}

/// Produces a caption for a freshly captured artifact. Implementations
/// are expected to be best-effort; on failure return a fixed fallback
/// rather than an error.
#[async_trait]
pub trait Captioner: Send + Sync {
    async fn caption(&self, bytes: &Bytes, mime_type: &str) -> String;
}

/// Captioner used when no inference backend is configured.
pub struct StaticCaptioner;

#[async_trait]
impl Captioner for StaticCaptioner {
    async fn caption(&self, _bytes: &Bytes, _mime_type: &str) -> String {
        "Captured moment".to_string()
    }
}

/// Sidecar record written next to each artifact's payload file.
#[derive(Debug, Serialize, Deserialize)]
struct SidecarRecord {
    id: String,
    mime_type: String,
    sender: String,
    timestamp: u64,
    caption: Option<String>,
    size: u64,
}

impl From<&ArtifactMeta> for SidecarRecord {
    fn from(meta: &ArtifactMeta) -> Self {
        Self {
            id: meta.id.clone(),
            mime_type: meta.mime_type.clone(),
            sender: meta.sender.clone(),
            timestamp: meta.timestamp,
            caption: meta.caption.clone(),
            size: meta.size,
        }
    }
}

impl From<SidecarRecord> for ArtifactMeta {
    fn from(record: SidecarRecord) -> Self {
        Self {
            id: record.id,
            mime_type: record.mime_type,
            sender: record.sender,
            timestamp: record.timestamp,
            caption: record.caption,
            size: record.size,
        }
    }
}

/// Stores each artifact as `<id>.<ext>` plus a `<id>.json` metadata
/// sidecar in a flat directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn payload_path(&self, meta: &ArtifactMeta) -> PathBuf {
        self.root
            .join(format!("{}.{}", meta.id, extension_for_mime(&meta.mime_type)))
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn save(&self, artifact: &Artifact) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .context("Failed to create artifact directory")?;

        let payload_path = self.payload_path(&artifact.meta);
        let mut file = tokio::fs::File::create(&payload_path)
            .await
            .with_context(|| format!("Failed to create {}", payload_path.display()))?;
        file.write_all(&artifact.bytes)
            .await
            .context("Failed to write artifact payload")?;
        file.flush().await.context("Failed to flush artifact payload")?;

        let record = SidecarRecord::from(&artifact.meta);
        let json = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(self.sidecar_path(&artifact.meta.id), json)
            .await
            .context("Failed to write artifact metadata")?;

        log::info!(
            "saved artifact {} ({} bytes) to {}",
            artifact.meta.id,
            artifact.meta.size,
            payload_path.display()
        );
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            // a store that was never written to is just empty
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(artifacts),
            Err(e) => return Err(e).context("Failed to read artifact directory"),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_one(&path).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => log::warn!("skipping unreadable artifact {}: {e:#}", path.display()),
            }
        }

        artifacts.sort_by_key(|a| a.meta.timestamp);
        Ok(artifacts)
    }
}

async fn load_one(sidecar_path: &Path) -> anyhow::Result<Artifact> {
    let json = tokio::fs::read(sidecar_path)
        .await
        .context("Failed to read metadata sidecar")?;
    let record: SidecarRecord = serde_json::from_slice(&json)?;
    let meta = ArtifactMeta::from(record);

    let payload_path = sidecar_path.with_extension(extension_for_mime(&meta.mime_type));
    let bytes = tokio::fs::read(&payload_path)
        .await
        .with_context(|| format!("Failed to read payload {}", payload_path.display()))?;
    Ok(Artifact {
        meta,
        bytes: Bytes::from(bytes),
    })
}

/// File extension for the media types the transfer protocol carries.
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        _ => "bin",
    }
}

/// Guess a media type from a file path, for the sending side.
pub fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> FsArtifactStore {
        let dir = std::env::temp_dir().join(format!(
            "snaplink-store-test-{}",
            crate::artifact::generate_artifact_id()
        ));
        FsArtifactStore::new(dir)
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = temp_store();
        let artifact = Artifact::new(
            Bytes::from_static(b"fake png bytes"),
            "image/png",
            "alice",
            Some("sunset".to_string()),
        );

        store.save(&artifact).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].meta.id, artifact.meta.id);
        assert_eq!(loaded[0].meta.caption.as_deref(), Some("sunset"));
        assert_eq!(loaded[0].bytes, artifact.bytes);

        tokio::fs::remove_dir_all(&store.root).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_all_on_missing_directory_is_empty() {
        let store = temp_store();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_extension_mapping() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("video/mp4"), "mp4");
        assert_eq!(extension_for_mime("application/x-unknown"), "bin");
    }

    #[test]
    fn test_mime_for_path() {
        assert_eq!(mime_for_path(Path::new("a/b/photo.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("clip.webm")), "video/webm");
        assert_eq!(mime_for_path(Path::new("noext")), "application/octet-stream");
    }
}
