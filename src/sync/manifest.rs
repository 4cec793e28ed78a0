//! Per-field attachment manifest: the durable record that proves which
//! attachment a local file came from and what its content hash was.

use std::io::ErrorKind;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::error::SyncError;
use crate::store::{self, ContentHash, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentManifest {
    pub image_name: String,
    pub original_name: String,
    pub attachment_id: i64,
    pub download_timestamp: String,
    pub hash: ContentHash,
}

impl AttachmentManifest {
    pub fn new(image_name: String, original_name: String, attachment_id: i64, hash: ContentHash) -> Self {
        Self {
            image_name,
            original_name,
            attachment_id,
            download_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            hash,
        }
    }

    /// Whether this manifest describes the given target. Content is checked
    /// separately against `hash`.
    pub fn describes(&self, image_name: &str, attachment_id: i64) -> bool {
        self.image_name == image_name && self.attachment_id == attachment_id
    }
}

/// `Ok(None)` when no manifest exists.
pub async fn read(path: &Path) -> Result<Option<AttachmentManifest>, SyncError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io("read", path, e).into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| SyncError::CorruptManifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

pub async fn write(path: &Path, manifest: &AttachmentManifest) -> Result<(), SyncError> {
    let bytes = serde_json::to_vec_pretty(manifest).map_err(|e| SyncError::CorruptManifest {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    store::write_atomically(path, &bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::hash_bytes;
    use tempfile::TempDir;

    fn sample() -> AttachmentManifest {
        AttachmentManifest::new("101_cat.jpg".into(), "cat.jpg".into(), 7, hash_bytes(b"meow"))
    }

    #[test]
    fn test_json_shape() {
        let v = serde_json::to_value(sample()).unwrap();
        assert_eq!(v["imageName"], "101_cat.jpg");
        assert_eq!(v["originalName"], "cat.jpg");
        assert_eq!(v["attachmentId"], 7);
        assert_eq!(v["hash"].as_array().unwrap().len(), 32);
        assert!(v["downloadTimestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_describes() {
        let m = sample();
        assert!(m.describes("101_cat.jpg", 7));
        assert!(!m.describes("101_cat.jpg", 8));
        assert!(!m.describes("101_dog.jpg", 7));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aA1/101/photo.json");
        write(&path, &sample()).await.unwrap();
        let back = read(&path).await.unwrap().unwrap();
        assert_eq!(back.attachment_id, 7);
        assert_eq!(back.hash, hash_bytes(b"meow"));
    }

    #[tokio::test]
    async fn test_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read(&dir.path().join("x.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.json");
        std::fs::write(&path, b"{\"imageName\": 3").unwrap();
        assert!(matches!(
            read(&path).await.unwrap_err(),
            SyncError::CorruptManifest { .. }
        ));
    }
}
