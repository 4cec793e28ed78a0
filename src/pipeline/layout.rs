//! Directory tree under the output root:
//!
//! ```text
//! <output>/
//!   .attachments_map/<assetUid>/<submissionId>/<field>.json
//!   images/<assetUid>/<assetName>/<submissionId>_<originalName>
//!   runs/run_<timestamp>/steps/step<N>.json
//!   runs/run_<timestamp>/images_deleted/<assetUid>/<assetName>/...
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::error::PipelineError;
use crate::store::{self, StoreError};
use crate::sync::SyncDirs;

const MANIFESTS_DIR: &str = ".attachments_map";
const IMAGES_DIR: &str = "images";
const RUNS_DIR: &str = "runs";
const STEPS_DIR: &str = "steps";
const DELETED_DIR: &str = "images_deleted";

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    run_dir: PathBuf,
}

impl OutputLayout {
    /// Create the output root (if needed) and a fresh run directory named
    /// after the current local time.
    pub async fn create(root: &Path) -> Result<Self, StoreError> {
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        Self::create_with_stamp(root, &stamp).await
    }

    /// `run_<stamp>`, or `run_<stamp>-<n>` when that name is taken.
    pub async fn create_with_stamp(root: &Path, stamp: &str) -> Result<Self, StoreError> {
        let root = store::ensure_dir(root).await?;
        let runs = store::ensure_dir(&root.join(RUNS_DIR)).await?;

        let mut suffix = 0u32;
        let run_dir = loop {
            let name = match suffix {
                0 => format!("run_{stamp}"),
                n => format!("run_{stamp}-{n}"),
            };
            let candidate = runs.join(name);
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(StoreError::io("create directory", &candidate, e)),
            }
        };
        store::ensure_dir(&run_dir.join(STEPS_DIR)).await?;

        Ok(Self { root, run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn step_path(&self, step: u8) -> PathBuf {
        self.run_dir.join(STEPS_DIR).join(format!("step{step}.json"))
    }

    pub fn sync_dirs(&self) -> SyncDirs {
        SyncDirs {
            manifests: self.root.join(MANIFESTS_DIR),
            images: self.root.join(IMAGES_DIR),
            deleted: self.run_dir.join(DELETED_DIR),
        }
    }

    /// Persist the raw result of a stage as pretty JSON.
    pub async fn write_snapshot<T: Serialize>(
        &self,
        step: u8,
        value: &T,
    ) -> Result<PathBuf, PipelineError> {
        let path = self.step_path(step);
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| PipelineError::Snapshot {
            path: path.display().to_string(),
            source: e,
        })?;
        store::write_atomically(&path, &bytes).await?;
        tracing::debug!("Wrote {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_creates_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("output");
        let layout = OutputLayout::create_with_stamp(&root, "2024-05-01_10-00-00")
            .await
            .unwrap();
        assert!(root.join("runs/run_2024-05-01_10-00-00/steps").is_dir());
        assert_eq!(
            layout.step_path(3),
            layout.run_dir().join("steps/step3.json")
        );
        let dirs = layout.sync_dirs();
        assert!(dirs.manifests.ends_with(".attachments_map"));
        assert!(dirs.images.ends_with("images"));
        assert!(dirs
            .deleted
            .ends_with("runs/run_2024-05-01_10-00-00/images_deleted"));
    }

    #[tokio::test]
    async fn test_run_dir_suffix_on_collision() {
        let dir = TempDir::new().unwrap();
        let a = OutputLayout::create_with_stamp(dir.path(), "t").await.unwrap();
        let b = OutputLayout::create_with_stamp(dir.path(), "t").await.unwrap();
        let c = OutputLayout::create_with_stamp(dir.path(), "t").await.unwrap();
        assert!(a.run_dir().ends_with("run_t"));
        assert!(b.run_dir().ends_with("run_t-1"));
        assert!(c.run_dir().ends_with("run_t-2"));
    }

    #[tokio::test]
    async fn test_write_snapshot() {
        let dir = TempDir::new().unwrap();
        let layout = OutputLayout::create_with_stamp(dir.path(), "t").await.unwrap();
        let path = layout
            .write_snapshot(1, &serde_json::json!([{"uid": "aA1"}]))
            .await
            .unwrap();
        let back: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(back[0]["uid"], "aA1");
    }
}
