//! Local filesystem primitives shared by every stage that touches disk.
//!
//! Paths are made absolute before use. Removal is idempotent: removing
//! something that is already gone reports `false` instead of failing.

mod error;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

pub use error::StoreError;

/// SHA-256 digest. Serialized as an array of 32 integers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn from_hasher(hasher: Sha256) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathKind {
    File,
    Dir,
    Missing,
}

pub fn absolute(path: &Path) -> Result<PathBuf, StoreError> {
    std::path::absolute(path).map_err(|e| StoreError::io("resolve", path, e))
}

/// Classify what is at `path` without following a final symlink.
pub async fn exists(path: &Path) -> Result<PathKind, StoreError> {
    let path = absolute(path)?;
    match fs::symlink_metadata(&path).await {
        Ok(meta) if meta.is_dir() => Ok(PathKind::Dir),
        Ok(_) => Ok(PathKind::File),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(PathKind::Missing),
        Err(e) => Err(StoreError::io("stat", &path, e)),
    }
}

/// Create `path` and its parents. Succeeds if the directory already exists.
pub async fn ensure_dir(path: &Path) -> Result<PathBuf, StoreError> {
    let path = absolute(path)?;
    match exists(&path).await? {
        PathKind::Dir => Ok(path),
        PathKind::File => Err(StoreError::NotADirectory(path.display().to_string())),
        PathKind::Missing => {
            fs::create_dir_all(&path)
                .await
                .map_err(|e| StoreError::io("create directory", &path, e))?;
            Ok(path)
        }
    }
}

/// Sibling temp path used while a file is being written.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Write `bytes` to a sibling `.part` file, then rename it over `path`.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let path = absolute(path)?;
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    let part = part_path(&path);
    fs::write(&part, bytes)
        .await
        .map_err(|e| StoreError::io("write", &part, e))?;
    if let Err(e) = fs::rename(&part, &path).await {
        let _ = fs::remove_file(&part).await;
        return Err(StoreError::io("rename", &part, e));
    }
    Ok(())
}

/// Remove a file or directory tree. Returns `false` if nothing was there.
pub async fn remove(path: &Path) -> Result<bool, StoreError> {
    let path = absolute(path)?;
    let result = match exists(&path).await? {
        PathKind::Missing => return Ok(false),
        PathKind::Dir => fs::remove_dir_all(&path).await,
        PathKind::File => fs::remove_file(&path).await,
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io("remove", &path, e)),
    }
}

/// Move `src` to `dst`, creating `dst`'s parent. Files that cannot be
/// renamed (e.g. across filesystems) are copied and then removed.
pub async fn move_path(src: &Path, dst: &Path) -> Result<(), StoreError> {
    let src = absolute(src)?;
    let dst = absolute(dst)?;
    if let Some(parent) = dst.parent() {
        ensure_dir(parent).await?;
    }
    let rename_err = match fs::rename(&src, &dst).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if exists(&src).await? != PathKind::File {
        return Err(StoreError::io("move", &src, rename_err));
    }
    tracing::debug!(
        "Rename {} failed ({}), falling back to copy",
        src.display(),
        rename_err
    );
    fs::copy(&src, &dst)
        .await
        .map_err(|e| StoreError::io("copy", &src, e))?;
    fs::remove_file(&src)
        .await
        .map_err(|e| StoreError::io("remove", &src, e))
}

/// Names and kinds of the entries of a directory, sorted by name. A
/// missing directory lists as empty.
pub async fn list_dir(path: &Path) -> Result<Vec<(String, PathKind)>, StoreError> {
    let path = absolute(path)?;
    let mut dir = match fs::read_dir(&path).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io("list", &path, e)),
    };
    let mut entries = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| StoreError::io("list", &path, e))?
    {
        let kind = match entry.file_type().await {
            Ok(t) if t.is_dir() => PathKind::Dir,
            Ok(_) => PathKind::File,
            Err(_) => continue,
        };
        entries.push((entry.file_name().to_string_lossy().into_owned(), kind));
    }
    entries.sort();
    Ok(entries)
}

/// Remove `path` only if it is an empty directory.
pub async fn remove_empty_dir(path: &Path) -> Result<bool, StoreError> {
    if exists(path).await? != PathKind::Dir || !list_dir(path).await?.is_empty() {
        return Ok(false);
    }
    let path = absolute(path)?;
    match fs::remove_dir(&path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io("remove", &path, e)),
    }
}

#[cfg(test)]
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentHash::from_hasher(hasher)
}

/// Hash a file's content without loading it into memory.
pub async fn file_hash(path: &Path) -> Result<ContentHash, StoreError> {
    let path = absolute(path)?;
    tokio::task::spawn_blocking(move || {
        let mut file =
            std::fs::File::open(&path).map_err(|e| StoreError::io("open", &path, e))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| StoreError::io("read", &path, e))?;
        Ok(ContentHash::from_hasher(hasher))
    })
    .await?
}

/// `false` when the file is missing or its content differs from `expected`.
pub async fn verify_hash(path: &Path, expected: &ContentHash) -> Result<bool, StoreError> {
    if exists(path).await? != PathKind::File {
        return Ok(false);
    }
    Ok(file_hash(path).await? == *expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_serializes_as_int_array() {
        let h = hash_bytes(b"abc");
        let v = serde_json::to_value(h).unwrap();
        let arr = v.as_array().unwrap();
        assert_eq!(arr.len(), 32);
        assert_eq!(arr[0], 0xba);
        let back: ContentHash = serde_json::from_value(v).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_hash_display_is_hex() {
        assert_eq!(
            hash_bytes(b"abc").to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/a/b/101_cat.jpg")),
            PathBuf::from("/a/b/101_cat.jpg.part")
        );
    }

    #[tokio::test]
    async fn test_exists_kinds() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(exists(dir.path()).await.unwrap(), PathKind::Dir);
        assert_eq!(exists(&file).await.unwrap(), PathKind::File);
        assert_eq!(
            exists(&dir.path().join("nope")).await.unwrap(),
            PathKind::Missing
        );
    }

    #[tokio::test]
    async fn test_ensure_dir_idempotent() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_dir(&nested).await.unwrap();
        ensure_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_ensure_dir_rejects_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            ensure_dir(&file).await.unwrap_err(),
            StoreError::NotADirectory(_)
        ));
    }

    #[tokio::test]
    async fn test_write_atomically_leaves_no_part() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("x/y.json");
        write_atomically(&target, b"{}").await.unwrap();
        write_atomically(&target, b"[1]").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"[1]");
        assert!(!part_path(&target).exists());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("t");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("sub/f"), b"x").unwrap();
        assert!(remove(&tree).await.unwrap());
        assert!(!remove(&tree).await.unwrap());
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn test_move_creates_parent() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.jpg");
        let dst = dir.path().join("deleted/x/a.jpg");
        std::fs::write(&src, b"img").unwrap();
        move_path(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"img");
    }

    #[tokio::test]
    async fn test_move_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        assert!(move_path(&dir.path().join("no"), &dir.path().join("dst"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_dir_sorted_and_missing_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();
        assert_eq!(
            list_dir(dir.path()).await.unwrap(),
            vec![
                ("a.json".to_string(), PathKind::File),
                ("b".to_string(), PathKind::Dir)
            ]
        );
        assert!(list_dir(&dir.path().join("none")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_empty_dir_only() {
        let dir = TempDir::new().unwrap();
        let full = dir.path().join("full");
        std::fs::create_dir(&full).unwrap();
        std::fs::write(full.join("f"), b"x").unwrap();
        let empty = dir.path().join("empty");
        std::fs::create_dir(&empty).unwrap();
        assert!(!remove_empty_dir(&full).await.unwrap());
        assert!(remove_empty_dir(&empty).await.unwrap());
        assert!(!empty.exists());
        assert!(full.exists());
    }

    #[tokio::test]
    async fn test_file_hash_and_verify() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("f");
        std::fs::write(&f, b"abc").unwrap();
        let expected = hash_bytes(b"abc");
        assert_eq!(file_hash(&f).await.unwrap(), expected);
        assert!(verify_hash(&f, &expected).await.unwrap());
        assert!(!verify_hash(&f, &hash_bytes(b"abd")).await.unwrap());
        assert!(!verify_hash(&dir.path().join("gone"), &expected)
            .await
            .unwrap());
    }
}
