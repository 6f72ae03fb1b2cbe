//! Local file store rooted at `<base>/files` (spec §6 persisted state layout).

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// The shared-mutable files directory. Writes use atomic rename through a
/// temporary name (spec §5: "Shared resources").
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_path(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    pub async fn exists(&self, rel_path: &str) -> bool {
        fs::metadata(self.local_path(rel_path)).await.is_ok()
    }

    /// Write `data` to `rel_path` atomically: write to a sibling temp file,
    /// then rename over the destination.
    pub async fn atomic_write(&self, rel_path: &str, data: &[u8]) -> Result<PathBuf> {
        let dest = self.local_path(rel_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = dest.with_extension(format!(
            "tmp.{}",
            std::process::id()
        ));
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(data).await?;
        f.flush().await?;
        drop(f);
        fs::rename(&tmp, &dest).await?;
        Ok(dest)
    }

    /// Concatenate numbered part files `0..num_parts` from `parts_dir` into
    /// `rel_path`, then atomically publish the result (spec §4.7 step 2:
    /// "parts are written to a temporary directory and concatenated on
    /// completion").
    pub async fn concat_parts(&self, rel_path: &str, parts_dir: &Path, num_parts: u64) -> Result<PathBuf> {
        let mut buf = Vec::new();
        for i in 0..num_parts {
            let part_path = parts_dir.join(i.to_string());
            let mut chunk = fs::read(&part_path).await?;
            buf.append(&mut chunk);
        }
        self.atomic_write(rel_path, &buf).await
    }

    pub async fn read(&self, rel_path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.local_path(rel_path)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_then_read_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        store.atomic_write("a/b.img", b"payload").await.unwrap();
        assert!(store.exists("a/b.img").await);
        assert_eq!(store.read("a/b.img").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn concat_parts_rebuilds_original() {
        let tmp = tempfile::tempdir().unwrap();
        let parts_dir = tmp.path().join("parts");
        fs::create_dir_all(&parts_dir).await.unwrap();
        fs::write(parts_dir.join("0"), b"hel").await.unwrap();
        fs::write(parts_dir.join("1"), b"lo").await.unwrap();

        let store = FileStore::new(tmp.path().join("files"));
        store.concat_parts("greeting.txt", &parts_dir, 2).await.unwrap();
        assert_eq!(store.read("greeting.txt").await.unwrap(), b"hello");
    }
}
