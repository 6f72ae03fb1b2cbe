//! Real [`Preprocessor`](crate::command::Preprocessor) for URL-like argument
//! values (spec §4.1): `file:` fetches from the mesh, `http(s)://` downloads
//! into the files directory (cached by URL hash), `tar:` extracts once and
//! is replaced by the extracted top-level directory.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task;

use crate::command::Preprocessor;
use crate::distributor::Distributor;
use crate::error::{Error, Result};
use vmesh_files::{content_hash, FileStore};

/// Drives `file:`/`http(s)://`/`tar:` rewrites through a [`Distributor`] and
/// an HTTP client. One instance is shared across every compile call on a
/// host; `extracted` memoizes `tar:` extractions so a repeated reference to
/// the same archive doesn't re-extract it.
pub struct MeshPreprocessor {
    distributor: Arc<Distributor>,
    store: FileStore,
    http: reqwest::Client,
    extracted: Mutex<std::collections::HashSet<String>>,
}

impl MeshPreprocessor {
    pub fn new(distributor: Arc<Distributor>, store: FileStore) -> Self {
        Self { distributor, store, http: reqwest::Client::new(), extracted: Mutex::new(std::collections::HashSet::new()) }
    }

    async fn preprocess_file(&self, rel_path: &str) -> Result<String> {
        let path = self.distributor.fetch(rel_path).await?;
        Ok(path.display().to_string())
    }

    async fn preprocess_http(&self, url: &str) -> Result<String> {
        let rel_path = format!("downloads/{}", content_hash(url.as_bytes()));
        if !self.store.exists(&rel_path).await {
            let bytes = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| Error::Host(format!("download failed for {url}: {e}")))?
                .error_for_status()
                .map_err(|e| Error::Host(format!("download failed for {url}: {e}")))?
                .bytes()
                .await
                .map_err(|e| Error::Host(format!("download failed for {url}: {e}")))?;
            self.store.atomic_write(&rel_path, &bytes).await?;
        }
        Ok(self.store.local_path(&rel_path).display().to_string())
    }

    async fn preprocess_tar(&self, rel_path: &str) -> Result<String> {
        let local = self.distributor.fetch(rel_path).await?;
        let dest_name = format!("extracted/{}", content_hash(rel_path.as_bytes()));
        let dest = self.store.local_path(&dest_name);

        let mut guard = self.extracted.lock().await;
        if !guard.contains(&dest_name) {
            let dest_for_blocking = dest.clone();
            task::spawn_blocking(move || extract_tar(&local, &dest_for_blocking))
                .await
                .map_err(|e| Error::Host(format!("tar extraction task panicked: {e}")))??;
            guard.insert(dest_name);
        }
        Ok(dest.display().to_string())
    }
}

#[async_trait]
impl Preprocessor for MeshPreprocessor {
    async fn preprocess(&self, value: &str) -> Result<String> {
        if let Some(rel_path) = value.strip_prefix("file:") {
            self.preprocess_file(rel_path).await
        } else if value.starts_with("http://") || value.starts_with("https://") {
            self.preprocess_http(value).await
        } else if let Some(rel_path) = value.strip_prefix("tar:") {
            self.preprocess_tar(rel_path).await
        } else {
            Ok(value.to_string())
        }
    }
}

/// Extract `archive` (gzip-compressed if its name ends in `.tar.gz`/`.tgz`,
/// plain tar otherwise) into `dest`, which is created fresh.
fn extract_tar(archive: &std::path::Path, dest: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(archive)?;
    let is_gzip = archive
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".tar.gz") || n.ends_with(".tgz"))
        .unwrap_or(false);

    if is_gzip {
        let decoder = flate2::read::GzDecoder::new(file);
        unpack(decoder, dest)
    } else {
        unpack(file, dest)
    }
}

fn unpack<R: Read>(reader: R, dest: &std::path::Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.unpack(dest).map_err(|e| Error::Host(format!("tar unpack failed: {e}")))?;
    Ok(())
}
