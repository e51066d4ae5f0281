//! Filesystem blob store
//!
//! Objects are kept in a two-level directory structure keyed by the first
//! characters of their name, which keeps directories small when millions of
//! artifacts are cached.
//!
//! ```text
//! {root}/
//!   3f/
//!     2a/
//!       3f2a6c1e-9b0d-4e55-8c21-77aa0b3d9e10
//! ```

use super::{BlobInfo, BlobPage, BlobStore};
use artcache_core::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use walkdir::WalkDir;

const TMP_PREFIX: &str = ".tmp-";

/// Blob store rooted at a local directory
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsBlobStore {
    /// Create a store rooted at `root`; directories are created on first write
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of object `name`: `{root}/{name[0:2]}/{name[2:4]}/{name}`
    fn blob_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\']);
        if !valid {
            return Err(Error::invalid_key(name));
        }

        let mut shard: Vec<char> = name.chars().take(4).collect();
        shard.resize(4, '_');
        let first: String = shard[..2].iter().collect();
        let second: String = shard[2..].iter().collect();
        Ok(self.root.join(first).join(second).join(name))
    }

    fn tmp_path(&self, path: &Path) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let file = format!("{TMP_PREFIX}{}-{n}", std::process::id());
        path.with_file_name(file)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, name: &str, content: Bytes) -> Result<()> {
        let path = self.blob_path(name)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }

        // Write atomically using a temporary file
        let tmp_path = self.tmp_path(&path);
        tokio::fs::write(&tmp_path, &content)
            .await
            .map_err(|e| Error::io(e, &tmp_path, "write"))?;

        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::io(e, &path, "rename"));
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        let path = self.blob_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(name)),
            Err(e) => Err(Error::io(e, &path, "read")),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.blob_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(e, &path, "remove_file")),
        }
    }

    async fn list_page(&self, continuation: Option<&str>, page_size: usize) -> Result<BlobPage> {
        let root = self.root.clone();
        let after = continuation.map(str::to_owned);
        let page_size = page_size.max(1);

        tokio::task::spawn_blocking(move || list_sorted(&root, after.as_deref(), page_size))
            .await
            .map_err(|e| Error::backend("list", e))?
    }
}

/// Walk the tree and return the page of names sorting after `after`
fn list_sorted(root: &Path, after: Option<&str>, page_size: usize) -> Result<BlobPage> {
    if !root.exists() {
        return Ok(BlobPage::default());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(3).max_depth(3) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf);
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
            match path {
                Some(path) => Error::io(source, path, "read_dir"),
                None => Error::io_no_path(source, "read_dir"),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.starts_with(TMP_PREFIX) || after.is_some_and(|after| name <= after) {
            continue;
        }
        let metadata = entry.metadata().ok();
        entries.push(BlobInfo {
            name: name.to_owned(),
            last_modified: metadata
                .as_ref()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
            size: metadata.as_ref().map(std::fs::Metadata::len),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let continuation = (entries.len() > page_size).then(|| entries[page_size - 1].name.clone());
    entries.truncate(page_size);

    Ok(BlobPage {
        items: entries,
        continuation,
    })
}
