//! Generated source trees and their tar.zst transport form.
//!
//! The code generator ships its output as a zstd-compressed tar archive.
//! Commits need the individual files, so archives are unpacked into an
//! in-memory [`SourceTree`] keyed by relative path.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::error::{FactoryError, FactoryResult};

const COMPRESSION_LEVEL: i32 = 3;

/// Text files keyed by path relative to the repository root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceTree {
    files: BTreeMap<String, String>,
}

impl SourceTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tree holding a single file.
    #[must_use]
    pub fn single(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new().with_file(path, content)
    }

    /// Add or replace a file.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    /// Add or replace a file.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    /// Content of `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Files in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the tree has no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Unpack a tar.zst archive.
    pub async fn from_archive(data: Bytes) -> FactoryResult<Self> {
        spawn_blocking(move || unpack_sync(&data))
            .await
            .map_err(|e| FactoryError::internal(format!("archive task failed: {e}")))?
    }

    /// Pack into a tar.zst archive.
    pub async fn to_archive(&self) -> FactoryResult<Bytes> {
        let tree = self.clone();
        spawn_blocking(move || pack_sync(&tree))
            .await
            .map_err(|e| FactoryError::internal(format!("archive task failed: {e}")))?
    }
}

fn archive_error(e: std::io::Error) -> FactoryError {
    FactoryError::Archive(e.to_string())
}

fn pack_sync(tree: &SourceTree) -> FactoryResult<Bytes> {
    let mut tar_data = Vec::new();

    {
        let mut builder = tar::Builder::new(&mut tar_data);
        for (path, content) in tree.files() {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .map_err(archive_error)?;
        }
        builder.finish().map_err(archive_error)?;
    }

    let compressed =
        zstd::encode_all(Cursor::new(&tar_data), COMPRESSION_LEVEL).map_err(archive_error)?;

    debug!(
        files = tree.len(),
        uncompressed_size = tar_data.len(),
        compressed_size = compressed.len(),
        "packed source tree"
    );

    Ok(Bytes::from(compressed))
}

fn unpack_sync(data: &[u8]) -> FactoryResult<SourceTree> {
    let decompressed = zstd::decode_all(Cursor::new(data)).map_err(archive_error)?;
    let mut archive = tar::Archive::new(Cursor::new(decompressed));
    let mut tree = SourceTree::new();

    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry
            .path()
            .map_err(archive_error)?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_owned();
        if path.split('/').any(|segment| segment == "..") {
            return Err(FactoryError::Archive(format!(
                "entry '{path}' escapes the repository root"
            )));
        }

        let mut content = String::new();
        entry.read_to_string(&mut content).map_err(|e| {
            FactoryError::Archive(format!("entry '{path}' is not UTF-8 text: {e}"))
        })?;
        tree.insert(path, content);
    }

    debug!(
        compressed_size = data.len(),
        files = tree.len(),
        "unpacked source tree"
    );

    Ok(tree)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nested_paths_survive_packing() {
        let tree = SourceTree::new()
            .with_file("pom.xml", "<project/>")
            .with_file("src/main/java/Orders.java", "class Orders {}");

        let packed = tree.to_archive().await.unwrap();
        let unpacked = SourceTree::from_archive(packed).await.unwrap();

        assert_eq!(unpacked.len(), 2);
        assert_eq!(
            unpacked.get("src/main/java/Orders.java"),
            Some("class Orders {}")
        );
    }

    #[tokio::test]
    async fn garbage_is_an_archive_error() {
        let err = SourceTree::from_archive(Bytes::from_static(b"not zstd"))
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::Archive(_)));
    }

    #[tokio::test]
    async fn empty_tree_packs() {
        let packed = SourceTree::new().to_archive().await.unwrap();
        assert!(SourceTree::from_archive(packed).await.unwrap().is_empty());
    }
}
