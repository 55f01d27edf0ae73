use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub const CHUNK_PREFIX: &str = "chunk_";
pub const CHUNK_SUFFIX: &str = ".webm";
pub const MANIFEST_NAME: &str = "file_list.txt";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session id is not usable as a staging directory name")]
    InvalidSessionId,
    #[error("could not prepare staging area: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("could not write fragment: {0}")]
    WriteChunk(#[source] std::io::Error),
}

/// Per-session staging area for uploaded media fragments.
///
/// Fragments land as `<staging>/<session>/chunk_NNNNN.webm`. The zero-padded
/// index keeps lexical and numeric order identical, which is what the
/// assembly manifest relies on.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    staging_dir: PathBuf,
}

impl ChunkStore {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.staging_dir.join(session_id)
    }

    pub fn chunk_file_name(index: u64) -> String {
        format!("{}{:05}{}", CHUNK_PREFIX, index, CHUNK_SUFFIX)
    }

    pub fn chunk_path(&self, session_id: &str, index: u64) -> PathBuf {
        self.session_dir(session_id).join(Self::chunk_file_name(index))
    }

    /// Store one fragment. Overwriting an existing index is fine; uploads
    /// retry and the last write wins.
    pub async fn write_chunk(
        &self,
        session_id: &str,
        index: u64,
        bytes: &[u8],
    ) -> Result<PathBuf, StorageError> {
        if !valid_session_id(session_id) {
            return Err(StorageError::InvalidSessionId);
        }

        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(StorageError::CreateDir)?;

        let path = dir.join(Self::chunk_file_name(index));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(StorageError::WriteChunk)?;

        debug!(session_id, index, bytes = bytes.len(), "fragment staged");
        Ok(path)
    }

    /// Fragments currently staged for a session, ascending by index.
    /// A missing staging directory reads as "no fragments", not an error.
    pub async fn list_fragments(
        &self,
        session_id: &str,
    ) -> Result<Vec<(u64, PathBuf)>, std::io::Error> {
        let dir = self.session_dir(session_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut fragments = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = parse_chunk_index(name) {
                fragments.push((index, entry.path()));
            }
        }

        fragments.sort_by_key(|(index, _)| *index);
        Ok(fragments)
    }
}

fn valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_chunk_index(file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(CHUNK_PREFIX)?;
    let digits = rest.strip_suffix(CHUNK_SUFFIX)?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_names_sort_in_index_order() {
        assert_eq!(ChunkStore::chunk_file_name(0), "chunk_00000.webm");
        assert_eq!(ChunkStore::chunk_file_name(12), "chunk_00012.webm");
        assert!(ChunkStore::chunk_file_name(2) < ChunkStore::chunk_file_name(10));
    }

    #[test]
    fn parses_only_chunk_files() {
        assert_eq!(parse_chunk_index("chunk_00003.webm"), Some(3));
        assert_eq!(parse_chunk_index("file_list.txt"), None);
        assert_eq!(parse_chunk_index("chunk_xx.webm"), None);
        assert_eq!(parse_chunk_index("repaired_chunk_00003.webm"), None);
    }

    #[test]
    fn session_ids_are_restricted_to_safe_names() {
        assert!(valid_session_id("4f7c0d1e-aa"));
        assert!(!valid_session_id("../escape"));
        assert!(!valid_session_id(""));
    }

    #[tokio::test]
    async fn write_then_list_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::new(dir.path());

        store.write_chunk("s1", 1, b"one").await.expect("write");
        store.write_chunk("s1", 0, b"zero").await.expect("write");
        // Overwrite is retry-safe.
        store.write_chunk("s1", 1, b"ONE").await.expect("write");

        let fragments = store.list_fragments("s1").await.expect("list");
        let indices: Vec<u64> = fragments.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1]);

        let bytes = tokio::fs::read(&fragments[1].1).await.expect("read");
        assert_eq!(bytes, b"ONE");
    }

    #[tokio::test]
    async fn listing_an_unknown_session_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkStore::new(dir.path());
        assert!(store.list_fragments("nope").await.expect("list").is_empty());
    }
}
