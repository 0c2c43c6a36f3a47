//! Flat-file knowledge store.
//!
//! Holds a single UTF-8 text blob of at most `max_chars` characters. Saves
//! replace the whole file through a temp file in the same directory plus a
//! rename, so concurrent readers see either the old or the new blob.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::KnowledgeConfig;

#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    path: PathBuf,
    max_chars: usize,
}

impl KnowledgeStore {
    pub fn new(path: impl Into<PathBuf>, max_chars: usize) -> Self {
        Self {
            path: path.into(),
            max_chars,
        }
    }

    pub fn from_config(config: &KnowledgeConfig) -> Self {
        Self::new(config.path.clone(), config.max_chars)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Reads the blob. A missing file is the empty blob.
    pub fn load(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read knowledge file: {}", self.path.display())),
        }
    }

    /// Overwrites the blob with `text`, truncated to `max_chars`.
    ///
    /// Returns the number of characters written.
    pub fn save(&self, text: &str) -> Result<usize> {
        let text = truncate_chars(text, self.max_chars);

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(text.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace knowledge file: {}", self.path.display()))?;

        Ok(text.chars().count())
    }
}

/// Returns the longest prefix of `text` with at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}
