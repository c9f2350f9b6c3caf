//! Enrollment corpus: one directory per identity holding that person's images.

use crate::error::ErrorCode;
use crate::gallery::is_valid_identity;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions treated as enrollment images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("cannot read corpus directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CorpusError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::StorageError
    }
}

/// Whether `path` has one of the recognized image extensions.
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Read-only view of the folder-per-person corpus.
#[derive(Debug, Clone)]
pub struct Corpus {
    root: PathBuf,
}

impl Corpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity_dir(&self, identity: &str) -> PathBuf {
        self.root.join(identity)
    }

    /// Names of the identity directories directly under the root.
    ///
    /// Hidden entries are ignored; names that are not valid identities are
    /// skipped with a warning.
    pub fn identities(&self) -> Result<BTreeSet<String>, CorpusError> {
        let entries = fs::read_dir(&self.root).map_err(|e| self.io(&self.root, e))?;

        let mut identities = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.io(&self.root, e))?;
            let is_dir = fs::metadata(entry.path())
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 corpus directory");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if !is_valid_identity(name) {
                tracing::warn!(name, "skipping corpus directory with invalid identity name");
                continue;
            }
            identities.insert(name.to_string());
        }
        Ok(identities)
    }

    /// Image files of one identity, sorted by file name.
    pub fn images(&self, identity: &str) -> Result<Vec<PathBuf>, CorpusError> {
        let dir = self.identity_dir(identity);
        let entries = fs::read_dir(&dir).map_err(|e| self.io(&dir, e))?;

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.io(&dir, e))?;
            let path = entry.path();
            if path.is_file() && is_image_file(&path) {
                images.push(path);
            }
        }
        images.sort();
        Ok(images)
    }

    fn io(&self, path: &Path, source: std::io::Error) -> CorpusError {
        CorpusError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
