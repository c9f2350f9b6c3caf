//! Embedding gallery and its on-disk store.
//!
//! The gallery is read in full and written in full. Writes go to a temporary
//! file in the target directory and are renamed into place, so a concurrent
//! reader sees either the previous file or the new one, never a partial write.
//! In memory the last committed gallery is held as an immutable snapshot that
//! is swapped only after the rename succeeded.

use crate::error::ErrorCode;
use crate::types::Embedding;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Version tag written into every gallery file.
pub const GALLERY_FORMAT_VERSION: u32 = 1;

/// Dataset name prefix used in the backing file. Applied on save, stripped on load.
const DATASET_PREFIX: &str = "user_";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("gallery io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("gallery is corrupt: {0}")]
    Corrupt(String),
    #[error("invalid identity {0:?}: must be non-empty and contain no path separators")]
    InvalidIdentity(String),
    #[error("identity {0} has an embedding with NaN or infinite values")]
    NonFinite(String),
    #[error("identity {identity} has a {found}-dim embedding, gallery is {expected}-dim")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        found: usize,
    },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::StorageError
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Whether `identity` can be used both as a gallery key and as a directory name.
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity != "."
        && identity != ".."
        && !identity.contains(['/', '\\', '\0'])
}

/// Enrolled identities and their embeddings.
///
/// Identities iterate in sorted order; embeddings of one identity keep their
/// enrollment order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: BTreeMap<String, Vec<Embedding>>,
}

/// Per-identity summary for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub identity: String,
    pub embeddings: usize,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `embeddings` under `identity`, replacing any previous entry.
    pub fn insert(&mut self, identity: impl Into<String>, embeddings: Vec<Embedding>) {
        self.entries.insert(identity.into(), embeddings);
    }

    pub fn remove(&mut self, identity: &str) -> Option<Vec<Embedding>> {
        self.entries.remove(identity)
    }

    pub fn get(&self, identity: &str) -> Option<&[Embedding]> {
        self.entries.get(identity).map(Vec::as_slice)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Embedding])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Every stored embedding as an individual match candidate.
    pub fn candidates(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.iter()
            .flat_map(|(identity, embeddings)| embeddings.iter().map(move |e| (identity, e)))
    }

    pub fn identity_count(&self) -> usize {
        self.entries.len()
    }

    pub fn embedding_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dimensionality of the first stored embedding, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.values().flatten().next().map(Embedding::dim)
    }

    pub fn summaries(&self) -> Vec<IdentitySummary> {
        self.iter()
            .map(|(identity, embeddings)| IdentitySummary {
                identity: identity.to_string(),
                embeddings: embeddings.len(),
            })
            .collect()
    }

    /// Drop identities with no embeddings. Returns the dropped names.
    pub fn prune_empty(&mut self) -> Vec<String> {
        let empty: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, v)| v.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        for identity in &empty {
            self.entries.remove(identity);
        }
        empty
    }

    /// Check identity names, that every value is finite and that every
    /// embedding shares one dimensionality. JSON has no encoding for NaN or
    /// infinity, so such a gallery could not be read back.
    pub fn validate(&self) -> Result<(), StoreError> {
        let expected = self.dimension();
        for (identity, embeddings) in self.iter() {
            if !is_valid_identity(identity) {
                return Err(StoreError::InvalidIdentity(identity.to_string()));
            }
            if !embeddings.iter().all(Embedding::is_finite) {
                return Err(StoreError::NonFinite(identity.to_string()));
            }
            if let Some(expected) = expected {
                if let Some(bad) = embeddings.iter().find(|e| e.dim() != expected) {
                    return Err(StoreError::DimensionMismatch {
                        identity: identity.to_string(),
                        expected,
                        found: bad.dim(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<Embedding>)> for Gallery {
    fn from_iter<I: IntoIterator<Item = (S, Vec<Embedding>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// On-disk layout: one named 2-D dataset per identity.
#[derive(Serialize, Deserialize)]
struct GalleryFile {
    version: u32,
    datasets: BTreeMap<String, Vec<Embedding>>,
}

impl GalleryFile {
    fn from_gallery(gallery: &Gallery) -> Self {
        Self {
            version: GALLERY_FORMAT_VERSION,
            datasets: gallery
                .iter()
                .map(|(identity, embeddings)| {
                    (format!("{DATASET_PREFIX}{identity}"), embeddings.to_vec())
                })
                .collect(),
        }
    }

    fn into_gallery(self) -> Result<Gallery, StoreError> {
        if self.version != GALLERY_FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported format version {} (expected {GALLERY_FORMAT_VERSION})",
                self.version
            )));
        }

        let mut gallery = Gallery::new();
        for (key, embeddings) in self.datasets {
            let identity = key.strip_prefix(DATASET_PREFIX).unwrap_or(&key).to_string();
            if gallery.contains(&identity) {
                return Err(StoreError::Corrupt(format!(
                    "dataset {key:?} duplicates identity {identity:?}"
                )));
            }
            gallery.insert(identity, embeddings);
        }

        let pruned = gallery.prune_empty();
        if !pruned.is_empty() {
            tracing::warn!(?pruned, "gallery file contained empty datasets; ignoring them");
        }
        gallery.validate()?;
        Ok(gallery)
    }
}

/// Read and decode a gallery file, failing on any problem.
pub fn read_gallery(path: &Path) -> Result<Gallery, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let file: GalleryFile = serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
    file.into_gallery()
}

/// Persistent store for the embedding gallery.
pub struct GalleryStore {
    path: PathBuf,
    current: RwLock<Arc<Gallery>>,
    writer: Mutex<()>,
}

impl GalleryStore {
    /// Open the store at `path`, reading whatever gallery is there.
    ///
    /// A missing or corrupt file yields an empty gallery (see [`load`](Self::load)).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let gallery = load_or_empty(&path);
        tracing::info!(
            path = %path.display(),
            identities = gallery.identity_count(),
            embeddings = gallery.embedding_count(),
            "gallery opened"
        );
        Self {
            path,
            current: RwLock::new(Arc::new(gallery)),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last committed gallery. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Gallery> {
        Arc::clone(&self.current.read())
    }

    /// Read the full gallery from disk.
    ///
    /// Missing or corrupt storage is not fatal: it is logged at warn level and
    /// an empty gallery is returned.
    pub fn load(&self) -> Gallery {
        load_or_empty(&self.path)
    }

    /// Re-read the file and make it the current snapshot.
    pub fn reload(&self) -> Arc<Gallery> {
        let _guard = self.writer.lock();
        let gallery = Arc::new(self.load());
        *self.current.write() = Arc::clone(&gallery);
        gallery
    }

    /// Atomically replace the persisted gallery and the in-memory snapshot.
    ///
    /// Empty identities are pruned first. On error nothing changes: neither the
    /// file nor the snapshot.
    pub fn save(&self, mut gallery: Gallery) -> Result<Arc<Gallery>, StoreError> {
        gallery.prune_empty();
        gallery.validate()?;

        let _guard = self.writer.lock();
        self.commit(gallery)
    }

    /// Remove one identity from the persisted gallery.
    ///
    /// Reads the file, drops `identity` and writes it back, all under the
    /// writer lock. Returns whether the identity was present; nothing is
    /// written when it was not. The corpus is not touched.
    pub fn remove_identity(&self, identity: &str) -> Result<bool, StoreError> {
        let _guard = self.writer.lock();
        let mut gallery = self.load();
        if gallery.remove(identity).is_none() {
            tracing::debug!(identity, "remove requested for unknown identity");
            return Ok(false);
        }
        self.commit(gallery)?;
        tracing::info!(identity, "identity removed from gallery");
        Ok(true)
    }

    /// Write `gallery` and swap the snapshot. Caller holds the writer lock.
    fn commit(&self, gallery: Gallery) -> Result<Arc<Gallery>, StoreError> {
        self.write_atomic(&gallery)?;

        let gallery = Arc::new(gallery);
        *self.current.write() = Arc::clone(&gallery);

        tracing::info!(
            path = %self.path.display(),
            identities = gallery.identity_count(),
            embeddings = gallery.embedding_count(),
            "gallery saved"
        );
        Ok(gallery)
    }

    fn write_atomic(&self, gallery: &Gallery) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let tmp = tempfile::Builder::new()
            .prefix(".gallery-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| StoreError::io(&dir, e))?;

        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, &GalleryFile::from_gallery(gallery))?;
            writer.flush().map_err(|e| StoreError::io(tmp.path(), e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(tmp.path(), e))?;

        // Dropping a failed persist removes the temporary file.
        tmp.persist(&self.path)
            .map_err(|e| StoreError::io(&self.path, e.error))?;

        // Make the rename itself durable.
        if let Ok(d) = fs::File::open(&dir) {
            let _ = d.sync_all();
        }
        Ok(())
    }
}

fn load_or_empty(path: &Path) -> Gallery {
    match read_gallery(path) {
        Ok(gallery) => gallery,
        Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "gallery file not found; starting empty");
            Gallery::new()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "gallery unreadable; starting empty");
            Gallery::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    fn sample() -> Gallery {
        Gallery::from_iter([
            ("alice", vec![emb(&[1.0, 0.0, 0.0]), emb(&[0.9, 0.1, 0.0])]),
            ("bob", vec![emb(&[0.0, 1.0, 0.0])]),
        ])
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("embeddings.json"));
        assert!(store.load().is_empty());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = GalleryStore::open(&path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let store = GalleryStore::open(&path);
        store.save(sample()).unwrap();

        assert_eq!(store.load(), sample());
        assert_eq!(*store.snapshot(), sample());
        // A fresh store sees the same thing.
        assert_eq!(*GalleryStore::open(&path).snapshot(), sample());
    }

    #[test]
    fn test_dataset_prefix_applied_and_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let store = GalleryStore::open(&path);
        let gallery = Gallery::from_iter([("user_x", vec![emb(&[1.0, 2.0])])]);
        store.save(gallery.clone()).unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(raw["datasets"].get("user_user_x").is_some());
        // Only the leading prefix is stripped, so the identity survives intact.
        assert_eq!(store.load(), gallery);
    }

    #[test]
    fn test_unprefixed_keys_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        fs::write(&path, r#"{"version":1,"datasets":{"carol":[[0.5,0.5]]}}"#).unwrap();
        let gallery = GalleryStore::open(&path).load();
        assert_eq!(gallery.get("carol").map(|e| e.len()), Some(1));
    }

    #[test]
    fn test_save_prunes_empty_identities() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("embeddings.json"));
        let mut gallery = sample();
        gallery.insert("ghost", Vec::new());
        let saved = store.save(gallery).unwrap();
        assert!(!saved.contains("ghost"));
        assert!(!store.load().contains("ghost"));
    }

    #[test]
    fn test_save_rejects_mixed_dimensions_and_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("embeddings.json"));
        store.save(sample()).unwrap();

        let mut bad = sample();
        bad.insert("carol", vec![emb(&[1.0, 0.0])]);
        let err = store.save(bad).unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
        assert_eq!(err.code(), ErrorCode::StorageError);
        assert_eq!(store.load(), sample());
        assert_eq!(*store.snapshot(), sample());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("embeddings.json"));
        store.save(sample()).unwrap();
        store.save(Gallery::new()).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("embeddings.json")]);
    }

    #[test]
    fn test_wrong_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        fs::write(&path, r#"{"version":9,"datasets":{}}"#).unwrap();
        assert!(matches!(read_gallery(&path), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_reload_picks_up_external_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let store = GalleryStore::open(&path);
        GalleryStore::open(&path).save(sample()).unwrap();
        assert!(store.snapshot().is_empty());
        assert_eq!(*store.reload(), sample());
    }

    #[test]
    fn test_candidates_flatten_in_order() {
        let g = sample();
        let ids: Vec<&str> = g.candidates().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["alice", "alice", "bob"]);
        assert_eq!(g.embedding_count(), 3);
        assert_eq!(g.dimension(), Some(3));
    }

    #[test]
    fn test_identity_validation() {
        assert!(is_valid_identity("alice"));
        assert!(!is_valid_identity(""));
        assert!(!is_valid_identity("a/b"));
        assert!(!is_valid_identity(".."));
    }

    #[test]
    fn test_save_rejects_non_finite_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let store = GalleryStore::open(&path);
        store.save(sample()).unwrap();

        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let mut gallery = sample();
            gallery.insert("mallory", vec![emb(&[bad, 0.0, 0.0])]);
            let err = store.save(gallery).unwrap_err();
            assert!(matches!(&err, StoreError::NonFinite(id) if id == "mallory"));
            assert_eq!(err.code(), ErrorCode::StorageError);
        }
        // The committed gallery still reads back intact.
        assert_eq!(store.load(), sample());
        assert_eq!(*GalleryStore::open(&path).snapshot(), sample());
    }

    #[test]
    fn test_remove_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let store = GalleryStore::open(&path);
        store.save(sample()).unwrap();

        assert!(store.remove_identity("alice").unwrap());
        assert!(!store.load().contains("alice"));
        assert!(!store.snapshot().contains("alice"));
        assert_eq!(store.load().get("bob"), sample().get("bob"));

        let before = fs::read(&path).unwrap();
        assert!(!store.remove_identity("alice").unwrap());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_readers_never_see_partial_gallery_during_saves() {
        use std::sync::atomic::{AtomicBool, Ordering};

        // Generation k: every embedding of every identity is [k, 1, 0].
        fn generation(k: usize) -> Gallery {
            let e = || emb(&[k as f32, 1.0, 0.0]);
            Gallery::from_iter([("alice", vec![e(), e()]), ("bob", vec![e()]), ("carol", vec![e()])])
        }
        fn assert_committed(g: &Gallery) {
            let k = g.get("alice").expect("alice present")[0].values[0] as usize;
            assert_eq!(*g, generation(k), "read a mixed or partial gallery");
        }

        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("embeddings.json"));
        store.save(generation(0)).unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        assert_committed(&store.load());
                        assert_committed(&store.snapshot());
                    }
                });
            }
            scope.spawn(|| {
                let saved = (1..=50).try_for_each(|k| store.save(generation(k)).map(drop));
                done.store(true, Ordering::Release);
                saved.unwrap();
            });
        });

        assert_eq!(store.load(), generation(50));
    }
}
