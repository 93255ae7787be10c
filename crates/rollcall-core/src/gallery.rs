//! In-memory identity → embedding gallery with JSON persistence.
//!
//! The gallery is shared, read-mostly state: recognition requests snapshot
//! it without blocking registration, and registration replaces entries
//! atomically under a write lock. The in-memory gallery is the source of
//! truth for the running process; the file on disk is best-effort
//! durability across restarts.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("embedding for {identity:?} has {got} dimensions, expected {expected}")]
    InvalidEmbedding {
        identity: String,
        expected: usize,
        got: usize,
    },
    #[error("gallery data is corrupt: {0}")]
    CorruptData(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One (identity, embedding) pair from a gallery snapshot.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: String,
    pub embedding: Arc<Embedding>,
}

/// On-disk gallery file layout.
#[derive(Serialize, Deserialize)]
struct PersistedGallery {
    dim: usize,
    entries: Vec<PersistedEntry>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    identity: String,
    /// Absent for identities that were enrolled but never completed face
    /// registration. Such entries are skipped on load.
    #[serde(default)]
    values: Option<Vec<f32>>,
    #[serde(default)]
    model_version: Option<String>,
}

/// Identity → reference embedding mapping.
///
/// Each identity has exactly one current embedding; re-registration
/// overwrites, never appends.
pub struct Gallery {
    dim: usize,
    entries: RwLock<HashMap<String, Arc<Embedding>>>,
}

impl Gallery {
    /// Create an empty gallery expecting embeddings of `dim` dimensions.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Expected embedding dimensionality.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Load a gallery from a JSON file written by [`persist`](Self::persist).
    ///
    /// Entries missing their numeric payload are skipped and logged —
    /// a partial load is acceptable, a silent total failure is not. An
    /// entry whose payload has the wrong dimensionality fails the whole
    /// load with [`GalleryError::CorruptData`].
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let bytes = std::fs::read(path)?;
        let persisted: PersistedGallery = serde_json::from_slice(&bytes)
            .map_err(|e| GalleryError::CorruptData(e.to_string()))?;

        let mut map = HashMap::with_capacity(persisted.entries.len());
        let mut skipped = 0usize;

        for entry in persisted.entries {
            let Some(values) = entry.values else {
                tracing::warn!(
                    identity = %entry.identity,
                    "gallery entry has no embedding payload; skipped"
                );
                skipped += 1;
                continue;
            };
            if values.len() != persisted.dim {
                return Err(GalleryError::CorruptData(format!(
                    "entry {:?} has {} dimensions, expected {}",
                    entry.identity,
                    values.len(),
                    persisted.dim
                )));
            }
            map.insert(
                entry.identity,
                Arc::new(Embedding {
                    values,
                    model_version: entry.model_version,
                }),
            );
        }

        tracing::info!(
            path = %path.display(),
            loaded = map.len(),
            skipped,
            dim = persisted.dim,
            "gallery loaded"
        );

        Ok(Self {
            dim: persisted.dim,
            entries: RwLock::new(map),
        })
    }

    /// Insert or replace the reference embedding for `identity`.
    ///
    /// The replacement is atomic with respect to concurrent readers: a
    /// snapshot taken at any point sees either the old or the new
    /// embedding, never a torn one.
    pub fn upsert(&self, identity: &str, embedding: Embedding) -> Result<(), GalleryError> {
        if embedding.dim() != self.dim {
            return Err(GalleryError::InvalidEmbedding {
                identity: identity.to_string(),
                expected: self.dim,
                got: embedding.dim(),
            });
        }

        let replaced = self
            .write()
            .insert(identity.to_string(), Arc::new(embedding))
            .is_some();

        tracing::debug!(identity, replaced, "gallery upsert");
        Ok(())
    }

    /// Consistent point-in-time view of the gallery, sorted by identity.
    ///
    /// Entries are `Arc` clones, so callers scan the snapshot without
    /// holding any gallery lock.
    pub fn snapshot(&self) -> Vec<GalleryEntry> {
        let guard = self.read();
        let mut entries: Vec<GalleryEntry> = guard
            .iter()
            .map(|(identity, embedding)| GalleryEntry {
                identity: identity.clone(),
                embedding: Arc::clone(embedding),
            })
            .collect();
        drop(guard);
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }

    /// Serialize the current mapping to `path` (write-to-temp + rename).
    ///
    /// Callers treat failure as a degraded-mode warning: the in-memory
    /// gallery stays authoritative either way.
    pub fn persist(&self, path: &Path) -> Result<(), GalleryError> {
        let persisted = PersistedGallery {
            dim: self.dim,
            entries: self
                .snapshot()
                .into_iter()
                .map(|e| PersistedEntry {
                    identity: e.identity,
                    values: Some(e.embedding.values.clone()),
                    model_version: e.embedding.model_version.clone(),
                })
                .collect(),
        };

        let bytes = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| GalleryError::CorruptData(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;

        tracing::info!(
            path = %path.display(),
            entries = persisted.entries.len(),
            "gallery persisted"
        );
        Ok(())
    }

    /// Replace the whole mapping from disk.
    ///
    /// Returns the number of entries loaded. On any error the in-memory
    /// gallery is left untouched.
    pub fn reload(&self, path: &Path) -> Result<usize, GalleryError> {
        let fresh = Self::load(path)?;
        if fresh.dim != self.dim {
            return Err(GalleryError::CorruptData(format!(
                "reloaded gallery has dim {}, expected {}",
                fresh.dim, self.dim
            )));
        }
        let fresh_map = fresh.entries.into_inner().unwrap_or_else(PoisonError::into_inner);
        let count = fresh_map.len();
        *self.write() = fresh_map;
        Ok(count)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Embedding>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Embedding>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    #[test]
    fn test_upsert_rejects_wrong_dimensionality() {
        let gallery = Gallery::new(128);
        let err = gallery.upsert("S1", emb(vec![0.5; 64])).unwrap_err();
        match err {
            GalleryError::InvalidEmbedding { expected, got, .. } => {
                assert_eq!(expected, 128);
                assert_eq!(got, 64);
            }
            other => panic!("expected InvalidEmbedding, got {other:?}"),
        }
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_upsert_overwrites_not_appends() {
        let gallery = Gallery::new(2);
        gallery.upsert("S1", emb(vec![1.0, 0.0])).unwrap();
        gallery.upsert("S1", emb(vec![0.0, 1.0])).unwrap();
        assert_eq!(gallery.len(), 1);
        let snap = gallery.snapshot();
        assert_eq!(snap[0].embedding.values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_snapshot_sorted_and_detached() {
        let gallery = Gallery::new(2);
        gallery.upsert("S2", emb(vec![0.0, 1.0])).unwrap();
        gallery.upsert("S1", emb(vec![1.0, 0.0])).unwrap();

        let snap = gallery.snapshot();
        assert_eq!(snap[0].identity, "S1");
        assert_eq!(snap[1].identity, "S2");

        // A snapshot is point-in-time: later writes do not show through.
        gallery.upsert("S3", emb(vec![0.5, 0.5])).unwrap();
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn test_persist_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");

        let gallery = Gallery::new(3);
        gallery.upsert("S1", emb(vec![0.1, 0.2, 0.3])).unwrap();
        gallery
            .upsert(
                "S2",
                Embedding {
                    values: vec![-0.4, 0.5, 0.6],
                    model_version: Some("mfn_128_v2".into()),
                },
            )
            .unwrap();
        gallery.persist(&path).unwrap();

        let reloaded = Gallery::load(&path).unwrap();
        assert_eq!(reloaded.dim(), 3);
        assert_eq!(reloaded.len(), 2);

        let snap = reloaded.snapshot();
        for (a, b) in snap[0].embedding.values.iter().zip([0.1, 0.2, 0.3]) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(snap[1].embedding.model_version.as_deref(), Some("mfn_128_v2"));
    }

    #[test]
    fn test_load_skips_entries_missing_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(
            &path,
            r#"{
                "dim": 2,
                "entries": [
                    {"identity": "S1", "values": [0.1, 0.2]},
                    {"identity": "S2"},
                    {"identity": "S3", "values": null}
                ]
            }"#,
        )
        .unwrap();

        let gallery = Gallery::load(&path).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.snapshot()[0].identity, "S1");
    }

    #[test]
    fn test_load_fails_on_wrong_dimensionality() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(
            &path,
            r#"{"dim": 3, "entries": [{"identity": "S1", "values": [0.1, 0.2]}]}"#,
        )
        .unwrap();

        assert!(matches!(
            Gallery::load(&path),
            Err(GalleryError::CorruptData(_))
        ));
    }

    #[test]
    fn test_load_fails_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, b"not json at all").unwrap();
        assert!(matches!(
            Gallery::load(&path),
            Err(GalleryError::CorruptData(_))
        ));
    }

    #[test]
    fn test_reload_replaces_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");

        let on_disk = Gallery::new(2);
        on_disk.upsert("S9", emb(vec![0.9, 0.9])).unwrap();
        on_disk.persist(&path).unwrap();

        let gallery = Gallery::new(2);
        gallery.upsert("S1", emb(vec![0.1, 0.1])).unwrap();
        let count = gallery.reload(&path).unwrap();

        assert_eq!(count, 1);
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.snapshot()[0].identity, "S9");
    }

    #[test]
    fn test_reload_error_leaves_gallery_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");

        let gallery = Gallery::new(2);
        gallery.upsert("S1", emb(vec![0.1, 0.1])).unwrap();
        assert!(gallery.reload(&path).is_err());
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn test_concurrent_readers_during_upsert() {
        use std::sync::Arc as StdArc;

        let gallery = StdArc::new(Gallery::new(2));
        gallery.upsert("S1", emb(vec![1.0, 0.0])).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let g = StdArc::clone(&gallery);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    for entry in g.snapshot() {
                        // Never observe a torn embedding: it is one of the
                        // two complete vectors ever written for S1.
                        let v = &entry.embedding.values;
                        assert!(v == &vec![1.0, 0.0] || v == &vec![0.0, 1.0]);
                    }
                }
            }));
        }

        for _ in 0..200 {
            gallery.upsert("S1", emb(vec![0.0, 1.0])).unwrap();
            gallery.upsert("S1", emb(vec![1.0, 0.0])).unwrap();
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
