//! Per-user gallery persistence and matching.
//!
//! Each user owns one `gallery_<user>.npy` (a single concatenated float32
//! array) plus a JSON sidecar recording the creation time, the boundary
//! between the enrolled and adaptive segments, and the glasses flag. Both
//! files are written via write-to-temp + atomic rename. Readers treat a
//! missing or corrupt pair as "unenrolled" — a damaged store degrades to
//! a failed authentication, never a crashed daemon.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use sentinel_core::types::EMBEDDING_DIM;
use sentinel_core::Embedding;

use crate::npy;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery array: {0}")]
    Npy(#[from] npy::NpyError),
    #[error("gallery sidecar: {0}")]
    Sidecar(#[from] serde_json::Error),
    #[error("gallery for {user} violates segment invariant ({boundary} > {len})")]
    BadSegmentBoundary {
        user: String,
        boundary: usize,
        len: usize,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct GallerySidecar {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    segment_boundary: usize,
    wears_glasses: bool,
}

/// One user's gallery, loaded in memory.
#[derive(Debug, Clone)]
pub struct Gallery {
    pub user: String,
    pub embeddings: Vec<Embedding>,
    /// Index splitting the enrolled prefix from the adaptive suffix.
    pub segment_boundary: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub wears_glasses: bool,
}

impl Gallery {
    pub fn new(user: &str, wears_glasses: bool) -> Self {
        let now = Utc::now();
        Self {
            user: user.to_string(),
            embeddings: Vec::new(),
            segment_boundary: 0,
            created_at: now,
            updated_at: now,
            wears_glasses,
        }
    }

    pub fn enrolled(&self) -> &[Embedding] {
        &self.embeddings[..self.segment_boundary]
    }

    pub fn adaptive(&self) -> &[Embedding] {
        &self.embeddings[self.segment_boundary..]
    }

    /// Append to the enrolled segment (enrollment only).
    pub fn append_enrolled(&mut self, embedding: Embedding) {
        self.embeddings.insert(self.segment_boundary, embedding);
        self.segment_boundary += 1;
        self.updated_at = Utc::now();
    }

    /// Append to the adaptive segment, evicting the FIFO-oldest adaptive
    /// entry when over `max_adaptive`. Enrolled entries are never evicted.
    pub fn append_adaptive(&mut self, embedding: Embedding, max_adaptive: usize) {
        self.embeddings.push(embedding);
        while self.adaptive().len() > max_adaptive {
            self.embeddings.remove(self.segment_boundary);
        }
        self.updated_at = Utc::now();
    }

    /// Smallest cosine distance from the probe to any embedding.
    pub fn min_distance(&self, probe: &Embedding) -> Option<f32> {
        sentinel_core::types::min_distance(probe, &self.embeddings)
    }

    /// A gallery aged exactly `max_age_days` is still valid; one second
    /// past that it expires.
    pub fn is_expired(&self, max_age_days: i64, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) > Duration::days(max_age_days)
    }

    /// Usable for authentication: full enrolled segment and not expired.
    pub fn is_usable(&self, min_enrolled: usize, max_age_days: i64, now: DateTime<Utc>) -> bool {
        self.segment_boundary >= min_enrolled && !self.is_expired(max_age_days, now)
    }
}

/// Result of matching a probe across galleries.
#[derive(Debug, Clone)]
pub struct GalleryMatch {
    pub user: String,
    pub distance: f32,
}

/// Best-of-galleries match; ties on distance break toward the most
/// recently written gallery.
pub fn match_probe(galleries: &[Gallery], probe: &Embedding) -> Option<GalleryMatch> {
    let mut best: Option<(&Gallery, f32)> = None;

    for gallery in galleries {
        let Some(dist) = gallery.min_distance(probe) else {
            continue;
        };
        best = Some(match best {
            None => (gallery, dist),
            Some((current, current_dist)) => {
                if dist < current_dist
                    || (dist == current_dist && gallery.updated_at > current.updated_at)
                {
                    (gallery, dist)
                } else {
                    (current, current_dist)
                }
            }
        });
    }

    best.map(|(gallery, distance)| GalleryMatch {
        user: gallery.user.clone(),
        distance,
    })
}

/// Filesystem-backed gallery store.
pub struct GalleryStore {
    state_dir: PathBuf,
}

impl GalleryStore {
    pub fn new(state_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(state_dir)?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
        })
    }

    fn array_path(&self, user: &str) -> PathBuf {
        self.state_dir.join(format!("gallery_{user}.npy"))
    }

    fn sidecar_path(&self, user: &str) -> PathBuf {
        self.state_dir.join(format!("gallery_{user}.json"))
    }

    /// Load one user's gallery. Missing or corrupt files mean "unenrolled".
    pub fn load(&self, user: &str) -> Option<Gallery> {
        match self.try_load(user) {
            Ok(gallery) => gallery,
            Err(e) => {
                warn!(user, error = %e, "gallery unreadable; treating user as unenrolled");
                None
            }
        }
    }

    fn try_load(&self, user: &str) -> Result<Option<Gallery>, StoreError> {
        let array_path = self.array_path(user);
        let sidecar_path = self.sidecar_path(user);
        if !array_path.exists() || !sidecar_path.exists() {
            return Ok(None);
        }

        let sidecar: GallerySidecar = serde_json::from_str(&fs::read_to_string(&sidecar_path)?)?;

        let file = fs::File::open(&array_path)?;
        let (data, rows, cols) = npy::read_f32_2d(std::io::BufReader::new(file))?;
        if rows > 0 && cols != EMBEDDING_DIM {
            return Err(npy::NpyError::BadHeader(format!(
                "expected {EMBEDDING_DIM} columns, got {cols}"
            ))
            .into());
        }
        if sidecar.segment_boundary > rows {
            return Err(StoreError::BadSegmentBoundary {
                user: user.to_string(),
                boundary: sidecar.segment_boundary,
                len: rows,
            });
        }

        let embeddings = data
            .chunks_exact(EMBEDDING_DIM)
            .map(|row| Embedding::from_stored(row.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| npy::NpyError::BadHeader(e.to_string()))?;

        Ok(Some(Gallery {
            user: user.to_string(),
            embeddings,
            segment_boundary: sidecar.segment_boundary,
            created_at: sidecar.created_at,
            updated_at: sidecar.updated_at,
            wears_glasses: sidecar.wears_glasses,
        }))
    }

    /// Load every gallery present on disk (unreadable ones are skipped).
    pub fn load_all(&self) -> Vec<Gallery> {
        self.list_users()
            .iter()
            .filter_map(|user| self.load(user))
            .collect()
    }

    /// Usernames with a gallery file pair on disk (readable or not).
    pub fn list_users(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.state_dir) else {
            return Vec::new();
        };

        let mut users: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let user = name.strip_prefix("gallery_")?.strip_suffix(".npy")?;
                Some(user.to_string())
            })
            .collect();
        users.sort();
        users
    }

    /// Persist both files via write-to-temp + atomic rename.
    pub fn save(&self, gallery: &Gallery) -> Result<(), StoreError> {
        if gallery.segment_boundary > gallery.embeddings.len() {
            return Err(StoreError::BadSegmentBoundary {
                user: gallery.user.clone(),
                boundary: gallery.segment_boundary,
                len: gallery.embeddings.len(),
            });
        }

        let data: Vec<f32> = gallery
            .embeddings
            .iter()
            .flat_map(|e| e.values().iter().copied())
            .collect();

        let array_path = self.array_path(&gallery.user);
        let tmp_array = array_path.with_extension("npy.tmp");
        {
            let mut file = fs::File::create(&tmp_array)?;
            npy::write_f32_2d(&mut file, &data, gallery.embeddings.len(), EMBEDDING_DIM)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_array, &array_path)?;

        let sidecar = GallerySidecar {
            created_at: gallery.created_at,
            updated_at: gallery.updated_at,
            segment_boundary: gallery.segment_boundary,
            wears_glasses: gallery.wears_glasses,
        };
        let sidecar_path = self.sidecar_path(&gallery.user);
        let tmp_sidecar = sidecar_path.with_extension("json.tmp");
        fs::write(&tmp_sidecar, serde_json::to_string_pretty(&sidecar)?)?;
        fs::rename(&tmp_sidecar, &sidecar_path)?;

        Ok(())
    }

    /// Remove a user's gallery pair (enrollment restart).
    pub fn remove(&self, user: &str) -> Result<(), StoreError> {
        for path in [self.array_path(user), self.sidecar_path(user)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn axis_embedding(axis: usize) -> Embedding {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        raw[axis] = 1.0;
        Embedding::from_raw(raw).unwrap()
    }

    fn store() -> (TempDir, GalleryStore) {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn filled_gallery(user: &str, enrolled: usize) -> Gallery {
        let mut g = Gallery::new(user, false);
        for i in 0..enrolled {
            g.append_enrolled(axis_embedding(i));
        }
        g
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = store();
        let mut g = filled_gallery("alex", 3);
        g.append_adaptive(axis_embedding(10), 20);
        store.save(&g).unwrap();

        let loaded = store.load("alex").unwrap();
        assert_eq!(loaded.embeddings.len(), 4);
        assert_eq!(loaded.segment_boundary, 3);
        assert_eq!(loaded.adaptive().len(), 1);
        for (a, b) in g.embeddings.iter().zip(loaded.embeddings.iter()) {
            for (x, y) in a.values().iter().zip(b.values().iter()) {
                assert_eq!(x.to_bits(), y.to_bits(), "bytewise-equal embeddings");
            }
        }
    }

    #[test]
    fn test_missing_user_is_unenrolled() {
        let (_dir, store) = store();
        assert!(store.load("nobody").is_none());
    }

    #[test]
    fn test_corrupt_array_is_unenrolled() {
        let (dir, store) = store();
        store.save(&filled_gallery("alex", 2)).unwrap();
        fs::write(dir.path().join("gallery_alex.npy"), b"garbage").unwrap();
        assert!(store.load("alex").is_none());
    }

    #[test]
    fn test_corrupt_sidecar_is_unenrolled() {
        let (dir, store) = store();
        store.save(&filled_gallery("alex", 2)).unwrap();
        fs::write(dir.path().join("gallery_alex.json"), b"{not json").unwrap();
        assert!(store.load("alex").is_none());
    }

    #[test]
    fn test_boundary_over_length_rejected() {
        let (dir, store) = store();
        store.save(&filled_gallery("alex", 2)).unwrap();
        let sidecar = dir.path().join("gallery_alex.json");
        let text = fs::read_to_string(&sidecar).unwrap();
        fs::write(&sidecar, text.replace("\"segment_boundary\": 2", "\"segment_boundary\": 9")).unwrap();
        assert!(store.load("alex").is_none());
    }

    #[test]
    fn test_adaptive_fifo_eviction() {
        let mut g = filled_gallery("alex", 2);
        for i in 0..5 {
            g.append_adaptive(axis_embedding(10 + i), 3);
        }
        assert_eq!(g.enrolled().len(), 2, "enrolled segment never evicted");
        assert_eq!(g.adaptive().len(), 3);
        // Oldest adaptive entries (axes 10, 11) were dropped
        assert!(g.adaptive()[0].values()[12] > 0.9);
    }

    #[test]
    fn test_expiry_boundary() {
        let mut g = filled_gallery("alex", 1);
        let now = Utc::now();
        g.created_at = now - Duration::days(45);
        assert!(!g.is_expired(45, now), "exactly max_age is still valid");
        assert!(
            g.is_expired(45, now + Duration::seconds(1)),
            "one second past max_age expires"
        );
    }

    #[test]
    fn test_usable_requires_min_enrolled() {
        let g = filled_gallery("alex", 19);
        let now = Utc::now();
        assert!(!g.is_usable(20, 45, now));
        let g = filled_gallery("alex", 20);
        assert!(g.is_usable(20, 45, now));
    }

    #[test]
    fn test_match_probe_picks_best_user() {
        let mut a = filled_gallery("alex", 1); // axis 0
        a.updated_at = Utc::now() - Duration::hours(1);
        let mut b = Gallery::new("bo", false);
        b.append_enrolled(axis_embedding(5));

        let probe = axis_embedding(5);
        let m = match_probe(&[a, b], &probe).unwrap();
        assert_eq!(m.user, "bo");
        assert!(m.distance.abs() < 1e-6);
    }

    #[test]
    fn test_match_probe_tie_breaks_to_recent() {
        let mut old = filled_gallery("old", 1);
        old.updated_at = Utc::now() - Duration::days(3);
        let mut new = filled_gallery("new", 1);
        new.updated_at = Utc::now();

        // Identical contents → identical distances
        let probe = axis_embedding(0);
        let m = match_probe(&[old, new], &probe).unwrap();
        assert_eq!(m.user, "new");
    }

    #[test]
    fn test_match_probe_skips_empty() {
        let empty = Gallery::new("empty", false);
        let full = filled_gallery("full", 1);
        let probe = axis_embedding(0);
        let m = match_probe(&[empty, full], &probe).unwrap();
        assert_eq!(m.user, "full");
    }

    #[test]
    fn test_list_users_sorted() {
        let (_dir, store) = store();
        store.save(&filled_gallery("zoe", 1)).unwrap();
        store.save(&filled_gallery("alex", 1)).unwrap();
        assert_eq!(store.list_users(), vec!["alex", "zoe"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_dir, store) = store();
        store.save(&filled_gallery("alex", 1)).unwrap();
        store.remove("alex").unwrap();
        store.remove("alex").unwrap();
        assert!(store.load("alex").is_none());
    }
}
