//! Intrusion blacklist: persisted embeddings + screenshots of unknown
//! faces that failed authentication.
//!
//! Every entry is a `<uuid>.npy` / `<uuid>.jpg` / `<uuid>.json` triple in
//! the blacklist directory. New entries start in quarantine; a human
//! reviewer either confirms them (permanent) or deletes them. Both
//! quarantined and confirmed entries are indexed for the pre-match check —
//! a freshly recorded intruder must be rejected on their very next attempt,
//! before review has happened.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use sentinel_core::types::EMBEDDING_DIM;
use sentinel_core::Embedding;

use crate::gallery::StoreError;
use crate::npy;

#[derive(Debug, Serialize, Deserialize, Clone)]
struct EntrySidecar {
    first_seen: DateTime<Utc>,
    hit_count: u32,
    confirmed: bool,
}

/// One indexed blacklist entry.
#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub id: String,
    pub embedding: Embedding,
    pub first_seen: DateTime<Utc>,
    pub hit_count: u32,
    pub confirmed: bool,
}

/// A pre-match hit against the blacklist.
#[derive(Debug, Clone)]
pub struct BlacklistHit {
    pub entry_id: String,
    pub distance: f32,
}

/// Filesystem-backed intrusion index.
pub struct BlacklistManager {
    dir: PathBuf,
    entries: Vec<BlacklistEntry>,
}

impl BlacklistManager {
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        let dir = state_dir.join("blacklist");
        fs::create_dir_all(&dir)?;

        let mut manager = Self {
            dir,
            entries: Vec::new(),
        };
        manager.reload();
        Ok(manager)
    }

    /// Rebuild the in-memory index from disk, skipping unreadable entries.
    pub fn reload(&mut self) {
        self.entries.clear();

        let Ok(dir_entries) = fs::read_dir(&self.dir) else {
            return;
        };

        for file in dir_entries.flatten() {
            let name = file.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(".npy") else {
                continue;
            };
            match self.load_entry(id) {
                Ok(entry) => self.entries.push(entry),
                Err(e) => {
                    warn!(id = %id, error = %e, "skipping unreadable blacklist entry");
                }
            }
        }
        self.entries.sort_by(|a, b| a.id.cmp(&b.id));
        info!(count = self.entries.len(), "blacklist index loaded");
    }

    fn load_entry(&self, id: &str) -> Result<BlacklistEntry, StoreError> {
        let file = fs::File::open(self.npy_path(id))?;
        let (data, rows, cols) = npy::read_f32_2d(std::io::BufReader::new(file))?;
        if rows != 1 || cols != EMBEDDING_DIM {
            return Err(npy::NpyError::BadHeader(format!(
                "blacklist entry must be 1x{EMBEDDING_DIM}, got {rows}x{cols}"
            ))
            .into());
        }
        let embedding = Embedding::from_stored(data)
            .map_err(|e| npy::NpyError::BadHeader(e.to_string()))?;

        let sidecar: EntrySidecar =
            serde_json::from_str(&fs::read_to_string(self.json_path(id))?)?;

        Ok(BlacklistEntry {
            id: id.to_string(),
            embedding,
            first_seen: sidecar.first_seen,
            hit_count: sidecar.hit_count,
            confirmed: sidecar.confirmed,
        })
    }

    fn npy_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.npy"))
    }

    fn jpg_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.jpg"))
    }

    fn json_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Compare a probe against every indexed entry. On a hit the entry's
    /// hit count is incremented and persisted.
    ///
    /// `exclude` lists entry ids the caller itself just recorded — a
    /// session must not be blocked by its own quarantine writes while it
    /// still has retries left.
    pub fn check(
        &mut self,
        probe: &Embedding,
        threshold: f32,
        exclude: &[String],
    ) -> Option<BlacklistHit> {
        let mut best: Option<(usize, f32)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if exclude.contains(&entry.id) {
                continue;
            }
            let dist = probe.distance(&entry.embedding);
            if best.map(|(_, d)| dist < d).unwrap_or(true) {
                best = Some((i, dist));
            }
        }

        let (index, distance) = best?;
        if distance > threshold {
            return None;
        }

        let entry = &mut self.entries[index];
        entry.hit_count += 1;
        let sidecar = EntrySidecar {
            first_seen: entry.first_seen,
            hit_count: entry.hit_count,
            confirmed: entry.confirmed,
        };
        let id = entry.id.clone();
        let hit_count = entry.hit_count;
        if let Err(e) = self.write_sidecar(&id, &sidecar) {
            warn!(id = %id, error = %e, "failed to persist blacklist hit count");
        }

        info!(id = %id, distance, hit_count, "blacklist pre-match hit");
        Some(BlacklistHit {
            entry_id: id,
            distance,
        })
    }

    /// Record a new quarantine entry: the exact probe embedding that caused
    /// the intrusion plus a screenshot of the offending frame.
    pub fn record_intrusion(
        &mut self,
        embedding: &Embedding,
        screenshot_jpeg: &[u8],
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();

        let tmp = self.npy_path(&id).with_extension("npy.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            npy::write_f32_2d(&mut file, embedding.values(), 1, EMBEDDING_DIM)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.npy_path(&id))?;

        fs::write(self.jpg_path(&id), screenshot_jpeg)?;

        let sidecar = EntrySidecar {
            first_seen: Utc::now(),
            hit_count: 0,
            confirmed: false,
        };
        self.write_sidecar(&id, &sidecar)?;

        self.entries.push(BlacklistEntry {
            id: id.clone(),
            embedding: embedding.clone(),
            first_seen: sidecar.first_seen,
            hit_count: 0,
            confirmed: false,
        });

        info!(id = %id, "intrusion recorded to quarantine");
        Ok(id)
    }

    /// Promote a quarantine entry to permanent. No-op if already confirmed
    /// or unknown.
    pub fn confirm(&mut self, id: &str) -> Result<bool, StoreError> {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        if entry.confirmed {
            return Ok(true);
        }
        entry.confirmed = true;
        let sidecar = EntrySidecar {
            first_seen: entry.first_seen,
            hit_count: entry.hit_count,
            confirmed: true,
        };
        let id = id.to_string();
        self.write_sidecar(&id, &sidecar)?;
        info!(id = %id, "intrusion confirmed as permanent");
        Ok(true)
    }

    /// Remove an entry and its files. No-op for unknown ids.
    pub fn delete(&mut self, id: &str) -> Result<bool, StoreError> {
        let existed = self.entries.iter().any(|e| e.id == id);
        self.entries.retain(|e| e.id != id);

        for path in [self.npy_path(id), self.jpg_path(id), self.json_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if existed {
            info!(id = %id, "intrusion entry deleted");
        }
        Ok(existed)
    }

    /// Screenshot paths of quarantine (unconfirmed) entries, for review.
    pub fn quarantine_files(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.confirmed)
            .map(|e| self.jpg_path(&e.id).to_string_lossy().into_owned())
            .collect()
    }

    pub fn entries(&self) -> &[BlacklistEntry] {
        &self.entries
    }

    fn write_sidecar(&self, id: &str, sidecar: &EntrySidecar) -> Result<(), StoreError> {
        let path = self.json_path(id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(sidecar)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
