//! Adaptive gallery learning policy.
//!
//! Golden-tier logins may fold the session probe back into the user's
//! adaptive segment so the gallery tracks slow appearance drift. Every
//! commit is gated: a per-day budget, a diversity band that rejects both
//! redundant and suspiciously divergent probes, and an out-of-band password
//! confirmation for a user's first few commits.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sentinel_core::Embedding;

use crate::gallery::Gallery;

#[derive(Error, Debug)]
pub enum AdaptiveError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger: {0}")]
    Ledger(#[from] serde_json::Error),
}

/// Why a commit was skipped. Skips are policy outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptSkip {
    /// Daily commit budget for this user is spent.
    DailyBudget,
    /// Probe is interchangeable with what the gallery already holds.
    Redundant,
    /// Probe is too far from everything enrolled — possible identity drift.
    Divergent,
    /// Early-life commit requires the out-of-band confirmation token.
    PasswordRequired,
    /// Gallery has no embeddings to compare against.
    EmptyGallery,
}

/// Policy knobs, taken from the config snapshot.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveSettings {
    pub limit_per_day: u32,
    pub initial_require_password: u32,
    pub min_diversity: f32,
    pub max_distance: f32,
}

/// Per-user commit ledger, persisted as `adaptive_<user>.json`.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
struct Ledger {
    last_date: Option<NaiveDate>,
    today_count: u32,
    total_commits: u32,
}

impl Ledger {
    fn count_for(&self, today: NaiveDate) -> u32 {
        if self.last_date == Some(today) {
            self.today_count
        } else {
            0
        }
    }
}

/// Rate-limited, policy-gated adaptive commit manager.
pub struct AdaptiveManager {
    state_dir: PathBuf,
}

impl AdaptiveManager {
    pub fn new(state_dir: &Path) -> Result<Self, AdaptiveError> {
        fs::create_dir_all(state_dir)?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
        })
    }

    fn ledger_path(&self, user: &str) -> PathBuf {
        self.state_dir.join(format!("adaptive_{user}.json"))
    }

    fn load_ledger(&self, user: &str) -> Ledger {
        fs::read_to_string(self.ledger_path(user))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    /// Decide whether the probe may be committed for this user today.
    pub fn evaluate(
        &self,
        gallery: &Gallery,
        probe: &Embedding,
        settings: &AdaptiveSettings,
        password_confirmed: bool,
        today: NaiveDate,
    ) -> Result<(), AdaptSkip> {
        let ledger = self.load_ledger(&gallery.user);

        if ledger.count_for(today) >= settings.limit_per_day {
            return Err(AdaptSkip::DailyBudget);
        }

        if ledger.total_commits < settings.initial_require_password && !password_confirmed {
            return Err(AdaptSkip::PasswordRequired);
        }

        let distances: Vec<f32> = gallery
            .embeddings
            .iter()
            .map(|e| probe.distance(e))
            .collect();
        let Some(min_dist) = distances.iter().copied().reduce(f32::min) else {
            return Err(AdaptSkip::EmptyGallery);
        };
        let max_dist = distances.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        // Every existing embedding is already this close: nothing to learn.
        if max_dist < settings.min_diversity {
            return Err(AdaptSkip::Redundant);
        }
        // Even the nearest enrolled embedding is far away: do not let a
        // borderline identity creep into the gallery.
        if min_dist > settings.max_distance {
            return Err(AdaptSkip::Divergent);
        }

        Ok(())
    }

    /// Record a committed adaptation in the user's daily ledger.
    pub fn record_commit(&self, user: &str, today: NaiveDate) -> Result<(), AdaptiveError> {
        let mut ledger = self.load_ledger(user);
        if ledger.last_date == Some(today) {
            ledger.today_count += 1;
        } else {
            ledger.last_date = Some(today);
            ledger.today_count = 1;
        }
        ledger.total_commits += 1;

        let path = self.ledger_path(user);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&ledger)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Total commits ever recorded for a user.
    pub fn total_commits(&self, user: &str) -> u32 {
        self.load_ledger(user).total_commits
    }
}
