//! Authentication audit trail.
//!
//! Security events land in per-day files `sentinel-YYYY-MM-DD.log`, one
//! pipe-separated record per event, independent of the tracing output.
//! Old files are removed FIFO after the retention window.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::warn;

/// One security event for the audit file.
#[derive(Debug, Default)]
pub struct AuditRecord<'a> {
    pub status: &'a str,
    pub message: &'a str,
    pub user: Option<&'a str>,
    pub distance: Option<f32>,
    pub tier: Option<&'a str>,
    pub retries: u32,
    pub duration_secs: f64,
}

pub struct AuditLog {
    log_dir: PathBuf,
}

impl AuditLog {
    /// Open the audit log directory and prune files past retention.
    pub fn open(log_dir: &Path, retention_days: u32) -> std::io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        cleanup_old_logs(log_dir, retention_days);
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
        })
    }

    fn current_file(&self) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d");
        self.log_dir.join(format!("sentinel-{date}.log"))
    }

    /// Append one record. Audit failures are logged but never fail the
    /// session that produced them.
    pub fn record(&self, record: &AuditRecord<'_>) {
        let timestamp = Utc::now().to_rfc3339();
        let user = record.user.unwrap_or("Unknown");
        let dist = record
            .distance
            .map(|d| format!("{d:.3}"))
            .unwrap_or_else(|| "-".to_string());
        let tier = record.tier.unwrap_or("-");

        let line = format!(
            "{timestamp} | {status} | {message} | User={user} Dist={dist} Tier={tier} Retries={retries} Duration={duration:.1}s\n",
            status = record.status,
            message = record.message,
            retries = record.retries,
            duration = record.duration_secs,
        );

        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_file())
            .and_then(|mut f| f.write_all(line.as_bytes()));

        if let Err(e) = result {
            warn!(error = %e, "failed to append audit record");
        }
    }
}

/// Delete `sentinel-*.log` files whose modification time is older than the
/// retention window.
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };
    let cutoff = Duration::from_secs(u64::from(retention_days) * 86_400);
    let now = SystemTime::now();

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("sentinel-") || !name.ends_with(".log") {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if now.duration_since(modified).map(|age| age > cutoff).unwrap_or(false) {
            match fs::remove_file(entry.path()) {
                Ok(()) => tracing::info!(file = %name, "removed expired audit log"),
                Err(e) => warn!(file = %name, error = %e, "failed to remove expired audit log"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_appends_line() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(dir.path(), 30).unwrap();

        log.record(&AuditRecord {
            status: "SUCCESS",
            message: "Access granted",
            user: Some("alex"),
            distance: Some(0.213),
            tier: Some("GOLDEN"),
            retries: 0,
            duration_secs: 3.2,
        });
        log.record(&AuditRecord {
            status: "WARNING",
            message: "Spoof detected",
            ..AuditRecord::default()
        });

        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        let content = fs::read_to_string(files[0].path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("SUCCESS"));
        assert!(lines[0].contains("User=alex"));
        assert!(lines[0].contains("Dist=0.213"));
        assert!(lines[0].contains("Tier=GOLDEN"));
        assert!(lines[1].contains("User=Unknown"));
    }

    #[test]
    fn test_cleanup_removes_stale_files() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("sentinel-2020-01-01.log");
        fs::write(&stale, "old\n").unwrap();
        // Backdate well past retention
        let old = SystemTime::now() - Duration::from_secs(45 * 86_400);
        let times = fs::File::options()
            .append(true)
            .open(&stale)
            .unwrap();
        times.set_modified(old).unwrap();

        let fresh = dir.path().join("sentinel-2026-08-01.log");
        fs::write(&fresh, "new\n").unwrap();

        let unrelated = dir.path().join("notes.txt");
        fs::write(&unrelated, "keep\n").unwrap();

        AuditLog::open(dir.path(), 30).unwrap();

        assert!(!stale.exists(), "stale audit log removed");
        assert!(fresh.exists(), "fresh audit log kept");
        assert!(unrelated.exists(), "unrelated files untouched");
    }
}
