//! Claim markers on the shared filesystem.
//!
//! A claim is a small JSON file `<claim_dir>/<identity>.claim`. Creating it
//! with `create_new` is the only linearization point between workers: the
//! first creator owns the file until it deletes the marker. Markers are never
//! rewritten in place.
//!
//! Exclusive create is only as atomic as the mount underneath it. Some network
//! filesystems relax it, so after writing we read the marker back and report a
//! foreign session as an inconsistency instead of proceeding.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;
use crate::naming;

/// Extension of claim marker files
pub const CLAIM_EXTENSION: &str = "claim";

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("claim IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("claim marker for {identity} is inconsistent: {detail}")]
    Inconsistent { identity: String, detail: String },

    #[error("failed to encode claim record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Stable key for a file: sha256 of its normalized absolute path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity(String);

impl FileIdentity {
    pub fn from_path(path: &Path) -> Self {
        let normalized = naming::normalize_path(path);
        let digest = Sha256::digest(normalized.to_string_lossy().as_bytes());
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Marker file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// Machine that created the marker
    pub owner: String,
    /// Worker process that created the marker
    pub session: Uuid,
    /// Claimed file, for operators reading the claims directory
    pub path: PathBuf,
    pub acquired_at: DateTime<Utc>,
}

/// One marker found in the claims directory
#[derive(Debug, Clone)]
pub struct ClaimListing {
    pub marker: PathBuf,
    /// `None` when the marker is empty or unparseable
    pub record: Option<ClaimRecord>,
    pub modified: DateTime<Utc>,
}

impl ClaimListing {
    /// Time the claim counts as taken: the recorded timestamp, or the marker's
    /// mtime when the record is unreadable
    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.record
            .as_ref()
            .map(|r| r.acquired_at)
            .unwrap_or(self.modified)
    }

    pub fn owner(&self) -> &str {
        self.record.as_ref().map(|r| r.owner.as_str()).unwrap_or("unknown")
    }
}

/// Creates, releases and sweeps claim markers for one worker process
#[derive(Debug)]
pub struct ClaimManager {
    dir: PathBuf,
    owner: String,
    session: Uuid,
    held: Mutex<HashSet<FileIdentity>>,
}

impl ClaimManager {
    /// Open (creating if needed) the claims directory for a worker
    pub fn new(dir: impl Into<PathBuf>, owner: impl Into<String>) -> Result<Self, ClaimError> {
        let manager = Self::open(dir, owner);
        fs::create_dir_all(&manager.dir)?;
        Ok(manager)
    }

    /// Open the claims directory without touching the filesystem. For
    /// read-only callers; a missing directory lists as empty.
    pub fn open(dir: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            owner: owner.into(),
            session: Uuid::new_v4(),
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    fn marker_path(&self, identity: &FileIdentity) -> PathBuf {
        self.dir.join(format!("{}.{}", identity, CLAIM_EXTENSION))
    }

    /// True if any worker currently holds a marker for `identity`
    pub fn is_claimed(&self, identity: &FileIdentity) -> bool {
        self.marker_path(identity).exists()
    }

    /// Try to take the claim. `Ok(false)` means another worker holds it.
    pub fn acquire(&self, identity: &FileIdentity, path: &Path) -> Result<bool, ClaimError> {
        let marker = self.marker_path(identity);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Claim for {} already held", path.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let record = ClaimRecord {
            owner: self.owner.clone(),
            session: self.session,
            path: path.to_path_buf(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&record)?;

        if let Err(e) = file.write_all(&body).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&marker);
            return Err(e.into());
        }
        drop(file);

        verify_marker(&marker, identity, self.session)?;

        if let Ok(mut held) = self.held.lock() {
            held.insert(identity.clone());
        }
        debug!("Claimed {} as {}", path.display(), identity);
        Ok(true)
    }

    /// Delete the marker. Releasing an absent claim is a no-op.
    pub fn release(&self, identity: &FileIdentity) -> Result<(), ClaimError> {
        let marker = self.marker_path(identity);

        if let Ok(mut held) = self.held.lock() {
            held.remove(identity);
        }

        if let Some(record) = read_record(&marker) {
            if record.session != self.session {
                warn!(
                    "Releasing claim {} owned by {} (session {})",
                    identity, record.owner, record.session
                );
            }
        }

        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        verify_removed(&marker, identity)
    }

    /// Release every claim this worker still holds. Returns how many markers
    /// were removed.
    pub fn release_held(&self) -> usize {
        let held: Vec<FileIdentity> = match self.held.lock() {
            Ok(mut held) => held.drain().collect(),
            Err(_) => return 0,
        };

        let mut released = 0;
        for identity in held {
            match self.release(&identity) {
                Ok(()) => released += 1,
                Err(e) => error!("Failed to release claim {}: {}", identity, e),
            }
        }
        released
    }

    /// All markers in the claims directory
    pub fn list(&self) -> Result<Vec<ClaimListing>, ClaimError> {
        let mut listings = Vec::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(listings),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let marker = entry.path();
            if marker.extension().and_then(|e| e.to_str()) != Some(CLAIM_EXTENSION) {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => DateTime::<Utc>::from(t),
                // Removed between read_dir and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            listings.push(ClaimListing {
                record: read_record(&marker),
                marker,
                modified,
            });
        }

        listings.sort_by(|a, b| a.marker.cmp(&b.marker));
        Ok(listings)
    }

    /// Markers older than `max_age`, regardless of owner
    pub fn stale(&self, max_age: chrono::Duration) -> Result<Vec<ClaimListing>, ClaimError> {
        let cutoff = Utc::now() - max_age;
        Ok(self
            .list()?
            .into_iter()
            .filter(|l| l.claimed_at() < cutoff)
            .collect())
    }

    /// Delete markers older than `max_age`. Returns the number removed.
    pub fn recover_stale(&self, max_age: chrono::Duration) -> Result<usize, ClaimError> {
        let mut removed = 0;

        for listing in self.stale(max_age)? {
            match fs::remove_file(&listing.marker) {
                Ok(()) => {
                    removed += 1;
                    info!(
                        "Removed stale claim {} (owner {}, claimed {})",
                        listing.marker.display(),
                        listing.owner(),
                        listing.claimed_at().to_rfc3339()
                    );
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(removed)
    }
}

fn read_record(marker: &Path) -> Option<ClaimRecord> {
    let content = fs::read_to_string(marker).ok()?;
    serde_json::from_str(&content).ok()
}

/// Read back a freshly created marker. Anything but our own session means the
/// exclusive create did not hold.
fn verify_marker(marker: &Path, identity: &FileIdentity, session: Uuid) -> Result<(), ClaimError> {
    let detail = match read_record(marker) {
        Some(found) if found.session == session => return Ok(()),
        Some(other) => format!(
            "marker belongs to session {} on {} after exclusive create",
            other.session, other.owner
        ),
        None => "marker unreadable after exclusive create".to_string(),
    };
    error!(
        "Filesystem inconsistency on claim {} ({}): {}",
        identity,
        marker.display(),
        detail
    );
    Err(ClaimError::Inconsistent {
        identity: identity.to_string(),
        detail,
    })
}

fn verify_removed(marker: &Path, identity: &FileIdentity) -> Result<(), ClaimError> {
    if !marker.exists() {
        return Ok(());
    }
    error!("Claim marker {} still present after removal", marker.display());
    Err(ClaimError::Inconsistent {
        identity: identity.to_string(),
        detail: "marker still present after removal".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write_marker(dir: &Path, name: &str, acquired_at: DateTime<Utc>) {
        let record = ClaimRecord {
            owner: "other-host".to_string(),
            session: Uuid::new_v4(),
            path: PathBuf::from(format!("/share/{}.mp4", name)),
            acquired_at,
        };
        fs::write(
            dir.join(format!("{}.{}", name, CLAIM_EXTENSION)),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_identity_is_stable_hex() {
        let a = FileIdentity::from_path(Path::new("/share/videos/a.mp4"));
        let b = FileIdentity::from_path(Path::new("/share/videos/./x/../a.mp4"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, FileIdentity::from_path(Path::new("/share/videos/b.mp4")));
    }

    #[test]
    fn test_acquire_then_conflict_then_release() {
        let dir = TempDir::new().unwrap();
        let a = ClaimManager::new(dir.path(), "host-a").unwrap();
        let b = ClaimManager::new(dir.path(), "host-b").unwrap();
        let path = Path::new("/share/a.mp4");
        let id = FileIdentity::from_path(path);

        assert!(a.acquire(&id, path).unwrap());
        assert!(!b.acquire(&id, path).unwrap());
        assert!(!a.acquire(&id, path).unwrap());
        assert!(b.is_claimed(&id));

        let listed = a.list().unwrap();
        assert_eq!(listed.len(), 1);
        let record = listed[0].record.as_ref().unwrap();
        assert_eq!(record.owner, "host-a");
        assert_eq!(record.session, a.session());
        assert_eq!(record.path, path);

        a.release(&id).unwrap();
        assert!(!a.is_claimed(&id));
        assert!(b.acquire(&id, path).unwrap());
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let path = PathBuf::from("/share/contended.mp4");
        let id = FileIdentity::from_path(&path);
        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                let dir = dir.path().to_path_buf();
                let path = path.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    let manager = ClaimManager::new(dir, format!("host-{}", i)).unwrap();
                    barrier.wait();
                    manager.acquire(&id, &path).unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_release_twice_is_noop() {
        let dir = TempDir::new().unwrap();
        let manager = ClaimManager::new(dir.path(), "host").unwrap();
        let path = Path::new("/share/a.mp4");
        let id = FileIdentity::from_path(path);

        assert!(manager.acquire(&id, path).unwrap());
        manager.release(&id).unwrap();
        manager.release(&id).unwrap();
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_release_foreign_marker_still_deletes() {
        let dir = TempDir::new().unwrap();
        let owner = ClaimManager::new(dir.path(), "host-a").unwrap();
        let other = ClaimManager::new(dir.path(), "host-b").unwrap();
        let path = Path::new("/share/a.mp4");
        let id = FileIdentity::from_path(path);

        assert!(owner.acquire(&id, path).unwrap());
        other.release(&id).unwrap();
        assert!(!owner.is_claimed(&id));
    }

    #[test]
    fn test_recover_stale_uses_recorded_age() {
        let dir = TempDir::new().unwrap();
        let manager = ClaimManager::new(dir.path(), "host").unwrap();
        write_marker(dir.path(), "old", Utc::now() - chrono::Duration::hours(25));
        write_marker(dir.path(), "young", Utc::now() - chrono::Duration::hours(1));

        let stale = manager.stale(chrono::Duration::hours(24)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(manager.list().unwrap().len(), 2);

        assert_eq!(manager.recover_stale(chrono::Duration::hours(24)).unwrap(), 1);
        let left = manager.list().unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].marker.ends_with("young.claim"));
    }

    #[test]
    fn test_recover_stale_falls_back_to_mtime_for_corrupt_markers() {
        let dir = TempDir::new().unwrap();
        let manager = ClaimManager::new(dir.path(), "host").unwrap();

        let old = dir.path().join("corrupt-old.claim");
        fs::write(&old, b"{not json").unwrap();
        let file = fs::File::options().write(true).open(&old).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(25 * 3600)).unwrap();
        drop(file);

        // An empty marker is what a half-written claim looks like
        let young = dir.path().join("empty-young.claim");
        fs::write(&young, b"").unwrap();

        assert_eq!(manager.recover_stale(chrono::Duration::hours(24)).unwrap(), 1);
        assert!(!old.exists());
        assert!(young.exists());
    }

    #[test]
    fn test_list_ignores_other_files() {
        let dir = TempDir::new().unwrap();
        let manager = ClaimManager::new(dir.path(), "host").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_release_held_clears_everything_this_worker_holds() {
        let dir = TempDir::new().unwrap();
        let manager = ClaimManager::new(dir.path(), "host").unwrap();
        let other = ClaimManager::new(dir.path(), "host-b").unwrap();

        for name in ["a", "b"] {
            let path = PathBuf::from(format!("/share/{}.mp4", name));
            assert!(manager.acquire(&FileIdentity::from_path(&path), &path).unwrap());
        }
        let foreign = PathBuf::from("/share/c.mp4");
        assert!(other.acquire(&FileIdentity::from_path(&foreign), &foreign).unwrap());

        assert_eq!(manager.release_held(), 2);
        assert_eq!(manager.list().unwrap().len(), 1);
        assert_eq!(manager.release_held(), 0);
    }

    #[test]
    fn test_verify_marker_accepts_own_session() {
        let dir = TempDir::new().unwrap();
        let manager = ClaimManager::new(dir.path(), "host").unwrap();
        let path = Path::new("/share/a.mp4");
        let id = FileIdentity::from_path(path);

        assert!(manager.acquire(&id, path).unwrap());
        assert!(verify_marker(&manager.marker_path(&id), &id, manager.session()).is_ok());
    }

    #[test]
    fn test_verify_marker_rejects_foreign_session() {
        let dir = TempDir::new().unwrap();
        let id = FileIdentity::from_path(Path::new("/share/a.mp4"));
        write_marker(dir.path(), id.as_str(), Utc::now());
        let marker = dir.path().join(format!("{}.{}", id, CLAIM_EXTENSION));

        match verify_marker(&marker, &id, Uuid::new_v4()) {
            Err(ClaimError::Inconsistent { identity, detail }) => {
                assert_eq!(identity, id.as_str());
                assert!(detail.contains("other-host"));
            }
            other => panic!("expected inconsistency, got {:?}", other),
        }
        // Never cleaned up behind the other worker's back
        assert!(marker.exists());
    }

    #[test]
    fn test_verify_marker_rejects_empty_marker() {
        let dir = TempDir::new().unwrap();
        let id = FileIdentity::from_path(Path::new("/share/a.mp4"));
        let marker = dir.path().join(format!("{}.{}", id, CLAIM_EXTENSION));
        fs::write(&marker, b"").unwrap();

        assert!(matches!(
            verify_marker(&marker, &id, Uuid::new_v4()),
            Err(ClaimError::Inconsistent { .. })
        ));
    }

    #[test]
    fn test_verify_removed_reports_surviving_marker() {
        let dir = TempDir::new().unwrap();
        let id = FileIdentity::from_path(Path::new("/share/a.mp4"));
        let marker = dir.path().join(format!("{}.{}", id, CLAIM_EXTENSION));

        assert!(verify_removed(&marker, &id).is_ok());
        fs::write(&marker, b"{}").unwrap();
        match verify_removed(&marker, &id) {
            Err(ClaimError::Inconsistent { detail, .. }) => {
                assert!(detail.contains("still present"));
            }
            other => panic!("expected inconsistency, got {:?}", other),
        }
    }

    #[test]
    fn test_open_does_not_create_missing_dir() {
        let dir = TempDir::new().unwrap();
        let claims = dir.path().join(".compress_claims");
        let manager = ClaimManager::open(&claims, "host");

        assert!(manager.list().unwrap().is_empty());
        assert!(manager.stale(chrono::Duration::hours(24)).unwrap().is_empty());
        assert!(!manager.is_claimed(&FileIdentity::from_path(Path::new("/share/a.mp4"))));
        assert!(!claims.exists());
    }
}
