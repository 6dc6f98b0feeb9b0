use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};
use crate::claim::{ClaimManager, FileIdentity};
use crate::config::CompressConfig;
use crate::naming::{self, NameFlags};
use log::{debug, error, info, warn};

/// Video file extensions considered by discovery
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpeg", "mpg",
];

/// One discovered video file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Lowercased extension
    pub container: String,
    pub flags: NameFlags,
}

impl FileRecord {
    /// Stat a single path into a record
    pub fn from_path(path: &Path, cfg: &CompressConfig) -> std::io::Result<Self> {
        let size_bytes = std::fs::metadata(path)?.len();
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes,
            container: naming::extension_of(path),
            flags: naming::name_flags(path, cfg),
        })
    }
}

/// Result of scanning a file
#[derive(Debug, Clone)]
pub enum ScanResult {
    /// File should be offered to the coordinator
    Candidate(FileRecord),
    /// File should be ignored (path, reason)
    Skipped(PathBuf, String),
}

pub fn is_video_file(path: &Path) -> bool {
    VIDEO_EXTENSIONS.contains(&naming::extension_of(path).as_str())
}

/// Hidden directories (claims, archive, tool caches) are never descended into
fn is_hidden_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_str().map_or(false, |n| n.starts_with('.'))
}

/// Walk every root and collect video files
pub fn scan_roots(roots: &[PathBuf], cfg: &CompressConfig) -> Vec<ScanResult> {
    let mut results = Vec::new();
    let mut files_checked = 0usize;

    for root in roots {
        if !root.exists() {
            warn!("Root does not exist: {}", root.display());
            continue;
        }

        info!("Scanning directory: {}", root.display());

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_hidden_dir(e));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !is_video_file(path) {
                continue;
            }

            files_checked += 1;
            if files_checked % 1000 == 0 {
                debug!("Checked {} video files so far...", files_checked);
            }

            let name = entry.file_name().to_string_lossy();
            if naming::is_temp_name(&name) {
                results.push(ScanResult::Skipped(
                    path.to_path_buf(),
                    "temp or hidden file".to_string(),
                ));
                continue;
            }

            match FileRecord::from_path(path, cfg) {
                Ok(record) => results.push(ScanResult::Candidate(record)),
                Err(e) => {
                    warn!("Failed to stat {}: {}", path.display(), e);
                    results.push(ScanResult::Skipped(path.to_path_buf(), e.to_string()));
                }
            }
        }
    }

    info!("Scan complete: {} video files, {} results", files_checked, results.len());
    results
}

/// Candidates from a scan, largest first
pub fn candidates(results: Vec<ScanResult>) -> Vec<FileRecord> {
    let mut records: Vec<FileRecord> = results
        .into_iter()
        .filter_map(|r| match r {
            ScanResult::Candidate(record) => Some(record),
            ScanResult::Skipped(..) => None,
        })
        .collect();
    sort_by_size_desc(&mut records);
    records
}

/// Largest first; ties broken by path so the order is deterministic
pub fn sort_by_size_desc(records: &mut [FileRecord]) {
    records.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then_with(|| a.path.cmp(&b.path)));
}

/// The one source a temp file was written for, if it is still next to it
fn source_for_temp(temp: &Path, source_name: &str) -> Option<PathBuf> {
    let source = temp.parent()?.join(source_name);
    if source.is_file() && is_video_file(&source) && !naming::is_temp_name(source_name) {
        Some(source)
    } else {
        None
    }
}

/// Delete temp outputs left behind by interrupted workers.
///
/// A temp file is removed only when its source still sits next to it and
/// nobody holds a claim on that source. A temp with no source may be the
/// only copy left by a crash mid-commit, so it is kept and reported.
pub fn cleanup_orphaned_temp_files(
    roots: &[PathBuf],
    claims: &ClaimManager,
    dry_run: bool,
) -> usize {
    info!("Checking for orphaned temp files...");
    let mut cleaned = 0;

    for root in roots {
        if !root.exists() {
            continue;
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_hidden_dir(e))
            .filter_map(|e| e.ok());

        for entry in walker {
            if !entry.file_type().is_file() {
                continue;
            }
            let temp = entry.path();
            let Some(source_name) = naming::source_name_of_temp(temp) else {
                continue;
            };

            let Some(source) = source_for_temp(temp, &source_name) else {
                error!(
                    "Temp file {} has no source next to it; keeping it for manual recovery",
                    temp.display()
                );
                continue;
            };

            if claims.is_claimed(&FileIdentity::from_path(&source)) {
                debug!("Temp file {} belongs to an active claim", temp.display());
                continue;
            }

            if dry_run {
                info!("Would remove orphaned temp file: {}", temp.display());
                cleaned += 1;
                continue;
            }

            match std::fs::remove_file(temp) {
                Ok(()) => {
                    info!("Removed orphaned temp file: {}", temp.display());
                    cleaned += 1;
                }
                Err(e) => warn!("Failed to remove temp file {}: {}", temp.display(), e),
            }
        }
    }

    cleaned
}
