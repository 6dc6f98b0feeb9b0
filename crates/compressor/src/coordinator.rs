//! Per-file lifecycle: claim, decide, encode, evaluate, commit or roll back,
//! release.
//!
//! Every mutation of a library file happens while this worker holds the
//! file's claim, and the claim is released on every return path. If the
//! future is dropped mid-flight (Ctrl-C), `ClaimManager::release_held` cleans
//! up instead; a hard kill leaves the marker for the stale sweep.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use log::{debug, error, info, warn};
use thiserror::Error;
use crate::claim::{ClaimManager, FileIdentity};
use crate::classifier::{self, FileState};
use crate::config::CompressConfig;
use crate::decision::{self, Action, Decision, Policy, SavingsGateResult};
use crate::encode::{self, EncodeMode, EncodeRequest, Encoder};
use crate::ffprobe::{ProbeError, Prober, TagStore};
use crate::naming;
use crate::scan::FileRecord;

/// Errors from the rename/archive/tag steps of commit and rollback
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("failed to archive {path}: {source}")]
    Archive { path: PathBuf, source: std::io::Error },

    #[error("failed to move output into place at {path}: {source}")]
    Finalize { path: PathBuf, source: std::io::Error },

    #[error("failed to rename {path}: {source}")]
    Rename { path: PathBuf, source: std::io::Error },

    #[error("failed to tag {path}: {source}")]
    Tag { path: PathBuf, source: ProbeError },
}

/// How processing one file ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    AlreadyCompressed,
    AlreadySkipped,
    /// Another worker holds the claim
    ClaimedElsewhere,
    /// The file disappeared before we could work on it
    Vanished,
    /// Dry run: what would have happened
    Planned(Decision),
    /// Decision said skip; renamed without encoding
    SkippedByPolicy { skip_path: PathBuf },
    Committed {
        action: Action,
        final_path: PathBuf,
        archived_path: PathBuf,
        input_bytes: u64,
        output_bytes: u64,
    },
    /// Savings gate rejected the output
    RolledBack { skip_path: PathBuf, savings_pct: f64 },
    /// `attempted` is false when the failure happened before the claim
    Failed { error: String, attempted: bool },
}

impl Outcome {
    /// True when this worker claimed the file and did work on it
    pub fn attempted(&self) -> bool {
        match self {
            Outcome::SkippedByPolicy { .. } | Outcome::Committed { .. } | Outcome::RolledBack { .. } => true,
            Outcome::Failed { attempted, .. } => *attempted,
            _ => false,
        }
    }
}

/// Result of renaming one legacy-tagged file
#[derive(Debug, Clone, PartialEq)]
pub enum MigrateOutcome {
    /// Not legacy-tagged, or already carries the suffix
    Untouched,
    ClaimedElsewhere,
    /// Dry run: the file would be renamed to this path
    Planned(PathBuf),
    Renamed(PathBuf),
    /// The target name is taken by another file
    Conflict(PathBuf),
    Failed(String),
}

/// Counters for a run summary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub encoded: usize,
    pub remuxed: usize,
    pub skipped: usize,
    pub no_savings: usize,
    pub failed: usize,
    pub already_claimed: usize,
    pub already_done: usize,
    pub vanished: usize,
    pub planned: usize,
    pub bytes_saved: u64,
}

impl RunStats {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::AlreadyCompressed | Outcome::AlreadySkipped => self.already_done += 1,
            Outcome::ClaimedElsewhere => self.already_claimed += 1,
            Outcome::Vanished => self.vanished += 1,
            Outcome::Planned(_) => self.planned += 1,
            Outcome::SkippedByPolicy { .. } => self.skipped += 1,
            Outcome::Committed { action, input_bytes, output_bytes, .. } => {
                if *action == Action::Remux {
                    self.remuxed += 1;
                } else {
                    self.encoded += 1;
                }
                self.bytes_saved += input_bytes.saturating_sub(*output_bytes);
            }
            Outcome::RolledBack { .. } => self.no_savings += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Rename, falling back to copy + delete across filesystems
pub fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    if let Err(e) = fs::remove_file(from) {
        let _ = fs::remove_file(to);
        return Err(e);
    }
    Ok(())
}

/// Drives files through the lifecycle for one worker
pub struct Coordinator<'a, P, E, T> {
    cfg: &'a CompressConfig,
    policy: Policy,
    claims: &'a ClaimManager,
    backup_root: PathBuf,
    prober: P,
    encoder: E,
    tags: T,
    dry_run: bool,
}

impl<'a, P: Prober, E: Encoder, T: TagStore> Coordinator<'a, P, E, T> {
    pub fn new(
        cfg: &'a CompressConfig,
        claims: &'a ClaimManager,
        backup_root: PathBuf,
        prober: P,
        encoder: E,
        tags: T,
    ) -> Self {
        Self {
            cfg,
            policy: Policy::from_config(cfg),
            claims,
            backup_root,
            prober,
            encoder,
            tags,
            dry_run: false,
        }
    }

    /// Stop after deciding; no claim, encode, rename or tag write
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Process one discovered file. Per-file failures are reported in the
    /// outcome, never raised.
    pub async fn process(&self, record: &FileRecord) -> Outcome {
        let path = &record.path;

        let state = match classifier::resolve(path, &self.tags, self.cfg).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to read tags of {}: {}", path.display(), e);
                return Outcome::Failed { error: e.to_string(), attempted: false };
            }
        };
        if let Some(done) = terminal_outcome(state) {
            return done;
        }

        if self.dry_run {
            return match self.prober.probe(path).await {
                Ok(media) => Outcome::Planned(decision::decide(&media, &self.policy)),
                Err(e) => {
                    warn!("Probe failed for {}: {}", path.display(), e);
                    Outcome::Failed { error: e.to_string(), attempted: false }
                }
            };
        }

        let identity = FileIdentity::from_path(path);
        match self.claims.acquire(&identity, path) {
            Ok(true) => {}
            Ok(false) => return Outcome::ClaimedElsewhere,
            Err(e) => {
                error!("Could not claim {}: {}", path.display(), e);
                return Outcome::Failed { error: e.to_string(), attempted: false };
            }
        }

        let outcome = self.process_claimed(path).await;

        if let Err(e) = self.claims.release(&identity) {
            error!("Failed to release claim on {}: {}", path.display(), e);
        }
        outcome
    }

    async fn process_claimed(&self, path: &Path) -> Outcome {
        // Another worker may have finished the file between scan and claim
        if !path.exists() {
            info!("{} vanished before processing", path.display());
            return Outcome::Vanished;
        }
        match classifier::resolve(path, &self.tags, self.cfg).await {
            Ok(state) => {
                if let Some(done) = terminal_outcome(state) {
                    return done;
                }
            }
            Err(e) => return failed(path, "tag read", e),
        }

        let media = match self.prober.probe(path).await {
            Ok(media) => media,
            Err(e) => return failed(path, "probe", e),
        };
        let decision = decision::decide(&media, &self.policy);
        info!("{}: {} ({})", path.display(), decision.action, decision.reason);

        if decision.action == Action::Skip {
            return match self.mark_skipped(path) {
                Ok(skip_path) => Outcome::SkippedByPolicy { skip_path },
                Err(e) => failed(path, "skip rename", e),
            };
        }

        let input_bytes = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => return failed(path, "stat", e),
        };

        let request = EncodeRequest {
            input: path.to_path_buf(),
            temp_output: naming::temp_output_path(path, &self.cfg.target_container),
            mode: if decision.action == Action::Remux {
                EncodeMode::Remux
            } else {
                EncodeMode::Transcode
            },
            target_container: self.cfg.target_container.clone(),
            max_height: decision.max_height,
            quality: decision.quality,
            tag: self.cfg.current_tag.clone(),
            source_width: media.width,
            source_height: media.height,
        };

        // A failed encode leaves its temp file for the next run's cleanup
        let output = match self.encoder.encode(&request).await {
            Ok(output) => output,
            Err(e) => return failed(path, "encode", e),
        };
        let output_bytes = match encode::check_output(&output) {
            Ok(bytes) => bytes,
            Err(e) => return failed(path, "output check", e),
        };

        if decision.savings_gate {
            match decision::check_savings_gate(input_bytes, output_bytes, self.cfg.min_savings_pct) {
                SavingsGateResult::Accept { savings_pct } => {
                    info!("{}: saves {:.1}%", path.display(), savings_pct);
                }
                SavingsGateResult::Reject { savings_pct } => {
                    info!(
                        "{}: saves only {:.1}% (need {:.1}%), rolling back",
                        path.display(),
                        savings_pct,
                        self.cfg.min_savings_pct
                    );
                    return self.roll_back(path, &output, savings_pct);
                }
            }
        }

        match self.commit(path, &output).await {
            Ok((final_path, archived_path)) => Outcome::Committed {
                action: decision.action,
                final_path,
                archived_path,
                input_bytes,
                output_bytes,
            },
            Err(e) => {
                error!("Commit failed for {}: {}", path.display(), e);
                Outcome::Failed { error: e.to_string(), attempted: true }
            }
        }
    }

    /// Archive the original, move the output into place, tag it
    async fn commit(&self, original: &Path, temp: &Path) -> Result<(PathBuf, PathBuf), CommitError> {
        let final_path = naming::final_output_path(original, self.cfg);
        let archived = naming::archive_path(&self.backup_root, original);

        if let Some(parent) = archived.parent() {
            fs::create_dir_all(parent).map_err(|source| CommitError::Archive {
                path: original.to_path_buf(),
                source,
            })?;
        }
        move_file(original, &archived).map_err(|source| CommitError::Archive {
            path: original.to_path_buf(),
            source,
        })?;
        debug!("Archived {} -> {}", original.display(), archived.display());

        if let Err(source) = move_file(temp, &final_path) {
            error!(
                "Failed to move {} to {}: {}; restoring original",
                temp.display(),
                final_path.display(),
                source
            );
            if let Err(e) = move_file(&archived, original) {
                error!(
                    "Could not restore {}: {}; original remains at {}",
                    original.display(),
                    e,
                    archived.display()
                );
            }
            return Err(CommitError::Finalize { path: final_path, source });
        }

        self.tags
            .write_tag(&final_path, &self.cfg.current_tag)
            .await
            .map_err(|source| CommitError::Tag { path: final_path.clone(), source })?;

        info!("Committed {} -> {}", original.display(), final_path.display());
        Ok((final_path, archived))
    }

    fn roll_back(&self, original: &Path, temp: &Path, savings_pct: f64) -> Outcome {
        match fs::remove_file(temp) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete temp output {}: {}", temp.display(), e),
        }

        match self.mark_skipped(original) {
            Ok(skip_path) => Outcome::RolledBack { skip_path, savings_pct },
            Err(e) => failed(original, "skip rename", e),
        }
    }

    fn mark_skipped(&self, path: &Path) -> Result<PathBuf, CommitError> {
        let skip_path = naming::skip_path(path, self.cfg);
        fs::rename(path, &skip_path).map_err(|source| CommitError::Rename {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Marked skipped: {}", skip_path.display());
        Ok(skip_path)
    }

    /// Rename a legacy-tagged file to carry the `_compressed` suffix
    pub async fn migrate(&self, record: &FileRecord) -> MigrateOutcome {
        let path = &record.path;
        if record.flags.compressed || record.flags.skip {
            return MigrateOutcome::Untouched;
        }

        match classifier::resolve(path, &self.tags, self.cfg).await {
            Ok(FileState::LegacyCompressed) => {}
            Ok(_) => return MigrateOutcome::Untouched,
            Err(e) => {
                warn!("Failed to read tags of {}: {}", path.display(), e);
                return MigrateOutcome::Failed(e.to_string());
            }
        }

        let target = naming::compressed_path(path, self.cfg);
        if self.dry_run {
            return MigrateOutcome::Planned(target);
        }
        if target.exists() {
            warn!("{} already exists, not migrating {}", target.display(), path.display());
            return MigrateOutcome::Conflict(target);
        }

        let identity = FileIdentity::from_path(path);
        match self.claims.acquire(&identity, path) {
            Ok(true) => {}
            Ok(false) => return MigrateOutcome::ClaimedElsewhere,
            Err(e) => return MigrateOutcome::Failed(e.to_string()),
        }

        let outcome = match fs::rename(path, &target) {
            Ok(()) => {
                info!("Renamed {} -> {}", path.display(), target.display());
                MigrateOutcome::Renamed(target)
            }
            Err(e) => {
                warn!("Failed to rename {}: {}", path.display(), e);
                MigrateOutcome::Failed(e.to_string())
            }
        };

        if let Err(e) = self.claims.release(&identity) {
            error!("Failed to release claim on {}: {}", path.display(), e);
        }
        outcome
    }
}

fn terminal_outcome(state: FileState) -> Option<Outcome> {
    match state {
        FileState::Compressed => Some(Outcome::AlreadyCompressed),
        FileState::Skipped => Some(Outcome::AlreadySkipped),
        FileState::Untouched | FileState::LegacyCompressed => None,
    }
}

fn failed(path: &Path, step: &str, e: impl std::fmt::Display) -> Outcome {
    warn!("{} failed for {}: {}", step, path.display(), e);
    Outcome::Failed { error: format!("{}: {}", step, e), attempted: true }
}
