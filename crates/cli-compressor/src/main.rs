use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use compressor::{
    claim::{ClaimManager, FileIdentity},
    classifier::{self, FileState},
    config::CompressConfig,
    coordinator::{Coordinator, MigrateOutcome, Outcome, RunStats},
    encode::FfmpegEncoder,
    ffprobe::FfprobeTool,
    naming,
    scan::{self, FileRecord},
};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Shared-library video compressor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Claims directory (must be shared by every worker)
    #[arg(long, global = true)]
    claim_dir: Option<PathBuf>,

    /// Archive root for replaced originals
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress eligible videos under the given directories
    Run {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Stop after working on this many files
        #[arg(long)]
        batch: Option<usize>,

        /// Decide only; no claims, encodes, renames or tags
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Delete claim markers older than the stale threshold first
        #[arg(long)]
        recover_stale: bool,
    },
    /// Count files by state and list active claims
    Status {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },
    /// Rename legacy-tagged files to carry the `_compressed` suffix
    Migrate {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        #[arg(short = 'n', long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins unless --verbose asks for debug
    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(log::LevelFilter::Info);
    }
    logger.format_timestamp_secs().init();

    let mut cfg = CompressConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(dir) = args.claim_dir {
        cfg.claim_dir = Some(dir);
    }
    if let Some(dir) = args.backup_dir {
        cfg.backup_dir = Some(dir);
    }

    match args.command {
        Command::Run { dirs, batch, dry_run, recover_stale } => {
            cmd_run(&cfg, roots(&dirs)?, batch, dry_run, recover_stale).await
        }
        Command::Status { dirs } => cmd_status(&cfg, roots(&dirs)?).await,
        Command::Migrate { dirs, dry_run } => cmd_migrate(&cfg, roots(&dirs)?, dry_run).await,
    }
}

/// Normalize the given directories, failing on anything that is not one
fn roots(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut roots = Vec::with_capacity(dirs.len());
    for dir in dirs {
        if !dir.is_dir() {
            bail!("{} is not a directory", dir.display());
        }
        roots.push(naming::normalize_path(dir));
    }
    Ok(roots)
}

/// Open the shared claims directory. Read-only callers (dry runs, status)
/// never create it.
fn open_claims(cfg: &CompressConfig, read_only: bool) -> Result<ClaimManager> {
    let dir = cfg.resolve_claim_dir()?;
    let owner = cfg.resolve_owner();
    let claims = if read_only {
        ClaimManager::open(&dir, &owner)
    } else {
        ClaimManager::new(&dir, &owner)
            .with_context(|| format!("Failed to open claims directory: {}", dir.display()))?
    };
    info!("Worker {} (session {}) using claims in {}", owner, claims.session(), dir.display());
    Ok(claims)
}

async fn scan_candidates(cfg: &CompressConfig, roots: &[PathBuf]) -> Result<Vec<FileRecord>> {
    let records = tokio::task::spawn_blocking({
        let roots = roots.to_vec();
        let cfg = cfg.clone();
        move || scan::candidates(scan::scan_roots(&roots, &cfg))
    })
    .await
    .context("Scan task failed")?;
    let total: u64 = records.iter().map(|r| r.size_bytes).sum();
    info!("Found {} video files ({})", records.len(), format_size(total, DECIMAL));
    Ok(records)
}

async fn cmd_run(
    cfg: &CompressConfig,
    roots: Vec<PathBuf>,
    batch: Option<usize>,
    dry_run: bool,
    recover_stale: bool,
) -> Result<()> {
    let started = Utc::now();
    let claims = open_claims(cfg, dry_run)?;
    let backup_root = cfg.resolve_backup_dir()?;

    if recover_stale {
        let age = cfg.stale_claim_age()?;
        if dry_run {
            for stale in claims.stale(age).context("Failed to list claims")? {
                info!(
                    "Would remove stale claim {} (owner {}, claimed {})",
                    stale.marker.display(),
                    stale.owner(),
                    stale.claimed_at().to_rfc3339()
                );
            }
        } else {
            let removed = claims.recover_stale(age).context("Failed to recover stale claims")?;
            info!("Removed {} stale claim(s) older than {}h", removed, cfg.stale_claim_hours);
        }
    }

    let cleaned = scan::cleanup_orphaned_temp_files(&roots, &claims, dry_run);
    if cleaned > 0 {
        info!("Cleaned {} orphaned temp file(s)", cleaned);
    }

    let records = scan_candidates(cfg, &roots).await?;

    let tool = FfprobeTool::new(cfg);
    let coordinator = Coordinator::new(
        cfg,
        &claims,
        backup_root,
        tool.clone(),
        FfmpegEncoder::new(cfg),
        tool,
    )
    .with_dry_run(dry_run);

    let mut stats = RunStats::default();
    let interrupted = tokio::select! {
        _ = run_batch(&coordinator, &records, batch, &mut stats) => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        warn!("Interrupted, releasing held claims");
        let released = claims.release_held();
        info!("Released {} claim(s)", released);
    }

    print_summary(&stats, Utc::now() - started, dry_run);
    Ok(())
}

async fn run_batch<P, E, T>(
    coordinator: &Coordinator<'_, P, E, T>,
    records: &[FileRecord],
    batch: Option<usize>,
    stats: &mut RunStats,
) where
    P: compressor::Prober,
    E: compressor::Encoder,
    T: compressor::TagStore,
{
    let mut attempted = 0usize;

    for (i, record) in records.iter().enumerate() {
        if batch.map_or(false, |limit| attempted >= limit) {
            info!("Batch limit of {} reached", attempted);
            break;
        }

        debug!("[{}/{}] {}", i + 1, records.len(), record.path.display());
        let outcome = coordinator.process(record).await;
        log_outcome(record, &outcome);
        stats.record(&outcome);

        if outcome.attempted() || matches!(outcome, Outcome::Planned(_)) {
            attempted += 1;
            if outcome.attempted() {
                info!(
                    "Running: {} encoded, {} remuxed, {} skipped, {} no-savings, {} failed | saved {}",
                    stats.encoded,
                    stats.remuxed,
                    stats.skipped,
                    stats.no_savings,
                    stats.failed,
                    format_size(stats.bytes_saved, DECIMAL)
                );
            }
        }
    }
}

fn log_outcome(record: &FileRecord, outcome: &Outcome) {
    let path = record.path.display();
    match outcome {
        Outcome::AlreadyCompressed | Outcome::AlreadySkipped => debug!("{}: already done", path),
        Outcome::ClaimedElsewhere => debug!("{}: claimed by another worker", path),
        Outcome::Vanished => info!("{}: vanished", path),
        Outcome::Planned(d) => {
            let cap = d.max_height.map(|h| format!(" [cap {}p]", h)).unwrap_or_default();
            let gate = if d.savings_gate { " [size-gate]" } else { "" };
            let quality = d.quality.map(|q| format!(" q{}", q)).unwrap_or_default();
            info!(
                "{:<16}{}{}{} {:>10}  {}  ({})",
                d.action.to_string(),
                quality,
                cap,
                gate,
                format_size(record.size_bytes, DECIMAL),
                path,
                d.reason
            );
        }
        Outcome::SkippedByPolicy { skip_path } => info!("{}: skipped -> {}", path, skip_path.display()),
        Outcome::Committed { final_path, input_bytes, output_bytes, .. } => info!(
            "✅ {} -> {} ({} -> {})",
            path,
            final_path.display(),
            format_size(*input_bytes, DECIMAL),
            format_size(*output_bytes, DECIMAL)
        ),
        Outcome::RolledBack { savings_pct, .. } => {
            info!("{}: no savings ({:.1}%), marked skip", path, savings_pct)
        }
        Outcome::Failed { error, .. } => error!("❌ {}: {}", path, error),
    }
}

fn print_summary(stats: &RunStats, elapsed: chrono::Duration, dry_run: bool) {
    info!("{}", "=".repeat(60));
    if dry_run {
        info!("DRY RUN COMPLETE (no changes made)");
        info!("  Planned:         {}", stats.planned);
    } else {
        info!("RUN COMPLETE");
        info!("  Encoded:         {}", stats.encoded);
        info!("  Remuxed:         {}", stats.remuxed);
        info!("  Skipped:         {}", stats.skipped);
        info!("  No savings:      {}", stats.no_savings);
    }
    info!("  Failed:          {}", stats.failed);
    info!("  Already claimed: {}", stats.already_claimed);
    info!("  Already done:    {}", stats.already_done);
    if !dry_run {
        info!("  Total saved:     {}", format_size(stats.bytes_saved, DECIMAL));
    }
    info!("  Elapsed:         {}", format_duration(elapsed));
}

/// Helper function to format duration for logging
fn format_duration(d: chrono::Duration) -> String {
    let hours = d.num_hours();
    let minutes = d.num_minutes() % 60;
    let seconds = d.num_seconds() % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}

#[derive(Default)]
struct StateTally {
    count: usize,
    bytes: u64,
}

impl StateTally {
    fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
    }
}

async fn cmd_status(cfg: &CompressConfig, roots: Vec<PathBuf>) -> Result<()> {
    let claims = open_claims(cfg, true)?;
    let records = scan_candidates(cfg, &roots).await?;
    let tool = FfprobeTool::new(cfg);

    let mut compressed = StateTally::default();
    let mut skipped = StateTally::default();
    let mut legacy = StateTally::default();
    let mut remaining = StateTally::default();
    let mut in_progress = StateTally::default();
    let mut unreadable = 0usize;

    for record in &records {
        if classifier::classify_name(&record.path, cfg) == Some(FileState::Skipped) {
            skipped.add(record.size_bytes);
            continue;
        }
        if claims.is_claimed(&FileIdentity::from_path(&record.path)) {
            in_progress.add(record.size_bytes);
            continue;
        }
        match classifier::resolve(&record.path, &tool, cfg).await {
            Ok(FileState::Compressed) => compressed.add(record.size_bytes),
            Ok(FileState::LegacyCompressed) => legacy.add(record.size_bytes),
            Ok(FileState::Untouched) => remaining.add(record.size_bytes),
            Ok(FileState::Skipped) => skipped.add(record.size_bytes),
            Err(e) => {
                warn!("Failed to read tags of {}: {}", record.path.display(), e);
                unreadable += 1;
            }
        }
    }

    info!("Video files: {}", records.len());
    for (label, tally) in [
        ("Compressed:", &compressed),
        ("Skipped:", &skipped),
        ("Legacy:", &legacy),
        ("In progress:", &in_progress),
        ("Remaining:", &remaining),
    ] {
        info!("  {:<13}{:>6}  ({})", label, tally.count, format_size(tally.bytes, DECIMAL));
    }
    if unreadable > 0 {
        info!("  {:<13}{:>6}", "Unreadable:", unreadable);
    }

    let active = claims.list().context("Failed to list claims")?;
    if !active.is_empty() {
        info!("Active claims: {}", active.len());
        let mut by_owner: BTreeMap<String, usize> = BTreeMap::new();
        for claim in &active {
            *by_owner.entry(claim.owner().to_string()).or_default() += 1;
        }
        for (owner, count) in by_owner {
            info!("  {}: {} file(s)", owner, count);
        }
    }

    Ok(())
}

async fn cmd_migrate(cfg: &CompressConfig, roots: Vec<PathBuf>, dry_run: bool) -> Result<()> {
    let claims = open_claims(cfg, dry_run)?;
    let backup_root = cfg.resolve_backup_dir()?;
    let records = scan_candidates(cfg, &roots).await?;

    let tool = FfprobeTool::new(cfg);
    let coordinator = Coordinator::new(
        cfg,
        &claims,
        backup_root,
        tool.clone(),
        FfmpegEncoder::new(cfg),
        tool,
    )
    .with_dry_run(dry_run);

    let mut found = 0usize;
    let mut renamed = 0usize;
    let mut errors = 0usize;

    for record in records.iter().filter(|r| r.container == cfg.target_container) {
        match coordinator.migrate(record).await {
            MigrateOutcome::Untouched => {}
            MigrateOutcome::ClaimedElsewhere => {
                found += 1;
                debug!("{}: claimed by another worker", record.path.display());
            }
            MigrateOutcome::Planned(target) => {
                found += 1;
                info!("Would rename: {} -> {}", record.path.display(), target.display());
            }
            MigrateOutcome::Renamed(_) => {
                found += 1;
                renamed += 1;
            }
            MigrateOutcome::Conflict(_) | MigrateOutcome::Failed(_) => {
                found += 1;
                errors += 1;
            }
        }
    }

    info!("Migrate: {} legacy-tagged file(s) found", found);
    if dry_run {
        info!("(dry run, no changes made)");
    } else {
        info!("  Renamed: {}", renamed);
        if errors > 0 {
            info!("  Errors:  {}", errors);
        }
    }

    Ok(())
}
