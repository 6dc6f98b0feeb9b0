use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the shared-library compression workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressConfig {
    /// Directory holding claim markers. Must be on the shared filesystem and
    /// identical for every worker. Required; there is no root-derived default.
    pub claim_dir: Option<PathBuf>,
    /// Archive root that originals are moved to on commit.
    /// Defaults to `.orig_video_to_delete` next to the claims directory.
    pub backup_dir: Option<PathBuf>,
    /// Machine identifier stamped into claim markers (hostname when unset)
    pub owner_id: Option<String>,
    /// Age after which `--recover-stale` deletes a claim marker
    pub stale_claim_hours: u64,

    /// Container every eligible file converges to
    pub target_container: String,
    /// Video codec every eligible file converges to (ffprobe codec name)
    pub target_codec: String,
    /// Codecs that must be re-encoded for playback compatibility
    pub incompatible_codecs: Vec<String>,
    /// Metadata tag written into every committed output
    pub current_tag: String,
    /// Tags written by earlier pipeline generations
    pub legacy_tags: Vec<String>,
    /// Suffix appended to the stem of skipped files
    pub skip_suffix: String,
    /// Suffix appended to the stem of migrated legacy files
    pub compressed_suffix: String,

    /// Minimum size reduction (percent) for gated encodes
    pub min_savings_pct: f64,
    /// Target-codec files below this bitrate are skipped outright
    pub low_bitrate_bps: u64,
    /// Output height (or width, for portrait video) cap for 4K sources
    pub downscale_lines: u32,

    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// ffmpeg video encoder used for transcodes
    pub video_encoder: String,
    /// Encoder preset passed with `-preset`
    pub encoder_preset: String,
    /// AAC bitrate for transcoded audio
    pub audio_bitrate: String,
    /// Wall-clock limit for a single encode
    pub encode_timeout_secs: u64,
    /// Wall-clock limit for a single ffprobe call
    pub probe_timeout_secs: u64,
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl CompressConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            claim_dir: None,
            backup_dir: None,
            owner_id: None,
            stale_claim_hours: 24,
            target_container: "mp4".to_string(),
            target_codec: "h264".to_string(),
            incompatible_codecs: vec!["hevc".to_string(), "av1".to_string()],
            current_tag: "compressed_h264_v4".to_string(),
            legacy_tags: vec![
                "compressed_hevc_v2".to_string(),
                "compressed_hevc_v3".to_string(),
            ],
            skip_suffix: "_skip".to_string(),
            compressed_suffix: "_compressed".to_string(),
            min_savings_pct: 5.0,
            low_bitrate_bps: 500_000,
            downscale_lines: 1080,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            video_encoder: "libx264".to_string(),
            encoder_preset: "medium".to_string(),
            audio_bitrate: "128k".to_string(),
            encode_timeout_secs: 7200,
            probe_timeout_secs: 60,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                log::warn!("Config file {} not found, using defaults", config_path.display());
            }
        }

        config.apply_env_overrides();
        config.stale_claim_age()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// - VCOMPRESS_CLAIM_DIR -> claim_dir
    /// - VCOMPRESS_BACKUP_DIR -> backup_dir
    /// - VCOMPRESS_OWNER -> owner_id
    /// - VCOMPRESS_STALE_HOURS -> stale_claim_hours
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("VCOMPRESS_CLAIM_DIR") {
            if !val.is_empty() {
                self.claim_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = std::env::var("VCOMPRESS_BACKUP_DIR") {
            if !val.is_empty() {
                self.backup_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = std::env::var("VCOMPRESS_OWNER") {
            if !val.is_empty() {
                self.owner_id = Some(val);
            }
        }

        if let Ok(val) = std::env::var("VCOMPRESS_STALE_HOURS") {
            if let Ok(hours) = val.parse::<u64>() {
                self.stale_claim_hours = hours;
            }
        }
    }

    /// Claims directory shared by every worker.
    ///
    /// Never derived from the scanned roots: workers started on different or
    /// nested roots must still contend on the same markers.
    pub fn resolve_claim_dir(&self) -> Result<PathBuf> {
        self.claim_dir.clone().context(
            "claims directory is not set (claim_dir, VCOMPRESS_CLAIM_DIR or --claim-dir); \
             it must be one shared path used by every worker",
        )
    }

    /// Archive root: configured, else `.orig_video_to_delete` beside the claims directory
    pub fn resolve_backup_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.backup_dir {
            return Ok(dir.clone());
        }
        let claims = self.resolve_claim_dir()?;
        let parent = claims.parent().unwrap_or(&claims);
        Ok(parent.join(".orig_video_to_delete"))
    }

    /// Machine identifier for claim markers: configured override, else hostname
    pub fn resolve_owner(&self) -> String {
        self.owner_id
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown-host".to_string())
    }

    /// Staleness threshold for claim recovery. Errors when the configured
    /// hours do not fit a `chrono::Duration`.
    pub fn stale_claim_age(&self) -> Result<chrono::Duration> {
        i64::try_from(self.stale_claim_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .with_context(|| format!("stale_claim_hours {} is out of range", self.stale_claim_hours))
    }

    /// True if `tag` marks a file finished by the current pipeline generation
    pub fn is_current_tag(&self, tag: &str) -> bool {
        tag == self.current_tag
    }

    /// True if `tag` marks a file finished by an earlier pipeline generation
    pub fn is_legacy_tag(&self, tag: &str) -> bool {
        self.legacy_tags.iter().any(|t| t == tag)
    }
}
