use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use crate::config::CompressConfig;
use crate::ffprobe::muxer_for;

/// Errors from producing a temp output
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("ffmpeg exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("ffmpeg timed out after {0}s and was killed")]
    Timeout(u64),

    #[error("encoder reported success but {0} is missing or empty")]
    MissingOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the output is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Stream copy into the target container
    Remux,
    /// Re-encode video to the target codec
    Transcode,
}

/// Everything the encoder needs for one file
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub temp_output: PathBuf,
    pub mode: EncodeMode,
    pub target_container: String,
    /// Cap on the short side of the picture
    pub max_height: Option<u32>,
    pub quality: Option<u8>,
    /// Embedded in the output's `comment` metadata
    pub tag: String,
    pub source_width: u32,
    pub source_height: u32,
}

/// Produces a temp output for a request
#[allow(async_fn_in_trait)]
pub trait Encoder {
    async fn encode(&self, request: &EncodeRequest) -> Result<PathBuf, EncodeError>;
}

impl<E: Encoder> Encoder for &E {
    async fn encode(&self, request: &EncodeRequest) -> Result<PathBuf, EncodeError> {
        (**self).encode(request).await
    }
}

/// Scale filter that caps the short side at `lines`, keeping orientation.
/// `None` when the source already fits.
pub fn scale_filter(width: u32, height: u32, lines: u32) -> Option<String> {
    let portrait = height > width;
    let short_side = if portrait { width } else { height };
    if short_side <= lines {
        return None;
    }
    if portrait {
        Some(format!("scale={}:-2", lines))
    } else {
        Some(format!("scale=-2:{}", lines))
    }
}

/// ffmpeg command-line encoder
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    pub ffmpeg_bin: PathBuf,
    pub video_encoder: String,
    pub preset: String,
    pub audio_bitrate: String,
    pub timeout_secs: u64,
}

impl FfmpegEncoder {
    pub fn new(cfg: &CompressConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            video_encoder: cfg.video_encoder.clone(),
            preset: cfg.encoder_preset.clone(),
            audio_bitrate: cfg.audio_bitrate.clone(),
            timeout_secs: cfg.encode_timeout_secs,
        }
    }

    /// Build the ffmpeg argument list for a request
    pub fn build_args(&self, request: &EncodeRequest) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            request.input.to_string_lossy().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "0:a?".to_string(),
        ];

        match request.mode {
            EncodeMode::Remux => {
                args.push("-c".to_string());
                args.push("copy".to_string());
            }
            EncodeMode::Transcode => {
                if let Some(filter) = request
                    .max_height
                    .and_then(|lines| scale_filter(request.source_width, request.source_height, lines))
                {
                    args.push("-vf".to_string());
                    args.push(filter);
                }

                args.push("-c:v".to_string());
                args.push(self.video_encoder.clone());

                if let Some(q) = request.quality {
                    // nvenc has no CRF; constant-quality is the closest match
                    if self.video_encoder.ends_with("_nvenc") {
                        args.push("-cq".to_string());
                    } else {
                        args.push("-crf".to_string());
                    }
                    args.push(q.to_string());
                }

                args.push("-preset".to_string());
                args.push(self.preset.clone());
                args.push("-pix_fmt".to_string());
                args.push("yuv420p".to_string());

                args.push("-c:a".to_string());
                args.push("aac".to_string());
                args.push("-b:a".to_string());
                args.push(self.audio_bitrate.clone());
            }
        }

        if matches!(request.target_container.as_str(), "mp4" | "m4v" | "mov") {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }

        args.push("-metadata".to_string());
        args.push(format!("comment={}", request.tag));

        // The temp name hides the real extension from ffmpeg's muxer guess
        args.push("-f".to_string());
        args.push(muxer_for(&request.target_container).to_string());
        args.push(request.temp_output.to_string_lossy().to_string());

        args
    }
}

impl Encoder for FfmpegEncoder {
    async fn encode(&self, request: &EncodeRequest) -> Result<PathBuf, EncodeError> {
        use log::{debug, info};

        let args = self.build_args(request);
        debug!("Executing: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = Vec::new();
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.push(line);
                }
                lines.join("\n")
            })
        });

        let status = match timeout(Duration::from_secs(self.timeout_secs), child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                child.kill().await?;
                return Err(EncodeError::Timeout(self.timeout_secs));
            }
        };

        let stderr = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(EncodeError::Failed {
                code: status.code().unwrap_or(-1),
                stderr: tail(&stderr, 20),
            });
        }

        check_output(&request.temp_output)?;
        info!("Encoded {} -> {}", request.input.display(), request.temp_output.display());
        Ok(request.temp_output.clone())
    }
}

/// The output must exist and hold at least one byte
pub fn check_output(path: &Path) -> Result<u64, EncodeError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => Ok(meta.len()),
        Ok(_) => Err(EncodeError::MissingOutput(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(EncodeError::MissingOutput(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mode: EncodeMode) -> EncodeRequest {
        EncodeRequest {
            input: PathBuf::from("/share/film.avi"),
            temp_output: PathBuf::from("/share/.film.avi.tmp.mp4"),
            mode,
            target_container: "mp4".to_string(),
            max_height: None,
            quality: Some(28),
            tag: "compressed_h264_v4".to_string(),
            source_width: 1920,
            source_height: 1080,
        }
    }

    fn encoder() -> FfmpegEncoder {
        FfmpegEncoder::new(&CompressConfig::default_config())
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_remux_copies_streams() {
        let args = encoder().build_args(&request(EncodeMode::Remux));
        assert!(has_pair(&args, "-c", "copy"));
        assert!(!args.iter().any(|a| a == "-c:v" || a == "-crf"));
        assert!(has_pair(&args, "-metadata", "comment=compressed_h264_v4"));
        assert!(has_pair(&args, "-f", "mp4"));
        assert_eq!(args.last().map(String::as_str), Some("/share/.film.avi.tmp.mp4"));
    }

    #[test]
    fn test_transcode_uses_crf_and_aac() {
        let args = encoder().build_args(&request(EncodeMode::Transcode));
        assert!(has_pair(&args, "-c:v", "libx264"));
        assert!(has_pair(&args, "-crf", "28"));
        assert!(has_pair(&args, "-c:a", "aac"));
        assert!(has_pair(&args, "-b:a", "128k"));
        assert!(has_pair(&args, "-movflags", "+faststart"));
        assert!(!args.iter().any(|a| a == "-vf"));
    }

    #[test]
    fn test_nvenc_uses_cq() {
        let mut enc = encoder();
        enc.video_encoder = "h264_nvenc".to_string();
        let args = enc.build_args(&request(EncodeMode::Transcode));
        assert!(has_pair(&args, "-cq", "28"));
        assert!(!args.iter().any(|a| a == "-crf"));
    }

    #[test]
    fn test_downscale_filter_follows_orientation() {
        let mut req = request(EncodeMode::Transcode);
        req.max_height = Some(1080);
        req.source_width = 3840;
        req.source_height = 2160;
        assert!(has_pair(&encoder().build_args(&req), "-vf", "scale=-2:1080"));

        req.source_width = 2160;
        req.source_height = 3840;
        assert!(has_pair(&encoder().build_args(&req), "-vf", "scale=1080:-2"));
    }

    #[test]
    fn test_scale_filter_skips_sources_that_fit() {
        assert_eq!(scale_filter(1920, 1080, 1080), None);
        assert_eq!(scale_filter(4096, 1716, 1080).as_deref(), Some("scale=-2:1080"));
    }

    #[test]
    fn test_check_output_rejects_empty_and_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let empty = dir.path().join(".a.tmp.mp4");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(check_output(&empty), Err(EncodeError::MissingOutput(_))));
        assert!(matches!(
            check_output(&dir.path().join("missing.mp4")),
            Err(EncodeError::MissingOutput(_))
        ));

        let full = dir.path().join(".b.tmp.mp4");
        std::fs::write(&full, b"data").unwrap();
        assert_eq!(check_output(&full).unwrap(), 4);
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}
