use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use crate::config::CompressConfig;
use crate::naming;

/// Errors from media introspection and tag access
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe failed for {path}: {message}")]
    Failed { path: PathBuf, message: String },

    #[error("ffprobe timed out after {secs}s for {path}")]
    Timeout { path: PathBuf, secs: u64 },

    #[error("no video stream in {0}")]
    NoVideo(PathBuf),

    #[error("failed to parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Media attributes the decision engine works from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    /// Lowercased container, taken from the file extension
    pub container: String,
    /// ffprobe codec name of the first video stream
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Video bitrate, falling back to the container bitrate
    pub bitrate_bps: u64,
}

/// Media introspection collaborator
#[allow(async_fn_in_trait)]
pub trait Prober {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;
}

/// Embedded metadata tag collaborator
#[allow(async_fn_in_trait)]
pub trait TagStore {
    async fn read_tags(&self, path: &Path) -> Result<BTreeSet<String>, ProbeError>;
    async fn write_tag(&self, path: &Path, tag: &str) -> Result<(), ProbeError>;
}

impl<P: Prober> Prober for &P {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        (**self).probe(path).await
    }
}

impl<T: TagStore> TagStore for &T {
    async fn read_tags(&self, path: &Path) -> Result<BTreeSet<String>, ProbeError> {
        (**self).read_tags(path).await
    }

    async fn write_tag(&self, path: &Path, tag: &str) -> Result<(), ProbeError> {
        (**self).write_tag(path, tag).await
    }
}

/// Raw ffprobe JSON
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub bit_rate: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bit_rate: Option<String>,
}

/// Build a `MediaInfo` from ffprobe JSON for the given file
pub fn parse_media_info(path: &Path, json: &str) -> Result<MediaInfo, ProbeError> {
    let data: FFProbeData = serde_json::from_str(json)?;

    let video = data
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref().map_or(true, |t| t == "video"))
        .ok_or_else(|| ProbeError::NoVideo(path.to_path_buf()))?;

    let stream_bitrate = video.bit_rate.as_deref().and_then(|b| b.parse::<u64>().ok());
    let format_bitrate = data
        .format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|b| b.parse::<u64>().ok());

    Ok(MediaInfo {
        container: naming::extension_of(path),
        codec: video
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
            .to_lowercase(),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        bitrate_bps: stream_bitrate.or(format_bitrate).unwrap_or(0),
    })
}

/// Split the container `comment` tag into individual pipeline tags
pub fn parse_tags(json: &str) -> Result<BTreeSet<String>, ProbeError> {
    let data: FFProbeData = serde_json::from_str(json)?;

    let comment = data
        .format
        .and_then(|f| f.tags)
        .and_then(|tags| {
            tags.into_iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("comment"))
                .map(|(_, v)| v)
        })
        .unwrap_or_default();

    Ok(comment
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect())
}

/// ffprobe/ffmpeg backed prober and tag store
#[derive(Debug, Clone)]
pub struct FfprobeTool {
    pub ffprobe_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub timeout_secs: u64,
}

impl FfprobeTool {
    pub fn new(cfg: &CompressConfig) -> Self {
        Self {
            ffprobe_bin: cfg.ffprobe_bin.clone(),
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            timeout_secs: cfg.probe_timeout_secs,
        }
    }

    async fn run_ffprobe(&self, path: &Path, entries: &[&str]) -> Result<String, ProbeError> {
        use log::debug;

        if !path.exists() {
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                message: "file does not exist".to_string(),
            });
        }

        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.arg("-v").arg("error");
        for entry in entries {
            cmd.arg(entry);
        }
        cmd.arg("-print_format").arg("json").arg(path);
        cmd.kill_on_drop(true);

        debug!("ffprobe {} {:?}", path.display(), entries);

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout {
                path: path.to_path_buf(),
                secs: self.timeout_secs,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                message: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Prober for FfprobeTool {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let json = self
            .run_ffprobe(
                path,
                &[
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=codec_type,codec_name,width,height,bit_rate",
                    "-show_entries",
                    "format=format_name,bit_rate",
                ],
            )
            .await?;
        parse_media_info(path, &json)
    }
}

impl TagStore for FfprobeTool {
    async fn read_tags(&self, path: &Path) -> Result<BTreeSet<String>, ProbeError> {
        let json = self
            .run_ffprobe(path, &["-show_entries", "format_tags=comment"])
            .await?;
        parse_tags(&json)
    }

    /// Encodes embed the tag already, so this is normally a read. Otherwise
    /// the file is stream-copied with the tag added and swapped into place.
    async fn write_tag(&self, path: &Path, tag: &str) -> Result<(), ProbeError> {
        use log::info;

        let mut tags = self.read_tags(path).await?;
        if tags.contains(tag) {
            return Ok(());
        }
        tags.insert(tag.to_string());
        let comment = tags.into_iter().collect::<Vec<_>>().join(" ");

        let ext = naming::extension_of(path);
        let temp = naming::temp_output_path(path, &ext);

        info!("Rewriting {} to add tag {}", path.display(), tag);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-v").arg("error").arg("-y")
            .arg("-i").arg(path)
            .arg("-map").arg("0")
            .arg("-c").arg("copy")
            .arg("-metadata").arg(format!("comment={}", comment))
            .arg("-f").arg(muxer_for(&ext))
            .arg(&temp)
            .kill_on_drop(true);

        let output = cmd.output().await?;
        if !output.status.success() {
            let _ = std::fs::remove_file(&temp);
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                message: format!(
                    "tag rewrite failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        std::fs::rename(&temp, path)?;
        Ok(())
    }
}

/// ffmpeg muxer name for a container extension
pub fn muxer_for(ext: &str) -> &str {
    match ext {
        "mkv" => "matroska",
        "m4v" => "mp4",
        "mpg" | "mpeg" => "mpeg",
        "wmv" => "asf",
        other => other,
    }
}
