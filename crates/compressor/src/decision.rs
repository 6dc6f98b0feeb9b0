//! Decision engine: what to do with an eligible file.
//!
//! Mandatory cases (wrong container, 4K, incompatible codec) bypass the
//! savings gate. Only files already in the target codec and container have to
//! prove that re-encoding shrinks them.

use serde::{Deserialize, Serialize};
use crate::config::CompressConfig;
use crate::ffprobe::MediaInfo;

/// Action chosen for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Already efficient; mark skipped without encoding
    Skip,
    /// Container change only, streams copied
    Remux,
    /// Codec cannot stay for compatibility reasons
    EncodeCompat,
    /// 4K source, capped to the downscale resolution
    EncodeDownscale,
    /// Already acceptable; must prove a size improvement
    EncodeWithSavingsCheck,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Skip => write!(f, "skip"),
            Action::Remux => write!(f, "remux"),
            Action::EncodeCompat => write!(f, "encode_compat"),
            Action::EncodeDownscale => write!(f, "encode_downscale"),
            Action::EncodeWithSavingsCheck => write!(f, "encode_gated"),
        }
    }
}

/// Decision plus the parameters the encoder needs
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    /// Output must beat the minimum savings to be committed
    pub savings_gate: bool,
    /// Cap on the short side of the output, in lines
    pub max_height: Option<u32>,
    /// CRF/CQ for transcodes
    pub quality: Option<u8>,
    pub reason: String,
}

/// Thresholds the decision table is evaluated against
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub target_container: String,
    pub target_codec: String,
    pub incompatible_codecs: Vec<String>,
    pub low_bitrate_bps: u64,
    pub downscale_lines: u32,
}

impl Policy {
    pub fn from_config(cfg: &CompressConfig) -> Self {
        Self {
            target_container: cfg.target_container.to_lowercase(),
            target_codec: cfg.target_codec.to_lowercase(),
            incompatible_codecs: cfg.incompatible_codecs.iter().map(|c| c.to_lowercase()).collect(),
            low_bitrate_bps: cfg.low_bitrate_bps,
            downscale_lines: cfg.downscale_lines,
        }
    }
}

/// 4K: width at least 3840 or height at least 2160
pub fn is_4k(width: u32, height: u32) -> bool {
    width >= 3840 || height >= 2160
}

/// Map media attributes to an action
pub fn decide(media: &MediaInfo, policy: &Policy) -> Decision {
    let codec = media.codec.to_lowercase();
    let in_target_container = media.container == policy.target_container;
    let mbps = media.bitrate_bps as f64 / 1_000_000.0;

    if is_4k(media.width, media.height) {
        return Decision {
            action: Action::EncodeDownscale,
            savings_gate: false,
            max_height: Some(policy.downscale_lines),
            quality: Some(26),
            reason: format!(
                "{}x{} {} -> downscale to {}p",
                media.width, media.height, media.container, policy.downscale_lines
            ),
        };
    }

    if !in_target_container {
        if codec == policy.target_codec {
            return Decision {
                action: Action::Remux,
                savings_gate: false,
                max_height: None,
                quality: None,
                reason: format!("{} {} -> remux to {}", media.container, codec, policy.target_container),
            };
        }
        return Decision {
            action: Action::EncodeCompat,
            savings_gate: false,
            max_height: None,
            quality: Some(ladder_quality(&codec, mbps, policy)),
            reason: format!(
                "{} {} -> encode to {} {}",
                media.container, codec, policy.target_container, policy.target_codec
            ),
        };
    }

    if policy.incompatible_codecs.iter().any(|c| *c == codec) {
        return Decision {
            action: Action::EncodeCompat,
            savings_gate: false,
            max_height: None,
            quality: Some(ladder_quality(&codec, mbps, policy)),
            reason: format!("{} is not playback compatible -> {}", codec, policy.target_codec),
        };
    }

    if codec == policy.target_codec && media.bitrate_bps < policy.low_bitrate_bps {
        return Decision {
            action: Action::Skip,
            savings_gate: false,
            max_height: None,
            quality: None,
            reason: format!("{} at {:.2} Mbps (too low to gain)", codec, mbps),
        };
    }

    Decision {
        action: Action::EncodeWithSavingsCheck,
        savings_gate: true,
        max_height: None,
        quality: Some(ladder_quality(&codec, mbps, policy)),
        reason: format!("{} at {:.1} Mbps -> re-encode if it saves space", codec, mbps),
    }
}

/// Quality ladder: high-bitrate target-codec sources get a finer setting
fn ladder_quality(codec: &str, mbps: f64, policy: &Policy) -> u8 {
    if codec == policy.target_codec {
        if mbps >= 2.0 {
            28
        } else {
            30
        }
    } else if codec == "vp9" {
        30
    } else {
        28
    }
}

/// Result of the post-encode savings check
#[derive(Debug, Clone, PartialEq)]
pub enum SavingsGateResult {
    Accept { savings_pct: f64 },
    Reject { savings_pct: f64 },
}

/// Percentage by which `output_bytes` undercuts `input_bytes`
pub fn savings_pct(input_bytes: u64, output_bytes: u64) -> f64 {
    if input_bytes == 0 {
        return 0.0;
    }
    (1.0 - output_bytes as f64 / input_bytes as f64) * 100.0
}

/// Accept when the output saves at least `min_savings_pct`
pub fn check_savings_gate(input_bytes: u64, output_bytes: u64, min_savings_pct: f64) -> SavingsGateResult {
    let pct = savings_pct(input_bytes, output_bytes);
    if pct >= min_savings_pct {
        SavingsGateResult::Accept { savings_pct: pct }
    } else {
        SavingsGateResult::Reject { savings_pct: pct }
    }
}
