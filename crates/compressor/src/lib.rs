pub mod config;
pub mod naming;
pub mod ffprobe;
pub mod encode;
pub mod classifier;
pub mod decision;
pub mod claim;
pub mod scan;
pub mod coordinator;

pub use config::CompressConfig;
pub use claim::{ClaimError, ClaimManager, ClaimRecord, FileIdentity};
pub use classifier::FileState;
pub use coordinator::{Coordinator, MigrateOutcome, Outcome, RunStats};
pub use decision::{Action, Decision, Policy};
pub use encode::{EncodeError, Encoder, FfmpegEncoder};
pub use ffprobe::{FfprobeTool, MediaInfo, ProbeError, Prober, TagStore};
pub use scan::{FileRecord, ScanResult};
