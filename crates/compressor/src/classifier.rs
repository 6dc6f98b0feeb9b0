//! Lifecycle classification of library files.
//!
//! The checks run cheapest first: the name alone settles `Skipped`, and only
//! files that survive it get their embedded tags read.

use std::collections::BTreeSet;
use std::path::Path;
use crate::config::CompressConfig;
use crate::ffprobe::{ProbeError, TagStore};
use crate::naming::{self, NameFlags};

/// Where a file stands in the compression lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    /// Never processed (or processed unsuccessfully); eligible
    Untouched,
    /// Carries the current-generation tag; terminal
    Compressed,
    /// Carries the skip suffix; terminal
    Skipped,
    /// Carries only an earlier generation's tag; eligible for re-encode and migration
    LegacyCompressed,
}

impl FileState {
    /// Terminal states are never claimed
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Compressed | FileState::Skipped)
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileState::Untouched => write!(f, "untouched"),
            FileState::Compressed => write!(f, "compressed"),
            FileState::Skipped => write!(f, "skipped"),
            FileState::LegacyCompressed => write!(f, "legacy_compressed"),
        }
    }
}

/// String-only fast path: `Some(Skipped)` when the name settles it
pub fn classify_name(path: &Path, cfg: &CompressConfig) -> Option<FileState> {
    if naming::name_flags(path, cfg).skip {
        Some(FileState::Skipped)
    } else {
        None
    }
}

/// Classify from name flags and embedded tags
pub fn classify(flags: &NameFlags, tags: &BTreeSet<String>, cfg: &CompressConfig) -> FileState {
    if flags.skip {
        return FileState::Skipped;
    }
    if tags.iter().any(|t| cfg.is_current_tag(t)) {
        return FileState::Compressed;
    }
    if tags.iter().any(|t| cfg.is_legacy_tag(t)) {
        return FileState::LegacyCompressed;
    }
    FileState::Untouched
}

/// Resolve a file's state, reading tags only when the name is not enough
pub async fn resolve<T: TagStore>(
    path: &Path,
    tags: &T,
    cfg: &CompressConfig,
) -> Result<FileState, ProbeError> {
    if let Some(state) = classify_name(path, cfg) {
        return Ok(state);
    }

    let flags = naming::name_flags(path, cfg);
    let found = tags.read_tags(path).await?;
    Ok(classify(&flags, &found, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::path::PathBuf;

    fn cfg() -> CompressConfig {
        CompressConfig::default_config()
    }

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Counts tag reads so tests can assert the fast path never opens files
    struct CountingTags {
        tags: BTreeSet<String>,
        reads: Cell<usize>,
    }

    impl TagStore for CountingTags {
        async fn read_tags(&self, _path: &Path) -> Result<BTreeSet<String>, ProbeError> {
            self.reads.set(self.reads.get() + 1);
            Ok(self.tags.clone())
        }

        async fn write_tag(&self, _path: &Path, _tag: &str) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    #[test]
    fn test_priority_order() {
        let c = cfg();
        let skip = NameFlags { skip: true, ..Default::default() };
        let plain = NameFlags::default();

        assert_eq!(classify(&skip, &tags(&["compressed_h264_v4"]), &c), FileState::Skipped);
        assert_eq!(classify(&plain, &tags(&["compressed_h264_v4", "compressed_hevc_v2"]), &c), FileState::Compressed);
        assert_eq!(classify(&plain, &tags(&["compressed_hevc_v3"]), &c), FileState::LegacyCompressed);
        assert_eq!(classify(&plain, &tags(&["something_else"]), &c), FileState::Untouched);
        assert_eq!(classify(&plain, &BTreeSet::new(), &c), FileState::Untouched);
    }

    #[test]
    fn test_terminal_states() {
        assert!(FileState::Compressed.is_terminal());
        assert!(FileState::Skipped.is_terminal());
        assert!(!FileState::Untouched.is_terminal());
        assert!(!FileState::LegacyCompressed.is_terminal());
    }

    #[tokio::test]
    async fn test_skip_suffix_never_reads_tags() {
        let store = CountingTags { tags: tags(&["compressed_h264_v4"]), reads: Cell::new(0) };
        let state = resolve(Path::new("/share/clip_skip.mp4"), &store, &cfg()).await.unwrap();
        assert_eq!(state, FileState::Skipped);
        assert_eq!(store.reads.get(), 0);
    }

    #[tokio::test]
    async fn test_resolve_reads_tags_for_unsuffixed_names() {
        let store = CountingTags { tags: tags(&["compressed_hevc_v2"]), reads: Cell::new(0) };
        let state = resolve(Path::new("/share/clip_compressed.mp4"), &store, &cfg()).await.unwrap();
        assert_eq!(state, FileState::LegacyCompressed);
        assert_eq!(store.reads.get(), 1);
    }

    fn tag_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("compressed_h264_v4".to_string()),
            Just("compressed_hevc_v2".to_string()),
            Just("compressed_hevc_v3".to_string()),
            "[a-z_]{1,12}",
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Skipped and Compressed never overlap, and classifying the same
        /// file repeatedly gives the same answer.
        #[test]
        fn prop_classification_is_exclusive_and_stable(
            stem in "[a-zA-Z0-9]{1,12}",
            skip in proptest::bool::ANY,
            tag_list in proptest::collection::vec(tag_strategy(), 0..4),
        ) {
            let c = cfg();
            let name = if skip { format!("{}_skip.mp4", stem) } else { format!("{}.mp4", stem) };
            let path = PathBuf::from(format!("/share/{}", name));
            let flags = naming::name_flags(&path, &c);
            let found: BTreeSet<String> = tag_list.into_iter().collect();

            let first = classify(&flags, &found, &c);
            let second = classify(&flags, &found, &c);
            prop_assert_eq!(first, second);

            let has_current = found.contains("compressed_h264_v4");
            if flags.skip {
                prop_assert_eq!(first, FileState::Skipped);
            } else if has_current {
                prop_assert_eq!(first, FileState::Compressed);
            }
            if first == FileState::Compressed {
                prop_assert!(!flags.skip);
            }
        }
    }
}
