//! Filename conventions shared by every worker.
//!
//! Names are part of the system of record: the skip suffix, the legacy
//! `_compressed` suffix and the hidden temp-file pattern are read back by
//! later runs on any machine, so changing them changes the wire format.

use std::path::{Component, Path, PathBuf};
use crate::config::CompressConfig;

/// Marker inside temp output names, e.g. `.movie.avi.tmp.mp4`
pub const TEMP_MARKER: &str = ".tmp";

/// Flags derived from a file name alone, without opening the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameFlags {
    /// Stem carries the skip suffix
    pub skip: bool,
    /// Stem carries the legacy `_compressed` suffix
    pub compressed: bool,
    /// Hidden or in-flight temp artifact; never a candidate
    pub temp: bool,
}

/// Inspect a path's file name for pipeline suffixes
pub fn name_flags(path: &Path, cfg: &CompressConfig) -> NameFlags {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = file_stem(path).to_lowercase();

    NameFlags {
        skip: !cfg.skip_suffix.is_empty() && stem.contains(&cfg.skip_suffix.to_lowercase()),
        compressed: !cfg.compressed_suffix.is_empty()
            && stem.contains(&cfg.compressed_suffix.to_lowercase()),
        temp: is_temp_name(&name),
    }
}

/// Hidden files and anything carrying the temp marker are never deliverables
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') || name.to_lowercase().contains(TEMP_MARKER)
}

/// Lowercased extension without the dot ("" when absent)
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn sibling(path: &Path, name: String) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Temp output for an in-flight encode: `<dir>/.<source file name>.tmp.<ext>`.
///
/// The full source name is kept so same-stem sources in one directory
/// (`clip.mkv`, `clip.avi`) never share a temp file.
pub fn temp_output_path(input: &Path, target_ext: &str) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    sibling(input, format!(".{}{}.{}", name, TEMP_MARKER, target_ext))
}

/// Recover the source file name from a temp output name
/// (`.movie.avi.tmp.mp4` -> `movie.avi`)
pub fn source_name_of_temp(temp: &Path) -> Option<String> {
    let name = temp.file_name()?.to_str()?;
    let rest = name.strip_prefix('.')?;
    let idx = rest.rfind(TEMP_MARKER)?;
    let source = &rest[..idx];
    if source.is_empty() {
        None
    } else {
        Some(source.to_string())
    }
}

/// Name a rolled-back or policy-skipped file takes: `<stem>_skip.<ext>`
pub fn skip_path(input: &Path, cfg: &CompressConfig) -> PathBuf {
    let ext = input
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    unique_path(&sibling(
        input,
        format!("{}{}{}", file_stem(input), cfg.skip_suffix, ext),
    ))
}

/// Name a migrated legacy file takes: `<stem>_compressed.<ext>`
pub fn compressed_path(input: &Path, cfg: &CompressConfig) -> PathBuf {
    let ext = input
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    sibling(
        input,
        format!("{}{}{}", file_stem(input), cfg.compressed_suffix, ext),
    )
}

/// Final name for a committed output: the original stem (minus any legacy
/// `_compressed` suffix) with the target extension.
///
/// The original itself is moved away before the rename, so its own path is
/// reusable; any other existing file gets a numbered variant instead.
pub fn final_output_path(input: &Path, cfg: &CompressConfig) -> PathBuf {
    let stem = file_stem(input).replace(&cfg.compressed_suffix, "");
    let candidate = sibling(input, format!("{}.{}", stem, cfg.target_container));
    if candidate != input && candidate.exists() {
        unique_path(&candidate)
    } else {
        candidate
    }
}

/// Where the original goes on commit: the archive root mirroring the
/// original's absolute path, numbered on collision.
pub fn archive_path(backup_root: &Path, original: &Path) -> PathBuf {
    let absolute = normalize_path(original);
    let mut target = backup_root.to_path_buf();
    for component in absolute.components() {
        if let Component::Normal(part) = component {
            target.push(part);
        }
    }
    unique_path(&target)
}

/// Append `_1`, `_2`, ... to the stem until the path is free
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = file_stem(path);
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let candidate = sibling(path, format!("{}_{}{}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Lexically normalize a path into absolute form.
///
/// Relative paths are joined onto the working directory, `.` is dropped and
/// `..` pops. Symlinks are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn cfg() -> CompressConfig {
        CompressConfig::default_config()
    }

    #[test]
    fn test_name_flags() {
        let c = cfg();
        let f = name_flags(Path::new("/share/Trip_SKIP.mp4"), &c);
        assert!(f.skip && !f.compressed && !f.temp);

        let f = name_flags(Path::new("/share/trip_compressed.mp4"), &c);
        assert!(!f.skip && f.compressed && !f.temp);

        let f = name_flags(Path::new("/share/.trip.tmp.mp4"), &c);
        assert!(f.temp);

        let f = name_flags(Path::new("/share/trip.mkv"), &c);
        assert_eq!(f, NameFlags::default());
    }

    #[test]
    fn test_temp_output_path_is_hidden_and_marked() {
        let temp = temp_output_path(Path::new("/share/movies/film.avi"), "mp4");
        assert_eq!(temp, PathBuf::from("/share/movies/.film.avi.tmp.mp4"));
        assert!(is_temp_name(temp.file_name().unwrap().to_str().unwrap()));
        assert_eq!(source_name_of_temp(&temp).as_deref(), Some("film.avi"));
    }

    #[test]
    fn test_same_stem_sources_get_distinct_temps() {
        let mkv = Path::new("/share/clip.mkv");
        let avi = Path::new("/share/clip.avi");
        let mkv_temp = temp_output_path(mkv, "mp4");
        let avi_temp = temp_output_path(avi, "mp4");

        assert_ne!(mkv_temp, avi_temp);
        assert_eq!(source_name_of_temp(&mkv_temp).as_deref(), Some("clip.mkv"));
        assert_eq!(source_name_of_temp(&avi_temp).as_deref(), Some("clip.avi"));
    }

    #[test]
    fn test_source_name_of_temp_rejects_plain_names() {
        assert_eq!(source_name_of_temp(Path::new("/a/film.mp4")), None);
        assert_eq!(source_name_of_temp(Path::new("/a/.tmp.mp4")), None);
        assert_eq!(
            source_name_of_temp(Path::new("/a/.my.film.mkv.tmp.mp4")).as_deref(),
            Some("my.film.mkv")
        );
    }

    #[test]
    fn test_skip_path_keeps_extension_and_avoids_collision() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mp4");
        assert_eq!(skip_path(&input, &cfg()), dir.path().join("clip_skip.mp4"));

        File::create(dir.path().join("clip_skip.mp4")).unwrap();
        assert_eq!(skip_path(&input, &cfg()), dir.path().join("clip_skip_1.mp4"));
    }

    #[test]
    fn test_final_output_path_strips_compressed_suffix() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip_compressed.mp4");
        assert_eq!(final_output_path(&input, &cfg()), dir.path().join("clip.mp4"));

        let avi = dir.path().join("home.avi");
        assert_eq!(final_output_path(&avi, &cfg()), dir.path().join("home.mp4"));
    }

    #[test]
    fn test_final_output_path_reuses_own_name_but_not_neighbours() {
        let dir = TempDir::new().unwrap();
        let mp4 = dir.path().join("clip.mp4");
        File::create(&mp4).unwrap();
        assert_eq!(final_output_path(&mp4, &cfg()), mp4);

        let mkv = dir.path().join("clip.mkv");
        assert_eq!(final_output_path(&mkv, &cfg()), dir.path().join("clip_1.mp4"));
    }

    #[test]
    fn test_archive_path_mirrors_absolute_path() {
        let dir = TempDir::new().unwrap();
        let backup = dir.path().join("archive");
        let original = Path::new("/share/videos/2019/trip.mp4");
        assert_eq!(
            archive_path(&backup, original),
            backup.join("share/videos/2019/trip.mp4")
        );
    }

    #[test]
    fn test_normalize_path_is_lexical() {
        assert_eq!(
            normalize_path(Path::new("/share/./videos/../videos/a.mp4")),
            PathBuf::from("/share/videos/a.mp4")
        );
        assert!(normalize_path(Path::new("relative/a.mp4")).is_absolute());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Temp outputs are never mistaken for candidates, and the source
        /// name survives the round trip through the temp name.
        #[test]
        fn prop_temp_names_are_never_candidates(
            stem in "[a-zA-Z0-9_ -]{1,24}",
            ext in prop_oneof![Just("mp4"), Just("mkv"), Just("avi")],
        ) {
            let input = PathBuf::from(format!("/share/{}.{}", stem, ext));
            let temp = temp_output_path(&input, "mp4");
            let flags = name_flags(&temp, &cfg());
            prop_assert!(flags.temp);
            prop_assert_eq!(source_name_of_temp(&temp), Some(format!("{}.{}", stem, ext)));
        }
    }
}
