use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use console::style;
use glob::{MatchOptions, Pattern};
use indicatif::{HumanBytes, ProgressBar, ProgressFinish, ProgressStyle};
use regex::Regex;

/// Extension sets that mark a directory as an unsplittable release,
/// e.g. a RAR set with its SFV or a DVD VOB/IFO pair.
const UNSPLITTABLE_EXTENSION_SETS: &[&[&str]] = &[
    &[".rar", ".sfv"],
    &[".rar", ".r00"],
    &[".mp3", ".sfv"],
    &[".vob", ".ifo"],
];

/// Files that may be absent from an unsplittable release without
/// making it unusable.
static UNSPLITTABLE_MISSABLE_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    ["*.nfo", "*.sfv", "*.diz", "*.txt"]
        .iter()
        .map(|p| Pattern::new(p).unwrap())
        .collect()
});

static SCENE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^((cd[1-9])|(samples?)|(proofs?)|((vob)?sub(title)?s?))$").unwrap()
});

static DISK_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^((bdmv)|(disc\d*)|(video_ts))$").unwrap());

static MISSABLE_PARENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^((samples?)|(proofs?)|((vob)?sub(title)?s?))$").unwrap());

static STEM_SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ _.-]+").unwrap());

/// Lowercase a trimmed filename and collapse separator runs in the stem
/// so that differently-punctuated names compare equal.
///
/// The result is trimmed again so separator runs at the stem edges
/// normalize to a fixed point.
pub fn normalize_filename(filename: &str) -> String {
    let filename = filename.trim_matches(' ');
    let (stem, ext) = split_extension(filename);
    let stem = STEM_SEPARATOR_RE.replace_all(stem, " ");
    let normalized = format!("{stem}{ext}").to_lowercase();
    normalized.trim_matches(' ').to_string()
}

/// Split a filename into stem and extension, keeping the dot on the
/// extension. A name whose stem would consist only of separator
/// characters has no extension; its dot belongs to the stem and gets
/// collapsed with the rest.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(index)
            if index > 0
                && !name[..index]
                    .bytes()
                    .all(|b| matches!(b, b' ' | b'_' | b'.' | b'-')) =>
        {
            name.split_at(index)
        }
        _ => (name, ""),
    }
}

/// Decode a path for storage, optionally repairing invalid UTF-8.
///
/// Returns `None` for non-UTF-8 paths unless `try_fix` is set, in which
/// case invalid sequences are replaced.
pub fn decode_path(path: &Path, try_fix: bool) -> Option<String> {
    match path.to_str() {
        Some(s) => Some(s.to_string()),
        None if try_fix => Some(path.to_string_lossy().into_owned()),
        None => None,
    }
}

/// Decode a bencoded byte string, optionally repairing invalid UTF-8.
pub fn decode_bytes(bytes: &[u8], try_fix: bool) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Some(s.to_string()),
        Err(_) if try_fix => Some(String::from_utf8_lossy(bytes).into_owned()),
        Err(_) => None,
    }
}

/// Checks if a set of files can only be used in this combination, e.g.
/// a VOB/IFO pair or a scene release archive set.
pub fn is_unsplittable<P: AsRef<Path>>(files: &[P]) -> bool {
    let extensions: Vec<String> = files
        .iter()
        .filter_map(|f| f.as_ref().extension())
        .filter_map(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .collect();
    for wanted in UNSPLITTABLE_EXTENSION_SETS {
        if wanted.iter().all(|e| extensions.iter().any(|have| have == e)) {
            return true;
        }
    }

    files.iter().any(|f| {
        f.as_ref()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.eq_ignore_ascii_case("movieobject.bdmv"))
    })
}

/// Checks if a file can be missing from an unsplittable release while
/// the release is still usable.
pub fn can_potentially_miss_in_unsplittable(path: &Path) -> bool {
    let parent_matches = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .is_some_and(|n| MISSABLE_PARENT_RE.is_match(n));
    if parent_matches {
        return true;
    }

    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| {
            UNSPLITTABLE_MISSABLE_PATTERNS
                .iter()
                .any(|pattern| pattern.matches(name))
        })
}

/// Walks upward from a path to the actual release root, skipping
/// cd1/sample/subs style folders and disk layout folders.
///
/// Returns `None` if every ancestor is such a folder.
pub fn get_root_of_unsplittable(path: &Path) -> Option<PathBuf> {
    let mut path = path;
    loop {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            // The filesystem root has no name and can never be skipped.
            None => return Some(path.to_path_buf()),
        };
        let is_scene_path = SCENE_PATH_RE.is_match(name);
        let mut is_disk_path = DISK_PATH_RE.is_match(name);
        if !is_disk_path
            && name.eq_ignore_ascii_case("backup")
            && path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.eq_ignore_ascii_case("bdmv"))
        {
            is_disk_path = true;
        }

        if !is_scene_path && !is_disk_path {
            return Some(path.to_path_buf());
        }

        let parent = path.parent()?;
        if parent.as_os_str().is_empty() {
            return None;
        }
        path = parent;
    }
}

/// Match a name against glob patterns, fnmatch-style.
pub fn matches_any_pattern(name: &str, patterns: &[Pattern], case_sensitive: bool) -> bool {
    let options = MatchOptions {
        case_sensitive,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    patterns
        .iter()
        .any(|pattern| pattern.matches_with(name, options))
}

/// Compile glob patterns, rejecting broken ones with their source text.
pub fn compile_patterns(patterns: &[String]) -> anyhow::Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).map_err(|e| anyhow::anyhow!("invalid pattern {p:?}: {e}")))
        .collect()
}

/// Strip slashes off a torrent path segment.
pub fn cleanup_torrent_path_segment(segment: &str) -> &str {
    segment.trim_matches('/')
}

/// Quote a path for copy-pasting into a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

pub fn new_progress_spinner() -> ProgressBar {
    ProgressBar::new_spinner()
        .with_style(
            ProgressStyle::with_template("{spinner} {pos} {elapsed_precise} {wide_msg}").unwrap(),
        )
        .with_finish(ProgressFinish::AndLeave)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddStatus {
    Seeded,
    Exists,
    MissingFiles,
    Failed,
    Added,
}

/// Print one status line for a processed torrent.
pub fn print_add_status(status: AddStatus, torrent_path: &Path, message: &str) {
    let label = match status {
        AddStatus::Seeded => format!("[{}]", style("Seeded").blue()),
        AddStatus::Exists => format!("[{}]", style("Exists").yellow()),
        AddStatus::MissingFiles => format!("[{}]", style("Missing").red()),
        AddStatus::Failed => format!("[{}]", style("Failed").magenta()),
        AddStatus::Added => format!("[{}]", style("Added").green()),
    };
    let name = torrent_path
        .file_name()
        .unwrap_or(torrent_path.as_os_str())
        .to_string_lossy();
    println!(" {label:18} {name:?} {message}");
}

/// Humanized byte count, e.g. "12.06 MiB".
pub fn humanize_bytes(bytes: u64) -> String {
    HumanBytes(bytes).to_string()
}
