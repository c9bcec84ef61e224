//! File-name sanitization for labels that end up in paths and command lines.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

fn unsafe_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("static pattern"))
}

/// Map an arbitrary label to a string safe to use as a file name.
///
/// Runs of disallowed characters collapse to `replace`, and leading `.`s
/// are stripped so results never collide with hidden files. If `replace`
/// is itself unsafe it is ignored and removal is used instead.
pub fn make_file_name_safe(input: &str, replace: &str) -> String {
    let replace = if unsafe_chars().is_match(replace) {
        tracing::warn!("{replace:?} is not a safe replacement, removing instead");
        ""
    } else {
        replace
    };

    let safe = unsafe_chars().replace_all(input, replace);
    let safe = safe.trim_start_matches('.').to_string();

    tracing::debug!("{input:?} -> {safe:?}");
    safe
}

/// Remove spaces from file and directory names in an entire tree.
///
/// Walks bottom-up so renaming a directory never invalidates the paths of
/// entries still to be visited.
pub fn despace(directory: &Path) -> Result<()> {
    if !directory.is_dir() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(directory)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.contains(' ') {
            continue;
        }
        let renamed = path.with_file_name(name.replace(' ', "_"));
        tracing::debug!("'{}' -> '{}'", path.display(), renamed.display());
        fs::rename(path, &renamed)
            .with_context(|| format!("rename {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_unsafe_characters() {
        assert_eq!(
            make_file_name_safe("That's Mr. Subject to you Pal!", ""),
            "ThatsMr.SubjecttoyouPal"
        );
    }

    #[test]
    fn collapses_runs_to_single_replacement() {
        assert_eq!(make_file_name_safe("a  / b", "_"), "a_b");
    }

    #[test]
    fn strips_leading_dot() {
        assert_eq!(make_file_name_safe(".hidden", ""), "hidden");
    }

    #[test]
    fn output_is_safe_and_idempotent() {
        let pattern = Regex::new(r"^[A-Za-z0-9_.-]*$").unwrap();
        for input in ["sub-01", "été ça!", "..weird..", "a b\tc", ""] {
            let once = make_file_name_safe(input, "");
            assert!(pattern.is_match(&once), "unsafe output {once:?}");
            assert!(!once.starts_with('.'));
            assert_eq!(make_file_name_safe(&once, ""), once);
        }
    }

    #[test]
    fn unsafe_replacement_falls_back_to_removal() {
        assert_eq!(make_file_name_safe("a b", "!!"), "ab");
    }

    #[test]
    fn despace_renames_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("some dir");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("a file.nii"), b"x").unwrap();

        despace(dir.path()).unwrap();

        assert!(dir.path().join("some_dir/a_file.nii").is_file());
        assert!(!dir.path().join("some dir").exists());
    }
}
