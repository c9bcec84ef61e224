//! HTML `tree`-style listing of a downloaded directory.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Write a `tree` listing of `directory` as `<base_name>.html`.
///
/// `extra` text is appended after the listing; it carries the hierarchy
/// context and the final download/validation status so the artifact is
/// useful on its own when debugging a failed run.
pub fn tree_bids(
    directory: Option<&Path>,
    base_name: &Path,
    title: Option<&str>,
    extra: Option<&str>,
) -> Result<()> {
    let display_name = directory
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| "(unknown)".to_string());
    let title = title.unwrap_or("");

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n  <head>\n");
    html.push_str(
        "    <meta http-equiv=\"content-type\" content=\"text/html; charset=UTF-8\">\n",
    );
    html.push_str(&format!("    <title>tree {display_name}</title>\n"));
    html.push_str("  </head>\n  <body>\n");
    html.push_str(&format!("  <h1>{title}</h1>\n"));
    html.push_str(&format!("  <b>{display_name}</b>\n<pre>\n"));

    tracing::info!("Getting \"tree\" listing of {display_name}/");
    html.push_str(&format!("{display_name}/\n"));

    let mut num_dirs = 0usize;
    let mut num_files = 0usize;

    if let Some(directory) = directory.filter(|dir| dir.exists()) {
        for entry in walkdir::WalkDir::new(directory)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            let depth = entry.depth();
            let spacer = "    ".repeat(depth);
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                num_dirs += 1;
                html.push_str(&format!("{spacer}{name}/\n"));
            } else {
                num_files += 1;
                html.push_str(&format!("{spacer}{name}\n"));
            }
        }
    }

    html.push_str(&format!("{num_dirs} directories, {num_files} files\n"));

    if let Some(extra) = extra {
        html.push_str(&format!("\n{extra}\n"));
    }

    html.push_str("</pre>\n  </body>\n</html>\n");

    let out_path = base_name.with_extension("html");
    fs::write(&out_path, html)
        .with_context(|| format!("write {}", out_path.display()))?;
    tracing::info!("Wrote \"{}\"", out_path.display());
    Ok(())
}
