//! Package results for the platform: the primary output archive, optional
//! intermediate archives, and individually zipped HTML files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::archive::{zip_dir, zip_paths};
use crate::context::{GearContext, GEAR_NAME};

/// Zip the per-run output tree into
/// `<gear>_<run_label>_<destination_id>.zip` at the output root.
pub fn zip_output(context: &GearContext, subject_id: &str, run_label: &str) -> Result<()> {
    zip_output_from(context, &context.output_dir, subject_id, run_label)
}

/// Same as [`zip_output`], but taking the subject tree from `root` — used
/// when the reconstruction left its results in the subjects directory
/// rather than under output/.
pub fn zip_output_from(
    context: &GearContext,
    root: &Path,
    subject_id: &str,
    run_label: &str,
) -> Result<()> {
    let zip_file_name = format!(
        "{GEAR_NAME}_{run_label}_{}.zip",
        context.destination.id
    );
    tracing::info!("Zipping output file {zip_file_name}");
    zip_dir(root, subject_id, &context.output_dir.join(zip_file_name))
}

/// Zip the entire work directory into
/// `<gear>_work_<run_label>_<destination_id>.zip`.
pub fn zip_all_intermediate_output(context: &GearContext, run_label: &str) -> Result<()> {
    let file_name = format!(
        "{GEAR_NAME}_work_{run_label}_{}.zip",
        context.destination.id
    );
    let work_name = context
        .work_dir
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("work");
    let work_parent = context
        .work_dir
        .parent()
        .unwrap_or(Path::new("."));
    tracing::info!("Zipping work directory to {file_name}.");
    zip_dir(work_parent, work_name, &context.output_dir.join(file_name))
}

/// Zip the intermediate files and folders named in the configuration into
/// `<gear>_work_selected_<run_label>_<destination_id>.zip`.
///
/// Names are matched anywhere under the work directory; names that match
/// nothing are logged as errors but do not fail the run.
pub fn zip_intermediate_selected(context: &GearContext, run_label: &str) -> Result<()> {
    let files: Vec<&str> = context
        .config
        .wrapper
        .intermediate_files
        .split_whitespace()
        .collect();
    let folders: Vec<&str> = context
        .config
        .wrapper
        .intermediate_folders
        .split_whitespace()
        .collect();
    if files.is_empty() && folders.is_empty() {
        tracing::debug!("No files or folders specified in config to zip");
        return Ok(());
    }

    let dest_zip = context.output_dir.join(format!(
        "{GEAR_NAME}_work_selected_{run_label}_{}.zip",
        context.destination.id
    ));
    tracing::info!(
        "Files and folders will be zipped to \"{}\"",
        dest_zip.display()
    );

    let mut matched: Vec<PathBuf> = Vec::new();
    let mut files_found: Vec<String> = Vec::new();
    let mut folders_found: Vec<String> = Vec::new();

    for entry in walkdir::WalkDir::new(&context.work_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if entry.file_type().is_file() && files.contains(&name) {
            tracing::info!("Zipping file:   {}", entry.path().display());
            files_found.push(name.to_string());
            matched.push(entry.path().to_path_buf());
        } else if entry.file_type().is_dir() && folders.contains(&name) {
            tracing::info!("Zipping folder: {}", entry.path().display());
            folders_found.push(name.to_string());
            matched.push(entry.path().to_path_buf());
        }
    }

    for file in &files {
        if !files_found.iter().any(|found| found == file) {
            tracing::error!("Could not find file '{file}'");
        }
    }
    for folder in &folders {
        if !folders_found.iter().any(|found| found == folder) {
            tracing::error!("Could not find folder '{folder}'");
        }
    }

    zip_paths(&context.work_dir, &matched, &dest_zip)
}

/// Zip each HTML file at `path` individually so the platform can display it:
/// the archive holds the file renamed to `index.html`.
pub fn zip_htmls(output_dir: &Path, destination_id: &str, path: &Path) -> Result<()> {
    tracing::info!("Creating viewable archives for all html files");
    if !path.exists() {
        tracing::error!("Path NOT found: {}", path.display());
        return Ok(());
    }

    let mut found_any = false;
    for entry in fs::read_dir(path).with_context(|| format!("read {}", path.display()))? {
        let entry = entry?;
        let file_path = entry.path();
        if file_path.extension().and_then(|ext| ext.to_str()) != Some("html") {
            continue;
        }
        found_any = true;
        let name = file_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("index");
        let dest_zip = output_dir.join(format!("{name}_{destination_id}.html.zip"));
        tracing::info!("Creating viewable archive \"{}\"", dest_zip.display());

        let staging = tempfile::tempdir().context("create staging dir")?;
        let index_dir = staging.path().join("html");
        fs::create_dir_all(&index_dir)?;
        fs::copy(&file_path, index_dir.join("index.html"))
            .with_context(|| format!("copy {}", file_path.display()))?;
        zip_paths(&index_dir, &[index_dir.join("index.html")], &dest_zip)?;
    }

    if !found_any {
        tracing::warn!("No *.html files at {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GearConfig;
    use crate::context::Destination;
    use std::collections::BTreeMap;

    fn test_context(base: &Path) -> GearContext {
        let context = GearContext {
            base_dir: base.to_path_buf(),
            input_dir: base.join("input"),
            output_dir: base.join("output"),
            work_dir: base.join("work"),
            subjects_dir: base.join("subjects"),
            freesurfer_home: base.join("freesurfer"),
            destination: Destination {
                id: "5db3392669d4f3002a16ec4c".to_string(),
                container_type: "analysis".to_string(),
            },
            config: GearConfig::default(),
            inputs: BTreeMap::new(),
            environ: BTreeMap::new(),
        };
        for dir in [&context.output_dir, &context.work_dir] {
            fs::create_dir_all(dir).unwrap();
        }
        context
    }

    #[test]
    fn output_archive_is_named_after_run_and_destination() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());
        let subject = context.output_dir.join("TOME_3024/mri");
        fs::create_dir_all(&subject).unwrap();
        fs::write(subject.join("aseg.mgz"), b"x").unwrap();

        zip_output(&context, "TOME_3024", "TOME_3024").unwrap();

        assert!(context
            .output_dir
            .join("freesurfer-recon-all_TOME_3024_5db3392669d4f3002a16ec4c.zip")
            .is_file());
    }

    #[test]
    fn selected_intermediates_are_matched_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = test_context(dir.path());
        context.config.wrapper.intermediate_files = "keep.txt".to_string();
        context.config.wrapper.intermediate_folders = "logs".to_string();
        fs::create_dir_all(context.work_dir.join("deep/logs")).unwrap();
        fs::write(context.work_dir.join("deep/keep.txt"), b"x").unwrap();
        fs::write(context.work_dir.join("deep/logs/run.log"), b"x").unwrap();
        fs::write(context.work_dir.join("drop.txt"), b"x").unwrap();

        zip_intermediate_selected(&context, "run1").unwrap();

        let dest = context.output_dir.join(
            "freesurfer-recon-all_work_selected_run1_5db3392669d4f3002a16ec4c.zip",
        );
        assert!(dest.is_file());
        let zip = zip::ZipArchive::new(fs::File::open(&dest).unwrap()).unwrap();
        let names: Vec<&str> = zip.file_names().collect();
        assert!(names.contains(&"deep/keep.txt"));
        assert!(names.contains(&"deep/logs/run.log"));
        assert!(!names.contains(&"drop.txt"));
    }

    #[test]
    fn html_files_become_individual_archives() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());
        let html_dir = context.output_dir.join("TOME_3024");
        fs::create_dir_all(&html_dir).unwrap();
        fs::write(html_dir.join("report.html"), b"<html></html>").unwrap();

        zip_htmls(&context.output_dir, &context.destination.id, &html_dir).unwrap();

        let dest = context
            .output_dir
            .join("report_5db3392669d4f3002a16ec4c.html.zip");
        assert!(dest.is_file());
        let zip = zip::ZipArchive::new(fs::File::open(&dest).unwrap()).unwrap();
        let names: Vec<&str> = zip.file_names().collect();
        assert_eq!(names, ["index.html"]);
    }
}
