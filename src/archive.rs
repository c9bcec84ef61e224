//! Zip archive primitives used for input unpacking and output packaging.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// Unpack `archive` into `dest`, creating directories as needed.
///
/// Entries that would escape `dest` are refused.
pub fn unzip_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive)
        .with_context(|| format!("open archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(file)
        .with_context(|| format!("read archive {}", archive.display()))?;

    tracing::info!(
        "Unzipping {} into {}",
        archive.display(),
        dest.display()
    );

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(anyhow!(
                "archive entry {:?} escapes the destination",
                entry.name()
            ));
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut out = fs::File::create(&target)
            .with_context(|| format!("write {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("extract {}", target.display()))?;
    }
    Ok(())
}

/// Name of the first entry in the archive, used to recover the subject id
/// from a previous-run archive's internal top-level directory.
pub fn first_entry_name(archive: &Path) -> Result<Option<String>> {
    let file = fs::File::open(archive)
        .with_context(|| format!("open archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(file)
        .with_context(|| format!("read archive {}", archive.display()))?;
    if zip.is_empty() {
        return Ok(None);
    }
    let entry = zip.by_index(0)?;
    Ok(Some(entry.name().to_string()))
}

/// Zip the directory `root/<subdir>` into `dest_zip`, with entry paths
/// rooted at `<subdir>/` so unpacking recreates the directory.
pub fn zip_dir(root: &Path, subdir: &str, dest_zip: &Path) -> Result<()> {
    let source = root.join(subdir);
    if !source.is_dir() {
        return Err(anyhow!("nothing to zip at {}", source.display()));
    }

    tracing::info!("Zipping {} to {}", source.display(), dest_zip.display());

    let file = fs::File::create(dest_zip)
        .with_context(|| format!("create {}", dest_zip.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default();

    for entry in walkdir::WalkDir::new(&source)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path();
        let relative = path.strip_prefix(root).context("strip zip root prefix")?;
        let name = relative.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            writer.add_directory(format!("{name}/"), options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(&name, options)?;
            let bytes =
                fs::read(path).with_context(|| format!("read {}", path.display()))?;
            writer.write_all(&bytes)?;
        }
    }
    writer.finish()?;
    Ok(())
}

/// Zip an explicit set of paths (files or whole folders) found under
/// `work_dir`, with entry names relative to `work_dir`.
pub fn zip_paths(work_dir: &Path, paths: &[PathBuf], dest_zip: &Path) -> Result<()> {
    let file = fs::File::create(dest_zip)
        .with_context(|| format!("create {}", dest_zip.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default();

    for path in paths {
        if path.is_file() {
            add_file(&mut writer, work_dir, path, options)?;
        } else if path.is_dir() {
            for entry in walkdir::WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
            {
                if entry.file_type().is_file() {
                    add_file(&mut writer, work_dir, entry.path(), options)?;
                }
            }
        }
    }
    writer.finish()?;
    Ok(())
}

fn add_file(
    writer: &mut ZipWriter<fs::File>,
    root: &Path,
    path: &Path,
    options: FileOptions,
) -> Result<()> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let name = relative.to_string_lossy().replace('\\', "/");
    writer.start_file(&name, options)?;
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    writer.write_all(&bytes)?;
    Ok(())
}
