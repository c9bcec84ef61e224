//! Anatomical input resolution.
//!
//! One invocation gets its input from exactly one of three sources, tried in
//! priority order: a previous-run archive (resume), direct anatomical files
//! (NIfTI or a DICOM series), or a BIDS download. "No usable input" is fatal
//! because no sensible command can be built without one.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::archive::{first_entry_name, unzip_archive};
use crate::context::{GearContext, GEAR_NAME};
use crate::notices::NoticeLog;
use crate::sanitize::{despace, make_file_name_safe};

/// Input directory names scanned for extra T1 volumes.
pub const EXTRA_T1_DIRS: [&str; 4] = [
    "t1w_anatomical_2",
    "t1w_anatomical_3",
    "t1w_anatomical_4",
    "t1w_anatomical_5",
];

/// Input directory name scanned for a T2 volume.
pub const T2_DIR: &str = "t2w_anatomical";

/// The one primary input plus auxiliary inputs for the main command.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedInput {
    /// A previous run was unpacked; the tool resumes from the subject dir.
    Resume { subject_id: String },
    /// Fresh reconstruction from anatomical files.
    Fresh {
        primary: PathBuf,
        extra_t1s: Vec<PathBuf>,
        t2: Option<PathBuf>,
    },
    /// BIDS-formatted data; the command takes three positional arguments.
    Bids {
        bids_dir: PathBuf,
        output_dir: PathBuf,
    },
}

/// Look for a previous-run archive under the anatomical input directory and
/// unpack it into the subjects directory.
///
/// Returns the sanitized subject id recovered from the archive, or `None`
/// when no archive is present. A present archive whose unpacked subject
/// directory cannot be found is fatal.
pub fn find_previous_run(
    context: &GearContext,
    configured_subject_id: &str,
    notices: &mut NoticeLog,
) -> Result<Option<String>> {
    let anat_dir = context.input_dir.join("anatomical");
    let archives = find_archives(&anat_dir);
    let Some(archive) = archives.first() else {
        return Ok(None);
    };
    if archives.len() > 1 {
        notices.warn(format!(
            "Found {} previous freesurfer runs. Using first",
            archives.len()
        ));
    }

    unzip_archive(archive, &context.subjects_dir)?;

    let mut subject_id = match first_entry_name(archive) {
        Ok(Some(entry)) => entry
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string(),
        Ok(None) | Err(_) => String::new(),
    };
    if subject_id.is_empty() {
        subject_id = configured_subject_id.to_string();
    }
    let subject_id = make_file_name_safe(&subject_id, "");

    if !context.subjects_dir.join(&subject_id).exists() {
        return Err(anyhow!(
            "No SUBJECT DIR could be found after unpacking {}! Cannot continue",
            archive.display()
        ));
    }

    tracing::info!(
        "recon-all running from previous run...(recon-all -subjid {subject_id})"
    );
    Ok(Some(subject_id))
}

fn find_archives(anat_dir: &Path) -> Vec<PathBuf> {
    let mut archives = Vec::new();
    if !anat_dir.is_dir() {
        return archives;
    }
    for entry in walkdir::WalkDir::new(anat_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with(GEAR_NAME) && name.ends_with(".zip") {
            archives.push(entry.path().to_path_buf());
        }
    }
    archives
}

/// Resolve direct anatomical file input: one NIfTI, or a DICOM series, plus
/// auxiliary T1/T2 volumes. Empty input is fatal.
pub fn resolve_direct_input(
    context: &GearContext,
    notices: &mut NoticeLog,
) -> Result<ResolvedInput> {
    let anat_dir = context.input_dir.join("anatomical");
    despace(&anat_dir)?;

    let niftis = find_niftis(&anat_dir);
    let primary = match niftis.len() {
        1 => niftis[0].clone(),
        0 => resolve_dicom_input(context, &anat_dir)?,
        count => {
            notices.warn(format!("What?  Found {count} NIfTI files!"));
            niftis[0].clone()
        }
    };
    tracing::info!("anatomical is '{}'", primary.display());

    let mut extra_t1s = Vec::new();
    for dir_name in EXTRA_T1_DIRS {
        let dir = context.input_dir.join(dir_name);
        if !dir.is_dir() {
            continue;
        }
        despace(&dir)?;
        if let Some(first) = find_niftis(&dir).into_iter().next() {
            tracing::info!("Adding {} to the processing stream...", first.display());
            extra_t1s.push(first);
        }
    }

    let mut t2 = None;
    let t2_dir = context.input_dir.join(T2_DIR);
    if t2_dir.is_dir() {
        despace(&t2_dir)?;
        if let Some(first) = find_niftis(&t2_dir).into_iter().next() {
            tracing::info!("Adding {} to the processing stream...", first.display());
            t2 = Some(first);
        }
    }

    Ok(ResolvedInput::Fresh {
        primary,
        extra_t1s,
        t2,
    })
}

/// No NIfTI was found, so treat the input as a DICOM series: the first
/// non-hidden regular file, unpacking a lone zip archive first if that is
/// what was provided.
fn resolve_dicom_input(context: &GearContext, anat_dir: &Path) -> Result<PathBuf> {
    let candidates = find_regular_files(&context.input_dir);
    let Some(first) = candidates.first() else {
        return Err(anyhow!(
            "Anatomical input could not be found in {}! Exiting (1)",
            anat_dir.display()
        ));
    };

    if first.extension().and_then(|ext| ext.to_str()) == Some("zip") {
        let dicom_dir = anat_dir.join("dicoms");
        fs::create_dir_all(&dicom_dir)
            .with_context(|| format!("create {}", dicom_dir.display()))?;
        unzip_archive(first, &dicom_dir)?;
        despace(&dicom_dir)?;
        let unpacked = find_regular_files(&dicom_dir);
        return unpacked.first().cloned().ok_or_else(|| {
            anyhow!(
                "Anatomical archive {} contained no usable files",
                first.display()
            )
        });
    }

    Ok(first.clone())
}

fn find_niftis(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".nii"))
        .map(|entry| entry.path().to_path_buf())
        .collect()
}

/// All non-hidden regular files under `dir`, skipping hidden directories.
fn find_regular_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
        .collect()
}
