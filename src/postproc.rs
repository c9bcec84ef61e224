//! Optional post-processing of a completed reconstruction.
//!
//! Every step is gated by its own configuration flag and runs external
//! commands against the subject's result tree. Steps that produce a tabular
//! result reformat it into a comma-delimited file in the output directory
//! and fold it into the metadata record; a missing table is logged and
//! skipped, never fatal. The whole catalogue gets one retry: the first
//! error abandons the remaining steps for that attempt.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::command::CommandSpec;
use crate::config::WrapperSettings;
use crate::context::GearContext;
use crate::exec::exec_command;
use crate::metadata::{parse_pair_table, parse_two_row_table, whitespace_to_csv, MetadataRecord};
use crate::notices::NoticeLog;

/// Surfaces converted to object files by the surface-conversion step.
const SURFACES: [&str; 6] = [
    "lh.pial",
    "rh.pial",
    "lh.white",
    "rh.white",
    "rh.inflated",
    "lh.inflated",
];

/// Volumes always converted to NIfTI by the volume-conversion step.
const MRI_MGZ_FILES: [&str; 9] = [
    "aparc+aseg.mgz",
    "aparc.a2009s+aseg.mgz",
    "brainmask.mgz",
    "lh.ribbon.mgz",
    "rh.ribbon.mgz",
    "ribbon.mgz",
    "aseg.mgz",
    "orig.mgz",
    "T1.mgz",
];

/// Parcellation atlases exported by the stats step, per hemisphere.
const PARCELLATIONS: [&str; 4] = ["aparc.a2009s", "aparc", "aparc.DKTatlas", "aparc.pial"];

/// Everything a post-processing step needs to run.
pub struct StepContext<'a> {
    pub subject_id: &'a str,
    pub subjects_dir: &'a Path,
    pub output_dir: &'a Path,
    pub base_dir: &'a Path,
    pub environ: &'a BTreeMap<String, String>,
    pub dry_run: bool,
}

impl StepContext<'_> {
    pub fn subject_dir(&self) -> PathBuf {
        self.subjects_dir.join(self.subject_id)
    }

    pub fn mri_dir(&self) -> PathBuf {
        self.subject_dir().join("mri")
    }

    pub fn surf_dir(&self) -> PathBuf {
        self.subject_dir().join("surf")
    }

    fn run(&self, tokens: &[String]) -> Result<()> {
        let spec = CommandSpec::new(tokens.to_vec());
        if self.dry_run {
            tracing::info!("dry-run, NOT running: {spec}");
            return Ok(());
        }
        exec_command(&spec, self.environ, None)
    }

    /// Run a command and capture its stdout (for tools that write results
    /// to standard output). Returns `None` in dry-run mode.
    fn run_capture(&self, tokens: &[String]) -> Result<Option<Vec<u8>>> {
        let spec = CommandSpec::new(tokens.to_vec());
        if self.dry_run {
            tracing::info!("dry-run, NOT running: {spec}");
            return Ok(None);
        }
        tracing::info!("executing: {spec}");
        let output = Command::new(spec.program())
            .args(spec.args())
            .env_clear()
            .envs(self.environ)
            .output()
            .map_err(|err| anyhow!("could not start {}: {err}", spec.program()))?;
        if !output.status.success() {
            return Err(anyhow!("{} failed: {}", spec.program(), output.status));
        }
        Ok(Some(output.stdout))
    }
}

fn tokens(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

/// Reformat a whitespace table into `<subject>_<name>.csv` in the output
/// directory and fold it into the metadata record under `<name>`.
///
/// The source file being absent is logged and skipped.
fn export_table(
    step: &StepContext<'_>,
    source: &Path,
    name: &str,
    metadata: &mut MetadataRecord,
) -> Result<()> {
    if !source.exists() {
        tracing::info!(
            "{} does not exist, no table for {name}",
            source.display()
        );
        return Ok(());
    }
    let text = fs::read_to_string(source)
        .with_context(|| format!("read {}", source.display()))?;
    let csv = whitespace_to_csv(&text);
    let dest = step
        .output_dir
        .join(format!("{}_{name}.csv", step.subject_id));
    fs::write(&dest, &csv).with_context(|| format!("write {}", dest.display()))?;
    tracing::info!("Wrote {}", dest.display());

    metadata.insert_table(name, parse_pair_table(&text));
    Ok(())
}

/// Segment hippocampal subfields and export both hemisphere volume tables.
pub fn do_hippocampal_subfields(
    step: &StepContext<'_>,
    metadata: &mut MetadataRecord,
) -> Result<()> {
    tracing::info!("Starting segmentation of hippocampal subfields...");
    step.run(&tokens(&[
        "recon-all",
        "-subjid",
        step.subject_id,
        "-hippocampal-subfields-T1",
    ]))?;

    for hemi in ["lh", "rh"] {
        let source = step
            .mri_dir()
            .join(format!("{hemi}.hippoSfVolumes-T1.v10.txt"));
        export_table(
            step,
            &source,
            &format!("{hemi}_hippoSfVolumes-T1.v10"),
            metadata,
        )?;
    }
    Ok(())
}

/// Segment brainstem structures and export the volume table.
pub fn do_brainstem_structures(
    step: &StepContext<'_>,
    metadata: &mut MetadataRecord,
) -> Result<()> {
    tracing::info!("Starting segmentation of brainstem structures...");
    step.run(&tokens(&[
        "recon-all",
        "-subjid",
        step.subject_id,
        "-brainstem-structures",
    ]))?;

    let table = step.mri_dir().join("BrainstemStructures.txt");
    step.run(&tokens(&[
        "quantifyBrainstemStructures.sh",
        &table.display().to_string(),
    ]))?;
    export_table(step, &table, "BrainstemStructures", metadata)
}

/// Segment thalamic nuclei and export the volume table.
pub fn do_thalamic_nuclei(
    step: &StepContext<'_>,
    metadata: &mut MetadataRecord,
) -> Result<()> {
    tracing::info!("Starting segmentation of thalamic nuclei...");
    step.run(&tokens(&["segmentThalamicNuclei.sh", step.subject_id]))?;

    let source = step.mri_dir().join("ThalamicNuclei.v12.T1.volumes.txt");
    export_table(step, &source, "ThalamicNuclei.v12.T1.volumes", metadata)
}

/// Segment hypothalamic subunits. The volume table is copied to the output
/// directory but not folded into metadata.
pub fn do_hypothalamic_subunits(step: &StepContext<'_>) -> Result<()> {
    tracing::info!("Starting segmentation of hypothalamic subunits...");
    step.run(&tokens(&[
        "mri_segment_hypothalamic_subunits",
        "--s",
        step.subject_id,
    ]))?;

    let source = step.mri_dir().join("hypothalamic_subunits_volumes.v1.csv");
    if source.exists() {
        let dest = step.output_dir.join(format!(
            "{}_hypothalamic_subunits_volumes.v1.csv",
            step.subject_id
        ));
        fs::copy(&source, &dest)
            .with_context(|| format!("copy {}", source.display()))?;
        tracing::info!("Wrote {}", dest.display());
    } else {
        tracing::info!(
            "{} does not exist, no hypothalamic table",
            source.display()
        );
    }
    Ok(())
}

/// Run the PET partial-volume segmentation.
pub fn do_gtmseg(step: &StepContext<'_>) -> Result<()> {
    tracing::info!("Starting gtmseg...");
    step.run(&tokens(&["gtmseg", "--s", step.subject_id]))
}

/// Cross-register both hemispheres to the symmetric template.
pub fn do_register_surfaces(step: &StepContext<'_>) -> Result<()> {
    tracing::info!("Running surface registrations...");
    step.run(&tokens(&["xhemireg", "--s", step.subject_id]))?;
    step.run(&tokens(&[
        "surfreg",
        "--s",
        step.subject_id,
        "--t",
        "fsaverage_sym",
        "--lh",
    ]))?;
    step.run(&tokens(&[
        "surfreg",
        "--s",
        step.subject_id,
        "--t",
        "fsaverage_sym",
        "--lh",
        "--xhemi",
    ]))
}

/// Convert the canonical surfaces to object files in the output directory.
pub fn do_convert_surfaces(step: &StepContext<'_>) -> Result<()> {
    tracing::info!("Converting surfaces to object (.obj) files...");
    let surf_dir = step.surf_dir();
    let srf2obj = step.base_dir.join("srf2obj");
    for surf in SURFACES {
        let ascii = surf_dir.join(format!("{surf}.asc"));
        step.run(&[
            "mris_convert".to_string(),
            surf_dir.join(surf).display().to_string(),
            ascii.display().to_string(),
        ])?;
        let captured = step.run_capture(&[
            srf2obj.display().to_string(),
            ascii.display().to_string(),
        ])?;
        if let Some(bytes) = captured {
            let dest = step.output_dir.join(format!("{surf}.obj"));
            fs::write(&dest, bytes)
                .with_context(|| format!("write {}", dest.display()))?;
        }
    }
    Ok(())
}

/// Volumes the conversion step should handle given the enabled
/// segmentations.
pub fn volumes_to_convert(settings: &WrapperSettings) -> Vec<String> {
    let mut files: Vec<String> = MRI_MGZ_FILES
        .iter()
        .map(|file| file.to_string())
        .collect();
    if settings.hippocampal_subfields {
        files.push("lh.hippoSfLabels-T1.v10.FSvoxelSpace.mgz".to_string());
        files.push("rh.hippoSfLabels-T1.v10.FSvoxelSpace.mgz".to_string());
    }
    if settings.brainstem_structures {
        files.push("brainstemSsLabels.v12.FSvoxelSpace.mgz".to_string());
    }
    if settings.thalamic_nuclei {
        files.push("ThalamicNuclei.v12.T1.FSvoxelSpace.mgz".to_string());
    }
    files
}

/// Convert selected result volumes to NIfTI files in the output directory.
pub fn do_convert_volumes(
    step: &StepContext<'_>,
    settings: &WrapperSettings,
) -> Result<()> {
    tracing::info!("Converting volumes to NIfTI files...");
    let mri_dir = step.mri_dir();
    for file in volumes_to_convert(settings) {
        let dest = step
            .output_dir
            .join(file.replace(".mgz", ".nii.gz"));
        step.run(&[
            "mri_convert".to_string(),
            "-i".to_string(),
            mri_dir.join(&file).display().to_string(),
            "-o".to_string(),
            dest.display().to_string(),
        ])?;
    }
    Ok(())
}

/// Export whole-brain and parcellation statistics as comma-delimited tables
/// and fold each one into the metadata record.
pub fn do_convert_stats(
    step: &StepContext<'_>,
    metadata: &mut MetadataRecord,
) -> Result<()> {
    tracing::info!("Exporting stats files csv...");

    let mut names = vec!["aseg_stats_vol_mm3".to_string()];
    let aseg_table = step
        .output_dir
        .join(format!("{}_aseg_stats_vol_mm3.csv", step.subject_id));
    step.run(&[
        "asegstats2table".to_string(),
        "-s".to_string(),
        step.subject_id.to_string(),
        "--delimiter".to_string(),
        "comma".to_string(),
        format!("--tablefile={}", aseg_table.display()),
    ])?;

    for hemi in ["lh", "rh"] {
        for parc in PARCELLATIONS {
            let name = format!("{hemi}_{parc}_stats_area_mm2");
            let table = step
                .output_dir
                .join(format!("{}_{name}.csv", step.subject_id));
            step.run(&[
                "aparcstats2table".to_string(),
                "-s".to_string(),
                step.subject_id.to_string(),
                format!("--hemi={hemi}"),
                "--delimiter=comma".to_string(),
                format!("--parc={parc}"),
                format!("--tablefile={}", table.display()),
            ])?;
            names.push(name);
        }
    }

    // Fold whatever tables actually appeared; the export tools silently
    // skip stats files the run did not produce.
    for name in names {
        let table = step
            .output_dir
            .join(format!("{}_{name}.csv", step.subject_id));
        if !table.exists() {
            tracing::info!("{} does not exist, skipping", table.display());
            continue;
        }
        let text = fs::read_to_string(&table)
            .with_context(|| format!("read {}", table.display()))?;
        metadata.insert_table(&name, parse_two_row_table(&text));
    }
    Ok(())
}

fn run_catalogue(
    step: &StepContext<'_>,
    settings: &WrapperSettings,
    metadata: &mut MetadataRecord,
) -> Result<()> {
    if settings.hippocampal_subfields {
        do_hippocampal_subfields(step, metadata)?;
    }
    if settings.brainstem_structures {
        do_brainstem_structures(step, metadata)?;
    }
    if settings.thalamic_nuclei {
        do_thalamic_nuclei(step, metadata)?;
    }
    if settings.hypothalamic_subunits {
        do_hypothalamic_subunits(step)?;
    }
    if settings.gtmseg {
        do_gtmseg(step)?;
    }
    if settings.register_surfaces {
        do_register_surfaces(step)?;
    }
    if settings.convert_surfaces {
        do_convert_surfaces(step)?;
    }
    if settings.convert_volumes {
        do_convert_volumes(step, settings)?;
    }
    if settings.convert_stats {
        do_convert_stats(step, metadata)?;
    }
    Ok(())
}

/// Run the enabled steps with one whole-catalogue retry.
///
/// A second failure is terminal for post-processing but does not roll back
/// anything the primary run or an earlier attempt already produced.
pub fn run_post_processing(
    context: &GearContext,
    subject_id: &str,
    metadata: &mut MetadataRecord,
    notices: &mut NoticeLog,
) {
    let step = StepContext {
        subject_id,
        subjects_dir: &context.subjects_dir,
        output_dir: &context.output_dir,
        base_dir: &context.base_dir,
        environ: &context.environ,
        dry_run: context.config.wrapper.dry_run,
    };
    let settings = &context.config.wrapper;

    match run_catalogue(&step, settings, metadata) {
        Ok(()) => {}
        Err(first_err) => {
            notices.warn(format!(
                "post-processing failed ({first_err:#}), retrying once"
            ));
            if let Err(second_err) = run_catalogue(&step, settings, metadata) {
                notices.error_with_cause("Post-processing failed.", &second_err);
            }
        }
    }
}
