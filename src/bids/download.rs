//! Download BIDS data for the current run level and validate it.
//!
//! Outcomes collapse into one flat integer code so callers gate on a single
//! `> 0` comparison:
//!   0   no error
//!   10  BIDS validation errors were detected
//!   11  the validator could not be run
//!   12  unexpected shape in validator output
//!   20  running at an unsupported level
//!   21  BIDS export error
//!   22  exception while validating
//!   23  attempt to download an unknown acquisition
//!   24  destination does not exist
//!   25  API exception during download
//!   26  no BIDS data was downloaded

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::bids::hierarchy::{Hierarchy, RunLevel};
use crate::bids::tree::tree_bids;
use crate::bids::validate::validate_bids;
use crate::context::Destination;
use crate::platform::{BidsFilter, PlatformClient, PlatformError};

pub const BIDS_OK: i32 = 0;
pub const BIDS_WRONG_LEVEL: i32 = 20;
pub const BIDS_EXPORT_ERROR: i32 = 21;
pub const BIDS_VALIDATOR_EXCEPTION: i32 = 22;
pub const BIDS_UNKNOWN_ACQUISITION: i32 = 23;
pub const BIDS_NO_DESTINATION: i32 = 24;
pub const BIDS_API_EXCEPTION: i32 = 25;
pub const BIDS_NOTHING_DOWNLOADED: i32 = 26;

/// Knobs for one download-and-validate pass.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Write an HTML tree listing of the downloaded directory.
    pub tree: bool,
    pub tree_title: Option<String>,
    /// Also download source data (e.g. dicoms).
    pub src_data: bool,
    /// Restrict the download to these BIDS folders; empty means no limit.
    pub folders: Vec<String>,
    pub dry_run: bool,
    pub do_validate_bids: bool,
}

fn default_dataset_description() -> Value {
    json!({
        "Acknowledgements": "",
        "Authors": [],
        "BIDSVersion": "1.2.0",
        "DatasetDOI": "",
        "Funding": [],
        "HowToAcknowledge": "",
        "License": "",
        "Name": "tome",
        "ReferencesAndLinks": [],
        "template": "project"
    })
}

/// Make sure `dataset_description.json` exists and that `Funding` is a list.
///
/// The platform's BIDS template has shipped `Funding` as a scalar, which the
/// validator rejects. A scalar is wrapped into a one-element list; a missing
/// file is synthesized from the default description.
pub fn fix_dataset_description(bids_path: &Path) -> Result<()> {
    let description_file = bids_path.join("dataset_description.json");

    let (mut data, mut need_to_write) = if description_file.exists() {
        let text = fs::read_to_string(&description_file)
            .with_context(|| format!("read {}", description_file.display()))?;
        let data: Value = serde_json::from_str(&text)
            .with_context(|| format!("parse {}", description_file.display()))?;
        (data, false)
    } else {
        tracing::info!("Creating default dataset_description.json file");
        (default_dataset_description(), true)
    };

    match data.get("Funding") {
        Some(Value::Array(_)) => {}
        Some(other) => {
            tracing::warn!("dataset_description Funding is not a list");
            let wrapped = Value::Array(vec![other.clone()]);
            data["Funding"] = wrapped;
            need_to_write = true;
        }
        None => {
            tracing::warn!("dataset_description has no Funding field");
            data["Funding"] = Value::Array(Vec::new());
            need_to_write = true;
        }
    }

    if need_to_write {
        fs::write(&description_file, serde_json::to_string(&data)?)
            .with_context(|| format!("write {}", description_file.display()))?;
    }
    Ok(())
}

/// Figure out the run level, download the right BIDS subset, validate it,
/// and write the tree listing. Returns the flat error code.
pub fn download_bids_for_runlevel(
    client: &dyn PlatformClient,
    work_dir: &Path,
    output_dir: &Path,
    destination: &Destination,
    hierarchy: &mut Hierarchy,
    opts: &DownloadOptions,
) -> i32 {
    let mut extra_tree_text = String::new();
    let mut err_code = BIDS_OK;

    let mut run_level = hierarchy.run_level;
    extra_tree_text.push_str(&format!("run_level is {}\n", run_level.as_str()));
    for (key, value) in hierarchy.rows() {
        extra_tree_text.push_str(&format!("  {key:<18}: {value}\n"));
    }
    extra_tree_text.push_str(&format!("  {:<18}: {:?}\n", "folders", opts.folders));
    extra_tree_text.push_str(&format!(
        "  {:<18}: {}\n",
        "source data?",
        if opts.src_data { "downloaded" } else { "not downloaded" }
    ));
    extra_tree_text.push_str(&format!(
        "  {:<18}: {}\n\n",
        "dry run?",
        if opts.dry_run { "Yes" } else { "No" }
    ));

    let bids_dir = work_dir.join("bids");
    let mut bids_path: Option<PathBuf> = None;

    if run_level == RunLevel::NoDestination {
        let msg = "Destination does not exist.";
        tracing::error!("{msg}");
        extra_tree_text.push_str(&format!("ERROR: {msg}\n"));
        err_code = BIDS_NO_DESTINATION;
    } else {
        // A gear run directly on an acquisition has no analysis parent, so
        // the generic classification must be overridden.
        if destination.container_type == "acquisition" {
            tracing::info!("Destination is acquisition, changing run_level to acquisition");
            if let Ok(acquisition) = client.get_container(&destination.id) {
                extra_tree_text.push_str(&format!(
                    "  {:<18}: changed to {}\n\n",
                    "acquisition_label", acquisition.label
                ));
                hierarchy.acquisition_label = acquisition.label;
            }
            run_level = RunLevel::Acquisition;
        } else if destination.container_type != "analysis" {
            tracing::info!(
                "The destination \"{}\" is not an analysis or acquisition.",
                destination.container_type
            );
        }

        let filter = BidsFilter {
            src_data: opts.src_data,
            folders: opts.folders.clone(),
            subjects: Vec::new(),
            sessions: Vec::new(),
            dry_run: opts.dry_run,
        };

        if opts.src_data {
            tracing::info!("Downloading source data.");
        } else {
            tracing::info!("Not downloading source data.");
        }
        if opts.dry_run {
            tracing::info!("Dry run is set.  No data will be downloaded.");
        }
        if opts.folders.is_empty() {
            tracing::info!("Downloading BIDS data in all folders.");
        } else {
            tracing::info!("Downloading BIDS only in folders: {:?}", opts.folders);
        }

        let outcome: Result<Option<PathBuf>, PlatformError> = match run_level {
            RunLevel::Project => {
                tracing::info!(
                    "Downloading BIDS for project \"{}\"",
                    hierarchy.project_label
                );
                download_unless_present(client, &bids_dir, filter)
            }
            RunLevel::Subject => {
                tracing::info!(
                    "Downloading BIDS for subject \"{}\"",
                    hierarchy.subject_label
                );
                let filter = BidsFilter {
                    subjects: vec![hierarchy.subject_label.clone()],
                    ..filter
                };
                download_unless_present(client, &bids_dir, filter)
            }
            RunLevel::Session => {
                tracing::info!(
                    "Downloading BIDS for session \"{}\"",
                    hierarchy.session_label
                );
                let filter = BidsFilter {
                    subjects: vec![hierarchy.subject_label.clone()],
                    sessions: vec![hierarchy.session_label.clone()],
                    ..filter
                };
                download_unless_present(client, &bids_dir, filter)
            }
            RunLevel::Acquisition => {
                if hierarchy.acquisition_label == "unknown acquisition" {
                    let msg = format!(
                        "Cannot download BIDS for acquisition \"{}\"",
                        hierarchy.acquisition_label
                    );
                    tracing::error!("{msg}");
                    extra_tree_text.push_str(&format!("ERROR: {msg}\n"));
                    err_code = BIDS_UNKNOWN_ACQUISITION;
                    Ok(None)
                } else {
                    tracing::info!(
                        "Downloading BIDS for acquisition \"{}\"",
                        hierarchy.acquisition_label
                    );
                    if bids_dir.exists() {
                        tracing::info!(
                            "Not actually downloading it because {} exists",
                            bids_dir.display()
                        );
                        Ok(Some(bids_dir.clone()))
                    } else {
                        client
                            .download_acquisition_bids(&destination.id, &bids_dir, &filter)
                            .map(|_| Some(bids_dir.clone()))
                    }
                }
            }
            RunLevel::NoParent | RunLevel::NoDestination => {
                let msg = format!(
                    "This job is not being run at the project, subject, session \
                     or acquisition level. run_level = {}",
                    run_level.as_str()
                );
                tracing::error!("{msg}");
                extra_tree_text.push_str(&format!("ERROR: {msg}\n"));
                err_code = BIDS_WRONG_LEVEL;
                Ok(None)
            }
        };

        match outcome {
            Ok(path) => bids_path = path,
            Err(PlatformError::Export(msg)) => {
                tracing::error!("bids export error: {msg}");
                extra_tree_text.push_str(&format!("{msg}\n"));
                err_code = BIDS_EXPORT_ERROR;
            }
            Err(PlatformError::Api(msg)) => {
                tracing::error!("api error: {msg}");
                extra_tree_text.push_str(&format!("EXCEPTION: {msg}\n"));
                err_code = BIDS_API_EXCEPTION;
            }
        }
    }

    if let Some(path) = &bids_path {
        if path.exists() {
            tracing::info!("Found BIDS path {}", path.display());

            if let Err(err) = fix_dataset_description(path) {
                tracing::warn!("could not repair dataset_description: {err:#}");
            }

            if opts.do_validate_bids {
                let out_path = path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join("validator.output.json");
                match validate_bids(path, &out_path) {
                    Ok(report) => err_code = report.error_code,
                    Err(err) => {
                        tracing::error!("{err:#}");
                        extra_tree_text.push_str(&format!("EXCEPTION: {err:#}\n"));
                        err_code = BIDS_VALIDATOR_EXCEPTION;
                    }
                }
            } else {
                tracing::info!("Not running BIDS validation");
                err_code = BIDS_OK;
            }
        } else {
            let msg = "No BIDS data was found to download";
            tracing::error!("{msg}");
            extra_tree_text.push_str(&format!("{msg}\n"));
            err_code = BIDS_NOTHING_DOWNLOADED;
        }
    } else {
        // Keep pointing at the usual location in case it was partly created.
        bids_path = Some(bids_dir);
        extra_tree_text.push_str("Warning: no bids path, checked work/bids anyway.\n");
    }

    if err_code > 0 {
        let msg = "Error in BIDS download or validation.  See log for details.";
        tracing::error!("{msg}");
        extra_tree_text.push_str(&format!("{msg}\n"));
    } else {
        let msg = "Downloading BIDS data was successful!";
        tracing::info!("{msg}");
        extra_tree_text.push_str(msg);
    }

    if opts.tree {
        if let Err(err) = tree_bids(
            bids_path.as_deref(),
            &output_dir.join("bids_tree"),
            opts.tree_title.as_deref(),
            Some(&extra_tree_text),
        ) {
            tracing::warn!("could not write tree listing: {err:#}");
        }
    }

    err_code
}

fn download_unless_present(
    client: &dyn PlatformClient,
    bids_dir: &Path,
    filter: BidsFilter,
) -> Result<Option<PathBuf>, PlatformError> {
    if bids_dir.exists() {
        tracing::info!(
            "Not actually downloading it because {} exists",
            bids_dir.display()
        );
        return Ok(Some(bids_dir.to_path_buf()));
    }
    client
        .download_project_bids(bids_dir, &filter)
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::hierarchy::Hierarchy;
    use crate::platform::{PlatformError, StaticClient};

    fn analysis_destination() -> Destination {
        Destination {
            id: "dest1".to_string(),
            container_type: "analysis".to_string(),
        }
    }

    fn project_hierarchy() -> Hierarchy {
        Hierarchy {
            run_level: RunLevel::Project,
            run_label: "TheProject".to_string(),
            group: "grp".to_string(),
            project_label: "TheProject".to_string(),
            subject_label: "unknown subject".to_string(),
            session_label: "unknown session".to_string(),
            acquisition_label: "unknown acquisition".to_string(),
        }
    }

    fn quiet_options() -> DownloadOptions {
        DownloadOptions {
            tree: false,
            do_validate_bids: false,
            ..DownloadOptions::default()
        }
    }

    #[test]
    fn existing_bids_dir_skips_the_download() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let output = dir.path().join("output");
        fs::create_dir_all(work.join("bids")).unwrap();
        fs::create_dir_all(&output).unwrap();
        fs::write(
            work.join("bids/dataset_description.json"),
            serde_json::to_string(&default_dataset_description()).unwrap(),
        )
        .unwrap();

        let client = StaticClient::new();
        let mut hierarchy = project_hierarchy();
        let code = download_bids_for_runlevel(
            &client,
            &work,
            &output,
            &analysis_destination(),
            &mut hierarchy,
            &quiet_options(),
        );

        assert_eq!(code, BIDS_OK);
        assert_eq!(client.download_calls(), 0);
        assert!(work.join("bids").is_dir());
    }

    #[test]
    fn fresh_project_download_is_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let output = dir.path().join("output");
        fs::create_dir_all(&work).unwrap();
        fs::create_dir_all(&output).unwrap();

        let client = StaticClient::new()
            .with_download_files(&["sub-01/anat/T1w.nii.gz", "dataset_description.json"]);
        let mut hierarchy = project_hierarchy();
        let code = download_bids_for_runlevel(
            &client,
            &work,
            &output,
            &analysis_destination(),
            &mut hierarchy,
            &quiet_options(),
        );

        assert_eq!(code, BIDS_OK);
        assert_eq!(client.download_calls(), 1);
        assert!(work.join("bids/sub-01/anat/T1w.nii.gz").is_file());
    }

    #[test]
    fn no_destination_is_code_24() {
        let dir = tempfile::tempdir().unwrap();
        let client = StaticClient::new();
        let mut hierarchy = Hierarchy {
            run_level: RunLevel::NoDestination,
            run_label: "unknown".to_string(),
            ..project_hierarchy()
        };
        let code = download_bids_for_runlevel(
            &client,
            &dir.path().join("work"),
            &dir.path().join("output"),
            &analysis_destination(),
            &mut hierarchy,
            &quiet_options(),
        );
        assert_eq!(code, BIDS_NO_DESTINATION);
        assert_eq!(client.download_calls(), 0);
    }

    #[test]
    fn unknown_acquisition_is_code_23() {
        let dir = tempfile::tempdir().unwrap();
        let client = StaticClient::new();
        let destination = Destination {
            id: "acq-missing".to_string(),
            container_type: "acquisition".to_string(),
        };
        let mut hierarchy = project_hierarchy();
        let code = download_bids_for_runlevel(
            &client,
            &dir.path().join("work"),
            &dir.path().join("output"),
            &destination,
            &mut hierarchy,
            &quiet_options(),
        );
        assert_eq!(code, BIDS_UNKNOWN_ACQUISITION);
        assert_eq!(client.download_calls(), 0);
    }

    #[test]
    fn unsupported_level_is_code_20() {
        let dir = tempfile::tempdir().unwrap();
        let client = StaticClient::new();
        let mut hierarchy = Hierarchy {
            run_level: RunLevel::NoParent,
            run_label: "unknown".to_string(),
            ..project_hierarchy()
        };
        let code = download_bids_for_runlevel(
            &client,
            &dir.path().join("work"),
            &dir.path().join("output"),
            &analysis_destination(),
            &mut hierarchy,
            &quiet_options(),
        );
        assert_eq!(code, BIDS_WRONG_LEVEL);
    }

    #[test]
    fn api_failure_is_code_25_and_export_failure_21() {
        let dir = tempfile::tempdir().unwrap();
        let api_client = StaticClient::new()
            .failing_downloads(PlatformError::Api("boom".to_string()));
        let mut hierarchy = project_hierarchy();
        let code = download_bids_for_runlevel(
            &api_client,
            &dir.path().join("work-a"),
            &dir.path().join("output"),
            &analysis_destination(),
            &mut hierarchy,
            &quiet_options(),
        );
        assert_eq!(code, BIDS_API_EXCEPTION);

        let export_client = StaticClient::new()
            .failing_downloads(PlatformError::Export("unmapped".to_string()));
        let code = download_bids_for_runlevel(
            &export_client,
            &dir.path().join("work-b"),
            &dir.path().join("output"),
            &analysis_destination(),
            &mut hierarchy,
            &quiet_options(),
        );
        assert_eq!(code, BIDS_EXPORT_ERROR);
    }

    #[test]
    fn empty_download_is_code_26() {
        let dir = tempfile::tempdir().unwrap();
        // Succeeds but materializes nothing, so the bids path never appears.
        let client = StaticClient::new();
        let mut hierarchy = project_hierarchy();
        let code = download_bids_for_runlevel(
            &client,
            &dir.path().join("work"),
            &dir.path().join("output"),
            &analysis_destination(),
            &mut hierarchy,
            &quiet_options(),
        );
        assert_eq!(code, BIDS_NOTHING_DOWNLOADED);
    }

    #[test]
    fn tree_listing_is_written_even_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output");
        fs::create_dir_all(&output).unwrap();
        let client = StaticClient::new();
        let mut hierarchy = Hierarchy {
            run_level: RunLevel::NoDestination,
            ..project_hierarchy()
        };
        let opts = DownloadOptions {
            tree: true,
            tree_title: Some("recon-all BIDS Tree".to_string()),
            ..quiet_options()
        };
        let code = download_bids_for_runlevel(
            &client,
            &dir.path().join("work"),
            &output,
            &analysis_destination(),
            &mut hierarchy,
            &opts,
        );
        assert_eq!(code, BIDS_NO_DESTINATION);
        let html = fs::read_to_string(output.join("bids_tree.html")).unwrap();
        assert!(html.contains("Destination does not exist."));
        assert!(html.contains("run_level is no_destination"));
    }

    #[test]
    fn funding_scalar_is_wrapped_into_a_list() {
        let dir = tempfile::tempdir().unwrap();
        let description = dir.path().join("dataset_description.json");
        fs::write(
            &description,
            serde_json::to_string(&json!({"Name": "x", "Funding": "NIH"})).unwrap(),
        )
        .unwrap();

        fix_dataset_description(dir.path()).unwrap();

        let data: Value =
            serde_json::from_str(&fs::read_to_string(&description).unwrap()).unwrap();
        assert_eq!(data["Funding"], json!(["NIH"]));
    }

    #[test]
    fn missing_description_is_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        fix_dataset_description(dir.path()).unwrap();
        let data: Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("dataset_description.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(data["BIDSVersion"], "1.2.0");
        assert!(data["Funding"].is_array());
    }

    #[test]
    fn list_funding_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let description = dir.path().join("dataset_description.json");
        let original = json!({"Name": "x", "Funding": ["a", "b"]});
        fs::write(&description, serde_json::to_string(&original).unwrap()).unwrap();
        fix_dataset_description(dir.path()).unwrap();
        let data: Value =
            serde_json::from_str(&fs::read_to_string(&description).unwrap()).unwrap();
        assert_eq!(data["Funding"], json!(["a", "b"]));
    }
}
