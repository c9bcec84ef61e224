//! Gear entry point: set up for and call the reconstruction command.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

mod archive;
mod bids;
mod command;
mod config;
mod context;
mod dry_run;
mod exec;
mod input;
mod license;
mod metadata;
mod notices;
mod platform;
mod postproc;
mod results;
mod sanitize;

use crate::bids::download::{download_bids_for_runlevel, DownloadOptions};
use crate::bids::hierarchy::get_run_level_and_hierarchy;
use crate::command::generate_command;
use crate::config::set_core_count;
use crate::context::{resolve_subject_id, GearContext, GEAR_NAME};
use crate::input::ResolvedInput;
use crate::license::install_freesurfer_license;
use crate::metadata::MetadataRecord;
use crate::notices::NoticeLog;
use crate::platform::{OfflineClient, PlatformClient};
use crate::sanitize::make_file_name_safe;

#[derive(Parser, Debug)]
#[command(
    name = "recon-gear",
    version,
    about = "Job-execution wrapper for a FreeSurfer-style reconstruction pipeline"
)]
struct Cli {
    /// Gear base directory holding config.json, input/, output/ and work/
    #[arg(long, value_name = "DIR", default_value = "/flywheel/v0")]
    gear_dir: PathBuf,

    /// JSON file with the environment given to every child process
    #[arg(long, value_name = "PATH", default_value = "/tmp/gear_environ.json")]
    environ_file: PathBuf,

    /// FreeSurfer subjects directory
    #[arg(long, value_name = "DIR", default_value = "/usr/local/freesurfer/subjects")]
    subjects_dir: PathBuf,

    /// FreeSurfer installation root
    #[arg(long, value_name = "DIR", default_value = "/usr/local/freesurfer")]
    freesurfer_home: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut notices = NoticeLog::new();

    let gear_context = match GearContext::load(
        &cli.gear_dir,
        &cli.environ_file,
        &cli.subjects_dir,
        &cli.freesurfer_home,
        &mut notices,
    ) {
        Ok(gear_context) => gear_context,
        Err(err) => {
            eprintln!("could not load gear context: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&gear_context.config.wrapper.log_level);

    // The hosted connection is out of scope here; platform lookups degrade
    // to soft failures when the gear runs without one.
    let client = OfflineClient;

    let status = run(&gear_context, &client, &mut notices);

    tracing::info!("{GEAR_NAME} Gear is done.  Returning {status}");
    if status == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn init_logging(log_level: &str) {
    let level = if log_level.eq_ignore_ascii_case("INFO") {
        "info"
    } else {
        "debug"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// The whole invocation: resolve inputs, build the command, run it, post
/// process, package. Fatal input conditions return immediately; every other
/// path flows through [`cleanup`].
fn run(
    gear_context: &GearContext,
    client: &dyn PlatformClient,
    notices: &mut NoticeLog,
) -> i32 {
    let wrapper = &gear_context.config.wrapper;

    let mut tool = gear_context.config.tool.clone();
    set_core_count(&mut tool, notices);

    let license_input = gear_context
        .input_path("freesurfer_license")
        .map(PathBuf::as_path);
    if let Err(err) = install_freesurfer_license(
        license_input,
        wrapper.freesurfer_license.as_deref(),
        client,
        &gear_context.destination.id,
        &gear_context.license_path(),
    ) {
        notices.error_with_cause("Could not install the FreeSurfer license", &err);
    }

    let mut subject_id = match gear_context.config.subject_id() {
        Some(configured) => configured,
        None => match resolve_subject_id(gear_context, client) {
            Ok(resolved) => resolved,
            Err(err) => {
                notices.error_with_cause("Could not determine the subject id", &err);
                "unknown".to_string()
            }
        },
    };
    subject_id = make_file_name_safe(&subject_id, "");
    let mut run_label = subject_id.clone();

    // The command can be built from one of three sources, in priority
    // order: a previous-run archive, BIDS-formatted data, or direct
    // anatomical file input.
    let mut resolved: Option<ResolvedInput> = None;

    match input::find_previous_run(gear_context, &subject_id, notices) {
        Ok(Some(previous_subject)) => {
            subject_id = previous_subject.clone();
            run_label = subject_id.clone();
            resolved = Some(ResolvedInput::Resume {
                subject_id: previous_subject,
            });
        }
        Ok(None) => {}
        Err(err) => {
            // Nothing usable was unpacked; later cleanup would only zip
            // stale data, so leave immediately.
            tracing::error!("{err:#}");
            return 1;
        }
    }

    if resolved.is_none() && !notices.has_errors() && wrapper.bids {
        match resolve_bids_input(gear_context, client, &subject_id, notices) {
            Ok((bids_input, bids_run_label)) => {
                run_label = bids_run_label;
                resolved = Some(bids_input);
            }
            Err(err) => {
                notices.error_with_cause("BIDS input could not be prepared", &err);
            }
        }
    }

    if resolved.is_none() && !notices.has_errors() {
        match input::resolve_direct_input(gear_context, notices) {
            Ok(fresh) => resolved = Some(fresh),
            Err(err) => {
                tracing::error!("{err:#}");
                return 1;
            }
        }
    }

    let command = resolved
        .as_ref()
        .map(|resolved_input| generate_command(resolved_input, &subject_id, &tool, notices));

    let mut metadata = MetadataRecord::new();
    let mut return_code = 0;

    if notices.has_errors() {
        return_code = 1;
        tracing::info!("Command was NOT run because of previous errors.");
    } else if let Some(command) = &command {
        let outcome =
            exec::run_with_retry(command, &gear_context.environ, wrapper.dry_run, notices);
        return_code = outcome.return_code;
        if outcome.dry_run {
            if let Err(err) = dry_run::pretend_it_ran(gear_context, &subject_id, &mut metadata)
            {
                notices.warn(format!("could not create dry-run placeholders: {err:#}"));
            }
        } else if outcome.succeeded() {
            postproc::run_post_processing(gear_context, &subject_id, &mut metadata, notices);
        }
    }

    cleanup(
        gear_context,
        &subject_id,
        &run_label,
        &metadata,
        notices,
        return_code,
    )
}

/// Classify the run level, download the right BIDS subset, and shape the
/// result into the three-positional-token input.
fn resolve_bids_input(
    gear_context: &GearContext,
    client: &dyn PlatformClient,
    subject_id: &str,
    notices: &mut NoticeLog,
) -> Result<(ResolvedInput, String)> {
    let wrapper = &gear_context.config.wrapper;

    let mut hierarchy = get_run_level_and_hierarchy(client, &gear_context.destination.id);
    let run_label = make_file_name_safe(&hierarchy.run_label, "");

    // Raw output goes into a directory named for this analysis so it can be
    // deleted once the zipped archive is built.
    let analysis_dir = gear_context.analysis_output_dir(subject_id);
    tracing::info!("Creating output directory {}", analysis_dir.display());
    fs::create_dir_all(&analysis_dir)
        .with_context(|| format!("create {}", analysis_dir.display()))?;

    let opts = DownloadOptions {
        tree: true,
        tree_title: Some("recon-all BIDS Tree".to_string()),
        src_data: false,
        folders: Vec::new(),
        dry_run: wrapper.dry_run,
        do_validate_bids: wrapper.run_bids_validation,
    };
    let error_code = download_bids_for_runlevel(
        client,
        &gear_context.work_dir,
        &gear_context.output_dir,
        &gear_context.destination,
        &mut hierarchy,
        &opts,
    );
    if error_code > 0 && !wrapper.ignore_bids_errors {
        notices.error(format!(
            "BIDS Error(s) detected.  Did not run {GEAR_NAME}"
        ));
    }

    let bids_dir = gear_context.work_dir.join("bids");
    if let Some(bidsignore) = gear_context.input_path("bidsignore") {
        if bids_dir.is_dir() {
            fs::copy(bidsignore, bids_dir.join(".bidsignore"))
                .with_context(|| format!("copy {}", bidsignore.display()))?;
            tracing::info!("Installed .bidsignore in {}", bids_dir.display());
        }
    }

    Ok((
        ResolvedInput::Bids {
            bids_dir,
            output_dir: analysis_dir,
        },
        run_label,
    ))
}

/// Move all results to the output directory and report. This always runs
/// once a command was (or would have been) attempted, whatever happened.
fn cleanup(
    gear_context: &GearContext,
    subject_id: &str,
    run_label: &str,
    metadata: &MetadataRecord,
    notices: &mut NoticeLog,
    return_code: i32,
) -> i32 {
    let wrapper = &gear_context.config.wrapper;
    let analysis_dir = gear_context.analysis_output_dir(subject_id);

    // Prefer results staged under output/; a fresh reconstruction leaves
    // the subject tree in the subjects directory instead.
    let zip_result = if analysis_dir.is_dir() {
        results::zip_output(gear_context, subject_id, run_label)
    } else if gear_context.subjects_dir.join(subject_id).is_dir() {
        results::zip_output_from(
            gear_context,
            &gear_context.subjects_dir,
            subject_id,
            run_label,
        )
    } else {
        tracing::warn!("no results found for {subject_id}, nothing to zip");
        Ok(())
    };
    if let Err(err) = zip_result {
        notices.warn(format!("could not zip output: {err:#}"));
    }

    if wrapper.save_intermediate_output {
        if let Err(err) = results::zip_all_intermediate_output(gear_context, run_label) {
            notices.warn(format!("could not zip intermediate output: {err:#}"));
        }
    }
    if let Err(err) = results::zip_intermediate_selected(gear_context, run_label) {
        notices.warn(format!("could not zip selected intermediates: {err:#}"));
    }

    if wrapper.bids {
        if let Err(err) = results::zip_htmls(
            &gear_context.output_dir,
            &gear_context.destination.id,
            &gear_context.output_dir,
        ) {
            notices.warn(format!("could not zip html reports: {err:#}"));
        }
    }

    if let Err(err) = metadata.write_if_not_empty(&gear_context.output_dir) {
        notices.warn(format!("could not write metadata: {err:#}"));
    }

    if analysis_dir.exists() {
        if wrapper.keep_output {
            tracing::info!(
                "NOT removing output directory \"{}\"",
                analysis_dir.display()
            );
        } else {
            tracing::debug!("removing output directory \"{}\"", analysis_dir.display());
            if let Err(err) = fs::remove_dir_all(&analysis_dir) {
                notices.warn(format!(
                    "could not remove {}: {err}",
                    analysis_dir.display()
                ));
            }
        }
    } else {
        tracing::info!("Output directory does not exist so it cannot be removed");
    }

    notices.flush_summaries();
    if notices.has_errors() {
        1
    } else {
        return_code
    }
}
