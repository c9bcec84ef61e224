//! Everything one invocation needs: directories, destination, parsed
//! configuration, named inputs, and the environment for child processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use crate::config::GearConfig;
use crate::notices::NoticeLog;

/// Name of this gear; also the prefix of every output archive.
pub const GEAR_NAME: &str = "freesurfer-recon-all";

/// Where the job this gear runs for will deposit its results.
#[derive(Debug, Clone, Default)]
pub struct Destination {
    pub id: String,
    pub container_type: String,
}

/// The identity and working set of one invocation.
#[derive(Debug)]
pub struct GearContext {
    pub base_dir: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub subjects_dir: PathBuf,
    pub freesurfer_home: PathBuf,
    pub destination: Destination,
    pub config: GearConfig,
    /// Named input files provided to the job.
    pub inputs: BTreeMap<String, PathBuf>,
    /// Environment for every child process, replacing the inherited one.
    pub environ: BTreeMap<String, String>,
}

impl GearContext {
    /// Load the context from a gear directory laid out as
    /// `<base>/config.json`, `<base>/input/`, `<base>/output/`,
    /// `<base>/work/`.
    pub fn load(
        base_dir: &Path,
        environ_file: &Path,
        subjects_dir: &Path,
        freesurfer_home: &Path,
        notices: &mut NoticeLog,
    ) -> Result<Self> {
        let config_path = base_dir.join("config.json");
        let text = fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        let raw: Value = serde_json::from_str(&text)
            .with_context(|| format!("parse {}", config_path.display()))?;

        let config_map = raw
            .get("config")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let config = GearConfig::from_map(&config_map, notices);

        let destination = Destination {
            id: raw
                .pointer("/destination/id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            container_type: raw
                .pointer("/destination/type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        if destination.id.is_empty() {
            notices.warn("config.json has no destination id");
        }

        let inputs = parse_inputs(&raw);
        let environ = load_environ(environ_file, notices);

        let context = GearContext {
            input_dir: base_dir.join("input"),
            output_dir: base_dir.join("output"),
            work_dir: base_dir.join("work"),
            base_dir: base_dir.to_path_buf(),
            subjects_dir: subjects_dir.to_path_buf(),
            freesurfer_home: freesurfer_home.to_path_buf(),
            destination,
            config,
            inputs,
            environ,
        };
        context.ensure_directories()?;
        Ok(context)
    }

    fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.output_dir, &self.work_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn input_path(&self, name: &str) -> Option<&PathBuf> {
        self.inputs.get(name)
    }

    /// Per-run directory inside output/, named after the destination so raw
    /// results can be removed once the archive is built.
    pub fn analysis_output_dir(&self, subject_id: &str) -> PathBuf {
        self.output_dir.join(subject_id)
    }

    pub fn license_path(&self) -> PathBuf {
        self.freesurfer_home.join("license.txt")
    }
}

fn parse_inputs(raw: &Value) -> BTreeMap<String, PathBuf> {
    let mut inputs = BTreeMap::new();
    let Some(map) = raw.get("inputs").and_then(Value::as_object) else {
        return inputs;
    };
    for (name, value) in map {
        let path = value
            .as_str()
            .map(PathBuf::from)
            .or_else(|| {
                value
                    .pointer("/location/path")
                    .and_then(Value::as_str)
                    .map(PathBuf::from)
            });
        if let Some(path) = path {
            inputs.insert(name.clone(), path);
        }
    }
    inputs
}

/// Load the child-process environment from the JSON file baked into the
/// container image. Outside the container the file is usually absent, so
/// fall back to the inherited environment with a warning.
fn load_environ(environ_file: &Path, notices: &mut NoticeLog) -> BTreeMap<String, String> {
    match fs::read_to_string(environ_file) {
        Ok(text) => match serde_json::from_str::<BTreeMap<String, String>>(&text) {
            Ok(environ) => {
                let rendered: String = environ
                    .iter()
                    .map(|(key, value)| format!("{key}={value} "))
                    .collect();
                tracing::debug!("Environment: {rendered}");
                environ
            }
            Err(err) => {
                notices.warn(format!(
                    "could not parse {}: {err}, inheriting environment",
                    environ_file.display()
                ));
                std::env::vars().collect()
            }
        },
        Err(_) => {
            notices.warn(format!(
                "{} not found, inheriting environment",
                environ_file.display()
            ));
            std::env::vars().collect()
        }
    }
}

/// Resolve the subject id for this run: the configured one wins, otherwise
/// it is the label of the destination's subject parent.
pub fn resolve_subject_id(
    context: &GearContext,
    client: &dyn crate::platform::PlatformClient,
) -> Result<String> {
    if let Some(id) = context.config.subject_id() {
        return Ok(id);
    }
    let destination = client
        .get_container(&context.destination.id)
        .map_err(|err| anyhow!("cannot resolve destination: {err}"))?;
    let subject_id = destination
        .parents
        .subject
        .ok_or_else(|| anyhow!("destination has no subject parent"))?;
    let subject = client
        .get_container(&subject_id)
        .map_err(|err| anyhow!("cannot resolve subject {subject_id}: {err}"))?;
    Ok(subject.label)
}
