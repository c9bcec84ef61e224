//! Job configuration: wrapper settings split from external-tool arguments.
//!
//! The platform hands the gear one flat key/value map. Keys with the
//! reserved `gear-` prefix steer this wrapper and never reach the external
//! command line; everything else becomes `recon-all` arguments.

use std::collections::BTreeMap;
use std::fmt;
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::notices::NoticeLog;

/// Prefix marking keys that configure the wrapper rather than the tool.
pub const WRAPPER_PREFIX: &str = "gear-";

/// One external-tool argument value from the configuration map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(value) => write!(f, "{value}"),
            ConfigValue::Int(value) => write!(f, "{value}"),
            ConfigValue::Float(value) => write!(f, "{value}"),
            ConfigValue::Text(value) => write!(f, "{value}"),
        }
    }
}

/// Ordered map of tool-argument keys to values.
pub type ToolConfig = BTreeMap<String, ConfigValue>;

/// Wrapper behavior flags parsed from the reserved-prefix keys.
#[derive(Debug, Clone, Default)]
pub struct WrapperSettings {
    pub log_level: String,
    pub dry_run: bool,
    pub keep_output: bool,
    pub save_intermediate_output: bool,
    pub intermediate_files: String,
    pub intermediate_folders: String,
    pub bids: bool,
    pub run_bids_validation: bool,
    pub ignore_bids_errors: bool,
    pub hippocampal_subfields: bool,
    pub brainstem_structures: bool,
    pub thalamic_nuclei: bool,
    pub hypothalamic_subunits: bool,
    pub gtmseg: bool,
    pub register_surfaces: bool,
    pub convert_surfaces: bool,
    pub convert_volumes: bool,
    pub convert_stats: bool,
    pub freesurfer_license: Option<String>,
}

/// The whole job configuration, immutable after startup.
#[derive(Debug, Clone, Default)]
pub struct GearConfig {
    pub wrapper: WrapperSettings,
    pub tool: ToolConfig,
}

impl GearConfig {
    /// Split a raw configuration map into wrapper settings and tool
    /// arguments. Unknown wrapper keys are reported, not fatal.
    pub fn from_map(raw: &serde_json::Map<String, Value>, notices: &mut NoticeLog) -> Self {
        let mut wrapper = WrapperSettings {
            log_level: "INFO".to_string(),
            run_bids_validation: true,
            ..WrapperSettings::default()
        };
        let mut tool = ToolConfig::new();

        for (key, value) in raw {
            if let Some(name) = key.strip_prefix(WRAPPER_PREFIX) {
                apply_wrapper_key(&mut wrapper, name, value, notices);
            } else if let Some(value) = config_value(value) {
                tool.insert(key.clone(), value);
            } else if !value.is_null() {
                notices.warn(format!("config key {key} has unusable value {value}"));
            }
        }

        GearConfig { wrapper, tool }
    }

    pub fn subject_id(&self) -> Option<String> {
        match self.tool.get("subject_id") {
            Some(ConfigValue::Text(id)) if !id.is_empty() => Some(id.clone()),
            _ => None,
        }
    }
}

fn apply_wrapper_key(
    wrapper: &mut WrapperSettings,
    name: &str,
    value: &Value,
    notices: &mut NoticeLog,
) {
    let truthy = value.as_bool().unwrap_or(false);
    match name {
        "log-level" => {
            wrapper.log_level = value.as_str().unwrap_or("INFO").to_string();
        }
        "dry-run" => wrapper.dry_run = truthy,
        "keep-output" => wrapper.keep_output = truthy,
        "save-intermediate-output" => wrapper.save_intermediate_output = truthy,
        "intermediate-files" => {
            wrapper.intermediate_files = value.as_str().unwrap_or_default().to_string();
        }
        "intermediate-folders" => {
            wrapper.intermediate_folders = value.as_str().unwrap_or_default().to_string();
        }
        "bids" => wrapper.bids = truthy,
        "run-bids-validation" => wrapper.run_bids_validation = truthy,
        "ignore-bids-errors" => wrapper.ignore_bids_errors = truthy,
        "hippocampal_subfields" => wrapper.hippocampal_subfields = truthy,
        "brainstem_structures" => wrapper.brainstem_structures = truthy,
        "thalamic_nuclei" => wrapper.thalamic_nuclei = truthy,
        "hypothalamic_subunits" => wrapper.hypothalamic_subunits = truthy,
        "gtmseg" => wrapper.gtmseg = truthy,
        "register_surfaces" => wrapper.register_surfaces = truthy,
        "convert_surfaces" => wrapper.convert_surfaces = truthy,
        "convert_volumes" => wrapper.convert_volumes = truthy,
        "convert_stats" => wrapper.convert_stats = truthy,
        "FREESURFER_LICENSE" => {
            wrapper.freesurfer_license = value.as_str().map(|text| text.to_string());
        }
        other => notices.warn(format!("unknown wrapper setting gear-{other}")),
    }
}

fn config_value(value: &Value) -> Option<ConfigValue> {
    match value {
        Value::Bool(flag) => Some(ConfigValue::Bool(*flag)),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Some(ConfigValue::Int(int))
            } else {
                number.as_f64().map(ConfigValue::Float)
            }
        }
        Value::String(text) => Some(ConfigValue::Text(text.clone())),
        _ => None,
    }
}

fn detected_cpu_count() -> i64 {
    thread::available_parallelism()
        .map(|count| count.get() as i64)
        .unwrap_or(1)
}

/// Resolve the `n_cpus` request into the `openmp` argument forwarded to the
/// external tool. The request is consumed; the tool only ever sees `openmp`.
pub fn set_core_count(tool: &mut ToolConfig, notices: &mut NoticeLog) {
    let available = detected_cpu_count();
    tracing::info!("cpu count = {available}");

    let requested = match tool.remove("n_cpus") {
        Some(ConfigValue::Int(count)) => count,
        Some(other) => {
            notices.warn(format!("n_cpus value {other} is not a number, ignoring"));
            0
        }
        None => 0,
    };

    let openmp = if requested > available {
        notices.warn(format!(
            "n_cpus {requested} > {available} available, using {available}"
        ));
        available
    } else if requested == 0 {
        tracing::info!("using maximum available cpus ({available})");
        available
    } else {
        requested
    };

    tool.insert("openmp".to_string(), ConfigValue::Int(openmp));
}
