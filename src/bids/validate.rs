//! Run the external BIDS validator and digest its JSON report.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// Clean: no validation errors.
pub const VALIDATE_OK: i32 = 0;
/// The validator reported one or more structural errors.
pub const VALIDATE_BIDS_ERRORS: i32 = 10;
/// The validator produced no parseable output.
pub const VALIDATE_NO_OUTPUT: i32 = 11;
/// The validator output did not have the expected shape.
pub const VALIDATE_BAD_SHAPE: i32 = 12;

/// One issue from the validator: the reason plus the affected files.
#[derive(Debug, Clone, Default)]
pub struct Issue {
    pub reason: String,
    pub files: Vec<String>,
}

/// Digested validator output.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub error_code: i32,
    pub summary: Option<Value>,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(default)]
    summary: Option<Value>,
    issues: RawIssues,
}

#[derive(Deserialize)]
struct RawIssues {
    #[serde(default)]
    errors: Vec<RawIssue>,
    #[serde(default)]
    warnings: Vec<RawIssue>,
}

#[derive(Deserialize)]
struct RawIssue {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    files: Vec<RawIssueFile>,
}

#[derive(Deserialize)]
struct RawIssueFile {
    #[serde(default)]
    file: Option<RawFileRef>,
    #[serde(default)]
    evidence: Option<String>,
}

#[derive(Deserialize)]
struct RawFileRef {
    #[serde(default, rename = "relativePath")]
    relative_path: Option<String>,
}

/// Invoke `bids-validator --verbose --json` with stdout captured to
/// `out_path`, then interpret the report.
pub fn validate_bids(bids_path: &Path, out_path: &Path) -> Result<ValidationReport> {
    tracing::debug!("Running BIDS Validator");

    let mut command = Command::new("bids-validator");
    command.arg("--verbose").arg("--json").arg(bids_path);
    tracing::info!("Command: bids-validator --verbose --json {}", bids_path.display());

    let raw = match command.output() {
        Ok(output) => {
            tracing::info!("bids-validator return code: {:?}", output.status.code());
            fs::write(out_path, &output.stdout)
                .with_context(|| format!("write {}", out_path.display()))?;
            output.stdout
        }
        Err(err) => {
            tracing::error!("could not run bids-validator: {err}");
            Vec::new()
        }
    };

    Ok(interpret_report(&raw))
}

/// Map raw validator stdout to an error code and issue lists.
pub fn interpret_report(raw: &[u8]) -> ValidationReport {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!("bids output is not JSON: {err}");
            tracing::debug!("BIDS validation could not run.");
            return ValidationReport {
                error_code: VALIDATE_NO_OUTPUT,
                ..ValidationReport::default()
            };
        }
    };

    let report: RawReport = match serde_json::from_value(value) {
        Ok(report) => report,
        Err(err) => {
            tracing::error!("unexpected shape in validator output: {err}");
            return ValidationReport {
                error_code: VALIDATE_BAD_SHAPE,
                ..ValidationReport::default()
            };
        }
    };

    let errors: Vec<Issue> = report.issues.errors.iter().map(digest_issue).collect();
    let warnings: Vec<Issue> = report.issues.warnings.iter().map(digest_issue).collect();

    if let Some(summary) = &report.summary {
        tracing::info!(
            "bids-validator results:\n\nValid BIDS files summary:\n{}",
            serde_json::to_string_pretty(summary).unwrap_or_default()
        );
    }
    for issue in &errors {
        let mut msg = format!("{}\n", issue.reason);
        for file in &issue.files {
            msg.push_str(&format!("      In file {file}\n"));
        }
        tracing::error!("{msg}");
    }
    for issue in &warnings {
        let mut msg = format!("{}\n", issue.reason);
        for file in &issue.files {
            msg.push_str(&format!("      {file}\n"));
        }
        tracing::warn!("{msg}");
    }

    let error_code = if errors.is_empty() {
        tracing::debug!("No BIDS errors detected.");
        VALIDATE_OK
    } else {
        tracing::error!("{} BIDS validation error(s) were detected.", errors.len());
        VALIDATE_BIDS_ERRORS
    };

    ValidationReport {
        error_code,
        summary: report.summary,
        errors,
        warnings,
    }
}

fn digest_issue(raw: &RawIssue) -> Issue {
    let files = raw
        .files
        .iter()
        .filter_map(|entry| {
            let path = entry
                .file
                .as_ref()
                .and_then(|file| file.relative_path.clone())?;
            Some(match &entry.evidence {
                Some(evidence) if !evidence.is_empty() => format!("{path}, {evidence}"),
                _ => path,
            })
        })
        .collect();
    Issue {
        reason: raw.reason.clone(),
        files,
    }
}
