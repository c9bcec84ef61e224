//! Run the assembled command with a bounded, input-dropping retry.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Result};

use crate::command::CommandSpec;
use crate::notices::NoticeLog;

/// How one execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Number of attempts actually dispatched (0 in dry-run mode).
    pub attempts: u32,
    /// Terminal return code: 0 success, 1 failure.
    pub return_code: i32,
    /// Set when dry-run mode skipped the real dispatch.
    pub dry_run: bool,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.return_code == 0
    }
}

/// Dispatch one external command, blocking until it exits.
///
/// The child gets `environ` as its entire environment; the inherited one is
/// discarded so runs inside and outside the container behave the same.
pub fn exec_command(
    spec: &CommandSpec,
    environ: &BTreeMap<String, String>,
    cwd: Option<&Path>,
) -> Result<()> {
    tracing::info!("executing: {spec}");
    let program = spec.program();
    if program.is_empty() {
        return Err(anyhow!("empty command"));
    }

    let mut command = Command::new(program);
    command.args(spec.args()).env_clear().envs(environ);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let status = command
        .status()
        .map_err(|err| anyhow!("could not start {program}: {err}"))?;
    if !status.success() {
        return Err(anyhow!("{program} failed: {status}"));
    }
    Ok(())
}

/// Run the main command with at most one retry.
///
/// On first failure every `-i <path>` pair is dropped and the command is
/// re-issued once: a bare `-subjid` invocation can resume a partial run that
/// bad anatomical inputs would otherwise keep failing. In dry-run mode
/// nothing is dispatched; a warning records that fact and the outcome is
/// success so the packaging paths are still exercised.
pub fn run_with_retry(
    spec: &CommandSpec,
    environ: &BTreeMap<String, String>,
    dry_run: bool,
    notices: &mut NoticeLog,
) -> ExecutionOutcome {
    if dry_run {
        notices.warn("gear-dry-run is set: Command was NOT run.");
        return ExecutionOutcome {
            attempts: 0,
            return_code: 0,
            dry_run: true,
        };
    }

    preflight(spec);

    match exec_command(spec, environ, None) {
        Ok(()) => ExecutionOutcome {
            attempts: 1,
            return_code: 0,
            dry_run: false,
        },
        Err(first_err) => {
            notices.warn(format!(
                "first attempt failed ({first_err:#}), retrying without input arguments"
            ));
            let resumed = spec.remove_i_args();
            match exec_command(&resumed, environ, None) {
                Ok(()) => ExecutionOutcome {
                    attempts: 2,
                    return_code: 0,
                    dry_run: false,
                },
                Err(second_err) => {
                    notices.error_with_cause("Unable to execute command.", &second_err);
                    ExecutionOutcome {
                        attempts: 2,
                        return_code: 1,
                        dry_run: false,
                    }
                }
            }
        }
    }
}

/// Warn early when the wrapped tool is not on PATH; the dispatch error alone
/// is easy to misread as a tool failure.
fn preflight(spec: &CommandSpec) {
    let Some(tool) = spec
        .tokens()
        .iter()
        .find(|token| *token != "time")
    else {
        return;
    };
    if which::which(tool).is_err() {
        tracing::warn!("{tool} not found on PATH");
    }
}
