//! External command assembly with deterministic argument ordering.

use std::fmt;
use std::path::Path;

use crate::config::{ConfigValue, ToolConfig};
use crate::input::ResolvedInput;
use crate::notices::NoticeLog;

/// Program prefix for the main invocation. `time` wraps the run so the log
/// ends with a wall-clock summary of the multi-hour reconstruction.
pub const PROGRAM_PREFIX: [&str; 2] = ["time", "recon-all"];

/// Configuration key whose string value is split into free-form tokens.
pub const FREE_FORM_KEY: &str = "reconall_options";

/// Ordered argument list for one external invocation.
///
/// Every `-i` token is immediately followed by exactly one path token, which
/// is what makes [`CommandSpec::remove_i_args`] a safe transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    tokens: Vec<String>,
}

impl CommandSpec {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn program(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.tokens.get(1..).unwrap_or_default()
    }

    /// Drop every `-i <path>` pair, leaving everything else untouched.
    ///
    /// This is the deliberate "resume" heuristic: a failed first attempt may
    /// have been caused by the anatomical inputs, and a bare `-subjid`
    /// re-invocation lets the tool pick up from where it left off.
    pub fn remove_i_args(&self) -> CommandSpec {
        let mut tokens = Vec::with_capacity(self.tokens.len());
        let mut iter = self.tokens.iter();
        while let Some(token) = iter.next() {
            if token == "-i" {
                iter.next();
                continue;
            }
            tokens.push(token.clone());
        }
        CommandSpec { tokens }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens.join(" "))
    }
}

/// Build the main command from the resolved input, the subject id, and the
/// tool-argument map.
///
/// Token order is fixed: program prefix, positional/input tokens, then the
/// configured flags in map order. The subject-id key is excluded (already
/// consumed by input resolution); the free-form options key is split into
/// individual tokens; boolean keys contribute a single flag only when true.
pub fn generate_command(
    input: &ResolvedInput,
    subject_id: &str,
    tool: &ToolConfig,
    notices: &mut NoticeLog,
) -> CommandSpec {
    let mut tokens: Vec<String> = PROGRAM_PREFIX.iter().map(|token| token.to_string()).collect();

    match input {
        ResolvedInput::Resume { subject_id } => {
            tokens.push("-subjid".to_string());
            tokens.push(subject_id.clone());
        }
        ResolvedInput::Fresh {
            primary,
            extra_t1s,
            t2,
        } => {
            tokens.push("-i".to_string());
            tokens.push(path_token(primary));
            for extra in extra_t1s {
                tokens.push("-i".to_string());
                tokens.push(path_token(extra));
            }
            if let Some(t2) = t2 {
                tokens.push("-T2".to_string());
                tokens.push(path_token(t2));
            }
            tokens.push("-subjid".to_string());
            tokens.push(subject_id.to_string());
        }
        ResolvedInput::Bids {
            bids_dir,
            output_dir,
        } => {
            tokens.push(path_token(bids_dir));
            tokens.push(path_token(output_dir));
            tokens.push("participant".to_string());
        }
    }

    for (key, value) in tool {
        if key == "subject_id" {
            continue;
        }
        if key == FREE_FORM_KEY {
            let raw = value.to_string();
            match shell_words::split(&raw) {
                Ok(words) => tokens.extend(words),
                Err(err) => {
                    notices.warn(format!("could not split {FREE_FORM_KEY} {raw:?}: {err}"));
                    tokens.extend(raw.split_whitespace().map(|word| word.to_string()));
                }
            }
            continue;
        }
        match value {
            ConfigValue::Bool(true) => tokens.push(format!("-{key}")),
            ConfigValue::Bool(false) => {}
            other => {
                tokens.push(format!("-{key}"));
                tokens.push(other.to_string());
            }
        }
    }

    let command = CommandSpec::new(tokens);
    tracing::info!("command is: {command}");
    command
}

fn path_token(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigValue;
    use std::path::PathBuf;

    fn tool_with(entries: &[(&str, ConfigValue)]) -> ToolConfig {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn remove_i_args_drops_every_pair_and_nothing_else() {
        let command = CommandSpec::new(
            ["time", "recon-all", "-i", "A", "-all", "-i", "B", "-3T"]
                .iter()
                .map(|token| token.to_string())
                .collect(),
        );
        let resumed = command.remove_i_args();
        assert_eq!(resumed.tokens(), ["time", "recon-all", "-all", "-3T"]);
        assert!(!resumed.tokens().iter().any(|token| token == "-i"));
    }

    #[test]
    fn resume_input_yields_subjid_only() {
        let mut notices = NoticeLog::new();
        let input = ResolvedInput::Resume {
            subject_id: "sub1".to_string(),
        };
        let command = generate_command(&input, "sub1", &ToolConfig::new(), &mut notices);
        assert_eq!(command.tokens(), ["time", "recon-all", "-subjid", "sub1"]);
    }

    #[test]
    fn fresh_input_orders_inputs_before_subjid() {
        let mut notices = NoticeLog::new();
        let input = ResolvedInput::Fresh {
            primary: PathBuf::from("/in/a.nii.gz"),
            extra_t1s: vec![PathBuf::from("/in/b.nii.gz")],
            t2: Some(PathBuf::from("/in/t2.nii.gz")),
        };
        let command = generate_command(&input, "S1", &ToolConfig::new(), &mut notices);
        assert_eq!(
            command.tokens(),
            [
                "time",
                "recon-all",
                "-i",
                "/in/a.nii.gz",
                "-i",
                "/in/b.nii.gz",
                "-T2",
                "/in/t2.nii.gz",
                "-subjid",
                "S1"
            ]
        );
    }

    #[test]
    fn config_rules_for_booleans_lists_and_values() {
        let mut notices = NoticeLog::new();
        let tool = tool_with(&[
            ("parallel", ConfigValue::Bool(true)),
            (
                FREE_FORM_KEY,
                ConfigValue::Text("-all -qcache".to_string()),
            ),
            ("openmp", ConfigValue::Int(11)),
        ]);
        let input = ResolvedInput::Resume {
            subject_id: "S1".to_string(),
        };
        let command = generate_command(&input, "S1", &tool, &mut notices);
        let tokens = command.tokens();

        assert_eq!(
            tokens.iter().filter(|token| *token == "-parallel").count(),
            1
        );
        let parallel = tokens.iter().position(|token| token == "-parallel").unwrap();
        assert!(tokens
            .get(parallel + 1)
            .map(|next| next.starts_with('-'))
            .unwrap_or(true));
        assert!(tokens.iter().any(|token| token == "-all"));
        assert!(tokens.iter().any(|token| token == "-qcache"));
        let openmp = tokens.iter().position(|token| token == "-openmp").unwrap();
        assert_eq!(tokens[openmp + 1], "11");
    }

    #[test]
    fn false_booleans_and_subject_id_are_skipped() {
        let mut notices = NoticeLog::new();
        let tool = tool_with(&[
            ("3T", ConfigValue::Bool(false)),
            ("subject_id", ConfigValue::Text("S1".to_string())),
        ]);
        let input = ResolvedInput::Resume {
            subject_id: "S1".to_string(),
        };
        let command = generate_command(&input, "S1", &tool, &mut notices);
        assert!(!command.tokens().iter().any(|token| token == "-3T"));
        assert!(!command.tokens().iter().any(|token| token == "-subject_id"));
    }

    #[test]
    fn bids_input_yields_three_positional_tokens() {
        let mut notices = NoticeLog::new();
        let input = ResolvedInput::Bids {
            bids_dir: PathBuf::from("/work/bids"),
            output_dir: PathBuf::from("/out/abc"),
        };
        let command = generate_command(&input, "S1", &ToolConfig::new(), &mut notices);
        assert_eq!(
            command.tokens()[..5],
            ["time", "recon-all", "/work/bids", "/out/abc", "participant"]
        );
    }
}
