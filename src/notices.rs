//! Accumulated warnings and errors, reported together at the end of the log.

use std::fmt;

/// One deferred report entry. Errors may carry the underlying cause so the
/// final summary can show it without runtime type inspection.
#[derive(Debug, Clone)]
pub enum Notice {
    Warning(String),
    Error {
        message: String,
        cause: Option<String>,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Warning(message) => write!(f, "Warning: {message}"),
            Notice::Error {
                message,
                cause: Some(cause),
            } => write!(f, "Error msg: {message} ({cause})"),
            Notice::Error { message, .. } => write!(f, "Error msg: {message}"),
        }
    }
}

/// Running list of notices for one invocation.
///
/// Errors prevent the command from running and force exit status 1; both
/// kinds are flushed as grouped summaries just before the process exits.
#[derive(Debug, Default)]
pub struct NoticeLog {
    notices: Vec<Notice>,
}

impl NoticeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.notices.push(Notice::Warning(message));
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.notices.push(Notice::Error {
            message,
            cause: None,
        });
    }

    pub fn error_with_cause(&mut self, message: impl Into<String>, cause: &anyhow::Error) {
        let message = message.into();
        tracing::error!("{message}: {cause:#}");
        self.notices.push(Notice::Error {
            message,
            cause: Some(format!("{cause:#}")),
        });
    }

    pub fn has_errors(&self) -> bool {
        self.notices
            .iter()
            .any(|notice| matches!(notice, Notice::Error { .. }))
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Notice> {
        self.notices
            .iter()
            .filter(|notice| matches!(notice, Notice::Warning(_)))
    }

    pub fn errors(&self) -> impl Iterator<Item = &Notice> {
        self.notices
            .iter()
            .filter(|notice| matches!(notice, Notice::Error { .. }))
    }

    /// Emit the grouped warning and error summaries so they are easy to find
    /// at the end of the log, whatever path led to exit.
    pub fn flush_summaries(&self) {
        let warnings: Vec<String> = self.warnings().map(|notice| notice.to_string()).collect();
        if !warnings.is_empty() {
            let mut msg = String::from("Previous warnings:\n");
            for line in &warnings {
                msg.push_str(&format!("  {line}\n"));
            }
            tracing::info!("{msg}");
        }

        let errors: Vec<String> = self.errors().map(|notice| notice.to_string()).collect();
        if !errors.is_empty() {
            let mut msg = String::from("Previous errors:\n");
            for line in &errors {
                msg.push_str(&format!("  {line}\n"));
            }
            tracing::info!("{msg}");
        }
    }
}
