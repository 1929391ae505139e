use std::path::PathBuf;

/// Severity level of a diagnostic emitted by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational message with no required action.
    Info,
    /// Warning that signals a potential issue but allows the workflow to continue.
    Warning,
    /// Error-level diagnostic. Hard failures normally surface as `Result::Err`;
    /// this variant is for additional context attached to a successful outcome.
    Error,
}

/// Structured diagnostic surfaced alongside an operation's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Optional path the diagnostic refers to (config file, staged disk, ...).
    pub path: Option<PathBuf>,
    /// Optional remediation hint.
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn new<S: Into<String>>(severity: Severity, message: S) -> Self {
        Self {
            severity,
            message: message.into(),
            path: None,
            help: None,
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_help<S: Into<String>>(mut self, help: S) -> Self {
        self.help = Some(help.into());
        self
    }
}
