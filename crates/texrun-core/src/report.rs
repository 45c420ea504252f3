//! User-facing diagnostics and the end-of-run summary.
//!
//! All diagnostic text is collected into [`Diagnostics`] values and printed
//! once by the caller. Each unit owns its own `Diagnostics`; the coordinator
//! merges them after the worker pool drains.

use std::fmt;

/// Name used in every diagnostic marker.
pub const TOOL_NAME: &str = "texrun";

/// Severity of a diagnostic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Notice,
}

impl Severity {
    /// The marker line that opens a diagnostic block, e.g. `* texrun error`.
    pub fn marker(self) -> String {
        format!("* {} {}", TOOL_NAME, self)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Notice => write!(f, "notice"),
        }
    }
}

/// Accumulated messages plus error and warning counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub errors: u32,
    pub warnings: u32,
    pub lines: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error block. Detail lines are indented by four spaces.
    pub fn error<I, S>(&mut self, detail: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.errors += 1;
        self.block(Severity::Error, detail);
    }

    /// Record a warning block.
    pub fn warning<I, S>(&mut self, detail: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.warnings += 1;
        self.block(Severity::Warning, detail);
    }

    /// Record a notice block. Notices are not counted.
    pub fn notice<I, S>(&mut self, detail: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.block(Severity::Notice, detail);
    }

    fn block<I, S>(&mut self, severity: Severity, detail: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.lines.push(severity.marker());
        self.lines
            .extend(detail.into_iter().map(|l| format!("    {}", l.as_ref())));
    }

    /// Append a raw line without touching the counts.
    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Fold another set of diagnostics into this one.
    pub fn merge(&mut self, other: Diagnostics) {
        self.errors += other.errors;
        self.warnings += other.warnings;
        self.lines.extend(other.lines);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Header line that introduces the messages of one execution unit.
pub fn unit_header(label: &str) -> String {
    format!("\n----  Messages for {}  ----", label)
}

/// Totals printed at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub jobname: String,
    pub errors: u32,
    pub warnings: u32,
    /// Counts carried by sessions that were not re-executed this pass.
    pub unresolved_errors: u32,
    pub unresolved_warnings: u32,
}

impl Summary {
    pub fn has_unresolved(&self) -> bool {
        self.unresolved_errors != 0 || self.unresolved_warnings != 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n{}", "-".repeat(50))?;
        if self.has_unresolved() {
            writeln!(f, "{}:  {}", TOOL_NAME, self.jobname)?;
            writeln!(
                f,
                "    - Old:      {} error(s), {} warnings(s)",
                self.unresolved_errors, self.unresolved_warnings
            )?;
            writeln!(
                f,
                "    - Current:  {} error(s), {} warnings(s)",
                self.errors, self.warnings
            )
        } else {
            writeln!(
                f,
                "{}:  {} - {} error(s), {} warning(s)",
                TOOL_NAME, self.jobname, self.errors, self.warnings
            )
        }
    }
}
