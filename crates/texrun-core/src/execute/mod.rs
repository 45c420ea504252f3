//! Execution of units on the worker pool.
//!
//! A unit is one code session, one console session, or the batch of
//! records that only need highlighting. Every unit receives shared
//! read-only job data and returns a [`UnitResult`]; nothing is written to
//! the run state until the coordinator merges the results.

mod process;
mod scheduler;

pub use process::{CommandOutcome, run_attached, run_commands, split_command_line};
pub use scheduler::{default_jobs, run_parallel};

use std::collections::{BTreeMap, HashMap};

use crate::paths::JobPaths;
use crate::report::{Diagnostics, unit_header};
use crate::settings::Settings;
use crate::state::{DependencyMap, ExitStatus};

/// Read-only data shared by every unit of a job.
#[derive(Debug, Clone, Copy)]
pub struct UnitEnv<'a> {
    pub paths: &'a JobPaths,
    pub settings: &'a Settings,
    pub encoding: &'a str,
    pub hash_dependencies: bool,
}

/// What kind of unit produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitKind {
    #[default]
    Code,
    Console,
    Highlight,
}

/// Everything one unit produced.
#[derive(Debug, Clone, Default)]
pub struct UnitResult {
    pub kind: UnitKind,
    /// Run key (`family#session#restart`); empty for the highlight unit.
    pub key: String,
    pub files: Vec<String>,
    pub macros: Vec<String>,
    pub dependencies: DependencyMap,
    pub status: ExitStatus,
    pub diagnostics: Diagnostics,
    /// Console output by instance, reused when the session is unchanged.
    pub typeset_cache: HashMap<String, String>,
    /// Highlighted macros and files, by typeset key.
    pub pygments_macros: BTreeMap<String, Vec<String>>,
    pub pygments_files: BTreeMap<String, Vec<String>>,
    /// Dependencies of external-file records, by typeset key.
    pub typeset_dependencies: BTreeMap<String, DependencyMap>,
}

impl UnitResult {
    pub fn new(kind: UnitKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            ..Self::default()
        }
    }

    /// Result of a unit that could not run at all.
    pub fn failed(kind: UnitKind, key: &str, label: &str, message: impl std::fmt::Display) -> Self {
        let mut result = Self::new(kind, key);
        result.diagnostics.push_line(unit_header(label));
        result
            .diagnostics
            .error([format!("Could not execute {}", label), message.to_string()]);
        result.status = ExitStatus::new(1, 0);
        result
    }
}
