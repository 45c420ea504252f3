//! Incremental build core for code embedded in LaTeX documents.
//!
//! The document writes every code block it contains to a code file. This
//! crate turns that file into output the document can typeset:
//! - Records are grouped into sessions and custom-code hooks
//! - Digests decide which sessions and highlighted renderings are stale
//! - Each stale session becomes one script, run on a bounded worker pool
//! - Interpreter output is split per record and its diagnostics are mapped
//!   back to document lines
//! - Results are merged into a versioned snapshot for the next run
//!
//! [`Pipeline`] drives one invocation.

pub mod assemble;
pub mod change;
pub mod codefile;
pub mod console;
pub mod engine;
pub mod error;
pub mod execute;
pub mod hash;
pub mod highlight;
pub mod interpret;
pub mod paths;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod session;
pub mod settings;
pub mod state;
pub mod text;

pub use change::{ChangeDetector, Digests, UpdatePlan, compute_digests};
pub use codefile::{CodeFile, load_code_file};
pub use engine::{EngineBuilder, EngineDefinition, EngineRegistry, InterpreterMap};
pub use error::{Error, Result};
pub use highlight::{Highlighter, PlainHighlighter, PygmentizeHighlighter};
pub use paths::JobPaths;
pub use pipeline::{Pipeline, RunOptions, RunOutcome};
pub use record::{CodeRecord, RunKey};
pub use report::{Diagnostics, Summary, TOOL_NAME};
pub use settings::{RerunMode, Settings};
pub use state::{LoadedState, RunState, StateStore};
