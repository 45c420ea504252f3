//! Turning interpreter output into document content and diagnostics.

mod code;
mod stderr;
mod stdout;

pub use code::CodeUnit;
pub(crate) use code::clean_temps;
pub use stderr::{MessageKind, StderrContext, StderrFiles, StderrRename, StderrReport};
pub use stdout::{StdoutBlock, StdoutSections, blocks, split_trailer, sub_fields};
