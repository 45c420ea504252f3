//! texrun CLI - run the code embedded in a LaTeX document.

mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use texrun_core::{RerunMode, TOOL_NAME};

#[derive(Parser, Debug)]
#[command(name = "texrun")]
#[command(about = "Execute the code embedded in a LaTeX document and cache the results")]
#[command(version)]
pub struct Cli {
    /// Document name; a directory and a .tex extension are allowed
    pub texname: PathBuf,

    /// Encoding of the code file and of generated scripts
    #[arg(long, default_value = "UTF-8")]
    pub encoding: String,

    /// Exit with status 1 when errors occur
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    pub error_exit_code: bool,

    /// Run all code, regardless of what changed (same as --rerun=always)
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL", conflicts_with = "rerun")]
    pub runall: Option<bool>,

    /// When cached code runs again: never, modified, errors, warnings or always
    #[arg(long, default_value = "errors")]
    pub rerun: RerunMode,

    /// Detect changed dependencies by content digest instead of modification time
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub hashdependencies: Option<bool>,

    /// Maximum number of concurrent processes
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Interpreter overrides, e.g. "python:python3.12, ruby:ruby3"
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Run one session attached to the terminal (<family>:<session>:<restart> or a session name)
    #[arg(long, num_args = 0..=1, default_missing_value = "", value_name = "SESSION")]
    pub interactive: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run::execute(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            println!("* {} error", TOOL_NAME);
            println!("    {:#}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runall_conflicts_with_rerun() {
        assert!(Cli::try_parse_from(["texrun", "doc", "--runall", "--rerun", "never"]).is_err());
        let cli = Cli::try_parse_from(["texrun", "doc.tex", "--runall"]).expect("Failed to parse");
        assert_eq!(cli.runall, Some(true));
        assert_eq!(cli.rerun, RerunMode::Errors);
    }

    #[test]
    fn test_optional_values() {
        let cli = Cli::try_parse_from([
            "texrun",
            "doc",
            "--hashdependencies",
            "--error-exit-code",
            "false",
            "--interactive",
        ])
        .expect("Failed to parse");
        assert_eq!(cli.hashdependencies, Some(true));
        assert!(!cli.error_exit_code);
        assert_eq!(cli.interactive.as_deref(), Some(""));

        let cli = Cli::try_parse_from(["texrun", "doc", "--interactive", "py:a:default", "-j", "3"])
            .expect("Failed to parse");
        assert_eq!(cli.interactive.as_deref(), Some("py:a:default"));
        assert_eq!(cli.jobs, Some(3));
    }
}
