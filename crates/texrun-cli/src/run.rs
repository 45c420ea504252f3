//! Run a document and print its diagnostics and summary.

use anyhow::Context;
use texrun_core::engine::InterpreterMap;
use texrun_core::{Pipeline, RerunMode, RunOptions};

use crate::Cli;

/// Execute one texrun invocation; returns the process exit code.
pub fn execute(cli: &Cli) -> anyhow::Result<u8> {
    let mut options = RunOptions::new(&cli.texname);
    options.encoding = cli.encoding.clone();
    options.error_exit_code = cli.error_exit_code;
    options.rerun = match cli.runall {
        Some(true) => RerunMode::Always,
        _ => cli.rerun,
    };
    options.hash_dependencies = cli.hashdependencies.unwrap_or(false);
    if let Some(jobs) = cli.jobs {
        options.jobs = jobs.max(1);
    }
    if let Some(arg) = &cli.interpreter {
        options.interpreters = InterpreterMap::default()
            .with_overrides(arg)
            .context("invalid --interpreter value")?;
    }
    options.interactive = cli.interactive.clone();

    let outcome = Pipeline::new(options)?.run()?;
    for line in &outcome.diagnostics.lines {
        println!("{}", line);
    }
    if let Some(summary) = &outcome.summary {
        print!("{}", summary);
    }
    Ok(u8::try_from(outcome.exit_code).unwrap_or(1))
}
