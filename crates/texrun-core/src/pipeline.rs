//! One complete texrun invocation.
//!
//! The pipeline loads the code file and settings, compares digests with the
//! previous snapshot, builds one unit per session that has to run (plus one
//! highlighting unit), runs them on the worker pool and merges their results
//! into the new snapshot and the macro files read by the document.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::assemble::{ScriptContext, assemble_script};
use crate::change::{ChangeDetector, UpdatePlan, compute_digests};
use crate::codefile::load_code_file;
use crate::console::ConsoleUnit;
use crate::engine::{EngineRegistry, InterpreterMap};
use crate::error::{Error, Result};
use crate::execute::{UnitEnv, UnitKind, UnitResult, default_jobs, run_attached, run_parallel};
use crate::highlight::{HighlightUnit, Highlighter, highlight_macro_file, select_highlighter};
use crate::interpret::CodeUnit;
use crate::paths::{JobPaths, expand_user, native_separators};
use crate::record::{CodeRecord, HookPosition, RunKey};
use crate::report::{Diagnostics, Summary};
use crate::session::{collapse_duplicates, group_sessions};
use crate::settings::{RerunMode, Settings, VitalSettings};
use crate::state::{CodeVitals, DepStamp, LoadedState, RunState, StateStore};
use crate::text::format_fields;

/// Options of one invocation, usually taken from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Document name, optionally with a directory and an extension.
    pub texname: PathBuf,
    pub encoding: String,
    /// Used unless the settings block names a mode.
    pub rerun: RerunMode,
    /// Used unless the settings block names a mode.
    pub hash_dependencies: bool,
    pub jobs: usize,
    pub interpreters: InterpreterMap,
    /// Session selector for interactive mode.
    pub interactive: Option<String>,
    pub error_exit_code: bool,
}

impl RunOptions {
    pub fn new(texname: impl Into<PathBuf>) -> Self {
        Self {
            texname: texname.into(),
            encoding: "UTF-8".to_string(),
            rerun: RerunMode::Errors,
            hash_dependencies: false,
            jobs: default_jobs(),
            interpreters: InterpreterMap::default(),
            interactive: None,
            error_exit_code: true,
        }
    }
}

/// What an invocation did.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Totals for the summary; `None` in interactive mode.
    pub summary: Option<Summary>,
    /// Every message of the run, in print order.
    pub diagnostics: Diagnostics,
    /// Run keys that were executed, in submission order.
    pub executed: Vec<String>,
    pub exit_code: i32,
}

/// A unit of work for the pool.
enum Unit<'a> {
    Code(CodeUnit<'a>),
    Console(ConsoleUnit<'a>),
    Highlight(HighlightUnit<'a>),
}

/// Runs texrun for one document.
pub struct Pipeline {
    options: RunOptions,
    engines: EngineRegistry,
    highlighter: Option<Box<dyn Highlighter>>,
}

impl Pipeline {
    /// Pipeline with the built-in engines.
    pub fn new(options: RunOptions) -> Result<Self> {
        Ok(Self::with_engines(options, EngineRegistry::builtin()?))
    }

    pub fn with_engines(options: RunOptions, engines: EngineRegistry) -> Self {
        Self {
            options,
            engines,
            highlighter: None,
        }
    }

    /// Use `highlighter` instead of detecting `pygmentize`.
    pub fn with_highlighter(mut self, highlighter: Box<dyn Highlighter>) -> Self {
        self.highlighter = Some(highlighter);
        self
    }

    pub fn run(&self) -> Result<RunOutcome> {
        let opts = &self.options;
        let start_time = unix_now();

        let located = JobPaths::locate(&opts.texname)?;
        let code_file = load_code_file(&located.code_file(), &opts.encoding)?;
        let mut diags = Diagnostics::new();
        let settings = code_file.settings(&mut diags)?;
        let paths = located.with_dirs(&settings.outputdir, &settings.workingdir);
        paths.create_output_dir()?;

        let rerun = settings.rerun.unwrap_or(opts.rerun);
        let hash_dependencies = settings.hashdependencies.unwrap_or(opts.hash_dependencies);
        let engines = self.engines.customize(&settings, &opts.interpreters);
        let records = collapse_duplicates(code_file.records(&engines, &settings)?);
        tracing::debug!("{} records in {}", records.len(), paths.code_file().display());

        let vitals = VitalSettings::from_settings(&settings, &opts.encoding);
        let old = match StateStore::load(&paths.state_file(), &vitals)? {
            LoadedState::Compatible(state) => Some(state),
            LoadedState::Invalidated(state) => {
                tracing::info!("vital settings changed; discarding previous results");
                paths.remove_recorded(state.all_files());
                None
            }
            LoadedState::Missing | LoadedState::Unreadable => None,
        };

        let digests = compute_digests(&records, &engines)?;
        let mut current = RunState::new(&vitals);
        current.code_vitals = CodeVitals::from(&settings);
        current.cons_vitals = settings.workingdir.clone();
        current.code_hashes = digests.code.clone().into_iter().collect();
        current.cons_hashes = digests.cons.clone().into_iter().collect();
        current.typeset_hashes = digests.typeset.clone().into_iter().collect();
        current.highlight_settings = settings
            .highlight
            .iter()
            .map(|(family, config)| (family.clone(), config.fingerprint()))
            .collect();

        let detector = ChangeDetector {
            paths: &paths,
            rerun,
            hash_dependencies,
        };
        let plan = detector.plan(&digests, &settings.highlight, old.as_ref(), &mut current, &mut diags);

        if let Some(selector) = &opts.interactive {
            let key = select_session(selector, &plan)?;
            return self.run_interactive(&key, &records, &engines, &paths, plan, old, current, diags, start_time);
        }

        let groups = group_sessions(&records, &plan);
        let env = UnitEnv {
            paths: &paths,
            settings: &settings,
            encoding: &opts.encoding,
            hash_dependencies,
        };
        let workingdir = expand_user(&settings.workingdir).to_string_lossy().into_owned();
        let workingdir_full = paths.workingdir_full();
        let ctx = ScriptContext {
            encoding: &opts.encoding,
            workingdir: &workingdir,
            workingdir_full: &workingdir_full,
        };
        let python = opts.interpreters.get("python").unwrap_or("python3").to_string();

        let mut units = Vec::new();
        for (key, code) in &groups.code {
            let Some(first) = code.first() else { continue };
            let engine = engines
                .get(&first.family)
                .ok_or_else(|| Error::UnknownFamily(first.family.clone()))?;
            let script = assemble_script(
                engine,
                &ctx,
                groups.hooks(&first.family, HookPosition::Begin),
                code,
                groups.hooks(&first.family, HookPosition::End),
            )?;
            tracing::debug!("assembled {} ({} records)", key, code.len());
            units.push(Unit::Code(CodeUnit {
                key: first.run_key(),
                engine,
                script,
            }));
        }
        for cons in groups.cons.values() {
            let Some(first) = cons.first() else { continue };
            let engine = engines
                .get(&first.family)
                .ok_or_else(|| Error::UnknownFamily(first.family.clone()))?;
            let mut records: Vec<&CodeRecord> = groups.hooks(&first.family, HookPosition::Begin).to_vec();
            records.extend(cons);
            records.extend(groups.hooks(&first.family, HookPosition::End));
            units.push(Unit::Console(ConsoleUnit {
                key: first.run_key(),
                engine,
                records,
                python: python.clone(),
                highlight: settings.highlight.get(&first.family),
            }));
        }
        if !groups.highlight.is_empty() {
            units.push(Unit::Highlight(HighlightUnit {
                records: groups.highlight.clone(),
                configs: &settings.highlight,
                typeset_cache: &current.typeset_cache,
            }));
        }

        let selected;
        let highlighter: &dyn Highlighter = match &self.highlighter {
            Some(h) => h.as_ref(),
            None => {
                selected = select_highlighter(settings.pygments);
                selected.as_ref()
            }
        };

        tracing::info!("running {} units with {} workers", units.len(), opts.jobs);
        let results = run_parallel(opts.jobs, &units, |unit| match unit {
            Unit::Code(u) => u.run(&env),
            Unit::Console(u) => u.run(&env, highlighter),
            Unit::Highlight(u) => u.run(&env, highlighter),
        })?;
        let ran_units = !units.is_empty();
        drop(units);

        let mut messages = Diagnostics::new();
        let (executed, new_files) = merge_results(results, &mut current, &mut messages);
        flag_unresolved_dependencies(&mut current, start_time, &mut messages);

        current.last_new_file_time = match &old {
            Some(o) if !new_files => o.last_new_file_time,
            _ => start_time,
        };
        if ran_units || old.as_ref() != Some(&current) {
            write_macro_files(&paths, &current, highlighter, &settings)?;
            StateStore::save(&paths.state_file(), &current)?;
        }

        diags.merge(messages);
        let summary = summarize(&paths, rerun, &plan, &current, &diags);
        let exit_code = i32::from(opts.error_exit_code && summary.errors > 0);
        Ok(RunOutcome {
            summary: Some(summary),
            diagnostics: diags,
            executed,
            exit_code,
        })
    }

    /// Run one code session attached to the terminal.
    ///
    /// Output is not interpreted; the snapshot is saved with the session's
    /// previous exit status.
    #[allow(clippy::too_many_arguments)]
    fn run_interactive(
        &self,
        key: &str,
        records: &[CodeRecord],
        engines: &EngineRegistry,
        paths: &JobPaths,
        mut plan: UpdatePlan,
        old: Option<RunState>,
        mut current: RunState,
        diags: Diagnostics,
        start_time: f64,
    ) -> Result<RunOutcome> {
        let opts = &self.options;
        plan.code.values_mut().for_each(|u| *u = false);
        plan.cons.values_mut().for_each(|u| *u = false);
        plan.code.insert(key.to_string(), true);
        let groups = group_sessions(records, &plan);
        let code = groups
            .code
            .get(key)
            .ok_or_else(|| Error::InvalidRequest(format!("Session {} has no code", key.replace('#', ":"))))?;
        let first = code[0];
        let engine = engines
            .get(&first.family)
            .ok_or_else(|| Error::UnknownFamily(first.family.clone()))?;

        let workingdir = paths.workingdir_from_outputdir();
        let workingdir_full = paths.workingdir_full();
        let ctx = ScriptContext {
            encoding: &opts.encoding,
            workingdir: &workingdir,
            workingdir_full: &workingdir_full,
        };
        let script = assemble_script(
            engine,
            &ctx,
            groups.hooks(&first.family, HookPosition::Begin),
            code,
            groups.hooks(&first.family, HookPosition::End),
        )?;

        let run_key = RunKey::parse(key).ok_or_else(|| Error::InvalidRequest(format!("invalid session {}", key)))?;
        let basename = run_key.basename();
        let script_file = paths.output_file(&format!("{}.{}", basename, engine.extension));
        fs::write(paths.resolve(&script_file), &script.text)?;
        current.files.entry(key.to_string()).or_default().push(script_file);

        for line in &diags.lines {
            println!("{}", line);
        }
        println!("Entering interactive mode for \"{}\"\n{}\n", run_key.label(), "-".repeat(20));

        let script_full = native_separators(&paths.output_dir_abs().join(&basename));
        let escape = |s: &str| s.replace('\\', "\\\\");
        let outputdir = paths.resolve(&paths.outputdir);
        let last = engine.commands.len().saturating_sub(1);
        for (n, command) in engine.commands.iter().enumerate() {
            let mut line = format_fields(command, |name| match name {
                "file" => Some(escape(&basename)),
                "File" => Some(escape(&script_full)),
                "workingdir" => Some(escape(&workingdir)),
                _ => None,
            })?;
            if n == last {
                line.push_str(" --interactive");
            }
            let code = run_attached(&line, &outputdir)?;
            if code != 0 {
                tracing::debug!("interactive command exited with {}", code);
                break;
            }
        }

        let status = old.as_ref().and_then(|o| o.exit_status.get(key).copied()).unwrap_or_default();
        current.exit_status.insert(key.to_string(), status);
        current.last_new_file_time = old.as_ref().map_or(start_time, |o| o.last_new_file_time);
        StateStore::save(&paths.state_file(), &current)?;

        Ok(RunOutcome {
            summary: None,
            diagnostics: Diagnostics::new(),
            executed: vec![key.to_string()],
            exit_code: 0,
        })
    }
}

/// Fold unit results into the new snapshot.
///
/// Returns the executed run keys and whether any unit produced files.
fn merge_results(results: Vec<UnitResult>, current: &mut RunState, messages: &mut Diagnostics) -> (Vec<String>, bool) {
    let mut executed = Vec::new();
    let mut new_files = false;
    for result in results {
        match result.kind {
            UnitKind::Code | UnitKind::Console => {
                let key = result.key;
                new_files |= !result.files.is_empty();
                current.files.entry(key.clone()).or_default().extend(result.files);
                current.macros.entry(key.clone()).or_default().extend(result.macros);
                current.dependencies.insert(key.clone(), result.dependencies);
                current.exit_status.insert(key.clone(), result.status);
                if result.kind == UnitKind::Console {
                    current.typeset_cache.insert(key.clone(), result.typeset_cache);
                }
                executed.push(key);
            }
            UnitKind::Highlight => {
                new_files |= result.pygments_files.values().any(|f| !f.is_empty());
                current.dependencies.extend(result.typeset_dependencies);
            }
        }
        current.pygments_files.extend(result.pygments_files);
        current.pygments_macros.extend(result.pygments_macros);
        messages.merge(result.diagnostics);
    }
    (executed, new_files)
}

/// Null dependency stamps that are missing or newer than the run, so the
/// owning keys run again next time.
fn flag_unresolved_dependencies(current: &mut RunState, start_time: f64, messages: &mut Diagnostics) {
    let mut unresolved = BTreeSet::new();
    for (key, deps) in current.dependencies.iter_mut() {
        for stamp in deps.values_mut() {
            if stamp.mtime.is_none_or(|t| t > start_time) {
                *stamp = DepStamp::unresolved();
                unresolved.insert(key.replace('#', ":"));
            }
        }
    }
    if !unresolved.is_empty() {
        let mut detail = vec![
            "The following have dependencies that have been modified".to_string(),
            "Run texrun again to resolve dependencies".to_string(),
        ];
        detail.extend(unresolved.into_iter().map(|k| format!("- {}", k)));
        messages.warning(detail);
    }
}

fn write_macro_files(
    paths: &JobPaths,
    current: &RunState,
    highlighter: &dyn Highlighter,
    settings: &Settings,
) -> Result<()> {
    let mut text = format!("%Last time of file creation:  {}\n\n", current.last_new_file_time);
    let macros: BTreeMap<_, _> = current.macros.iter().collect();
    for fragments in macros.values() {
        text.push_str(&fragments.concat());
    }
    fs::write(paths.resolve(&paths.macro_file()), text)?;

    let highlighted: BTreeMap<_, _> = current.pygments_macros.iter().collect();
    let pyg = highlight_macro_file(highlighter, &settings.highlight, highlighted.values().copied().flatten())?;
    fs::write(paths.resolve(&paths.highlight_macro_file()), pyg)?;
    Ok(())
}

fn summarize(paths: &JobPaths, rerun: RerunMode, plan: &UpdatePlan, current: &RunState, diags: &Diagnostics) -> Summary {
    let mut summary = Summary {
        jobname: paths.raw_jobname.clone(),
        errors: diags.errors,
        warnings: diags.warnings,
        unresolved_errors: 0,
        unresolved_warnings: 0,
    };
    if matches!(rerun, RerunMode::Errors | RerunMode::Modified | RerunMode::Never) {
        for (key, status) in &current.exit_status {
            if !plan.needs_update(key) {
                summary.unresolved_errors += status.errors;
                summary.unresolved_warnings += status.warnings;
            }
        }
    }
    summary
}

/// Resolve an interactive selector to a code run key.
///
/// Accepts `family:session:restart`, or a session name shared by exactly
/// one code session. An empty selector means the `default` session.
pub fn select_session(selector: &str, plan: &UpdatePlan) -> Result<String> {
    let selector = if selector.is_empty() { "default" } else { selector };
    if selector.contains(':') {
        let key = selector.replace(':', "#");
        if plan.code.contains_key(&key) {
            return Ok(key);
        }
        if plan.cons.contains_key(&key) {
            return Err(console_unsupported());
        }
        return Err(Error::InvalidRequest(format!("Session {} does not exist", selector)));
    }

    let session_of = |key: &str| key.split('#').nth(1).map(str::to_string);
    let matches: Vec<&String> = plan
        .code
        .keys()
        .filter(|k| session_of(k).as_deref() == Some(selector))
        .collect();
    match matches.as_slice() {
        [key] => Ok((*key).clone()),
        [] if plan.cons.keys().any(|k| session_of(k).as_deref() == Some(selector)) => Err(console_unsupported()),
        [] => Err(Error::InvalidRequest(format!("Session \"{}\" does not exist.", selector))),
        _ => Err(Error::InvalidRequest(format!(
            "Ambiguous session name \"{}\"; please specify <family>:<session>:<restart>",
            selector
        ))),
    }
}

fn console_unsupported() -> Error {
    Error::InvalidRequest("Console sessions are not currently supported for interactive mode.".to_string())
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(code: &[&str], cons: &[&str]) -> UpdatePlan {
        UpdatePlan {
            code: code.iter().map(|k| (k.to_string(), true)).collect(),
            cons: cons.iter().map(|k| (k.to_string(), true)).collect(),
            typeset: BTreeMap::new(),
        }
    }

    #[test]
    fn test_select_session_by_name_and_key() {
        let p = plan(&["py#default#default", "rb#data#default", "py#data#default"], &["pycon#repl#default"]);
        assert_eq!(select_session("", &p).expect("Failed to select"), "py#default#default");
        assert_eq!(
            select_session("rb:data:default", &p).expect("Failed to select"),
            "rb#data#default"
        );

        let ambiguous = select_session("data", &p).unwrap_err().to_string();
        assert!(ambiguous.contains("Ambiguous session name \"data\""));
        let console = select_session("repl", &p).unwrap_err().to_string();
        assert!(console.contains("Console sessions are not currently supported"));
        let console_key = select_session("pycon:repl:default", &p).unwrap_err().to_string();
        assert!(console_key.contains("Console sessions"));
        assert!(select_session("missing", &p).unwrap_err().to_string().contains("does not exist"));
        assert!(select_session("py:nope:default", &p).is_err());
    }

    #[test]
    fn test_unresolved_dependencies_are_nulled() {
        let mut state = RunState::default();
        state.dependencies.insert(
            "py#a#default".to_string(),
            [
                ("old.csv".to_string(), DepStamp { mtime: Some(10.0), hash: None }),
                ("new.csv".to_string(), DepStamp { mtime: Some(500.0), hash: None }),
            ]
            .into_iter()
            .collect(),
        );
        let mut messages = Diagnostics::new();
        flag_unresolved_dependencies(&mut state, 100.0, &mut messages);

        let deps = &state.dependencies["py#a#default"];
        assert_eq!(deps["old.csv"].mtime, Some(10.0));
        assert_eq!(deps["new.csv"], DepStamp::unresolved());
        assert_eq!(messages.warnings, 1);
        assert!(messages.lines.iter().any(|l| l == "    - py:a:default"));
    }

    #[test]
    fn test_summary_counts_sessions_not_rerun() {
        let mut state = RunState::default();
        state
            .exit_status
            .insert("py#a#default".into(), crate::state::ExitStatus::new(2, 1));
        state
            .exit_status
            .insert("py#b#default".into(), crate::state::ExitStatus::new(5, 5));
        let mut p = plan(&["py#b#default"], &[]);
        p.code.insert("py#a#default".into(), false);

        let temp = tempfile::TempDir::new().expect("Failed to create temp dir");
        fs::write(temp.path().join("doc.pytxcode"), "").expect("Failed to write code file");
        let paths = JobPaths::locate(&temp.path().join("doc")).expect("Failed to locate");

        let summary = summarize(&paths, RerunMode::Errors, &p, &state, &Diagnostics::new());
        assert_eq!((summary.unresolved_errors, summary.unresolved_warnings), (2, 1));
        let always = summarize(&paths, RerunMode::Always, &p, &state, &Diagnostics::new());
        assert!(!always.has_unresolved());
    }
}
