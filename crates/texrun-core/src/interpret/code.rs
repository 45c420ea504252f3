//! Running one code session and turning what it printed into document
//! content.

use std::fs;

use crate::assemble::AssembledScript;
use crate::change::record_dependency;
use crate::engine::EngineDefinition;
use crate::error::Result;
use crate::execute::{UnitEnv, UnitKind, UnitResult, run_commands};
use crate::paths::{JobPaths, expand_user, native_separators};
use crate::record::RunKey;
use crate::report::{Diagnostics, unit_header};
use crate::settings::KeepTemps;
use crate::state::ExitStatus;
use crate::text::format_fields;

use super::stderr::{StderrContext, StderrRename, StderrReport};
use super::stdout::{blocks, split_trailer, sub_fields};

/// One code session, with its script already assembled.
#[derive(Debug)]
pub struct CodeUnit<'a> {
    pub key: RunKey,
    pub engine: &'a EngineDefinition,
    pub script: AssembledScript,
}

impl CodeUnit<'_> {
    /// Execute the session. Failures are reported in the result rather than
    /// aborting the other units.
    pub fn run(&self, env: &UnitEnv<'_>) -> UnitResult {
        match self.execute(env) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("session {} failed: {}", self.key, e);
                UnitResult::failed(UnitKind::Code, &self.key.id(), &self.key.label(), e)
            }
        }
    }

    fn execute(&self, env: &UnitEnv<'_>) -> Result<UnitResult> {
        let paths = env.paths;
        let engine = self.engine;
        let basename = self.key.basename();
        let label = self.key.label();
        let mut result = UnitResult::new(UnitKind::Code, self.key.id());
        let mut messages = Diagnostics::new();

        let script_path = expand_user(&paths.outputdir).join(&basename);
        let script = native_separators(&script_path);
        let script_full = if script_path.is_absolute() {
            script.clone()
        } else {
            native_separators(&paths.output_dir_abs().join(&basename))
        };
        let script_file = paths.output_file(&format!("{}.{}", basename, engine.extension));
        fs::write(paths.resolve(&script_file), &self.script.text)?;

        for created in &engine.created {
            result.files.push(format_fields(created, |name| match name {
                "file" => Some(script.clone()),
                "File" => Some(script_full.clone()),
                _ => None,
            })?);
        }

        let escape = |s: &str| s.replace('\\', "\\\\");
        let commands = engine
            .commands
            .iter()
            .map(|command| {
                format_fields(command, |name| match name {
                    "file" => Some(escape(&script)),
                    "File" => Some(escape(&script_full)),
                    "workingdir" => Some(escape(&paths.workingdir)),
                    _ => None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let out_file = paths.output_file(&format!("{}.out", basename));
        let err_file = paths.output_file(&format!("{}.err", basename));
        tracing::info!("running {}", label);
        let outcome = run_commands(
            &commands,
            &paths.document_dir,
            &paths.resolve(&out_file),
            &paths.resolve(&err_file),
        )?;

        match fs::read(paths.resolve(&out_file)) {
            Ok(bytes) => {
                let out = String::from_utf8_lossy(&bytes);
                self.interpret_stdout(env, &out, outcome.return_code, &mut result, &mut messages)?;
            }
            Err(_) => messages.error([format!("Missing output file for {}", label)]),
        }

        let mut report = StderrReport::default();
        match fs::read(paths.resolve(&err_file)) {
            Ok(bytes) => {
                let err = String::from_utf8_lossy(&bytes);
                if !err.is_empty() {
                    let outputdir = expand_user(&paths.outputdir).to_string_lossy().into_owned();
                    let ctx = StderrContext {
                        engine,
                        index: &self.script.index,
                        basename: &basename,
                        outputdir: &outputdir,
                    };
                    report = ctx.interpret(&err);
                    if env.settings.makestderr {
                        self.write_stderr_files(env, &ctx, &err, &script, &mut result, &mut messages)?;
                    }
                }
            }
            Err(_) => messages.error([format!("Missing stderr file for {}", label)]),
        }

        clean_temps(paths, env.settings.keeptemps, &script_file, &out_file, &err_file, &mut result.files);

        let mut diagnostics = Diagnostics::new();
        diagnostics.push_line(unit_header(&label));
        diagnostics.errors = report.errors;
        diagnostics.warnings = report.warnings;
        if report.unknowns > 0 {
            let kind = if outcome.return_code == 0 {
                diagnostics.warnings += report.unknowns;
                "warnings"
            } else {
                diagnostics.errors += report.unknowns;
                "errors"
            };
            diagnostics.notice([
                format!("{} message(s) could not be classified", report.unknowns),
                format!("Interpreted as {}, based on the return code(s)", kind),
            ]);
        }
        if outcome.return_code != 0 && diagnostics.errors + messages.errors == 0 {
            diagnostics.error([
                "An error occurred but no error messages were identified.".to_string(),
                "This may indicate a bad command or missing program.".to_string(),
                "The following command was executed:".to_string(),
                format!("    \"{}\"", outcome.last_command.join(" ")),
            ]);
        }
        diagnostics.merge(messages);
        diagnostics.lines.extend(report.lines);
        if diagnostics.lines.len() == 1 {
            diagnostics.lines.clear();
        }

        result.status = ExitStatus::new(diagnostics.errors, diagnostics.warnings);
        result.diagnostics = diagnostics;
        tracing::debug!(
            "{} finished with return code {}: {} error(s), {} warning(s)",
            label,
            outcome.return_code,
            result.status.errors,
            result.status.warnings
        );
        Ok(result)
    }

    fn interpret_stdout(
        &self,
        env: &UnitEnv<'_>,
        out: &str,
        return_code: i32,
        result: &mut UnitResult,
        messages: &mut Diagnostics,
    ) -> Result<()> {
        let paths = env.paths;
        let label = self.key.label();
        let Some(sections) = split_trailer(out) else {
            if return_code == 0 {
                messages.error([
                    format!("Output of {} lacks the dependency and created-file sections", label),
                    "The engine template may be invalid".to_string(),
                ]);
            }
            return Ok(());
        };

        for created in sections.created {
            if expand_user(created).is_absolute() {
                result.files.push(created.to_string());
            } else {
                result.files.push(paths.working_file(created));
            }
        }
        for dep in sections.dependencies {
            let stamp = record_dependency(paths, dep, env.hash_dependencies, messages, &label);
            result.dependencies.insert(dep.to_string(), stamp);
        }

        for block in blocks(sections.body) {
            if block.content.is_empty() && !block.is_sub() {
                continue;
            }
            if block.is_custom() {
                let mut detail = vec![
                    format!("Custom code for \"{}\" attempted to print or write to stdout", self.key.family),
                    "This is not supported; use a normal code command or environment".to_string(),
                    "The following content was written:".to_string(),
                    String::new(),
                ];
                detail.extend(block.content.lines().map(|l| format!("    {}", l)));
                messages.warning(detail);
            } else if block.command == "i" {
                result.macros.push(format!(
                    "\\pytx@SVMCR{{pytx@MCR@{}@{}}}\n{}\\endpytx@SVMCR\n\n",
                    self.key.macro_tag(),
                    block.instance,
                    block.content.trim_end_matches('\n')
                ));
            } else {
                let mut content = block.content.clone();
                if block.is_sub() {
                    if let Some(template) = self.script.sub_templates.get(block.instance) {
                        content = template.fill(&sub_fields(&content));
                    }
                    if block.command == "s" {
                        let body = content.rsplit_once('\n').map_or(content.as_str(), |(b, _)| b);
                        content = format!("{}\\endinput\n", body);
                    }
                }
                let name = paths.output_file(&format!("{}_{}.stdout", self.key.basename(), block.instance));
                fs::write(paths.resolve(&name), content)?;
                result.files.push(name);
            }
        }
        Ok(())
    }

    fn write_stderr_files(
        &self,
        env: &UnitEnv<'_>,
        ctx: &StderrContext<'_>,
        err: &str,
        script: &str,
        result: &mut UnitResult,
        messages: &mut Diagnostics,
    ) -> Result<()> {
        let alt = if script.contains('\\') {
            script.replace('\\', "/")
        } else {
            script.replace('/', "\\")
        };
        let rename = StderrRename {
            mode: env.settings.stderrfilename,
            script_base: script,
            script_base_alt: &alt,
            session: &self.key.session,
            extension: &self.engine.extension,
        };
        let typeset = ctx.typeset_stderr(err, &rename);
        for _ in 0..typeset.unsynced_undelimited {
            messages.error([
                "Line number ?? could not be synced with the document",
                "Content from stderr is not delimited, and cannot be resolved",
            ]);
        }
        for _ in 0..typeset.unsynced_delimited {
            messages.notice(["Line number ?? could not be synced with the document"]);
        }
        for (key, text) in typeset.files {
            let name = env.paths.output_file(&format!("{}.stderr", key));
            fs::write(env.paths.resolve(&name), text)?;
            result.files.push(name);
        }
        Ok(())
    }
}

/// Delete or keep the script and its captured output, per `keeptemps`.
/// Kept files are recorded so they are cleaned up with the session.
pub(crate) fn clean_temps(
    paths: &JobPaths,
    keeptemps: KeepTemps,
    script_file: &str,
    out_file: &str,
    err_file: &str,
    files: &mut Vec<String>,
) {
    let scratch = [out_file.to_string(), err_file.to_string()];
    match keeptemps {
        KeepTemps::None => {
            paths.remove_recorded(&scratch);
            paths.remove_recorded([&script_file.to_string()]);
        }
        KeepTemps::Code => {
            paths.remove_recorded(&scratch);
            files.push(script_file.to_string());
        }
        KeepTemps::All => {
            files.push(script_file.to_string());
            files.extend(scratch);
        }
    }
}
