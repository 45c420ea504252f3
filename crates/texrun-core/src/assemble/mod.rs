//! Script assembly.
//!
//! One script per session: the template header, every custom begin-hook,
//! every user record and every custom end-hook (each inside the engine's
//! wrapper), then the template footer. While the script is built, a
//! [`CodeIndex`] records where each record landed so that interpreter
//! diagnostics can be mapped back to document lines.

mod future;
mod sub;

pub use future::{Hoisted, hoist};
pub use sub::SubTemplate;

use std::borrow::Cow;

use rustc_hash::FxHashMap;

use crate::engine::EngineDefinition;
use crate::error::{Error, Result};
use crate::record::CodeRecord;
use crate::text::{count_lines, format_fields};

pub const STDOUT_DELIM: &str = "=>PYTHONTEX:STDOUT#";
pub const STDERR_DELIM: &str = "=>PYTHONTEX:STDERR#";
pub const DEPENDENCIES_DELIM: &str = "=>PYTHONTEX:DEPENDENCIES#";
pub const CREATED_DELIM: &str = "=>PYTHONTEX:CREATED#";
pub const FIELD_DELIM: &str = "=>PYTHONTEX:FIELD_DELIM#";

/// Position of one record inside an assembled script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub instance: String,
    pub input_file: String,
    pub command: String,
    /// Document line of the record.
    pub line: u64,
    /// Script lines before the record's code.
    pub lines_total: u64,
    /// User-code lines before the record within its section.
    pub lines_user: u64,
    /// Lines of code the record contributed.
    pub lines_input: u64,
    /// Inline records before this one within its section.
    pub inline_count: u64,
}

impl IndexEntry {
    /// Document line for a script line inside (or just past) this record.
    pub fn document_line(&self, script_line: u64) -> u64 {
        if script_line > self.lines_total + self.lines_input {
            self.line + self.lines_input
        } else {
            (self.line + script_line).saturating_sub(self.lines_total + 1)
        }
    }

    /// Line within the user's code block for a script line.
    pub fn code_line(&self, script_line: u64) -> u64 {
        if self.command.chars().count() <= 1 {
            1
        } else if script_line > self.lines_total + self.lines_input {
            self.lines_user + self.lines_input + 1
        } else {
            (self.lines_user + script_line).saturating_sub(self.lines_total + self.inline_count)
        }
    }

    pub fn is_custom(&self) -> bool {
        self.instance.ends_with("CC")
    }
}

/// Index of every record in a script, in script order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeIndex {
    entries: Vec<IndexEntry>,
}

impl CodeIndex {
    pub fn push(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    pub fn get(&self, instance: &str) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.instance == instance)
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Position of `instance` in script order.
    pub fn position(&self, instance: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.instance == instance)
    }

    /// The last record that starts before `script_line`.
    pub fn locate(&self, script_line: u64) -> Option<&IndexEntry> {
        let mut found = self.entries.first()?;
        for e in &self.entries[1..] {
            if e.lines_total >= script_line {
                break;
            }
            found = e;
        }
        Some(found)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Values for the directory fields of the template.
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
    pub encoding: &'a str,
    /// Working directory as written in the settings, relative to the
    /// document directory.
    pub workingdir: &'a str,
    /// Absolute working directory with forward slashes.
    pub workingdir_full: &'a str,
}

/// A generated script and its line index.
#[derive(Debug, Clone)]
pub struct AssembledScript {
    pub text: String,
    pub index: CodeIndex,
    /// Interpolation templates of `sub` records, by instance.
    pub sub_templates: FxHashMap<String, SubTemplate>,
}

/// Build the script for one session.
///
/// `code` must be non-empty; it names the session the script runs.
pub fn assemble_script(
    engine: &EngineDefinition,
    ctx: &ScriptContext<'_>,
    cc_begin: &[&CodeRecord],
    code: &[&CodeRecord],
    cc_end: &[&CodeRecord],
) -> Result<AssembledScript> {
    let first = code
        .first()
        .ok_or_else(|| Error::Template(format!("no code to assemble for {}", engine.name)))?;

    let (future, cc_code, user_code) = if engine.is_python() {
        let cc = hoist(cc_begin)?;
        let user = hoist(code)?;
        let mut imports = cc.imports;
        imports.extend(user.imports);
        (imports.join("\n"), cc.code, user.code)
    } else {
        (String::new(), borrowed(cc_begin), borrowed(code))
    };

    let (script_begin, script_end) = engine
        .template
        .split_once("{body}")
        .ok_or_else(|| Error::Template(format!("template for {} is missing {{body}}", engine.name)))?;
    let header_field = |name: &str| -> Option<String> {
        Some(match name {
            "encoding" => ctx.encoding.to_string(),
            "future" => future.clone(),
            "workingdir" => ctx.workingdir.to_string(),
            "Workingdir" => ctx.workingdir_full.to_string(),
            "extend" => engine.extend.clone(),
            "family" => first.family.clone(),
            "session" => first.session.clone(),
            "restart" => first.restart.clone(),
            "dependencies_delim" => DEPENDENCIES_DELIM.to_string(),
            "created_delim" => CREATED_DELIM.to_string(),
            _ => return None,
        })
    };

    let (mut wrap_begin, mut wrap_end) = engine
        .wrapper
        .split_once("{code}")
        .ok_or_else(|| Error::Template(format!("wrapper for {} is missing {{code}}", engine.name)))?;
    let trimmed_begin;
    if !engine.is_python() {
        // Interpreters that report the next non-empty line need user code
        // to end right where the wrapper resumes.
        trimmed_begin = format!("{}\n", wrap_begin.trim_end_matches([' ', '\t', '\n']));
        wrap_begin = &trimmed_begin;
        wrap_end = wrap_end.trim_start_matches([' ', '\t', '\n']);
    }

    let mut builder = ScriptBuilder {
        engine,
        wrap_begin,
        wrap_end,
        text: String::new(),
        lines_total: 0,
        index: CodeIndex::default(),
        sub_templates: FxHashMap::default(),
    };

    let header = format_fields(script_begin, &header_field)?;
    builder.lines_total += count_lines(&header);
    builder.text.push_str(&header);

    builder.section(cc_begin, &cc_code, false)?;
    builder.section(code, &user_code, true)?;
    builder.section(cc_end, &borrowed(cc_end), false)?;

    let footer = format_fields(script_end, &header_field)?;
    builder.text.push_str(&footer);

    Ok(AssembledScript {
        text: builder.text,
        index: builder.index,
        sub_templates: builder.sub_templates,
    })
}

fn borrowed<'a>(records: &[&'a CodeRecord]) -> Vec<Cow<'a, str>> {
    records.iter().map(|r| Cow::Borrowed(r.code.as_str())).collect()
}

struct ScriptBuilder<'e> {
    engine: &'e EngineDefinition,
    wrap_begin: &'e str,
    wrap_end: &'e str,
    text: String,
    lines_total: u64,
    index: CodeIndex,
    sub_templates: FxHashMap<String, SubTemplate>,
}

impl ScriptBuilder<'_> {
    /// Append one section (begin hooks, user code or end hooks). Line
    /// counters restart for every section.
    fn section(&mut self, records: &[&CodeRecord], code: &[Cow<'_, str>], user: bool) -> Result<()> {
        let mut lines_user = 0;
        let mut inline_count = 0;

        for (rec, code) in records.iter().zip(code) {
            let begin = format_fields(self.wrap_begin, |name| wrapper_field(rec, name))?;
            self.lines_total += count_lines(&begin);
            self.text.push_str(&begin);

            let (body, lines_input) = if user && matches!(rec.command.as_str(), "s" | "sub") {
                let (template, fields) = SubTemplate::parse(code).ok_or_else(|| {
                    let at = if rec.input_file.is_empty() {
                        String::new()
                    } else {
                        format!("{}: ", rec.input_file)
                    };
                    Error::Template(format!(
                        "Invalid \"sub\" command or environment.  Invalid replacement fields.\n  {}on or after line {}",
                        at, rec.line
                    ))
                })?;
                self.sub_templates.insert(rec.instance.clone(), template);
                let mut body = String::new();
                for field in &fields {
                    body.push_str(&format_fields(&self.engine.sub, |name| match name {
                        "field_delim" => Some(FIELD_DELIM.to_string()),
                        "field" => Some(field.clone()),
                        _ => None,
                    })?);
                }
                let lines = count_lines(&body);
                (body, lines)
            } else if user && rec.command == "i" {
                let body = format_fields(&self.engine.formatter, |name| {
                    (name == "code").then(|| code.trim_end_matches('\n').to_string())
                })?;
                (body, count_lines(code))
            } else {
                (code.to_string(), count_lines(code))
            };

            self.index.push(IndexEntry {
                instance: rec.instance.clone(),
                input_file: rec.input_file.clone(),
                command: rec.command.clone(),
                line: rec.line,
                lines_total: self.lines_total,
                lines_user,
                lines_input,
                inline_count,
            });
            self.text.push_str(&body);
            let formatted = if user { rec.command == "i" } else { rec.is_inline };
            if formatted {
                inline_count += 1;
            }
            self.lines_total += lines_input;
            lines_user += lines_input;

            self.text.push_str(self.wrap_end);
            self.lines_total += count_lines(self.wrap_end);
        }
        Ok(())
    }
}

fn wrapper_field(rec: &CodeRecord, name: &str) -> Option<String> {
    Some(match name {
        "command" => rec.command.clone(),
        "context" => rec.context.clone(),
        "args" => rec.args_run.clone(),
        "instance" => rec.instance.clone(),
        "line" => rec.line.to_string(),
        "stdoutdelim" => format!("{}{}#{}#", STDOUT_DELIM, rec.instance, rec.command),
        "stderrdelim" => format!("{}{}#{}#", STDERR_DELIM, rec.instance, rec.command),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineRegistry;
    use crate::settings::Gobble;

    fn sh_engine() -> EngineDefinition {
        EngineDefinition::builder("sh", "sh", "sh")
            .commands(["sh {file}.sh"])
            .template("cd \"{workingdir}\"\n{body}\necho \"{dependencies_delim}\"\necho \"{created_delim}\"\n")
            .wrapper("\necho \"{stdoutdelim}\"\n>&2 echo \"{stderrdelim}\"\n{code}\n\n")
            .formatter("echo {code}")
            .sub("echo \"{field_delim}\"\necho {field}\n")
            .build()
            .expect("Failed to build engine")
    }

    fn registry() -> EngineRegistry {
        let mut engines = EngineRegistry::empty();
        engines.register(sh_engine());
        engines
    }

    fn record(engines: &EngineRegistry, header: &str, code: &str) -> CodeRecord {
        CodeRecord::parse(&format!("{}#\n{}", header, code), engines, Gobble::None).expect("Failed to parse record")
    }

    fn ctx() -> ScriptContext<'static> {
        ScriptContext {
            encoding: "UTF-8",
            workingdir: ".",
            workingdir_full: "/doc",
        }
    }

    #[test]
    fn test_index_tracks_script_lines() {
        let engines = registry();
        let a = record(&engines, "sh#s#r#0#block####doc.tex#10", "echo a\necho b\n");
        let b = record(&engines, "sh#s#r#1#i####doc.tex#20", "$((1+1))\n");
        let c = record(&engines, "sh#s#r#2#block####doc.tex#30", "echo c\n");
        let script = assemble_script(&sh_engine(), &ctx(), &[], &[&a, &b, &c], &[]).expect("Failed to assemble");

        let lines: Vec<&str> = script.text.lines().collect();
        let first = script.index.get("0").expect("missing entry");
        assert_eq!(lines[first.lines_total as usize], "echo a");
        assert_eq!(first.line, 11);
        assert_eq!(first.lines_input, 2);

        let inline = script.index.get("1").expect("missing entry");
        assert_eq!(lines[inline.lines_total as usize], "echo $((1+1))");

        let third = script.index.get("2").expect("missing entry");
        assert_eq!(third.inline_count, 1);
        assert_eq!(third.lines_user, 3);
        assert_eq!(lines[third.lines_total as usize], "echo c");

        assert!(script.text.contains("=>PYTHONTEX:STDOUT#2#block#"));
        assert!(script.text.ends_with("echo \"=>PYTHONTEX:CREATED#\"\n"));
    }

    #[test]
    fn test_inline_count_follows_formatted_commands() {
        let engines = registry();
        let c = record(&engines, "sh#s#r#0#c####doc.tex#10", "X=1\n");
        let s = record(&engines, "sh#s#r#1#s####doc.tex#12", "v=!{$X}\n");
        let b = record(&engines, "sh#s#r#2#block####doc.tex#14", "echo $X\n");
        let script = assemble_script(&sh_engine(), &ctx(), &[], &[&c, &s, &b], &[]).expect("Failed to assemble");
        assert_eq!(script.index.get("2").expect("missing entry").inline_count, 0);

        let first = record(&engines, "CC:sh:begin#none#none#0#c####doc.tex#1", "Y=2\n");
        let second = record(&engines, "CC:sh:begin#none#none#1#c####doc.tex#2", "Z=3\n");
        let script =
            assemble_script(&sh_engine(), &ctx(), &[&first, &second], &[&b], &[]).expect("Failed to assemble");
        assert_eq!(script.index.get("1CC").expect("missing entry").inline_count, 1);
        assert_eq!(script.index.get("2").expect("missing entry").inline_count, 0);
    }

    #[test]
    fn test_non_python_wrapper_is_trimmed() {
        let engines = registry();
        let a = record(&engines, "sh#s#r#0#block####doc.tex#1", "echo a\n");
        let script = assemble_script(&sh_engine(), &ctx(), &[], &[&a], &[]).expect("Failed to assemble");
        assert!(script.text.contains("\"=>PYTHONTEX:STDERR#0#block#\"\necho a\n"));
        assert!(script.text.contains("echo a\n\necho \"=>PYTHONTEX:DEPENDENCIES#\""));
    }

    #[test]
    fn test_document_and_code_lines() {
        let engines = registry();
        let a = record(&engines, "sh#s#r#0#block####doc.tex#10", "x\ny\nz\n");
        let script = assemble_script(&sh_engine(), &ctx(), &[], &[&a], &[]).expect("Failed to assemble");
        let entry = script.index.get("0").expect("missing entry");
        let second = entry.lines_total + 2;
        assert_eq!(entry.document_line(second), 12);
        assert_eq!(entry.code_line(second), 2);
        assert_eq!(entry.document_line(entry.lines_total + 50), 14);
        assert_eq!(script.index.locate(second).map(|e| e.instance.as_str()), Some("0"));
    }

    #[test]
    fn test_sub_records_emit_fields() {
        let engines = registry();
        let a = record(&engines, "sh#s#r#0#sub####doc.tex#1", "v=!{$X} w=!{$Y}\n");
        let script = assemble_script(&sh_engine(), &ctx(), &[], &[&a], &[]).expect("Failed to assemble");
        assert_eq!(script.text.matches("=>PYTHONTEX:FIELD_DELIM#").count(), 2);
        assert!(script.text.contains("echo $X\n"));
        let template = &script.sub_templates["0"];
        assert_eq!(template.fill(&["1".into(), "2".into()]), "v=1 w=2\n");

        let bad = record(&engines, "sh#s#r#1#sub####doc.tex#4", "!{oops\n");
        let err = assemble_script(&sh_engine(), &ctx(), &[], &[&bad], &[]).unwrap_err();
        assert!(err.to_string().contains("on or after line 5"));
    }

    #[test]
    fn test_custom_code_sections() {
        let engines = registry();
        let begin = record(&engines, "CC:sh:begin#none#none#0#code####doc.tex#1", "echo hook\n");
        let a = record(&engines, "sh#s#r#0#block####doc.tex#5", "echo a\n");
        let script = assemble_script(&sh_engine(), &ctx(), &[&begin], &[&a], &[]).expect("Failed to assemble");
        assert!(script.index.get("0CC").is_some_and(|e| e.is_custom()));
        assert!(script.text.find("echo hook").expect("hook") < script.text.find("echo a").expect("code"));
        assert_eq!(script.index.position("0"), Some(1));
    }

    #[test]
    fn test_python_future_hoisted() {
        let engines = EngineRegistry::builtin().expect("Failed to build registry");
        let py = engines.get("py").expect("py engine");
        let a = record(&engines, "py#s#r#0#block####doc.tex#1", "from __future__ import annotations\nx = 1\n");
        let script = assemble_script(py, &ctx(), &[], &[&a], &[]).expect("Failed to assemble");
        let import_at = script.text.find("from __future__ import annotations").expect("import");
        assert!(import_at < script.text.find("import os").expect("template body"));
        assert_eq!(script.text.matches("from __future__ import annotations").count(), 1);
    }
}
