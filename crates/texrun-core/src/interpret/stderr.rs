//! Interpretation of a session's captured stderr.
//!
//! Stderr arrives in two parts. Everything before the first record
//! delimiter is undelimited: typically compile or syntax errors reported
//! before any record ran. Everything after is split into chunks, one per
//! record that wrote to stderr, so each chunk knows the instance it came
//! from.
//!
//! Each message that references the script is located through the
//! engine's line-number patterns and the session's [`CodeIndex`], and
//! classified by scanning nearby lines for the engine's error and warning
//! signatures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::assemble::{CodeIndex, IndexEntry, STDERR_DELIM};
use crate::engine::EngineDefinition;
use crate::settings::StderrFilename;

static OUTPUTDIR_NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:(?:[A-Za-z]:\\)|(?:~?/)).*<outputdir>").expect("valid regex"));

/// Classification of one stderr message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    Warning,
    Unknown,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Error => write!(f, "error"),
            MessageKind::Warning => write!(f, "warning"),
            MessageKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// What a session's stderr is read against.
#[derive(Debug, Clone)]
pub struct StderrContext<'a> {
    pub engine: &'a EngineDefinition,
    pub index: &'a CodeIndex,
    /// `family_session_restart`, the script's base name.
    pub basename: &'a str,
    /// Output directory as it appears in interpreter messages.
    pub outputdir: &'a str,
}

/// Messages recovered from stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StderrReport {
    pub errors: u32,
    pub warnings: u32,
    /// Messages that matched neither signature.
    pub unknowns: u32,
    pub lines: Vec<String>,
}

impl StderrReport {
    /// Count one message. A message matching both signatures counts as an
    /// error and as a warning.
    fn count(&mut self, matched: Signatures) {
        self.errors += u32::from(matched.error);
        self.warnings += u32::from(matched.warning);
        self.unknowns += u32::from(!matched.error && !matched.warning);
    }
}

/// Signatures found in a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Signatures {
    error: bool,
    warning: bool,
}

impl Signatures {
    fn found(self) -> bool {
        self.error || self.warning
    }

    /// Error takes precedence in the message header.
    fn kind(self) -> MessageKind {
        if self.error {
            MessageKind::Error
        } else if self.warning {
            MessageKind::Warning
        } else {
            MessageKind::Unknown
        }
    }

    fn union(self, other: Signatures) -> Signatures {
        Signatures {
            error: self.error || other.error,
            warning: self.warning || other.warning,
        }
    }
}

/// Split stderr into the undelimited head and the delimited tail.
fn split_at_delim(err: &str) -> (Vec<&str>, Vec<&str>) {
    let lines: Vec<&str> = err.split_inclusive('\n').collect();
    let at = lines
        .iter()
        .position(|l| l.starts_with(STDERR_DELIM))
        .unwrap_or(lines.len());
    let (head, tail) = lines.split_at(at);
    (head.to_vec(), tail.to_vec())
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

impl StderrContext<'_> {
    fn script_line(&self, line: &str) -> Option<u64> {
        self.engine
            .linenumbers
            .iter()
            .find_map(|re| re.captures(line))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    fn classify_line(&self, line: &str) -> Signatures {
        Signatures {
            error: self.engine.errors.iter().any(|sig| line.contains(sig.as_str())),
            warning: self.engine.warnings.iter().any(|sig| line.contains(sig.as_str())),
        }
    }

    /// Classify the message starting at `lines[n]`, scanning forward (or
    /// backward for lookbehind engines) until the next message.
    fn classify_at(&self, lines: &[&str], n: usize, gobble: &str) -> Signatures {
        let starts_message = |line: &str| {
            line.starts_with(STDERR_DELIM)
                || (line.contains(self.basename) && (self.engine.lookbehind || line.starts_with(gobble)))
        };
        if self.engine.lookbehind {
            for i in (0..=n).rev() {
                if i < n && starts_message(lines[i]) {
                    break;
                }
                let matched = self.classify_line(lines[i]);
                if matched.found() {
                    return matched;
                }
            }
        } else {
            for (i, line) in lines.iter().enumerate().skip(n) {
                if i > n && starts_message(line) {
                    break;
                }
                let matched = self.classify_line(line);
                if matched.found() {
                    return matched;
                }
            }
        }
        Signatures::default()
    }

    fn clean_script_line(&self, line: &str, delimited: bool) -> String {
        let mut line = if self.outputdir.is_empty() {
            line.to_string()
        } else {
            line.replace(self.outputdir, "<outputdir>")
        };
        if delimited && (line.contains("/<outputdir>") || line.contains("\\<outputdir>")) {
            line = OUTPUTDIR_NOISE.replace_all(&line, "<outputdir>").into_owned();
        }
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Read stderr into located and classified messages.
    pub fn interpret(&self, err: &str) -> StderrReport {
        let (head, tail) = split_at_delim(err);
        let mut report = StderrReport::default();
        let mut start_gobble: Option<&str> = None;

        for (n, line) in head.iter().enumerate() {
            if !line.contains(self.basename) {
                report.lines.push(format!("  {}", line.trim_end_matches(['\r', '\n'])));
                continue;
            }
            let gobble = leading_whitespace(line);
            let start = *start_gobble.get_or_insert(gobble);
            if gobble == start {
                let located = self
                    .script_line(line)
                    .and_then(|script_line| Some((script_line, self.index.locate(script_line)?)));
                let (doc_line, input_file) = match located {
                    Some((script_line, entry)) => (entry.document_line(script_line).to_string(), entry.input_file.clone()),
                    None => unknown_location(),
                };
                let matched = self.classify_at(&head, n, start);
                report.count(matched);
                report.lines.push(message_header(matched.kind(), "on line", &doc_line, &input_file));
            }
            report.lines.push(format!("  {}", self.clean_script_line(line, false)));
        }

        let mut chunk: Vec<String> = Vec::new();
        let mut chunk_located = false;
        let mut chunk_start = 0;
        let mut last_delim = "";
        for (n, line) in tail.iter().enumerate() {
            if line.starts_with(STDERR_DELIM) {
                self.flush_chunk(&mut report, &mut chunk, chunk_located, last_delim, &tail[chunk_start..n]);
                chunk_located = false;
                chunk_start = n + 1;
                last_delim = line;
            } else if line.contains(self.basename) {
                chunk_located = true;
                let gobble = leading_whitespace(line);
                let start = *start_gobble.get_or_insert(gobble);
                if gobble == start {
                    let entry = self.delim_entry(last_delim);
                    let (doc_line, input_file) = match (self.script_line(line), entry) {
                        (Some(script_line), Some(entry)) => {
                            (entry.document_line(script_line).to_string(), entry.input_file.clone())
                        }
                        _ => unknown_location(),
                    };
                    let matched = self.classify_at(&tail, n, start);
                    report.count(matched);
                    chunk.push(message_header(matched.kind(), "on line", &doc_line, &input_file));
                }
                chunk.push(format!("  {}", self.clean_script_line(line, true)));
            } else {
                chunk.push(format!("  {}", line.trim_end_matches(['\r', '\n'])));
            }
        }
        self.flush_chunk(&mut report, &mut chunk, chunk_located, last_delim, &tail[chunk_start.min(tail.len())..]);
        report
    }

    fn delim_entry(&self, delim: &str) -> Option<&IndexEntry> {
        let instance = delim.strip_prefix(STDERR_DELIM)?.split('#').next()?;
        self.index.get(instance)
    }

    /// Close a delimited chunk. A chunk that never referenced the script is
    /// reported as one message near the line of the record that wrote it,
    /// counted once for each kind of signature it contains.
    fn flush_chunk(
        &self,
        report: &mut StderrReport,
        chunk: &mut Vec<String>,
        located: bool,
        delim: &str,
        raw: &[&str],
    ) {
        if chunk.is_empty() {
            return;
        }
        if !located {
            let (doc_line, input_file) = match self.delim_entry(delim) {
                Some(entry) => (entry.line.to_string(), entry.input_file.clone()),
                None => unknown_location(),
            };
            let matched = raw
                .iter()
                .fold(Signatures::default(), |acc, l| acc.union(self.classify_line(l)));
            report.count(matched);
            report.lines.push(message_header(matched.kind(), "near line", &doc_line, &input_file));
        }
        report.lines.append(chunk);
    }
}

fn unknown_location() -> (String, String) {
    ("??".to_string(), "??".to_string())
}

fn message_header(kind: MessageKind, position: &str, doc_line: &str, input_file: &str) -> String {
    if input_file.is_empty() {
        format!("* texrun stderr - {} {} {}:", kind, position, doc_line)
    } else {
        format!("* texrun stderr - {} {} {} in \"{}\":", kind, position, doc_line, input_file)
    }
}

/// How the script's path is rewritten in `.stderr` files.
#[derive(Debug, Clone)]
pub struct StderrRename<'a> {
    pub mode: StderrFilename,
    /// Script path without extension, as the interpreter was given it.
    pub script_base: &'a str,
    /// The same path with the other slash convention.
    pub script_base_alt: &'a str,
    pub session: &'a str,
    pub extension: &'a str,
}

impl StderrRename<'_> {
    fn apply(&self, line: &str, basename: &str) -> String {
        let base = if line.contains(self.script_base) {
            self.script_base
        } else {
            self.script_base_alt
        };
        if base.is_empty() {
            return line.to_string();
        }
        match self.mode {
            StderrFilename::Full => line.replace(base, basename),
            StderrFilename::Session => line.replace(base, self.session),
            StderrFilename::GenericFile => line.replace(&format!("{}.{}", base, self.extension), "<file>"),
            StderrFilename::GenericScript => line.replace(&format!("{}.{}", base, self.extension), "<script>"),
        }
    }
}

/// Stderr rewritten for inclusion in the document, one text per instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StderrFiles {
    /// Content by `basename_instance`.
    pub files: BTreeMap<String, String>,
    /// Undelimited lines whose script position could not be mapped.
    pub unsynced_undelimited: u32,
    /// Delimited lines whose script position could not be mapped.
    pub unsynced_delimited: u32,
}

impl StderrContext<'_> {
    /// Rewrite stderr so line numbers refer to the user's code blocks.
    ///
    /// Output of custom-code hooks is never written to a file.
    pub fn typeset_stderr(&self, err: &str, rename: &StderrRename<'_>) -> StderrFiles {
        let (head, tail) = split_at_delim(err);
        let mut out = StderrFiles::default();

        let mut key: Option<String> = None;
        let mut last_position: Option<usize> = None;
        let mut process = false;
        for line in &head {
            if line.contains(self.basename) {
                let located = self.script_line(line).and_then(|script_line| {
                    let entry = self.index.locate(script_line)?;
                    Some((script_line, entry))
                });
                match located {
                    Some((script_line, entry)) if !entry.is_custom() => {
                        process = true;
                        let position = self.index.position(&entry.instance);
                        if position > last_position || key.is_none() {
                            last_position = position;
                            key = Some(format!("{}_{}", self.basename, entry.instance));
                        }
                        let code_line = entry.code_line(script_line);
                        let line = line.replacen(&script_line.to_string(), &code_line.to_string(), 1);
                        self.push_stderr_line(&mut out, key.as_deref(), &rename.apply(&line, self.basename));
                    }
                    Some(_) => process = false,
                    None => {
                        process = false;
                        out.unsynced_undelimited += 1;
                    }
                }
            } else if process {
                self.push_stderr_line(&mut out, key.as_deref(), line);
            }
        }

        let mut entry: Option<&IndexEntry> = None;
        for line in &tail {
            if line.starts_with(STDERR_DELIM) {
                entry = self.delim_entry(line);
                process = entry.is_some_and(|e| !e.is_custom());
                key = entry.map(|e| format!("{}_{}", self.basename, e.instance));
            } else if process && line.contains(self.basename) {
                let mut line = line.to_string();
                if let (Some(script_line), Some(start)) = (self.script_line(&line), entry) {
                    let entry = self.lookahead(start, script_line);
                    let code_line = entry.code_line(script_line);
                    line = line.replacen(&script_line.to_string(), &code_line.to_string(), 1);
                } else {
                    out.unsynced_delimited += 1;
                }
                self.push_stderr_line(&mut out, key.as_deref(), &rename.apply(&line, self.basename));
            } else if process {
                self.push_stderr_line(&mut out, key.as_deref(), line);
            }
        }
        out
    }

    /// Messages reported past a record's end may belong to a record that
    /// did not write a delimiter of its own.
    fn lookahead<'e>(&'e self, start: &'e IndexEntry, script_line: u64) -> &'e IndexEntry {
        let mut entry = start;
        let Some(mut position) = self.index.position(&start.instance) else {
            return entry;
        };
        while script_line > entry.lines_total + entry.lines_input {
            match self.index.entries().get(position + 1) {
                Some(next) if script_line > next.lines_total => {
                    entry = next;
                    position += 1;
                }
                _ => break,
            }
        }
        entry
    }

    fn push_stderr_line(&self, out: &mut StderrFiles, key: Option<&str>, line: &str) {
        if let Some(key) = key {
            let text = out.files.entry(key.to_string()).or_default();
            text.push_str(line.trim_end_matches(['\r', '\n']));
            text.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::IndexEntry;

    fn engine(lookbehind: bool) -> EngineDefinition {
        EngineDefinition::builder("sh", "sh", "sh")
            .template("{body}")
            .wrapper("{code}")
            .errors(["Error"])
            .warnings(["Warning"])
            .linenumbers(["line {number}"])
            .lookbehind(lookbehind)
            .build()
            .expect("Failed to build engine")
    }

    fn entry(instance: &str, line: u64, lines_total: u64, lines_input: u64) -> IndexEntry {
        IndexEntry {
            instance: instance.to_string(),
            input_file: "doc.tex".to_string(),
            command: "block".to_string(),
            line,
            lines_total,
            lines_user: 0,
            lines_input,
            inline_count: 0,
        }
    }

    fn index() -> CodeIndex {
        let mut index = CodeIndex::default();
        index.push(entry("0", 10, 5, 3));
        index.push(entry("1", 40, 12, 4));
        index
    }

    fn ctx<'a>(engine: &'a EngineDefinition, index: &'a CodeIndex) -> StderrContext<'a> {
        StderrContext {
            engine,
            index,
            basename: "sh_s_r",
            outputdir: "texrun-files-doc",
        }
    }

    #[test]
    fn test_delimited_error_is_located() {
        let engine = engine(false);
        let index = index();
        let err = "=>PYTHONTEX:STDERR#1#block#\n  File \"texrun-files-doc/sh_s_r.sh\", line 14\nValueError: bad\n";
        let report = ctx(&engine, &index).interpret(err);
        assert_eq!((report.errors, report.warnings, report.unknowns), (1, 0, 0));
        assert_eq!(report.lines[0], "* texrun stderr - error on line 41 in \"doc.tex\":");
        assert_eq!(report.lines[1], "    File \"<outputdir>/sh_s_r.sh\", line 14");
    }

    #[test]
    fn test_undelimited_message_uses_index() {
        let engine = engine(false);
        let index = index();
        let err = "sh_s_r.sh: line 7: Warning: odd\n";
        let report = ctx(&engine, &index).interpret(err);
        assert_eq!(report.warnings, 1);
        assert_eq!(report.lines[0], "* texrun stderr - warning on line 11 in \"doc.tex\":");
    }

    #[test]
    fn test_nearest_signature_classifies() {
        let engine = engine(false);
        let index = index();
        let err = "sh_s_r.sh: line 7:\nWarning: deprecated\nError: fatal\n";
        let report = ctx(&engine, &index).interpret(err);
        assert_eq!((report.errors, report.warnings), (0, 1));
    }

    #[test]
    fn test_line_matching_both_signatures_counts_both() {
        let engine = engine(false);
        let index = index();
        let err = "sh_s_r.sh: line 7: Warning and Error on one line\n";
        let report = ctx(&engine, &index).interpret(err);
        assert_eq!((report.errors, report.warnings, report.unknowns), (1, 1, 0));
        assert!(report.lines[0].starts_with("* texrun stderr - error on line"));

        let err = "=>PYTHONTEX:STDERR#0#block#\nWarning: odd\nError: worse\n";
        let report = ctx(&engine, &index).interpret(err);
        assert_eq!((report.errors, report.warnings, report.unknowns), (1, 1, 0));
        assert_eq!(report.lines[0], "* texrun stderr - error near line 10 in \"doc.tex\":");
    }

    #[test]
    fn test_lookbehind_scans_backward() {
        let engine = engine(true);
        let index = index();
        let err = "Error: undefined\nsh_s_r.sh line 6\n";
        let report = ctx(&engine, &index).interpret(err);
        assert_eq!(report.errors, 1);
    }

    #[test]
    fn test_unlocated_chunk_is_near_record() {
        let engine = engine(false);
        let index = index();
        let err = "=>PYTHONTEX:STDERR#0#block#\nsomething odd\nmore\n";
        let report = ctx(&engine, &index).interpret(err);
        assert_eq!(report.unknowns, 1);
        assert_eq!(report.lines[0], "* texrun stderr - unknown near line 10 in \"doc.tex\":");
        assert_eq!(report.lines.len(), 3);
    }

    #[test]
    fn test_typeset_stderr_maps_code_lines() {
        let engine = engine(false);
        let index = index();
        let rename = StderrRename {
            mode: StderrFilename::Full,
            script_base: "texrun-files-doc/sh_s_r",
            script_base_alt: "texrun-files-doc\\sh_s_r",
            session: "s",
            extension: "sh",
        };
        let err = "=>PYTHONTEX:STDERR#1#block#\ntexrun-files-doc/sh_s_r.sh: line 14: boom\ndetail\n";
        let files = ctx(&engine, &index).typeset_stderr(err, &rename);
        assert_eq!(files.unsynced_delimited, 0);
        assert_eq!(files.files["sh_s_r_1"], "sh_s_r.sh: line 2: boom\ndetail\n");

        let generic = StderrRename {
            mode: StderrFilename::GenericScript,
            ..rename
        };
        let files = ctx(&engine, &index).typeset_stderr(err, &generic);
        assert_eq!(files.files["sh_s_r_1"], "<script>: line 2: boom\ndetail\n");
    }
}
