//! Emulated interactive Python sessions.
//!
//! A console session is replayed through a small Python driver built on
//! `code.InteractiveConsole`. The driver reads its input from an embedded
//! queue: a startup block, then every record's code behind a
//! `=>PYTHONTEX#<instance>#<command>#` marker. It prints the full
//! transcript, prompts included, with the markers passed through so the
//! transcript can be cut back into per-record blocks here.

use std::collections::HashMap;
use std::fs;

use crate::engine::EngineDefinition;
use crate::error::Result;
use crate::execute::{UnitEnv, UnitKind, UnitResult, run_commands};
use crate::highlight::{Highlighter, place_highlighted};
use crate::interpret::clean_temps;
use crate::paths::{expand_user, native_separators};
use crate::record::{CodeRecord, RunKey};
use crate::report::{Diagnostics, unit_header};
use crate::settings::{ConsoleBanner, ConsoleFilename, HighlightConfig};
use crate::state::ExitStatus;
use crate::text::count_lines;

/// Marker written before every block of console input.
pub const CONSOLE_DELIM: &str = "=>PYTHONTEX#";

const PS1: &str = ">>> ";
const PS2: &str = "... ";

const DRIVER: &str = r#"import code
import json
import sys
from collections import deque
from io import StringIO

QUEUE = json.loads({queue})
BANNER_MODE = {banner}
FILENAME = {filename}


class Console(code.InteractiveConsole):
    def __init__(self):
        code.InteractiveConsole.__init__(self, filename=FILENAME)
        self.iostdout = StringIO()
        self.console_code = deque(QUEUE)

    def raw_input(self, prompt):
        try:
            line = self.console_code.popleft()
        except IndexError:
            raise EOFError
        while line.startswith('=>PYTHONTEX#'):
            old_line = line
            try:
                line = self.console_code.popleft()
                self.write(old_line)
            except IndexError:
                raise EOFError
        if line or prompt == sys.ps2:
            self.write(prompt + line + '\n')
        else:
            self.write('\n')
        return line

    def write(self, data):
        self.iostdout.write(data)


if BANNER_MODE == 'none':
    banner = 'NULL BANNER'
elif BANNER_MODE == 'standard':
    cprt = 'Type "help", "copyright", "credits" or "license" for more information.'
    banner = 'Python ' + sys.version + ' on ' + sys.platform + '\n' + cprt
else:
    banner = 'Python ' + '.'.join(str(n) for n in sys.version_info[:3])

con = Console()
sys.excepthook = sys.__excepthook__
old_stdout = sys.stdout
sys.stdout = con.iostdout
con.interact(banner, exitmsg='')
sys.stdout = old_stdout
sys.stdout.write(con.iostdout.getvalue())
"#;

/// Lines run before any record: enter the working directory and make it
/// and the document directory importable.
fn workingdir_setup(workingdir: &str) -> Vec<String> {
    let wd = json_literal(workingdir);
    vec![
        "import os".to_string(),
        "import sys".to_string(),
        "docdir = os.getcwd()".to_string(),
        format!("if os.path.isdir({}):", wd),
        format!("    os.chdir({})", wd),
        "    if os.getcwd() not in sys.path:".to_string(),
        "        sys.path.append(os.getcwd())".to_string(),
        "else:".to_string(),
        format!("    sys.exit('Cannot find directory \"%s\"' % {})", wd),
        String::new(),
        "if docdir not in sys.path:".to_string(),
        "    sys.path.append(docdir)".to_string(),
        String::new(),
        "del docdir".to_string(),
    ]
}

/// Python literal for a string or list of strings.
fn json_literal(value: impl Into<serde_json::Value>) -> String {
    value.into().to_string()
}

/// One console session.
pub struct ConsoleUnit<'a> {
    pub key: RunKey,
    pub engine: &'a EngineDefinition,
    /// Begin hooks, session records and end hooks, in replay order.
    pub records: Vec<&'a CodeRecord>,
    /// Interpreter that runs the driver.
    pub python: String,
    /// Highlighting for the family, when enabled.
    pub highlight: Option<&'a HighlightConfig>,
}

impl ConsoleUnit<'_> {
    /// Replay queue handed to the driver.
    pub fn replay_queue(&self, workingdir: &str) -> Vec<String> {
        let mut queue = vec![format!("{}STARTUP##\n", CONSOLE_DELIM)];
        queue.extend(workingdir_setup(workingdir));
        queue.extend(self.engine.startup.lines().map(str::to_string));
        for rec in &self.records {
            queue.push(format!("{}{}#{}#\n", CONSOLE_DELIM, rec.instance, rec.command));
            queue.extend(rec.code.lines().map(str::to_string));
        }
        queue
    }

    /// Python source of the driver for `queue`.
    pub fn driver_script(&self, queue: &[String]) -> String {
        let filename = match self.engine.filename {
            ConsoleFilename::Console => "<console>",
            ConsoleFilename::Stdin => "<stdin>",
        };
        DRIVER
            .replacen("{queue}", &json_literal(json_literal(queue.to_vec())), 1)
            .replacen("{banner}", &json_literal(self.engine.banner.as_str()), 1)
            .replacen("{filename}", &json_literal(filename), 1)
    }

    pub fn run(&self, env: &UnitEnv<'_>, highlighter: &dyn Highlighter) -> UnitResult {
        match self.execute(env, highlighter) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("console {} failed: {}", self.key, e);
                UnitResult::failed(UnitKind::Console, &self.key.id(), &self.key.label(), e)
            }
        }
    }

    fn execute(&self, env: &UnitEnv<'_>, highlighter: &dyn Highlighter) -> Result<UnitResult> {
        let paths = env.paths;
        let basename = self.key.basename();
        let label = self.key.label();
        let mut result = UnitResult::new(UnitKind::Console, self.key.id());

        let workingdir = expand_user(&paths.workingdir).to_string_lossy().into_owned();
        let driver = self.driver_script(&self.replay_queue(&workingdir));
        let script_file = paths.output_file(&format!("{}.py", basename));
        fs::write(paths.resolve(&script_file), driver)?;

        let out_file = paths.output_file(&format!("{}.out", basename));
        let err_file = paths.output_file(&format!("{}.err", basename));
        let script = native_separators(&expand_user(&script_file)).replace('\\', "\\\\");
        tracing::info!("running console {}", label);
        let outcome = run_commands(
            &[format!("{} {}", self.python, script)],
            &paths.document_dir,
            &paths.resolve(&out_file),
            &paths.resolve(&err_file),
        )?;

        let transcript = String::from_utf8_lossy(&fs::read(paths.resolve(&out_file))?).into_owned();
        let mut diags = Diagnostics::new();
        diags.push_line(unit_header(&label));
        if outcome.return_code != 0 {
            let err = String::from_utf8_lossy(&fs::read(paths.resolve(&err_file))?).into_owned();
            let mut detail = vec![format!("Running code for console {} failed", label)];
            detail.extend(err.lines().map(|l| l.to_string()));
            diags.error(detail);
        } else {
            let transcript = parse_transcript(&transcript, self.engine.banner);
            self.render(env, highlighter, transcript, &mut result, &mut diags)?;
        }
        clean_temps(paths, env.settings.keeptemps, &script_file, &out_file, &err_file, &mut result.files);

        if diags.lines.len() == 1 {
            diags.lines.clear();
        }
        result.status = ExitStatus::new(diags.errors, diags.warnings);
        result.diagnostics = diags;
        Ok(result)
    }

    fn render(
        &self,
        env: &UnitEnv<'_>,
        highlighter: &dyn Highlighter,
        transcript: Transcript,
        result: &mut UnitResult,
        diags: &mut Diagnostics,
    ) -> Result<()> {
        let by_instance: HashMap<&str, &CodeRecord> =
            self.records.iter().map(|r| (r.instance.as_str(), *r)).collect();

        for block in transcript.blocks {
            match block {
                ConsoleBlock::Startup(content) => {
                    if let Some(kind) = stray_output_kind(&content) {
                        count(diags, kind);
                        diags.push_line(format!("* texrun stderr - {} in console startup code:", kind));
                        diags.lines.extend(content.lines().map(|l| format!("  {}", l)));
                    }
                }
                ConsoleBlock::Hidden { instance, content } => {
                    if let Some(kind) = stray_output_kind(&content) {
                        let line = by_instance.get(instance.as_str()).map_or(0, |r| r.line);
                        let place = if instance.ends_with("CC") {
                            "custom code for console"
                        } else {
                            "console code"
                        };
                        count(diags, kind);
                        diags.push_line(format!("* texrun stderr - {} near line {} in {}:", kind, line, place));
                        diags.push_line("    Console code is not typeset, and should have no output");
                        diags.lines.extend(content.lines().map(|l| format!("  {}", l)));
                    }
                }
                ConsoleBlock::Typeset { instance, content } => {
                    let Some(rec) = by_instance.get(instance.as_str()) else {
                        continue;
                    };
                    result.typeset_cache.insert(instance.clone(), content.clone());
                    match self.highlight {
                        Some(config) => {
                            let processed = highlighter.highlight(&content, config)?;
                            place_highlighted(rec, &content, &processed, env.settings.fvextfile, env.paths, result)?;
                        }
                        None => self.place_plain(env, rec, &content, result)?,
                    }
                }
            }
        }
        Ok(())
    }

    fn place_plain(&self, env: &UnitEnv<'_>, rec: &CodeRecord, content: &str, result: &mut UnitResult) -> Result<()> {
        let key = rec.typeset_id();
        if count_lines(content) < env.settings.fvextfile {
            result.macros.push(format!(
                "\\begin{{pytx@SaveVerbatim}}{{pytx@{}}}\n{}\\end{{pytx@SaveVerbatim}}\n\n",
                key.replace('#', "@"),
                content
            ));
        } else {
            let name = env.paths.output_file(&format!("{}.tex", rec.typeset_basename()));
            fs::write(
                env.paths.resolve(&name),
                format!("\\begin{{pytx@Verbatim}}\n{}\\end{{pytx@Verbatim}}\n\n", content),
            )?;
            result.files.push(name);
        }
        Ok(())
    }
}

/// Severity given to output in blocks that should be silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrayKind {
    Error,
    Warning,
    Unclassified,
}

impl std::fmt::Display for StrayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrayKind::Error => write!(f, "error"),
            StrayKind::Warning => write!(f, "warning"),
            StrayKind::Unclassified => write!(f, "error (?)"),
        }
    }
}

fn count(diags: &mut Diagnostics, kind: StrayKind) {
    match kind {
        StrayKind::Warning => diags.warnings += 1,
        StrayKind::Error | StrayKind::Unclassified => diags.errors += 1,
    }
}

/// Classify output in a block that should contain only echoed input.
fn stray_output_kind(content: &str) -> Option<StrayKind> {
    let stray = content
        .lines()
        .any(|l| !l.starts_with(PS1) && !l.starts_with(PS2) && !l.trim().is_empty());
    if !stray {
        None
    } else if content.contains("Error:") {
        Some(StrayKind::Error)
    } else if content.contains("Warning:") {
        Some(StrayKind::Warning)
    } else {
        Some(StrayKind::Unclassified)
    }
}

/// A transcript cut into per-record blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub blocks: Vec<ConsoleBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleBlock {
    /// Output of the startup code.
    Startup(String),
    /// Output of a record that is run but not typeset.
    Hidden { instance: String, content: String },
    /// Text to typeset for a record.
    Typeset { instance: String, content: String },
}

/// Cut a transcript at its markers. The banner (text before the first
/// marker) is prepended to the first `console` block.
pub fn parse_transcript(transcript: &str, banner: ConsoleBanner) -> Transcript {
    let mut parts = transcript.split(CONSOLE_DELIM);
    let prefix = parts.next().unwrap_or_default();
    let mut banner_text = Some(if banner == ConsoleBanner::None { "" } else { prefix });

    let mut blocks = Vec::new();
    for part in parts {
        let Some((delims, content)) = part.split_once("#\n") else {
            continue;
        };
        if content.is_empty() {
            continue;
        }
        let (instance, command) = delims.split_once('#').unwrap_or((delims, ""));
        if instance == "STARTUP" {
            blocks.push(ConsoleBlock::Startup(content.to_string()));
        } else if matches!(command, "c" | "code") {
            blocks.push(ConsoleBlock::Hidden {
                instance: instance.to_string(),
                content: content.to_string(),
            });
        } else {
            let mut content = if command == "i" {
                content.split_once('\n').map_or("", |(_, rest)| rest).to_string()
            } else if let Some(trimmed) = content.strip_suffix('\n').filter(|t| t.ends_with('\n')) {
                trimmed.to_string()
            } else {
                content.to_string()
            };
            if command == "console" {
                if let Some(banner) = banner_text.take() {
                    content.insert_str(0, banner);
                }
            }
            blocks.push(ConsoleBlock::Typeset {
                instance: instance.to_string(),
                content,
            });
        }
    }
    Transcript { blocks }
}
