//! Syntax highlighting of typeset code.
//!
//! Highlighting produces a fancyvrb `Verbatim` block which is then renamed
//! into the package's own environments: short or inline code is saved in a
//! macro (`pytx@SaveVerbatim`), long code goes to a `.pygtex` file
//! (`pytx@Verbatim`).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::change::stamp_dependency;
use crate::error::{Error, Result};
use crate::execute::{UnitEnv, UnitKind, UnitResult};
use crate::paths::JobPaths;
use crate::record::CodeRecord;
use crate::report::{Diagnostics, unit_header};
use crate::settings::HighlightConfig;
use crate::state::ExitStatus;
use crate::text::count_lines;

static VERBATIM_BEGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\begin\{Verbatim\}\[(.+)\]").expect("valid regex"));

/// Something that turns code into a LaTeX `Verbatim` block.
pub trait Highlighter: Send + Sync {
    /// Highlight `code` using the family's configuration.
    fn highlight(&self, code: &str, config: &HighlightConfig) -> Result<String>;

    /// Style definitions for `style`, with macros named after `prefix`.
    fn style_defs(&self, style: &str, prefix: &str) -> Result<String>;
}

/// Highlighting through the `pygmentize` program.
#[derive(Debug, Clone)]
pub struct PygmentizeHighlighter {
    program: PathBuf,
}

impl PygmentizeHighlighter {
    /// Find `pygmentize` on the search path.
    pub fn detect() -> Option<Self> {
        let program = which::which("pygmentize").ok()?;
        tracing::debug!("using {} for highlighting", program.display());
        Some(Self { program })
    }

    fn run(&self, args: &[String], input: Option<&str>) -> Result<String> {
        let launch_error = |e: std::io::Error| Error::Launch {
            command: format!("{} {}", self.program.display(), args.join(" ")),
            message: e.to_string(),
        };
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(launch_error)?;
        let stdin = child.stdin.take();
        let input = input.unwrap_or_default();
        let output = std::thread::scope(|s| {
            if let Some(mut stdin) = stdin {
                // A failed write surfaces as a nonzero exit below.
                s.spawn(move || stdin.write_all(input.as_bytes()));
            }
            child.wait_with_output()
        })?;
        if !output.status.success() {
            return Err(Error::Launch {
                command: format!("{} {}", self.program.display(), args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Highlighter for PygmentizeHighlighter {
    fn highlight(&self, code: &str, config: &HighlightConfig) -> Result<String> {
        let mut options: Vec<String> = config
            .lexer_options
            .iter()
            .chain(&config.formatter_options)
            .filter(|(k, _)| k.as_str() != "commandprefix")
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        options.push("commandprefix=PYG".to_string());
        let lexer = config.lexer.as_deref().unwrap_or("text");
        let mut args = vec!["-l".to_string(), lexer.to_string(), "-f".to_string(), "latex".to_string()];
        args.push("-O".to_string());
        args.push(options.join(","));
        self.run(&args, Some(code))
    }

    fn style_defs(&self, style: &str, prefix: &str) -> Result<String> {
        let args = vec![
            "-S".to_string(),
            style.to_string(),
            "-f".to_string(),
            "latex".to_string(),
            "-O".to_string(),
            format!("commandprefix={}", prefix),
        ];
        self.run(&args, None)
    }
}

/// Fallback that only escapes TeX special characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainHighlighter;

impl Highlighter for PlainHighlighter {
    fn highlight(&self, code: &str, _config: &HighlightConfig) -> Result<String> {
        let mut escaped = String::with_capacity(code.len() + 16);
        for c in code.chars() {
            match c {
                '\\' => escaped.push_str("\\PYGZbs{}"),
                '{' => escaped.push_str("\\PYGZob{}"),
                '}' => escaped.push_str("\\PYGZcb{}"),
                c => escaped.push(c),
            }
        }
        if !escaped.ends_with('\n') {
            escaped.push('\n');
        }
        Ok(format!(
            "\\begin{{Verbatim}}[commandchars=\\\\\\{{\\}}]\n{}\\end{{Verbatim}}\n",
            escaped
        ))
    }

    fn style_defs(&self, _style: &str, prefix: &str) -> Result<String> {
        Ok(format!(
            "\\def\\{p}Zbs{{\\char`\\\\}}\n\\def\\{p}Zob{{\\char`\\{{}}\n\\def\\{p}Zcb{{\\char`\\}}}}\n",
            p = prefix
        ))
    }
}

/// Pick `pygmentize` when highlighting is enabled and available.
pub fn select_highlighter(enabled: bool) -> Box<dyn Highlighter> {
    match enabled.then(PygmentizeHighlighter::detect).flatten() {
        Some(h) => Box::new(h),
        None => {
            if enabled {
                tracing::warn!("pygmentize not found; typeset code will not be colored");
            }
            Box::new(PlainHighlighter)
        }
    }
}

/// Rename a `Verbatim` block into `environment`, named after the record.
fn rename_verbatim(processed: &str, environment: &str, rec: &CodeRecord) -> String {
    let name = format!("pytx@{}@{}@{}@{}", rec.family, rec.session, rec.restart, rec.instance);
    let renamed = VERBATIM_BEGIN.replacen(processed, 1, |caps: &Captures| {
        if rec.args_prettyprint.is_empty() {
            format!("\\begin{{{}}}[{}]{{{}}}", environment, &caps[1], name)
        } else {
            format!("\\begin{{{}}}[{}, {}]{{{}}}", environment, &caps[1], rec.args_prettyprint, name)
        }
    });
    let body = renamed.rsplit_once('\\').map_or(&*renamed, |(b, _)| b);
    format!("{}\\end{{{}}}\n\n", body, environment)
}

/// Where highlighted content for one record ends up.
pub(crate) fn place_highlighted(
    rec: &CodeRecord,
    code: &str,
    processed: &str,
    fvextfile: u64,
    paths: &JobPaths,
    result: &mut UnitResult,
) -> Result<()> {
    let key = rec.typeset_id().to_string();
    if rec.is_inline || count_lines(code) < fvextfile {
        let saved = rename_verbatim(processed, "pytx@SaveVerbatim", rec);
        result.pygments_macros.entry(key).or_default().push(saved);
    } else {
        let content = rename_verbatim(processed, "pytx@Verbatim", rec);
        let name = paths.output_file(&format!("{}.pygtex", rec.typeset_basename()));
        fs::write(paths.resolve(&name), content)?;
        result.pygments_files.entry(key).or_default().push(name);
    }
    Ok(())
}

/// Records that only need highlighting this run.
pub struct HighlightUnit<'a> {
    pub records: Vec<&'a CodeRecord>,
    pub configs: &'a BTreeMap<String, HighlightConfig>,
    /// Console transcripts of sessions that were not re-executed.
    pub typeset_cache: &'a HashMap<String, HashMap<String, String>>,
}

impl HighlightUnit<'_> {
    pub fn run(&self, env: &UnitEnv<'_>, highlighter: &dyn Highlighter) -> UnitResult {
        let mut result = UnitResult::new(UnitKind::Highlight, "");
        let mut diags = Diagnostics::new();
        diags.push_line(unit_header("Pygments"));

        for rec in &self.records {
            let Some(config) = self.configs.get(&rec.family) else {
                continue;
            };
            let code = match self.content(env, rec, &mut result, &mut diags) {
                Some(code) => code,
                None => continue,
            };
            let placed = highlighter
                .highlight(&code, config)
                .and_then(|processed| place_highlighted(rec, &code, &processed, env.settings.fvextfile, env.paths, &mut result));
            if let Err(e) = placed {
                diags.error([format!("Could not highlight {}", rec.typeset_id().replace('#', ":")), e.to_string()]);
            }
        }

        if diags.lines.len() == 1 {
            diags.lines.clear();
        }
        result.status = ExitStatus::new(diags.errors, diags.warnings);
        result.diagnostics = diags;
        tracing::debug!(
            "highlighted {} records into {} macros and {} files",
            self.records.len(),
            result.pygments_macros.len(),
            result.pygments_files.len()
        );
        result
    }

    fn content(
        &self,
        env: &UnitEnv<'_>,
        rec: &CodeRecord,
        result: &mut UnitResult,
        diags: &mut Diagnostics,
    ) -> Option<String> {
        if rec.is_cons {
            return self
                .typeset_cache
                .get(&rec.run_id())
                .and_then(|cache| cache.get(&rec.instance))
                .cloned();
        }
        let Some(extfile) = &rec.extfile else {
            return Some(rec.code.clone());
        };
        let path = env.paths.resolve(&extfile.to_string_lossy());
        let text = fs::read(&path).ok().filter(|_| path.is_file());
        match (text, stamp_dependency(&path, env.hash_dependencies)) {
            (Some(bytes), Some(stamp)) => {
                let deps = HashMap::from([(extfile.to_string_lossy().into_owned(), stamp)]);
                result.typeset_dependencies.insert(rec.typeset_id().to_string(), deps);
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => {
                diags.error([
                    format!("Could not find external file {}", extfile.display()),
                    "The file was not pygmentized".to_string(),
                ]);
                None
            }
        }
    }
}

/// Contents of the highlighting macro file: style definitions for every
/// style in use, then every highlighted macro in key order.
pub fn highlight_macro_file<'a>(
    highlighter: &dyn Highlighter,
    configs: &BTreeMap<String, HighlightConfig>,
    fragments: impl IntoIterator<Item = &'a String>,
) -> Result<String> {
    let mut styles: Vec<&str> = configs.values().map(HighlightConfig::style).collect();
    styles.sort_unstable();
    styles.dedup();

    let mut text = String::new();
    if !styles.is_empty() {
        text.push_str(&highlighter.style_defs("default", "PYG")?);
        for style in styles {
            text.push_str(&highlighter.style_defs(style, &format!("PYG{}", style))?);
        }
    }
    for fragment in fragments {
        text.push_str(fragment);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineRegistry;
    use crate::settings::{Gobble, Settings};
    use tempfile::TempDir;

    fn record(chunk: &str) -> CodeRecord {
        let engines = EngineRegistry::builtin().expect("Failed to build registry");
        CodeRecord::parse(chunk, &engines, Gobble::None).expect("Failed to parse record")
    }

    fn fixture() -> (TempDir, JobPaths) {
        let temp = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp.path().join("doc.pytxcode"), "").expect("Failed to write code file");
        let paths = JobPaths::locate(&temp.path().join("doc")).expect("Failed to locate");
        (temp, paths)
    }

    #[test]
    fn test_plain_highlighter_escapes() {
        let out = PlainHighlighter
            .highlight("f{x}\\n", &HighlightConfig::default())
            .expect("Failed to highlight");
        assert_eq!(
            out,
            "\\begin{Verbatim}[commandchars=\\\\\\{\\}]\nf\\PYGZob{}x\\PYGZcb{}\\PYGZbs{}n\n\\end{Verbatim}\n"
        );
    }

    #[test]
    fn test_rename_into_save_verbatim() {
        let rec = record("py#s#r#2#block###fontsize=\\small#doc.tex#4#\nx = 1\n");
        let processed = "\\begin{Verbatim}[commandchars=\\\\\\{\\}]\nx = 1\n\\end{Verbatim}\n";
        let saved = rename_verbatim(processed, "pytx@SaveVerbatim", &rec);
        assert_eq!(
            saved,
            "\\begin{pytx@SaveVerbatim}[commandchars=\\\\\\{\\}, fontsize=\\small]{pytx@py@s@r@2}\nx = 1\n\\end{pytx@SaveVerbatim}\n\n"
        );
    }

    #[test]
    fn test_long_code_goes_to_file() {
        let (_temp, paths) = fixture();
        paths.create_output_dir().expect("Failed to create output dir");
        let rec = record("py#s#r#0#block####doc.tex#1#\na\nb\nc\n");
        let processed = PlainHighlighter
            .highlight(&rec.code, &HighlightConfig::default())
            .expect("Failed to highlight");

        let mut result = UnitResult::default();
        place_highlighted(&rec, &rec.code, &processed, 2, &paths, &mut result).expect("Failed to place");
        let files = &result.pygments_files["py#s#r#0"];
        assert_eq!(files, &vec!["./py_s_r_0.pygtex".to_string()]);
        let written = fs::read_to_string(paths.resolve(&files[0])).expect("Failed to read");
        assert!(written.starts_with("\\begin{pytx@Verbatim}"));

        let mut result = UnitResult::default();
        place_highlighted(&rec, &rec.code, &processed, u64::MAX, &paths, &mut result).expect("Failed to place");
        assert_eq!(result.pygments_macros["py#s#r#0"].len(), 1);
    }

    #[test]
    fn test_missing_external_file_is_an_error() {
        let (_temp, paths) = fixture();
        let settings = Settings::default();
        let env = UnitEnv {
            paths: &paths,
            settings: &settings,
            encoding: "UTF-8",
            hash_dependencies: false,
        };
        let rec = record("PYGpython#EXT:missing.py#default#0#block####doc.tex#1#\n\n");
        let configs = BTreeMap::from([("PYGpython".to_string(), HighlightConfig::default())]);
        let cache = HashMap::new();
        let unit = HighlightUnit {
            records: vec![&rec],
            configs: &configs,
            typeset_cache: &cache,
        };
        let result = unit.run(&env, &PlainHighlighter);
        assert_eq!(result.status, ExitStatus::new(1, 0));
        assert!(result.diagnostics.lines.iter().any(|l| l.contains("Could not find external file missing.py")));
        assert!(result.pygments_macros.is_empty());
    }

    #[test]
    fn test_macro_file_has_style_defs_first() {
        let configs = BTreeMap::from([("py".to_string(), HighlightConfig::default())]);
        let fragments = ["A\n".to_string(), "B\n".to_string()];
        let text = highlight_macro_file(&PlainHighlighter, &configs, &fragments).expect("Failed to render");
        assert!(text.starts_with("\\def\\PYGZbs"));
        assert!(text.contains("\\def\\PYGdefaultZbs"));
        assert!(text.ends_with("A\nB\n"));
        assert_eq!(highlight_macro_file(&PlainHighlighter, &BTreeMap::new(), &fragments).expect("render"), "A\nB\n");
    }

    #[test]
    fn test_external_file_is_recorded_as_dependency() {
        let (temp, paths) = fixture();
        fs::write(temp.path().join("ext.py"), "print(1)\n").expect("Failed to write");
        let settings = Settings::default();
        let env = UnitEnv {
            paths: &paths,
            settings: &settings,
            encoding: "UTF-8",
            hash_dependencies: true,
        };
        let rec = record("PYGpython#EXT:ext.py#default#0#block####doc.tex#1#\n\n");
        let configs = BTreeMap::from([("PYGpython".to_string(), HighlightConfig::default())]);
        let cache = HashMap::new();
        let unit = HighlightUnit {
            records: vec![&rec],
            configs: &configs,
            typeset_cache: &cache,
        };
        let result = unit.run(&env, &PlainHighlighter);
        assert!(result.diagnostics.is_empty());
        let deps = &result.typeset_dependencies["PYGpython#ext.py#default#0"];
        assert!(deps["ext.py"].hash.as_ref().is_some_and(|h| h.len() == 64));
        assert!(result.pygments_macros["PYGpython#ext.py#default#0"][0].contains("print(1)"));
    }
}
