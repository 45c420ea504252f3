//! Language engine definitions.
//!
//! An engine is plain data: how to launch the interpreter, the script
//! template and per-record wrapper, and how to read its stderr. Engines are
//! collected into an [`EngineRegistry`] once at startup and shared read-only
//! with every worker. Subtypes are built by copying a base definition and
//! patching fields through [`EngineBuilder`].

mod builtin;

use std::collections::BTreeMap;

use regex::Regex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::hash::DigestAccumulator;
use crate::settings::{ConsoleBanner, ConsoleFilename, PyFuture, Settings};
use crate::text::dedent_template;

/// A fully built, immutable engine.
#[derive(Debug, Clone)]
pub struct EngineDefinition {
    pub name: String,
    pub language: String,
    /// Script extension without the leading dot.
    pub extension: String,
    /// Commands run in order; each may use `{file}`, `{File}`, `{workingdir}`.
    pub commands: Vec<String>,
    /// Script template containing exactly one `{body}`.
    pub template: String,
    /// Per-record wrapper containing exactly one `{code}`.
    pub wrapper: String,
    /// Template for inline expressions, with a `{code}` field.
    pub formatter: String,
    /// Template emitted for each field of a substitution command.
    pub sub: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub linenumbers: Vec<Regex>,
    /// Scan backwards from a located line when classifying diagnostics.
    pub lookbehind: bool,
    pub console: bool,
    pub startup: String,
    pub banner: ConsoleBanner,
    pub filename: ConsoleFilename,
    /// Files produced by the commands themselves, e.g. compiled binaries.
    pub created: Vec<String>,
    /// Extra code placed in the template's `{extend}` slot.
    pub extend: String,
}

impl EngineDefinition {
    /// Start a new engine from scratch.
    pub fn builder(name: &str, language: &str, extension: &str) -> EngineBuilder {
        EngineBuilder::new(name, language, extension)
    }

    pub fn is_python(&self) -> bool {
        self.language.starts_with("python")
    }

    /// Digest over everything that influences generated scripts.
    ///
    /// Part of every session's hash tuple, so editing a template re-runs
    /// all sessions of that family.
    pub fn engine_hash(&self) -> String {
        let mut hasher = DigestAccumulator::new();
        for c in &self.commands {
            hasher.update(c);
        }
        hasher.update(&self.template);
        hasher.update(&self.wrapper);
        hasher.update(&self.formatter);
        if self.console {
            hasher.update(&self.startup);
            hasher.update(self.banner.as_str());
            hasher.update(self.filename.as_str());
        }
        hasher.finish()
    }
}

/// Copy-then-patch construction of engine definitions.
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    name: String,
    language: String,
    extension: String,
    commands: Vec<String>,
    template: String,
    wrapper: String,
    formatter: String,
    sub: String,
    errors: Vec<String>,
    warnings: Vec<String>,
    linenumbers: Vec<String>,
    lookbehind: bool,
    console: bool,
    startup: String,
    created: Vec<String>,
    extend: String,
}

impl EngineBuilder {
    fn new(name: &str, language: &str, extension: &str) -> Self {
        Self {
            name: name.to_string(),
            language: language.to_string(),
            extension: extension.trim_start_matches('.').to_string(),
            commands: Vec::new(),
            template: String::new(),
            wrapper: String::new(),
            formatter: String::new(),
            sub: String::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            linenumbers: vec!["line {number}".to_string()],
            lookbehind: false,
            console: false,
            startup: String::new(),
            created: Vec::new(),
            extend: String::new(),
        }
    }

    pub fn language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    pub fn extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn template(mut self, template: &str) -> Self {
        self.template = dedent_template(template);
        self
    }

    pub fn wrapper(mut self, wrapper: &str) -> Self {
        self.wrapper = dedent_template(wrapper);
        self
    }

    pub fn formatter(mut self, formatter: &str) -> Self {
        self.formatter = formatter.to_string();
        self
    }

    pub fn sub(mut self, sub: &str) -> Self {
        self.sub = sub.to_string();
        self
    }

    pub fn errors<I: IntoIterator<Item = &'static str>>(mut self, errors: I) -> Self {
        self.errors = errors.into_iter().map(str::to_string).collect();
        self
    }

    pub fn warnings<I: IntoIterator<Item = &'static str>>(mut self, warnings: I) -> Self {
        self.warnings = warnings.into_iter().map(str::to_string).collect();
        self
    }

    /// Line-number patterns; `{number}` marks the captured line.
    pub fn linenumbers<I: IntoIterator<Item = &'static str>>(mut self, patterns: I) -> Self {
        self.linenumbers = patterns.into_iter().map(str::to_string).collect();
        self
    }

    pub fn lookbehind(mut self, lookbehind: bool) -> Self {
        self.lookbehind = lookbehind;
        self
    }

    pub fn console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn startup(mut self, startup: &str) -> Self {
        self.startup = startup.to_string();
        self
    }

    pub fn created<I: IntoIterator<Item = &'static str>>(mut self, created: I) -> Self {
        self.created = created.into_iter().map(str::to_string).collect();
        self
    }

    /// Append to the inherited `{extend}` code.
    pub fn extend(mut self, code: &str) -> Self {
        let mut code = code.to_string();
        if !code.ends_with('\n') {
            code.push('\n');
        }
        self.extend.push_str(&dedent_template(&code));
        self
    }

    pub fn build(self) -> Result<EngineDefinition> {
        if !self.console {
            if self.template.matches("{body}").count() != 1 {
                return Err(Error::Template(format!("template for {} must contain one {{body}}", self.name)));
            }
            if self.wrapper.matches("{code}").count() != 1 {
                return Err(Error::Template(format!("wrapper for {} must contain one {{code}}", self.name)));
            }
        } else if !self.commands.is_empty() {
            return Err(Error::Template(format!("console engine {} cannot define commands", self.name)));
        }

        let linenumbers = self
            .linenumbers
            .iter()
            .map(|p| {
                Regex::new(&p.replace("{number}", r"(\d+)"))
                    .map_err(|e| Error::Template(format!("bad line-number pattern {:?}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut formatter = self.formatter;
        if !formatter.ends_with('\n') {
            formatter.push('\n');
        }
        let mut startup = self.startup;
        if !startup.ends_with('\n') {
            startup.push('\n');
        }

        Ok(EngineDefinition {
            name: self.name,
            language: self.language,
            extension: self.extension,
            commands: self.commands,
            template: self.template,
            wrapper: self.wrapper,
            formatter,
            sub: self.sub,
            errors: self.errors,
            warnings: self.warnings,
            linenumbers,
            lookbehind: self.lookbehind,
            console: self.console,
            startup: dedent_template(&startup),
            banner: ConsoleBanner::None,
            filename: ConsoleFilename::Stdin,
            created: self.created,
            extend: self.extend,
        })
    }
}

/// Interpreter names substituted into engine commands (`{python}` etc.).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterMap {
    map: BTreeMap<String, String>,
}

impl Default for InterpreterMap {
    fn default() -> Self {
        let python = if cfg!(windows) { "python" } else { "python3" };
        let map = [
            ("python", python),
            ("ruby", "ruby"),
            ("julia", "julia"),
            ("octave", "octave"),
            ("bash", "bash"),
            ("rustc", "rustc"),
            ("sage", "sage"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { map }
    }
}

impl InterpreterMap {
    /// Apply `--interpreter` overrides.
    ///
    /// Accepts `lang:cmd, lang:cmd` and the braced/quoted dictionary form
    /// `{"python": "python3.12"}`.
    pub fn with_overrides(mut self, arg: &str) -> Result<Self> {
        let inner = arg.trim().trim_start_matches('{').trim_end_matches('}');
        for item in inner.split(',').filter(|s| !s.trim().is_empty()) {
            let (k, v) = item
                .split_once(':')
                .ok_or_else(|| Error::InvalidRequest(format!("invalid --interpreter entry {:?}", item)))?;
            let k = k.trim_matches(|c| c == ' ' || c == '\'' || c == '"');
            let v = v.trim_matches(|c| c == ' ' || c == '\'' || c == '"');
            if k.is_empty() || v.is_empty() {
                return Err(Error::InvalidRequest(format!("invalid --interpreter entry {:?}", item)));
            }
            self.map.insert(k.to_string(), v.to_string());
        }
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    /// Replace interpreter fields; launch-time fields are left intact.
    pub fn apply(&self, command: &str) -> String {
        let mut out = command.to_string();
        for (k, v) in &self.map {
            out = out.replace(&format!("{{{}}}", k), v);
        }
        out
    }
}

/// Read-only table of engines keyed by family name.
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    engines: FxHashMap<String, EngineDefinition>,
}

impl EngineRegistry {
    /// An empty registry, for tests that supply synthetic engines.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in language.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::empty();
        builtin::register_all(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, engine: EngineDefinition) {
        self.engines.insert(engine.name.clone(), engine);
    }

    /// Copy `base` under a new name, ready to be patched.
    pub fn derive(&self, base: &str, name: &str) -> Result<EngineBuilder> {
        let def = self
            .engines
            .get(base)
            .ok_or_else(|| Error::UnknownFamily(base.to_string()))?;
        Ok(EngineBuilder {
            name: name.to_string(),
            language: def.language.clone(),
            extension: def.extension.clone(),
            commands: def.commands.clone(),
            template: def.template.clone(),
            wrapper: def.wrapper.clone(),
            formatter: def.formatter.clone(),
            sub: def.sub.clone(),
            errors: def.errors.clone(),
            warnings: def.warnings.clone(),
            linenumbers: Vec::new(),
            lookbehind: def.lookbehind,
            console: def.console,
            startup: def.startup.clone(),
            created: def.created.clone(),
            extend: def.extend.clone(),
        }
        .with_compiled_linenumbers(&def.linenumbers))
    }

    pub fn get(&self, family: &str) -> Option<&EngineDefinition> {
        self.engines.get(family)
    }

    pub fn contains(&self, family: &str) -> bool {
        self.engines.contains_key(family)
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    /// Produce the registry used for one run.
    ///
    /// Resolves interpreter names in commands, injects language-version
    /// directives for Python engines and applies console banner and
    /// filename settings.
    pub fn customize(&self, settings: &Settings, interpreters: &InterpreterMap) -> Self {
        let engines = self
            .engines
            .iter()
            .map(|(name, def)| {
                let mut def = def.clone();
                def.commands = def.commands.iter().map(|c| interpreters.apply(c)).collect();
                if def.is_python() {
                    if !def.console {
                        if let Some(imports) = future_imports(settings.pyfuture) {
                            def.template = def.template.replace("{future}", &format!("{}{{future}}", imports));
                        }
                    } else {
                        if let Some(imports) = future_imports(settings.pyconfuture) {
                            def.startup = format!("{}{}", imports, def.startup);
                        }
                        def.banner = settings.pyconbanner;
                        def.filename = settings.pyconfilename;
                    }
                }
                (name.clone(), def)
            })
            .collect();
        Self { engines }
    }
}

impl EngineBuilder {
    fn with_compiled_linenumbers(mut self, compiled: &[Regex]) -> Self {
        self.linenumbers = compiled
            .iter()
            .map(|r| r.as_str().replace(r"(\d+)", "{number}"))
            .collect();
        self
    }
}

fn future_imports(mode: PyFuture) -> Option<&'static str> {
    match mode {
        PyFuture::None => None,
        PyFuture::Default => Some(
            "from __future__ import absolute_import\n\
             from __future__ import division\n\
             from __future__ import print_function\n",
        ),
        PyFuture::All => Some(
            "from __future__ import absolute_import\n\
             from __future__ import division\n\
             from __future__ import print_function\n\
             from __future__ import unicode_literals\n",
        ),
    }
}
