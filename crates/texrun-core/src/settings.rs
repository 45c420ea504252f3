//! Settings block of the code file.
//!
//! The document writes one `key=value` pair per line after the
//! `=>PYTHONTEX:SETTINGS#` sentinel. Values are parsed into typed enums here;
//! anything unknown is a counted warning, anything unparsable is fatal.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::report::Diagnostics;

/// Version of the code-file protocol this build understands.
pub const PROTOCOL_VERSION: &str = "0.18";

macro_rules! keyword_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Settings(format!(
                        "invalid value {:?} for {}", other, stringify!($name)
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

keyword_enum! {
    /// When a cached session is executed again.
    RerunMode {
        Never => "never",
        Modified => "modified",
        Errors => "errors",
        Warnings => "warnings",
        Always => "always",
    }
}

keyword_enum! {
    /// Which scratch files survive after a unit has been interpreted.
    KeepTemps {
        None => "none",
        Code => "code",
        All => "all",
    }
}

keyword_enum! {
    /// How the script name is rewritten in `.stderr` files.
    StderrFilename {
        Full => "full",
        Session => "session",
        GenericFile => "genericfile",
        GenericScript => "genericscript",
    }
}

keyword_enum! {
    /// Whether code bodies are dedented before use.
    Gobble {
        None => "none",
        Auto => "auto",
    }
}

keyword_enum! {
    /// Language-version directives injected into Python scripts.
    PyFuture {
        None => "none",
        All => "all",
        Default => "default",
    }
}

keyword_enum! {
    /// Banner shown at the top of the first console block.
    ConsoleBanner {
        None => "none",
        Standard => "standard",
        PyVersion => "pyversion",
    }
}

keyword_enum! {
    /// File name reported by console tracebacks.
    ConsoleFilename {
        Console => "console",
        Stdin => "stdin",
    }
}

/// Highlighting configuration for one family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HighlightConfig {
    pub lexer: Option<String>,
    pub lexer_options: BTreeMap<String, String>,
    pub formatter_options: BTreeMap<String, String>,
}

impl HighlightConfig {
    /// Stable textual form, stored to detect configuration changes.
    pub fn fingerprint(&self) -> String {
        let join = |m: &BTreeMap<String, String>| {
            m.iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "{}|{}|{}",
            self.lexer.as_deref().unwrap_or(""),
            join(&self.lexer_options),
            join(&self.formatter_options)
        )
    }

    pub fn style(&self) -> &str {
        self.formatter_options
            .get("style")
            .map(String::as_str)
            .unwrap_or("default")
    }
}

/// Parsed settings block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub version: Option<String>,
    pub outputdir: String,
    pub workingdir: String,
    pub workingdirset: bool,
    pub gobble: Gobble,
    /// `None` when the document leaves the choice to the command line.
    pub rerun: Option<RerunMode>,
    pub hashdependencies: Option<bool>,
    pub makestderr: bool,
    pub stderrfilename: StderrFilename,
    pub keeptemps: KeepTemps,
    pub pyfuture: PyFuture,
    pub pyconfuture: PyFuture,
    pub pygments: bool,
    /// Code with fewer lines than this is stored in macros rather than files.
    pub fvextfile: u64,
    pub highlight: BTreeMap<String, HighlightConfig>,
    pub pyconbanner: ConsoleBanner,
    pub pyconfilename: ConsoleFilename,
    pub depythontex: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: None,
            outputdir: ".".to_string(),
            workingdir: ".".to_string(),
            workingdirset: false,
            gobble: Gobble::None,
            rerun: None,
            hashdependencies: None,
            makestderr: false,
            stderrfilename: StderrFilename::Full,
            keeptemps: KeepTemps::None,
            pyfuture: PyFuture::Default,
            pyconfuture: PyFuture::None,
            pygments: true,
            fvextfile: u64::MAX,
            highlight: BTreeMap::new(),
            pyconbanner: ConsoleBanner::None,
            pyconfilename: ConsoleFilename::Stdin,
            depythontex: false,
        }
    }
}

const GLOBAL_FAMILY: &str = ":GLOBAL";

impl Settings {
    /// Parse the settings block. Unknown keys produce warnings in `diags`.
    pub fn parse(text: &str, diags: &mut Diagnostics) -> Result<Self> {
        let mut settings = Settings::default();
        let mut global = HighlightConfig::default();

        for line in text.split('\n').filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::Settings(format!("malformed settings line {:?}", line)))?;
            match key {
                "version" => settings.version = Some(value.to_string()),
                "outputdir" => settings.outputdir = value.to_string(),
                "workingdir" => settings.workingdir = value.to_string(),
                "workingdirset" => settings.workingdirset = parse_bool(key, value)?,
                "gobble" => settings.gobble = value.parse()?,
                "rerun" => {
                    settings.rerun = if value == "default" { None } else { Some(value.parse()?) }
                }
                "hashdependencies" => {
                    settings.hashdependencies = if value == "default" {
                        None
                    } else {
                        Some(parse_bool(key, value)?)
                    }
                }
                "makestderr" => settings.makestderr = parse_bool(key, value)?,
                "stderrfilename" => settings.stderrfilename = value.parse()?,
                "keeptemps" => settings.keeptemps = value.parse()?,
                "pyfuture" => settings.pyfuture = value.parse()?,
                "pyconfuture" => settings.pyconfuture = value.parse()?,
                "pygments" => settings.pygments = parse_bool(key, value)?,
                "fvextfile" => settings.fvextfile = parse_fvextfile(value, diags)?,
                "pygglobal" | "pygfamily" => {
                    let (family, config) = parse_highlight(value)?;
                    if family == GLOBAL_FAMILY {
                        global = config;
                    } else {
                        settings.highlight.insert(family, merge_global(config, &global));
                    }
                }
                "pyconbanner" => settings.pyconbanner = value.parse()?,
                "pyconfilename" => settings.pyconfilename = value.parse()?,
                "depythontex" => settings.depythontex = parse_bool(key, value)?,
                other => diags.warning([format!("Unknown option \"{}\"", other)]),
            }
        }

        match settings.version.as_deref() {
            Some(PROTOCOL_VERSION) => Ok(settings),
            found => Err(Error::Settings(format!(
                "code file version {} does not match {}; run LaTeX to create an updated code file",
                found.unwrap_or("<missing>"),
                PROTOCOL_VERSION
            ))),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "True" => Ok(true),
        "false" | "False" => Ok(false),
        other => Err(Error::Settings(format!("invalid boolean {:?} for {}", other, key))),
    }
}

fn parse_fvextfile(value: &str, diags: &mut Diagnostics) -> Result<u64> {
    let n: i64 = value
        .trim()
        .parse()
        .map_err(|_| Error::Settings("unable to parse package option fvextfile".to_string()))?;
    Ok(match n {
        n if n < 0 => u64::MAX,
        0 => {
            diags.warning(["Invalid value for package option fvextfile."]);
            1
        }
        n => n as u64,
    })
}

/// Parse `family|lexer[,k=v...]|option[,k=v...]`.
fn parse_highlight(value: &str) -> Result<(String, HighlightConfig)> {
    let compact: String = value.chars().filter(|c| *c != ' ').collect();
    let mut parts = compact.splitn(3, '|');
    let (Some(family), Some(lexer_opts), Some(options)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Settings(format!("malformed highlighting entry {:?}", value)));
    };

    let mut config = HighlightConfig::default();
    for item in lexer_opts.split(',').filter(|s| !s.is_empty()) {
        match item.split_once('=') {
            Some(("lexer", v)) => config.lexer = Some(v.to_string()),
            Some((k, v)) => {
                config.lexer_options.insert(k.to_string(), v.to_string());
            }
            None => config.lexer = Some(item.to_string()),
        }
    }
    for item in options.split(',').filter(|s| !s.is_empty()) {
        let (k, v) = item.split_once('=').unwrap_or((item, "true"));
        let v = match v {
            "True" => "true",
            "False" => "false",
            v => v,
        };
        config.formatter_options.insert(k.to_string(), v.to_string());
    }
    Ok((family.to_string(), config))
}

fn merge_global(mut config: HighlightConfig, global: &HighlightConfig) -> HighlightConfig {
    if global.lexer.is_some() {
        config.lexer = global.lexer.clone();
    }
    config.lexer_options.extend(global.lexer_options.clone());
    config.formatter_options.extend(global.formatter_options.clone());
    let style = config
        .formatter_options
        .entry("style".to_string())
        .or_insert_with(|| "default".to_string())
        .clone();
    config
        .formatter_options
        .insert("commandprefix".to_string(), format!("PYG{}", style));
    config
}

/// Settings whose change invalidates the entire stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VitalSettings {
    pub version: String,
    pub encoding: String,
    pub gobble: Gobble,
    pub fvextfile: u64,
    pub pyfuture: PyFuture,
}

impl VitalSettings {
    pub fn from_settings(settings: &Settings, encoding: &str) -> Self {
        Self {
            version: settings.version.clone().unwrap_or_default(),
            encoding: encoding.to_string(),
            gobble: settings.gobble,
            fvextfile: settings.fvextfile,
            pyfuture: settings.pyfuture,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(extra: &str) -> String {
        format!("version={}\noutputdir=out\nworkingdir=.\n{}", PROTOCOL_VERSION, extra)
    }

    #[test]
    fn test_parse_basic_block() {
        let mut diags = Diagnostics::new();
        let text = block("rerun=modified\nkeeptemps=code\nmakestderr=true\nfvextfile=-1\ngobble=auto\n");
        let settings = Settings::parse(&text, &mut diags).expect("Failed to parse settings");

        assert_eq!(settings.outputdir, "out");
        assert_eq!(settings.rerun, Some(RerunMode::Modified));
        assert_eq!(settings.keeptemps, KeepTemps::Code);
        assert!(settings.makestderr);
        assert_eq!(settings.fvextfile, u64::MAX);
        assert_eq!(settings.gobble, Gobble::Auto);
        assert!(diags.is_empty());
    }

    #[test]
    fn test_default_rerun_defers_to_command_line() {
        let mut diags = Diagnostics::new();
        let settings = Settings::parse(&block("rerun=default\nhashdependencies=default\n"), &mut diags)
            .expect("Failed to parse settings");
        assert_eq!(settings.rerun, None);
        assert_eq!(settings.hashdependencies, None);
    }

    #[test]
    fn test_unknown_key_is_a_warning() {
        let mut diags = Diagnostics::new();
        Settings::parse(&block("colour=blue\n"), &mut diags).expect("Failed to parse settings");
        assert_eq!(diags.warnings, 1);
        assert!(diags.lines[1].contains("Unknown option \"colour\""));
    }

    #[test]
    fn test_fvextfile_zero_warns() {
        let mut diags = Diagnostics::new();
        let settings = Settings::parse(&block("fvextfile=0\n"), &mut diags).expect("Failed to parse settings");
        assert_eq!(settings.fvextfile, 1);
        assert_eq!(diags.warnings, 1);
    }

    #[test]
    fn test_fvextfile_garbage_is_fatal() {
        let mut diags = Diagnostics::new();
        assert!(Settings::parse(&block("fvextfile=many\n"), &mut diags).is_err());
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let mut diags = Diagnostics::new();
        let err = Settings::parse("version=0.1\n", &mut diags).unwrap_err();
        assert!(err.to_string().contains("0.1"));
        assert!(Settings::parse("outputdir=x\n", &mut diags).is_err());
    }

    #[test]
    fn test_highlight_global_merged_into_family() {
        let mut diags = Diagnostics::new();
        let text = block("pygglobal=:GLOBAL||style=emacs\npygfamily=py|python3|linenos\n");
        let settings = Settings::parse(&text, &mut diags).expect("Failed to parse settings");

        let py = &settings.highlight["py"];
        assert_eq!(py.lexer.as_deref(), Some("python3"));
        assert_eq!(py.style(), "emacs");
        assert_eq!(py.formatter_options["commandprefix"], "PYGemacs");
        assert_eq!(py.formatter_options["linenos"], "true");
    }

    #[test]
    fn test_highlight_default_style() {
        let mut diags = Diagnostics::new();
        let settings = Settings::parse(&block("pygfamily=rb|ruby|\n"), &mut diags)
            .expect("Failed to parse settings");
        assert_eq!(settings.highlight["rb"].formatter_options["commandprefix"], "PYGdefault");
    }
}
