//! Loading the code file written by the document.

use std::fs;
use std::path::Path;

use crate::engine::EngineRegistry;
use crate::error::{Error, Result};
use crate::record::CodeRecord;
use crate::report::Diagnostics;
use crate::settings::Settings;

pub const RECORD_DELIM: &str = "=>PYTHONTEX#";
pub const SETTINGS_DELIM: &str = "=>PYTHONTEX:SETTINGS#";

/// Raw contents of a code file: record text and the settings block.
#[derive(Debug, Clone)]
pub struct CodeFile {
    pub records_text: String,
    pub settings_text: String,
}

impl CodeFile {
    /// Split file contents at the last settings sentinel.
    pub fn split(contents: &str) -> Result<Self> {
        let (records_text, settings_text) = contents.rsplit_once(SETTINGS_DELIM).ok_or_else(|| {
            Error::CodeFile(
                "the code file appears to have an outdated format or be invalid; run LaTeX to make sure it is current"
                    .to_string(),
            )
        })?;
        Ok(Self {
            records_text: records_text.to_string(),
            settings_text: settings_text.to_string(),
        })
    }

    pub fn settings(&self, diags: &mut Diagnostics) -> Result<Settings> {
        Settings::parse(&self.settings_text, diags)
    }

    /// Parse every record, in document order.
    pub fn records(&self, engines: &EngineRegistry, settings: &Settings) -> Result<Vec<CodeRecord>> {
        if !self.records_text.starts_with(RECORD_DELIM) {
            return Ok(Vec::new());
        }
        self.records_text
            .split(RECORD_DELIM)
            .skip(1)
            .map(|chunk| CodeRecord::parse(chunk, engines, settings.gobble))
            .collect()
    }
}

/// Read and split a code file.
///
/// Only UTF-8 can be decoded; other encoding names are kept as labels for
/// the generated scripts and the file is decoded lossily.
pub fn load_code_file(path: &Path, encoding: &str) -> Result<CodeFile> {
    if !path.is_file() {
        return Err(Error::CodeFile(format!(
            "code file {} does not exist; run LaTeX to create it",
            path.display()
        )));
    }
    let bytes = fs::read(path)?;
    let contents = match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            if is_utf8(encoding) {
                tracing::warn!("{} is not valid UTF-8; decoding lossily", path.display());
            }
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };
    CodeFile::split(&contents)
}

pub fn is_utf8(encoding: &str) -> bool {
    matches!(encoding.to_ascii_lowercase().as_str(), "utf-8" | "utf8" | "utf_8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PROTOCOL_VERSION;
    use tempfile::TempDir;

    fn sample() -> String {
        format!(
            "=>PYTHONTEX#py#default#default#0#code####doc.tex#3#\nx = 1\n\
             =>PYTHONTEX#py#default#default#1#i####doc.tex#5#\nx\n\
             =>PYTHONTEX:SETTINGS#\nversion={}\noutputdir=out\nworkingdir=.\n",
            PROTOCOL_VERSION
        )
    }

    #[test]
    fn test_split_and_parse() {
        let file = CodeFile::split(&sample()).expect("Failed to split");
        let mut diags = Diagnostics::new();
        let settings = file.settings(&mut diags).expect("Failed to parse settings");
        let engines = EngineRegistry::builtin().expect("Failed to build registry");
        let records = file.records(&engines, &settings).expect("Failed to parse records");

        assert_eq!(settings.outputdir, "out");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].code, "x = 1\n");
        assert!(records[1].is_inline);
    }

    #[test]
    fn test_missing_settings_is_fatal() {
        assert!(CodeFile::split("=>PYTHONTEX#py#a#b#0#c####f#1#\n").is_err());
    }

    #[test]
    fn test_empty_record_section() {
        let file = CodeFile::split(&format!("=>PYTHONTEX:SETTINGS#\nversion={}\n", PROTOCOL_VERSION))
            .expect("Failed to split");
        let mut diags = Diagnostics::new();
        let settings = file.settings(&mut diags).expect("Failed to parse settings");
        let engines = EngineRegistry::empty();
        assert!(file.records(&engines, &settings).expect("Failed to parse").is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let err = load_code_file(&temp.path().join("doc.pytxcode"), "UTF-8").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_load_from_disk() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let path = temp.path().join("doc.pytxcode");
        fs::write(&path, sample()).expect("Failed to write code file");
        let file = load_code_file(&path, "utf8").expect("Failed to load");
        assert!(file.records_text.starts_with(RECORD_DELIM));
        assert!(is_utf8("UTF-8"));
        assert!(!is_utf8("latin-1"));
    }
}
