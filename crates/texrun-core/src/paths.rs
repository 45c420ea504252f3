//! Document, output and working directory resolution.
//!
//! Paths recorded in the run state are kept in the form they were produced
//! (usually relative to the document directory, e.g.
//! `texrun-files-doc/py_default_default.py`). Every filesystem access goes
//! through [`JobPaths`] so the process never has to change its own working
//! directory.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Expand a leading `~` to the user's home directory.
pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Render a path with forward slashes, as used inside generated scripts.
pub fn forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Render a path with the platform's separator, as given to interpreters.
pub fn native_separators(path: &Path) -> String {
    let text = forward_slashes(path);
    if cfg!(windows) { text.replace('/', "\\") } else { text }
}

/// Location of a job: the document it belongs to and the directories
/// named by its settings.
#[derive(Debug, Clone)]
pub struct JobPaths {
    /// Directory containing the document; child processes run here.
    pub document_dir: PathBuf,

    /// Name of the document as given (used for the code file).
    pub raw_jobname: String,

    /// Sanitized job name, used for every file we create.
    pub jobname: String,

    /// Output directory as written in the settings.
    pub outputdir: String,

    /// Working directory as written in the settings.
    pub workingdir: String,
}

impl JobPaths {
    /// Locate the code file for `texname`.
    ///
    /// `texname` may include a directory and an extension; the extension is
    /// stripped when `<texname>.pytxcode` does not exist.
    pub fn locate(texname: &Path) -> Result<Self> {
        let document_dir = match texname.parent() {
            Some(p) if !p.as_os_str().is_empty() => expand_user(&p.to_string_lossy()),
            _ => PathBuf::from("."),
        };
        let file_name = texname
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::CodeFile(format!("invalid document name {}", texname.display())))?;

        let mut raw_jobname = file_name.clone();
        if !document_dir.join(format!("{}.pytxcode", raw_jobname)).is_file() {
            if let Some((stem, _ext)) = file_name.rsplit_once('.') {
                raw_jobname = stem.to_string();
            }
            if !document_dir.join(format!("{}.pytxcode", raw_jobname)).is_file() {
                return Err(Error::CodeFile(format!(
                    "code file {}.pytxcode does not exist; run LaTeX to create it",
                    raw_jobname
                )));
            }
        }

        Ok(Self {
            document_dir,
            jobname: sanitize_jobname(&raw_jobname),
            raw_jobname,
            outputdir: ".".to_string(),
            workingdir: ".".to_string(),
        })
    }

    /// Apply the directories named in the settings block.
    pub fn with_dirs(mut self, outputdir: &str, workingdir: &str) -> Self {
        self.outputdir = outputdir.to_string();
        self.workingdir = workingdir.to_string();
        self
    }

    /// Path of the code file written by the document.
    pub fn code_file(&self) -> PathBuf {
        self.document_dir.join(format!("{}.pytxcode", self.raw_jobname))
    }

    /// Resolve a recorded path (relative to the document directory).
    pub fn resolve(&self, recorded: &str) -> PathBuf {
        let expanded = expand_user(recorded);
        if expanded.is_absolute() {
            expanded
        } else {
            self.document_dir.join(expanded)
        }
    }

    /// Resolve a dependency path; relative paths are taken from the
    /// working directory.
    pub fn resolve_dependency(&self, dep: &str) -> PathBuf {
        let expanded = expand_user(dep);
        if expanded.is_absolute() {
            expanded
        } else {
            self.resolve(&self.workingdir).join(expanded)
        }
    }

    /// Recorded form of a file inside the output directory.
    pub fn output_file(&self, name: &str) -> String {
        Path::new(&self.outputdir).join(name).to_string_lossy().into_owned()
    }

    /// Recorded form of a file inside the working directory.
    pub fn working_file(&self, name: &str) -> String {
        Path::new(&self.workingdir).join(name).to_string_lossy().into_owned()
    }

    /// Absolute output directory.
    pub fn output_dir_abs(&self) -> PathBuf {
        absolutize(&self.resolve(&self.outputdir))
    }

    /// Absolute working directory with forward slashes.
    pub fn workingdir_full(&self) -> String {
        forward_slashes(&absolutize(&self.resolve(&self.workingdir)))
    }

    /// Working directory as seen from the output directory, for scripts
    /// that are started from there.
    pub fn workingdir_from_outputdir(&self) -> String {
        let wd = expand_user(&self.workingdir);
        if wd.is_absolute() {
            return self.workingdir.clone();
        }
        let target = absolutize(&self.resolve(&self.workingdir));
        let base = self.output_dir_abs();
        let target: Vec<_> = target.components().filter(|c| *c != Component::CurDir).collect();
        let base: Vec<_> = base.components().filter(|c| *c != Component::CurDir).collect();
        let common = target.iter().zip(&base).take_while(|(a, b)| a == b).count();
        let mut rel = PathBuf::new();
        for _ in common..base.len() {
            rel.push("..");
        }
        for c in &target[common..] {
            rel.push(c);
        }
        if rel.as_os_str().is_empty() {
            ".".to_string()
        } else {
            rel.to_string_lossy().into_owned()
        }
    }

    pub fn macro_file(&self) -> String {
        self.output_file(&format!("{}.pytxmcr", self.jobname))
    }

    pub fn highlight_macro_file(&self) -> String {
        self.output_file(&format!("{}.pytxpyg", self.jobname))
    }

    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.output_file("texrun_state.bin"))
    }

    /// Create the output directory if needed.
    pub fn create_output_dir(&self) -> Result<()> {
        fs::create_dir_all(self.resolve(&self.outputdir))?;
        Ok(())
    }

    /// Delete recorded files that still exist. Missing files are ignored.
    pub fn remove_recorded<'a>(&self, files: impl IntoIterator<Item = &'a String>) {
        for f in files {
            let path = self.resolve(f);
            if path.is_file() {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!("could not remove {}: {}", path.display(), e);
                } else {
                    tracing::debug!("removed stale file {}", path.display());
                }
            }
        }
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Replace characters that upset TeX in file names.
pub fn sanitize_jobname(raw: &str) -> String {
    raw.replace(' ', "-").replace('"', "").replace('*', "-")
}
