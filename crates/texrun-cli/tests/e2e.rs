//! End-to-end tests for the texrun CLI.
//!
//! These tests run the binary against code files written the way the LaTeX
//! package writes them, using the builtin bash engine.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests
#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// Create a temporary document directory with a code file.
struct TestDocument {
    _temp_dir: TempDir,
    dir: PathBuf,
}

impl TestDocument {
    fn new(records: &[(&str, &str)]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let dir = temp_dir.path().to_path_buf();
        fs::write(dir.join("doc.pytxcode"), code_file(records)).expect("Failed to write code file");

        Self {
            _temp_dir: temp_dir,
            dir,
        }
    }

    fn tex_path(&self) -> PathBuf {
        self.dir.join("doc.tex")
    }

    fn output(&self, name: &str) -> PathBuf {
        self.dir.join("pythontex-files-doc").join(name)
    }
}

/// Build a code file from `(command, code)` records in the default bash session.
fn code_file(records: &[(&str, &str)]) -> String {
    let mut text = String::new();
    for (n, (command, code)) in records.iter().enumerate() {
        text.push_str(&format!(
            "=>PYTHONTEX#bash#default#default#{}#{}####doc.tex#{}#\n{}\n",
            n,
            command,
            n + 1,
            code
        ));
    }
    text.push_str("=>PYTHONTEX:SETTINGS#\nversion=0.18\noutputdir=pythontex-files-doc\nworkingdir=.\n");
    text
}

fn texrun() -> Command {
    let mut cmd = Command::cargo_bin("texrun").expect("Failed to find texrun binary");
    cmd.args(["--interpreter", "bash:sh"]);
    cmd
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e))
}

// =============================================================================
// Runs
// =============================================================================

#[test]
fn test_run_writes_outputs_and_summary() {
    let doc = TestDocument::new(&[("block", "echo hello"), ("i", "echo 7")]);

    texrun()
        .arg(doc.tex_path())
        .assert()
        .success()
        .stdout(predicate::str::contains("texrun:  doc - 0 error(s), 0 warning(s)"));

    assert_eq!(read(&doc.output("bash_default_default_0.stdout")), "hello\n");
    let macros = read(&doc.output("doc.pytxmcr"));
    assert!(macros.contains("pytx@MCR@bash@default@default@1}\n7\\endpytx@SVMCR"));
}

#[test]
fn test_jobname_without_extension() {
    let doc = TestDocument::new(&[("block", "echo plain")]);

    texrun().arg(doc.dir.join("doc")).assert().success();
    assert!(doc.output("doc.pytxmcr").is_file());
}

#[test]
fn test_failing_code_sets_exit_code() {
    let doc = TestDocument::new(&[("block", "echo boom >&2\nexit 3")]);

    texrun()
        .arg(doc.tex_path())
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1 error(s)"));

    texrun()
        .args(["--error-exit-code", "false"])
        .arg(doc.tex_path())
        .assert()
        .success();
}

#[test]
fn test_interactive_unknown_session() {
    let doc = TestDocument::new(&[("block", "echo hi")]);

    texrun()
        .args(["--interactive", "nosuch"])
        .arg(doc.tex_path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("* texrun error"))
        .stdout(predicate::str::contains("Session \"nosuch\" does not exist."));
}

// =============================================================================
// Argument errors
// =============================================================================

#[test]
fn test_missing_code_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");

    texrun()
        .arg(temp_dir.path().join("absent.tex"))
        .assert()
        .failure()
        .stdout(predicate::str::contains("* texrun error"))
        .stdout(predicate::str::contains("absent.pytxcode does not exist"));
}

#[test]
fn test_runall_conflicts_with_rerun() {
    Command::cargo_bin("texrun")
        .expect("Failed to find texrun binary")
        .args(["doc", "--runall", "--rerun", "never"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_invalid_interpreter_override() {
    let doc = TestDocument::new(&[("block", "echo hi")]);

    Command::cargo_bin("texrun")
        .expect("Failed to find texrun binary")
        .args(["--interpreter", "bash"])
        .arg(doc.tex_path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("invalid --interpreter value"));
}
