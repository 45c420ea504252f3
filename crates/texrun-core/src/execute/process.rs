//! Launching interpreter commands.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// Split a command line into arguments using POSIX shell quoting rules.
///
/// Single quotes are literal, double quotes allow `\"` and `\\` escapes and
/// a backslash outside quotes escapes the next character.
pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unclosed(line)),
                    }
                }
            }
            '"' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(unclosed(line)),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unclosed(line)),
                    }
                }
            }
            '\\' => {
                in_arg = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

fn unclosed(line: &str) -> Error {
    Error::InvalidRequest(format!("unclosed quotation in command {:?}", line))
}

/// Result of running a command sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code of the last command that ran; -1 if killed by a signal.
    pub return_code: i32,
    /// Arguments of the last command that ran.
    pub last_command: Vec<String>,
}

/// Run `commands` in order inside `cwd`, appending their stdout and stderr
/// to the given files. Stops at the first nonzero exit.
///
/// A program that cannot be found is retried once through the platform
/// shell, which also resolves batch files and shell functions.
pub fn run_commands(commands: &[String], cwd: &Path, stdout_path: &Path, stderr_path: &Path) -> Result<CommandOutcome> {
    let stdout = File::create(stdout_path)?;
    let stderr = File::create(stderr_path)?;
    let mut outcome = CommandOutcome {
        return_code: 0,
        last_command: Vec::new(),
    };

    for line in commands {
        let argv = split_command_line(line)?;
        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        tracing::debug!("running {:?} in {}", argv, cwd.display());

        let status = match Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(stdout.try_clone()?)
            .stderr(stderr.try_clone()?)
            .status()
        {
            Ok(status) => status,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("{} not found; retrying through the shell", program);
                shell_command(&argv.join(" "))
                    .current_dir(cwd)
                    .stdin(Stdio::null())
                    .stdout(stdout.try_clone()?)
                    .stderr(stderr.try_clone()?)
                    .status()
                    .map_err(|e| Error::Launch {
                        command: line.clone(),
                        message: e.to_string(),
                    })?
            }
            Err(e) => {
                return Err(Error::Launch {
                    command: line.clone(),
                    message: e.to_string(),
                });
            }
        };

        outcome.return_code = status.code().unwrap_or(-1);
        outcome.last_command = argv;
        if outcome.return_code != 0 {
            break;
        }
    }
    Ok(outcome)
}

/// Run one command attached to the terminal and wait for it.
///
/// Used for interactive sessions; nothing is captured.
pub fn run_attached(line: &str, cwd: &Path) -> Result<i32> {
    let argv = split_command_line(line)?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidRequest("empty interactive command".to_string()))?;
    tracing::debug!("running {:?} attached in {}", argv, cwd.display());
    let launch_error = |e: io::Error| Error::Launch {
        command: line.to_string(),
        message: e.to_string(),
    };
    let status = match Command::new(program).args(args).current_dir(cwd).status() {
        Ok(status) => status,
        Err(e) if e.kind() == io::ErrorKind::NotFound => shell_command(&argv.join(" "))
            .current_dir(cwd)
            .status()
            .map_err(launch_error)?,
        Err(e) => return Err(launch_error(e)),
    };
    Ok(status.code().unwrap_or(-1))
}

#[cfg(windows)]
fn shell_command(joined: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C")
        .arg(format!("@echo off & call {} & if errorlevel 1 exit 1", joined));
    cmd
}

#[cfg(not(windows))]
fn shell_command(joined: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(joined);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_plain_and_quoted() {
        assert_eq!(
            split_command_line("python3 out/py_a_b.py").expect("Failed to split"),
            vec!["python3", "out/py_a_b.py"]
        );
        assert_eq!(
            split_command_line(r#"octave -q "/tmp/my dir/x.m""#).expect("Failed to split"),
            vec!["octave", "-q", "/tmp/my dir/x.m"]
        );
        assert_eq!(
            split_command_line(r"a 'b c' d\ e").expect("Failed to split"),
            vec!["a", "b c", "d e"]
        );
        assert_eq!(split_command_line("x ''").expect("Failed to split"), vec!["x", ""]);
        assert!(split_command_line("x 'open").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_commands_captures_and_stops() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let out = temp.path().join("run.out");
        let err = temp.path().join("run.err");
        let commands = vec![
            "sh -c 'echo hello; echo oops >&2'".to_string(),
            "sh -c 'exit 3'".to_string(),
            "sh -c 'echo unreachable'".to_string(),
        ];
        let outcome = run_commands(&commands, temp.path(), &out, &err).expect("Failed to run");
        assert_eq!(outcome.return_code, 3);
        assert_eq!(std::fs::read_to_string(&out).expect("read"), "hello\n");
        assert_eq!(std::fs::read_to_string(&err).expect("read"), "oops\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_program_falls_back_to_shell() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let outcome = run_commands(
            &["definitely-not-a-real-program-texrun".to_string()],
            temp.path(),
            &temp.path().join("o"),
            &temp.path().join("e"),
        )
        .expect("Failed to run");
        assert_eq!(outcome.return_code, 127);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_attached_returns_exit_code() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        assert_eq!(run_attached("sh -c 'exit 4'", temp.path()).expect("Failed to run"), 4);
        assert!(run_attached("   ", temp.path()).is_err());
    }
}
