//! Code records: one embedded code block or command instance.
//!
//! Records arrive in document order from the code file. A record is parsed
//! once and never mutated afterwards; grouping, hashing and assembly only
//! borrow it.

use std::fmt;
use std::path::PathBuf;

use crate::engine::EngineRegistry;
use crate::error::{Error, Result};
use crate::paths::expand_user;
use crate::settings::Gobble;
use crate::text::dedent;

/// Identity of one execution unit: family, session and restart group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunKey {
    pub family: String,
    pub session: String,
    pub restart: String,
}

impl RunKey {
    pub fn new(family: &str, session: &str, restart: &str) -> Self {
        Self {
            family: family.to_string(),
            session: session.to_string(),
            restart: restart.to_string(),
        }
    }

    /// Parse the `family#session#restart` form used as a state key.
    pub fn parse(id: &str) -> Option<Self> {
        let mut parts = id.splitn(3, '#');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(f), Some(s), Some(r)) => Some(Self::new(f, s, r)),
            _ => None,
        }
    }

    /// Key used in the persisted state: `family#session#restart`.
    pub fn id(&self) -> String {
        format!("{}#{}#{}", self.family, self.session, self.restart)
    }

    /// Base name of generated files: `family_session_restart`.
    pub fn basename(&self) -> String {
        format!("{}_{}_{}", self.family, self.session, self.restart)
    }

    /// Form shown to users: `family:session:restart`.
    pub fn label(&self) -> String {
        format!("{}:{}:{}", self.family, self.session, self.restart)
    }

    /// Form used inside macro names: `family@session@restart`.
    pub fn macro_tag(&self) -> String {
        format!("{}@{}@{}", self.family, self.session, self.restart)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Where a custom-code hook is placed relative to user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPosition {
    Begin,
    End,
}

/// One parsed code record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRecord {
    pub family: String,
    pub session: String,
    pub restart: String,
    /// Instance as written; custom-code instances carry a `CC` suffix.
    pub instance: String,
    pub instance_int: i64,
    pub command: String,
    pub context: String,
    pub args_run: String,
    pub args_prettyprint: String,
    pub input_file: String,
    /// Document line; environments point at their first code line.
    pub line: u64,
    pub code: String,

    pub is_inline: bool,
    pub is_extfile: bool,
    pub extfile: Option<PathBuf>,
    pub is_cc: bool,
    /// Family and position of a custom-code hook (`CC:<type>:<pos>`).
    pub cc: Option<(String, HookPosition)>,
    pub is_pyg: bool,
    pub is_verb: bool,
    pub is_cons: bool,
    pub is_code: bool,
    pub is_typeset: bool,

    hashable_delims: String,
    typeset_id: String,
}

impl CodeRecord {
    /// Parse one record chunk (the text following a `=>PYTHONTEX#` sentinel).
    pub fn parse(chunk: &str, engines: &EngineRegistry, gobble: Gobble) -> Result<Self> {
        let (delims, code) = chunk
            .split_once("#\n")
            .ok_or_else(|| Error::Record(format!("missing header terminator in {:?}", snippet(chunk))))?;
        let fields: Vec<&str> = delims.split('#').collect();
        let [family, session, restart, instance, command, context, args_run, args_prettyprint, input_file, line] =
            fields[..]
        else {
            return Err(Error::Record(format!(
                "expected 10 header fields, found {} in {:?}",
                fields.len(),
                delims
            )));
        };

        let instance_int: i64 = instance
            .parse()
            .map_err(|_| Error::Record(format!("instance {:?} is not a number", instance)))?;
        let mut line: u64 = line
            .parse()
            .map_err(|_| Error::Record(format!("line {:?} is not a number", line)))?;

        let key_typeset = format!("{}#{}#{}#{}", family, session, restart, instance);
        let hashable_delims = format!("{}#{}#{}#{}", key_typeset, command, context, args_run);

        let is_inline = command.chars().count() <= 1;
        if !is_inline {
            line += 1;
        }

        let is_extfile = session.starts_with("EXT:");
        let extfile = is_extfile.then(|| expand_user(&session["EXT:".len()..]));
        let typeset_id = if is_extfile {
            key_typeset.replacen("EXT:", "", 1)
        } else {
            key_typeset
        };

        let is_cc = family.starts_with("CC:");
        let is_pyg = family.starts_with("PYG");
        let is_verb = restart.ends_with("verb");

        let mut instance = instance.to_string();
        let cc = if is_cc {
            instance.push_str("CC");
            let mut parts = family.splitn(3, ':').skip(1);
            let (Some(cc_type), Some(pos)) = (parts.next(), parts.next()) else {
                return Err(Error::Record(format!("malformed custom code family {:?}", family)));
            };
            let pos = match pos {
                "begin" => HookPosition::Begin,
                "end" => HookPosition::End,
                other => return Err(Error::Record(format!("unknown custom code position {:?}", other))),
            };
            Some((cc_type.to_string(), pos))
        } else {
            None
        };

        let is_cons = if is_verb || is_pyg || is_cc {
            false
        } else {
            engines
                .get(family)
                .ok_or_else(|| Error::UnknownFamily(family.to_string()))?
                .console
        };
        let is_code = !(is_verb || is_pyg || is_cc || is_cons);
        let is_typeset = !(matches!(command, "c" | "code") || (command == "i" && !is_cons));

        let code = match gobble {
            Gobble::Auto => dedent(code),
            Gobble::None => code.to_string(),
        };

        Ok(Self {
            family: family.to_string(),
            session: session.to_string(),
            restart: restart.to_string(),
            instance,
            instance_int,
            command: command.to_string(),
            context: context.to_string(),
            args_run: args_run.to_string(),
            args_prettyprint: args_prettyprint.to_string(),
            input_file: input_file.to_string(),
            line,
            code,
            is_inline,
            is_extfile,
            extfile,
            is_cc,
            cc,
            is_pyg,
            is_verb,
            is_cons,
            is_code,
            is_typeset,
            hashable_delims,
            typeset_id,
        })
    }

    pub fn run_key(&self) -> RunKey {
        RunKey::new(&self.family, &self.session, &self.restart)
    }

    /// `family#session#restart`.
    pub fn run_id(&self) -> String {
        format!("{}#{}#{}", self.family, self.session, self.restart)
    }

    /// `family#session#restart#instance`, with any `EXT:` prefix removed.
    pub fn typeset_id(&self) -> &str {
        &self.typeset_id
    }

    /// Header fields that take part in every digest of this record.
    pub fn hashable_delims(&self) -> &str {
        &self.hashable_delims
    }

    /// Base name of the files produced for this instance when typeset.
    pub fn typeset_basename(&self) -> String {
        self.typeset_id.replace('#', "_")
    }

    /// Family of the custom-code hook, if this is one.
    pub fn cc_type(&self) -> Option<&str> {
        self.cc.as_ref().map(|(t, _)| t.as_str())
    }
}

fn snippet(s: &str) -> &str {
    match s.char_indices().nth(40) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
