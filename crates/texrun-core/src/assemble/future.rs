//! Hoisting of `__future__` imports to the top of Python scripts.

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::record::CodeRecord;

/// Future imports removed from a list of records, plus the rewritten code.
#[derive(Debug, Default)]
pub struct Hoisted<'a> {
    pub imports: Vec<String>,
    /// Code of each record, parallel to the input slice.
    pub code: Vec<Cow<'a, str>>,
}

/// Move leading `from __future__` / `import __future__` lines out of the
/// records.
///
/// Scanning stops at the first line that is not blank, a comment, a
/// docstring or a future import. Imports joined with `;` are rejected.
pub fn hoist<'a>(records: &[&'a CodeRecord]) -> Result<Hoisted<'a>> {
    let mut hoisted = Hoisted {
        imports: Vec::new(),
        code: records.iter().map(|r| Cow::Borrowed(r.code.as_str())).collect(),
    };
    for (n, rec) in records.iter().enumerate() {
        let mut in_docstring = false;
        let mut lines: Vec<&str> = rec.code.split('\n').collect();
        let mut changed = false;
        let mut done = false;

        for line in lines.iter_mut() {
            let is_future = line.starts_with("from __future__") || line.starts_with("import __future__");
            if is_future && !in_docstring {
                if line.contains(';') {
                    return Err(Error::Template(
                        "imports from __future__ should be simple statements; semicolons are not supported"
                            .to_string(),
                    ));
                }
                hoisted.imports.push(line.to_string());
                *line = "";
                changed = true;
            } else if line.trim().is_empty() || line.starts_with('#') || balanced_docstring(line) {
                continue;
            } else if line.matches("\"\"\"").count() % 2 == 1 || line.matches("'''").count() % 2 == 1 {
                in_docstring = !in_docstring;
            } else if !in_docstring {
                done = true;
                break;
            }
        }

        if changed {
            hoisted.code[n] = Cow::Owned(lines.join("\n"));
        }
        if done {
            break;
        }
    }
    Ok(hoisted)
}

fn balanced_docstring(line: &str) -> bool {
    let dq = line.matches("\"\"\"").count();
    let sq = line.matches("'''").count();
    (dq > 0 && dq % 2 == 0) || (sq > 0 && sq % 2 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineRegistry;
    use crate::settings::Gobble;

    fn record(code: &str) -> CodeRecord {
        let engines = EngineRegistry::builtin().expect("Failed to build registry");
        CodeRecord::parse(&format!("py#s#r#0#block####doc.tex#1#\n{}", code), &engines, Gobble::None)
            .expect("Failed to parse record")
    }

    #[test]
    fn test_hoists_leading_imports() {
        let a = record("# comment\nfrom __future__ import division\nx = 1\nfrom __future__ import print_function\n");
        let hoisted = hoist(&[&a]).expect("Failed to hoist");
        assert_eq!(hoisted.imports, vec!["from __future__ import division".to_string()]);
        assert_eq!(
            hoisted.code[0],
            "# comment\n\nx = 1\nfrom __future__ import print_function\n"
        );
    }

    #[test]
    fn test_continues_across_records_until_code() {
        let a = record("from __future__ import division\n");
        let b = record("\"\"\"doc\"\"\"\nfrom __future__ import generators\ny = 2\n");
        let c = record("from __future__ import nested_scopes\n");
        let hoisted = hoist(&[&a, &b, &c]).expect("Failed to hoist");
        assert_eq!(hoisted.imports.len(), 2);
        assert!(matches!(hoisted.code[2], Cow::Borrowed(_)));
    }

    #[test]
    fn test_semicolon_rejected() {
        let a = record("from __future__ import division; import os\n");
        assert!(hoist(&[&a]).is_err());
    }
}
