//! Small text utilities shared by templates, records and console replay.

use crate::error::{Error, Result};

/// Remove common leading whitespace from every line.
///
/// Lines made only of whitespace are ignored when computing the margin and
/// are normalized to empty lines, matching the usual dedent behavior.
pub fn dedent(text: &str) -> String {
    let margin = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| &l[..l.len() - l.trim_start_matches([' ', '\t']).len()])
        .fold(None::<&str>, |acc, indent| match acc {
            None => Some(indent),
            Some(prev) => Some(common_prefix(prev, indent)),
        })
        .unwrap_or("");

    let mut out = String::with_capacity(text.len());
    for piece in text.split_inclusive('\n') {
        let (line, newline) = match piece.strip_suffix('\n') {
            Some(l) => (l, "\n"),
            None => (piece, ""),
        };
        if line.trim().is_empty() {
            out.push_str(newline);
        } else {
            out.push_str(line.strip_prefix(margin).unwrap_or(line));
            out.push_str(newline);
        }
    }
    out
}

fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let len = a
        .char_indices()
        .zip(b.chars())
        .take_while(|((_, x), y)| x == y)
        .map(|((i, x), _)| i + x.len_utf8())
        .last()
        .unwrap_or(0);
    &a[..len]
}

/// Dedent and drop leading newlines; used for engine templates.
pub fn dedent_template(text: &str) -> String {
    dedent(text).trim_start_matches('\n').to_string()
}

/// Fill `{name}` fields in a template.
///
/// `{{` and `}}` produce literal braces. A field whose name `lookup` does not
/// know is an error, so that a typo in a template is caught before any
/// script is written.
pub fn format_fields<F>(template: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &template[i + 1..];
                let end = rest.find('}').ok_or_else(|| {
                    Error::Template(format!("unterminated field in template near {:?}", snippet(rest)))
                })?;
                let name = &rest[..end];
                let value = lookup(name)
                    .ok_or_else(|| Error::Template(format!("unknown template field {{{}}}", name)))?;
                out.push_str(&value);
                for _ in 0..name.chars().count() + 1 {
                    chars.next();
                }
            }
            '}' => {
                return Err(Error::Template(format!(
                    "single '}}' in template near {:?}",
                    snippet(&template[i..])
                )));
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn snippet(s: &str) -> &str {
    match s.char_indices().nth(24) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Count newline characters.
pub fn count_lines(s: &str) -> u64 {
    s.bytes().filter(|&b| b == b'\n').count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedent_common_margin() {
        let text = "    a = 1\n      b = 2\n\n    c = 3\n";
        assert_eq!(dedent(text), "a = 1\n  b = 2\n\nc = 3\n");
    }

    #[test]
    fn test_dedent_mixed_margin_keeps_shortest() {
        assert_eq!(dedent("\tx\n  y\n"), "\tx\n  y\n");
    }

    #[test]
    fn test_dedent_template_drops_leading_newlines() {
        assert_eq!(dedent_template("\n\n    x\n    y\n"), "x\ny\n");
    }

    #[test]
    fn test_format_fields_substitutes_and_escapes() {
        let out = format_fields("print('{x}') {{literal}}", |name| {
            (name == "x").then(|| "value".to_string())
        })
        .expect("format should succeed");
        assert_eq!(out, "print('value') {literal}");
    }

    #[test]
    fn test_format_fields_rejects_unknown() {
        let err = format_fields("{missing}", |_| None).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_count_lines() {
        assert_eq!(count_lines("a\nb\n"), 2);
        assert_eq!(count_lines(""), 0);
    }
}
