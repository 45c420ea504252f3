//! Interpolation templates for `sub` commands and environments.
//!
//! A `sub` body is literal text with replacement fields `!{expr}`. A field
//! opened with n braces (`!{{expr}}`) may contain runs of up to n-1 braces.
//! Pairs of `!` before `{` are escapes for a literal `!`.

const MAX_BRACES: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Field(usize),
}

/// Literal text with numbered holes, filled with the printed field values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubTemplate {
    pieces: Vec<Piece>,
}

impl SubTemplate {
    /// Split a `sub` body into its template and field expressions.
    ///
    /// Returns `None` when a field is malformed.
    pub fn parse(code: &str) -> Option<(Self, Vec<String>)> {
        let bytes = code.as_bytes();
        let mut pieces = Vec::new();
        let mut fields = Vec::new();
        let mut text = String::new();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'!' {
                let next = code[i..].find('!').map_or(bytes.len(), |p| i + p);
                text.push_str(&code[i..next]);
                i = next;
                continue;
            }
            let run_start = i;
            while i < bytes.len() && bytes[i] == b'!' {
                i += 1;
            }
            let bangs = i - run_start;
            if i >= bytes.len() || bytes[i] != b'{' {
                text.push_str(&code[run_start..i]);
                continue;
            }
            text.push_str(&"!".repeat(bangs / 2));
            if bangs % 2 == 0 {
                continue;
            }
            let (content, end) = scan_field(code, i)?;
            if !text.is_empty() {
                pieces.push(Piece::Text(std::mem::take(&mut text)));
            }
            pieces.push(Piece::Field(fields.len()));
            fields.push(content.trim().to_string());
            i = end;
        }
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }
        Some((Self { pieces }, fields))
    }

    /// Substitute printed values. Holes without a value keep their number.
    pub fn fill(&self, values: &[String]) -> String {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(t) => out.push_str(t),
                Piece::Field(n) => match values.get(*n) {
                    Some(v) => out.push_str(v),
                    None => out.push_str(&format!("{{{}}}", n)),
                },
            }
        }
        out
    }

    pub fn field_count(&self) -> usize {
        self.pieces.iter().filter(|p| matches!(p, Piece::Field(_))).count()
    }
}

/// Scan a field whose braces start at `open`. Returns the content and the
/// index just past the closing braces.
fn scan_field(code: &str, open: usize) -> Option<(&str, usize)> {
    let bytes = code.as_bytes();
    let mut n = 0;
    while open + n < bytes.len() && bytes[open + n] == b'{' {
        n += 1;
    }
    if n > MAX_BRACES {
        return None;
    }
    let start = open + n;

    if n == 1 {
        let mut depth = 1usize;
        for (j, &b) in bytes.iter().enumerate().skip(start) {
            match b {
                b'\n' => return None,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((&code[start..j], j + 1));
                    }
                }
                _ => {}
            }
        }
        return None;
    }

    let mut j = start;
    while j < bytes.len() {
        match bytes[j] {
            b'\n' => return None,
            c @ (b'{' | b'}') => {
                let run_start = j;
                while j < bytes.len() && bytes[j] == c {
                    j += 1;
                }
                let run = j - run_start;
                if c == b'}' && run == n {
                    return Some((&code[start..run_start], j));
                }
                if run >= n {
                    return None;
                }
            }
            _ => j += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_brace_fields() {
        let (template, fields) = SubTemplate::parse("x = !{x}, y = !{ f(y) }\n").expect("Failed to parse");
        assert_eq!(fields, vec!["x".to_string(), "f(y)".to_string()]);
        assert_eq!(template.field_count(), 2);
        assert_eq!(template.fill(&["1".into(), "2".into()]), "x = 1, y = 2\n");
    }

    #[test]
    fn test_nested_and_multi_brace_fields() {
        let (_, fields) = SubTemplate::parse("!{d[{1: 2}[1]]}").expect("Failed to parse");
        assert_eq!(fields, vec!["d[{1: 2}[1]]".to_string()]);

        let (_, fields) = SubTemplate::parse("!{{ '}' }}").expect("Failed to parse");
        assert_eq!(fields, vec!["'}'".to_string()]);
    }

    #[test]
    fn test_escaped_bang() {
        let (template, fields) = SubTemplate::parse("a !!{b} !c").expect("Failed to parse");
        assert!(fields.is_empty());
        assert_eq!(template.fill(&[]), "a !{b} !c");

        let (template, fields) = SubTemplate::parse("!!!{v}").expect("Failed to parse");
        assert_eq!(fields, vec!["v".to_string()]);
        assert_eq!(template.fill(&["7".into()]), "!7");
    }

    #[test]
    fn test_invalid_fields() {
        assert!(SubTemplate::parse("!{unterminated").is_none());
        assert!(SubTemplate::parse("!{a\nb}").is_none());
        assert!(SubTemplate::parse("!{{a}}}").is_none());
    }

    #[test]
    fn test_missing_values_keep_hole_numbers() {
        let (template, _) = SubTemplate::parse("v=!{v}").expect("Failed to parse");
        assert_eq!(template.fill(&[]), "v={0}");
    }
}
