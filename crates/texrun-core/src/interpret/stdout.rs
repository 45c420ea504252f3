//! Parsing of a session's captured stdout.

use crate::assemble::{CREATED_DELIM, DEPENDENCIES_DELIM, FIELD_DELIM, STDOUT_DELIM};

/// Stdout split into printed content and the trailing file lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdoutSections<'a> {
    pub body: &'a str,
    pub dependencies: Vec<&'a str>,
    pub created: Vec<&'a str>,
}

/// Split off the dependency and created-file sections written by the
/// template footer. Returns `None` when either sentinel is missing.
pub fn split_trailer(out: &str) -> Option<StdoutSections<'_>> {
    let (rest, created) = out.rsplit_once(&format!("{}\n", CREATED_DELIM))?;
    let (body, deps) = rest.rsplit_once(&format!("{}\n", DEPENDENCIES_DELIM))?;

    let mut dependencies: Vec<&str> = Vec::new();
    for dep in deps.lines().filter(|l| !l.is_empty()) {
        if !dependencies.contains(&dep) {
            dependencies.push(dep);
        }
    }
    Some(StdoutSections {
        body,
        dependencies,
        created: created.lines().filter(|l| !l.is_empty()).collect(),
    })
}

/// Output printed by one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdoutBlock<'a> {
    pub instance: &'a str,
    pub command: &'a str,
    /// Printed text, always newline-terminated when non-empty.
    pub content: String,
}

impl StdoutBlock<'_> {
    pub fn is_custom(&self) -> bool {
        self.instance.ends_with("CC")
    }

    pub fn is_sub(&self) -> bool {
        matches!(self.command, "s" | "sub")
    }
}

/// Split printed content at the per-record delimiters.
pub fn blocks(body: &str) -> Vec<StdoutBlock<'_>> {
    body.split(STDOUT_DELIM)
        .skip(1)
        .filter(|b| !b.is_empty())
        .filter_map(|block| {
            let (delims, content) = block.split_once("#\n").unwrap_or((block.trim_end_matches('#'), ""));
            let (instance, command) = delims.split_once('#')?;
            let mut content = content.to_string();
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            Some(StdoutBlock {
                instance,
                command,
                content,
            })
        })
        .collect()
}

/// Values printed for the fields of a `sub` record.
pub fn sub_fields(content: &str) -> Vec<String> {
    content
        .split(FIELD_DELIM)
        .skip(1)
        .map(|chunk| {
            let value = chunk.split_once('\n').map_or("", |(_, rest)| rest);
            value.rsplit_once('\n').map_or(value, |(v, _)| v).to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailer_split_and_dedup() {
        let out = "=>PYTHONTEX:STDOUT#0#block#\nhi\n=>PYTHONTEX:DEPENDENCIES#\na.csv\nb.csv\na.csv\n=>PYTHONTEX:CREATED#\nplot.pdf\n";
        let sections = split_trailer(out).expect("Failed to split");
        assert_eq!(sections.dependencies, vec!["a.csv", "b.csv"]);
        assert_eq!(sections.created, vec!["plot.pdf"]);
        assert_eq!(sections.body, "=>PYTHONTEX:STDOUT#0#block#\nhi\n");
        assert!(split_trailer("no trailer here\n").is_none());
    }

    #[test]
    fn test_blocks_attribute_output_to_instances() {
        let body = "=>PYTHONTEX:STDOUT#0#code#\n=>PYTHONTEX:STDOUT#1#code#\nX\n=>PYTHONTEX:STDOUT#2#code#\n";
        let parsed = blocks(body);
        assert_eq!(parsed.len(), 3);
        let non_empty: Vec<&str> = parsed.iter().filter(|b| !b.content.is_empty()).map(|b| b.instance).collect();
        assert_eq!(non_empty, vec!["1"]);
        assert_eq!(parsed[1].content, "X\n");
    }

    #[test]
    fn test_missing_final_newline_added() {
        let parsed = blocks("=>PYTHONTEX:STDOUT#3CC#code#\npartial");
        assert_eq!(parsed[0].content, "partial\n");
        assert!(parsed[0].is_custom());
    }

    #[test]
    fn test_sub_fields() {
        let content = "=>PYTHONTEX:FIELD_DELIM#\n1\n=>PYTHONTEX:FIELD_DELIM#\ntwo\nlines\n";
        assert_eq!(sub_fields(content), vec!["1".to_string(), "two\nlines".to_string()]);
    }
}
