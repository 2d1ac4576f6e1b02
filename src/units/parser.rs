//! INI-style unit file parser
//!
//! Splits a unit file into sections and key/value entries. Typed
//! conversion into a [`UnitDef`](super::UnitDef) lives in the parent module.

use std::collections::HashMap;
use std::path::Path;

/// A section contains key-value pairs, where each key can have multiple values.
/// The u32 is the order the value appeared (for stable ordering)
pub type ParsedSection = HashMap<String, Vec<(u32, String)>>;

/// A parsed unit file is a map of section names to their contents
pub type ParsedFile = HashMap<String, ParsedSection>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Section '{0}' appears more than once")]
    DuplicateSection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown unit type: {0}")]
    UnknownType(String),
}

/// Parse a unit file from a string
pub fn parse_file(content: &str) -> Result<ParsedFile, ParseError> {
    let mut sections = HashMap::new();
    let lines: Vec<&str> = content.lines().map(|s| s.trim()).collect();

    let mut lines_iter = lines.iter().peekable();

    // Skip lines before the first section
    while lines_iter.peek().is_some_and(|l| !l.starts_with('[')) {
        lines_iter.next();
    }

    let Some(first_section) = lines_iter.next() else {
        return Ok(sections);
    };

    let mut current_section_name = first_section.to_string();
    let mut current_section_lines = Vec::new();

    for line in lines_iter {
        if line.starts_with('[') {
            if sections.contains_key(&current_section_name) {
                return Err(ParseError::DuplicateSection(current_section_name));
            }
            sections.insert(
                current_section_name.clone(),
                parse_section(&current_section_lines),
            );
            current_section_name = line.to_string();
            current_section_lines.clear();
        } else {
            current_section_lines.push(*line);
        }
    }

    if sections.contains_key(&current_section_name) {
        return Err(ParseError::DuplicateSection(current_section_name));
    }
    sections.insert(current_section_name, parse_section(&current_section_lines));

    Ok(sections)
}

/// Keys that accept whitespace-separated multiple values.
/// Everything else (commands in particular) keeps the whole value.
const LIST_KEYS: &[&str] = &["REQUIRES", "CONFLICTS", "WANTEDBY"];

fn parse_section(lines: &[&str]) -> ParsedSection {
    let mut entries: ParsedSection = HashMap::new();
    let mut entry_number = 0u32;

    for line in lines {
        if line.starts_with('#') || line.starts_with(';') || line.is_empty() {
            continue;
        }

        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let name = name.trim().to_uppercase();

        let values: Vec<String> = if LIST_KEYS.contains(&name.as_str()) {
            value.split_whitespace().map(|s| s.to_string()).collect()
        } else {
            vec![value.to_string()]
        };

        let vec = entries.entry(name).or_default();
        for v in values {
            if !v.is_empty() {
                vec.push((entry_number, v));
                entry_number += 1;
            }
        }
    }

    entries
}

/// Read and split a unit file from disk
pub async fn parse_unit_file(path: &Path) -> Result<ParsedFile, ParseError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_file(&content)
}

/// Parse a boolean setting value
pub fn string_to_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "yes" | "true" | "1" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_values(entries: Vec<(u32, String)>) -> Vec<String> {
        let mut sorted = entries;
        sorted.sort_by_key(|(order, _)| *order);
        sorted.into_iter().map(|(_, v)| v).collect()
    }

    #[test]
    fn test_parse_simple_unit() {
        let content = r#"
[Unit]
Description=Test Unit
Requires=network.unit

[Command]
Type=daemon
Run=/usr/bin/test
"#;
        let parsed = parse_file(content).unwrap();

        assert!(parsed.contains_key("[Unit]"));
        assert!(parsed.contains_key("[Command]"));

        let unit = &parsed["[Unit]"];
        assert_eq!(
            extract_values(unit["DESCRIPTION"].clone()),
            vec!["Test Unit"]
        );
    }

    #[test]
    fn test_string_to_bool() {
        assert!(string_to_bool("yes"));
        assert!(string_to_bool("YES"));
        assert!(string_to_bool("true"));
        assert!(string_to_bool("1"));
        assert!(string_to_bool("on"));
        assert!(!string_to_bool("no"));
        assert!(!string_to_bool("0"));
        assert!(!string_to_bool(""));
    }

    #[test]
    fn test_empty_file() {
        let parsed = parse_file("").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_comments_only() {
        let content = "# This is a comment\n; Another comment\n";
        let parsed = parse_file(content).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_list_keys_split_on_whitespace() {
        let content = r#"
[Unit]
Requires=a.unit b.unit   c.unit
Conflicts=x.unit
"#;
        let parsed = parse_file(content).unwrap();
        let unit = &parsed["[Unit]"];
        assert_eq!(
            extract_values(unit["REQUIRES"].clone()),
            vec!["a.unit", "b.unit", "c.unit"]
        );
        assert_eq!(extract_values(unit["CONFLICTS"].clone()), vec!["x.unit"]);
    }

    #[test]
    fn test_commands_keep_commas_and_quotes() {
        let content = r#"
[Command]
Run=/bin/sh -c "echo a,b,c > /tmp/out"
Stop=/bin/kill -TERM $PID
"#;
        let parsed = parse_file(content).unwrap();
        let command = &parsed["[Command]"];
        assert_eq!(
            extract_values(command["RUN"].clone()),
            vec![r#"/bin/sh -c "echo a,b,c > /tmp/out""#]
        );
        assert_eq!(
            extract_values(command["STOP"].clone()),
            vec!["/bin/kill -TERM $PID"]
        );
    }

    #[test]
    fn test_key_case_insensitive() {
        let content = r#"
[Unit]
description=Lower
DESCRIPTION=Upper
"#;
        let parsed = parse_file(content).unwrap();
        let unit = &parsed["[Unit]"];
        assert_eq!(extract_values(unit["DESCRIPTION"].clone()).len(), 2);
    }

    #[test]
    fn test_whitespace_handling() {
        let content = r#"
[Unit]
   Description   =   Test Unit
"#;
        let parsed = parse_file(content).unwrap();
        let unit = &parsed["[Unit]"];
        assert_eq!(
            extract_values(unit["DESCRIPTION"].clone()),
            vec!["Test Unit"]
        );
    }

    #[test]
    fn test_duplicate_section_error() {
        let content = r#"
[Unit]
Description=First

[Unit]
Description=Second
"#;
        let result = parse_file(content);
        assert!(matches!(result, Err(ParseError::DuplicateSection(_))));
    }

    #[test]
    fn test_empty_value_dropped() {
        let content = "[Command]\nRun=\n";
        let parsed = parse_file(content).unwrap();
        let command = &parsed["[Command]"];
        assert!(command.get("RUN").map_or(true, |v| v.is_empty()));
    }
}
