// src/packages/control.rs

//! Debian control paragraph parsing
//!
//! Control data is RFC 822-like: `Field: value` lines, continuation lines
//! starting with whitespace, paragraphs separated by blank lines.

use std::collections::HashMap;

/// Relation fields that can pull other packages into a solver run
pub const RELATION_FIELDS: [&str; 7] = [
    "depends",
    "pre-depends",
    "conflicts",
    "replaces",
    "recommends",
    "provides",
    "breaks",
];

/// Parse one control paragraph into a field map
///
/// Field names are lowercased so lookups are case-insensitive; values keep
/// continuation lines joined with `\n`.
pub fn parse_control(paragraph: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();

    let mut current_field = String::new();
    let mut current_value = String::new();

    for line in paragraph.lines() {
        // Multi-line fields start with a space
        if line.starts_with(' ') || line.starts_with('\t') {
            if !current_field.is_empty() {
                current_value.push('\n');
                current_value.push_str(line.trim());
            }
        } else if let Some((field, value)) = line.split_once(':') {
            // Save previous field
            if !current_field.is_empty() {
                fields.insert(
                    std::mem::take(&mut current_field),
                    std::mem::take(&mut current_value),
                );
            }

            current_field = field.trim().to_ascii_lowercase();
            current_value = value.trim().to_string();
        }
    }

    // Save last field
    if !current_field.is_empty() {
        fields.insert(current_field, current_value);
    }

    fields
}

/// Split a Packages/status file into its paragraphs
///
/// Each returned slice is the raw paragraph text without the separating
/// blank lines.
pub fn split_paragraphs(content: &str) -> Vec<&str> {
    let mut paragraphs = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        let is_blank = line.trim().is_empty();
        match (start, is_blank) {
            (None, false) => start = Some(offset),
            (Some(s), true) => {
                paragraphs.push(content[s..offset].trim_end());
                start = None;
            }
            _ => {}
        }
        offset += line.len();
    }

    if let Some(s) = start {
        let tail = content[s..].trim_end();
        if !tail.is_empty() {
            paragraphs.push(tail);
        }
    }

    paragraphs
}

/// Flatten a relation field into the package identifiers it mentions
///
/// Format: "libc6 (>= 2.34), foo | bar, baz"
///
/// Alternatives are not distinguished: every alternative is returned.
/// Version constraints in parentheses and all whitespace are dropped.
pub fn relation_identifiers(relation: &str) -> Vec<String> {
    relation
        .split([',', '|'])
        .map(|part| {
            let mut id = String::with_capacity(part.len());
            let mut depth = 0usize;
            for c in part.chars() {
                match c {
                    '(' => depth += 1,
                    ')' => depth = depth.saturating_sub(1),
                    c if depth == 0 && !c.is_whitespace() => id.push(c),
                    _ => {}
                }
            }
            id
        })
        .filter(|id| !id.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control() {
        let control = "Package: curl\nVersion: 8.5.0-2\nArchitecture: amd64\nDescription: command line tool\n transfer data with URLs\n .\n more\nDepends: libc6 (>= 2.34), libcurl4 (= 8.5.0-2)\n";
        let fields = parse_control(control);

        assert_eq!(fields.get("package").map(String::as_str), Some("curl"));
        assert_eq!(fields.get("version").map(String::as_str), Some("8.5.0-2"));
        assert_eq!(
            fields.get("description").map(String::as_str),
            Some("command line tool\ntransfer data with URLs\n.\nmore")
        );
        assert!(fields.get("depends").unwrap().contains("libcurl4"));
    }

    #[test]
    fn test_field_names_are_case_insensitive() {
        let fields = parse_control("Package: a\nSHA256: abc\nPre-Depends: dpkg\n");
        assert_eq!(fields.get("sha256").map(String::as_str), Some("abc"));
        assert_eq!(fields.get("pre-depends").map(String::as_str), Some("dpkg"));
    }

    #[test]
    fn test_split_paragraphs() {
        let content = "Package: a\nVersion: 1\n\n\nPackage: b\nVersion: 2\n \nPackage: c\nVersion: 3";
        let paragraphs = split_paragraphs(content);

        assert_eq!(paragraphs.len(), 3);
        assert_eq!(paragraphs[0], "Package: a\nVersion: 1");
        assert!(paragraphs[2].starts_with("Package: c"));
    }

    #[test]
    fn test_relation_identifiers() {
        let ids = relation_identifiers("libc6 (>= 2.34), foo | bar (<< 2), baz");
        assert_eq!(ids, vec!["libc6", "foo", "bar", "baz"]);
    }

    #[test]
    fn test_relation_identifiers_skips_empty_parts() {
        let ids = relation_identifiers(" , a,, (>= 1) ");
        assert_eq!(ids, vec!["a"]);
    }
}
