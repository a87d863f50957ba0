//! Pattern matching for substitution rules.
//!
//! Thin wrapper around `regex::bytes` that mirrors the semantics the rule
//! store persists: multiline patterns over raw bytes, non-overlapping
//! iteration inside a byte range, and the replacement template language
//! (`\g<name>`, `\g<N>`, `\N`, `\\`, `\n`, `\t`). Subjects are byte slices
//! because child-process output is not guaranteed to be valid UTF-8.

use std::collections::HashMap;

use regex::bytes::{Regex, RegexBuilder};
use thiserror::Error;

/// Pattern compilation or template validation failure.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("{0}")]
    Compile(Box<regex::Error>),
    #[error("invalid replacement template: {0}")]
    BadTemplate(String),
}

/// A compiled match pattern with its capture-name table.
pub struct Pattern {
    re: Regex,
    names: HashMap<String, usize>,
}

/// One match: byte range plus the text of every capture group.
///
/// Group 0 is the whole match; unset groups carry an empty string, the same
/// shape the replacement expansion expects.
#[derive(Debug, Clone)]
pub struct Match {
    pub start: usize,
    pub end: usize,
    pub groups: Vec<Vec<u8>>,
    names: HashMap<String, usize>,
}

impl Match {
    /// Bytes of the whole match.
    pub fn text(&self) -> &[u8] {
        &self.groups[0]
    }

    fn group_by_name(&self, name: &str) -> Option<&[u8]> {
        self.names
            .get(name)
            .and_then(|&idx| self.groups.get(idx))
            .map(Vec::as_slice)
    }
}

impl Pattern {
    /// Compile with multiline anchors; patterns always see `^`/`$` at line
    /// boundaries, matching how rules are written.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let re = RegexBuilder::new(pattern)
            .multi_line(true)
            .build()
            .map_err(|e| PatternError::Compile(Box::new(e)))?;
        let names = re
            .capture_names()
            .enumerate()
            .filter_map(|(idx, name)| name.map(|n| (n.to_string(), idx)))
            .collect();
        Ok(Self { re, names })
    }

    /// Non-overlapping matches inside `[start, end)` of `subject`.
    ///
    /// A zero-length match advances the scan by one byte so iteration
    /// always terminates.
    pub fn find_iter_range(&self, subject: &[u8], start: usize, end: usize) -> Vec<Match> {
        let end = end.min(subject.len());
        let mut results = Vec::new();
        if start > end {
            return results;
        }
        let haystack = &subject[..end];
        let mut offset = start;
        while offset <= end {
            let Some(caps) = self.re.captures_at(haystack, offset) else {
                break;
            };
            let whole = caps.get(0).map(|m| (m.start(), m.end()));
            let Some((m_start, m_end)) = whole else {
                break;
            };
            let groups = (0..caps.len())
                .map(|i| caps.get(i).map(|g| g.as_bytes().to_vec()).unwrap_or_default())
                .collect();
            results.push(Match {
                start: m_start,
                end: m_end,
                groups,
                names: self.names.clone(),
            });
            if m_end == m_start {
                offset = m_end + 1;
            } else {
                offset = m_end;
            }
        }
        results
    }
}

/// Validate that a pattern compiles.
pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    Pattern::compile(pattern).map(|_| ())
}

/// Validate a replacement template's syntax without a subject.
///
/// Group references that merely point at groups the pattern does not define
/// expand to nothing at runtime and are not errors; malformed `\g` escapes
/// are.
pub fn validate_template(template: &str) -> Result<(), PatternError> {
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() && bytes[i + 1] == b'g' {
            if i + 2 >= bytes.len() || bytes[i + 2] != b'<' {
                return Err(PatternError::BadTemplate(
                    "expected '<' after \\g".to_string(),
                ));
            }
            let Some(close) = template[i + 3..].find('>') else {
                return Err(PatternError::BadTemplate(
                    "unterminated group reference".to_string(),
                ));
            };
            if close == 0 {
                return Err(PatternError::BadTemplate(
                    "empty group reference".to_string(),
                ));
            }
            i += 3 + close + 1;
        } else if bytes[i] == b'\\' && i + 1 < bytes.len() {
            i += 2;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Expand a replacement template against one match.
///
/// `\g<name>` and `\g<N>` insert a group by name or index, `\N` inserts a
/// single-digit group, `\\`, `\n` and `\t` insert the usual characters.
/// Unknown names and out-of-range indices expand to the empty string.
pub fn expand_replacement(template: &str, m: &Match) -> Vec<u8> {
    let bytes = template.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(template.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let next = bytes[i + 1];
            if next == b'g' && i + 2 < bytes.len() && bytes[i + 2] == b'<' {
                if let Some(close) = template[i + 3..].find('>') {
                    let reference = &template[i + 3..i + 3 + close];
                    if !reference.is_empty() && reference.bytes().all(|b| b.is_ascii_digit()) {
                        if let Ok(idx) = reference.parse::<usize>() {
                            if let Some(group) = m.groups.get(idx) {
                                out.extend_from_slice(group);
                            }
                        }
                    } else if let Some(group) = m.group_by_name(reference) {
                        out.extend_from_slice(group);
                    }
                    i += 3 + close + 1;
                    continue;
                }
            } else if next == b'\\' {
                out.push(b'\\');
                i += 2;
                continue;
            } else if next == b'n' {
                out.push(b'\n');
                i += 2;
                continue;
            } else if next == b't' {
                out.push(b'\t');
                i += 2;
                continue;
            } else if next.is_ascii_digit() {
                let idx = (next - b'0') as usize;
                if let Some(group) = m.groups.get(idx) {
                    out.extend_from_slice(group);
                }
                i += 2;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Replace the first match of `pattern` in `subject`, expanding `template`.
#[allow(dead_code)]
pub fn sub_first(pattern: &str, template: &str, subject: &[u8]) -> Result<Vec<u8>, PatternError> {
    let compiled = Pattern::compile(pattern)?;
    let matches = compiled.find_iter_range(subject, 0, subject.len());
    let mut out = Vec::with_capacity(subject.len());
    match matches.first() {
        Some(m) => {
            out.extend_from_slice(&subject[..m.start]);
            out.extend_from_slice(&expand_replacement(template, m));
            out.extend_from_slice(&subject[m.end..]);
        }
        None => out.extend_from_slice(subject),
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finditer_respects_range() {
        let p = Pattern::compile("o").unwrap();
        let found = p.find_iter_range(b"foo bar foo", 4, 11);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].start, 9);
        assert_eq!(found[1].start, 10);
    }

    #[test]
    fn zero_length_matches_advance() {
        let p = Pattern::compile("x*").unwrap();
        let found = p.find_iter_range(b"ab", 0, 2);
        let starts: Vec<usize> = found.iter().map(|m| m.start).collect();
        assert_eq!(starts, vec![0, 1, 2]);
    }

    #[test]
    fn multiline_anchors_see_inner_lines() {
        let p = Pattern::compile("^b$").unwrap();
        let found = p.find_iter_range(b"a\nb\nc", 0, 5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start, 2);
    }

    #[test]
    fn unset_group_is_empty() {
        let p = Pattern::compile("(a)|(b)").unwrap();
        let found = p.find_iter_range(b"b", 0, 1);
        assert_eq!(found[0].groups[1], b"");
        assert_eq!(found[0].groups[2], b"b");
    }

    #[test]
    fn expansion_forms() {
        let p = Pattern::compile(r"(?P<word>\w+) (\w+)").unwrap();
        let m = &p.find_iter_range(b"hello world", 0, 11)[0];
        assert_eq!(expand_replacement(r"\g<word>", m), b"hello");
        assert_eq!(expand_replacement(r"\g<2>", m), b"world");
        assert_eq!(expand_replacement(r"\2-\1", m), b"world-hello");
        assert_eq!(expand_replacement(r"a\\b\nc\td", m), b"a\\b\nc\td");
        assert_eq!(expand_replacement(r"\g<missing>", m), b"");
        assert_eq!(expand_replacement(r"\9", m), b"");
        assert_eq!(expand_replacement(r"\r", m), b"\\r");
    }

    #[test]
    fn expansion_of_escaped_group_text_round_trips() {
        let p = Pattern::compile("(.+)").unwrap();
        for sample in ["plain", "a+b", "x|y"] {
            let m = &p.find_iter_range(sample.as_bytes(), 0, sample.len())[0];
            assert_eq!(expand_replacement(r"\g<1>", m), sample.as_bytes());
        }
    }

    #[test]
    fn template_validation() {
        assert!(validate_template(r"ok \g<1> \g<name> \\ \n").is_ok());
        assert!(validate_template(r"\g<unclosed").is_err());
        assert!(validate_template(r"\g1").is_err());
        assert!(validate_template(r"\g<>").is_err());
        assert!(validate_template(r"trailing \").is_ok());
    }

    #[test]
    fn sub_replaces_first_match_only() {
        let got = sub_first("o", "0", b"foo").unwrap();
        assert_eq!(got, b"f0o");
        let got = sub_first(r"(\w+)", r"<\g<1>>", b"hi there").unwrap();
        assert_eq!(got, b"<hi> there");
    }
}
