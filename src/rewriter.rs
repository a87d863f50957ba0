//! Rule application over output chunks.
//!
//! `match_content` walks the fetched rule set in order and rewrites one
//! chunk of child output. A byte-for-byte condition map tracks what each
//! output byte is: untouched (0x00), substituted (0x01), or substituted by
//! an `end_match_here` rule (0x02). A 0x02 byte poisons its whole line:
//! later rules cannot match anywhere on it, including bytes before the
//! original match.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use regex::bytes::Regex;

use crate::defs;
use crate::engine::{self, Pattern};
use crate::matcher;
use crate::store::{self, Rule, StoreError};

const COND_CLEAN: u8 = 0x00;
const COND_MATCHED: u8 = 0x01;
const COND_END_MATCH: u8 = 0x02;

/// Byte lengths of the lines of `content`, terminators included.
fn line_lengths(line_re: &Regex, content: &[u8]) -> Vec<usize> {
    let mut lengths: Vec<usize> = line_re
        .find_iter(content)
        .map(|m| m.len())
        .filter(|&len| len > 0)
        .collect();
    if lengths.is_empty() {
        lengths.push(content.len());
    }
    lengths
}

/// Offset of the first byte of the line containing `pos`.
fn line_start_before(content: &[u8], pos: usize) -> usize {
    let mut line_start = pos;
    let mut cursor = pos;
    while cursor > 0 {
        let is_newline = defs::NEWLINES.iter().any(|nl| {
            let nl = nl.as_bytes();
            cursor >= nl.len() && &content[cursor - nl.len()..cursor] == nl
        });
        if is_newline {
            break;
        }
        line_start = cursor - 1;
        cursor -= 1;
    }
    line_start
}

/// Offset just past the line containing `pos`, terminator included.
fn line_end_after(content: &[u8], pos: usize) -> usize {
    let mut line_end = pos;
    let mut cursor = pos;
    while cursor < content.len() {
        line_end = cursor + 1;
        let mut matched_terminator = false;
        for nl in defs::NEWLINES {
            let nl = nl.as_bytes();
            if cursor + nl.len() <= content.len() && &content[cursor..cursor + nl.len()] == nl {
                line_end = cursor + nl.len();
                matched_terminator = true;
                break;
            }
        }
        if matched_terminator {
            break;
        }
        cursor += 1;
    }
    line_end
}

/// Apply `rules` to `content`, returning the rewritten bytes and the set of
/// line indices (in the result) that were changed.
pub fn match_content(
    content: &[u8],
    rules: &[Rule],
    command: Option<&str>,
    is_stderr: bool,
) -> (Vec<u8>, BTreeSet<usize>) {
    let mut content = content.to_vec();
    let line_re = Regex::new(&defs::line_match_pattern()).unwrap();

    let mut encountered_ids: HashSet<&str> = HashSet::new();
    let mut last_file_id: Option<&str> = None;
    let mut condition_map: Vec<u8> = vec![COND_CLEAN; content.len()];

    for rule in rules {
        if encountered_ids.contains(rule.unique_id.as_str()) {
            continue;
        }
        if rule.stdout_stderr_only != 0 && (is_stderr as i64) + 1 != rule.stdout_stderr_only {
            continue;
        }
        if let (Some(cmd), Some(filter)) = (command, rule.effective_command.as_deref()) {
            if !matcher::check_command(
                filter,
                rule.command_match_strictness,
                cmd,
                rule.command_is_regex,
            ) {
                continue;
            }
        }

        // Rules from a different source file start from a clean slate.
        if last_file_id != Some(rule.file_id.as_str()) {
            last_file_id = Some(rule.file_id.as_str());
            condition_map = vec![COND_CLEAN; content.len()];
        }

        let Ok(pattern) = Pattern::compile(&rule.match_pattern) else {
            continue;
        };

        let ranges: Vec<usize> = if rule.match_is_multiline {
            vec![content.len()]
        } else {
            line_lengths(&line_re, &content)
        };

        let mut new_content = content.clone();
        let mut new_condition_map = condition_map.clone();
        let mut offset: isize = 0;
        let mut map_offset: isize = 0;
        let mut matched = false;
        let mut cur_start = 0usize;

        for length in ranges {
            // Patch the previous terminator byte to '\n' so multiline
            // anchors treat the range start as a line start.
            let mut subject = content.clone();
            if cur_start > 0 {
                subject[cur_start - 1] = b'\n';
            }

            for m in pattern.find_iter_range(&subject, cur_start, cur_start + length) {
                let match_len = m.text().len();

                let line_start = line_start_before(&content, m.start);
                let line_end = line_end_after(&content, m.end);
                let poisoned = condition_map[line_start..line_end.min(condition_map.len())]
                    .iter()
                    .any(|&b| b == COND_END_MATCH);
                if poisoned {
                    continue;
                }
                matched = true;

                let replacement = if rule.is_regex {
                    engine::expand_replacement(&rule.substitute_pattern, &m)
                } else {
                    rule.substitute_pattern.clone().into_bytes()
                };

                let pos = (m.start as isize + offset) as usize;
                new_content.splice(pos..pos + match_len, replacement.iter().copied());
                offset += replacement.len() as isize - match_len as isize;

                let mark = if rule.end_match_here {
                    COND_END_MATCH
                } else {
                    COND_MATCHED
                };
                let map_pos = (m.start as isize + map_offset) as usize;
                new_condition_map.splice(
                    map_pos..map_pos + match_len,
                    std::iter::repeat(mark).take(replacement.len()),
                );
                map_offset += replacement.len() as isize - match_len as isize;
            }

            cur_start += length;
        }

        content = new_content;
        condition_map = new_condition_map;
        if matched {
            encountered_ids.insert(rule.unique_id.as_str());
        }
    }

    debug_assert_eq!(condition_map.len(), content.len());

    // Line indices of the final content that carry any substituted byte.
    let mut changed_lines = BTreeSet::new();
    let mut cur_start = 0usize;
    for (index, length) in line_lengths(&line_re, &content).iter().enumerate() {
        let end = (cur_start + length).min(condition_map.len());
        if condition_map[cur_start..end]
            .iter()
            .any(|&b| b != COND_CLEAN)
        {
            changed_lines.insert(index);
        }
        cur_start += length;
    }

    (content, changed_lines)
}

/// Fetch the rules for `command` from the store at `db_path` and apply them
/// to one chunk. A missing or incompatible store passes the chunk through.
pub fn process_chunk(
    db_path: &Path,
    content: &[u8],
    command: Option<&str>,
    is_stderr: bool,
) -> Vec<u8> {
    if content.is_empty() {
        return Vec::new();
    }
    let rules = match store::fetch_substrules(db_path, command) {
        Ok(rules) => rules,
        Err(StoreError::NotFound | StoreError::VersionMismatch) => Vec::new(),
        Err(e) => {
            tracing::debug!(error = %e, "rule fetch failed, passing chunk through");
            Vec::new()
        }
    };
    match_content(content, &rules, command, is_stderr).0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_rule(pattern: &str, replacement: &str) -> Rule {
        Rule {
            match_pattern: pattern.to_string(),
            match_is_multiline: false,
            substitute_pattern: replacement.to_string(),
            is_regex: false,
            effective_locale: None,
            effective_command: None,
            command_match_strictness: 0,
            command_is_regex: false,
            foreground_only: false,
            end_match_here: false,
            stdout_stderr_only: 0,
            unique_id: uuid::Uuid::new_v4().to_string(),
            file_id: "file-1".to_string(),
        }
    }

    #[test]
    fn literal_substitution() {
        let rules = vec![literal_rule("foo", "bar")];
        let (out, changed) = match_content(b"foo\n", &rules, None, false);
        assert_eq!(out, b"bar\n");
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn no_match_passes_through_verbatim() {
        let rules = vec![literal_rule("absent", "x")];
        let chunk = b"some output\r\nwith lines\n";
        let (out, changed) = match_content(chunk, &rules, None, false);
        assert_eq!(out, chunk);
        assert!(changed.is_empty());
    }

    #[test]
    fn multiline_rule_spans_line_boundaries() {
        let mut rule = literal_rule(r"A\nB", "SUB");
        rule.match_is_multiline = true;
        rule.is_regex = true;
        rule.substitute_pattern = "SUB".to_string();
        let (out, _) = match_content(b"X\nA\nB\nY\n", &[rule], None, false);
        assert_eq!(out, b"X\nSUB\nY\n");
    }

    #[test]
    fn single_line_rule_cannot_cross_lines() {
        let mut rule = literal_rule("A.B", "SUB");
        rule.is_regex = true;
        rule.match_pattern = "A.B".to_string();
        let (out, _) = match_content(b"A\nB\n", &[rule], None, false);
        assert_eq!(out, b"A\nB\n");
    }

    #[test]
    fn regex_rule_expands_groups() {
        let mut rule = literal_rule(r"error: (\w+)", "");
        rule.is_regex = true;
        rule.substitute_pattern = r"problem: \g<1>!".to_string();
        let (out, _) = match_content(b"error: disk\n", &[rule], None, false);
        assert_eq!(out, b"problem: disk!\n");
    }

    #[test]
    fn all_occurrences_in_a_chunk_are_replaced() {
        let rules = vec![literal_rule("a", "bb")];
        let (out, changed) = match_content(b"a a\na\n", &rules, None, false);
        assert_eq!(out, b"bb bb\nbb\n");
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn end_match_here_poisons_the_whole_line() {
        let mut first = literal_rule("mid", "MID");
        first.end_match_here = true;
        // Later rule matching before and after the protected span.
        let second = literal_rule("x", "y");
        let (out, _) = match_content(b"x mid x\nx\n", &[first, second], None, false);
        // The first line is fully protected, including the leading x; the
        // second line still rewrites.
        assert_eq!(out, b"x MID x\ny\n");
    }

    #[test]
    fn plain_match_does_not_block_later_rules() {
        let first = literal_rule("mid", "MID");
        let second = literal_rule("x", "y");
        let (out, _) = match_content(b"x mid x\n", &[first, second], None, false);
        assert_eq!(out, b"y MID y\n");
    }

    #[test]
    fn stdout_stderr_gate() {
        let mut rule = literal_rule("foo", "bar");
        rule.stdout_stderr_only = 2;
        let (out, _) = match_content(b"foo\n", &[rule.clone()], None, false);
        assert_eq!(out, b"foo\n");
        let (out, _) = match_content(b"foo\n", &[rule], None, true);
        assert_eq!(out, b"bar\n");
    }

    #[test]
    fn command_filter_gate() {
        let mut rule = literal_rule("foo", "bar");
        rule.effective_command = Some("git".to_string());
        rule.command_match_strictness = matcher::STRICTNESS_CONTAINS;
        let (out, _) = match_content(b"foo\n", &[rule.clone()], Some("ls -l"), false);
        assert_eq!(out, b"foo\n");
        let (out, _) = match_content(b"foo\n", &[rule], Some("git status"), false);
        assert_eq!(out, b"bar\n");
    }

    #[test]
    fn rule_ids_apply_once_per_chunk() {
        let mut translated = literal_rule("hello", "bonjour");
        let mut fallback = literal_rule("hello", "hi");
        fallback.unique_id = translated.unique_id.clone();
        translated.file_id = "f".to_string();
        fallback.file_id = "f".to_string();
        let (out, _) = match_content(b"hello hello\n", &[translated, fallback], None, false);
        // The second row shares the entry id and is skipped once the first
        // one matched.
        assert_eq!(out, b"bonjour bonjour\n");
    }

    #[test]
    fn condition_map_resets_across_source_files() {
        let mut first = literal_rule("keep", "KEPT");
        first.end_match_here = true;
        first.file_id = "file-a".to_string();
        let mut second = literal_rule("KEPT", "CHANGED");
        second.file_id = "file-b".to_string();
        let (out, _) = match_content(b"keep\n", &[first, second], None, false);
        // Protection only holds within one source file's rules.
        assert_eq!(out, b"CHANGED\n");
    }

    #[test]
    fn applying_twice_is_idempotent_for_disjoint_rules() {
        let rules = vec![literal_rule("alpha", "beta")];
        let (once, _) = match_content(b"alpha gamma\n", &rules, None, false);
        let (twice, _) = match_content(&once, &rules, None, false);
        assert_eq!(once, twice);
    }

    #[test]
    fn zero_length_matches_terminate() {
        let mut rule = literal_rule("x*", "");
        rule.is_regex = true;
        rule.substitute_pattern = "-".to_string();
        let (out, _) = match_content(b"ab\n", &[rule], None, false);
        // One zero-length match per position, each replaced exactly once.
        assert_eq!(out, b"-a-b-\n-");
    }

    #[test]
    fn carriage_return_lines_are_separate_ranges() {
        let rules = vec![literal_rule("^foo", "bar")];
        let mut rule = rules[0].clone();
        rule.is_regex = true;
        let (out, _) = match_content(b"x\rfoo\r", &[rule], None, false);
        assert_eq!(out, b"x\rbar\r");
    }

    #[test]
    fn missing_store_passes_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = process_chunk(&dir.path().join("none.db"), b"text\n", None, false);
        assert_eq!(out, b"text\n");
    }
}
