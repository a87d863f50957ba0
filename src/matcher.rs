//! Command-line matching for rule command filters.
//!
//! A rule's command filter and the live command line are compared token by
//! token. The live command's first token is accepted in three spellings:
//! as written, its basename, and the basename with a common script or
//! executable extension removed. Past the first token, the configured
//! strictness decides how the remaining tokens must relate.

use std::path::Path;

/// Strictness values persisted on rules.
pub const STRICTNESS_SMART: i64 = -1;
pub const STRICTNESS_CONTAINS: i64 = 0;
pub const STRICTNESS_PREFIX: i64 = 1;
pub const STRICTNESS_EXACT: i64 = 2;

const STRIPPED_EXTENSIONS: [&str; 5] = [".exe", ".com", ".ps1", ".bat", ".sh"];

/// Accepted spellings of the live command's first token.
fn first_token_forms(token: &str) -> Vec<String> {
    let mut forms = vec![token.to_string()];
    let basename = Path::new(token)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(token)
        .to_string();
    let no_ext = STRIPPED_EXTENSIONS
        .iter()
        .find_map(|ext| basename.strip_suffix(ext))
        .unwrap_or(&basename)
        .to_string();
    forms.push(basename);
    forms.push(no_ext);
    forms
}

/// Expand `-abc` short-flag clusters into `-a -b -c`; the first token is
/// never expanded.
fn expand_flag_clusters(tokens: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        let cluster = token
            .strip_prefix('-')
            .filter(|rest| !rest.is_empty() && !rest.contains('-'));
        match cluster {
            Some(rest) if i > 0 => {
                for ch in rest.chars() {
                    out.push(format!("-{ch}"));
                }
            }
            _ => out.push((*token).to_string()),
        }
    }
    out
}

/// Does `target_command` satisfy the filter `match_cmd` at `strictness`?
pub fn check_command(
    match_cmd: &str,
    strictness: i64,
    target_command: &str,
    is_regex_mode: bool,
) -> bool {
    let target_parts: Vec<&str> = target_command.split_whitespace().collect();
    let Some(&first) = target_parts.first() else {
        return false;
    };
    let first_forms = first_token_forms(first);

    if is_regex_mode {
        let Ok(re) = regex::Regex::new(&format!("^{match_cmd}")) else {
            return false;
        };
        return first_forms.iter().any(|form| {
            let mut candidate = form.clone();
            for part in &target_parts[1..] {
                candidate.push(' ');
                candidate.push_str(part);
            }
            re.is_match(&candidate)
        });
    }

    let match_parts: Vec<&str> = match_cmd.split_whitespace().collect();
    let Some(&match_first) = match_parts.first() else {
        return false;
    };
    if !first_forms.iter().any(|f| f == match_first) {
        return false;
    }

    match strictness {
        STRICTNESS_PREFIX => {
            if match_parts.len() > target_parts.len() {
                return false;
            }
            match_parts[1..]
                .iter()
                .zip(&target_parts[1..])
                .all(|(m, t)| m == t)
        }
        STRICTNESS_EXACT => {
            match_parts.len() == target_parts.len()
                && match_parts[1..]
                    .iter()
                    .zip(&target_parts[1..])
                    .all(|(m, t)| m == t)
        }
        STRICTNESS_SMART => {
            let match_expanded = expand_flag_clusters(&match_parts);
            let target_expanded = expand_flag_clusters(&target_parts);
            match_expanded[1..]
                .iter()
                .all(|m| target_expanded[1..].contains(m))
        }
        _ => match_parts[1..]
            .iter()
            .all(|m| target_parts[1..].contains(m)),
    }
}
