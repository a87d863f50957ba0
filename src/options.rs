//! Option tables and the typed option map used by the theme parser.
//!
//! Options stack across three scopes (file, section, inline); the tables
//! here only describe which names exist and how each one parses.

use std::collections::BTreeMap;

/// Parsed value of a single option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Count(i64),
}

/// One option scope. Scopes are merged by copying, never by mutating an
/// outer scope through a lookup.
pub type OptionsMap = BTreeMap<String, OptionValue>;

/// Options taking an integer value (`name:N`).
pub const LEAD_INDENT_OPTIONS: [&str; 2] = ["leadtabindents", "leadspaces"];

/// Content-substitution switches usable on name lines.
pub const CONTENT_SUBST_OPTIONS: [&str; 2] = ["substvar", "linebounds"];

/// Character-substitution switches, only meaningful on full content.
pub const CHAR_SUBST_OPTIONS: [&str; 2] = ["substesc", "substchar"];

/// Options accepted next to a command filter.
pub const COMMAND_FILTER_OPTIONS: [&str; 5] = [
    "strictcmdmatch",
    "exactcmdmatch",
    "smartcmdmatch",
    "normalcmdmatch",
    "foregroundonly",
];

/// Options accepted on the closing line of a substitution-rule block.
pub const SUBSTRULES_OPTIONS: [&str; 6] = [
    "subststdoutonly",
    "subststderronly",
    "substallstreams",
    "endmatchhere",
    "foregroundonly",
    "nlmatchcurpos",
];

/// Characters that may not appear in a variable name.
pub const VARNAME_BANNED_CHARS: [char; 6] = ['{', '}', '[', ']', '(', ')'];

/// All substitution switches.
pub fn subst_options() -> Vec<&'static str> {
    let mut v = CONTENT_SUBST_OPTIONS.to_vec();
    v.extend_from_slice(&CHAR_SUBST_OPTIONS);
    v
}

/// Options accepted on the closing line of a content block.
pub fn block_input_options() -> Vec<&'static str> {
    let mut v = LEAD_INDENT_OPTIONS.to_vec();
    v.extend(subst_options());
    v
}

/// Boolean options, set by name and cleared by `no<name>`.
pub fn bool_options() -> Vec<&'static str> {
    let mut v = subst_options();
    v.extend_from_slice(&["endmatchhere", "foregroundonly", "nlmatchcurpos"]);
    v
}

/// Switch groups: at most one member of a group may be true at a time.
pub fn switch_groups() -> Vec<Vec<&'static str>> {
    vec![
        vec![
            "strictcmdmatch",
            "exactcmdmatch",
            "smartcmdmatch",
            "normalcmdmatch",
        ],
        vec!["subststdoutonly", "subststderronly", "substallstreams"],
    ]
}

/// True when `name` is set to a true flag in `map`.
pub fn is_true(map: &OptionsMap, name: &str) -> bool {
    matches!(map.get(name), Some(OptionValue::Flag(true)))
}

/// Integer value of `name` in `map`, if set as one.
pub fn get_int(map: &OptionsMap, name: &str) -> Option<i64> {
    match map.get(name) {
        Some(OptionValue::Count(v)) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_membership() {
        assert!(bool_options().contains(&"substvar"));
        assert!(bool_options().contains(&"nlmatchcurpos"));
        assert!(!bool_options().contains(&"leadspaces"));
        assert!(block_input_options().contains(&"leadtabindents"));
    }

    #[test]
    fn map_accessors() {
        let mut map = OptionsMap::new();
        map.insert("substvar".into(), OptionValue::Flag(true));
        map.insert("leadspaces".into(), OptionValue::Count(4));
        assert!(is_true(&map, "substvar"));
        assert!(!is_true(&map, "substesc"));
        assert_eq!(get_int(&map, "leadspaces"), Some(4));
        assert_eq!(get_int(&map, "substvar"), None);
    }
}
