//! Engine-wide constants: version information, on-disk layout names, the
//! canonical newline alternatives, and data-root resolution.

use std::env;
use std::path::PathBuf;

/// Engine major version checked by `!require_version`.
pub const VERSION_MAJOR: u32 = 2;
/// Engine minor version checked by `!require_version`.
pub const VERSION_MINOR: u32 = 1;
/// Beta number of this build; `None` means a stable release.
pub const BETA_RELEASE: Option<u32> = None;
/// Patch release of this build; `None` means a development build.
pub const RELEASE: Option<u32> = Some(0);
/// Human-readable engine version string.
pub const ENGINE_VERSION: &str = "2.1";

/// Directory holding theme metadata, one subdirectory per profile.
pub const INFO_PATHNAME: &str = "theme-info";
/// Directory holding entry files.
pub const DATA_PATHNAME: &str = "theme-data";
/// Directory holding installed man pages.
pub const MANPAGE_PATHNAME: &str = "manpages";
/// File naming the active profile inside the info directory.
pub const INDEX_FILENAME: &str = "current_theme_index";

/// Substitution-rule database file name.
pub const DB_FILENAME: &str = "subst-data.db";
/// Substitution-rule table name.
pub const DB_TABLE: &str = "clitheme_subst_data";
/// Schema version; bumped on any change to the rule row layout. A store
/// carrying a different version is treated as absent and rebuilt.
pub const DB_VERSION: i64 = 8;

/// Info file name for a scalar header field, e.g. `clithemeinfo_name`.
pub fn info_filename(field: &str) -> String {
    format!("clithemeinfo_{field}")
}

/// Info file name for a list header field, e.g. `clithemeinfo_locales_v2`.
pub fn info_v2_filename(field: &str) -> String {
    format!("clithemeinfo_{field}_v2")
}

/// Newline byte sequences recognized as line terminators.
///
/// Order matters: `\r\n` must be tried before `\r` and `\n`.
pub const NEWLINES: [&str; 8] = ["\r\n", "\r", "\n", "\x0b", "\x0c", "\x1c", "\x1d", "\x1e"];

/// A regex alternation matching any single newline sequence, with each
/// byte spelled as a textual escape so the pattern stays printable.
pub fn newline_alternation() -> String {
    let mut alt = String::new();
    for (i, nl) in NEWLINES.iter().enumerate() {
        if i > 0 {
            alt.push('|');
        }
        for ch in nl.chars() {
            match ch {
                '\r' => alt.push_str("\\r"),
                '\n' => alt.push_str("\\n"),
                '\x0b' => alt.push_str("\\x0B"),
                '\x0c' => alt.push_str("\\x0C"),
                '\x1c' => alt.push_str("\\x1C"),
                '\x1d' => alt.push_str("\\x1D"),
                '\x1e' => alt.push_str("\\x1E"),
                other => alt.push(other),
            }
        }
    }
    alt
}

/// Pattern splitting a chunk into lines, each including its terminator.
pub fn line_match_pattern() -> String {
    format!(".*?(?:{}|$)", newline_alternation())
}

/// Root of the persistent data tree: `$XDG_DATA_HOME/clitheme` or
/// `$HOME/.local/share/clitheme`.
pub fn root_data_path() -> Option<PathBuf> {
    if let Ok(xdg) = env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join("clitheme"));
        }
    }
    match env::var("HOME") {
        Ok(home) if home.starts_with('/') => {
            Some(PathBuf::from(home).join(".local/share/clitheme"))
        }
        _ => None,
    }
}

/// Default substitution-rule database location.
pub fn default_db_path() -> Option<PathBuf> {
    root_data_path().map(|p| p.join(DB_FILENAME))
}
