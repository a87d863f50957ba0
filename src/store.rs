//! Persistent substitution-rule store.
//!
//! A single-file SQLite database holding one table of rule rows plus a
//! singleton version row. The version acts as a fence: a store written by
//! a different schema generation is treated as absent and rebuilt by the
//! next compile.
//!
//! Inserts deduplicate on (`match_pattern`, `effective_command`,
//! `command_is_regex`, `effective_locale`, `stdout_stderr_only`,
//! `is_regex`): a new row with the same key replaces the old one with a
//! warning, which makes re-compiling a theme idempotent.

use std::path::Path;

use rusqlite::{Connection, ToSql};
use thiserror::Error;
use tracing::debug;

use crate::defs::{DB_TABLE, DB_VERSION};
use crate::engine;
use crate::locale;
use crate::matcher;

/// One substitution rule row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub match_pattern: String,
    pub match_is_multiline: bool,
    pub substitute_pattern: String,
    pub is_regex: bool,
    pub effective_locale: Option<String>,
    pub effective_command: Option<String>,
    pub command_match_strictness: i64,
    pub command_is_regex: bool,
    pub foreground_only: bool,
    pub end_match_here: bool,
    pub stdout_stderr_only: i64,
    pub unique_id: String,
    pub file_id: String,
}

/// A rule to insert, before command normalization fans it out per filter.
pub struct NewRule<'a> {
    pub match_pattern: &'a str,
    pub substitute_pattern: &'a str,
    pub effective_commands: Option<&'a [String]>,
    pub command_match_strictness: i64,
    pub command_is_regex: bool,
    pub effective_locale: Option<&'a str>,
    pub is_regex: bool,
    pub match_is_multiline: bool,
    pub end_match_here: bool,
    pub stdout_stderr_only: i64,
    pub foreground_only: bool,
    pub unique_id: &'a str,
    pub file_id: &'a str,
    pub line_number_debug: &'a str,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no theme set or theme does not contain substrules")]
    NotFound,
    #[error("substrules database version mismatch")]
    VersionMismatch,
    #[error("{0}")]
    BadPattern(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

const COLUMNS: &str = "match_pattern, match_is_multiline, substitute_pattern, is_regex, \
     effective_locale, effective_command, command_match_strictness, command_is_regex, \
     foreground_only, end_match_here, stdout_stderr_only, unique_id, file_id";

/// Open handle on the rule store. Dropping it closes the database.
pub struct RuleStore {
    conn: Connection,
}

impl RuleStore {
    /// Create a fresh store at `path` with the current schema version.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "CREATE TABLE {DB_TABLE} (
                match_pattern TEXT NOT NULL,
                match_is_multiline INTEGER NOT NULL,
                substitute_pattern TEXT NOT NULL,
                is_regex INTEGER NOT NULL,
                effective_locale TEXT,
                effective_command TEXT,
                command_match_strictness INTEGER NOT NULL,
                command_is_regex INTEGER NOT NULL,
                foreground_only INTEGER NOT NULL,
                end_match_here INTEGER NOT NULL,
                stdout_stderr_only INTEGER NOT NULL,
                unique_id TEXT NOT NULL,
                file_id TEXT NOT NULL
            );
            CREATE TABLE {DB_TABLE}_version (value INTEGER NOT NULL);"
        ))?;
        conn.execute(
            &format!("INSERT INTO {DB_TABLE}_version (value) VALUES (?1)"),
            [DB_VERSION],
        )?;
        debug!(path = %path.display(), "created rule store");
        Ok(Self { conn })
    }

    /// Open an existing store, enforcing the version fence.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::NotFound);
        }
        let conn = Connection::open(path)?;
        let version: Result<i64, rusqlite::Error> = conn.query_row(
            &format!("SELECT value FROM {DB_TABLE}_version"),
            [],
            |row| row.get(0),
        );
        match version {
            Ok(v) if v == DB_VERSION => Ok(Self { conn }),
            _ => Err(StoreError::VersionMismatch),
        }
    }

    /// Open `path` if it holds a current-version store, else create one.
    /// `Err(VersionMismatch)` is returned for an incompatible existing file.
    pub fn open_or_create(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Insert one rule, fanned out over its effective commands.
    ///
    /// The match pattern must compile; for regex rules the replacement
    /// template is validated up front. A row with an identical
    /// deduplication key is replaced, reported through `warn`.
    pub fn add_subst_entry(
        &self,
        rule: &NewRule<'_>,
        mut warn: impl FnMut(String),
    ) -> Result<(), StoreError> {
        if let Err(e) = engine::validate_pattern(rule.match_pattern) {
            return Err(StoreError::BadPattern(e.to_string()));
        }
        if rule.is_regex {
            if let Err(e) = engine::validate_template(rule.substitute_pattern) {
                return Err(StoreError::BadPattern(e.to_string()));
            }
        }

        let commands: Vec<Option<String>> = match rule.effective_commands {
            Some(cmds) if !cmds.is_empty() => {
                cmds.iter().map(|c| Some(normalize_command(c))).collect()
            }
            _ => vec![None],
        };

        for command in &commands {
            let mut conditions = vec!["match_pattern=?".to_string()];
            let mut key_params: Vec<&dyn ToSql> = vec![&rule.match_pattern];
            match command {
                Some(cmd) => {
                    conditions.push("effective_command=?".to_string());
                    key_params.push(cmd);
                }
                None => conditions.push("effective_command IS NULL".to_string()),
            }
            conditions.push("command_is_regex=?".to_string());
            key_params.push(&rule.command_is_regex);
            match &rule.effective_locale {
                Some(loc) => {
                    conditions.push("effective_locale=?".to_string());
                    key_params.push(loc);
                }
                None => conditions.push("effective_locale IS NULL".to_string()),
            }
            conditions.push("stdout_stderr_only=?".to_string());
            key_params.push(&rule.stdout_stderr_only);
            conditions.push("is_regex=?".to_string());
            key_params.push(&rule.is_regex);
            let key_condition = conditions.join(" AND ");

            let existing: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {DB_TABLE} WHERE {key_condition}"),
                key_params.as_slice(),
                |row| row.get(0),
            )?;
            if existing > 0 {
                warn(format!(
                    "Line {}: Repeated substrules entry, overwriting",
                    rule.line_number_debug
                ));
                self.conn.execute(
                    &format!("DELETE FROM {DB_TABLE} WHERE {key_condition}"),
                    key_params.as_slice(),
                )?;
            }

            self.conn.execute(
                &format!(
                    "INSERT INTO {DB_TABLE} ({COLUMNS}) \
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"
                ),
                rusqlite::params![
                    rule.match_pattern,
                    rule.match_is_multiline,
                    rule.substitute_pattern,
                    rule.is_regex,
                    rule.effective_locale,
                    command,
                    rule.command_match_strictness,
                    rule.command_is_regex,
                    rule.foreground_only,
                    rule.end_match_here,
                    rule.stdout_stderr_only,
                    rule.unique_id,
                    rule.file_id,
                ],
            )?;
        }
        Ok(())
    }

    fn distinct_entry_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT DISTINCT unique_id FROM {DB_TABLE}"))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn rows_for(&self, unique_id: &str, loc: Option<&str>) -> Result<Vec<Rule>, StoreError> {
        let sql = match loc {
            Some(_) => format!(
                "SELECT {COLUMNS} FROM {DB_TABLE} WHERE unique_id=?1 AND effective_locale=?2"
            ),
            None => format!(
                "SELECT {COLUMNS} FROM {DB_TABLE} WHERE unique_id=?1 AND effective_locale IS NULL"
            ),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(Rule {
                match_pattern: row.get(0)?,
                match_is_multiline: row.get(1)?,
                substitute_pattern: row.get(2)?,
                is_regex: row.get(3)?,
                effective_locale: row.get(4)?,
                effective_command: row.get(5)?,
                command_match_strictness: row.get(6)?,
                command_is_regex: row.get(7)?,
                foreground_only: row.get(8)?,
                end_match_here: row.get(9)?,
                stdout_stderr_only: row.get(10)?,
                unique_id: row.get(11)?,
                file_id: row.get(12)?,
            })
        };
        let rows = match loc {
            Some(l) => stmt
                .query_map(rusqlite::params![unique_id, l], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([unique_id], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    /// Rules applicable to `command`, with per-entry locale fallback.
    ///
    /// For each distinct entry id, the locale candidates are tried in
    /// order and the default (no locale) last; the first candidate with
    /// any rows wins. Surviving rows are filtered through the command
    /// matcher when both sides carry a command.
    pub fn matching_rules(
        &self,
        command: Option<&str>,
        locales: &[String],
    ) -> Result<Vec<Rule>, StoreError> {
        let mut result = Vec::new();
        for id in self.distinct_entry_ids()? {
            let mut candidates: Vec<Option<&str>> =
                locales.iter().map(|l| Some(l.as_str())).collect();
            candidates.push(None);
            for loc in candidates {
                let rows = self.rows_for(&id, loc)?;
                if rows.is_empty() {
                    continue;
                }
                for rule in rows {
                    if let (Some(cmd), Some(filter)) = (command, rule.effective_command.as_deref())
                    {
                        if !matcher::check_command(
                            filter,
                            rule.command_match_strictness,
                            cmd,
                            rule.command_is_regex,
                        ) {
                            continue;
                        }
                    }
                    result.push(rule);
                }
                break;
            }
        }
        Ok(result)
    }
}

/// Collapse internal runs of two or more spaces and strip the ends.
fn normalize_command(cmd: &str) -> String {
    let mut out = String::with_capacity(cmd.len());
    let mut spaces = 0usize;
    for ch in cmd.chars() {
        if ch == ' ' {
            spaces += 1;
        } else {
            if spaces > 0 {
                out.push(' ');
                spaces = 0;
            }
            out.push(ch);
        }
    }
    out.trim().to_string()
}

/// Fetch the applicable rules from the store at `path`.
///
/// A missing store or a version mismatch both resolve to "no rules".
pub fn fetch_substrules(path: &Path, command: Option<&str>) -> Result<Vec<Rule>, StoreError> {
    fetch_substrules_with(path, command, &locale::locale_candidates())
}

/// As [`fetch_substrules`], with an explicit locale candidate list.
pub fn fetch_substrules_with(
    path: &Path,
    command: Option<&str>,
    locales: &[String],
) -> Result<Vec<Rule>, StoreError> {
    let store = match RuleStore::open(path) {
        Ok(store) => store,
        Err(StoreError::NotFound | StoreError::VersionMismatch) => return Ok(Vec::new()),
        Err(other) => return Err(other),
    };
    store.matching_rules(command, locales)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_rule<'a>(pattern: &'a str, replacement: &'a str, id: &'a str) -> NewRule<'a> {
        NewRule {
            match_pattern: pattern,
            substitute_pattern: replacement,
            effective_commands: None,
            command_match_strictness: 0,
            command_is_regex: false,
            effective_locale: None,
            is_regex: false,
            match_is_multiline: false,
            end_match_here: false,
            stdout_stderr_only: 0,
            foreground_only: false,
            unique_id: id,
            file_id: "file-1",
            line_number_debug: "1>2[default]",
        }
    }

    #[test]
    fn insert_and_fetch_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subst-data.db");
        let store = RuleStore::create(&path).unwrap();
        store.add_subst_entry(&new_rule("foo", "bar", "id-1"), |_| {}).unwrap();
        drop(store);

        let rules = fetch_substrules_with(&path, None, &[]).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].match_pattern, "foo");
        assert_eq!(rules[0].substitute_pattern, "bar");
        assert_eq!(rules[0].effective_locale, None);
    }

    #[test]
    fn duplicate_key_overwrites_and_warns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subst-data.db");
        let store = RuleStore::create(&path).unwrap();
        let mut warnings = Vec::new();
        store.add_subst_entry(&new_rule("foo", "bar", "id-1"), |_| {}).unwrap();
        store
            .add_subst_entry(&new_rule("foo", "baz", "id-2"), |w| warnings.push(w))
            .unwrap();
        drop(store);

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Repeated substrules entry"));
        let rules = fetch_substrules_with(&path, None, &[]).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].substitute_pattern, "baz");
    }

    #[test]
    fn locale_fallback_prefers_candidate_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subst-data.db");
        let store = RuleStore::create(&path).unwrap();
        let mut rule = new_rule("hello", "bonjour", "id-1");
        rule.effective_locale = Some("fr_FR");
        store.add_subst_entry(&rule, |_| {}).unwrap();
        let mut rule = new_rule("hello", "hallo", "id-1");
        rule.effective_locale = Some("de_DE");
        store.add_subst_entry(&rule, |_| {}).unwrap();
        let mut rule = new_rule("hello", "hi", "id-1");
        rule.effective_locale = None;
        store.add_subst_entry(&rule, |_| {}).unwrap();
        drop(store);

        let locales = vec!["de_DE".to_string(), "fr_FR".to_string()];
        let rules = fetch_substrules_with(&path, None, &locales).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].substitute_pattern, "hallo");

        // With no matching locale, the default row wins.
        let rules = fetch_substrules_with(&path, None, &["ja_JP".to_string()]).unwrap();
        assert_eq!(rules[0].substitute_pattern, "hi");
    }

    #[test]
    fn command_filter_applies_at_fetch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subst-data.db");
        let store = RuleStore::create(&path).unwrap();
        let commands = vec!["git  commit".to_string()];
        let mut rule = new_rule("foo", "bar", "id-1");
        rule.effective_commands = Some(&commands);
        rule.command_match_strictness = matcher::STRICTNESS_PREFIX;
        store.add_subst_entry(&rule, |_| {}).unwrap();
        drop(store);

        let rules = fetch_substrules_with(&path, Some("git commit -m x"), &[]).unwrap();
        assert_eq!(rules.len(), 1);
        // Double spaces were collapsed on insert.
        assert_eq!(rules[0].effective_command.as_deref(), Some("git commit"));
        let rules = fetch_substrules_with(&path, Some("git push"), &[]).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn version_fence_hides_foreign_stores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subst-data.db");
        let store = RuleStore::create(&path).unwrap();
        store.add_subst_entry(&new_rule("foo", "bar", "id-1"), |_| {}).unwrap();
        drop(store);

        let conn = Connection::open(&path).unwrap();
        conn.execute(&format!("UPDATE {DB_TABLE}_version SET value=1"), [])
            .unwrap();
        drop(conn);

        assert!(matches!(
            RuleStore::open(&path),
            Err(StoreError::VersionMismatch)
        ));
        let rules = fetch_substrules_with(&path, None, &[]).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn bad_patterns_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subst-data.db");
        let store = RuleStore::create(&path).unwrap();
        let err = store.add_subst_entry(&new_rule("(unclosed", "x", "id-1"), |_| {});
        assert!(matches!(err, Err(StoreError::BadPattern(_))));

        let mut rule = new_rule("ok", r"\g<oops", "id-2");
        rule.is_regex = true;
        let err = store.add_subst_entry(&rule, |_| {});
        assert!(matches!(err, Err(StoreError::BadPattern(_))));
    }

    #[test]
    fn missing_store_yields_no_rules() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.db");
        let rules = fetch_substrules_with(&path, None, &[]).unwrap();
        assert!(rules.is_empty());
    }
}
