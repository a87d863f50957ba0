//! Entry block assembler, shared by the entries and substrules sections.
//!
//! A block collects names (or match patterns) first, then localized content
//! items; the cartesian product of the two is written out at the end of the
//! block. The closing line is parsed ahead of time because its options
//! (`endmatchhere`, stream scope, `nlmatchcurpos`) change how patterns are
//! assembled, then the cursor rewinds for the main pass.

use std::collections::HashSet;

use crate::datafiles::SyntaxAbort;
use crate::defs;
use crate::engine;
use crate::generator::{bracket_directive, gen_uuid, ContentMode, Generator, MergeScope};
use crate::options::{self, OptionsMap};
use crate::sanity;
use crate::store::NewRule;
use crate::strutil::{extract_content, make_printable, regex_escape};

/// Command-filter state a substrules block inherits from its section.
#[derive(Debug, Clone, Default)]
pub struct SubstrulesScope {
    pub effective_commands: Option<Vec<String>>,
    pub command_is_regex: bool,
    pub is_regex: bool,
    pub strictness: i64,
}

struct EntryName {
    value: String,
    is_multiline: bool,
    id: String,
    line_number: String,
}

struct EntryItem {
    content: String,
    line_number: String,
    locale: Option<String>,
}

impl Generator {
    fn check_entry_name(&mut self, name: &str, is_substrules: bool) -> bool {
        if is_substrules {
            match engine::validate_pattern(name) {
                Ok(()) => true,
                Err(e) => {
                    let msg = format!(
                        "Line {}: Bad match pattern ({})",
                        self.linenum(),
                        make_printable(&e.to_string())
                    );
                    self.error(msg);
                    false
                }
            }
        } else {
            match sanity::check(name) {
                Ok(()) => true,
                Err(reason) => {
                    let msg = format!(
                        "Line {}: Entry subsections/names {reason}",
                        self.linenum()
                    );
                    self.error(msg);
                    false
                }
            }
        }
    }

    /// Parse one `[entry]`-style or `[subst_*]`-style block.
    ///
    /// `start_phrase` is the block opener; single-line names repeat it (or
    /// use `<name>` in entries mode), the multi-line pattern form replaces
    /// its `]` with `>>`, and the block ends at `end_phrase`.
    pub fn handle_entry(
        &mut self,
        start_phrase: &str,
        end_phrase: &str,
        substrules: Option<&SubstrulesScope>,
    ) -> Result<(), SyntaxAbort> {
        let is_substrules = substrules.is_some();
        let opening_index = self.lineindex;
        let opening_linenum = self.linenum();
        let start_index = self.lineindex - 1;
        let start_multiline = start_phrase.replace(']', ">>");

        // Look-ahead pass: the closing line's options are needed while the
        // block body is read.
        let mut found_options: Option<OptionsMap> = None;
        let mut stdout_stderr: i64 = 0;
        while self.goto_next_line() {
            let phrases = self.current_phrases();
            if phrases.first().map(String::as_str) == Some(end_phrase) {
                let opt_words = phrases[1..].to_vec();
                let allowed: Option<Vec<&str>> =
                    is_substrules.then(|| options::SUBSTRULES_OPTIONS.to_vec());
                let map = self.parse_options(
                    &opt_words,
                    MergeScope::Section,
                    allowed.as_deref(),
                    None,
                );
                if options::is_true(&map, "subststdoutonly") {
                    stdout_stderr = 1;
                }
                if options::is_true(&map, "subststderronly") {
                    stdout_stderr = 2;
                }
                found_options = Some(map);
                break;
            }
        }
        let Some(got_options) = found_options else {
            let msg = format!("Line {opening_linenum}: Unterminated content block");
            return Err(self.syntax_error(msg));
        };

        self.lineindex = start_index;

        let mut names_done = false;
        let mut entry_names: Vec<EntryName> = Vec::new();
        let mut entry_items: Vec<EntryItem> = Vec::new();

        let add_items =
            |items: &mut Vec<EntryItem>, content: String, locales: &[String], line: String| {
                for locale in locales {
                    items.push(EntryItem {
                        content: content.clone(),
                        line_number: line.clone(),
                        locale: if locale == "default" {
                            None
                        } else {
                            Some(locale.clone())
                        },
                    });
                }
            };

        while self.goto_next_line() {
            let phrases = self.current_phrases();
            let line_content = self.current_line();
            let Some(first) = phrases.first().cloned() else {
                continue;
            };

            let is_name_line =
                first == start_phrase || (!is_substrules && first == "<name>");
            let is_multiline_start = is_substrules && first == start_multiline;
            if !is_name_line && !is_multiline_start {
                names_done = true;
            }

            if is_name_line && !names_done {
                if phrases.len() == 1 && self.lineindex == opening_index {
                    // Bare block opener; names follow on their own lines.
                    continue;
                }
                self.check_enough_args(&phrases, 2, "", !is_substrules)?;
                let raw = extract_content(&line_content, 1).unwrap_or_default();
                let mode = if is_substrules {
                    ContentMode::Content
                } else {
                    ContentMode::Name
                };
                let mut pattern = self.parse_content(&raw, mode, None, false);
                if let Some(scope) = substrules {
                    if !scope.is_regex {
                        pattern = regex_escape(&pattern);
                    }
                }
                if self.check_entry_name(&pattern, is_substrules) {
                    entry_names.push(EntryName {
                        value: pattern,
                        is_multiline: false,
                        id: gen_uuid(),
                        line_number: self.linenum().to_string(),
                    });
                }
            } else if is_multiline_start && !names_done {
                self.check_extra_args(&phrases, 1, "", true)?;
                let begin_line_number = self.linenum() + 1;
                let ml_end = start_phrase.replace('[', "<<");
                let mut pattern_lines =
                    self.block_input_lines(true, true, &ml_end, true, false)?;
                let scope_is_regex = substrules.map(|s| s.is_regex).unwrap_or(false);
                if !scope_is_regex {
                    for line in &mut pattern_lines {
                        *line = regex_escape(line);
                    }
                }
                if self.check_entry_name(&pattern_lines.join("\n"), is_substrules) {
                    let mut alternatives = defs::newline_alternation();
                    if options::is_true(&got_options, "nlmatchcurpos") {
                        // Also accept a cursor-position escape between lines.
                        alternatives.push_str(r"|\x1b\[\d+;\d+H");
                    }
                    let separator = format!("(?:{alternatives})");
                    entry_names.push(EntryName {
                        value: pattern_lines.join(&separator),
                        is_multiline: true,
                        id: gen_uuid(),
                        line_number: Generator::linenumber_range(
                            begin_line_number,
                            self.linenum() - 1,
                        ),
                    });
                }
            } else if first.starts_with("locale[") {
                let stripped = line_content.trim().to_string();
                match bracket_directive(&stripped, "locale[") {
                    Some((matched, body))
                        if body.split_whitespace().next().is_some() =>
                    {
                        let matched = matched.to_string();
                        let body = body.trim().to_string();
                        let argc = matched.split_whitespace().count();
                        self.check_enough_args(&phrases, argc + 1, &matched, false)?;
                        let locales: Vec<String> = {
                            let parsed =
                                self.parse_content(&body, ContentMode::Plain, None, false);
                            parsed.split_whitespace().map(String::from).collect()
                        };
                        if locales.is_empty() {
                            let msg = format!(
                                "Line {}: Not enough arguments for \"<name> @ locale[<name>]:\"",
                                self.linenum()
                            );
                            self.error(msg);
                        }
                        let raw = extract_content(&line_content, argc).unwrap_or_default();
                        let content = self.parse_content(&raw, ContentMode::Content, None, false);
                        add_items(
                            &mut entry_items,
                            content,
                            &locales,
                            self.linenum().to_string(),
                        );
                    }
                    _ => {
                        let msg =
                            format!("Line {}: Invalid format for \"locale\"", self.linenum());
                        self.error(msg);
                    }
                }
            } else if first == "default:" {
                self.check_enough_args(&phrases, 2, "", false)?;
                let raw = extract_content(&line_content, 1).unwrap_or_default();
                let content = self.parse_content(&raw, ContentMode::Content, None, false);
                add_items(
                    &mut entry_items,
                    content,
                    &["default".to_string()],
                    self.linenum().to_string(),
                );
            } else if first == "locale" || first.starts_with("locale:") {
                if let Some(locale_name) = first.strip_prefix("locale:") {
                    self.check_enough_args(&phrases, 2, "", false)?;
                    let locale_name = locale_name.to_string();
                    let raw = extract_content(&line_content, 1).unwrap_or_default();
                    let locales: Vec<String> = {
                        let parsed =
                            self.parse_content(&locale_name, ContentMode::Plain, None, false);
                        parsed.split_whitespace().map(String::from).collect()
                    };
                    if locales.is_empty() {
                        let msg = format!(
                            "Line {}: Not enough arguments for \"<name> @ locale:<name>\"",
                            self.linenum()
                        );
                        self.error(msg);
                    }
                    let content = self.parse_content(&raw, ContentMode::Content, None, false);
                    add_items(
                        &mut entry_items,
                        content,
                        &locales,
                        self.linenum().to_string(),
                    );
                } else {
                    self.check_enough_args(&phrases, 3, "", false)?;
                    let raw = extract_content(&line_content, 2).unwrap_or_default();
                    let locales: Vec<String> = {
                        let parsed =
                            self.parse_content(&phrases[1], ContentMode::Plain, None, false);
                        parsed.split_whitespace().map(String::from).collect()
                    };
                    if locales.is_empty() {
                        let msg = format!(
                            "Line {}: Not enough arguments for \"<name> @ locale:<name>\"",
                            self.linenum()
                        );
                        self.error(msg);
                    }
                    let content = self.parse_content(&raw, ContentMode::Content, None, false);
                    add_items(
                        &mut entry_items,
                        content,
                        &locales,
                        self.linenum().to_string(),
                    );
                }
            } else if first == "[locale]" || first == "locale_block" {
                self.check_enough_args(&phrases, 2, "", true)?;
                let joined = phrases[1..].join(" ");
                let locales: Vec<String> = {
                    let parsed = self.parse_content(&joined, ContentMode::Name, None, false);
                    parsed.split_whitespace().map(String::from).collect()
                };
                let begin_line_number = self.linenum() + 1;
                let block_end = if first == "[locale]" { "[/locale]" } else { "end_block" };
                let separator = if is_substrules { "\r\n" } else { "\n" };
                let content = self.block_input(true, true, block_end, separator, true, false)?;
                add_items(
                    &mut entry_items,
                    content,
                    &locales,
                    Generator::linenumber_range(begin_line_number, self.linenum() - 1),
                );
            } else if first == "[default]" {
                self.check_extra_args(&phrases, 1, "", true)?;
                let begin_line_number = self.linenum() + 1;
                let separator = if is_substrules { "\r\n" } else { "\n" };
                let content = self.block_input(true, true, "[/default]", separator, true, false)?;
                add_items(
                    &mut entry_items,
                    content,
                    &["default".to_string()],
                    Generator::linenumber_range(begin_line_number, self.linenum() - 1),
                );
            } else if first == end_phrase {
                break;
            } else {
                return Err(self.invalid_phrase(&first));
            }
        }

        // Write out names x items.
        let file_id = self.file_id.clone();
        for name in &entry_names {
            let mut reported_items: HashSet<String> = HashSet::new();
            for item in &entry_items {
                let locale_debug = item
                    .locale
                    .as_deref()
                    .map(make_printable)
                    .unwrap_or_else(|| "default".to_string());
                let debug = format!("{}>{}[{locale_debug}]", name.line_number, item.line_number);

                if let Some(scope) = substrules {
                    let mut warn_buf: Vec<String> = Vec::new();
                    let outcome = match self.store.as_ref() {
                        Some(store) => store.add_subst_entry(
                            &NewRule {
                                match_pattern: &name.value,
                                substitute_pattern: &item.content,
                                effective_commands: scope.effective_commands.as_deref(),
                                command_match_strictness: scope.strictness,
                                command_is_regex: scope.command_is_regex,
                                effective_locale: item.locale.as_deref(),
                                is_regex: scope.is_regex,
                                match_is_multiline: name.is_multiline,
                                end_match_here: options::is_true(&got_options, "endmatchhere"),
                                stdout_stderr_only: stdout_stderr,
                                foreground_only: options::is_true(&got_options, "foregroundonly"),
                                unique_id: &name.id,
                                file_id: &file_id,
                                line_number_debug: &debug,
                            },
                            |w| warn_buf.push(w),
                        ),
                        None => Ok(()),
                    };
                    for w in warn_buf {
                        self.warning(w);
                    }
                    if let Err(e) = outcome {
                        match e {
                            crate::store::StoreError::BadPattern(msg) => {
                                if !reported_items.contains(&item.line_number) {
                                    let err = format!(
                                        "Line {}>{}: Bad substitute pattern ({})",
                                        name.line_number,
                                        item.line_number,
                                        make_printable(&msg)
                                    );
                                    self.error(err);
                                    reported_items.insert(item.line_number.clone());
                                }
                            }
                            other => {
                                let err = format!("Line {debug}: {other}");
                                self.error(err);
                            }
                        }
                    }
                } else {
                    let mut target = name
                        .value
                        .split_whitespace()
                        .collect::<Vec<&str>>()
                        .join(" ");
                    if let Some(locale) = &item.locale {
                        target = format!("{target}__{locale}");
                    }
                    if !self.in_subsection.is_empty() {
                        target = format!("{} {target}", self.in_subsection);
                    }
                    if !self.in_domainapp.is_empty() {
                        target = format!("{} {target}", self.in_domainapp);
                    }
                    let datapath = self.files.datapath.clone();
                    self.files
                        .add_entry(&datapath, &target, &item.content, &debug);
                }
            }
        }
        Ok(())
    }
}
