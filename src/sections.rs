//! Top-level theme sections and the compile driver.
//!
//! A theme file holds four sections (`{header}`, `{entries}`,
//! `{substrules}`, `{manpages}`), dispatched here by their opening token.
//! End tokens are derived by rule: `{x}` closes with `{/x}` and the legacy
//! `begin_x` closes with `end_x`.

use std::fs;
use std::io;
use std::path::Path;

use regex::Regex;

use crate::datafiles::SyntaxAbort;
use crate::defs;
use crate::entry::SubstrulesScope;
use crate::generator::{ContentMode, Generator, MergeScope};
use crate::matcher;
use crate::options::{self, OptionValue};
use crate::sanity;
use crate::store::RuleStore;
use crate::strutil::{extract_content, make_printable};

fn info_dir(gen: &Generator) -> std::path::PathBuf {
    gen.files
        .path
        .join(defs::INFO_PATHNAME)
        .join(&gen.infofile_name)
}

pub fn handle_header_section(gen: &mut Generator, end_phrase: &str) -> Result<(), SyntaxAbort> {
    gen.begin_section("header");
    let mut name_specified = false;
    let scalar_re = Regex::new(r"^(name|version|description):?$").unwrap();
    let list_re = Regex::new(r"^(locales|supported_apps):?$").unwrap();

    while gen.goto_next_line() {
        let phrases = gen.current_phrases();
        let Some(first) = phrases.first().cloned() else {
            continue;
        };

        if let Some(caps) = scalar_re.captures(&first) {
            gen.check_enough_args(&phrases, 2, "", true)?;
            let entry = caps[1].to_string();
            let raw = extract_content(&gen.current_line(), 1).unwrap_or_default();
            let preserve = entry == "name" || entry == "description";
            let content = gen.parse_content(&raw, ContentMode::Name, Some(preserve), false);
            let dir = info_dir(gen);
            let linenum = gen.linenum();
            gen.files
                .write_infofile(&dir, &defs::info_filename(&entry), &content, linenum, &entry);
            if entry == "name" {
                name_specified = true;
            }
        } else if let Some(caps) = list_re.captures(&first) {
            gen.check_enough_args(&phrases, 2, "", true)?;
            let entry = caps[1].to_string();
            let joined = phrases[1..].join(" ");
            let parsed = gen.parse_content(&joined, ContentMode::Name, None, false);
            let parts: Vec<String> = parsed.split_whitespace().map(String::from).collect();
            let dir = info_dir(gen);
            let linenum = gen.linenum();
            gen.files.write_infofile_newlines(
                &dir,
                &defs::info_v2_filename(&entry),
                &parts,
                linenum,
                &entry,
            );
        } else if matches!(
            first.as_str(),
            "[locales]"
                | "[supported_apps]"
                | "[description]"
                | "locales_block"
                | "supported_apps_block"
                | "description_block"
        ) {
            gen.check_extra_args(&phrases, 1, "", true)?;
            let block_end = if first.ends_with("_block") {
                "end_block".to_string()
            } else {
                first.replacen('[', "[/", 1)
            };
            let is_description = first == "[description]" || first == "description_block";
            let content = gen.block_input(
                is_description,
                is_description,
                &block_end,
                "\n",
                true,
                true,
            )?;
            let base_name = first
                .trim_end_matches("_block")
                .replace(['[', ']'], "");
            let file_name = if is_description {
                defs::info_filename(&base_name)
            } else {
                defs::info_v2_filename(&base_name)
            };
            let debug_name = first.trim_end_matches("_block").to_string();
            let dir = info_dir(gen);
            let linenum = gen.linenum();
            gen.files
                .write_infofile(&dir, &file_name, &content, linenum, &debug_name);
        } else if gen.handle_setters(false)? {
            // consumed
        } else if first == end_phrase {
            gen.check_extra_args(&phrases, 1, "", true)?;
            if !name_specified {
                gen.error("header section missing required entries: name");
            }
            gen.end_section("header");
            return Ok(());
        } else {
            return Err(gen.invalid_phrase(&first));
        }
    }
    gen.unterminated_section("header");
    Ok(())
}

pub fn handle_entries_section(gen: &mut Generator, end_phrase: &str) -> Result<(), SyntaxAbort> {
    gen.begin_section("entries");
    gen.in_domainapp.clear();
    gen.in_subsection.clear();

    while gen.goto_next_line() {
        let phrases = gen.current_phrases();
        let Some(first) = phrases.first().cloned() else {
            continue;
        };

        match first.as_str() {
            "<in_domainapp>" | "in_domainapp" => {
                gen.check_enough_args(&phrases, 3, "", true)?;
                gen.check_extra_args(&phrases, 3, "", true)?;
                let raw = extract_content(&gen.current_line(), 1).unwrap_or_default();
                let parsed = gen.parse_content(&raw, ContentMode::Name, None, false);
                let parts: Vec<&str> = parsed.split_whitespace().collect();
                gen.in_domainapp = parts.join(" ");
                if let Err(reason) = sanity::check(&gen.in_domainapp) {
                    let msg = format!(
                        "Line {}: Domain and app names {reason}",
                        gen.linenum()
                    );
                    gen.error(msg);
                    gen.in_domainapp = sanity::sanitize(&gen.in_domainapp);
                }
                gen.in_subsection.clear();
            }
            "<in_subsection>" | "in_subsection" => {
                gen.check_enough_args(&phrases, 2, "", true)?;
                let raw = extract_content(&gen.current_line(), 1).unwrap_or_default();
                let parsed = gen.parse_content(&raw, ContentMode::Name, None, false);
                gen.in_subsection = parsed
                    .split_whitespace()
                    .collect::<Vec<&str>>()
                    .join(" ");
                if let Err(reason) = sanity::check(&gen.in_subsection) {
                    let msg = format!("Line {}: Subsection names {reason}", gen.linenum());
                    gen.error(msg);
                    gen.in_subsection = sanity::sanitize(&gen.in_subsection);
                }
            }
            "<unset_domainapp>" | "unset_domainapp" => {
                gen.check_extra_args(&phrases, 1, "", true)?;
                gen.in_domainapp.clear();
                gen.in_subsection.clear();
            }
            "<unset_subsection>" | "unset_subsection" => {
                gen.check_extra_args(&phrases, 1, "", true)?;
                gen.in_subsection.clear();
            }
            "[entry]" | "entry" => {
                let block_end = if first == "[entry]" { "[/entry]" } else { "end_entry" };
                gen.handle_entry(&first, block_end, None)?;
            }
            _ => {
                if gen.handle_setters(false)? {
                    // consumed
                } else if first == end_phrase {
                    gen.check_extra_args(&phrases, 1, "", true)?;
                    gen.end_section("entries");
                    if first == "end_main" {
                        let msg = format!(
                            "Line {}: Phrase \"end_main\" is deprecated in this version; \
                             please use \"{{/entries}}\" instead",
                            gen.linenum()
                        );
                        gen.warning(msg);
                    }
                    return Ok(());
                } else {
                    return Err(gen.invalid_phrase(&first));
                }
            }
        }
    }
    gen.unterminated_section("entries");
    Ok(())
}

pub fn handle_substrules_section(gen: &mut Generator, end_phrase: &str) -> Result<(), SyntaxAbort> {
    gen.begin_section("substrules");

    let mut command_filters: Option<Vec<String>> = None;
    let mut filter_is_regex = false;
    let mut filter_strictness: i64 = matcher::STRICTNESS_CONTAINS;
    // The inline foregroundonly next to a filter is scoped to that filter;
    // the section value it shadowed comes back when the filter changes.
    let mut shadowed_foregroundonly: Option<bool> = None;

    let db_path = gen.files.path.join(defs::DB_FILENAME);
    if db_path.exists() {
        if gen.store.is_none() {
            match RuleStore::open(&db_path) {
                Ok(store) => gen.store = Some(store),
                Err(_) => {
                    return Err(gen.syntax_error(
                        "The current substrules database version is incompatible; please run \
                         \"clitheme repair-theme\" and try again",
                    ));
                }
            }
        }
    } else {
        match RuleStore::create(&db_path) {
            Ok(store) => gen.store = Some(store),
            Err(e) => {
                let msg = format!("Unable to create the substrules database ({e})");
                return Err(gen.syntax_error(msg));
            }
        }
    }

    let subst_re = Regex::new(r"^\[(subst(?:itute)?_(?:string|regex))(\]|>>)$").unwrap();
    let subst_regex_re = Regex::new(r"^\[subst(?:itute)?_regex(\]|>>)$").unwrap();
    let filter_block_re = Regex::new(r"^\[filter_(?:cmds|commands)(_regex)?\]$").unwrap();

    while gen.goto_next_line() {
        let phrases = gen.current_phrases();
        let Some(first) = phrases.first().cloned() else {
            continue;
        };

        if let Some(caps) = subst_re.captures(&first) {
            let name = caps[1].to_string();
            let is_regex = subst_regex_re.is_match(&first);
            let scope = SubstrulesScope {
                effective_commands: command_filters.clone(),
                command_is_regex: filter_is_regex,
                is_regex,
                strictness: filter_strictness,
            };
            gen.handle_entry(&format!("[{name}]"), &format!("[/{name}]"), Some(&scope))?;
        } else if filter_block_re.is_match(&first) {
            gen.check_extra_args(&phrases, 1, "", true)?;
            restore_foregroundonly(gen, &mut shadowed_foregroundonly);
            filter_is_regex = filter_block_re
                .captures(&first)
                .and_then(|c| c.get(1))
                .is_some();

            let mut pattern_linenum = gen.linenum();
            let filter_end = first.replacen('[', "[/", 1);
            let command_strings =
                gen.block_input_lines(false, false, &filter_end, false, true)?;

            if filter_is_regex {
                for cmd in &command_strings {
                    pattern_linenum += 1;
                    check_filter_pattern(gen, cmd, Some(pattern_linenum));
                }
            }

            let mut got_options = gen.global_options.clone();
            let mut inline_options = options::OptionsMap::new();
            let end_parts = gen.current_phrases();
            if end_parts.len() > 1 {
                let opt_words = end_parts[1..].to_vec();
                let mut allowed: Vec<&str> = options::block_input_options();
                if !filter_is_regex {
                    allowed.extend_from_slice(&options::COMMAND_FILTER_OPTIONS);
                } else {
                    allowed.push("foregroundonly");
                }
                got_options =
                    gen.parse_options(&opt_words, MergeScope::Section, Some(&allowed), None);
                inline_options =
                    gen.parse_options(&opt_words, MergeScope::Inline, Some(&allowed), None);
            }
            filter_strictness = strictness_from(&got_options);
            apply_inline_foregroundonly(gen, &inline_options, &mut shadowed_foregroundonly);
            command_filters = Some(command_strings);
        } else if matches!(
            first.as_str(),
            "filter_cmd"
                | "filter_command"
                | "<filter_cmd>"
                | "<filter_command>"
                | "filter_cmd_regex"
                | "filter_command_regex"
                | "<filter_cmd_regex>"
                | "<filter_command_regex>"
        ) {
            gen.check_enough_args(&phrases, 2, "", true)?;
            restore_foregroundonly(gen, &mut shadowed_foregroundonly);
            filter_is_regex = first.contains("_regex");

            let joined = phrases[1..].join(" ");
            let extra: Vec<&str> = if filter_is_regex {
                vec!["foregroundonly"]
            } else {
                options::COMMAND_FILTER_OPTIONS.to_vec()
            };
            let parsed =
                gen.parse_content_with_options(&joined, &extra, ContentMode::Name, None, false);
            if filter_is_regex {
                check_filter_pattern(gen, &parsed.content, None);
            }
            filter_strictness = strictness_from(&parsed.options);
            apply_inline_foregroundonly(gen, &parsed.inline_options, &mut shadowed_foregroundonly);
            command_filters = Some(vec![parsed.content]);
        } else if matches!(
            first.as_str(),
            "unset_filter_cmd"
                | "unset_filter_command"
                | "<unset_filter_cmd>"
                | "<unset_filter_command>"
        ) {
            gen.check_extra_args(&phrases, 1, "", true)?;
            restore_foregroundonly(gen, &mut shadowed_foregroundonly);
            command_filters = None;
        } else if gen.handle_setters(false)? {
            // consumed
        } else if first == end_phrase {
            gen.check_extra_args(&phrases, 1, "", true)?;
            gen.end_section("substrules");
            if gen.close_db {
                gen.store = None;
            }
            return Ok(());
        } else {
            return Err(gen.invalid_phrase(&first));
        }
    }
    gen.unterminated_section("substrules");
    Ok(())
}

fn strictness_from(map: &options::OptionsMap) -> i64 {
    let mut strictness = matcher::STRICTNESS_CONTAINS;
    if options::is_true(map, "strictcmdmatch") {
        strictness = matcher::STRICTNESS_PREFIX;
    }
    if options::is_true(map, "exactcmdmatch") {
        strictness = matcher::STRICTNESS_EXACT;
    }
    if options::is_true(map, "smartcmdmatch") {
        strictness = matcher::STRICTNESS_SMART;
    }
    strictness
}

fn check_filter_pattern(gen: &mut Generator, pattern: &str, linenum: Option<usize>) {
    if let Err(e) = Regex::new(pattern) {
        let msg = format!(
            "Line {}: Bad command filter pattern ({})",
            linenum.unwrap_or_else(|| gen.linenum()),
            make_printable(&e.to_string())
        );
        gen.error(msg);
    }
}

fn apply_inline_foregroundonly(
    gen: &mut Generator,
    inline_options: &options::OptionsMap,
    shadowed: &mut Option<bool>,
) {
    if let Some(value) = inline_options.get("foregroundonly").copied() {
        *shadowed = Some(options::is_true(&gen.global_options, "foregroundonly"));
        gen.global_options.insert("foregroundonly".to_string(), value);
    }
}

fn restore_foregroundonly(gen: &mut Generator, shadowed: &mut Option<bool>) {
    if let Some(previous) = shadowed.take() {
        gen.global_options
            .insert("foregroundonly".to_string(), OptionValue::Flag(previous));
    }
}

pub fn handle_manpage_section(gen: &mut Generator, end_phrase: &str) -> Result<(), SyntaxAbort> {
    gen.begin_section("manpages");

    while gen.goto_next_line() {
        let phrases = gen.current_phrases();
        let Some(first) = phrases.first().cloned() else {
            continue;
        };

        if first == "[file_content]" {
            let mut file_paths = vec![manpage_path(gen, &phrases)?];
            let mut prev_line_index = gen.lineindex;
            while gen.goto_next_line() {
                let p = gen.current_phrases();
                if p.first().map(String::as_str) == Some("[file_content]") {
                    prev_line_index = gen.lineindex;
                    file_paths.push(manpage_path(gen, &p)?);
                } else {
                    gen.lineindex = prev_line_index;
                    break;
                }
            }

            let content = gen.block_input(true, true, "[/file_content]", "\n", true, false)?;
            for (path, linenum) in &file_paths {
                gen.files
                    .write_manpage_file(path, &content, Some(*linenum), None);
            }
        } else if first == "<include_file>" || first == "include_file" {
            let (path, _) = manpage_path(gen, &phrases)?;
            let content = read_manpage_source(gen, &path);
            if gen.goto_next_line() {
                let next = gen.current_phrases();
                if matches!(next.first().map(String::as_str), Some("as") | Some("as:")) {
                    let (target, linenum) = manpage_path(gen, &next)?;
                    gen.files
                        .write_manpage_file(&target, &content, Some(linenum), None);
                } else {
                    let msg = format!(
                        "Line {}: Missing \"as <filename>\" phrase on next line",
                        gen.linenum() - 1
                    );
                    gen.error(msg);
                    gen.lineindex -= 1;
                }
            }
        } else if first == "[include_file]" {
            let (path, _) = manpage_path(gen, &phrases)?;
            let content = read_manpage_source(gen, &path);
            while gen.goto_next_line() {
                let p = gen.current_phrases();
                let Some(key) = p.first().cloned() else {
                    continue;
                };
                if key == "as" || key == "as:" {
                    gen.check_enough_args(&p, 2, "", true)?;
                    let (target, linenum) = manpage_path(gen, &p)?;
                    gen.files
                        .write_manpage_file(&target, &content, Some(linenum), None);
                } else if key == "[/include_file]" {
                    gen.check_extra_args(&p, 1, "", true)?;
                    break;
                } else {
                    return Err(gen.invalid_phrase(&key));
                }
            }
        } else if gen.handle_setters(false)? {
            // consumed
        } else if first == end_phrase {
            gen.check_extra_args(&phrases, 1, "", true)?;
            gen.end_section("manpages");
            return Ok(());
        } else {
            return Err(gen.invalid_phrase(&first));
        }
    }
    gen.unterminated_section("manpages");
    Ok(())
}

/// Parse and sanity-check a manpage path from the words after a keyword.
fn manpage_path(
    gen: &mut Generator,
    phrases: &[String],
) -> Result<(Vec<String>, usize), SyntaxAbort> {
    gen.check_enough_args(phrases, 2, "", true)?;
    let joined = phrases[1..].join(" ");
    let parsed = gen.parse_content(&joined, ContentMode::Name, None, false);
    let mut parts: Vec<String> = parsed.split_whitespace().map(String::from).collect();
    if let Err(reason) = sanity::check(&parts.join(" ")) {
        let msg = format!(
            "Line {}: Manpage paths {reason}; use spaces to denote subdirectories",
            gen.linenum()
        );
        gen.error(msg);
        for part in &mut parts {
            *part = sanity::sanitize(part);
        }
    }
    Ok((parts, gen.linenum()))
}

/// Read an included manpage source relative to the theme file, recording a
/// migration copy inside the info tree. Returns empty content on failure.
fn read_manpage_source(gen: &mut Generator, file_path: &[String]) -> String {
    let parent = Path::new(&gen.filename)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    let mut full = parent;
    for part in file_path {
        full.push(part);
    }
    match fs::read_to_string(&full) {
        Ok(content) => {
            let sidecar = info_dir(gen).join("manpage_data");
            gen.files
                .write_manpage_file(file_path, &content, None, Some(&sidecar));
            content
        }
        Err(e) => {
            let msg = format!(
                "Line {}: Unable to read file \"{}\":\n{}",
                gen.linenum(),
                make_printable(&full.display().to_string()),
                make_printable(&e.to_string())
            );
            gen.error(msg);
            String::new()
        }
    }
}

/// Result of one compile pass.
pub struct CompileOutcome {
    pub success: bool,
    pub messages: Vec<String>,
}

/// Compile one theme source into the data hierarchy at `path`.
pub fn compile_theme(
    file_content: &str,
    path: &Path,
    infofile_name: &str,
    filename: &str,
) -> io::Result<CompileOutcome> {
    let mut gen = Generator::new(file_content, infofile_name, filename, path, true)?;

    // Source text and path are recorded for migration and theme updates.
    let dir = info_dir(&gen);
    let content_copy = gen.file_content.clone();
    gen.files
        .write_infofile(&dir, "file_content", &content_copy, 0, "<file_content>");
    let absolute = if Path::new(filename).is_absolute() {
        Path::new(filename).to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_default()
            .join(filename)
    };
    gen.files.write_infofile(
        &dir,
        &defs::info_filename("filepath"),
        &absolute.display().to_string(),
        0,
        "<filepath>",
    );
    let index_path = gen
        .files
        .path
        .join(defs::INFO_PATHNAME)
        .join(defs::INDEX_FILENAME);
    if fs::write(&index_path, format!("{infofile_name}\n")).is_err() {
        gen.files.handle_error("Cannot write the theme index file");
    }

    // A syntax abort has already been recorded as a diagnostic; the pass
    // simply stops early.
    let _ = run_dispatch(&mut gen);

    let has_header = gen.parsed_sections.iter().any(|s| s == "header");
    let has_content = gen
        .parsed_sections
        .iter()
        .any(|s| s == "entries" || s == "substrules" || s == "manpages");
    if gen.section_parsing || !has_header || !has_content {
        gen.error("Missing or incomplete header or content sections");
    }

    Ok(CompileOutcome {
        success: gen.files.success,
        messages: std::mem::take(&mut gen.files.messages),
    })
}

fn run_dispatch(gen: &mut Generator) -> Result<(), SyntaxAbort> {
    let mut before_content_lines = true;
    while gen.goto_next_line() {
        let phrases = gen.current_phrases();
        let Some(first) = phrases.first().cloned() else {
            continue;
        };
        let mut is_content = true;

        let end_phrase = if first.starts_with('{') {
            first.replacen('{', "{/", 1)
        } else if first.starts_with("begin_") {
            first.replacen("begin_", "end_", 1)
        } else {
            String::new()
        };

        match first.as_str() {
            "{header}" | "{header_section}" | "begin_header" => {
                gen.check_extra_args(&phrases, 1, "", true)?;
                handle_header_section(gen, &end_phrase)?;
            }
            "{entries}" | "{entries_section}" | "begin_main" => {
                gen.check_extra_args(&phrases, 1, "", true)?;
                if first == "begin_main" {
                    let msg = format!(
                        "Line {}: Phrase \"begin_main\" is deprecated in this version; please \
                         use \"{{entries}}\" instead",
                        gen.linenum()
                    );
                    gen.warning(msg);
                }
                handle_entries_section(gen, &end_phrase)?;
            }
            "{substrules}" | "{substrules_section}" => {
                gen.check_extra_args(&phrases, 1, "", true)?;
                handle_substrules_section(gen, &end_phrase)?;
            }
            "{manpages}" | "{manpage_section}" => {
                gen.check_extra_args(&phrases, 1, "", true)?;
                handle_manpage_section(gen, &end_phrase)?;
            }
            "!require_version" => {
                is_content = false;
                gen.check_enough_args(&phrases, 2, "", true)?;
                gen.check_extra_args(&phrases, 2, "", true)?;
                if !before_content_lines {
                    let msg = format!(
                        "Line {}: Header macro \"!require_version\" must be specified before \
                         other lines",
                        gen.linenum()
                    );
                    gen.error(msg);
                } else {
                    gen.check_version(&phrases[1])?;
                }
            }
            _ => {
                if !gen.handle_setters(true)? {
                    return Err(gen.invalid_phrase(&first));
                }
            }
        }

        if is_content {
            before_content_lines = false;
        }
    }
    Ok(())
}
