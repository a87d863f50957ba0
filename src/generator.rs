//! Theme source parser core.
//!
//! One `Generator` exists per compile pass. It owns the line cursor, the
//! three option scopes (file, section, inline), the variable scopes, the
//! content substitution pipeline (`{{var}}`, `{{ESC}}`, `{{[xHH]}}`),
//! line-boundary extraction (`|text| options`), and block input collection.
//!
//! Diagnostics repeat easily because several constructs are parsed twice
//! (a look-ahead pass followed by the main pass); hash sets keyed on the
//! line number and the parsed text gate warnings so each one is reported
//! once.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::io;
use std::path::Path;

use regex::Regex;

use crate::datafiles::{OutputTree, SyntaxAbort};
use crate::defs;
use crate::options::{self, OptionValue, OptionsMap};
use crate::store::RuleStore;
use crate::strutil::{extract_content, make_printable};

/// Which outer scope `parse_options` copies before applying new words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeScope {
    /// Start from an empty map: the result holds only what the words set.
    Inline,
    /// Start from the section scope.
    Section,
    /// Start from the file scope.
    File,
}

/// How content is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    /// Full content: line bounds plus all substitutions.
    Content,
    /// A name: line bounds and variable substitution only.
    Name,
    /// Plain text: no line bounds.
    Plain,
}

/// Content plus the option maps found next to it.
pub struct ParsedContent {
    pub content: String,
    pub options: OptionsMap,
    pub inline_options: OptionsMap,
}

pub struct Generator {
    pub files: OutputTree,
    /// Options latched as "explicitly disabled"; misuse of the matching
    /// feature is only warned about until the latch is set.
    pub warnings: HashSet<String>,
    parsed_lines: HashSet<u64>,
    parsed_option_lines: HashSet<u64>,
    pub section_parsing: bool,
    pub parsed_sections: Vec<String>,
    lines: Vec<String>,
    pub lineindex: isize,
    pub global_options: OptionsMap,
    pub file_options: OptionsMap,
    pub global_variables: BTreeMap<String, String>,
    pub file_variables: BTreeMap<String, String>,
    pub in_domainapp: String,
    pub in_subsection: String,
    pub infofile_name: String,
    pub filename: String,
    pub file_content: String,
    pub file_id: String,
    pub close_db: bool,
    /// Rule store opened by the substrules section for this pass.
    pub store: Option<RuleStore>,
}

impl Generator {
    pub fn new(
        file_content: &str,
        infofile_name: &str,
        filename: &str,
        path: &Path,
        close_db: bool,
    ) -> io::Result<Self> {
        let lines = file_content
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        Ok(Self {
            files: OutputTree::new(path)?,
            warnings: HashSet::new(),
            parsed_lines: HashSet::new(),
            parsed_option_lines: HashSet::new(),
            section_parsing: false,
            parsed_sections: Vec::new(),
            lines,
            lineindex: -1,
            global_options: OptionsMap::new(),
            file_options: OptionsMap::new(),
            global_variables: BTreeMap::new(),
            file_variables: BTreeMap::new(),
            in_domainapp: String::new(),
            in_subsection: String::new(),
            infofile_name: infofile_name.to_string(),
            filename: filename.to_string(),
            file_content: file_content.to_string(),
            file_id: gen_uuid(),
            close_db,
            store: None,
        })
    }

    // ---- diagnostics ----------------------------------------------------

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.files.handle_error(message);
    }

    pub fn warning(&mut self, message: impl AsRef<str>) {
        self.files.handle_warning(message);
    }

    pub fn syntax_error(&mut self, message: impl AsRef<str>) -> SyntaxAbort {
        self.files.handle_syntax_error(message)
    }

    pub fn invalid_phrase(&mut self, name: &str) -> SyntaxAbort {
        let msg = format!(
            "Line {}: Unexpected \"{}\"",
            self.linenum(),
            make_printable(name)
        );
        self.syntax_error(msg)
    }

    pub fn unterminated_section(&mut self, name: &str) {
        self.error(format!("Unterminated {name} section at end of file"));
    }

    // ---- line cursor ----------------------------------------------------

    fn is_ignore_line(&self) -> bool {
        let stripped = self.lines[self.lineindex as usize].trim();
        stripped.is_empty() || stripped.starts_with('#')
    }

    /// Advance to the next line that is neither blank nor a comment.
    pub fn goto_next_line(&mut self) -> bool {
        while self.lineindex < self.lines.len() as isize - 1 {
            self.lineindex += 1;
            if !self.is_ignore_line() {
                return true;
            }
        }
        false
    }

    /// 1-based number of the current line.
    pub fn linenum(&self) -> usize {
        (self.lineindex + 1) as usize
    }

    pub fn current_line(&self) -> String {
        self.lines[self.lineindex as usize].clone()
    }

    pub fn current_phrases(&self) -> Vec<String> {
        crate::strutil::split_words(&self.lines[self.lineindex as usize])
            .into_iter()
            .map(String::from)
            .collect()
    }

    // ---- argument checks ------------------------------------------------

    pub fn check_enough_args(
        &mut self,
        phrases: &[String],
        count: usize,
        disp: &str,
        check_processed: bool,
    ) -> Result<(), SyntaxAbort> {
        let ok = if check_processed && phrases.len() > 1 {
            let rest = phrases[1..].join(" ");
            let processed = self.parse_content(&rest, ContentMode::Name, None, true);
            processed.split_whitespace().count() + 1 >= count
        } else {
            phrases.len() >= count
        };
        if !ok {
            let name = if disp.is_empty() { &phrases[0] } else { disp };
            let msg = format!(
                "Line {}: Not enough arguments for \"{}\"",
                self.linenum(),
                make_printable(name)
            );
            return Err(self.syntax_error(msg));
        }
        Ok(())
    }

    pub fn check_extra_args(
        &mut self,
        phrases: &[String],
        count: usize,
        disp: &str,
        check_processed: bool,
    ) -> Result<(), SyntaxAbort> {
        let ok = if check_processed && phrases.len() > 1 {
            let rest = phrases[1..].join(" ");
            let processed = self.parse_content(&rest, ContentMode::Name, None, true);
            processed.split_whitespace().count() + 1 <= count
        } else {
            phrases.len() <= count
        };
        if !ok {
            let name = if disp.is_empty() { &phrases[0] } else { disp };
            let msg = format!(
                "Line {}: Extra arguments after \"{}\"",
                self.linenum(),
                make_printable(name)
            );
            return Err(self.syntax_error(msg));
        }
        Ok(())
    }

    // ---- version gate ---------------------------------------------------

    pub fn check_version(&mut self, version_str: &str) -> Result<(), SyntaxAbort> {
        let re = Regex::new(r"^(\d+)\.(\d+)(-beta(\d+))?$").unwrap();
        let caps = re.captures(version_str);
        let parsed = caps.as_ref().and_then(|c| {
            let major: u32 = c[1].parse().ok()?;
            let minor: u32 = c[2].parse().ok()?;
            let beta: Option<u32> = c.get(4).and_then(|b| b.as_str().parse().ok());
            Some((major, minor, beta))
        });
        let Some((major, minor, beta)) = parsed.filter(|(major, _, _)| *major >= 2) else {
            let msg = format!(
                "Line {}: Invalid version information \"{}\"",
                self.linenum(),
                make_printable(version_str)
            );
            return Err(self.syntax_error(msg));
        };

        let newer = defs::VERSION_MAJOR > major
            || (defs::VERSION_MAJOR == major && defs::VERSION_MINOR > minor);
        let equal = defs::VERSION_MAJOR == major && defs::VERSION_MINOR == minor;

        let version_ok = match beta {
            Some(required_beta) => match defs::BETA_RELEASE {
                Some(current_beta) => newer || (equal && required_beta <= current_beta),
                None => newer || equal,
            },
            // A file that does not pin a beta needs a stable, non-dev build.
            None => (newer || equal) && defs::BETA_RELEASE.is_none() && defs::RELEASE.is_some(),
        };

        if !version_ok {
            let mut current = defs::ENGINE_VERSION.to_string();
            if let Some(b) = defs::BETA_RELEASE {
                if !current.contains("beta") {
                    current.push_str(&format!(" [beta{b}]"));
                }
            }
            let msg = format!(
                "Current version of clitheme ({current}) does not support this file \
                 (requires {} or higher)",
                make_printable(version_str)
            );
            return Err(self.syntax_error(msg));
        }
        Ok(())
    }

    // ---- options --------------------------------------------------------

    /// Parse option words into a fresh map seeded from `merge`.
    ///
    /// Diagnostics for an identical (line, words) pair are reported once
    /// per pass.
    pub fn parse_options(
        &mut self,
        words: &[String],
        merge: MergeScope,
        allowed: Option<&[&str]>,
        banned: Option<&[&str]>,
    ) -> OptionsMap {
        let mut hasher = DefaultHasher::new();
        self.linenum().hash(&mut hasher);
        for w in words {
            w.hash(&mut hasher);
        }
        let show_warnings = self.parsed_option_lines.insert(hasher.finish());

        let mut final_options = match merge {
            MergeScope::Inline => OptionsMap::new(),
            MergeScope::Section => self.global_options.clone(),
            MergeScope::File => self.file_options.clone(),
        };
        if words.is_empty() {
            return final_options;
        }

        let joined = words.join(" ");
        let processed = self.parse_content(&joined, ContentMode::Plain, None, false);
        let parsed: Vec<String> = processed.split_whitespace().map(String::from).collect();

        let bool_opts = options::bool_options();
        let groups = options::switch_groups();

        let mut errors: Vec<String> = Vec::new();
        for x in 0..parsed.len() {
            let each = parsed[x].clone();
            // Name without a ":value" suffix, keeping a possible "no" prefix.
            let preserve_no = match each.find(':') {
                Some(idx) => &each[..idx],
                None => each.as_str(),
            };
            // Base name with the "no" prefix removed as well.
            let base_name = preserve_no.strip_prefix("no").unwrap_or(preserve_no);

            let effective_name;
            if options::LEAD_INDENT_OPTIONS.contains(&preserve_no) {
                effective_name = base_name.to_string();
                match each.split_once(':') {
                    Some((_, value)) if !value.is_empty() => match value.parse::<i64>() {
                        Ok(v) => {
                            final_options.insert(base_name.to_string(), OptionValue::Count(v));
                        }
                        Err(_) => errors.push(format!(
                            "Line {}: The value specified for option \"{}\" is not an integer",
                            self.linenum(),
                            make_printable(base_name)
                        )),
                    },
                    _ => errors.push(format!(
                        "Line {}: No value specified for option \"{}\"",
                        self.linenum(),
                        make_printable(base_name)
                    )),
                }
            } else if bool_opts.contains(&base_name) {
                effective_name = base_name.to_string();
                final_options.insert(
                    base_name.to_string(),
                    OptionValue::Flag(!preserve_no.starts_with("no")),
                );
            } else if let Some(group) = groups.iter().find(|g| g.contains(&preserve_no)) {
                effective_name = preserve_no.to_string();
                for prev in &parsed[..x] {
                    if prev != preserve_no && group.contains(&prev.as_str()) {
                        errors.push(format!(
                            "Line {}: The option \"{}\" can't be set at the same time with \"{}\"",
                            self.linenum(),
                            make_printable(preserve_no),
                            make_printable(prev)
                        ));
                    }
                }
                for member in group {
                    final_options.insert((*member).to_string(), OptionValue::Flag(false));
                }
                final_options.insert(preserve_no.to_string(), OptionValue::Flag(true));
            } else {
                errors.push(format!(
                    "Line {}: Unknown option \"{}\"",
                    self.linenum(),
                    make_printable(preserve_no)
                ));
                continue;
            }

            let not_allowed = allowed.is_some_and(|a| !a.contains(&effective_name.as_str()));
            let is_banned = banned.is_some_and(|b| b.contains(&effective_name.as_str()));
            if not_allowed || is_banned {
                errors.push(format!(
                    "Line {}: Option \"{}\" not allowed here",
                    self.linenum(),
                    make_printable(&effective_name)
                ));
            }
        }

        if show_warnings {
            for msg in errors {
                self.error(msg);
            }
        }
        final_options
    }

    /// Apply `set_options` words to the section scope (and the file scope
    /// when `file_level`). Substitution switches that stay off after an
    /// explicit mention are latched so later misuse is not re-warned.
    pub fn set_global_options(&mut self, words: &[String], file_level: bool) {
        if file_level {
            self.file_options = self.parse_options(words, MergeScope::File, None, None);
        }
        self.global_options = self.parse_options(words, MergeScope::Section, None, None);
        let specified = self.parse_options(words, MergeScope::Inline, None, None);
        for option in options::subst_options() {
            if !options::is_true(&self.global_options, option) && specified.contains_key(option) {
                self.warnings.insert(option.to_string());
            }
        }
    }

    /// Reset the section scope from the file scope on section boundaries.
    pub fn setup_global_options(&mut self) {
        let prev = std::mem::replace(&mut self.global_options, self.file_options.clone());
        for option in options::subst_options() {
            if !options::is_true(&self.global_options, option) && options::is_true(&prev, option) {
                self.warnings.insert(option.to_string());
            }
        }
        self.global_variables = self.file_variables.clone();
    }

    // ---- substitution ---------------------------------------------------

    /// Apply variable, escape and character substitution to `content`.
    ///
    /// `None` for a switch means "use the section scope". Misuse of a
    /// disabled feature warns once per option unless latched or silenced.
    pub fn handle_subst(
        &mut self,
        content: &str,
        line_number_debug: Option<&str>,
        silence_warnings: bool,
        subst_var: Option<bool>,
        subst_esc: Option<bool>,
        subst_chars: Option<bool>,
    ) -> String {
        let do_var =
            subst_var.unwrap_or_else(|| options::is_true(&self.global_options, "substvar"));
        let do_esc =
            subst_esc.unwrap_or_else(|| options::is_true(&self.global_options, "substesc"));
        let do_chars =
            subst_chars.unwrap_or_else(|| options::is_true(&self.global_options, "substchar"));

        let ln_debug = line_number_debug
            .map(String::from)
            .unwrap_or_else(|| self.linenum().to_string());

        let var_re = Regex::new(r"\{\{([^\s]+?)??\}\}").unwrap();
        let char_re = Regex::new(r"\{\{\[([^\s]+?)??\]\}\}").unwrap();

        if !silence_warnings && !do_var && !self.warnings.contains("substvar") {
            for caps in var_re.captures_iter(content) {
                let var_name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                if self.global_variables.contains_key(var_name) {
                    self.warning(format!(
                        "Line {ln_debug}: Attempted to reference a defined variable, but \
                         \"substvar\" option is not enabled"
                    ));
                    break;
                }
            }
        }

        let mut new_content = content.to_string();

        if do_var {
            let mut result = String::with_capacity(content.len());
            let mut last_pos = 0;
            let mut encountered: HashSet<String> = HashSet::new();
            let mut pending_warnings: Vec<String> = Vec::new();
            for caps in var_re.captures_iter(content) {
                let whole = caps.get(0).unwrap();
                let var_name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                result.push_str(&content[last_pos..whole.start()]);
                last_pos = whole.end();

                if var_name.trim().is_empty()
                    || var_name == "ESC"
                    || (var_name.len() >= 2
                        && var_name.starts_with('[')
                        && var_name.ends_with(']'))
                {
                    result.push_str(whole.as_str());
                    continue;
                }
                match self.global_variables.get(var_name) {
                    Some(value) => result.push_str(value),
                    None => {
                        if !silence_warnings && !encountered.contains(var_name) {
                            pending_warnings.push(format!(
                                "Line {ln_debug}: Unknown variable \"{}\", not performing \
                                 substitution",
                                make_printable(var_name)
                            ));
                        }
                        result.push_str(whole.as_str());
                    }
                }
                encountered.insert(var_name.to_string());
            }
            result.push_str(&content[last_pos..]);
            for w in pending_warnings {
                self.warning(w);
            }
            new_content = result;
        }

        if !silence_warnings
            && !do_esc
            && !self.warnings.contains("substesc")
            && new_content.contains("{{ESC}}")
        {
            self.warning(format!(
                "Line {ln_debug}: Attempted to use \"{{{{ESC}}}}\", but \"substesc\" option is \
                 not enabled"
            ));
        }
        if do_esc {
            new_content = new_content.replace("{{ESC}}", "\x1b");
        }

        if !silence_warnings
            && !do_chars
            && !self.warnings.contains("substchar")
            && char_re.is_match(&new_content)
        {
            self.warning(format!(
                "Line {ln_debug}: Attempted to use character substitution, but \"substchar\" \
                 option is not enabled"
            ));
        }
        if do_chars {
            let source = new_content.clone();
            let mut result = String::with_capacity(source.len());
            let mut last_pos = 0;
            let mut pending_warnings: Vec<String> = Vec::new();
            for caps in char_re.captures_iter(&source) {
                let whole = caps.get(0).unwrap();
                let pattern = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                result.push_str(&source[last_pos..whole.start()]);
                last_pos = whole.end();

                if pattern.trim().is_empty() {
                    result.push_str(whole.as_str());
                    continue;
                }
                let width_ok = matches!(
                    (pattern.chars().next(), pattern.chars().count()),
                    (Some('x'), 3) | (Some('u'), 5) | (Some('U'), 9)
                );
                if width_ok {
                    let encoded = u32::from_str_radix(&pattern[1..], 16)
                        .ok()
                        .and_then(crate::strutil::codepoint_to_utf8);
                    match encoded {
                        Some(text) => result.push_str(&text),
                        None => {
                            if !silence_warnings {
                                pending_warnings.push(format!(
                                    "Line {ln_debug}: Invalid character code \"{}\", not \
                                     performing substitution",
                                    make_printable(&pattern[1..])
                                ));
                            }
                            result.push_str(whole.as_str());
                        }
                    }
                } else {
                    if !silence_warnings {
                        pending_warnings.push(format!(
                            "Line {ln_debug}: Invalid substchar format \"{}\", not performing \
                             substitution",
                            make_printable(pattern)
                        ));
                    }
                    result.push_str(whole.as_str());
                }
            }
            result.push_str(&source[last_pos..]);
            for w in pending_warnings {
                self.warning(w);
            }
            new_content = result;
        }

        new_content
    }

    /// Extract `|text|[ options]` from a content line.
    ///
    /// Returns the inner text and the trailing option words (empty when
    /// none). With the option off, a line that still looks like a bounded
    /// one warns; a malformed bounded line is a compile error.
    pub fn handle_linebounds(
        &mut self,
        content: &str,
        condition: Option<bool>,
        preserve_indents: bool,
        allow_options: bool,
        debug_linenumber: Option<usize>,
        silence_warn: bool,
    ) -> (String, String) {
        let cond =
            condition.unwrap_or_else(|| options::is_true(&self.global_options, "linebounds"));
        let stripped = content.trim();

        let re = if allow_options {
            Regex::new(r"^\|(.+?)\|(\s+([^|]+))?$").unwrap()
        } else {
            Regex::new(r"^\|(.+?)\|$").unwrap()
        };
        let caps = re.captures(stripped);

        if !cond || !stripped.starts_with('|') {
            if caps.is_some() && !silence_warn && !self.warnings.contains("linebounds") {
                let line = debug_linenumber.unwrap_or_else(|| self.linenum());
                self.warning(format!(
                    "Line {line}: Attempted to use line boundaries, but \"linebounds\" option \
                     is not enabled"
                ));
            }
            return (content.to_string(), String::new());
        }

        match caps {
            Some(caps) => {
                let mut text = caps[1].to_string();
                if !preserve_indents {
                    text = text.trim().to_string();
                }
                let options_str = if allow_options {
                    caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default()
                } else {
                    String::new()
                };
                (text, options_str)
            }
            None => {
                if !silence_warn {
                    let line = debug_linenumber.unwrap_or_else(|| self.linenum());
                    self.error(format!("Line {line}: Invalid line boundary format"));
                }
                (content.to_string(), String::new())
            }
        }
    }

    // ---- variables ------------------------------------------------------

    pub fn set_variable(&mut self, names: &[String], content: &str, file_level: bool) {
        let parsed = self.parse_content(content, ContentMode::Name, Some(true), false);
        for name in names {
            let invalid = name == "ESC"
                || name
                    .chars()
                    .any(|c| options::VARNAME_BANNED_CHARS.contains(&c));
            if invalid {
                let msg = format!(
                    "Line {}: \"{}\" is not a valid variable name",
                    self.linenum(),
                    make_printable(name)
                );
                self.error(msg);
            } else {
                if file_level {
                    self.file_variables.insert(name.clone(), parsed.clone());
                }
                self.global_variables.insert(name.clone(), parsed.clone());
            }
        }
    }

    // ---- sections -------------------------------------------------------

    pub fn begin_section(&mut self, section_name: &str) {
        if self.parsed_sections.iter().any(|s| s == section_name) {
            let msg = format!("Line {}: Repeated {section_name} section", self.linenum());
            self.error(msg);
        }
        self.section_parsing = true;
        self.setup_global_options();
    }

    pub fn end_section(&mut self, section_name: &str) {
        self.parsed_sections.push(section_name.to_string());
        self.section_parsing = false;
        self.setup_global_options();
    }

    pub fn linenumber_range(begin: usize, end: usize) -> String {
        if begin == end {
            end.to_string()
        } else {
            format!("{begin}-{end}")
        }
    }

    // ---- content pipeline -----------------------------------------------

    pub fn parse_content(
        &mut self,
        content: &str,
        mode: ContentMode,
        preserve_indents: Option<bool>,
        ignore_options: bool,
    ) -> String {
        self.parse_content_with_options(content, &[], mode, preserve_indents, ignore_options)
            .content
    }

    /// Full content pipeline: line-bound extraction, then variable, escape
    /// and character substitution in that order, then a strip unless
    /// indents are preserved.
    pub fn parse_content_with_options(
        &mut self,
        content: &str,
        extra_options: &[&str],
        mode: ContentMode,
        preserve_indents: Option<bool>,
        ignore_options: bool,
    ) -> ParsedContent {
        let preserve = preserve_indents.unwrap_or(mode == ContentMode::Content);

        let mut hasher = DefaultHasher::new();
        self.linenum().hash(&mut hasher);
        content.hash(&mut hasher);
        (mode as u8).hash(&mut hasher);
        let no_warn = !self.parsed_lines.insert(hasher.finish());

        let (target, options_str) = if mode != ContentMode::Plain {
            self.handle_linebounds(content, None, preserve, true, None, no_warn)
        } else {
            (content.to_string(), String::new())
        };

        let (opts, inline_opts) = if !options_str.is_empty() {
            let parts: Vec<String> = options_str.split_whitespace().map(String::from).collect();
            let mut allowed: Vec<&str> = if mode != ContentMode::Content {
                options::CONTENT_SUBST_OPTIONS.to_vec()
            } else {
                options::subst_options()
            };
            allowed.extend_from_slice(extra_options);
            let ban = ["linebounds"];
            if !ignore_options {
                (
                    self.parse_options(&parts, MergeScope::Section, Some(&allowed), Some(&ban)),
                    self.parse_options(&parts, MergeScope::Inline, Some(&allowed), Some(&ban)),
                )
            } else {
                (
                    self.parse_options(&parts, MergeScope::Section, None, Some(&ban)),
                    self.parse_options(&parts, MergeScope::Inline, None, Some(&ban)),
                )
            }
        } else {
            (self.global_options.clone(), OptionsMap::new())
        };

        let full = mode == ContentMode::Content;
        let mut result = self.handle_subst(
            &target,
            None,
            no_warn,
            Some(options::is_true(&opts, "substvar")),
            Some(full && options::is_true(&opts, "substesc")),
            Some(full && options::is_true(&opts, "substchar")),
        );
        if !preserve {
            result = result.trim().to_string();
        }
        ParsedContent {
            content: result,
            options: opts,
            inline_options: inline_opts,
        }
    }

    // ---- setters --------------------------------------------------------

    /// Handle `setvar`, `set_options`, `(enable_subst)` and
    /// `(disable_subst)` lines. Returns true when the line was consumed.
    pub fn handle_setters(&mut self, file_level: bool) -> Result<bool, SyntaxAbort> {
        let phrases = self.current_phrases();
        if phrases.is_empty() {
            return Ok(false);
        }
        let line = self.current_line();
        let stripped = line.trim().to_string();

        if phrases[0].starts_with("setvar[") {
            match bracket_directive(&stripped, "setvar[") {
                Some((matched, body)) if body.split_whitespace().next().is_some() => {
                    let matched = matched.to_string();
                    let names: Vec<String> =
                        body.split_whitespace().map(String::from).collect();
                    let argc = matched.split_whitespace().count();
                    self.check_enough_args(&phrases, argc + 1, &matched, false)?;
                    let content = extract_content(&line, argc).unwrap_or_default();
                    self.set_variable(&names, &content, file_level);
                }
                _ => {
                    let msg = format!("Line {}: Invalid format for \"setvar\"", self.linenum());
                    self.error(msg);
                }
            }
            return Ok(true);
        }

        if let Some(name) = phrases[0].strip_prefix("setvar:") {
            if !name.is_empty() {
                self.check_enough_args(&phrases, 2, "", false)?;
                let content = extract_content(&line, 1).unwrap_or_default();
                self.set_variable(&[name.to_string()], &content, file_level);
                return Ok(true);
            }
        }

        if phrases[0] == "(set_options)" || phrases[0] == "set_options" {
            self.check_enough_args(&phrases, 2, "", true)?;
            self.set_global_options(&phrases[1..], file_level);
            return Ok(true);
        }

        if phrases[0] == "(enable_subst)" {
            self.check_extra_args(&phrases, 1, "", true)?;
            let words: Vec<String> = options::subst_options()
                .iter()
                .map(|o| (*o).to_string())
                .collect();
            self.set_global_options(&words, file_level);
            return Ok(true);
        }

        if phrases[0] == "(disable_subst)" {
            self.check_extra_args(&phrases, 1, "", true)?;
            let words: Vec<String> = options::subst_options()
                .iter()
                .map(|o| format!("no{o}"))
                .collect();
            self.set_global_options(&words, file_level);
            return Ok(true);
        }

        Ok(false)
    }

    // ---- block input ----------------------------------------------------

    /// Collect lines until one whose first field equals `end_phrase`.
    ///
    /// Leading indentation common to all non-empty lines is removed when
    /// `preserve_indents` (tabs measured as 8 columns); a leading
    /// `\end_phrase` escape drops one backslash. Options on the end-phrase
    /// line post-process every collected line.
    pub fn block_input_lines(
        &mut self,
        preserve_indents: bool,
        preserve_empty_lines: bool,
        end_phrase: &str,
        disallow_other_options: bool,
        disable_char_subst: bool,
    ) -> Result<Vec<String>, SyntaxAbort> {
        let mut minspaces = usize::MAX;
        let mut collected: Vec<String> = Vec::new();
        let begin_line_number = self.linenum() + 1;
        let escape_re =
            Regex::new(&format!(r"^\\(\\*){}", crate::strutil::regex_escape(end_phrase))).unwrap();
        let mut terminated = false;

        while self.lineindex < self.lines.len() as isize - 1 {
            self.lineindex += 1;
            let line = self.current_line();
            if line.trim().is_empty() {
                if preserve_empty_lines {
                    collected.push(String::new());
                }
                continue;
            }
            if line.split_whitespace().next() == Some(end_phrase) {
                terminated = true;
                break;
            }

            let unescape = |rest: &str| -> String {
                escape_re
                    .replace(rest, |caps: &regex::Captures<'_>| {
                        format!("{}{}", &caps[1], end_phrase)
                    })
                    .into_owned()
            };

            let stored = if preserve_indents {
                let ws_end = line
                    .find(|c| c != ' ' && c != '\t')
                    .unwrap_or(line.len());
                let expanded_ws = line[..ws_end].replace('\t', "        ");
                minspaces = minspaces.min(expanded_ws.len());
                format!("{expanded_ws}{}", unescape(line.trim_start()))
            } else {
                unescape(line.trim_start())
            };
            collected.push(stored.trim_end().to_string());
        }

        if !terminated {
            let msg = format!("Line {}: Unterminated content block", begin_line_number - 1);
            return Err(self.syntax_error(msg));
        }
        if collected.is_empty() {
            return Ok(collected);
        }

        if preserve_indents && minspaces > 0 && minspaces != usize::MAX {
            for line in &mut collected {
                if line.len() >= minspaces {
                    *line = line[minspaces..].to_string();
                }
            }
        }

        let mut got_options = self.global_options.clone();
        let end_parts = self.current_phrases();
        if end_parts.len() > 1 {
            let opt_words = end_parts[1..].to_vec();
            if !disallow_other_options {
                let mut ban: Vec<&str> = Vec::new();
                if !preserve_indents {
                    ban.extend_from_slice(&options::LEAD_INDENT_OPTIONS);
                }
                if disable_char_subst {
                    ban.extend_from_slice(&options::CHAR_SUBST_OPTIONS);
                }
                let ban_ref = if ban.is_empty() { None } else { Some(ban.as_slice()) };
                got_options = self.parse_options(&opt_words, MergeScope::Section, None, ban_ref);
            } else {
                let mut allowed: Vec<&str> = Vec::new();
                if preserve_indents {
                    allowed.extend_from_slice(&options::LEAD_INDENT_OPTIONS);
                }
                if !disable_char_subst {
                    allowed.extend_from_slice(&options::CHAR_SUBST_OPTIONS);
                }
                allowed.extend_from_slice(&options::CONTENT_SUBST_OPTIONS);
                got_options =
                    self.parse_options(&opt_words, MergeScope::Section, Some(&allowed), None);
            }
        }

        for x in 0..collected.len() {
            let mut line = collected[x].clone();
            let debug_line = begin_line_number + x;

            if preserve_indents {
                if let Some(tabs) = options::get_int(&got_options, "leadtabindents") {
                    let tabs = usize::try_from(tabs).unwrap_or(0);
                    line = format!("{}{line}", "\t".repeat(tabs));
                }
                if let Some(spaces) = options::get_int(&got_options, "leadspaces") {
                    let spaces = usize::try_from(spaces).unwrap_or(0);
                    line = format!("{}{line}", " ".repeat(spaces));
                }
            }

            let ws_end = line.find(|c| c != ' ' && c != '\t').unwrap_or(line.len());
            let leading = line[..ws_end].to_string();
            let stripped = line.trim().to_string();
            let (bounded, _) = self.handle_linebounds(
                &stripped,
                Some(options::is_true(&got_options, "linebounds")),
                preserve_indents,
                false,
                Some(debug_line),
                false,
            );
            line = format!("{leading}{bounded}");

            let debug = debug_line.to_string();
            line = self.handle_subst(
                &line,
                Some(&debug),
                false,
                Some(options::is_true(&got_options, "substvar")),
                Some(options::is_true(&got_options, "substesc") && !disable_char_subst),
                Some(options::is_true(&got_options, "substchar") && !disable_char_subst),
            );
            collected[x] = line;
        }

        Ok(collected)
    }

    /// As [`Self::block_input_lines`], joined with `separator`.
    pub fn block_input(
        &mut self,
        preserve_indents: bool,
        preserve_empty_lines: bool,
        end_phrase: &str,
        separator: &str,
        disallow_other_options: bool,
        disable_char_subst: bool,
    ) -> Result<String, SyntaxAbort> {
        let lines = self.block_input_lines(
            preserve_indents,
            preserve_empty_lines,
            end_phrase,
            disallow_other_options,
            disable_char_subst,
        )?;
        Ok(lines.join(separator))
    }
}

/// Random identifier for rule rows; unique per entry within a pass.
pub fn gen_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Match `<keyword-with-bracket>...]:` at the start of `line`, where the
/// closing `]:` must end the token (followed by whitespace or nothing).
/// Returns the matched prefix and the bracket body.
pub fn bracket_directive<'a>(line: &'a str, keyword: &str) -> Option<(&'a str, &'a str)> {
    let rest = line.strip_prefix(keyword)?;
    let mut search_from = 0;
    while let Some(pos) = rest[search_from..].find("]:") {
        let abs = search_from + pos;
        let after = &rest[abs + 2..];
        if after.is_empty() || after.starts_with(char::is_whitespace) {
            if abs == 0 {
                search_from = abs + 1;
                continue;
            }
            return Some((&line[..keyword.len() + abs + 2], &rest[..abs]));
        }
        search_from = abs + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn generator(source: &str) -> (Generator, TempDir) {
        let dir = TempDir::new().unwrap();
        let gen = Generator::new(source, "1", "test.clitheme", &dir.path().join("out"), true)
            .unwrap();
        (gen, dir)
    }

    #[test]
    fn cursor_skips_blanks_and_comments() {
        let (mut gen, _dir) = generator("# comment\n\nfirst\n  # more\nsecond\n");
        assert!(gen.goto_next_line());
        assert_eq!(gen.current_line(), "first");
        assert_eq!(gen.linenum(), 3);
        assert!(gen.goto_next_line());
        assert_eq!(gen.current_line(), "second");
        assert!(!gen.goto_next_line());
    }

    #[test]
    fn crlf_sources_are_normalized() {
        let (mut gen, _dir) = generator("one\r\ntwo\r\n");
        gen.goto_next_line();
        assert_eq!(gen.current_line(), "one");
    }

    #[test]
    fn version_gate() {
        let (mut gen, _dir) = generator("!require_version 2.1\n");
        gen.goto_next_line();
        assert!(gen.check_version("2.1").is_ok());
        assert!(gen.check_version("2.0").is_ok());
        assert!(gen.check_version("2.9").is_err());
        assert!(gen.check_version("3.0").is_err());
        assert!(gen.check_version("1.0").is_err());
        assert!(gen.check_version("nonsense").is_err());
        // A beta requirement on the same version is satisfied by a stable
        // build of that version.
        assert!(gen.check_version("2.1-beta2").is_ok());
    }

    #[test]
    fn variable_substitution_round_trip() {
        let (mut gen, _dir) = generator("placeholder\n");
        gen.goto_next_line();
        gen.set_variable(&["g".to_string()], "hi", false);
        let words = vec!["substvar".to_string()];
        gen.set_global_options(&words, false);
        let out = gen.parse_content("{{g}} there", ContentMode::Content, None, false);
        assert_eq!(out, "hi there");
    }

    #[test]
    fn unknown_variable_stays_literal_and_warns_once() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        let words = vec!["substvar".to_string()];
        gen.set_global_options(&words, false);
        let out = gen.handle_subst("{{nope}} {{nope}}", None, false, Some(true), None, None);
        assert_eq!(out, "{{nope}} {{nope}}");
        let warnings: Vec<&String> = gen
            .files
            .messages
            .iter()
            .filter(|m| m.contains("Unknown variable"))
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn esc_and_char_substitution() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        let out = gen.handle_subst(
            "{{ESC}}[1m {{[x41]}} {{[u4e2d]}} {{[U0001F600]}}",
            None,
            false,
            Some(false),
            Some(true),
            Some(true),
        );
        assert_eq!(out, "\x1b[1m A 中 😀");
    }

    #[test]
    fn invalid_char_code_warns_and_keeps_literal() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        let out = gen.handle_subst("{{[xzz]}} {{[q1]}}", None, false, Some(false), Some(false), Some(true));
        assert_eq!(out, "{{[xzz]}} {{[q1]}}");
        assert!(gen
            .files
            .messages
            .iter()
            .any(|m| m.contains("Invalid character code")));
        assert!(gen
            .files
            .messages
            .iter()
            .any(|m| m.contains("Invalid substchar format")));
    }

    #[test]
    fn disabled_feature_use_warns() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        gen.set_variable(&["v".to_string()], "set", false);
        gen.handle_subst("{{v}}", None, false, Some(false), Some(false), Some(false));
        assert!(gen
            .files
            .messages
            .iter()
            .any(|m| m.contains("\"substvar\" option is not enabled")));
    }

    #[test]
    fn linebounds_extraction() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        let (text, opts) = gen.handle_linebounds("|  keep me  |", Some(true), true, true, None, false);
        assert_eq!(text, "  keep me  ");
        assert_eq!(opts, "");
        let (text, opts) =
            gen.handle_linebounds("| spaced | substvar", Some(true), false, true, None, false);
        assert_eq!(text, "spaced");
        assert_eq!(opts, "substvar");
        // Off: returned untouched.
        let (text, _) = gen.handle_linebounds("|x|", Some(false), true, true, None, false);
        assert_eq!(text, "|x|");
    }

    #[test]
    fn option_parsing_values_bools_switches() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        let words: Vec<String> = ["leadspaces:4", "substvar", "nosubstesc", "exactcmdmatch"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = gen.parse_options(&words, MergeScope::Inline, None, None);
        assert_eq!(options::get_int(&map, "leadspaces"), Some(4));
        assert!(options::is_true(&map, "substvar"));
        assert_eq!(map.get("substesc"), Some(&OptionValue::Flag(false)));
        assert!(options::is_true(&map, "exactcmdmatch"));
        assert!(!options::is_true(&map, "strictcmdmatch"));
        assert!(gen.files.success);
    }

    #[test]
    fn switch_conflict_is_an_error() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        let words: Vec<String> = ["strictcmdmatch", "exactcmdmatch"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = gen.parse_options(&words, MergeScope::Inline, None, None);
        assert!(gen
            .files
            .messages
            .iter()
            .any(|m| m.contains("can't be set at the same time")));
        // Last one still wins.
        assert!(options::is_true(&map, "exactcmdmatch"));
        assert!(!options::is_true(&map, "strictcmdmatch"));
    }

    #[test]
    fn repeated_option_diagnostics_are_deduplicated() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        let words = vec!["bogusoption".to_string()];
        gen.parse_options(&words, MergeScope::Inline, None, None);
        gen.parse_options(&words, MergeScope::Inline, None, None);
        let count = gen
            .files
            .messages
            .iter()
            .filter(|m| m.contains("Unknown option"))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn setvar_setter_both_forms() {
        let (mut gen, _dir) = generator("setvar[a b]: shared value\nsetvar:c old form\n");
        gen.goto_next_line();
        assert!(gen.handle_setters(false).unwrap());
        assert_eq!(gen.global_variables.get("a").map(String::as_str), Some("shared value"));
        assert_eq!(gen.global_variables.get("b").map(String::as_str), Some("shared value"));
        gen.goto_next_line();
        assert!(gen.handle_setters(false).unwrap());
        assert_eq!(gen.global_variables.get("c").map(String::as_str), Some("old form"));
    }

    #[test]
    fn invalid_variable_names_are_rejected() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        gen.set_variable(&["ESC".to_string(), "ok".to_string(), "ba[d".to_string()], "v", false);
        assert!(!gen.files.success);
        assert!(gen.global_variables.contains_key("ok"));
        assert!(!gen.global_variables.contains_key("ESC"));
        assert!(!gen.global_variables.contains_key("ba[d"));
    }

    #[test]
    fn file_scope_survives_section_boundaries() {
        let (mut gen, _dir) = generator("x\n");
        gen.goto_next_line();
        let words = vec!["substvar".to_string()];
        gen.set_global_options(&words, true);
        gen.set_variable(&["v".to_string()], "kept", true);
        gen.begin_section("header");
        assert!(options::is_true(&gen.global_options, "substvar"));
        assert_eq!(gen.global_variables.get("v").map(String::as_str), Some("kept"));

        // Section-only state resets at the boundary.
        let words = vec!["substesc".to_string()];
        gen.set_global_options(&words, false);
        gen.set_variable(&["local".to_string()], "gone", false);
        gen.end_section("header");
        assert!(!options::is_true(&gen.global_options, "substesc"));
        assert!(!gen.global_variables.contains_key("local"));
    }

    #[test]
    fn block_input_collects_until_end_phrase() {
        let (mut gen, _dir) = generator("[block]\nline one\n\nline two\n[/block]\n");
        gen.goto_next_line();
        let lines = gen
            .block_input_lines(false, true, "[/block]", true, false)
            .unwrap();
        assert_eq!(lines, vec!["line one", "", "line two"]);
    }

    #[test]
    fn block_input_strips_common_indent_with_tab_expansion() {
        let (mut gen, _dir) = generator("[b]\n    four\n\tone tab\n      six\n[/b]\n");
        gen.goto_next_line();
        let lines = gen.block_input_lines(true, false, "[/b]", true, false).unwrap();
        assert_eq!(lines, vec!["four", "    one tab", "  six"]);
    }

    #[test]
    fn block_input_unescapes_end_phrase() {
        let (mut gen, _dir) = generator("[b]\n\\[/b] kept\n\\\\[/b] kept\n[/b]\n");
        gen.goto_next_line();
        let lines = gen.block_input_lines(false, false, "[/b]", true, false).unwrap();
        assert_eq!(lines, vec!["[/b] kept", "\\[/b] kept"]);
    }

    #[test]
    fn unterminated_block_aborts() {
        let (mut gen, _dir) = generator("[b]\ncontent\n");
        gen.goto_next_line();
        let err = gen.block_input_lines(false, false, "[/b]", true, false);
        assert!(err.is_err());
        assert!(gen
            .files
            .messages
            .iter()
            .any(|m| m.contains("Unterminated content block")));
    }

    #[test]
    fn block_end_options_postprocess_lines() {
        let (mut gen, _dir) = generator("[b]\n{{v}}\n[/b] substvar\n");
        gen.goto_next_line();
        gen.set_variable(&["v".to_string()], "value", false);
        let lines = gen.block_input_lines(true, false, "[/b]", true, false).unwrap();
        assert_eq!(lines, vec!["value"]);
    }

    #[test]
    fn bracket_directive_boundaries() {
        assert_eq!(
            bracket_directive("setvar[a b]: v", "setvar["),
            Some(("setvar[a b]:", "a b"))
        );
        assert_eq!(bracket_directive("setvar[a]:v", "setvar["), None);
        assert_eq!(bracket_directive("setvar[a] :", "setvar["), None);
        assert_eq!(
            bracket_directive("locale[fr_FR]: bonjour", "locale["),
            Some(("locale[fr_FR]:", "fr_FR"))
        );
    }
}
