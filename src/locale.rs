//! Locale candidate resolution.
//!
//! Produces the ordered list of locale names the rule store tries when
//! fetching translated rows. Candidates come from `LANGUAGE`, `LC_ALL` and
//! `LANG`; each one contributes both its full form and its
//! encoding-stripped form (`xx_YY.UTF-8` also yields `xx_YY`).

use std::env;

use tracing::debug;

use crate::sanity;

/// Ordered locale candidates from the process environment.
pub fn locale_candidates() -> Vec<String> {
    candidates_from(
        env::var("LANGUAGE").ok().as_deref(),
        env::var("LC_ALL").ok().as_deref(),
        env::var("LANG").ok().as_deref(),
    )
}

/// Strip a trailing `.ENCODING` suffix, if any.
fn without_encoding(locale: &str) -> &str {
    match locale.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < locale.len() => &locale[..idx],
        _ => locale,
    }
}

/// Core of the resolver, fed explicit variable values so it can be tested.
pub fn candidates_from(
    language: Option<&str>,
    lc_all: Option<&str>,
    lang: Option<&str>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    let mut add = |candidate: &str| {
        if let Err(reason) = sanity::check(candidate) {
            debug!(candidate, %reason, "dropping locale candidate");
            return;
        }
        let stripped = without_encoding(candidate);
        if !out.iter().any(|l| l == candidate) {
            out.push(candidate.to_string());
        }
        if !out.iter().any(|l| l == stripped) {
            out.push(stripped.to_string());
        }
    };

    let lang_value = lang.filter(|v| !v.is_empty()).unwrap_or("C");
    let lc_all_value = lc_all.filter(|v| !v.is_empty()).unwrap_or("C");
    let is_c = |v: &str| v == "C" || v.starts_with("C.");
    let skip_language = is_c(lang_value) && is_c(lc_all_value);

    let language = language.unwrap_or("");
    let lc_all = lc_all.unwrap_or("");
    let lang = lang.unwrap_or("");

    if !language.trim().is_empty() && !skip_language {
        debug!("using LANGUAGE variable");
        for each in language.split(':').map(str::trim) {
            if each.is_empty() || each == "en" || each == "en_US" {
                continue;
            }
            // The C locale stands in for American English.
            if without_encoding(each) == "C" {
                for alias in ["en_US", "en"] {
                    match each.find('.') {
                        Some(dot) => add(&format!("{alias}{}", &each[dot..])),
                        None => add(alias),
                    }
                }
            }
            add(each);
        }
    } else if !lc_all.trim().is_empty() {
        debug!("using LC_ALL variable");
        add(lc_all.trim());
    } else if !lang.trim().is_empty() {
        debug!("using LANG variable");
        add(lang.trim());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_order_with_encoding_stripped_forms() {
        let got = candidates_from(Some("zh_CN.UTF-8:ja_JP"), None, Some("zh_CN.UTF-8"));
        assert_eq!(got, vec!["zh_CN.UTF-8", "zh_CN", "ja_JP"]);
    }

    #[test]
    fn english_entries_are_suppressed() {
        let got = candidates_from(Some("en:en_US:fr_FR"), None, Some("fr_FR.UTF-8"));
        assert_eq!(got, vec!["fr_FR"]);
    }

    #[test]
    fn language_ignored_under_c_locale() {
        let got = candidates_from(Some("de_DE"), Some("C"), Some("C"));
        assert!(got.is_empty());
        let got = candidates_from(Some("de_DE"), Some("C.UTF-8"), None);
        assert!(got.is_empty());
    }

    #[test]
    fn lc_all_beats_lang() {
        let got = candidates_from(None, Some("it_IT.UTF-8"), Some("es_ES"));
        assert_eq!(got, vec!["it_IT.UTF-8", "it_IT"]);
    }

    #[test]
    fn lang_is_last_resort() {
        let got = candidates_from(None, None, Some("es_ES.ISO-8859-1"));
        assert_eq!(got, vec!["es_ES.ISO-8859-1", "es_ES"]);
    }

    #[test]
    fn c_language_entry_aliases_to_english() {
        let got = candidates_from(Some("C.UTF-8:de_DE"), None, Some("de_DE"));
        assert_eq!(
            got,
            vec!["en_US.UTF-8", "en_US", "en.UTF-8", "en", "C.UTF-8", "C", "de_DE"]
        );
    }

    #[test]
    fn unsane_candidates_are_dropped() {
        let got = candidates_from(Some("fr_FR:../evil"), None, Some("fr_FR"));
        assert_eq!(got, vec!["fr_FR"]);
    }
}
