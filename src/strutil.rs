//! Small string helpers shared by the parser and the rewriter.

/// Split on runs of whitespace, discarding empty fields.
pub fn split_words(s: &str) -> Vec<&str> {
    s.split_whitespace().collect()
}

/// Remainder of the trimmed line after skipping `count` whitespace-separated
/// fields. Returns `None` when the line has no content past those fields.
pub fn extract_content(line: &str, count: usize) -> Option<String> {
    let mut rest = line.trim();
    for _ in 0..count {
        let cut = rest.find(char::is_whitespace)?;
        rest = rest[cut..].trim_start();
        if rest.is_empty() {
            return None;
        }
    }
    Some(rest.to_string())
}

/// Render a string for diagnostics: bytes that are neither printable ASCII
/// nor ordinary whitespace become `<0xHH>`.
pub fn make_printable(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for &b in content.as_bytes() {
        if (0x20..0x7f).contains(&b) || b.is_ascii_whitespace() {
            out.push(b as char);
        } else {
            out.push_str(&format!("<0x{b:02x}>"));
        }
    }
    out
}

/// UTF-8 encoding for a Unicode scalar value; `None` for surrogates and
/// codepoints above 0x10FFFF.
pub fn codepoint_to_utf8(cp: u32) -> Option<String> {
    char::from_u32(cp).map(String::from)
}

/// Escape a literal so that it matches itself when compiled as a pattern.
///
/// Control whitespace is spelled as a textual escape so the escaped form
/// stays printable and always compiles.
pub fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    for ch in s.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\x0B"),
            '\x0c' => out.push_str("\\x0C"),
            ' ' => out.push_str("\\ "),
            '-' | '[' | ']' | '{' | '}' | '(' | ')' | '*' | '+' | '?' | '.' | ',' | '\\'
            | '^' | '$' | '|' | '#' => {
                out.push('\\');
                out.push(ch);
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_content_skips_fields() {
        assert_eq!(extract_content("  a  b c ", 1).as_deref(), Some("b c"));
        assert_eq!(extract_content("a b c", 2).as_deref(), Some("c"));
        assert_eq!(extract_content("a", 1), None);
        assert_eq!(extract_content("a b", 2), None);
    }

    #[test]
    fn make_printable_escapes_control_bytes() {
        assert_eq!(make_printable("ok\ttab"), "ok\ttab");
        assert_eq!(make_printable("\x1b[1m"), "<0x1b>[1m");
        assert_eq!(make_printable("é"), "<0xc3><0xa9>");
    }

    #[test]
    fn codepoint_encoding() {
        assert_eq!(codepoint_to_utf8(0x41).as_deref(), Some("A"));
        assert_eq!(codepoint_to_utf8(0x1b).as_deref(), Some("\x1b"));
        assert_eq!(codepoint_to_utf8(0x4e2d).as_deref(), Some("中"));
        assert_eq!(codepoint_to_utf8(0x1F600).as_deref(), Some("😀"));
        assert_eq!(codepoint_to_utf8(0xD800), None);
        assert_eq!(codepoint_to_utf8(0x110000), None);
    }

    #[test]
    fn escaped_literal_matches_itself() {
        for sample in ["a+b", "x*y?", "line1\nline2", "1-2.3|4", "tab\there", "a b"] {
            let escaped = regex_escape(sample);
            let re = regex::Regex::new(&format!("^{escaped}$")).unwrap();
            assert!(re.is_match(sample), "escape failed for {sample:?}");
        }
    }
}
