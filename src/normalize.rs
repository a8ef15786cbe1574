//! Diagnostic normalization
//!
//! Turns one raw compiler message into a [`Fingerprint`]: a comparable key
//! that survives superficial churn (line numbers, file paths, generated
//! identifier names, whitespace) while keeping the text that tells two root
//! causes apart (symbol names, error codes, punctuation tokens).

use crate::categorize::is_known_symbol;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Normalized, comparable form of a diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Placeholder for a quoted identifier that only exists in this session.
pub const IDENT_PLACEHOLDER: &str = "<id>";
/// Placeholder for a quoted numeric literal.
pub const NUMBER_PLACEHOLDER: &str = "<num>";

fn file_location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"[\w./\\:-]+\.\w+\s*\(\s*\d+\s*,\s*\d+\s*\)|[\w./\\:-]+\.\w+:\d+(?::\d+)?:?",
        )
        .expect("file location regex")
    })
}

fn paren_location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(\s*\d+\s*,\s*\d+\s*\)").expect("paren location regex"))
}

fn line_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:\b(?:at|on|in)\s+)?\b(?:line|ln)\s*:?\s*\d+(?:\s*[,:]\s*(?:col(?:umn)?\s*:?\s*)?\d+)?",
        )
        .expect("line reference regex")
    })
}

fn column_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bcol(?:umn)?\s*:?\s*\d+").expect("column reference regex"))
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"'([^'\n]*)'|"([^"\n]*)"|`([^`\n]*)`"#).expect("quoted token regex")
    })
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

/// Normalize a raw diagnostic into its fingerprint.
///
/// Pure and idempotent: `normalize(normalize(x).as_str()) == normalize(x)`.
///
/// A pass can expose a new match (e.g. "line line 4 5"), so passes repeat
/// until the text is a fixed point. Every pass only removes text, apart from
/// quoted-token placeholders, which are stable once substituted.
pub fn normalize(raw: &str) -> Fingerprint {
    let mut current = normalize_pass(raw);
    loop {
        let next = normalize_pass(&current);
        if next == current {
            return Fingerprint(current);
        }
        current = next;
    }
}

fn normalize_pass(input: &str) -> String {
    let lowered = input.to_lowercase();
    let text = file_location_re().replace_all(&lowered, " ");
    let text = paren_location_re().replace_all(&text, " ");
    let text = line_ref_re().replace_all(&text, " ");
    let text = column_ref_re().replace_all(&text, " ");
    let text = quoted_re().replace_all(&text, |caps: &Captures| replace_quoted(caps));
    let text = whitespace_re().replace_all(&text, " ");
    text.trim_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '-' | ','))
        .to_string()
}

fn replace_quoted(caps: &Captures) -> String {
    let (quote, content) = if let Some(m) = caps.get(1) {
        ('\'', m.as_str())
    } else if let Some(m) = caps.get(2) {
        ('"', m.as_str())
    } else if let Some(m) = caps.get(3) {
        ('`', m.as_str())
    } else {
        return caps[0].to_string();
    };

    let replacement = classify_quoted(content);
    format!("{quote}{replacement}{quote}")
}

/// Decide whether a quoted token is session noise or discriminating text.
fn classify_quoted(content: &str) -> &str {
    let has_digit = content.chars().any(|c| c.is_ascii_digit());
    if !has_digit {
        return content;
    }
    if content.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return NUMBER_PLACEHOLDER;
    }
    if is_identifier(content) && !is_known_symbol(content) {
        return IDENT_PLACEHOLDER;
    }
    content
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generated_identifiers_and_lines_collapse() {
        let a = normalize("'ticket123' undeclared identifier at line 45");
        let b = normalize("'ticket987' undeclared identifier at line 12");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "'<id>' undeclared identifier");
    }

    #[test]
    fn different_root_causes_stay_apart() {
        let undeclared = normalize("'ticket123' undeclared identifier at line 45");
        let paren = normalize("expected ')' at line 45");
        assert_ne!(undeclared, paren);
        assert_eq!(paren.as_str(), "expected ')'");
    }

    #[test]
    fn symbol_names_are_kept() {
        let a = normalize("'OnTick' - function not defined");
        let b = normalize("'OnInit' - function not defined");
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "'ontick' - function not defined");

        let deprecated = normalize("'MarketInfo' - undeclared identifier");
        let generated = normalize("'lot7' - undeclared identifier");
        assert_ne!(deprecated, generated);
    }

    #[test]
    fn file_locations_and_codes() {
        let a = normalize(r"C:\tmp\ea_51f2.mq5(45,12) : error 256: 'x' - undeclared identifier");
        let b = normalize("/tmp/evoloop/ea_9a.mq5(3,1) : error 256: 'x' - undeclared identifier");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "error 256: 'x' - undeclared identifier");

        let other_code = normalize("ea.mq5(3,1) : error 199: 'x' - undeclared identifier");
        assert_ne!(a, other_code);
    }

    #[test]
    fn gcc_style_locations() {
        let a = normalize("src/main.c:12:5: error: expected ';' before 'return'");
        let b = normalize("src/main.c:98:1: error: expected ';' before 'return'");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "error: expected ';' before 'return'");
    }

    #[test]
    fn whitespace_and_case_are_irrelevant() {
        let a = normalize("  Expected   ')'\tat LINE 4 ");
        let b = normalize("expected ')' at line 99");
        assert_eq!(a, b);
    }

    #[test]
    fn quoted_numbers_collapse() {
        let a = normalize("array index '12' out of range");
        let b = normalize("array index '3' out of range");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "array index '<num>' out of range");
    }

    #[test]
    fn deprecated_symbols_survive_verbatim() {
        assert_eq!(
            normalize("'OP_BUY' - undeclared identifier").as_str(),
            "'op_buy' - undeclared identifier"
        );
    }

    #[test]
    fn pathological_nesting_is_idempotent() {
        let once = normalize("line line 1 2");
        assert_eq!(normalize(once.as_str()), once);
    }

    #[test]
    fn deeply_nested_line_references_reach_a_fixed_point() {
        let numbers: Vec<String> = (1..=12).map(|n| n.to_string()).collect();
        let raw = format!("{}{}", "line ".repeat(12), numbers.join(" "));
        let once = normalize(&raw);
        assert_eq!(normalize(once.as_str()), once);
        assert!(once.is_empty());

        let deeper = format!("expected ';' {}{}", "at line ".repeat(40), "7 ".repeat(40));
        let once = normalize(&deeper);
        assert_eq!(normalize(once.as_str()), once);
        assert_eq!(once.as_str(), "expected ';'");
    }

    fn diagnostic_like() -> impl Strategy<Value = String> {
        let file = prop_oneof![
            Just(String::new()),
            "[a-z]{1,6}\\.(mq5|c|rs)\\([0-9]{1,3},[0-9]{1,2}\\) : ",
            "[a-z]{1,6}\\.(c|rs):[0-9]{1,3}:[0-9]{1,2}: ",
        ];
        let ident = prop_oneof![
            "[a-z_]{1,8}[0-9]{0,4}",
            Just("MarketInfo".to_string()),
            Just(")".to_string()),
            Just(";".to_string()),
        ];
        let body = prop_oneof![
            Just("undeclared identifier".to_string()),
            Just("expected".to_string()),
            Just("function not defined".to_string()),
            Just("wrong parameters count".to_string()),
        ];
        let tail = prop_oneof![
            Just(String::new()),
            "at line [0-9]{1,4}",
            "line [0-9]{1,3}, col [0-9]{1,3}",
        ];
        (file, ident, body, tail)
            .prop_map(|(f, i, b, t)| format!("{f}error 256: '{i}' - {b} {t}"))
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(raw in "[ -~]{0,80}") {
            let once = normalize(&raw);
            prop_assert_eq!(normalize(once.as_str()), once);
        }

        #[test]
        fn normalization_is_idempotent_on_diagnostics(raw in diagnostic_like()) {
            let once = normalize(&raw);
            prop_assert_eq!(normalize(once.as_str()), once);
        }

        #[test]
        fn line_numbers_never_matter(line_a in 1u32..5000, line_b in 1u32..5000, col in 1u32..80) {
            let a = normalize(&format!("ea.mq5({line_a},{col}) : error 100: expected ';' at line {line_a}"));
            let b = normalize(&format!("ea.mq5({line_b},{col}) : error 100: expected ';' at line {line_b}"));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn generated_suffixes_never_matter(stem in "[a-z]{1,6}", n1 in 0u32..100000, n2 in 0u32..100000) {
            let a = normalize(&format!("'{stem}{n1}' - undeclared identifier"));
            let b = normalize(&format!("'{stem}{n2}' - undeclared identifier"));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn distinct_symbols_stay_distinct(a in "[a-z]{2,8}", b in "[a-z]{2,8}") {
            prop_assume!(a != b);
            let fa = normalize(&format!("'{a}' - function not defined"));
            let fb = normalize(&format!("'{b}' - function not defined"));
            prop_assert_ne!(fa, fb);
        }
    }
}
