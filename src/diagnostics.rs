//! Compiler output parsing
//!
//! Pulls error lines out of raw compiler output and attaches a fingerprint,
//! a tier, and (when the compiler gives one) the line it points at.

use crate::categorize::{categorize, Tier};
use crate::normalize::{normalize, Fingerprint};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// One error message as the compiler printed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDiagnostic {
    pub message: String,
    /// 1-based source line, when the message carries one
    pub line: Option<usize>,
}

impl RawDiagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let line = extract_line(&message);
        Self { message, line }
    }
}

/// A diagnostic after normalization and categorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedDiagnostic {
    pub message: String,
    pub fingerprint: Fingerprint,
    pub tier: Tier,
    pub line: Option<usize>,
}

impl From<&RawDiagnostic> for ObservedDiagnostic {
    fn from(raw: &RawDiagnostic) -> Self {
        let fingerprint = normalize(&raw.message);
        let tier = categorize(&fingerprint).tier;
        Self {
            message: raw.message.clone(),
            fingerprint,
            tier,
            line: raw.line,
        }
    }
}

pub fn observe(raw: &[RawDiagnostic]) -> Vec<ObservedDiagnostic> {
    raw.iter().map(ObservedDiagnostic::from).collect()
}

/// Distinct fingerprints in a batch.
pub fn fingerprint_set(diagnostics: &[ObservedDiagnostic]) -> BTreeSet<Fingerprint> {
    diagnostics.iter().map(|d| d.fingerprint.clone()).collect()
}

/// Fingerprint -> number of diagnostics carrying it.
pub fn fingerprint_counts(diagnostics: &[ObservedDiagnostic]) -> BTreeMap<Fingerprint, u32> {
    let mut counts = BTreeMap::new();
    for diagnostic in diagnostics {
        *counts.entry(diagnostic.fingerprint.clone()).or_insert(0) += 1;
    }
    counts
}

fn paren_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((\d+)\s*,\s*\d+\)").expect("paren line regex"))
}

fn colon_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.\w+:(\d+):\d+").expect("colon line regex"))
}

fn word_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bline\s*:?\s*(\d+)").expect("word line regex"))
}

fn summary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:result:?\s*)?\d+\s+errors?\b(?:,\s*\d+\s+warnings?)?")
            .expect("summary regex")
    })
}

/// 1-based line a message points at, if it says.
pub fn extract_line(message: &str) -> Option<usize> {
    [paren_line_re(), colon_line_re(), word_line_re()]
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .filter(|line| *line > 0)
}

const ERROR_MARKERS: &[&str] = &[
    "error",
    "failed",
    "expected",
    "undeclared",
    "undefined",
    "not defined",
    "unexpected",
];

/// Error lines from compiler output, in order. Warnings and summary lines
/// are dropped.
pub fn parse_output(output: &str) -> Vec<RawDiagnostic> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            let lower = line.to_lowercase();
            if lower.contains("warning") && !lower.contains("error") {
                return false;
            }
            if summary_re().is_match(line) {
                return false;
            }
            ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .map(RawDiagnostic::new)
        .collect()
}
