//! Incremental fixing
//!
//! Applies a small number of targeted line edits to the current source,
//! measures how far the result drifted from the baseline, and decides whether
//! a re-compiled candidate is kept or rolled back. A fixed candidate is never
//! kept if it is worse than what it started from.

use crate::categorize::Tier;
use crate::diagnostics::{fingerprint_set, ObservedDiagnostic};
use crate::diff;
use crate::normalize::Fingerprint;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use uuid::Uuid;

/// A line-local rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FixAction {
    /// Append a terminator or closing delimiter to the line
    Append { suffix: String },
    /// Replace the first whole-word occurrence of `find`
    Replace { find: String, replace: String },
}

const CLOSERS: &[(char, char)] = &[('(', ')'), ('{', '}'), ('[', ']')];

impl FixAction {
    /// Rewritten line, or `None` when the action does not apply to it.
    pub fn apply(&self, line: &str) -> Option<String> {
        match self {
            FixAction::Append { suffix } => {
                let body = line.trim_end();
                if body.is_empty() || body.ends_with(suffix.as_str()) {
                    return None;
                }
                if let Some((open, close)) = CLOSERS
                    .iter()
                    .find(|(_, close)| suffix.starts_with(*close))
                {
                    let opened = body.matches(*open).count();
                    let closed = body.matches(*close).count();
                    if opened <= closed {
                        return None;
                    }
                }
                let trailing = &line[body.len()..];
                Some(format!("{body}{suffix}{trailing}"))
            }
            FixAction::Replace { find, replace } => {
                if find.is_empty() {
                    return None;
                }
                let re = word_regex(find)?;
                let m = re.find(line)?;
                let mut fixed = String::with_capacity(line.len() + replace.len());
                fixed.push_str(&line[..m.start()]);
                fixed.push_str(replace);
                fixed.push_str(&line[m.end()..]);
                (fixed != line).then_some(fixed)
            }
        }
    }

    /// Action that rewrites `before` into `after`, if the change is a
    /// line-local append or a single word-aligned substitution.
    pub fn infer(before: &str, after: &str) -> Option<FixAction> {
        if before == after {
            return None;
        }
        let candidate = match after.trim_end().strip_prefix(before.trim_end()) {
            Some(rest) if !rest.trim().is_empty() && !before.trim().is_empty() => {
                FixAction::Append {
                    suffix: rest.to_string(),
                }
            }
            _ => {
                let (prefix, suffix) = word_aligned_overlap(before, after);
                let find = &before[prefix..before.len() - suffix];
                if find.trim().is_empty() {
                    return None;
                }
                FixAction::Replace {
                    find: find.to_string(),
                    replace: after[prefix..after.len() - suffix].to_string(),
                }
            }
        };
        (candidate.apply(before).as_deref() == Some(after)).then_some(candidate)
    }

    pub fn describe(&self) -> String {
        match self {
            FixAction::Append { suffix } => format!("append '{suffix}'"),
            FixAction::Replace { find, replace } => format!("replace '{find}' with '{replace}'"),
        }
    }
}

fn word_regex(find: &str) -> Option<Regex> {
    let escaped = regex::escape(find);
    let starts_word = find.chars().next().is_some_and(is_word_char);
    let ends_word = find.chars().last().is_some_and(is_word_char);
    let pattern = format!(
        "{}{}{}",
        if starts_word { r"\b" } else { "" },
        escaped,
        if ends_word { r"\b" } else { "" }
    );
    Regex::new(&pattern).ok()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Byte lengths of the shared prefix and suffix of two lines, shrunk so
/// neither ends inside a word.
fn word_aligned_overlap(a: &str, b: &str) -> (usize, usize) {
    let mut prefix = a
        .char_indices()
        .zip(b.chars())
        .find(|((_, x), y)| x != y)
        .map(|((i, _), _)| i)
        .unwrap_or(a.len().min(b.len()));
    let mut suffix: usize = a
        .chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len_utf8())
        .sum();
    suffix = suffix.min(a.len() - prefix).min(b.len() - prefix);

    let word_at = |s: &str, i: usize| s[i..].chars().next().is_some_and(is_word_char);
    let word_before = |s: &str, i: usize| s[..i].chars().next_back().is_some_and(is_word_char);

    while prefix > 0 && word_before(a, prefix) && (word_at(a, prefix) || word_at(b, prefix)) {
        prefix -= a[..prefix].chars().next_back().map_or(1, char::len_utf8);
    }
    while suffix > 0 {
        let (end_a, end_b) = (a.len() - suffix, b.len() - suffix);
        if word_at(a, end_a) && (word_before(a, end_a) || word_before(b, end_b)) {
            suffix -= a[end_a..].chars().next().map_or(1, char::len_utf8);
        } else {
            break;
        }
    }
    (prefix, suffix)
}

/// Inclusive 1-based line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Region {
    pub start: usize,
    pub end: usize,
}

impl Region {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn line(line: usize) -> Self {
        Self::new(line, line)
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Same region widened by `margin` lines on both sides.
    pub fn widened(&self, margin: usize) -> Region {
        Region::new(self.start.saturating_sub(margin).max(1), self.end + margin)
    }
}

/// Where an edit came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EditOrigin {
    /// A learned template
    Template { id: Uuid },
    /// A categorizer remedy
    Builtin { kind: String },
}

/// A proposed replacement of one region of the baseline source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub fingerprint: Fingerprint,
    pub region: Region,
    /// Text currently in the region; a mismatch at apply time skips the edit
    pub original: String,
    pub replacement: String,
    pub action: FixAction,
    pub confidence: f64,
    pub tier: Tier,
    pub occurrences: u32,
    pub origin: EditOrigin,
}

impl Edit {
    pub fn describe(&self) -> String {
        format!(
            "line {}: {} ({})",
            self.region.start,
            self.action.describe(),
            self.fingerprint
        )
    }
}

/// How far an edited source drifted from its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Impact {
    /// Line similarity in [0, 1]
    pub similarity: f64,
    /// 1 - similarity
    pub change_ratio: f64,
    pub lines_added: usize,
    pub lines_removed: usize,
    /// Changed regions no applied edit accounts for
    pub untargeted_regions: usize,
}

#[derive(Debug, Clone)]
pub struct FixAttempt {
    pub source: String,
    pub applied: Vec<Edit>,
    pub skipped: Vec<Edit>,
    pub impact: Impact,
}

/// What the acceptance rule compares.
#[derive(Debug, Clone, PartialEq)]
pub struct Scorecard {
    pub diagnostic_count: usize,
    pub fingerprints: BTreeSet<Fingerprint>,
    pub quality: f64,
}

impl Scorecard {
    pub fn new(diagnostics: &[ObservedDiagnostic], quality: f64) -> Self {
        Self {
            diagnostic_count: diagnostics.len(),
            fingerprints: fingerprint_set(diagnostics),
            quality,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollbackReason {
    MoreDiagnostics { baseline: usize, candidate: usize },
    NewFingerprints(Vec<Fingerprint>),
    QualityDrop { baseline: f64, candidate: f64 },
    UntargetedChanges(usize),
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackReason::MoreDiagnostics {
                baseline,
                candidate,
            } => write!(f, "diagnostics rose from {baseline} to {candidate}"),
            RollbackReason::NewFingerprints(new) => {
                write!(f, "{} new diagnostic kind(s) introduced", new.len())
            }
            RollbackReason::QualityDrop {
                baseline,
                candidate,
            } => write!(f, "quality fell from {baseline:.2} to {candidate:.2}"),
            RollbackReason::UntargetedChanges(n) => {
                write!(f, "{n} change(s) outside the targeted regions")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    Rollback(Vec<RollbackReason>),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

pub struct IncrementalFixer {
    max_edits: usize,
    tolerance: f64,
}

impl IncrementalFixer {
    pub fn new(max_edits: usize, tolerance: f64) -> Self {
        Self {
            max_edits: max_edits.max(1),
            tolerance,
        }
    }

    /// Pick up to `max_edits` edits: tier first, then occurrence count, then
    /// confidence. Edits that fall outside the source, no longer match it, or
    /// overlap an already selected edit are skipped.
    pub fn select(&self, source: &str, mut edits: Vec<Edit>) -> (Vec<Edit>, Vec<Edit>) {
        let lines: Vec<&str> = source.split('\n').collect();
        edits.sort_by(|a, b| {
            (a.tier, Reverse(a.occurrences))
                .cmp(&(b.tier, Reverse(b.occurrences)))
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| a.region.cmp(&b.region))
        });

        let mut selected: Vec<Edit> = Vec::new();
        let mut skipped = Vec::new();
        for edit in edits {
            let fits = selected.len() < self.max_edits
                && edit.region.start >= 1
                && edit.region.end <= lines.len()
                && lines[edit.region.start - 1..edit.region.end].join("\n") == edit.original
                && !selected.iter().any(|s| s.region.overlaps(&edit.region));
            if fits {
                selected.push(edit);
            } else {
                skipped.push(edit);
            }
        }
        (selected, skipped)
    }

    /// Select and apply edits to `source`. `None` when nothing applies.
    pub fn prepare(&self, source: &str, edits: Vec<Edit>) -> Option<FixAttempt> {
        let (applied, skipped) = self.select(source, edits);
        if applied.is_empty() {
            return None;
        }
        let fixed = apply_edits(source, &applied);
        let impact = measure_impact(source, &fixed, &applied);
        Some(FixAttempt {
            source: fixed,
            applied,
            skipped,
            impact,
        })
    }

    /// Acceptance rule: no more diagnostics than the baseline; strictly fewer
    /// or no new fingerprint; quality no lower than baseline minus tolerance;
    /// and no change outside the edited regions.
    pub fn judge(
        &self,
        baseline: &Scorecard,
        candidate: &Scorecard,
        impact: Option<&Impact>,
    ) -> Verdict {
        judge(baseline, candidate, impact, self.tolerance)
    }
}

pub fn judge(
    baseline: &Scorecard,
    candidate: &Scorecard,
    impact: Option<&Impact>,
    tolerance: f64,
) -> Verdict {
    let mut reasons = Vec::new();

    if candidate.diagnostic_count > baseline.diagnostic_count {
        reasons.push(RollbackReason::MoreDiagnostics {
            baseline: baseline.diagnostic_count,
            candidate: candidate.diagnostic_count,
        });
    }

    if candidate.diagnostic_count >= baseline.diagnostic_count {
        let new: Vec<Fingerprint> = candidate
            .fingerprints
            .difference(&baseline.fingerprints)
            .cloned()
            .collect();
        if !new.is_empty() {
            reasons.push(RollbackReason::NewFingerprints(new));
        }
    }

    if candidate.quality < baseline.quality - tolerance {
        reasons.push(RollbackReason::QualityDrop {
            baseline: baseline.quality,
            candidate: candidate.quality,
        });
    }

    if let Some(impact) = impact {
        if impact.untargeted_regions > 0 {
            reasons.push(RollbackReason::UntargetedChanges(impact.untargeted_regions));
        }
    }

    if reasons.is_empty() {
        Verdict::Accept
    } else {
        Verdict::Rollback(reasons)
    }
}

/// Apply non-overlapping edits bottom-up so earlier line numbers stay valid.
pub fn apply_edits(source: &str, edits: &[Edit]) -> String {
    let mut lines: Vec<String> = source.split('\n').map(str::to_string).collect();
    let mut ordered: Vec<&Edit> = edits.iter().collect();
    ordered.sort_by_key(|e| Reverse(e.region.start));

    for edit in ordered {
        let start = edit.region.start.saturating_sub(1);
        let end = edit.region.end.min(lines.len());
        if start >= end {
            continue;
        }
        let replacement: Vec<String> = edit.replacement.split('\n').map(str::to_string).collect();
        lines.splice(start..end, replacement);
    }
    lines.join("\n")
}

pub fn measure_impact(baseline: &str, fixed: &str, applied: &[Edit]) -> Impact {
    let similarity = diff::similarity(baseline, fixed);
    let stats = diff::stats(baseline, fixed);
    let targeted: Vec<Region> = applied.iter().map(|e| e.region.widened(1)).collect();
    let untargeted_regions = diff::changed_regions(baseline, fixed)
        .iter()
        .filter(|region| !targeted.iter().any(|t| t.overlaps(region)))
        .count();
    Impact {
        similarity,
        change_ratio: 1.0 - similarity,
        lines_added: stats.added,
        lines_removed: stats.removed,
        untargeted_regions,
    }
}
