//! Error memory
//!
//! Tracks every fingerprint seen during a session: when it first and last
//! appeared, how many iterations it showed up in, when it was resolved, and
//! whether it came back after being resolved. Also renders the learning
//! context that goes into the next generation prompt.

use crate::categorize::Tier;
use crate::diagnostics::ObservedDiagnostic;
use crate::learner::TemplateLibrary;
use crate::normalize::Fingerprint;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// A finished stretch of activity for a fingerprint that later came back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedPeriod {
    pub first_seen: u32,
    pub last_seen: u32,
    pub occurrences: u32,
    pub resolved_at: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub fingerprint: Fingerprint,
    /// Most recent raw message carrying this fingerprint
    pub sample: String,
    pub tier: Tier,
    /// Line hint from the most recent occurrence
    pub line: Option<usize>,
    /// Start of the current period
    pub first_seen: u32,
    pub last_seen: u32,
    /// Iterations in the current period that contained this fingerprint
    pub occurrences: u32,
    pub resolved_at: Option<u32>,
    /// Earlier periods that ended in a resolution
    #[serde(default)]
    pub history: Vec<ClosedPeriod>,
}

impl MemoryEntry {
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Active again after an earlier resolution.
    pub fn is_regressed(&self) -> bool {
        self.is_active() && !self.history.is_empty()
    }

    pub fn total_occurrences(&self) -> u32 {
        self.occurrences + self.history.iter().map(|p| p.occurrences).sum::<u32>()
    }

    fn reopen(&mut self, iteration: u32) {
        if let Some(resolved_at) = self.resolved_at.take() {
            self.history.push(ClosedPeriod {
                first_seen: self.first_seen,
                last_seen: self.last_seen,
                occurrences: self.occurrences,
                resolved_at,
            });
        }
        self.first_seen = iteration;
        self.last_seen = iteration;
        self.occurrences = 1;
    }
}

/// What changed in one `record` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub new: Vec<Fingerprint>,
    pub recurring: Vec<Fingerprint>,
    pub regressed: Vec<Fingerprint>,
    pub resolved: Vec<Fingerprint>,
}

/// Knobs for [`ErrorMemory::learning_context`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextLimits {
    pub recurring_threshold: u32,
    pub top_k: usize,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorMemory {
    entries: BTreeMap<Fingerprint, MemoryEntry>,
}

impl ErrorMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&MemoryEntry> {
        self.entries.get(fingerprint)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Occurrence count for a fingerprint, 0 if never seen.
    pub fn occurrences(&self, fingerprint: &Fingerprint) -> u32 {
        self.entries
            .get(fingerprint)
            .map(|e| e.occurrences)
            .unwrap_or(0)
    }

    /// Record the diagnostics of an accepted version.
    ///
    /// Recording the same iteration twice (generated version then fixed
    /// version) counts each fingerprint at most once for that iteration.
    /// Active fingerprints missing from the batch are marked resolved at
    /// `iteration`.
    pub fn record(&mut self, iteration: u32, diagnostics: &[ObservedDiagnostic]) -> RecordSummary {
        let mut summary = RecordSummary::default();
        let mut batch = BTreeSet::new();

        for diagnostic in diagnostics {
            let fingerprint = &diagnostic.fingerprint;
            if !batch.insert(fingerprint.clone()) {
                continue;
            }

            match self.entries.get_mut(fingerprint) {
                None => {
                    self.entries.insert(
                        fingerprint.clone(),
                        MemoryEntry {
                            fingerprint: fingerprint.clone(),
                            sample: diagnostic.message.clone(),
                            tier: diagnostic.tier,
                            line: diagnostic.line,
                            first_seen: iteration,
                            last_seen: iteration,
                            occurrences: 1,
                            resolved_at: None,
                            history: Vec::new(),
                        },
                    );
                    summary.new.push(fingerprint.clone());
                }
                Some(entry) => {
                    entry.sample = diagnostic.message.clone();
                    entry.line = diagnostic.line;
                    if !entry.is_active() {
                        entry.reopen(iteration);
                        summary.regressed.push(fingerprint.clone());
                    } else if entry.last_seen != iteration {
                        entry.occurrences += 1;
                        entry.last_seen = iteration;
                        summary.recurring.push(fingerprint.clone());
                    }
                }
            }
        }

        for (fingerprint, entry) in self.entries.iter_mut() {
            if entry.is_active() && !batch.contains(fingerprint) {
                entry.resolved_at = Some(iteration);
                summary.resolved.push(fingerprint.clone());
            }
        }

        summary
    }

    /// Active fingerprints seen in at least `threshold` iterations, most
    /// frequent first.
    pub fn recurring(&self, threshold: u32) -> Vec<&MemoryEntry> {
        let mut entries: Vec<&MemoryEntry> = self
            .entries
            .values()
            .filter(|e| e.is_active() && e.occurrences >= threshold)
            .collect();
        entries.sort_by_key(|e| (Reverse(e.occurrences), e.first_seen, e.fingerprint.clone()));
        entries
    }

    /// Fingerprints resolved at or after `iteration`, most recent first.
    pub fn resolved_since(&self, iteration: u32) -> Vec<&MemoryEntry> {
        let mut entries: Vec<&MemoryEntry> = self
            .entries
            .values()
            .filter(|e| e.resolved_at.is_some_and(|at| at >= iteration))
            .collect();
        entries.sort_by_key(|e| (Reverse(e.resolved_at), e.fingerprint.clone()));
        entries
    }

    /// Active fingerprints that were resolved once and came back, most
    /// frequent overall first.
    pub fn regressed(&self) -> Vec<&MemoryEntry> {
        let mut entries: Vec<&MemoryEntry> =
            self.entries.values().filter(|e| e.is_regressed()).collect();
        entries.sort_by_key(|e| (Reverse(e.total_occurrences()), e.first_seen, e.fingerprint.clone()));
        entries
    }

    /// Prompt section summarizing what this session has learned so far.
    ///
    /// Deterministic for a given memory and library. Empty when there is
    /// nothing to say.
    pub fn learning_context(&self, library: &TemplateLibrary, limits: ContextLimits) -> String {
        let mut persistent = self.regressed();
        persistent.extend(
            self.recurring(limits.recurring_threshold)
                .into_iter()
                .filter(|e| !e.is_regressed()),
        );
        persistent.truncate(limits.top_k);

        let mut resolved = self.resolved_since(0);
        resolved.truncate(limits.top_k);

        if persistent.is_empty() && resolved.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        if !persistent.is_empty() {
            out.push_str("Recurring errors (not yet fixed):\n");
            for entry in &persistent {
                let _ = write!(out, "- [{}] {}", entry.tier, entry.fingerprint);
                if let Some(previous) = entry.history.last() {
                    let _ = write!(
                        out,
                        " (regressed: fixed in iteration {}, back in iteration {}; seen in {} iterations overall)",
                        previous.resolved_at,
                        entry.first_seen,
                        entry.total_occurrences()
                    );
                } else {
                    let _ = write!(out, " (seen in {} iterations)", entry.occurrences);
                }
                out.push('\n');
            }
        }

        if !resolved.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Recently resolved (keep these fixed):\n");
            for entry in &resolved {
                let at = entry.resolved_at.unwrap_or_default();
                let _ = write!(out, "- {} (resolved in iteration {})", entry.fingerprint, at);
                if let Some(template) = library.best_for(&entry.fingerprint) {
                    if template.confidence() >= limits.min_confidence {
                        let _ = write!(
                            out,
                            "; known fix: {} (confidence {:.2})",
                            template.action.describe(),
                            template.confidence()
                        );
                    }
                }
                out.push('\n');
            }
        }
        out
    }
}
