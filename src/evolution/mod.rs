//! Evolution tracking
//!
//! Owns one session: the ordered version history, the error memory, the
//! pattern learner and the quality trend. Each iteration's generated
//! candidate is gated against the current baseline, then handed to the
//! incremental fixer; every version, accepted or rolled back, is kept in
//! history and appended to the session's evolution log.

use crate::categorize::{categorize, prioritize};
use crate::compile::CompileReport;
use crate::config::Config;
use crate::diagnostics::{fingerprint_counts, observe, ObservedDiagnostic};
use crate::diff;
use crate::error::CollaboratorError;
use crate::fixer::{
    Edit, EditOrigin, FixAction, Impact, IncrementalFixer, Region, Scorecard, Verdict,
};
use crate::learner::{LearningReport, Outcome, PatternLearner};
use crate::memory::{ContextLimits, ErrorMemory, RecordSummary};
use crate::prompt::{FocusItem, PromptBuilder};
use crate::store::{EvolutionRecord, SessionSummaryRecord, Store};
use crate::util::hash_str;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;


const DIFF_MAX_LINES: usize = 50;
const REPORT_TOP_TEMPLATES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Generated,
    Fixer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Accepted,
    RolledBack,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Origin::Generated => "generated",
            Origin::Fixer => "fixer",
        })
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VersionStatus::Accepted => "accepted",
            VersionStatus::RolledBack => "rolled back",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Worsening,
    Stagnant,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trend::Improving => "improving",
            Trend::Worsening => "worsening",
            Trend::Stagnant => "stagnant",
        })
    }
}

/// Trend over the last `window` scores, comparing the newest score with the
/// oldest one in the window. Fewer than two scores is stagnant.
pub fn compute_trend(scores: &[f64], window: usize) -> Trend {
    let start = scores.len().saturating_sub(window);
    let recent = &scores[start..];
    if recent.len() < 2 {
        return Trend::Stagnant;
    }
    let (first, last) = (recent[0], recent[recent.len() - 1]);
    if last > first {
        Trend::Improving
    } else if last < first {
        Trend::Worsening
    } else {
        Trend::Stagnant
    }
}

/// One attempted code snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub sequence: u64,
    pub iteration: u32,
    pub origin: Origin,
    pub source: String,
    pub content_hash: String,
    /// Unified diff against the version that was current when this one was made
    pub diff: String,
    pub diff_size: usize,
    pub diagnostics: Vec<ObservedDiagnostic>,
    pub compiled: bool,
    pub quality: f64,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub applied_edits: Vec<String>,
    #[serde(default)]
    pub rollback_reasons: Vec<String>,
}

impl Version {
    pub fn scorecard(&self) -> Scorecard {
        Scorecard::new(&self.diagnostics, self.quality)
    }

    pub fn is_accepted(&self) -> bool {
        self.status == VersionStatus::Accepted
    }
}

/// Compiler and scorer verdict on one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub compiled: bool,
    pub diagnostics: Vec<ObservedDiagnostic>,
    pub quality: f64,
}

impl Evaluation {
    pub fn from_report(report: &CompileReport, quality: f64) -> Self {
        Self {
            compiled: report.success,
            diagnostics: observe(&report.diagnostics),
            quality: quality.clamp(0.0, 1.0),
        }
    }
}

/// Compile-and-score collaborator used for fixed candidates.
pub trait Evaluate {
    fn evaluate(&self, source: &str) -> Result<Evaluation, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    MaxIterations,
    Worsening,
    Cancelled,
    CollaboratorFailures,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::TargetReached => "quality target reached",
            StopReason::MaxIterations => "max iterations reached",
            StopReason::Worsening => "quality kept worsening",
            StopReason::Cancelled => "stopped by user",
            StopReason::CollaboratorFailures => "too many consecutive collaborator failures",
        })
    }
}

/// The subset of [`Config`] the tracker reads.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub max_iterations: u32,
    pub quality_target: f64,
    pub max_edits: usize,
    pub tolerance: f64,
    pub worsening_streak: u32,
    pub trend_window: usize,
    pub max_consecutive_failures: u32,
    pub gate_generated: bool,
    pub context: ContextLimits,
}

impl From<&Config> for TrackerSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_iterations: config.max_iterations,
            quality_target: config.quality_target,
            max_edits: config.max_edits_per_iteration,
            tolerance: config.quality_tolerance,
            worsening_streak: config.worsening_streak,
            trend_window: config.trend_window,
            max_consecutive_failures: config.max_consecutive_failures,
            gate_generated: config.gate_generated,
            context: ContextLimits {
                recurring_threshold: config.recurring_threshold,
                top_k: config.learning_context_top_k,
                min_confidence: config.min_template_confidence,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixReport {
    pub applied: usize,
    pub skipped: usize,
    pub impact: Impact,
    /// `None` when the fixed candidate could not be evaluated
    pub status: Option<VersionStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: u32,
    pub generated: VersionStatus,
    pub generated_quality: f64,
    pub fixer: Option<FixReport>,
    pub memory: RecordSummary,
    pub current_quality: Option<f64>,
    pub trend: Trend,
}

/// End-of-session report.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub reason: StopReason,
    pub iterations: u32,
    pub final_version: Option<Version>,
    pub best_version: Option<Version>,
    pub target_met: bool,
    pub trend: Trend,
    pub versions: Vec<Version>,
    pub memory: ErrorMemory,
    pub learning: LearningReport,
    pub learning_degraded: bool,
    pub journal_degraded: bool,
}

impl SessionOutcome {
    pub fn rolled_back(&self) -> usize {
        self.versions.iter().filter(|v| !v.is_accepted()).count()
    }

    pub fn summary_record(&self) -> SessionSummaryRecord {
        SessionSummaryRecord {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            stop_reason: self.reason.to_string(),
            iterations: self.iterations,
            versions: self.versions.len(),
            rolled_back: self.rolled_back(),
            final_quality: self.final_version.as_ref().map(|v| v.quality),
            best_quality: self.best_version.as_ref().map(|v| v.quality),
            best_sequence: self.best_version.as_ref().map(|v| v.sequence),
            target_met: self.target_met,
            trend: self.trend.to_string(),
            learning_degraded: self.learning_degraded,
            journal_degraded: self.journal_degraded,
        }
    }

    /// Human-readable report lines.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Session {} finished after {} iteration(s): {}",
            self.session_id, self.iterations, self.reason
        )];
        match (&self.final_version, self.target_met) {
            (Some(version), true) => lines.push(format!(
                "Target met: version #{} (iteration {}) at quality {:.2}, trend {}",
                version.sequence, version.iteration, version.quality, self.trend
            )),
            (Some(version), false) => {
                lines.push(format!(
                    "Target not met: current version #{} at quality {:.2}, trend {}",
                    version.sequence, version.quality, self.trend
                ));
                if let Some(best) = &self.best_version {
                    lines.push(format!(
                        "Best accepted version: #{} (iteration {}) at quality {:.2}",
                        best.sequence, best.iteration, best.quality
                    ));
                }
            }
            (None, _) => lines.push("Target not met: no version was accepted".to_string()),
        }
        lines.push(format!(
            "Versions: {} ({} rolled back); templates known: {}",
            self.versions.len(),
            self.rolled_back(),
            self.learning.total_templates
        ));
        if self.learning_degraded {
            lines.push("Learning was disabled after a persistence failure".to_string());
        }
        if self.journal_degraded {
            lines.push("Evolution log was disabled after a persistence failure".to_string());
        }
        lines
    }
}

pub struct EvolutionTracker {
    session_id: String,
    started_at: DateTime<Utc>,
    settings: TrackerSettings,
    fixer: IncrementalFixer,
    versions: Vec<Version>,
    current: Option<usize>,
    memory: ErrorMemory,
    learner: PatternLearner,
    trend: Trend,
    trend_inputs: Vec<f64>,
    worsening_run: u32,
    iterations: u32,
    consecutive_failures: u32,
    journal: Option<Store>,
    journal_degraded: bool,
}

impl EvolutionTracker {
    pub fn new(settings: TrackerSettings, learner: PatternLearner, journal: Option<Store>) -> Self {
        let started_at = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let session_id = format!("{}-{}", started_at.format("%Y%m%dT%H%M%S"), &suffix[..8]);
        Self {
            session_id,
            started_at,
            fixer: IncrementalFixer::new(settings.max_edits, settings.tolerance),
            settings,
            versions: Vec::new(),
            current: None,
            memory: ErrorMemory::new(),
            learner,
            trend: Trend::Stagnant,
            trend_inputs: Vec::new(),
            worsening_run: 0,
            iterations: 0,
            consecutive_failures: 0,
            journal,
            journal_degraded: false,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn current(&self) -> Option<&Version> {
        self.current.map(|i| &self.versions[i])
    }

    /// Highest-quality accepted version; the later one on ties.
    pub fn best(&self) -> Option<&Version> {
        self.versions
            .iter()
            .filter(|v| v.is_accepted())
            .max_by(|a, b| a.quality.total_cmp(&b.quality).then(a.sequence.cmp(&b.sequence)))
    }

    pub fn memory(&self) -> &ErrorMemory {
        &self.memory
    }

    pub fn learner(&self) -> &PatternLearner {
        &self.learner
    }

    pub fn trend(&self) -> Trend {
        self.trend
    }

    pub fn trend_inputs(&self) -> &[f64] {
        &self.trend_inputs
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn is_journal_degraded(&self) -> bool {
        self.journal_degraded
    }

    /// Prompt for the next generation round.
    pub fn next_prompt(&self, task: &str) -> String {
        let mut builder = PromptBuilder::new(task)
            .with_learning_context(self.learning_context());
        if let Some(current) = self.current() {
            builder = builder
                .with_current(&current.source, current.iteration, current.quality)
                .with_focus(self.focus_items(current));
        }
        builder.build()
    }

    pub fn learning_context(&self) -> String {
        self.memory
            .learning_context(self.learner.library(), self.settings.context)
    }

    fn focus_items(&self, version: &Version) -> Vec<FocusItem> {
        let mut seen = BTreeSet::new();
        let firsts: Vec<&ObservedDiagnostic> = version
            .diagnostics
            .iter()
            .filter(|d| seen.insert(d.fingerprint.clone()))
            .collect();
        let batch = firsts
            .iter()
            .map(|d| (d.fingerprint.clone(), self.memory.occurrences(&d.fingerprint).max(1)));
        prioritize(batch)
            .into_iter()
            .filter_map(|item| {
                let first = firsts.iter().find(|d| d.fingerprint == item.fingerprint)?;
                Some(FocusItem {
                    sample: first.message.clone(),
                    line: first.line,
                    item,
                })
            })
            .collect()
    }

    /// An iteration that produced no candidate. Nothing in memory or the
    /// template library changes.
    pub fn record_failure(&mut self, iteration: u32, error: &CollaboratorError) {
        self.iterations = self.iterations.max(iteration);
        self.consecutive_failures += 1;
        warn!(
            iteration,
            consecutive = self.consecutive_failures,
            error = %error,
            "iteration abandoned"
        );
    }

    /// Process one generated candidate and its evaluation.
    pub fn process(
        &mut self,
        iteration: u32,
        source: String,
        evaluation: Evaluation,
        evaluator: &dyn Evaluate,
    ) -> IterationReport {
        self.iterations = self.iterations.max(iteration);
        self.consecutive_failures = 0;

        let baseline = self.current().map(Version::scorecard);
        let candidate = Scorecard::new(&evaluation.diagnostics, evaluation.quality);
        let verdict = match &baseline {
            Some(base) if self.settings.gate_generated => self.fixer.judge(base, &candidate, None),
            Some(_) => {
                info!(iteration, "generated candidate replaces the baseline ungated");
                Verdict::Accept
            }
            None => Verdict::Accept,
        };

        let generated_quality = evaluation.quality;
        let previous = self
            .current()
            .map(|v| (v.source.clone(), v.diagnostics.clone()));
        let previous_source = previous.as_ref().map(|(source, _)| source.as_str());
        let index = self.push_version(
            iteration,
            Origin::Generated,
            source,
            previous_source,
            evaluation,
            &verdict,
            Vec::new(),
        );

        let mut report = IterationReport {
            iteration,
            generated: self.versions[index].status,
            generated_quality,
            fixer: None,
            memory: RecordSummary::default(),
            current_quality: None,
            trend: self.trend,
        };

        if let Verdict::Rollback(reasons) = &verdict {
            info!(
                iteration,
                reasons = %join_reasons(reasons),
                "generated candidate rolled back"
            );
        } else {
            self.current = Some(index);
            let diagnostics = self.versions[index].diagnostics.clone();
            report.memory = self.memory.record(iteration, &diagnostics);
            debug!(
                iteration,
                new = report.memory.new.len(),
                recurring = report.memory.recurring.len(),
                regressed = report.memory.regressed.len(),
                resolved = report.memory.resolved.len(),
                "recorded diagnostics"
            );
            if let Some((previous_source, previous_diagnostics)) = &previous {
                self.learn_from_generated(iteration, previous_source, previous_diagnostics, index);
            }
            report.fixer = self.run_fixer(iteration, index, evaluator, &mut report.memory);
            self.update_trend();
        }

        report.current_quality = self.current().map(|v| v.quality);
        report.trend = self.trend;
        report
    }

    /// Learn templates from an accepted generated version that fixed
    /// located diagnostics of the version it replaced with a one-line edit.
    fn learn_from_generated(
        &mut self,
        iteration: u32,
        previous_source: &str,
        previous_diagnostics: &[ObservedDiagnostic],
        index: usize,
    ) {
        let source = self.versions[index].source.clone();
        let before = fingerprint_counts(previous_diagnostics);
        let after = fingerprint_counts(&self.versions[index].diagnostics);
        let lines: Vec<&str> = previous_source.split('\n').collect();
        let mut seen = BTreeSet::new();
        let now = Utc::now();

        for diagnostic in previous_diagnostics {
            let Some(line) = diagnostic.line else {
                continue;
            };
            if !seen.insert(diagnostic.fingerprint.clone()) {
                continue;
            }
            let had = before.get(&diagnostic.fingerprint).copied().unwrap_or(0);
            let has = after.get(&diagnostic.fingerprint).copied().unwrap_or(0);
            if has >= had {
                continue;
            }
            let Some(original) = line.checked_sub(1).and_then(|i| lines.get(i).copied()) else {
                continue;
            };
            let Some(action) = diff::replaced_line(previous_source, &source, line)
                .and_then(|fixed| FixAction::infer(original, fixed))
            else {
                continue;
            };
            debug!(
                iteration,
                fingerprint = %diagnostic.fingerprint,
                action = %action.describe(),
                "learned fix from generated version"
            );
            self.learner.record_outcome(&Outcome {
                fingerprint: diagnostic.fingerprint.clone(),
                tier: categorize(&diagnostic.fingerprint).tier,
                template_id: None,
                action,
                succeeded: true,
                iteration,
                at: now,
            });
        }
    }

    /// Turn learned templates and built-in remedies into edits for the
    /// diagnostics that point at a line.
    pub fn propose_edits(&self, source: &str, diagnostics: &[ObservedDiagnostic]) -> Vec<Edit> {
        let lines: Vec<&str> = source.split('\n').collect();
        let mut targeted = BTreeSet::new();
        let mut edits = Vec::new();

        for diagnostic in diagnostics {
            let Some(line) = diagnostic.line else {
                continue;
            };
            if line == 0 || line > lines.len() {
                continue;
            }
            if !targeted.insert((diagnostic.fingerprint.clone(), line)) {
                continue;
            }
            let original = lines[line - 1];
            let category = categorize(&diagnostic.fingerprint);
            let occurrences = self.memory.occurrences(&diagnostic.fingerprint).max(1);

            let learned = self.learner.suggest(&diagnostic.fingerprint).and_then(|template| {
                template.action.apply(original).map(|fixed| {
                    (
                        template.action.clone(),
                        fixed,
                        template.confidence(),
                        EditOrigin::Template { id: template.id },
                    )
                })
            });
            let builtin = || {
                let remedy = category.remedy.as_ref()?;
                let (action, fixed) = remedy.apply(original)?;
                Some((
                    action.clone(),
                    fixed,
                    remedy.confidence,
                    EditOrigin::Builtin {
                        kind: category.kind.to_string(),
                    },
                ))
            };

            if let Some((action, replacement, confidence, origin)) = learned.or_else(builtin) {
                edits.push(Edit {
                    fingerprint: diagnostic.fingerprint.clone(),
                    region: Region::line(line),
                    original: original.to_string(),
                    replacement,
                    action,
                    confidence,
                    tier: category.tier,
                    occurrences,
                    origin,
                });
            }
        }
        edits
    }

    fn run_fixer(
        &mut self,
        iteration: u32,
        base_index: usize,
        evaluator: &dyn Evaluate,
        summary: &mut RecordSummary,
    ) -> Option<FixReport> {
        let base_source = self.versions[base_index].source.clone();
        let base_diagnostics = self.versions[base_index].diagnostics.clone();
        let base_card = self.versions[base_index].scorecard();

        let edits = self.propose_edits(&base_source, &base_diagnostics);
        if edits.is_empty() {
            return None;
        }
        let attempt = self.fixer.prepare(&base_source, edits)?;
        let applied = attempt.applied.len();
        let skipped = attempt.skipped.len();

        let evaluation = match evaluator.evaluate(&attempt.source) {
            Ok(evaluation) => evaluation,
            Err(err) => {
                warn!(iteration, error = %err, "fixed candidate could not be evaluated; keeping generated version");
                return Some(FixReport {
                    applied,
                    skipped,
                    impact: attempt.impact,
                    status: None,
                });
            }
        };

        let fixed_card = Scorecard::new(&evaluation.diagnostics, evaluation.quality);
        let verdict = self.fixer.judge(&base_card, &fixed_card, Some(&attempt.impact));
        let accepted = verdict.is_accept();
        let descriptions = attempt.applied.iter().map(Edit::describe).collect();
        let fixed_diagnostics = evaluation.diagnostics.clone();

        let index = self.push_version(
            iteration,
            Origin::Fixer,
            attempt.source,
            Some(&base_source),
            evaluation,
            &verdict,
            descriptions,
        );

        if accepted {
            self.current = Some(index);
            let fixed_summary = self.memory.record(iteration, &fixed_diagnostics);
            merge_summary(summary, fixed_summary);
            info!(iteration, applied, quality = fixed_card.quality, "fixed candidate accepted");
        } else if let Verdict::Rollback(reasons) = &verdict {
            info!(iteration, applied, reasons = %join_reasons(reasons), "fixed candidate rolled back");
        }

        // A fix counts as a success when the candidate is kept and the
        // fingerprint it targeted shows up fewer times than before.
        let before = fingerprint_counts(&base_diagnostics);
        let after = fingerprint_counts(&fixed_diagnostics);
        let now = Utc::now();
        for edit in &attempt.applied {
            let had = before.get(&edit.fingerprint).copied().unwrap_or(0);
            let has = after.get(&edit.fingerprint).copied().unwrap_or(0);
            let template_id = match edit.origin {
                EditOrigin::Template { id } => Some(id),
                EditOrigin::Builtin { .. } => None,
            };
            self.learner.record_outcome(&Outcome {
                fingerprint: edit.fingerprint.clone(),
                tier: edit.tier,
                template_id,
                action: edit.action.clone(),
                succeeded: accepted && has < had,
                iteration,
                at: now,
            });
        }

        Some(FixReport {
            applied,
            skipped,
            impact: attempt.impact,
            status: Some(if accepted {
                VersionStatus::Accepted
            } else {
                VersionStatus::RolledBack
            }),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn push_version(
        &mut self,
        iteration: u32,
        origin: Origin,
        source: String,
        previous: Option<&str>,
        evaluation: Evaluation,
        verdict: &Verdict,
        applied_edits: Vec<String>,
    ) -> usize {
        let previous = previous.unwrap_or("");
        let (status, rollback_reasons) = match verdict {
            Verdict::Accept => (VersionStatus::Accepted, Vec::new()),
            Verdict::Rollback(reasons) => (
                VersionStatus::RolledBack,
                reasons.iter().map(|r| r.to_string()).collect(),
            ),
        };
        let version = Version {
            sequence: self.versions.len() as u64 + 1,
            iteration,
            origin,
            content_hash: hash_str(&source),
            diff: diff::unified_diff(previous, &source, DIFF_MAX_LINES),
            diff_size: diff::stats(previous, &source).total(),
            source,
            diagnostics: evaluation.diagnostics,
            compiled: evaluation.compiled,
            quality: evaluation.quality,
            status,
            created_at: Utc::now(),
            applied_edits,
            rollback_reasons,
        };
        self.journal(&version);
        self.versions.push(version);
        self.versions.len() - 1
    }

    fn journal(&mut self, version: &Version) {
        if self.journal_degraded {
            return;
        }
        let Some(store) = &self.journal else {
            return;
        };
        let mut fingerprints: Vec<_> = version
            .diagnostics
            .iter()
            .map(|d| d.fingerprint.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        fingerprints.truncate(20);
        let record = EvolutionRecord {
            timestamp: version.created_at,
            session_id: self.session_id.clone(),
            sequence: version.sequence,
            iteration: version.iteration,
            origin: version.origin,
            status: version.status,
            compiled: version.compiled,
            quality: version.quality,
            diagnostic_count: version.diagnostics.len(),
            fingerprints,
            diff_size: version.diff_size,
            content_hash: version.content_hash.clone(),
            applied_edits: version.applied_edits.clone(),
        };
        if let Err(err) = store.append_evolution(&record) {
            warn!(error = %err, "failed to append evolution record; evolution log disabled for this session");
            self.journal_degraded = true;
        }
    }

    fn update_trend(&mut self) {
        if let Some(quality) = self.current().map(|v| v.quality) {
            self.trend_inputs.push(quality);
        }
        self.trend = compute_trend(&self.trend_inputs, self.settings.trend_window);
        if self.trend == Trend::Worsening {
            self.worsening_run += 1;
        } else {
            self.worsening_run = 0;
        }
    }

    /// Terminal condition reached after the iterations so far, if any.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self
            .current()
            .is_some_and(|v| v.quality >= self.settings.quality_target)
        {
            return Some(StopReason::TargetReached);
        }
        if self.worsening_run >= self.settings.worsening_streak {
            return Some(StopReason::Worsening);
        }
        if self.consecutive_failures >= self.settings.max_consecutive_failures {
            return Some(StopReason::CollaboratorFailures);
        }
        if self.iterations >= self.settings.max_iterations {
            return Some(StopReason::MaxIterations);
        }
        None
    }

    /// Close the session. Writes the summary when a journal is attached.
    pub fn finish(self, reason: StopReason) -> SessionOutcome {
        let final_version = self.current().cloned();
        let best_version = self.best().cloned();
        let target_met = final_version
            .as_ref()
            .is_some_and(|v| v.quality >= self.settings.quality_target);

        let outcome = SessionOutcome {
            session_id: self.session_id,
            started_at: self.started_at,
            reason,
            iterations: self.iterations,
            final_version,
            best_version,
            target_met,
            trend: self.trend,
            versions: self.versions,
            memory: self.memory,
            learning: self.learner.library().report(REPORT_TOP_TEMPLATES),
            learning_degraded: self.learner.is_degraded(),
            journal_degraded: self.journal_degraded,
        };

        if let Some(store) = &self.journal {
            if let Err(err) = store.save_session_summary(&outcome.summary_record()) {
                warn!(error = %err, "failed to save session summary");
            }
        }
        outcome
    }
}

fn merge_summary(into: &mut RecordSummary, from: RecordSummary) {
    into.new.extend(from.new);
    into.recurring.extend(from.recurring);
    into.regressed.extend(from.regressed);
    into.resolved.extend(from.resolved);
}

fn join_reasons(reasons: &[crate::fixer::RollbackReason]) -> String {
    reasons
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
