//! Success pattern learning
//!
//! Keeps a library of fix templates keyed by fingerprint. Each template
//! carries a success/failure tally and a Laplace-smoothed confidence; only
//! templates above the configured floor are ever suggested. The library is
//! persisted through [`Store`] so it survives across sessions.

use crate::categorize::Tier;
use crate::fixer::FixAction;
use crate::normalize::Fingerprint;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixTemplate {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub tier: Tier,
    pub action: FixAction,
    pub successes: u32,
    pub failures: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_applied_iteration: Option<u32>,
    #[serde(default)]
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl FixTemplate {
    /// (successes + 1) / (successes + failures + 2)
    pub fn confidence(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.successes as f64 + self.failures as f64 + 2.0)
    }

    pub fn uses(&self) -> u32 {
        self.successes + self.failures
    }
}

/// Template library keyed by fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateLibrary {
    #[serde(default)]
    pub templates: BTreeMap<Fingerprint, Vec<FixTemplate>>,
}

/// Result of applying one learned or built-in fix.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub fingerprint: Fingerprint,
    pub tier: Tier,
    /// Template that produced the edit, if any
    pub template_id: Option<Uuid>,
    pub action: FixAction,
    pub succeeded: bool,
    pub iteration: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningReport {
    pub total_templates: usize,
    pub fingerprints: usize,
    pub total_successes: u32,
    pub total_failures: u32,
    /// Mean confidence across templates, 0 when empty
    pub mean_confidence: f64,
    pub per_tier: BTreeMap<Tier, usize>,
    /// Most applied templates: (fingerprint, action, uses, confidence)
    pub most_used: Vec<(String, String, u32, f64)>,
}

impl TemplateLibrary {
    pub fn len(&self) -> usize {
        self.templates.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &FixTemplate> {
        self.templates.values().flatten()
    }

    /// Highest-confidence template for a fingerprint. Ties go to the one with
    /// more successes, then the older one.
    pub fn best_for(&self, fingerprint: &Fingerprint) -> Option<&FixTemplate> {
        self.templates.get(fingerprint)?.iter().max_by(|a, b| {
            a.confidence()
                .total_cmp(&b.confidence())
                .then(a.successes.cmp(&b.successes))
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        })
    }

    /// Fold one outcome into the library. Returns whether anything changed.
    ///
    /// Outcomes of a known template update its tally. A successful fix with
    /// no template becomes a new template, or bumps an existing template with
    /// the same action. Failed fixes with no template are not recorded.
    pub fn apply_outcome(&mut self, outcome: &Outcome) -> bool {
        let bucket = self.templates.entry(outcome.fingerprint.clone()).or_default();

        let position = outcome
            .template_id
            .and_then(|id| bucket.iter().position(|t| t.id == id))
            .or_else(|| {
                if outcome.succeeded {
                    bucket.iter().position(|t| t.action == outcome.action)
                } else {
                    None
                }
            });

        if let Some(index) = position {
            let template = &mut bucket[index];
            if outcome.succeeded {
                template.successes += 1;
            } else {
                template.failures += 1;
            }
            template.last_applied_iteration = Some(outcome.iteration);
            template.last_applied_at = Some(outcome.at);
            return true;
        }

        if !outcome.succeeded {
            if bucket.is_empty() {
                self.templates.remove(&outcome.fingerprint);
            }
            return false;
        }

        bucket.push(FixTemplate {
            id: Uuid::new_v4(),
            fingerprint: outcome.fingerprint.clone(),
            tier: outcome.tier,
            action: outcome.action.clone(),
            successes: 1,
            failures: 0,
            created_at: outcome.at,
            last_applied_iteration: Some(outcome.iteration),
            last_applied_at: Some(outcome.at),
        });
        true
    }

    pub fn report(&self, top: usize) -> LearningReport {
        let total_templates = self.len();
        let mean_confidence = if total_templates == 0 {
            0.0
        } else {
            self.iter().map(FixTemplate::confidence).sum::<f64>() / total_templates as f64
        };

        let mut used: Vec<&FixTemplate> = self.iter().filter(|t| t.uses() > 0).collect();
        used.sort_by_key(|t| (Reverse(t.uses()), t.fingerprint.clone(), t.id));
        let most_used = used
            .into_iter()
            .take(top)
            .map(|t| {
                (
                    t.fingerprint.to_string(),
                    t.action.describe(),
                    t.uses(),
                    t.confidence(),
                )
            })
            .collect();

        let mut per_tier = BTreeMap::new();
        for template in self.iter() {
            *per_tier.entry(template.tier).or_insert(0) += 1;
        }

        LearningReport {
            total_templates,
            per_tier,
            fingerprints: self.templates.len(),
            total_successes: self.iter().map(|t| t.successes).sum(),
            total_failures: self.iter().map(|t| t.failures).sum(),
            mean_confidence,
            most_used,
        }
    }
}

/// Suggests templates and learns from fix outcomes.
pub struct PatternLearner {
    library: TemplateLibrary,
    store: Option<Store>,
    min_confidence: f64,
    degraded: bool,
}

impl PatternLearner {
    /// Learner with no persistence.
    pub fn in_memory(min_confidence: f64) -> Self {
        Self {
            library: TemplateLibrary::default(),
            store: None,
            min_confidence,
            degraded: false,
        }
    }

    /// Learner backed by the library in `store`.
    ///
    /// If the library cannot be read the learner starts empty and stays
    /// read-only for the session, so a library it never saw is not
    /// overwritten.
    pub fn open(store: Store, min_confidence: f64) -> Self {
        match store.load_templates() {
            Ok(library) => {
                debug!(templates = library.len(), "loaded template library");
                Self {
                    library,
                    store: Some(store),
                    min_confidence,
                    degraded: false,
                }
            }
            Err(err) => {
                warn!(error = %err, "template library unavailable; learning disabled for this session");
                Self {
                    library: TemplateLibrary::default(),
                    store: Some(store),
                    min_confidence,
                    degraded: true,
                }
            }
        }
    }

    pub fn library(&self) -> &TemplateLibrary {
        &self.library
    }

    /// Learning was switched off after a persistence failure.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Best template for a fingerprint at or above the confidence floor.
    pub fn suggest(&self, fingerprint: &Fingerprint) -> Option<&FixTemplate> {
        self.library
            .best_for(fingerprint)
            .filter(|t| t.confidence() >= self.min_confidence)
    }

    /// Record the outcome of one applied fix.
    ///
    /// With a store, the update runs against the library on disk under an
    /// exclusive lock, so concurrent sessions do not lose each other's
    /// updates. Returns whether the library changed.
    pub fn record_outcome(&mut self, outcome: &Outcome) -> bool {
        if self.degraded {
            debug!(fingerprint = %outcome.fingerprint, "learning disabled; outcome dropped");
            return false;
        }

        let Some(store) = &self.store else {
            return self.library.apply_outcome(outcome);
        };

        let mut changed = false;
        match store.update_templates(|library| changed = library.apply_outcome(outcome)) {
            Ok(library) => {
                self.library = library;
                changed
            }
            Err(err) => {
                warn!(error = %err, "failed to persist template library; learning disabled for this session");
                self.degraded = true;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    fn outcome(fp: &str, template_id: Option<Uuid>, succeeded: bool, iteration: u32) -> Outcome {
        Outcome {
            fingerprint: normalize(fp),
            tier: Tier::Simple,
            template_id,
            action: FixAction::Append {
                suffix: ";".into(),
            },
            succeeded,
            iteration,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_confidence_is_laplace_smoothed() {
        let mut library = TemplateLibrary::default();
        library.apply_outcome(&outcome("expected ';'", None, true, 1));
        let template = library.best_for(&normalize("expected ';'")).unwrap();
        assert_eq!((template.successes, template.failures), (1, 0));
        assert!((template.confidence() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_fix_without_template_is_not_recorded() {
        let mut library = TemplateLibrary::default();
        assert!(!library.apply_outcome(&outcome("expected ';'", None, false, 1)));
        assert!(library.is_empty());
        assert!(library.templates.is_empty());
    }

    #[test]
    fn test_identical_action_merges() {
        let mut library = TemplateLibrary::default();
        library.apply_outcome(&outcome("expected ';'", None, true, 1));
        library.apply_outcome(&outcome("expected ';'", None, true, 2));
        assert_eq!(library.len(), 1);
        let template = library.best_for(&normalize("expected ';'")).unwrap();
        assert_eq!(template.successes, 2);
        assert_eq!(template.last_applied_iteration, Some(2));
    }

    #[test]
    fn test_template_failures_lower_confidence_below_floor() {
        let mut learner = PatternLearner::in_memory(0.6);
        learner.record_outcome(&outcome("expected ';'", None, true, 1));
        let id = learner.suggest(&normalize("expected ';'")).unwrap().id;

        learner.record_outcome(&outcome("expected ';'", Some(id), false, 2));
        // 2 / 4 = 0.5
        assert!(learner.suggest(&normalize("expected ';'")).is_none());
        let template = learner.library().best_for(&normalize("expected ';'")).unwrap();
        assert_eq!((template.successes, template.failures), (1, 1));
    }

    #[test]
    fn test_best_for_prefers_confidence_then_successes() {
        let mut library = TemplateLibrary::default();
        let fp = normalize("'ask' - undeclared identifier");
        let mut a = outcome("'ask' - undeclared identifier", None, true, 1);
        a.action = FixAction::Replace {
            find: "Ask".into(),
            replace: "SymbolInfoDouble(_Symbol, SYMBOL_ASK)".into(),
        };
        let mut b = a.clone();
        b.action = FixAction::Replace {
            find: "Ask".into(),
            replace: "ask()".into(),
        };
        library.apply_outcome(&a);
        library.apply_outcome(&b);
        library.apply_outcome(&b);
        let best = library.best_for(&fp).unwrap();
        assert_eq!(best.action, b.action);
    }

    #[test]
    fn test_report() {
        let mut library = TemplateLibrary::default();
        assert_eq!(library.report(5).mean_confidence, 0.0);
        library.apply_outcome(&outcome("expected ';'", None, true, 1));
        library.apply_outcome(&outcome("expected ';'", None, true, 2));
        library.apply_outcome(&outcome("expected ')'", None, true, 2));
        let report = library.report(1);
        assert_eq!(report.total_templates, 2);
        assert_eq!(report.per_tier.get(&Tier::Simple), Some(&2));
        assert_eq!(report.total_successes, 3);
        assert_eq!(report.most_used.len(), 1);
        assert_eq!(report.most_used[0].0, "expected ';'");
        assert_eq!(report.most_used[0].2, 2);
    }

    #[test]
    fn test_persisted_learning_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let mut learner = PatternLearner::open(store.clone(), 0.6);
        assert!(learner.record_outcome(&outcome("expected ';'", None, true, 1)));

        let reopened = PatternLearner::open(store, 0.6);
        assert!(!reopened.is_degraded());
        assert!(reopened.suggest(&normalize("expected ';'")).is_some());
    }

    #[test]
    fn test_unreadable_library_degrades_without_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let library_path = dir.path().join("lib.json");
        std::fs::write(&library_path, "{ not json").unwrap();
        let store = Store::new(dir.path()).with_template_library(library_path.clone());

        let mut learner = PatternLearner::open(store, 0.6);
        assert!(learner.is_degraded());
        assert!(!learner.record_outcome(&outcome("expected ';'", None, true, 1)));
        assert_eq!(std::fs::read_to_string(&library_path).unwrap(), "{ not json");
    }
}
