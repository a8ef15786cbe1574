//! Session loop
//!
//! Drives generator → compiler → tracker until the tracker reports a stop
//! condition. Iterations are strictly sequential; the generation request and
//! the compile/score step are the only suspension points. A stop request is
//! honored between iterations.

use crate::compile::Compiler;
use crate::error::CollaboratorError;
use crate::evolution::{
    Evaluate, Evaluation, EvolutionTracker, IterationReport, SessionOutcome, StopReason,
};
use crate::generate::CodeGenerator;
use crate::quality::QualityScorer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Compiles and scores a candidate, retrying transient failures.
pub struct ToolchainEvaluator {
    compiler: Box<dyn Compiler>,
    scorer: Box<dyn QualityScorer>,
    retries: u32,
}

impl ToolchainEvaluator {
    pub fn new(compiler: Box<dyn Compiler>, scorer: Box<dyn QualityScorer>, retries: u32) -> Self {
        Self {
            compiler,
            scorer,
            retries,
        }
    }

    fn evaluate_once(&self, source: &str) -> Result<Evaluation, CollaboratorError> {
        let report = self.compiler.compile(source)?;
        let quality = self.scorer.score(source, &report)?;
        debug!(
            success = report.success,
            diagnostics = report.diagnostics.len(),
            duration_ms = report.duration_ms,
            quality,
            "candidate evaluated"
        );
        Ok(Evaluation::from_report(&report, quality))
    }
}

impl Evaluate for ToolchainEvaluator {
    fn evaluate(&self, source: &str) -> Result<Evaluation, CollaboratorError> {
        let mut attempt = 0;
        loop {
            match self.evaluate_once(source) {
                Ok(evaluation) => return Ok(evaluation),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(error = %err, attempt, "compile/score failed; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub struct SessionRunner<'a> {
    generator: &'a dyn CodeGenerator,
    evaluator: &'a dyn Evaluate,
    retries: u32,
    generation_timeout: Duration,
    stop: Arc<AtomicBool>,
    quiet: bool,
}

impl<'a> SessionRunner<'a> {
    pub fn new(generator: &'a dyn CodeGenerator, evaluator: &'a dyn Evaluate) -> Self {
        Self {
            generator,
            evaluator,
            retries: 1,
            generation_timeout: Duration::from_secs(300),
            stop: Arc::new(AtomicBool::new(false)),
            quiet: false,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    /// Flag checked between iterations; set it to end the session early.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub async fn run(&self, task: &str, mut tracker: EvolutionTracker) -> SessionOutcome {
        info!(session = tracker.session_id(), "session started");
        let mut iteration = 0;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return self.finish(tracker, StopReason::Cancelled);
            }
            if let Some(reason) = tracker.stop_reason() {
                return self.finish(tracker, reason);
            }
            iteration += 1;
            let max = tracker.settings().max_iterations;
            self.progress(format!("  Iteration {iteration}/{max}: generating..."));

            let prompt = tracker.next_prompt(task);
            let source = match self.generate(&prompt).await {
                Ok(source) => source,
                Err(err) => {
                    self.progress(format!("  Iteration {iteration}: no candidate ({err})"));
                    tracker.record_failure(iteration, &err);
                    continue;
                }
            };

            // Compile and score run inline and block this worker. The session
            // is the only task doing work; the Ctrl-C watcher is polled by the
            // other workers of the multi-threaded runtime.
            let evaluation = match self.evaluator.evaluate(&source) {
                Ok(evaluation) => evaluation,
                Err(err) => {
                    self.progress(format!("  Iteration {iteration}: could not compile ({err})"));
                    tracker.record_failure(iteration, &err);
                    continue;
                }
            };

            let report = tracker.process(iteration, source, evaluation, self.evaluator);
            self.progress(describe_iteration(&report));
        }
    }

    /// Request a candidate, retrying transient failures.
    async fn generate(&self, prompt: &str) -> Result<String, CollaboratorError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(
                self.generation_timeout,
                self.generator.generate(prompt),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CollaboratorError::Timeout(self.generation_timeout)),
            };
            match result {
                Ok(source) if !source.trim().is_empty() => return Ok(source),
                Ok(_) => {
                    if attempt >= self.retries {
                        return Err(CollaboratorError::EmptyResponse);
                    }
                    attempt += 1;
                    warn!(attempt, "generator returned an empty candidate; retrying");
                }
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(error = %err, attempt, "generation failed; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn finish(&self, tracker: EvolutionTracker, reason: StopReason) -> SessionOutcome {
        let outcome = tracker.finish(reason);
        info!(
            session = %outcome.session_id,
            reason = %outcome.reason,
            iterations = outcome.iterations,
            versions = outcome.versions.len(),
            target_met = outcome.target_met,
            "session finished"
        );
        outcome
    }

    fn progress(&self, line: String) {
        if !self.quiet {
            eprintln!("{line}");
        }
    }
}

fn describe_iteration(report: &IterationReport) -> String {
    let mut line = format!(
        "  Iteration {}: generated {} (quality {:.2})",
        report.iteration,
        report.generated,
        report.generated_quality
    );
    if let Some(fix) = &report.fixer {
        match fix.status {
            Some(status) => line.push_str(&format!(", {} edit(s) {}", fix.applied, status)),
            None => line.push_str(&format!(", {} edit(s) not evaluated", fix.applied)),
        }
    }
    if let Some(quality) = report.current_quality {
        line.push_str(&format!(" -> current {:.2}, {}", quality, report.trend));
    }
    line
}
