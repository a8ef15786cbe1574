//! Quality scoring
//!
//! A score in [0, 1] for each candidate. The built-in scorer derives it from
//! the compile result; an external command can replace it.

use crate::compile::{CompileReport, ScratchFile};
use crate::config::QualityConfig;
use crate::error::CollaboratorError;
use crate::util::{run_command_with_timeout, truncate};
use std::process::Command;
use std::time::Duration;

pub trait QualityScorer: Send + Sync {
    fn score(&self, source: &str, report: &CompileReport) -> Result<f64, CollaboratorError>;
}

/// Scores from the compile result alone: 1.0 for a clean compile, otherwise
/// a penalty per diagnostic.
#[derive(Debug, Clone)]
pub struct DiagnosticScorer {
    penalty: f64,
}

impl DiagnosticScorer {
    pub fn new(penalty: f64) -> Self {
        Self { penalty }
    }
}

impl QualityScorer for DiagnosticScorer {
    fn score(&self, _source: &str, report: &CompileReport) -> Result<f64, CollaboratorError> {
        if report.success && report.diagnostics.is_empty() {
            return Ok(1.0);
        }
        // A failed compile never scores above 0.9, even with one diagnostic.
        let count = report.diagnostics.len().max(1) as f64;
        Ok((0.9 - self.penalty * (count - 1.0)).clamp(0.0, 0.9))
    }
}

/// Runs an external scorer on the candidate and reads a number from the
/// last non-empty line of its stdout.
#[derive(Debug, Clone)]
pub struct CommandScorer {
    program: String,
    args: Vec<String>,
    source_extension: String,
    timeout: Duration,
}

impl CommandScorer {
    pub fn new(program: String, args: Vec<String>, source_extension: String, timeout: Duration) -> Self {
        Self {
            program,
            args,
            source_extension,
            timeout,
        }
    }
}

impl QualityScorer for CommandScorer {
    fn score(&self, source: &str, _report: &CompileReport) -> Result<f64, CollaboratorError> {
        let scratch = ScratchFile::create(&self.source_extension, source)?;
        let mut command = Command::new(&self.program);
        command
            .current_dir(scratch.dir())
            .args(scratch.expand_args(&self.args));

        let result = run_command_with_timeout(&mut command, self.timeout)
            .map_err(CollaboratorError::Unavailable)?;
        if result.timed_out {
            return Err(CollaboratorError::Timeout(self.timeout));
        }
        if !result.success() {
            return Err(CollaboratorError::Failed(format!(
                "scorer exited unsuccessfully: {}",
                truncate(result.stderr.trim(), 200)
            )));
        }
        parse_score(&result.stdout)
    }
}

/// Parse the last non-empty line as a number, clamped to [0, 1].
pub fn parse_score(stdout: &str) -> Result<f64, CollaboratorError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .ok_or(CollaboratorError::EmptyResponse)?;
    let value: f64 = line
        .parse()
        .map_err(|_| CollaboratorError::Failed(format!("scorer printed '{}'", truncate(line, 80))))?;
    if !value.is_finite() {
        return Err(CollaboratorError::Failed(format!("scorer printed '{line}'")));
    }
    Ok(value.clamp(0.0, 1.0))
}

pub fn scorer_from_config(
    config: &QualityConfig,
    source_extension: &str,
) -> Box<dyn QualityScorer> {
    match config.command.as_deref().map(str::trim) {
        Some(program) if !program.is_empty() => Box::new(CommandScorer::new(
            program.to_string(),
            config.args.clone(),
            source_extension.to_string(),
            Duration::from_secs(config.timeout_secs),
        )),
        _ => Box::new(DiagnosticScorer::new(config.diagnostic_penalty)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_compile_scores_one() {
        let scorer = DiagnosticScorer::new(0.1);
        let report = CompileReport::from_output(true, "");
        assert_eq!(scorer.score("", &report).unwrap(), 1.0);
    }

    #[test]
    fn test_diagnostics_lower_the_score() {
        let scorer = DiagnosticScorer::new(0.1);
        let one = CompileReport::from_output(false, "a.c:1:1: error: expected ';'");
        let three = CompileReport::from_output(
            false,
            "a.c:1:1: error: expected ';'\na.c:2:1: error: expected ')'\na.c:3:1: error: 'x' undeclared",
        );
        let s1 = scorer.score("", &one).unwrap();
        let s3 = scorer.score("", &three).unwrap();
        assert!((s1 - 0.9).abs() < 1e-9);
        assert!((s3 - 0.7).abs() < 1e-9);

        let many = CompileReport::from_output(false, &"a.c:1:1: error: x\n".repeat(40));
        assert_eq!(scorer.score("", &many).unwrap(), 0.0);
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("running...\n0.75\n\n").unwrap(), 0.75);
        assert_eq!(parse_score("1.7").unwrap(), 1.0);
        assert_eq!(parse_score("-2").unwrap(), 0.0);
        assert_eq!(parse_score("  \n"), Err(CollaboratorError::EmptyResponse));
        assert!(matches!(parse_score("great"), Err(CollaboratorError::Failed(_))));
        assert!(parse_score("NaN").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_scorer_reads_stdout() {
        let scorer = CommandScorer::new(
            "sh".into(),
            vec!["-c".into(), "wc -l < \"$1\" >/dev/null; echo 0.42".into(), "sh".into(), "{file}".into()],
            "src".into(),
            Duration::from_secs(10),
        );
        let report = CompileReport::from_output(true, "");
        assert_eq!(scorer.score("a\nb\n", &report).unwrap(), 0.42);
    }

    #[test]
    fn test_scorer_from_config_defaults_to_diagnostics() {
        let scorer = scorer_from_config(&QualityConfig::default(), "src");
        let report = CompileReport::from_output(true, "");
        assert_eq!(scorer.score("", &report).unwrap(), 1.0);
    }
}
