//! Compiler invocation
//!
//! Writes a candidate to a scratch directory, runs the configured compiler on
//! it with a timeout, and turns the output into diagnostics.

use crate::config::CompilerConfig;
use crate::diagnostics::{parse_output, RawDiagnostic};
use crate::error::{CollaboratorError, ConfigError};
use crate::util::run_command_with_timeout;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const OUTPUT_TAIL_MAX_CHARS: usize = 8_000;
const FILE_PLACEHOLDER: &str = "{file}";
const DIR_PLACEHOLDER: &str = "{dir}";

/// Outcome of compiling one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileReport {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub artifact_present: bool,
    pub diagnostics: Vec<RawDiagnostic>,
    /// Tail of the combined compiler output
    pub output: String,
    pub duration_ms: u64,
}

impl CompileReport {
    /// Report for tools that produce no separate artifact.
    pub fn from_output(success: bool, output: &str) -> Self {
        let mut diagnostics = parse_output(output);
        if !success && diagnostics.is_empty() {
            diagnostics.push(RawDiagnostic::new(
                "compilation failed without diagnostic output",
            ));
        }
        Self {
            success,
            exit_code: None,
            artifact_present: success,
            diagnostics,
            output: tail_chars(output, OUTPUT_TAIL_MAX_CHARS),
            duration_ms: 0,
        }
    }
}

pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<CompileReport, CollaboratorError>;
}

/// A source file in its own scratch directory, removed on drop.
pub struct ScratchFile {
    dir: PathBuf,
    path: PathBuf,
}

impl ScratchFile {
    pub fn create(extension: &str, content: &str) -> Result<Self, CollaboratorError> {
        let dir = std::env::temp_dir()
            .join("evoloop")
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dir)
            .map_err(|e| CollaboratorError::Unavailable(format!("scratch dir: {e}")))?;
        let extension = extension.trim_start_matches('.');
        let path = dir.join(format!("candidate.{extension}"));
        fs::write(&path, content)
            .map_err(|e| CollaboratorError::Unavailable(format!("scratch file: {e}")))?;
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Args with `{file}` and `{dir}` filled in.
    pub fn expand_args(&self, args: &[String]) -> Vec<String> {
        let file = self.path.display().to_string();
        let dir = self.dir.display().to_string();
        args.iter()
            .map(|arg| {
                arg.replace(FILE_PLACEHOLDER, &file)
                    .replace(DIR_PLACEHOLDER, &dir)
            })
            .collect()
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// Runs an external compiler command.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: String,
    args: Vec<String>,
    source_extension: String,
    artifact_extension: Option<String>,
    timeout: Duration,
}

impl CommandCompiler {
    pub fn from_config(config: &CompilerConfig) -> Result<Self, ConfigError> {
        let program = config
            .program
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::Missing("compiler.program"))?;
        Ok(Self {
            program: program.to_string(),
            args: config.args.clone(),
            source_extension: config.source_extension.clone(),
            artifact_extension: config.artifact_extension.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

impl Compiler for CommandCompiler {
    fn compile(&self, source: &str) -> Result<CompileReport, CollaboratorError> {
        let scratch = ScratchFile::create(&self.source_extension, source)?;
        let mut command = Command::new(&self.program);
        command
            .current_dir(scratch.dir())
            .args(scratch.expand_args(&self.args));

        let start = Instant::now();
        let result = run_command_with_timeout(&mut command, self.timeout)
            .map_err(CollaboratorError::Unavailable)?;
        if result.timed_out {
            return Err(CollaboratorError::Timeout(self.timeout));
        }

        let artifact_present = match &self.artifact_extension {
            Some(ext) => scratch
                .path()
                .with_extension(ext.trim_start_matches('.'))
                .exists(),
            None => true,
        };
        let exit_ok = result.success();
        let success = exit_ok && artifact_present;
        let output = result.combined_output();

        let mut diagnostics = parse_output(&output);
        if !success && diagnostics.is_empty() {
            let message = if exit_ok {
                "compiler reported success but produced no artifact"
            } else {
                "compilation failed without diagnostic output"
            };
            diagnostics.push(RawDiagnostic::new(message));
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            success,
            diagnostics = diagnostics.len(),
            duration_ms,
            "compiled candidate"
        );

        Ok(CompileReport {
            success,
            exit_code: result.status.and_then(|s| s.code()),
            artifact_present,
            diagnostics,
            output: tail_chars(&output, OUTPUT_TAIL_MAX_CHARS),
            duration_ms,
        })
    }
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect::<String>()
}
