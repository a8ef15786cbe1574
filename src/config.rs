//! Configuration management for evoloop
//!
//! Settings live in `~/.config/evoloop/config.toml` unless a path is given
//! explicitly. Every field has a default, so a partial file is fine.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hard cap on loop iterations (>= 1)
    pub max_iterations: u32,
    /// Stop as soon as the current version reaches this quality
    pub quality_target: f64,
    /// Maximum edits the fixer applies in one pass (>= 1)
    pub max_edits_per_iteration: usize,
    /// Occurrence count at which a fingerprint counts as recurring
    pub recurring_threshold: u32,
    /// Templates below this confidence are never auto-suggested
    pub min_template_confidence: f64,
    /// Allowed quality drop before a candidate is rolled back
    pub quality_tolerance: f64,
    /// Abort after this many consecutive `worsening` iterations
    pub worsening_streak: u32,
    /// Number of recent quality scores the trend looks at
    pub trend_window: usize,
    /// Entries per section in the learning context
    pub learning_context_top_k: usize,
    /// Extra attempts after a failed generator/compiler call
    pub collaborator_retries: u32,
    /// Abort after this many iterations in a row produced no candidate
    pub max_consecutive_failures: u32,
    /// Hold generated candidates to the same acceptance rule as fixer edits.
    /// When false, every generated candidate resets the baseline.
    pub gate_generated: bool,
    /// Directory holding `.evoloop/` state. Defaults to the working directory.
    pub state_dir: Option<PathBuf>,
    /// Template library shared across sessions. Defaults to the state dir.
    pub template_library: Option<PathBuf>,
    pub generation: GenerationConfig,
    pub compiler: CompilerConfig,
    pub quality: QualityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Ollama-style generate endpoint
    pub endpoint: String,
    pub model: String,
    /// Optional system prompt sent with every request
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler executable. Required for `run`.
    pub program: Option<String>,
    /// Arguments; `{file}` is replaced by the source path.
    pub args: Vec<String>,
    /// Extension for the temporary source file
    pub source_extension: String,
    /// Extension of the artifact a successful compile must leave behind
    pub artifact_extension: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// External scorer; receives the source path and prints a number in [0, 1].
    /// When unset, quality is derived from the compile result.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Score lost per reported diagnostic by the built-in scorer
    pub diagnostic_penalty: f64,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            quality_target: 0.8,
            max_edits_per_iteration: 5,
            recurring_threshold: 2,
            min_template_confidence: 0.6,
            quality_tolerance: 0.05,
            worsening_streak: 2,
            trend_window: 3,
            learning_context_top_k: 5,
            collaborator_retries: 1,
            max_consecutive_failures: 2,
            gate_generated: true,
            state_dir: None,
            template_library: None,
            generation: GenerationConfig::default(),
            compiler: CompilerConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/api/generate".to_string(),
            model: "qwen2.5-coder".to_string(),
            system_prompt: None,
            temperature: 0.1,
            timeout_secs: 300,
        }
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["{file}".to_string()],
            source_extension: "src".to_string(),
            artifact_extension: None,
            timeout_secs: 60,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: vec!["{file}".to_string()],
            diagnostic_penalty: 0.1,
            timeout_secs: 60,
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("evoloop"))
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load config from the default location, or return defaults.
    ///
    /// A file that fails to parse is moved aside to `config.toml.corrupt` so
    /// the next save does not silently overwrite it.
    pub fn load() -> Self {
        if let Some(path) = Self::default_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "config file was corrupted; backup saved and defaults loaded"
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Load config from an explicit path. Unlike [`Config::load`] a missing or
    /// malformed file is an error, since the user asked for it by name.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("max_iterations", self.max_iterations as u64, 1)?;
        at_least(
            "max_edits_per_iteration",
            self.max_edits_per_iteration as u64,
            1,
        )?;
        at_least("recurring_threshold", self.recurring_threshold as u64, 1)?;
        at_least("worsening_streak", self.worsening_streak as u64, 1)?;
        at_least("trend_window", self.trend_window as u64, 2)?;
        at_least(
            "learning_context_top_k",
            self.learning_context_top_k as u64,
            1,
        )?;
        at_least(
            "max_consecutive_failures",
            self.max_consecutive_failures as u64,
            1,
        )?;
        unit_range("quality_target", self.quality_target)?;
        unit_range("min_template_confidence", self.min_template_confidence)?;
        unit_range("quality.diagnostic_penalty", self.quality.diagnostic_penalty)?;
        if !self.quality_tolerance.is_finite() || self.quality_tolerance < 0.0 {
            return Err(ConfigError::Negative {
                field: "quality_tolerance",
                value: self.quality_tolerance,
            });
        }
        at_least("generation.timeout_secs", self.generation.timeout_secs, 1)?;
        at_least("compiler.timeout_secs", self.compiler.timeout_secs, 1)?;
        Ok(())
    }

    /// Validation for commands that actually invoke the compiler.
    pub fn validate_for_run(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self
            .compiler
            .program
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
        {
            return Err(ConfigError::Missing("compiler.program"));
        }
        Ok(())
    }

    /// Root for `.evoloop/` state.
    pub fn state_root(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::default_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/evoloop/config.toml".to_string())
    }
}

fn at_least(field: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::BelowMinimum { field, min, value });
    }
    Ok(())
}

fn unit_range(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfUnitRange { field, value });
    }
    Ok(())
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
