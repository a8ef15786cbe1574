//! evoloop library crate
//!
//! Exposes the engine modules so the CLI, benchmarks and external tooling
//! share one implementation.

pub mod categorize;
pub mod compile;
pub mod config;
pub mod diagnostics;
pub mod diff;
pub mod error;
pub mod evolution;
pub mod fixer;
pub mod generate;
pub mod learner;
pub mod memory;
pub mod normalize;
pub mod prompt;
pub mod quality;
pub mod runner;
pub mod store;
pub mod util;
