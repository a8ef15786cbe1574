//! Generation prompt builder
//!
//! Assembles the prompt for the next candidate: the task, the current best
//! source, what the session has learned so far, and focused instructions for
//! the problems the fixer could not handle mechanically.

use crate::categorize::{Prioritized, Tier};
use std::fmt::Write as _;

const MAX_SOURCE_CHARS: usize = 15_000;
const MAX_FOCUS_ITEMS: usize = 8;

/// A problem the generator should address, with the compiler's own words.
#[derive(Debug, Clone)]
pub struct FocusItem {
    pub item: Prioritized,
    pub sample: String,
    pub line: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    task: String,
    current_source: Option<String>,
    current_iteration: u32,
    current_quality: Option<f64>,
    learning_context: String,
    focus: Vec<FocusItem>,
}

impl PromptBuilder {
    pub fn new(task: &str) -> Self {
        Self {
            task: task.trim().to_string(),
            ..Default::default()
        }
    }

    /// Current best version, produced in `iteration`.
    pub fn with_current(mut self, source: &str, iteration: u32, quality: f64) -> Self {
        let source = if source.chars().count() > MAX_SOURCE_CHARS {
            let truncated: String = source.chars().take(MAX_SOURCE_CHARS).collect();
            format!(
                "{}\n\n... [truncated - source has {} total characters] ...",
                truncated,
                source.chars().count()
            )
        } else {
            source.to_string()
        };
        self.current_source = Some(source);
        self.current_iteration = iteration;
        self.current_quality = Some(quality);
        self
    }

    pub fn with_learning_context(mut self, context: String) -> Self {
        self.learning_context = context;
        self
    }

    pub fn with_focus(mut self, focus: Vec<FocusItem>) -> Self {
        self.focus = focus;
        self
    }

    pub fn build(&self) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "TASK:\n{}\n", self.task);

        match (&self.current_source, self.current_quality) {
            (Some(source), Some(quality)) => {
                let _ = writeln!(
                    prompt,
                    "CURRENT VERSION (iteration {}, quality {:.2}):\n```\n{}\n```\n",
                    self.current_iteration,
                    quality,
                    source.trim_end()
                );
                prompt.push_str(
                    "Improve this version. Keep everything that already works and change only what is needed.\n\n",
                );
            }
            _ => prompt.push_str("Write the first complete version.\n\n"),
        }

        if !self.focus.is_empty() {
            prompt.push_str("FIX THESE COMPILER ERRORS:\n");
            for (i, focus) in self.focus.iter().take(MAX_FOCUS_ITEMS).enumerate() {
                let location = focus
                    .line
                    .map(|l| format!(" (line {l})"))
                    .unwrap_or_default();
                let _ = writeln!(
                    prompt,
                    "{}. [{}] {}{}",
                    i + 1,
                    focus.item.category.tier,
                    focus.sample.trim(),
                    location
                );
                let _ = writeln!(prompt, "   Strategy: {}", focus_hint(focus));
            }
            prompt.push('\n');
        }

        if !self.learning_context.trim().is_empty() {
            let _ = writeln!(prompt, "LEARNED SO FAR:\n{}", self.learning_context.trim_end());
            prompt.push('\n');
        }

        prompt.push_str(
            "Return ONLY the complete source file in a single code block. No explanations.\n",
        );
        prompt
    }
}

fn focus_hint(focus: &FocusItem) -> String {
    let category = &focus.item.category;
    let mut hint = category.strategy.to_string();
    match (category.tier, category.kind) {
        (Tier::Complex, "missing_function") => {
            hint.push_str("; define the missing function or event handler with the correct signature");
        }
        (Tier::Complex, "undeclared_identifier") => {
            hint.push_str("; declare the identifier or use the correct existing name");
        }
        (Tier::Complex, "wrong_parameters") => {
            hint.push_str("; match the parameter count and types of the called function");
        }
        (Tier::Complex, "missing_include") => {
            hint.push_str("; include the required header or remove the dependency");
        }
        _ => {}
    }
    if focus.item.occurrences > 1 {
        let _ = write!(hint, " (seen in {} iterations)", focus.item.occurrences);
    }
    hint
}
