//! Line diffs between source versions
//!
//! Thin layer over `similar`: unified diff text for the evolution history,
//! change statistics, a similarity ratio for impact analysis, and the regions
//! of the old text that a change touched.

use crate::fixer::Region;
use similar::{ChangeTag, DiffOp, TextDiff};

/// Unified diff of previous vs current, cut to `max_lines` lines.
pub fn unified_diff(previous: &str, current: &str, max_lines: usize) -> String {
    let diff = TextDiff::from_lines(previous, current);
    let text = diff
        .unified_diff()
        .context_radius(3)
        .header("previous", "current")
        .to_string();

    let mut lines = text.lines();
    let mut out: Vec<&str> = lines.by_ref().take(max_lines).collect();
    let remaining = lines.count();
    if remaining > 0 {
        out.push("...");
    }
    out.join("\n")
}

/// Lines added and removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
}

impl DiffStats {
    pub fn total(&self) -> usize {
        self.added + self.removed
    }
}

pub fn stats(previous: &str, current: &str) -> DiffStats {
    let diff = TextDiff::from_lines(previous, current);
    diff.iter_all_changes()
        .fold(DiffStats::default(), |mut acc, change| {
            match change.tag() {
                ChangeTag::Insert => acc.added += 1,
                ChangeTag::Delete => acc.removed += 1,
                ChangeTag::Equal => {}
            }
            acc
        })
}

/// Similarity in [0, 1]; 1.0 for identical text.
pub fn similarity(previous: &str, current: &str) -> f64 {
    if previous == current {
        return 1.0;
    }
    TextDiff::from_lines(previous, current).ratio() as f64
}

/// Regions of `previous` (1-based, inclusive) touched by the change.
///
/// Pure insertions are reported against the line they follow, or line 1 when
/// inserted at the top.
pub fn changed_regions(previous: &str, current: &str) -> Vec<Region> {
    let diff = TextDiff::from_lines(previous, current);
    let mut regions: Vec<Region> = diff
        .ops()
        .iter()
        .filter_map(|op| match *op {
            DiffOp::Equal { .. } => None,
            DiffOp::Delete {
                old_index, old_len, ..
            }
            | DiffOp::Replace {
                old_index, old_len, ..
            } => Some(Region::new(old_index + 1, old_index + old_len.max(1))),
            DiffOp::Insert { old_index, .. } => Some(Region::line(old_index.max(1))),
        })
        .collect();
    regions.dedup();
    regions
}

/// New text of `line` (1-based in `previous`) when the change rewrote exactly
/// that one line into exactly one line.
pub fn replaced_line<'a>(previous: &str, current: &'a str, line: usize) -> Option<&'a str> {
    let diff = TextDiff::from_lines(previous, current);
    let new_index = diff.ops().iter().find_map(|op| match *op {
        DiffOp::Replace {
            old_index,
            old_len: 1,
            new_index,
            new_len: 1,
        } if old_index + 1 == line => Some(new_index),
        _ => None,
    })?;
    current.lines().nth(new_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_text() {
        assert_eq!(similarity("a\nb\n", "a\nb\n"), 1.0);
        assert!(changed_regions("a\nb\n", "a\nb\n").is_empty());
        assert_eq!(stats("a\n", "a\n").total(), 0);
        assert!(unified_diff("a\n", "a\n", 50).is_empty());
    }

    #[test]
    fn test_single_line_change() {
        let old = "int a = 1\nint b = 2;\nreturn a;\n";
        let new = "int a = 1;\nint b = 2;\nreturn a;\n";
        assert_eq!(changed_regions(old, new), vec![Region::line(1)]);
        assert_eq!(
            stats(old, new),
            DiffStats {
                added: 1,
                removed: 1
            }
        );
        let ratio = similarity(old, new);
        assert!(ratio > 0.5 && ratio < 1.0);
    }

    #[test]
    fn test_unified_diff_is_truncated() {
        let old: String = (0..200).map(|i| format!("line {i}\n")).collect();
        let new: String = (0..200).map(|i| format!("row {i}\n")).collect();
        let diff = unified_diff(&old, &new, 50);
        assert_eq!(diff.lines().count(), 51);
        assert!(diff.starts_with("--- previous"));
        assert!(diff.ends_with("..."));
    }

    #[test]
    fn test_insertions_map_to_preceding_line() {
        let old = "a\nb\nc\n";
        let new = "a\nb\nx\nc\n";
        assert_eq!(changed_regions(old, new), vec![Region::line(2)]);
    }

    #[test]
    fn test_replaced_line() {
        let old = "a\nint b = 2\nc\n";
        let new = "a\nint b = 2;\nc\n";
        assert_eq!(replaced_line(old, new, 2), Some("int b = 2;"));
        assert_eq!(replaced_line(old, new, 1), None);

        // two lines rewritten together are not a single-line replace
        let wide = "a\nint b = 2;\nc;\n";
        assert_eq!(replaced_line("a\nint b = 2\nc\n", wide, 2), None);
        // pure insertions have no replaced line
        assert_eq!(replaced_line(old, "a\nint b = 2\nnew\nc\n", 2), None);
    }
}
