//! Persistent state for evoloop
//!
//! Everything lives under `.evoloop/` in the state root:
//! - `templates.json`: the fix template library (unless configured elsewhere)
//! - `sessions/<id>.jsonl`: one evolution record per version, appended
//! - `sessions/<id>.summary.json`: end-of-session summary
//!
//! Writes take an exclusive `fs2` lock and go through a temp file + rename,
//! so a reader never sees a half-written library. Callers treat failures as
//! recoverable: the session keeps running with persistence switched off.

use crate::evolution::{Origin, VersionStatus};
use crate::learner::TemplateLibrary;
use crate::normalize::Fingerprint;
use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const STATE_DIR: &str = ".evoloop";
const TEMPLATES_FILE: &str = "templates.json";
const SESSIONS_DIR: &str = "sessions";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

/// One row of a session's evolution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub sequence: u64,
    pub iteration: u32,
    pub origin: Origin,
    pub status: VersionStatus,
    pub compiled: bool,
    pub quality: f64,
    pub diagnostic_count: usize,
    #[serde(default)]
    pub fingerprints: Vec<Fingerprint>,
    pub diff_size: usize,
    pub content_hash: String,
    #[serde(default)]
    pub applied_edits: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummaryRecord {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stop_reason: String,
    pub iterations: u32,
    pub versions: usize,
    pub rolled_back: usize,
    pub final_quality: Option<f64>,
    pub best_quality: Option<f64>,
    pub best_sequence: Option<u64>,
    pub target_met: bool,
    pub trend: String,
    pub learning_degraded: bool,
    pub journal_degraded: bool,
}

#[derive(Debug, Clone)]
pub struct Store {
    state_dir: PathBuf,
    templates_path: PathBuf,
}

struct StoreLock {
    file: fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Store {
    pub fn new(root: &Path) -> Self {
        let state_dir = root.join(STATE_DIR);
        let templates_path = state_dir.join(TEMPLATES_FILE);
        Self {
            state_dir,
            templates_path,
        }
    }

    /// Use a template library outside the state directory (shared across
    /// projects).
    pub fn with_template_library(mut self, path: PathBuf) -> Self {
        self.templates_path = path;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn templates_path(&self) -> &Path {
        &self.templates_path
    }

    fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join(SESSIONS_DIR)
    }

    fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.jsonl"))
    }

    fn session_summary_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.summary.json"))
    }

    fn ensure_dir(&self, dir: &Path) -> anyhow::Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Lock next to `target`. Shared locks on a missing directory fail fast.
    fn lock(&self, target: &Path, exclusive: bool) -> anyhow::Result<StoreLock> {
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        if exclusive {
            self.ensure_dir(dir)?;
        } else if !dir.exists() {
            return Err(anyhow::anyhow!("{} does not exist", dir.display()));
        }

        let lock_path = target.with_extension("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("failed to open lock {}", lock_path.display()))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "timed out waiting for lock on {} ({}s)",
                            target.display(),
                            LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }

    /// Load the template library. A missing library is empty; an unreadable
    /// one is an error and is left untouched on disk.
    pub fn load_templates(&self) -> anyhow::Result<TemplateLibrary> {
        if !self.templates_path.exists() {
            return Ok(TemplateLibrary::default());
        }
        let _lock = self.lock(&self.templates_path, false)?;
        read_library(&self.templates_path)
    }

    /// Read-modify-write the library under an exclusive lock. The closure
    /// runs against the latest on-disk state; the updated library is
    /// returned.
    pub fn update_templates<F>(&self, apply: F) -> anyhow::Result<TemplateLibrary>
    where
        F: FnOnce(&mut TemplateLibrary),
    {
        let _lock = self.lock(&self.templates_path, true)?;
        let mut library = if self.templates_path.exists() {
            read_library(&self.templates_path)?
        } else {
            TemplateLibrary::default()
        };
        apply(&mut library);
        let content = serde_json::to_string_pretty(&library)?;
        write_atomic(&self.templates_path, &content)?;
        Ok(library)
    }

    /// Append one evolution record (JSONL).
    pub fn append_evolution(&self, record: &EvolutionRecord) -> anyhow::Result<()> {
        let path = self.session_log_path(&record.session_id);
        let _lock = self.lock(&path, true)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let row = serde_json::to_string(record)?;
        writeln!(file, "{}", row)?;
        Ok(())
    }

    /// Load up to `limit` latest evolution records of a session (oldest
    /// first). Malformed rows are skipped.
    pub fn load_evolution(
        &self,
        session_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<EvolutionRecord>> {
        let path = self.session_log_path(session_id);
        if !path.exists() || limit == 0 {
            return Ok(Vec::new());
        }
        let _lock = self.lock(&path, false)?;
        let content = fs::read_to_string(&path)?;
        let mut records: Vec<EvolutionRecord> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<EvolutionRecord>(line).ok())
            .collect();
        if records.len() > limit {
            let split = records.len() - limit;
            records.drain(0..split);
        }
        Ok(records)
    }

    pub fn save_session_summary(&self, summary: &SessionSummaryRecord) -> anyhow::Result<()> {
        let path = self.session_summary_path(&summary.session_id);
        let _lock = self.lock(&path, true)?;
        let content = serde_json::to_string_pretty(summary)?;
        write_atomic(&path, &content)
    }

    pub fn load_session_summary(&self, session_id: &str) -> anyhow::Result<Option<SessionSummaryRecord>> {
        let path = self.session_summary_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let _lock = self.lock(&path, false)?;
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Session ids with a log on disk, sorted.
    pub fn list_sessions(&self) -> anyhow::Result<Vec<String>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(".jsonl").map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn read_library(path: &Path) -> anyhow::Result<TemplateLibrary> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(TemplateLibrary::default());
    }
    serde_json::from_str(&content)
        .with_context(|| format!("template library {} is malformed", path.display()))
}

fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixer::FixAction;
    use crate::learner::Outcome;
    use crate::normalize::normalize;
    use crate::categorize::Tier;

    fn record(session: &str, sequence: u64) -> EvolutionRecord {
        EvolutionRecord {
            timestamp: Utc::now(),
            session_id: session.to_string(),
            sequence,
            iteration: sequence as u32,
            origin: Origin::Generated,
            status: VersionStatus::Accepted,
            compiled: false,
            quality: 0.5,
            diagnostic_count: 1,
            fingerprints: vec![normalize("expected ';'")],
            diff_size: 3,
            content_hash: "abc".into(),
            applied_edits: Vec::new(),
        }
    }

    #[test]
    fn test_missing_library_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(store.load_templates().unwrap().is_empty());
    }

    #[test]
    fn test_update_templates_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let outcome = Outcome {
            fingerprint: normalize("expected ';'"),
            tier: Tier::Simple,
            template_id: None,
            action: FixAction::Append {
                suffix: ";".into(),
            },
            succeeded: true,
            iteration: 1,
            at: Utc::now(),
        };
        let updated = store
            .update_templates(|library| {
                library.apply_outcome(&outcome);
            })
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(store.load_templates().unwrap(), updated);
        assert!(dir.path().join(".evoloop").join("templates.json").exists());
    }

    #[test]
    fn test_corrupt_library_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        fs::create_dir_all(store.state_dir()).unwrap();
        fs::write(store.templates_path(), "[[[").unwrap();
        assert!(store.load_templates().is_err());
        assert!(store.update_templates(|_| {}).is_err());
        assert_eq!(fs::read_to_string(store.templates_path()).unwrap(), "[[[");
    }

    #[test]
    fn test_evolution_log_append_and_load_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        for seq in 1..=4 {
            store.append_evolution(&record("s1", seq)).unwrap();
        }
        let recent = store.load_evolution("s1", 2).unwrap();
        let sequences: Vec<u64> = recent.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
        assert!(store.load_evolution("missing", 10).unwrap().is_empty());
        assert_eq!(store.list_sessions().unwrap(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.append_evolution(&record("s2", 1)).unwrap();
        let path = store.session_log_path("s2");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"truncated\":").unwrap();
        assert_eq!(store.load_evolution("s2", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_session_summary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let summary = SessionSummaryRecord {
            session_id: "s3".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stop_reason: "max iterations".into(),
            iterations: 5,
            versions: 7,
            rolled_back: 2,
            final_quality: Some(0.55),
            best_quality: Some(0.55),
            best_sequence: Some(3),
            target_met: false,
            trend: "improving".into(),
            learning_degraded: false,
            journal_degraded: false,
        };
        store.save_session_summary(&summary).unwrap();
        assert_eq!(store.load_session_summary("s3").unwrap(), Some(summary));
        assert_eq!(store.load_session_summary("nope").unwrap(), None);
    }
}
