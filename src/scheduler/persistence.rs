//! Scheduler-state persistence: recovery queue, a bounded decision tail, and
//! the active policy. `ModelRuntime` is never persisted here - C4 re-hydrates
//! it from the external config store plus a fresh GPU probe at startup.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ModelId;

use super::decision::ReducedDecision;
use super::policy::SchedulerPolicy;

const CURRENT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStateFile {
    pub recovery_queue: Vec<ModelId>,
    pub recent_decisions: Vec<ReducedDecision>,
    pub config: SchedulerPolicy,
    pub saved_at: DateTime<Utc>,
    pub version: String,
}

impl SchedulerStateFile {
    pub fn new(recovery_queue: Vec<ModelId>, recent_decisions: Vec<ReducedDecision>, config: SchedulerPolicy) -> Self {
        Self {
            recovery_queue,
            recent_decisions,
            config,
            saved_at: Utc::now(),
            version: CURRENT_VERSION.to_string(),
        }
    }

    /// Write to a temp file in the same directory, then rename - avoids
    /// leaving a truncated file behind on a crash mid-write.
    pub async fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Loads the file at `path`. Unknown fields are ignored by `serde`'s
    /// default behavior; a `version` mismatch renames the stale file aside
    /// and returns `Ok(None)` so the caller starts from fresh state.
    pub async fn load(path: &Path) -> Result<Option<Self>, PersistenceError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let parsed: Self = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        if parsed.version != CURRENT_VERSION {
            let stale_path = path.with_extension(format!("stale-{}", Utc::now().timestamp()));
            let _ = tokio::fs::rename(path, &stale_path).await;
            return Ok(None);
        }
        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::decision::ScheduleOutcome;

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler-state.json");
        let state = SchedulerStateFile::new(
            vec![ModelId::new("a")],
            vec![ReducedDecision {
                model_id: ModelId::new("a"),
                decided_at: Utc::now(),
                outcome: ScheduleOutcome::Success,
                preempted_model_ids: vec![],
                reason: "ok".into(),
            }],
            SchedulerPolicy::default(),
        );
        state.save(&path).await.unwrap();
        let loaded = SchedulerStateFile::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.recovery_queue, vec![ModelId::new("a")]);
    }

    #[tokio::test]
    async fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(SchedulerStateFile::load(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn version_mismatch_renames_stale_and_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler-state.json");
        let mut state = SchedulerStateFile::new(vec![], vec![], SchedulerPolicy::default());
        state.version = "0.1".to_string();
        let json = serde_json::to_vec_pretty(&state).unwrap();
        tokio::fs::write(&path, json).await.unwrap();

        assert!(SchedulerStateFile::load(&path).await.unwrap().is_none());
        assert!(!path.exists());
    }
}
