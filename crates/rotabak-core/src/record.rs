use crate::archive::ArchiveInfo;
use crate::error::{BackupError, Result};
use crate::types::{Outcome, RunMode, RunPhase, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Deleting an old archive failed.
    Prune,
    /// Listing the remote before pruning failed.
    List,
    /// Removing the staged archive after upload failed.
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    pub kind: WarningKind,
    pub message: String,
}

/// Summary of one invocation, persisted to the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub scope: Scope,
    pub mode: RunMode,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: RunPhase,
    pub outcome: Outcome,
    /// File name of the archive created (or planned) by this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveInfo>,
    /// Remote id of the uploaded archive; never set in dry-run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<String>,
    /// Archive names deleted from the remote, or planned for deletion in dry-run.
    #[serde(default)]
    pub pruned: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<RunWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(scope: Scope, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            mode: RunMode::new(scope, dry_run),
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            phase: RunPhase::Idle,
            outcome: Outcome::Failure,
            archive_name: None,
            archive: None,
            uploaded: None,
            pruned: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    /// Move the state machine forward one phase.
    pub fn advance(&mut self, to: RunPhase) -> Result<()> {
        if !self.phase.can_transition_to(to) {
            return Err(BackupError::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        tracing::debug!(run = %self.id, from = %self.phase, to = %to, "run phase");
        self.phase = to;
        Ok(())
    }

    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(run = %self.id, ?kind, "{message}");
        self.warnings.push(RunWarning { kind, message });
    }

    /// Terminal failure. Records the error; the phase becomes `Failed`.
    pub fn fail(&mut self, error: &BackupError) {
        if !self.phase.is_terminal() {
            self.phase = RunPhase::Failed;
        }
        self.outcome = Outcome::Failure;
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }

    /// Reach `Done`. Warnings downgrade the outcome to `Partial`.
    pub fn complete(&mut self) -> Result<()> {
        self.advance(RunPhase::Done)?;
        self.outcome = if self.warnings.is_empty() {
            Outcome::Success
        } else {
            Outcome::Partial
        };
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_walk_reaches_success() {
        let mut rec = RunRecord::new(Scope::Full, false);
        for phase in [
            RunPhase::Staging,
            RunPhase::Validated,
            RunPhase::Uploaded,
            RunPhase::Pruned,
        ] {
            rec.advance(phase).unwrap();
        }
        rec.complete().unwrap();
        assert_eq!(rec.outcome, Outcome::Success);
        assert_eq!(rec.phase, RunPhase::Done);
        assert!(rec.finished_at.is_some());
    }

    #[test]
    fn warnings_make_it_partial() {
        let mut rec = RunRecord::new(Scope::DbOnly, false);
        for phase in [
            RunPhase::Staging,
            RunPhase::Validated,
            RunPhase::Uploaded,
            RunPhase::Pruned,
        ] {
            rec.advance(phase).unwrap();
        }
        rec.warn(WarningKind::Prune, "delete failed");
        rec.complete().unwrap();
        assert_eq!(rec.outcome, Outcome::Partial);
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        let mut rec = RunRecord::new(Scope::Full, true);
        let err = rec.advance(RunPhase::Uploaded).unwrap_err();
        assert!(matches!(err, BackupError::InvalidTransition { .. }));
        assert_eq!(rec.phase, RunPhase::Idle);
    }

    #[test]
    fn fail_records_error() {
        let mut rec = RunRecord::new(Scope::Full, false);
        rec.advance(RunPhase::Staging).unwrap();
        rec.fail(&BackupError::NotFound("x".to_string()));
        assert_eq!(rec.phase, RunPhase::Failed);
        assert_eq!(rec.outcome, Outcome::Failure);
        assert!(rec.error.as_deref().unwrap().contains("not found"));
        assert!(rec.finished_at.is_some());
    }

    #[test]
    fn json_shape() {
        let rec = RunRecord::new(Scope::DbOnly, true);
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["scope"], "db-only");
        assert_eq!(v["mode"], "dry-run");
        assert_eq!(v["phase"], "idle");
        assert!(v.get("uploaded").is_none());
    }
}
